use std::{error, fmt, io};

use bytes::{Buf, BufMut};
use itertools::Itertools;
use serde_json::Value;
use tokio_util::codec;

/// Frames are single JSON objects delimited by a NUL byte.
pub const FRAME_DELIMITER: u8 = 0;

/// Refuse to buffer more than this much of a single frame. A peer that
/// streams this much without a delimiter is not speaking the protocol.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A decoder for a stream of NUL-delimited JSON frames.
///
/// Any number of frames may arrive in one read and a frame may arrive one
/// byte at a time; the decoder buffers the remainder between calls either
/// way. A malformed JSON frame is an unrecoverable error: the peers are out
/// of sync at the protocol level and the connection should be closed.
#[derive(Debug, Default)]
pub struct FrameDecoder {}

impl codec::Decoder for FrameDecoder {
    type Item = Value;

    type Error = Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match src
            .iter()
            .find_position(|&&b| b == FRAME_DELIMITER)
        {
            Some((idx, _)) => {
                // Panic safety: split_to panics unless src.len() >= idx, and
                // advance unless src.len() >= 1 afterwards; both are
                // guaranteed by find_position succeeding at idx.
                let frame = src.split_to(idx);
                src.advance(1); // discards the NUL left in the buffer

                Ok(Some(serde_json::from_slice(&frame)?))
            },
            None => {
                if src.len() > MAX_FRAME_SIZE {
                    Err(Error::FrameTooLarge)
                } else {
                    // The delimiter may arrive with the next read.
                    Ok(None)
                }
            },
        }
    }
}

/// An encoder producing NUL-delimited JSON frames.
#[derive(Debug, Default)]
pub struct FrameEncoder {}

impl codec::Encoder<Value> for FrameEncoder {
    type Error = Error;

    fn encode(
        &mut self,
        item: Value,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        dst.reserve(body.len() + 1);
        dst.extend(body);
        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    Json(serde_json::Error),
    IO(io::Error),
    FrameTooLarge,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use serde_json::json;
    use tokio_stream::StreamExt;
    use tokio_util::codec::{Decoder, FramedRead, FramedWrite};

    fn stream_from(frames: &[Value]) -> Vec<u8> {
        let mut stream = Vec::new();
        for frame in frames {
            stream.extend(serde_json::to_vec(frame).unwrap());
            stream.push(FRAME_DELIMITER);
        }
        stream
    }

    // Frames written back-to-back in one buffer come out one at a time, in
    // order, with nothing dropped.
    #[tokio::test]
    async fn test_batched_frames() {
        let expect = [
            json!({"role": "user", "action": "query", "jobId": "*"}),
            json!({"action": "submit", "jobId": "j-1", "pid": 4242}),
            json!({"bye": true}),
        ];
        let stream = stream_from(&expect);

        let decoder: FrameDecoder = Default::default();
        let mut framed = FramedRead::new(stream.as_ref(), decoder);

        for frame in &expect {
            let got = framed.next().await;
            assert_eq!(&got.unwrap().unwrap(), frame);
        }

        // End of stream should be OK
        assert!(framed.next().await.is_none());
    }

    // A frame fed one byte at a time must still decode exactly once.
    #[test]
    fn test_byte_at_a_time() {
        let frames = [
            json!({"status": "running", "message": "separating"}),
            json!({"tasks": {"t-1": {"output": "x\n"}}}),
            json!({"error": "Job not found"}),
        ];
        let stream = stream_from(&frames);

        let mut decoder: FrameDecoder = Default::default();
        let mut buf = bytes::BytesMut::new();
        let mut got = Vec::new();
        for byte in stream {
            buf.put_u8(byte);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                got.push(frame);
            }
        }
        assert_eq!(got.as_slice(), frames.as_slice());
        assert!(buf.is_empty());
    }

    // recv(send(f)) == f for arbitrary frames.
    #[test]
    fn test_round_trip() {
        tokio_test::block_on(async {
            let frame = json!({
                "jid": "00000000-0000-4000-8000-000000000000",
                "media": {"source": "https://youtu.be/x", "metadata": {"duration": 93}},
                "tasks": {},
                "isProcessExited": false,
            });

            let mut sink =
                FramedWrite::new(std::io::Cursor::new(Vec::new()), FrameEncoder::default());
            sink.send(frame.clone()).await.unwrap();
            let bytes = sink.into_inner().into_inner();
            assert_eq!(*bytes.last().unwrap(), FRAME_DELIMITER);

            let mut framed = FramedRead::new(bytes.as_slice(), FrameDecoder::default());
            assert_eq!(framed.next().await.unwrap().unwrap(), frame);
            assert!(framed.next().await.is_none());
        });
    }

    // A malformed frame is an unrecoverable protocol error.
    #[tokio::test]
    async fn test_malformed_json() {
        let stream = b"{\"ok\": tru\0".to_vec();
        let mut framed = FramedRead::new(stream.as_slice(), FrameDecoder::default());
        assert!(matches!(
            framed.next().await.unwrap(),
            Err(Error::Json(_))
        ));
    }

    // A socket closing mid-frame must surface as an error, not silence.
    #[tokio::test]
    async fn test_eos_mid_frame() {
        let stream = b"{\"bye\": true}\0{\"truncated".to_vec();
        let mut framed = FramedRead::new(stream.as_slice(), FrameDecoder::default());
        assert!(framed.next().await.unwrap().is_ok());
        assert!(matches!(framed.next().await.unwrap(), Err(Error::IO(_))));
    }
}
