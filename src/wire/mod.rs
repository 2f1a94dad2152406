use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

pub mod channel;
pub mod codec;
pub mod frames;

pub use channel::{Connection, Incoming, WireError, WriteHandle};

/// Wraps the read side of a stream in the NUL-delimited JSON decoder.
pub fn framed_read<T: AsyncRead>(stream: T) -> FramedRead<T, codec::FrameDecoder> {
    FramedRead::new(stream, Default::default())
}

/// Wraps the write side of a stream in the NUL-delimited JSON encoder.
pub fn framed_write<T: AsyncWrite>(stream: T) -> FramedWrite<T, codec::FrameEncoder> {
    FramedWrite::new(stream, Default::default())
}
