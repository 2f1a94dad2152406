use std::time::Duration;

use futures::SinkExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::debug;

use super::codec::{self, FrameDecoder};
use super::frames;

/// Grace period a server-side close waits for the peer's bye ack.
const BYE_GRACE: Duration = Duration::from_secs(3);

/// Backpressure bound on the writer task's queue.
const WRITER_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The remote end closed (EOF, mid-frame close, or bye where a frame
    /// was required).
    #[error("peer gone")]
    PeerGone,
    /// The peer reported an error frame.
    #[error("remote error: {0}")]
    Remote(String),
    #[error("codec error: {0}")]
    Codec(#[from] codec::Error),
    #[error("invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),
    /// The serialized writer task has shut down.
    #[error("writer closed")]
    WriterClosed,
}

/// One decoded incoming item: a frame, or the peer's bye.
#[derive(Debug)]
pub enum Incoming {
    Frame(Value),
    Bye,
}

enum Outbound {
    Frame(Value),
    /// Send a bye frame, then flush. The connection stays open so the ack
    /// can still be read.
    Bye,
}

/// Cloneable handle to a connection's serialized writer. All writes to the
/// socket go through the single writer task this feeds, so concurrent
/// senders never interleave frames.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<Outbound>,
}

impl WriteHandle {
    pub async fn send(&self, frame: &impl Serialize) -> Result<(), WireError> {
        let value = serde_json::to_value(frame)?;
        self.tx
            .send(Outbound::Frame(value))
            .await
            .map_err(|_| WireError::WriterClosed)
    }

    pub async fn send_error(&self, message: &str) -> Result<(), WireError> {
        self.tx
            .send(Outbound::Frame(frames::error(message)))
            .await
            .map_err(|_| WireError::WriterClosed)
    }

    /// Non-blocking send for fan-out paths: a full queue means the
    /// consumer is too slow to keep listening and should be dropped.
    pub fn push(&self, frame: Value) -> bool {
        self.tx.try_send(Outbound::Frame(frame)).is_ok()
    }

    /// Initiates the orderly shutdown from the write side. Used where the
    /// read half lives in another task that will observe the peer's ack.
    pub async fn send_bye(&self) -> Result<(), WireError> {
        self.tx
            .send(Outbound::Bye)
            .await
            .map_err(|_| WireError::WriterClosed)
    }

    /// A handle with no connection behind it; sends fail. Selection and
    /// bookkeeping tests use this where nothing is written.
    #[cfg(test)]
    pub(crate) fn disconnected() -> WriteHandle {
        let (tx, _rx) = mpsc::channel(1);
        WriteHandle { tx }
    }

    /// A handle that forwards written frames to a receiver instead of a
    /// socket, for asserting on broadcast traffic in tests.
    #[cfg(test)]
    pub(crate) fn capturing() -> (WriteHandle, mpsc::Receiver<Value>) {
        let (tx, mut rx) = mpsc::channel::<Outbound>(WRITER_QUEUE);
        let (frame_tx, frame_rx) = mpsc::channel(WRITER_QUEUE);
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                if let Outbound::Frame(frame) = outbound {
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        });
        (WriteHandle { tx }, frame_rx)
    }
}

/// A NUL-delimited JSON connection over any byte stream.
///
/// The read half lives here and is driven by whoever owns the connection;
/// the write half lives in a spawned writer task fed through
/// [`WriteHandle`]s. Incoming `{bye:true}` frames are acked automatically
/// and surface as [`Incoming::Bye`]; incoming `{error:…}` frames surface as
/// [`WireError::Remote`].
pub struct Connection {
    reader: FramedRead<Box<dyn AsyncRead + Send + Sync + Unpin>, FrameDecoder>,
    writer: WriteHandle,
    server_side: bool,
    bye_seen: bool,
    bye_sent: bool,
    peer: String,
}

impl Connection {
    pub fn from_tcp(stream: TcpStream, server_side: bool) -> Connection {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let (read, write) = stream.into_split();
        Connection::from_parts(Box::new(read), Box::new(write), server_side, peer)
    }

    #[cfg(unix)]
    pub fn from_unix(stream: tokio::net::UnixStream, server_side: bool) -> Connection {
        let (read, write) = stream.into_split();
        Connection::from_parts(Box::new(read), Box::new(write), server_side, "local".into())
    }

    /// Builds a connection from raw halves; used for child-process stdio
    /// transports as well as sockets.
    pub fn from_parts(
        read: Box<dyn AsyncRead + Send + Sync + Unpin>,
        write: Box<dyn AsyncWrite + Send + Sync + Unpin>,
        server_side: bool,
        peer: String,
    ) -> Connection {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE);
        tokio::spawn(writer_task(write, rx));
        Connection {
            reader: super::framed_read(read),
            writer: WriteHandle { tx },
            server_side,
            bye_seen: false,
            bye_sent: false,
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Handle for pushing frames from other tasks.
    pub fn write_handle(&self) -> WriteHandle {
        self.writer.clone()
    }

    pub async fn send(&self, frame: &impl Serialize) -> Result<(), WireError> {
        self.writer.send(frame).await
    }

    pub async fn send_error(&self, message: &str) -> Result<(), WireError> {
        self.writer.send_error(message).await
    }

    /// Reads the next frame, letting a peer bye through as
    /// [`Incoming::Bye`] (acked automatically, once).
    pub async fn recv_idle(&mut self) -> Result<Incoming, WireError> {
        if self.bye_seen {
            return Ok(Incoming::Bye);
        }
        let frame = match self.reader.next().await {
            None => return Err(WireError::PeerGone),
            // A socket closing mid-frame is the peer being gone, not a
            // protocol violation on our side.
            Some(Err(codec::Error::IO(_))) => return Err(WireError::PeerGone),
            Some(frame) => frame?,
        };
        if frame.get("bye").is_some() {
            self.bye_seen = true;
            if !self.bye_sent {
                self.bye_sent = true;
                self.writer.send_bye().await?;
            }
            return Ok(Incoming::Bye);
        }
        if let Some(message) = frame.get("error") {
            let message = message.as_str().unwrap_or_default().to_owned();
            return Err(WireError::Remote(message));
        }
        Ok(Incoming::Frame(frame))
    }

    /// Reads the next frame where a bye counts as the peer being gone.
    pub async fn recv(&mut self) -> Result<Value, WireError> {
        match self.recv_idle().await? {
            Incoming::Frame(frame) => Ok(frame),
            Incoming::Bye => Err(WireError::PeerGone),
        }
    }

    /// Reads and deserializes the next frame.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        let frame = self.recv().await?;
        Ok(serde_json::from_value(frame)?)
    }

    /// Orderly shutdown: send `{bye:true}` and wait (server side: up to the
    /// grace period) for the peer's ack before dropping the socket.
    pub async fn close(mut self) {
        if !self.bye_sent {
            self.bye_sent = true;
            if self.writer.send_bye().await.is_err() {
                return;
            }
        }
        if self.bye_seen {
            return;
        }
        let wait = async {
            loop {
                match self.reader.next().await {
                    None => break,
                    Some(Ok(frame)) if frame.get("bye").is_some() => break,
                    Some(Ok(_)) => continue, // drain stragglers
                    Some(Err(_)) => break,
                }
            }
        };
        if self.server_side {
            let _ = timeout(BYE_GRACE, wait).await;
        } else {
            wait.await;
        }
        debug!(peer = %self.peer, "closing connection");
    }
}

async fn writer_task(
    write: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    let mut framed = super::framed_write(write);
    while let Some(outbound) = rx.recv().await {
        let frame = match outbound {
            Outbound::Frame(frame) => frame,
            Outbound::Bye => frames::bye(),
        };
        if let Err(error) = framed.send(frame).await {
            debug!(%error, "write failed, dropping connection writer");
            break;
        }
    }
    // Receiver drained or failed: flush what we can and let the half close.
    let _ = framed.flush().await;
}
