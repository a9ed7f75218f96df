//! Length-delimited, bincode-framed message streams over a `TcpStream`.
//!
//! This is the wire transport the `DataDirIo` capability runs on when talking
//! to a remote host. It intentionally carries no TLS/QUIC/SSH-deployment
//! machinery — see `DESIGN.md` for why that part of the teacher's remote
//! stack was dropped.

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("message encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug)]
pub struct SendStream {
    framed: tokio_util::codec::FramedWrite<OwnedWriteHalf, tokio_util::codec::LengthDelimitedCodec>,
}

impl SendStream {
    pub fn new(write_half: OwnedWriteHalf) -> Self {
        Self {
            framed: tokio_util::codec::FramedWrite::new(
                write_half,
                tokio_util::codec::LengthDelimitedCodec::new(),
            ),
        }
    }

    pub async fn send<T: serde::Serialize>(&mut self, msg: &T) -> StreamResult<()> {
        let bytes = bincode::serialize(msg)?;
        self.framed.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct RecvStream {
    framed: tokio_util::codec::FramedRead<OwnedReadHalf, tokio_util::codec::LengthDelimitedCodec>,
}

impl RecvStream {
    pub fn new(read_half: OwnedReadHalf) -> Self {
        Self {
            framed: tokio_util::codec::FramedRead::new(
                read_half,
                tokio_util::codec::LengthDelimitedCodec::new(),
            ),
        }
    }

    pub async fn recv<T: serde::de::DeserializeOwned>(&mut self) -> StreamResult<T> {
        match self.framed.next().await {
            Some(frame) => Ok(bincode::deserialize(&frame?)?),
            None => Err(StreamError::Closed),
        }
    }
}

/// A bidirectional message connection, split into independent send/recv halves.
#[derive(Debug)]
pub struct Connection {
    pub send: SendStream,
    pub recv: RecvStream,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            send: SendStream::new(write_half),
            recv: RecvStream::new(read_half),
        }
    }
}
