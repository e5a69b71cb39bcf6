//! # Message-based transport for connecting peers
//!
//! A minimal async interface for moving whole messages between peers. The
//! transport owns framing; the dispatch layer above it sees one complete
//! envelope per `recv` and hands one complete envelope per `send`.
//!
//! [`StreamTransport`] adapts any `AsyncRead`/`AsyncWrite` pair with
//! newline-delimited framing, which matches the one-JSON-value-per-line
//! output of the peer side of this protocol. Because the two halves are
//! independent, it also covers the request/response adapter case: an HTTP
//! request body as the read half and the response writer as the write
//! half (no deadlines there; closing the body ends the session).

use std::fmt;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::Mutex;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The operation timed out before completing.
    Timeout,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Io(msg) => write!(f, "i/o error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A mechanism for asynchronous message passing between peers.
///
/// Object-safe (`Arc<dyn Transport>`). Exactly one dispatch loop reads
/// from a given transport; writes may come from the loop and from
/// outbound proxy calls, so `send` must tolerate concurrent callers.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Transmits one complete message, applying whatever framing the
    /// underlying channel needs.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Awaits the next complete message from the peer.
    ///
    /// Returns `Ok(None)` once the stream is closed; messages arrive in
    /// order and are never partial.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}

/// A transport over any split byte stream, framing one message per line.
pub struct StreamTransport<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<W>,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await.map_err(map_io)?;
        writer.write_all(b"\n").await.map_err(map_io)?;
        writer.flush().await.map_err(map_io)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line).await.map_err(map_io)?;
            if n == 0 {
                return Ok(None);
            }

            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }

            return Ok(Some(line));
        }
    }
}

fn map_io(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost(err.to_string()),
        _ => Error::Io(err.to_string()),
    }
}

/// Placeholder a [`crate::handler::Handler`] starts with before its first
/// `set_transport`.
pub(crate) struct Unbound;

#[async_trait::async_trait]
impl Transport for Unbound {
    async fn send(&self, _payload: &[u8]) -> Result<()> {
        Err(Error::ConnectionLost("transport not bound".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        Err(Error::ConnectionLost("transport not bound".into()))
    }
}
