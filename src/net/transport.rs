//! Duplex byte stream owned by a single connection task.
//!
//! # Responsibilities
//! - Wrap any `AsyncRead + AsyncWrite` stream behind one object-safe type
//! - Own the connection's receive buffer (bytes read but not yet consumed)
//! - Apply per-read timeouts
//!
//! # Design Decisions
//! - The receive buffer travels with the transport, so bytes pipelined after an
//!   HTTP request or an upgrade are never lost when the owner changes
//! - TLS is the stream's concern; `secure` only records which scheme to report

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Minimum free space reserved in the receive buffer before each read.
const READ_CHUNK: usize = 8 * 1024;

/// Any stream a connection can run on.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Errors raised by transport operations. All of them are fatal for the connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed its side of the connection.
    #[error("connection closed by peer")]
    Closed,

    /// No bytes arrived within the read timeout.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The underlying socket failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the peer (rather than this side) ended the connection.
    pub fn is_peer_closure(&self) -> bool {
        match self {
            TransportError::Closed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            TransportError::Timeout(_) => false,
        }
    }
}

/// Addressing details of an accepted connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionInfo {
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// Whether the stream is already encrypted (reported as `https`).
    pub secure: bool,
}

/// A connection's stream plus its unconsumed receive buffer.
pub struct Transport {
    stream: Box<dyn Stream>,
    buffer: BytesMut,
    info: ConnectionInfo,
    bytes_received: u64,
    bytes_sent: u64,
}

impl Transport {
    /// Wrap a stream.
    pub fn new<S: Stream + 'static>(stream: S, info: ConnectionInfo) -> Self {
        Self {
            stream: Box::new(stream),
            buffer: BytesMut::with_capacity(READ_CHUNK),
            info,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    /// Addressing details for this connection.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Bytes received but not yet consumed.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Whether any unconsumed bytes are buffered.
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Remove and return the first `n` buffered bytes.
    pub fn consume(&mut self, n: usize) -> Bytes {
        self.buffer.split_to(n).freeze()
    }

    /// Total bytes read from and written to the stream.
    pub fn counters(&self) -> (u64, u64) {
        (self.bytes_received, self.bytes_sent)
    }

    /// Read more bytes into the buffer, waiting at most `timeout`.
    ///
    /// Returns the number of new bytes. End of stream is reported as
    /// [`TransportError::Closed`].
    pub async fn recv(&mut self, timeout: Option<Duration>) -> Result<usize, TransportError> {
        self.buffer.reserve(READ_CHUNK);
        let read = self.stream.read_buf(&mut self.buffer);
        let n = match timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| TransportError::Timeout(limit))??,
            None => read.await?,
        };
        if n == 0 {
            return Err(TransportError::Closed);
        }
        self.bytes_received += n as u64;
        Ok(n)
    }

    /// Write all bytes to the stream.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).await?;
        self.bytes_sent += data.len() as u64;
        Ok(())
    }

    /// Flush buffered writes.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write side. Errors are ignored: the connection is ending anyway.
    pub async fn close(&mut self) {
        let _ = self.stream.flush().await;
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("info", &self.info)
            .field("buffered", &self.buffer.len())
            .field("bytes_received", &self.bytes_received)
            .field("bytes_sent", &self.bytes_sent)
            .finish()
    }
}
