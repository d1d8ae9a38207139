//! Request body reader.
//!
//! # Responsibilities
//! - Deliver the request body through a pull API (`read` / `read_all`)
//! - Decode content-length and chunked framing from the connection buffer
//! - Send the interim `100 Continue` before the first read when the client asked for it
//!
//! # Data Flow
//! ```text
//! NotStarted ──first read──▶ ContentLength(remaining) ──▶ Complete
//!                        └─▶ Chunked(Size → Data → DataEnd → … → Trailers) ──▶ Complete
//! ```
//!
//! # Design Decisions
//! - The reader borrows the connection transport; bytes past the body stay in
//!   the transport buffer for the next pipelined request
//! - Once complete, reads return `Done(empty)` without touching the socket
//! - The connection loop takes the state back with [`Body::into_parts`] and
//!   drains whatever the application left unread

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::http::parse::{next_line, trim_ows};
use crate::http::request::BodyFraming;
use crate::net::transport::{Transport, TransportError};

/// Interim response sent before the first body read on `expect: 100-continue`.
const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Longest chunk-size line (including extensions) accepted.
const MAX_CHUNK_LINE: usize = 4096;

/// Total trailer bytes accepted after the last chunk.
const MAX_TRAILER_BYTES: usize = 16 * 1024;

/// Default read size used by `read_all` and draining.
const READ_SIZE: usize = 64 * 1024;

/// Errors raised while reading a request body.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("timed out waiting for request body")]
    Timeout,

    #[error("malformed chunked encoding: {0}")]
    InvalidChunk(&'static str),

    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for BodyError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(_) => BodyError::Timeout,
            other => BodyError::Transport(other),
        }
    }
}

impl BodyError {
    /// Status to answer with if no response has been written yet.
    pub fn status(&self) -> Option<u16> {
        match self {
            BodyError::Timeout => Some(408),
            BodyError::InvalidChunk(_) => Some(400),
            BodyError::TooLarge { .. } => Some(413),
            BodyError::Transport(_) => None,
        }
    }
}

/// Position inside a chunked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Expecting a chunk-size line.
    Size,
    /// Inside chunk data with this many bytes left.
    Data(u64),
    /// Expecting the CRLF that ends chunk data.
    DataEnd,
    /// After the zero-size chunk, discarding trailer lines.
    Trailers { seen: usize },
}

/// Reader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    NotStarted(BodyFraming),
    ContentLength(u64),
    Chunked(ChunkState),
    Complete,
}

/// Result of a single read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Some bytes; more of the body remains.
    More(Bytes),
    /// The final bytes (possibly empty); the body is fully delivered.
    Done(Bytes),
}

/// Pull-based reader over the current request's body.
#[derive(Debug)]
pub struct Body<'a> {
    transport: &'a mut Transport,
    state: BodyState,
    read_timeout: Option<Duration>,
    continue_pending: bool,
    bytes_read: u64,
}

impl<'a> Body<'a> {
    /// Create a reader for a body with the given framing.
    pub fn new(
        transport: &'a mut Transport,
        framing: BodyFraming,
        read_timeout: Option<Duration>,
        expect_continue: bool,
    ) -> Self {
        let continue_pending = expect_continue && framing != BodyFraming::Empty;
        Self::from_parts(
            transport,
            BodyState::NotStarted(framing),
            read_timeout,
            continue_pending,
        )
    }

    /// Rebuild a reader from state previously taken with [`Body::into_parts`].
    pub fn from_parts(
        transport: &'a mut Transport,
        state: BodyState,
        read_timeout: Option<Duration>,
        continue_pending: bool,
    ) -> Self {
        Self {
            transport,
            state,
            read_timeout,
            continue_pending,
            bytes_read: 0,
        }
    }

    /// Release the transport, returning the reader state and whether the
    /// `100 Continue` is still unsent.
    pub fn into_parts(self) -> (BodyState, bool) {
        (self.state, self.continue_pending)
    }

    /// Whether the whole body has been delivered.
    pub fn is_complete(&self) -> bool {
        self.state == BodyState::Complete
            || self.state == BodyState::NotStarted(BodyFraming::Empty)
    }

    /// Body bytes delivered so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read up to `max_len` bytes of body.
    pub async fn read(&mut self, max_len: usize) -> Result<ReadResult, BodyError> {
        let max_len = max_len.max(1);

        if let BodyState::NotStarted(framing) = self.state {
            if self.continue_pending {
                self.transport.send(CONTINUE_RESPONSE).await?;
                self.transport.flush().await?;
                self.continue_pending = false;
            }
            self.state = match framing {
                BodyFraming::Empty => BodyState::Complete,
                BodyFraming::ContentLength(n) => BodyState::ContentLength(n),
                BodyFraming::Chunked => BodyState::Chunked(ChunkState::Size),
            };
        }

        let result = match self.state {
            BodyState::NotStarted(_) | BodyState::Complete => ReadResult::Done(Bytes::new()),
            BodyState::ContentLength(remaining) => self.read_fixed(remaining, max_len).await?,
            BodyState::Chunked(chunk) => self.read_chunked(chunk, max_len).await?,
        };

        if let ReadResult::More(bytes) | ReadResult::Done(bytes) = &result {
            self.bytes_read += bytes.len() as u64;
        }
        Ok(result)
    }

    /// Read the rest of the body, failing once more than `limit` bytes arrive.
    pub async fn read_all(&mut self, limit: usize) -> Result<Bytes, BodyError> {
        if let BodyState::NotStarted(BodyFraming::ContentLength(n))
        | BodyState::ContentLength(n) = self.state
        {
            if n > limit as u64 {
                return Err(BodyError::TooLarge { limit });
            }
        }

        let mut collected = BytesMut::new();
        loop {
            let want = (limit - collected.len()).saturating_add(1).min(READ_SIZE);
            let (chunk, done) = match self.read(want).await? {
                ReadResult::More(chunk) => (chunk, false),
                ReadResult::Done(chunk) => (chunk, true),
            };
            collected.extend_from_slice(&chunk);
            if collected.len() > limit {
                return Err(BodyError::TooLarge { limit });
            }
            if done {
                return Ok(collected.freeze());
            }
        }
    }

    /// Read and discard the rest of the body, giving up after `limit` bytes.
    pub async fn drain(&mut self, limit: u64) -> Result<u64, BodyError> {
        let mut discarded = 0u64;
        loop {
            let (len, done) = match self.read(READ_SIZE).await? {
                ReadResult::More(chunk) => (chunk.len(), false),
                ReadResult::Done(chunk) => (chunk.len(), true),
            };
            discarded += len as u64;
            if discarded > limit {
                return Err(BodyError::TooLarge {
                    limit: usize::try_from(limit).unwrap_or(usize::MAX),
                });
            }
            if done {
                return Ok(discarded);
            }
        }
    }

    async fn fill(&mut self) -> Result<(), BodyError> {
        self.transport.recv(self.read_timeout).await?;
        Ok(())
    }

    async fn read_fixed(&mut self, remaining: u64, max_len: usize) -> Result<ReadResult, BodyError> {
        if !self.transport.has_buffered() {
            self.fill().await?;
        }
        let available = self.transport.buffer().len();
        let take = (available as u64).min(remaining).min(max_len as u64) as usize;
        let data = self.transport.consume(take);
        let left = remaining - take as u64;
        if left == 0 {
            self.state = BodyState::Complete;
            Ok(ReadResult::Done(data))
        } else {
            self.state = BodyState::ContentLength(left);
            Ok(ReadResult::More(data))
        }
    }

    async fn read_chunked(
        &mut self,
        mut chunk: ChunkState,
        max_len: usize,
    ) -> Result<ReadResult, BodyError> {
        let mut out = BytesMut::new();
        loop {
            self.state = BodyState::Chunked(chunk);
            match chunk {
                ChunkState::Size => match parse_chunk_size(self.transport.buffer())? {
                    Some((0, consumed)) => {
                        self.transport.consume(consumed);
                        chunk = ChunkState::Trailers { seen: 0 };
                    }
                    Some((size, consumed)) => {
                        self.transport.consume(consumed);
                        chunk = ChunkState::Data(size);
                    }
                    None => {
                        if !out.is_empty() {
                            return Ok(ReadResult::More(out.freeze()));
                        }
                        self.fill().await?;
                    }
                },
                ChunkState::Data(remaining) => {
                    if out.len() >= max_len {
                        return Ok(ReadResult::More(out.freeze()));
                    }
                    if !self.transport.has_buffered() {
                        if !out.is_empty() {
                            return Ok(ReadResult::More(out.freeze()));
                        }
                        self.fill().await?;
                        continue;
                    }
                    let available = self.transport.buffer().len() as u64;
                    let room = (max_len - out.len()) as u64;
                    let take = available.min(remaining).min(room) as usize;
                    out.extend_from_slice(&self.transport.consume(take));
                    let left = remaining - take as u64;
                    chunk = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataEnd => {
                    let buf = self.transport.buffer();
                    if buf.starts_with(b"\r\n") {
                        self.transport.consume(2);
                        chunk = ChunkState::Size;
                    } else if buf.starts_with(b"\n") {
                        self.transport.consume(1);
                        chunk = ChunkState::Size;
                    } else if buf.is_empty() || buf == b"\r" {
                        if !out.is_empty() {
                            return Ok(ReadResult::More(out.freeze()));
                        }
                        self.fill().await?;
                    } else {
                        return Err(BodyError::InvalidChunk("missing CRLF after chunk data"));
                    }
                }
                ChunkState::Trailers { seen } => match next_line(self.transport.buffer(), 0) {
                    Some((line, consumed)) => {
                        let finished = line.is_empty();
                        self.transport.consume(consumed);
                        if finished {
                            self.state = BodyState::Complete;
                            return Ok(ReadResult::Done(out.freeze()));
                        }
                        let seen = seen + consumed;
                        if seen > MAX_TRAILER_BYTES {
                            return Err(BodyError::InvalidChunk("trailer section too large"));
                        }
                        chunk = ChunkState::Trailers { seen };
                    }
                    None => {
                        if seen + self.transport.buffer().len() > MAX_TRAILER_BYTES {
                            return Err(BodyError::InvalidChunk("trailer section too large"));
                        }
                        self.fill().await?;
                    }
                },
            }
        }
    }
}

/// Parse a chunk-size line at the start of `buf`.
///
/// Returns the chunk size and the bytes occupied by the line, or `None` when
/// the line is incomplete. Chunk extensions are ignored.
pub fn parse_chunk_size(buf: &[u8]) -> Result<Option<(u64, usize)>, BodyError> {
    let Some((line, consumed)) = next_line(buf, 0) else {
        if buf.len() > MAX_CHUNK_LINE {
            return Err(BodyError::InvalidChunk("chunk size line too long"));
        }
        return Ok(None);
    };
    if line.len() > MAX_CHUNK_LINE {
        return Err(BodyError::InvalidChunk("chunk size line too long"));
    }

    let size_text = match line.iter().position(|&b| b == b';') {
        Some(semi) => &line[..semi],
        None => line,
    };
    let size = parse_hex(trim_ows(size_text)).ok_or(BodyError::InvalidChunk("invalid chunk size"))?;
    Ok(Some((size, consumed)))
}

fn parse_hex(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0u64, |acc, &b| {
        let digit = (b as char).to_digit(16)? as u64;
        acc.checked_mul(16)?.checked_add(digit)
    })
}
