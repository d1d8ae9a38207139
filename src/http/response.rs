//! Response model and wire writer.
//!
//! # Responsibilities
//! - Describe a response: status, headers and one of four body kinds
//! - Pick the output strategy at finalize time (fixed, chunked, raw stream, file range)
//! - Apply status-class suppression, compression, `date` and `connection` headers
//!
//! # Data Flow
//! ```text
//! Response ──finalize──▶ headers + Plan ──▶ status line + header block ──▶ body bytes
//!                          │
//!                          ├─ Fixed(bytes)         content-length from actual bytes
//!                          ├─ Chunked(stream)      hex-size-prefixed chunks, 0 terminator
//!                          ├─ Raw(stream, len?)    caller length, or close-delimited (HTTP/1.0)
//!                          └─ File(range)          exact content-length, bounded copy
//! ```
//!
//! # Design Decisions
//! - Files are opened before anything is written, so a missing file still becomes a 500
//! - The writer records whether the head went out; the connection loop uses that
//!   to choose between an error response and aborting the connection
//! - Error responses carry an empty body; details belong in logs

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::http::compress::{self, ContentCoding, StreamEncoder};
use crate::http::handler::BoxError;
use crate::http::header::HeaderMap;
use crate::http::parse::Version;
use crate::http::status::{forbids_body, status_line};
use crate::net::transport::{Transport, TransportError};

/// Largest slice of a file read into memory at once.
const FILE_CHUNK: usize = 64 * 1024;

/// Bytes to read next when `remaining` are left. A length beyond `usize`
/// (32-bit targets) is still larger than one slice.
fn file_slice_len(remaining: u64) -> usize {
    usize::try_from(remaining).map_or(FILE_CHUNK, |r| r.min(FILE_CHUNK))
}

/// A stream of body chunks produced by the application.
pub type BodyStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// Body of a response.
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
    /// A byte range of a file; `len: None` means "to the end of the file".
    File {
        path: PathBuf,
        offset: u64,
        len: Option<u64>,
    },
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
            ResponseBody::File { path, offset, len } => f
                .debug_struct("File")
                .field("path", path)
                .field("offset", offset)
                .field("len", len)
                .finish(),
        }
    }
}

/// A response produced by the application.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// A `text/plain` response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(Bytes::from(body.into()))
    }

    /// A response with a fixed body.
    pub fn bytes(status: u16, body: impl Into<Bytes>) -> Self {
        Self::new(status).with_body(body)
    }

    /// A streamed response.
    pub fn stream<S>(status: u16, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        let mut response = Self::new(status);
        response.body = ResponseBody::Stream(stream.boxed());
        response
    }

    /// A response served from a file range.
    pub fn file(status: u16, path: impl Into<PathBuf>, offset: u64, len: Option<u64>) -> Self {
        let mut response = Self::new(status);
        response.body = ResponseBody::File {
            path: path.into(),
            offset,
            len,
        };
        response
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }
}

/// Server-wide response settings.
#[derive(Debug, Clone, Copy)]
pub struct WriteSettings {
    pub compress: bool,
    pub compress_threshold: usize,
    pub compress_strong_etag: bool,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            compress: true,
            compress_threshold: 300,
            compress_strong_etag: false,
        }
    }
}

/// Per-request facts the writer needs.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub is_head: bool,
    pub version: Version,
    pub accept_encoding: Vec<String>,
    pub keep_alive: bool,
}

impl ResponseContext {
    /// Context for a response that answers no parsed request (parse errors, timeouts).
    pub fn closing() -> Self {
        Self {
            is_head: false,
            version: Version::Http11,
            accept_encoding: Vec::new(),
            keep_alive: false,
        }
    }
}

/// What was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub status: u16,
    pub header_bytes: u64,
    pub body_bytes: u64,
    /// Whether the connection may serve another request after this response.
    pub keep_alive: bool,
    pub coding: Option<ContentCoding>,
}

/// Errors raised while writing a response.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to open response file: {0}")]
    FileOpen(io::Error),

    #[error("failed to read response file: {0}")]
    FileRead(io::Error),

    #[error("response body stream failed: {0}")]
    Stream(BoxError),

    #[error("streamed body length {actual} does not match content-length {declared}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("compression failed: {0}")]
    Compression(io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum Plan {
    None,
    Fixed(Bytes),
    Chunked(BodyStream, Option<StreamEncoder>),
    Raw(BodyStream, Option<u64>, Option<StreamEncoder>),
    File(tokio::fs::File, u64, u64),
}

/// Writes responses onto a connection transport.
pub struct ResponseWriter<'t> {
    transport: &'t mut Transport,
    settings: WriteSettings,
    headers_sent: bool,
}

impl<'t> ResponseWriter<'t> {
    pub fn new(transport: &'t mut Transport, settings: WriteSettings) -> Self {
        Self {
            transport,
            settings,
            headers_sent: false,
        }
    }

    /// Whether any part of the response head has been handed to the transport.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Finalize and write a response.
    pub async fn write(
        &mut self,
        response: Response,
        ctx: &ResponseContext,
    ) -> Result<WriteOutcome, WriteError> {
        let Response {
            status,
            mut headers,
            body,
        } = response;

        let mut keep_alive = ctx.keep_alive && !headers.has_token("connection", "close");
        if !headers.contains("date") {
            headers.insert("date", httpdate::fmt_http_date(SystemTime::now()));
        }

        let coding = if self.compression_eligible(status, &headers, &body) {
            if !headers.has_token("vary", "accept-encoding") && !headers.has_token("vary", "*") {
                headers.append("vary", "accept-encoding");
            }
            compress::negotiate(ctx.accept_encoding.iter().map(String::as_str))
        } else {
            None
        };

        let plan = if forbids_body(status) {
            if status != 304 {
                headers.remove("content-length");
            }
            headers.remove("transfer-encoding");
            Plan::None
        } else {
            match body {
                ResponseBody::Empty => {
                    headers.remove("transfer-encoding");
                    headers.insert("content-length", "0");
                    Plan::None
                }
                ResponseBody::Full(bytes) => {
                    let bytes = match coding {
                        Some(coding) => {
                            headers.insert("content-encoding", coding.as_str());
                            Bytes::from(
                                compress::compress(coding, &bytes)
                                    .map_err(WriteError::Compression)?,
                            )
                        }
                        None => bytes,
                    };
                    headers.remove("transfer-encoding");
                    headers.insert("content-length", bytes.len().to_string());
                    Plan::Fixed(bytes)
                }
                ResponseBody::Stream(stream) => {
                    if let Some(coding) = coding {
                        headers.insert("content-encoding", coding.as_str());
                    }
                    let encoder = coding
                        .map(StreamEncoder::new)
                        .transpose()
                        .map_err(WriteError::Compression)?;
                    let declared = headers
                        .get("content-length")
                        .and_then(|v| v.trim().parse::<u64>().ok());
                    headers.remove("transfer-encoding");
                    if ctx.is_head {
                        if declared.is_none() {
                            headers.remove("content-length");
                        }
                        Plan::None
                    } else if let (Some(len), None) = (declared, &encoder) {
                        Plan::Raw(stream, Some(len), None)
                    } else if ctx.version == Version::Http10 {
                        headers.remove("content-length");
                        keep_alive = false;
                        Plan::Raw(stream, None, encoder)
                    } else {
                        headers.remove("content-length");
                        headers.insert("transfer-encoding", "chunked");
                        Plan::Chunked(stream, encoder)
                    }
                }
                ResponseBody::File { path, offset, len } => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .map_err(WriteError::FileOpen)?;
                    let size = file.metadata().await.map_err(WriteError::FileOpen)?.len();
                    let available = size.checked_sub(offset).ok_or_else(|| {
                        WriteError::FileOpen(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "offset beyond end of file",
                        ))
                    })?;
                    let len = match len {
                        Some(len) if len > available => {
                            return Err(WriteError::FileOpen(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "range beyond end of file",
                            )))
                        }
                        Some(len) => len,
                        None => available,
                    };
                    headers.remove("transfer-encoding");
                    headers.insert("content-length", len.to_string());
                    Plan::File(file, offset, len)
                }
            }
        };

        if !keep_alive {
            headers.insert("connection", "close");
        } else if ctx.version == Version::Http10 {
            headers.insert("connection", "keep-alive");
        }

        let mut head = status_line(status).into_bytes();
        for (name, value) in headers.iter() {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        let header_bytes = head.len() as u64;

        let body_bytes = match plan {
            Plan::Fixed(bytes) if !ctx.is_head => {
                head.extend_from_slice(&bytes);
                self.send_head(&head).await?;
                bytes.len() as u64
            }
            Plan::None | Plan::Fixed(_) => {
                self.send_head(&head).await?;
                0
            }
            Plan::File(_, _, _) if ctx.is_head => {
                self.send_head(&head).await?;
                0
            }
            Plan::File(file, offset, len) => {
                self.send_head(&head).await?;
                self.write_file(file, offset, len).await?
            }
            Plan::Chunked(stream, encoder) => {
                self.send_head(&head).await?;
                self.write_chunked(stream, encoder).await?
            }
            Plan::Raw(stream, declared, encoder) => {
                self.send_head(&head).await?;
                self.write_raw(stream, declared, encoder).await?
            }
        };
        self.transport.flush().await?;

        Ok(WriteOutcome {
            status,
            header_bytes,
            body_bytes,
            keep_alive,
            coding,
        })
    }

    fn compression_eligible(&self, status: u16, headers: &HeaderMap, body: &ResponseBody) -> bool {
        if !self.settings.compress || forbids_body(status) {
            return false;
        }
        if headers.contains("content-encoding") || headers.has_token("cache-control", "no-transform") {
            return false;
        }
        let strong_etag = headers
            .get("etag")
            .is_some_and(|tag| !tag.trim_start().starts_with("W/"));
        if strong_etag && !self.settings.compress_strong_etag {
            return false;
        }
        match body {
            ResponseBody::Full(bytes) => {
                !bytes.is_empty() && bytes.len() >= self.settings.compress_threshold
            }
            ResponseBody::Stream(_) => !headers.contains("content-length"),
            ResponseBody::Empty | ResponseBody::File { .. } => false,
        }
    }

    async fn send_head(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        self.headers_sent = true;
        self.transport.send(bytes).await?;
        Ok(())
    }

    async fn write_chunked(
        &mut self,
        mut stream: BodyStream,
        mut encoder: Option<StreamEncoder>,
    ) -> Result<u64, WriteError> {
        let mut written = 0u64;
        while let Some(item) = stream.next().await {
            let chunk = item.map_err(WriteError::Stream)?;
            let data = match encoder.as_mut() {
                Some(enc) => Bytes::from(enc.encode(&chunk).map_err(WriteError::Compression)?),
                None => chunk,
            };
            written += self.send_chunk(&data).await?;
        }
        if let Some(enc) = encoder {
            let tail = enc.finish().map_err(WriteError::Compression)?;
            written += self.send_chunk(&tail).await?;
        }
        self.transport.send(b"0\r\n\r\n").await?;
        Ok(written)
    }

    async fn send_chunk(&mut self, data: &[u8]) -> Result<u64, WriteError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut framed = format!("{:x}\r\n", data.len()).into_bytes();
        framed.extend_from_slice(data);
        framed.extend_from_slice(b"\r\n");
        self.transport.send(&framed).await?;
        Ok(data.len() as u64)
    }

    async fn write_raw(
        &mut self,
        mut stream: BodyStream,
        declared: Option<u64>,
        mut encoder: Option<StreamEncoder>,
    ) -> Result<u64, WriteError> {
        let mut written = 0u64;
        while let Some(item) = stream.next().await {
            let chunk = item.map_err(WriteError::Stream)?;
            let data = match encoder.as_mut() {
                Some(enc) => Bytes::from(enc.encode(&chunk).map_err(WriteError::Compression)?),
                None => chunk,
            };
            written += data.len() as u64;
            if let Some(declared) = declared {
                if written > declared {
                    return Err(WriteError::LengthMismatch {
                        declared,
                        actual: written,
                    });
                }
            }
            self.transport.send(&data).await?;
        }
        if let Some(enc) = encoder {
            let tail = enc.finish().map_err(WriteError::Compression)?;
            written += tail.len() as u64;
            self.transport.send(&tail).await?;
        }
        match declared {
            Some(declared) if declared != written => Err(WriteError::LengthMismatch {
                declared,
                actual: written,
            }),
            _ => Ok(written),
        }
    }

    async fn write_file(
        &mut self,
        mut file: tokio::fs::File,
        offset: u64,
        len: u64,
    ) -> Result<u64, WriteError> {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(WriteError::FileRead)?;
        let mut remaining = len;
        let mut buf = vec![0u8; file_slice_len(len)];
        while remaining > 0 {
            let want = file_slice_len(remaining);
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(WriteError::FileRead)?;
            if n == 0 {
                return Err(WriteError::FileRead(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank while sending",
                )));
            }
            self.transport.send(&buf[..n]).await?;
            remaining -= n as u64;
        }
        Ok(len)
    }
}
