//! Incremental HTTP/1.x request-head parser.
//!
//! # Responsibilities
//! - Turn buffered bytes into a request line plus header table
//! - Enforce request-line, header-line and header-count limits, including on
//!   input that has not fully arrived yet
//! - Report every failure as a typed [`ParseError`] carrying its response status
//!
//! # Design Decisions
//! - Stateless: each call re-scans from the start of the buffer and reports how
//!   many bytes the head occupied, so the caller owns all buffering
//! - Lines end in CRLF; a bare LF is tolerated
//! - Leading empty lines before the request line are skipped

use thiserror::Error;

use crate::http::header::HeaderMap;

/// Size and count limits applied while parsing a request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    pub max_request_line_length: usize,
    pub max_header_length: usize,
    pub max_header_count: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_request_line_length: 10_000,
            max_header_length: 10_000,
            max_header_count: 50,
        }
    }
}

/// Protocol version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A syntactically valid request line and header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Outcome of a parse attempt.
#[derive(Debug)]
pub enum ParseStatus {
    /// A full head was parsed; `consumed` bytes (including the blank line) belong to it.
    Complete { head: RequestHead, consumed: usize },
    /// More bytes are needed.
    Partial,
}

/// Errors detected while parsing or resolving a request head.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("request line exceeds {0} bytes")]
    RequestLineTooLong(usize),

    #[error("header line exceeds {0} bytes")]
    HeaderTooLong(usize),

    #[error("more than {0} header fields")]
    TooManyHeaders(usize),

    #[error("malformed request line")]
    InvalidRequestLine,

    #[error("invalid method token")]
    InvalidMethod,

    #[error("unsupported protocol version")]
    InvalidVersion,

    #[error("malformed header field")]
    InvalidHeader,

    #[error("obsolete header line folding")]
    ObsoleteLineFolding,

    #[error("invalid request target")]
    InvalidTarget,

    /// Authority-form and CONNECT. Answered with 501 rather than 400: the
    /// request is well formed, the server just does not implement it.
    #[error("request target form not supported")]
    UnsupportedTarget,

    #[error("missing host header")]
    MissingHost,

    #[error("duplicate host header")]
    DuplicateHost,

    #[error("invalid host header")]
    InvalidHost,

    #[error("invalid content-length")]
    InvalidContentLength,

    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
}

impl ParseError {
    /// Status code to answer with before closing the connection.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::RequestLineTooLong(_) => 414,
            ParseError::HeaderTooLong(_) | ParseError::TooManyHeaders(_) => 431,
            ParseError::UnsupportedTarget => 501,
            _ => 400,
        }
    }

    /// Short label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::RequestLineTooLong(_) => "request_line_too_long",
            ParseError::HeaderTooLong(_) => "header_too_long",
            ParseError::TooManyHeaders(_) => "too_many_headers",
            ParseError::UnsupportedTarget => "unsupported_target",
            ParseError::MissingHost | ParseError::DuplicateHost | ParseError::InvalidHost => {
                "invalid_host"
            }
            ParseError::InvalidContentLength | ParseError::UnsupportedTransferEncoding => {
                "invalid_framing"
            }
            _ => "malformed",
        }
    }
}

/// Parse a request head from the start of `buf`.
pub fn parse_head(buf: &[u8], limits: &ParseLimits) -> Result<ParseStatus, ParseError> {
    let mut pos = skip_empty_lines(buf);
    if pos > limits.max_request_line_length {
        return Err(ParseError::RequestLineTooLong(limits.max_request_line_length));
    }

    let (line, next) = match next_line(buf, pos) {
        Some(found) => found,
        None => {
            if buf.len() - pos > limits.max_request_line_length {
                return Err(ParseError::RequestLineTooLong(limits.max_request_line_length));
            }
            return Ok(ParseStatus::Partial);
        }
    };
    if line.len() > limits.max_request_line_length {
        return Err(ParseError::RequestLineTooLong(limits.max_request_line_length));
    }
    let (method, target, version) = parse_request_line(line)?;
    pos = next;

    let mut headers = HeaderMap::with_capacity(16);
    loop {
        let rest = &buf[pos..];
        if headers.len() >= limits.max_header_count
            && !rest.is_empty()
            && rest[0] != b'\r'
            && rest[0] != b'\n'
        {
            return Err(ParseError::TooManyHeaders(limits.max_header_count));
        }

        let (line, next) = match next_line(buf, pos) {
            Some(found) => found,
            None => {
                if rest.len() > limits.max_header_length {
                    return Err(ParseError::HeaderTooLong(limits.max_header_length));
                }
                return Ok(ParseStatus::Partial);
            }
        };
        pos = next;

        if line.is_empty() {
            break;
        }
        if line.len() > limits.max_header_length {
            return Err(ParseError::HeaderTooLong(limits.max_header_length));
        }
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(ParseError::ObsoleteLineFolding);
        }
        let (name, value) = parse_header_line(line)?;
        headers.append(name, value);
    }

    Ok(ParseStatus::Complete {
        head: RequestHead {
            method,
            target,
            version,
            headers,
        },
        consumed: pos,
    })
}

/// Whether `b` is a `tchar` (RFC 9110 token character).
pub fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}

/// Trim optional whitespace (spaces and tabs) from both ends.
pub fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Locate the line starting at `pos`. Returns the line without its terminator
/// and the offset just past the terminator.
pub(crate) fn next_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = &buf[pos..];
    let lf = rest.iter().position(|&b| b == b'\n')?;
    let line = if lf > 0 && rest[lf - 1] == b'\r' {
        &rest[..lf - 1]
    } else {
        &rest[..lf]
    };
    Some((line, pos + lf + 1))
}

fn skip_empty_lines(buf: &[u8]) -> usize {
    let mut pos = 0;
    loop {
        if buf[pos..].starts_with(b"\r\n") {
            pos += 2;
        } else if buf[pos..].starts_with(b"\n") {
            pos += 1;
        } else {
            return pos;
        }
    }
}

fn parse_request_line(line: &[u8]) -> Result<(String, String, Version), ParseError> {
    let mut parts = line.split(|&b| b == b' ');
    let method = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let target = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequestLine);
    }

    if method.is_empty() || !method.iter().all(|&b| is_token_char(b)) {
        return Err(ParseError::InvalidMethod);
    }
    if target.is_empty() || target.iter().any(|&b| b <= b' ' || b >= 0x7f) {
        return Err(ParseError::InvalidTarget);
    }
    let version = match version {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        _ => return Err(ParseError::InvalidVersion),
    };

    let method = std::str::from_utf8(method).map_err(|_| ParseError::InvalidMethod)?;
    let target = std::str::from_utf8(target).map_err(|_| ParseError::InvalidTarget)?;
    Ok((method.to_owned(), target.to_owned(), version))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token_char(b)) {
        return Err(ParseError::InvalidHeader);
    }

    let value = trim_ows(&line[colon + 1..]);
    if value.iter().any(|&b| (b < b' ' && b != b'\t') || b == 0x7f) {
        return Err(ParseError::InvalidHeader);
    }

    let name = std::str::from_utf8(name).map_err(|_| ParseError::InvalidHeader)?;
    // Values may carry obs-text (0x80-0xFF), which has no fixed charset.
    Ok((name.to_owned(), String::from_utf8_lossy(value).into_owned()))
}
