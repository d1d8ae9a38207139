//! Request model: target resolution, host/port and body framing.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) for log correlation
//! - Resolve the request target into scheme, host, port, path and query
//! - Reconcile `transfer-encoding` and `content-length` into one body framing
//!
//! # Design Decisions
//! - The request ID is assigned as soon as the head parses, before dispatch
//! - Absolute-form targets override transport-derived scheme/host/port
//! - When chunked framing wins, `content-length` is removed from the headers so
//!   the application never sees both

use std::net::SocketAddr;

use uuid::Uuid;

use crate::http::header::HeaderMap;
use crate::http::parse::{ParseError, RequestHead, Version};
use crate::net::transport::ConnectionInfo;

/// Header used to surface the request ID to applications and clients.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Resolved request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    ContentLength(u64),
    Chunked,
}

/// A fully parsed and resolved request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub method: String,
    pub target: Target,
    pub version: Version,
    pub headers: HeaderMap,
    pub framing: BodyFraming,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub(crate) websocket_enabled: bool,
}

impl Request {
    /// Resolve a parsed head against the connection it arrived on.
    pub fn from_head(head: RequestHead, info: &ConnectionInfo) -> Result<Self, ParseError> {
        let RequestHead {
            method,
            target: raw_target,
            version,
            mut headers,
        } = head;

        let default_scheme = if info.secure { "https" } else { "http" };
        let target = resolve_target(&method, &raw_target, version, &headers, default_scheme, info)?;
        let framing = body_framing(&mut headers)?;

        Ok(Self {
            id: Uuid::new_v4(),
            method,
            target,
            version,
            headers,
            framing,
            peer_addr: info.peer_addr,
            local_addr: info.local_addr,
            websocket_enabled: true,
        })
    }

    pub fn path(&self) -> &str {
        &self.target.path
    }

    pub fn query(&self) -> Option<&str> {
        self.target.query.as_deref()
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    /// Whether the client asked for the connection to stay open after this request.
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        match self.version {
            Version::Http11 => true,
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }

    /// Whether the client sent `expect: 100-continue` and is waiting for permission
    /// to send the body.
    pub fn expects_continue(&self) -> bool {
        self.version == Version::Http11
            && self
                .headers
                .get("expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }
}

fn resolve_target(
    method: &str,
    raw: &str,
    version: Version,
    headers: &HeaderMap,
    default_scheme: &str,
    info: &ConnectionInfo,
) -> Result<Target, ParseError> {
    if method == "CONNECT" {
        return Err(ParseError::UnsupportedTarget);
    }

    let mut hosts = headers.get_all("host");
    let host_header = hosts.next();
    if hosts.next().is_some() {
        return Err(ParseError::DuplicateHost);
    }

    if raw == "*" {
        if method != "OPTIONS" {
            return Err(ParseError::InvalidTarget);
        }
        let (host, port) = host_and_port(host_header, version, default_scheme, info)?;
        return Ok(Target {
            scheme: default_scheme.to_string(),
            host,
            port,
            path: "*".to_string(),
            query: None,
        });
    }

    if raw.starts_with('/') {
        let (path, query) = match raw.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (raw, None),
        };
        let (host, port) = host_and_port(host_header, version, default_scheme, info)?;
        return Ok(Target {
            scheme: default_scheme.to_string(),
            host,
            port,
            path: path.to_string(),
            query,
        });
    }

    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let url = url::Url::parse(raw).map_err(|_| ParseError::InvalidTarget)?;
        let host = url.host_str().ok_or(ParseError::InvalidTarget)?.to_string();
        let port = url.port_or_known_default().ok_or(ParseError::InvalidTarget)?;
        return Ok(Target {
            scheme: url.scheme().to_string(),
            host,
            port,
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
        });
    }

    // authority-form is only meaningful for CONNECT
    if !raw.contains('/') && raw.contains(':') {
        return Err(ParseError::UnsupportedTarget);
    }
    Err(ParseError::InvalidTarget)
}

fn host_and_port(
    host_header: Option<&str>,
    version: Version,
    scheme: &str,
    info: &ConnectionInfo,
) -> Result<(String, u16), ParseError> {
    let default_port = if scheme == "https" { 443 } else { 80 };
    match host_header {
        Some(value) => parse_host(value.trim(), default_port),
        None if version == Version::Http10 => {
            let port = info.local_addr.map_or(default_port, |addr| addr.port());
            Ok((String::new(), port))
        }
        None => Err(ParseError::MissingHost),
    }
}

/// Split a `host[:port]` value. IPv6 literals keep their brackets.
pub fn parse_host(value: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    let (host, port) = if value.starts_with('[') {
        let close = value.find(']').ok_or(ParseError::InvalidHost)?;
        let (host, rest) = value.split_at(close + 1);
        match rest {
            "" => (host, None),
            _ => match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(ParseError::InvalidHost),
            },
        }
    } else {
        match value.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        }
    };

    if host.bytes().any(|b| b <= b' ' || b == b'/' || b == b'@') {
        return Err(ParseError::InvalidHost);
    }

    let port = match port {
        None | Some("") => default_port,
        Some(port) => parse_port(port)?,
    };
    Ok((host.to_string(), port))
}

fn parse_port(text: &str) -> Result<u16, ParseError> {
    if text.len() > 5 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidHost);
    }
    text.parse::<u16>().map_err(|_| ParseError::InvalidHost)
}

fn body_framing(headers: &mut HeaderMap) -> Result<BodyFraming, ParseError> {
    if headers.contains("transfer-encoding") {
        let last = headers
            .get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|coding| !coding.is_empty())
            .last();
        return match last {
            Some(coding) if coding.eq_ignore_ascii_case("chunked") => {
                headers.remove("content-length");
                Ok(BodyFraming::Chunked)
            }
            _ => Err(ParseError::UnsupportedTransferEncoding),
        };
    }

    if !headers.contains("content-length") {
        return Ok(BodyFraming::Empty);
    }

    let mut declared: Option<&str> = None;
    for value in headers.get_all("content-length").flat_map(|v| v.split(',')) {
        let value = value.trim();
        match declared {
            None => declared = Some(value),
            Some(first) if first == value => {}
            Some(_) => return Err(ParseError::InvalidContentLength),
        }
    }

    let text = declared.ok_or(ParseError::InvalidContentLength)?;
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidContentLength);
    }
    let length: u64 = text.parse().map_err(|_| ParseError::InvalidContentLength)?;
    let normalized = text.to_string();
    headers.insert("content-length", normalized);

    Ok(match length {
        0 => BodyFraming::Empty,
        n => BodyFraming::ContentLength(n),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse::{parse_head, ParseLimits, ParseStatus};

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            peer_addr: Some("10.0.0.1:5555".parse().unwrap()),
            local_addr: Some("127.0.0.1:4000".parse().unwrap()),
            secure: false,
        }
    }

    fn request(raw: &str) -> Result<Request, ParseError> {
        match parse_head(raw.as_bytes(), &ParseLimits::default())? {
            ParseStatus::Complete { head, .. } => Request::from_head(head, &info()),
            ParseStatus::Partial => panic!("incomplete test request"),
        }
    }

    #[test]
    fn host_header_with_port() {
        let req = request("GET /x HTTP/1.1\r\nHost: banana:1234\r\n\r\n").unwrap();
        assert_eq!(req.target.host, "banana");
        assert_eq!(req.target.port, 1234);
        assert_eq!(req.target.scheme, "http");
    }

    #[test]
    fn negative_port_rejected() {
        let err = request("GET /x HTTP/1.1\r\nHost: banana:-1234\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn port_out_of_range_rejected() {
        let err = request("GET / HTTP/1.1\r\nHost: banana:65536\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::InvalidHost);
    }

    #[test]
    fn ipv6_host() {
        let req = request("GET / HTTP/1.1\r\nHost: [::1]:8080\r\n\r\n").unwrap();
        assert_eq!(req.target.host, "[::1]");
        assert_eq!(req.target.port, 8080);

        let req = request("GET / HTTP/1.1\r\nHost: [::1]\r\n\r\n").unwrap();
        assert_eq!(req.target.port, 80);
    }

    #[test]
    fn missing_host_on_http11() {
        let err = request("GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::MissingHost);
    }

    #[test]
    fn http10_without_host_uses_local_port() {
        let req = request("GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.target.host, "");
        assert_eq!(req.target.port, 4000);
    }

    #[test]
    fn duplicate_host_rejected() {
        let err = request("GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::DuplicateHost);
    }

    #[test]
    fn origin_form_splits_query() {
        let req = request("GET /a/b?c=d&e HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.query(), Some("c=d&e"));
    }

    #[test]
    fn absolute_form_overrides_host() {
        let req =
            request("GET https://example.com/p?q=1 HTTP/1.1\r\nHost: other\r\n\r\n").unwrap();
        assert_eq!(req.target.scheme, "https");
        assert_eq!(req.target.host, "example.com");
        assert_eq!(req.target.port, 443);
        assert_eq!(req.path(), "/p");
        assert_eq!(req.query(), Some("q=1"));
    }

    #[test]
    fn asterisk_only_for_options() {
        let req = request("OPTIONS * HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(req.path(), "*");

        let err = request("GET * HTTP/1.1\r\nHost: h\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::InvalidTarget);
    }

    #[test]
    fn connect_not_implemented() {
        let err = request("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap_err();
        assert_eq!(err.status(), 501);

        let err = request("GET example.com:443 HTTP/1.1\r\nHost: h\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), 501);
    }

    #[test]
    fn identical_content_lengths_accepted() {
        let req = request(
            "POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 8000000,8000000,8000000\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.framing, BodyFraming::ContentLength(8_000_000));
        assert_eq!(req.header("content-length"), Some("8000000"));
    }

    #[test]
    fn diverging_content_lengths_rejected() {
        let err = request("POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 8000,8001,8000\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, ParseError::InvalidContentLength);
        assert_eq!(err.status(), 400);

        let err = request(
            "POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n",
        )
        .unwrap_err();
        assert_eq!(err, ParseError::InvalidContentLength);
    }

    #[test]
    fn non_numeric_content_length_rejected() {
        let err = request("POST / HTTP/1.1\r\nHost: h\r\nContent-Length: -1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::InvalidContentLength);
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let req = request(
            "POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.framing, BodyFraming::Chunked);
        assert!(req.header("content-length").is_none());
    }

    #[test]
    fn non_chunked_transfer_encoding_rejected() {
        let err = request("POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: gzip\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, ParseError::UnsupportedTransferEncoding);
    }

    #[test]
    fn keep_alive_rules() {
        let req = request("GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert!(req.wants_keep_alive());

        let req = request("GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.wants_keep_alive());

        let req = request("GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.wants_keep_alive());

        let req = request("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(req.wants_keep_alive());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = request("GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let b = request("GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert_ne!(a.id, b.id);
    }
}
