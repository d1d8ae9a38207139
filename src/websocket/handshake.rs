//! WebSocket upgrade handshake (RFC 6455 Section 4.2).
//!
//! - [`validate_upgrade`]: check upgrade preconditions in a fixed order and
//!   report the first failure
//! - [`accept_key`]: SHA-1 + Base64 of the client key and the RFC GUID
//! - [`WebSocketUpgrade`]: what an application returns to take over a connection

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::handler::SocketHandler;
use crate::http::header::HeaderMap;
use crate::http::parse::Version;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::websocket::extension::{negotiate_compression, DeflateConfig};

/// GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The first upgrade precondition a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("websocket support is disabled")]
    Disabled,

    #[error("method must be GET")]
    MethodNotGet,

    #[error("protocol version must be HTTP/1.1")]
    VersionNotHttp11,

    #[error("missing host header")]
    MissingHost,

    #[error("connection header lacks the upgrade token")]
    MissingConnectionUpgrade,

    #[error("upgrade header lacks the websocket token")]
    MissingUpgradeWebsocket,

    #[error("missing sec-websocket-key header")]
    MissingKey,

    #[error("sec-websocket-version must be 13")]
    UnsupportedVersion,
}

/// Check that `request` is a valid WebSocket upgrade and return the client key.
///
/// The request is only inspected, so on failure it can still be served as
/// ordinary HTTP.
pub fn validate_upgrade(request: &Request) -> Result<String, HandshakeError> {
    if !request.websocket_enabled {
        return Err(HandshakeError::Disabled);
    }
    if request.method != "GET" {
        return Err(HandshakeError::MethodNotGet);
    }
    if request.version != Version::Http11 {
        return Err(HandshakeError::VersionNotHttp11);
    }
    if !request.headers.contains("host") {
        return Err(HandshakeError::MissingHost);
    }
    if !request.headers.has_token("connection", "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }
    if !request.headers.has_token("upgrade", "websocket") {
        return Err(HandshakeError::MissingUpgradeWebsocket);
    }
    let key = match request.headers.get("sec-websocket-key").map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => return Err(HandshakeError::MissingKey),
    };
    if request.headers.get("sec-websocket-version").map(str::trim) != Some("13") {
        return Err(HandshakeError::UnsupportedVersion);
    }
    Ok(key)
}

/// Compute the `sec-websocket-accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// A validated upgrade, carrying the socket handler that will own the connection.
pub struct WebSocketUpgrade {
    key: String,
    extension_offers: Vec<String>,
    headers: HeaderMap,
    handler: Box<dyn SocketHandler>,
}

impl std::fmt::Debug for WebSocketUpgrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketUpgrade")
            .field("key", &self.key)
            .field("extension_offers", &self.extension_offers)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl WebSocketUpgrade {
    /// Validate `request` and prepare to hand the connection to `handler`.
    pub fn new<H: SocketHandler + 'static>(
        request: &Request,
        handler: H,
    ) -> Result<Self, HandshakeError> {
        let key = validate_upgrade(request)?;
        Ok(Self {
            key,
            extension_offers: request
                .headers
                .get_all("sec-websocket-extensions")
                .map(str::to_string)
                .collect(),
            headers: HeaderMap::new(),
            handler: Box::new(handler),
        })
    }

    /// Add a header to the `101` response (e.g. `sec-websocket-protocol`).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Build the `101 Switching Protocols` response and negotiate compression.
    pub fn into_parts(
        self,
        compression_enabled: bool,
    ) -> (Response, Option<DeflateConfig>, Box<dyn SocketHandler>) {
        let deflate = negotiate_compression(
            self.extension_offers.iter().map(String::as_str),
            compression_enabled,
        );

        let mut response = Response::new(101)
            .with_header("upgrade", "websocket")
            .with_header("connection", "Upgrade")
            .with_header("sec-websocket-accept", accept_key(&self.key));
        if let Some(config) = &deflate {
            response = response.with_header("sec-websocket-extensions", config.response_header());
        }
        for (name, value) in self.headers.iter() {
            response = response.with_header(name, value);
        }
        (response, deflate, self.handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::{Message, SocketReply};
    use crate::http::parse::{parse_head, ParseLimits, ParseStatus};
    use crate::net::transport::ConnectionInfo;

    struct Noop;

    impl SocketHandler for Noop {
        fn handle(&mut self, _message: Message) -> SocketReply {
            SocketReply::Continue
        }
    }

    const VALID: &str = "GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n";

    fn request(raw: &str) -> Request {
        let full = format!("{raw}\r\n");
        match parse_head(full.as_bytes(), &ParseLimits::default()).unwrap() {
            ParseStatus::Complete { head, .. } => {
                Request::from_head(head, &ConnectionInfo::default()).unwrap()
            }
            ParseStatus::Partial => panic!("incomplete test request"),
        }
    }

    #[test]
    fn rfc_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn valid_upgrade() {
        assert_eq!(
            validate_upgrade(&request(VALID)).unwrap(),
            "dGhlIHNhbXBsZSBub25jZQ=="
        );
    }

    #[test]
    fn first_failure_is_reported() {
        let post = VALID.replacen("GET", "POST", 1);
        assert_eq!(validate_upgrade(&request(&post)), Err(HandshakeError::MethodNotGet));

        let old = VALID.replacen("HTTP/1.1", "HTTP/1.0", 1);
        assert_eq!(validate_upgrade(&request(&old)), Err(HandshakeError::VersionNotHttp11));

        let no_conn = VALID.replacen("keep-alive, Upgrade", "keep-alive", 1);
        assert_eq!(
            validate_upgrade(&request(&no_conn)),
            Err(HandshakeError::MissingConnectionUpgrade)
        );

        let no_upgrade = VALID.replacen("Upgrade: websocket", "Upgrade: h2c", 1);
        assert_eq!(
            validate_upgrade(&request(&no_upgrade)),
            Err(HandshakeError::MissingUpgradeWebsocket)
        );

        let no_key = VALID.replacen("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n", "", 1);
        assert_eq!(validate_upgrade(&request(&no_key)), Err(HandshakeError::MissingKey));

        let version = VALID.replacen("Version: 13", "Version: 8", 1);
        assert_eq!(
            validate_upgrade(&request(&version)),
            Err(HandshakeError::UnsupportedVersion)
        );

        let both = post.replacen("Version: 13", "Version: 8", 1);
        assert_eq!(validate_upgrade(&request(&both)), Err(HandshakeError::MethodNotGet));
    }

    #[test]
    fn disabled_is_its_own_failure() {
        let mut req = request(VALID);
        req.websocket_enabled = false;
        assert_eq!(validate_upgrade(&req), Err(HandshakeError::Disabled));
    }

    #[test]
    fn upgrade_response_headers() {
        let raw = format!("{VALID}Sec-WebSocket-Extensions: permessage-deflate\r\n");
        let upgrade = WebSocketUpgrade::new(&request(&raw), Noop)
            .unwrap()
            .with_header("sec-websocket-protocol", "chat");

        let (response, deflate, _handler) = upgrade.into_parts(true);
        assert_eq!(response.status(), 101);
        let headers = response.headers();
        assert_eq!(headers.get("upgrade"), Some("websocket"));
        assert_eq!(headers.get("sec-websocket-accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(headers.get("sec-websocket-extensions"), Some("permessage-deflate"));
        assert_eq!(headers.get("sec-websocket-protocol"), Some("chat"));
        assert!(deflate.is_some());
    }

    #[test]
    fn compression_disabled_echoes_nothing() {
        let raw = format!("{VALID}Sec-WebSocket-Extensions: permessage-deflate\r\n");
        let (response, deflate, _) = WebSocketUpgrade::new(&request(&raw), Noop)
            .unwrap()
            .into_parts(false);
        assert!(deflate.is_none());
        assert!(!response.headers().contains("sec-websocket-extensions"));
    }
}
