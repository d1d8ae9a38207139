//! Close codes and close-frame payloads (RFC 6455 Section 5.5.1, 7.4).

use thiserror::Error;

/// Well-known close status codes.
pub struct CloseCode;

impl CloseCode {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Whether a peer may send `code` in a close frame.
///
/// 1004-1006 and 1015 are reserved for local use and never appear on the wire.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 1012..=1014 | 3000..=4999)
}

/// A close payload that fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClosePayloadError {
    #[error("close payload of one byte")]
    Truncated,

    #[error("invalid close code {0}")]
    InvalidCode(u16),

    #[error("close reason is not valid UTF-8")]
    InvalidReason,
}

impl ClosePayloadError {
    pub fn close_code(&self) -> u16 {
        match self {
            ClosePayloadError::InvalidReason => CloseCode::INVALID_PAYLOAD,
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }
}

/// Parse a close payload into an optional code and a reason.
///
/// An empty payload carries no code.
pub fn parse_close_payload(payload: &[u8]) -> Result<(Option<u16>, String), ClosePayloadError> {
    match payload.len() {
        0 => Ok((None, String::new())),
        1 => Err(ClosePayloadError::Truncated),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(ClosePayloadError::InvalidCode(code));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ClosePayloadError::InvalidReason)?;
            Ok((Some(code), reason.to_string()))
        }
    }
}

/// Build a close payload. The reason is cut to 123 bytes (on a character
/// boundary) so the payload fits a control frame.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normal() {
        let (code, reason) = parse_close_payload(&[0x03, 0xE8, b'o', b'k']).unwrap();
        assert_eq!(code, Some(1000));
        assert_eq!(reason, "ok");
    }

    #[test]
    fn parse_empty() {
        assert_eq!(parse_close_payload(&[]).unwrap(), (None, String::new()));
    }

    #[test]
    fn parse_rejects_bad_payloads() {
        assert_eq!(parse_close_payload(&[0x03]), Err(ClosePayloadError::Truncated));
        assert_eq!(
            parse_close_payload(&1005u16.to_be_bytes()),
            Err(ClosePayloadError::InvalidCode(1005))
        );
        assert_eq!(
            parse_close_payload(&[0x03, 0xE8, 0xff, 0xfe]),
            Err(ClosePayloadError::InvalidReason)
        );
        assert_eq!(ClosePayloadError::Truncated.close_code(), 1002);
        assert_eq!(ClosePayloadError::InvalidReason.close_code(), 1007);
    }

    #[test]
    fn valid_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4999] {
            assert!(is_valid_close_code(code), "{code}");
        }
        for code in [0, 999, 1004, 1005, 1006, 1015, 2000, 5000] {
            assert!(!is_valid_close_code(code), "{code}");
        }
    }

    #[test]
    fn build_truncates_reason() {
        let payload = build_close_payload(1000, &"x".repeat(200));
        assert_eq!(payload.len(), 125);

        let payload = build_close_payload(1001, &"é".repeat(100));
        assert!(payload.len() <= 125);
        assert!(std::str::from_utf8(&payload[2..]).is_ok());
    }
}
