//! permessage-deflate negotiation (RFC 7692 Section 7).
//!
//! # Responsibilities
//! - Tokenize `sec-websocket-extensions` values
//! - Parse comma-separated offers and their semicolon-separated parameters
//! - Accept the first valid `permessage-deflate` offer
//!
//! # Design Decisions
//! - An offer with an unknown, duplicate or malformed parameter is skipped and
//!   the next offer is tried, instead of failing the whole header
//! - Quoted parameter values are accepted and unquoted before validation
//! - `server_max_window_bits=8` makes the offer unacceptable: the echoed value
//!   must not exceed the offer, and the encoder cannot go below 9

use crate::http::parse::is_token_char;

/// Extension token for per-message compression.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Largest (and default) LZ77 window size.
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Smallest window the server's raw-DEFLATE encoder can honour; zlib has no
/// 8-bit raw window.
pub const MIN_SERVER_WINDOW_BITS: u8 = 9;

/// Smallest window a client may announce for its own deflater.
const MIN_CLIENT_WINDOW_BITS: u8 = 8;

/// Agreed permessage-deflate parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateConfig {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    /// `Some(15)` when the client sent the parameter without a value.
    pub client_max_window_bits: Option<u8>,
}

impl DeflateConfig {
    /// Window size for outgoing messages.
    pub fn server_window_bits(&self) -> u8 {
        self.server_max_window_bits.unwrap_or(DEFAULT_WINDOW_BITS)
    }

    /// Value for the `sec-websocket-extensions` response header.
    pub fn response_header(&self) -> String {
        let mut header = String::from(PERMESSAGE_DEFLATE);
        if self.server_no_context_takeover {
            header.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            header.push_str("; client_no_context_takeover");
        }
        if let Some(bits) = self.server_max_window_bits {
            header.push_str(&format!("; server_max_window_bits={bits}"));
        }
        if let Some(bits) = self.client_max_window_bits {
            header.push_str(&format!("; client_max_window_bits={bits}"));
        }
        header
    }
}

/// Pick the first acceptable permessage-deflate offer from the request's
/// extension header values. Returns `None` when disabled or nothing is acceptable.
pub fn negotiate_compression<'a>(
    header_values: impl IntoIterator<Item = &'a str>,
    enabled: bool,
) -> Option<DeflateConfig> {
    if !enabled {
        return None;
    }
    let mut tokens = Vec::new();
    for value in header_values {
        if !tokens.is_empty() {
            tokens.push(Token::Comma);
        }
        tokenize(value, &mut tokens);
    }
    tokens
        .split(|t| *t == Token::Comma)
        .find_map(parse_offer)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Comma,
    Semicolon,
    Equals,
    Invalid,
}

fn tokenize(input: &str, out: &mut Vec<Token>) {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => i += 1,
            b',' => {
                out.push(Token::Comma);
                i += 1;
            }
            b';' => {
                out.push(Token::Semicolon);
                i += 1;
            }
            b'=' => {
                out.push(Token::Equals);
                i += 1;
            }
            b'"' => {
                i += 1;
                let mut value = String::new();
                let mut closed = false;
                while i < bytes.len() {
                    match bytes[i] {
                        b'"' => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        b'\\' if i + 1 < bytes.len() => {
                            value.push(bytes[i + 1] as char);
                            i += 2;
                        }
                        b',' => break,
                        b => {
                            value.push(b as char);
                            i += 1;
                        }
                    }
                }
                out.push(if closed { Token::Quoted(value) } else { Token::Invalid });
            }
            b if is_token_char(b) => {
                let start = i;
                while i < bytes.len() && is_token_char(bytes[i]) {
                    i += 1;
                }
                out.push(Token::Word(input[start..i].to_string()));
            }
            _ => {
                out.push(Token::Invalid);
                i += 1;
            }
        }
    }
}

/// Parse one offer: `name *( ";" param [ "=" value ] )`.
fn parse_offer(tokens: &[Token]) -> Option<DeflateConfig> {
    let (name, mut rest) = match tokens.split_first()? {
        (Token::Word(name), rest) => (name, rest),
        _ => return None,
    };
    if !name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE) {
        return None;
    }

    let mut config = DeflateConfig {
        server_no_context_takeover: false,
        client_no_context_takeover: false,
        server_max_window_bits: None,
        client_max_window_bits: None,
    };
    let mut seen: Vec<&str> = Vec::new();

    while let Some((first, after)) = rest.split_first() {
        if *first != Token::Semicolon {
            return None;
        }
        let (param, value, remaining) = parse_param(after)?;
        rest = remaining;

        if seen.contains(&param) {
            return None;
        }
        seen.push(param);

        match param {
            "server_no_context_takeover" if value.is_none() => {
                config.server_no_context_takeover = true
            }
            "client_no_context_takeover" if value.is_none() => {
                config.client_no_context_takeover = true
            }
            "server_max_window_bits" => {
                config.server_max_window_bits =
                    Some(parse_window_bits(value?, MIN_SERVER_WINDOW_BITS)?);
            }
            "client_max_window_bits" => {
                config.client_max_window_bits = Some(match value {
                    Some(v) => parse_window_bits(v, MIN_CLIENT_WINDOW_BITS)?,
                    None => DEFAULT_WINDOW_BITS,
                });
            }
            _ => return None,
        }
    }
    Some(config)
}

/// Parse `name [ "=" value ]`, returning the remaining tokens.
fn parse_param(tokens: &[Token]) -> Option<(&str, Option<&str>, &[Token])> {
    let (name, rest) = match tokens.split_first()? {
        (Token::Word(name), rest) => (name.as_str(), rest),
        _ => return None,
    };
    match rest.split_first() {
        Some((Token::Equals, after)) => match after.split_first()? {
            (Token::Word(v) | Token::Quoted(v), rest) => Some((name, Some(v.as_str()), rest)),
            _ => None,
        },
        _ => Some((name, None, rest)),
    }
}

fn parse_window_bits(value: &str, min: u8) -> Option<u8> {
    if value.is_empty() || value.len() > 2 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let bits: u8 = value.parse().ok()?;
    (min..=DEFAULT_WINDOW_BITS).contains(&bits).then_some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiate(value: &str) -> Option<DeflateConfig> {
        negotiate_compression([value], true)
    }

    #[test]
    fn plain_offer() {
        let config = negotiate("permessage-deflate").unwrap();
        assert_eq!(config.server_window_bits(), 15);
        assert_eq!(config.response_header(), "permessage-deflate");
    }

    #[test]
    fn all_parameters() {
        let config = negotiate(
            "permessage-deflate; server_no_context_takeover; client_no_context_takeover; \
             server_max_window_bits=10; client_max_window_bits",
        )
        .unwrap();
        assert!(config.server_no_context_takeover);
        assert!(config.client_no_context_takeover);
        assert_eq!(config.server_max_window_bits, Some(10));
        assert_eq!(config.client_max_window_bits, Some(15));
        assert_eq!(
            config.response_header(),
            "permessage-deflate; server_no_context_takeover; client_no_context_takeover; \
             server_max_window_bits=10; client_max_window_bits=15"
        );
    }

    #[test]
    fn quoted_values() {
        let config = negotiate("permessage-deflate; server_max_window_bits=\"12\"").unwrap();
        assert_eq!(config.server_max_window_bits, Some(12));
    }

    #[test]
    fn malformed_offer_falls_through_to_next() {
        let config = negotiate(
            "permessage-deflate; server_max_window_bits=7, permessage-deflate; client_max_window_bits=9",
        )
        .unwrap();
        assert_eq!(config.server_max_window_bits, None);
        assert_eq!(config.client_max_window_bits, Some(9));
    }

    #[test]
    fn rejected_offers() {
        assert_eq!(negotiate("permessage-deflate; unknown_param"), None);
        assert_eq!(
            negotiate("permessage-deflate; server_no_context_takeover; server_no_context_takeover"),
            None
        );
        assert_eq!(negotiate("permessage-deflate; server_max_window_bits"), None);
        assert_eq!(negotiate("permessage-deflate; server_max_window_bits=16"), None);
        assert_eq!(negotiate("permessage-deflate; client_max_window_bits=abc"), None);
        assert_eq!(negotiate("permessage-deflate; server_no_context_takeover=1"), None);
        assert_eq!(negotiate("x-webkit-deflate-frame"), None);
        assert_eq!(negotiate(""), None);
    }

    #[test]
    fn eight_bit_server_window_skips_offer() {
        assert_eq!(negotiate("permessage-deflate; server_max_window_bits=8"), None);

        let config = negotiate(
            "permessage-deflate; server_max_window_bits=8, permessage-deflate; server_max_window_bits=9",
        )
        .unwrap();
        assert_eq!(config.server_max_window_bits, Some(9));
        assert_eq!(
            config.response_header(),
            "permessage-deflate; server_max_window_bits=9"
        );

        let config = negotiate("permessage-deflate; client_max_window_bits=8").unwrap();
        assert_eq!(config.client_max_window_bits, Some(8));
    }

    #[test]
    fn multiple_header_values() {
        let config = negotiate_compression(
            ["foo; bar=1", "permessage-deflate; client_no_context_takeover"],
            true,
        )
        .unwrap();
        assert!(config.client_no_context_takeover);
    }

    #[test]
    fn disabled_echoes_nothing() {
        assert_eq!(negotiate_compression(["permessage-deflate"], false), None);
    }
}
