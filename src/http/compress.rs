//! Response content-coding negotiation and encoders.
//!
//! # Responsibilities
//! - Pick a coding from `accept-encoding` (q-values, `q=0` exclusions, `*` wildcard)
//! - Compress whole bodies and streamed chunks with gzip, deflate or zstd
//!
//! # Design Decisions
//! - Server preference order is gzip, deflate, zstd; `x-gzip` is an alias for gzip
//! - Streaming encoders sync-flush after every chunk so each chunk is decodable
//!   as soon as it arrives

use std::io::{self, Write};

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

/// zstd level used for responses; favours speed like `Compression::default()`.
const ZSTD_LEVEL: i32 = 3;

/// Content codings the server can produce, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
    Zstd,
}

impl ContentCoding {
    const PREFERENCE: [ContentCoding; 3] = [
        ContentCoding::Gzip,
        ContentCoding::Deflate,
        ContentCoding::Zstd,
    ];

    /// Token used in `content-encoding`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
            ContentCoding::Zstd => "zstd",
        }
    }

    fn matches(&self, token: &str) -> bool {
        match self {
            ContentCoding::Gzip => {
                token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip")
            }
            ContentCoding::Deflate => token.eq_ignore_ascii_case("deflate"),
            ContentCoding::Zstd => token.eq_ignore_ascii_case("zstd"),
        }
    }
}

/// Choose a coding for the given `accept-encoding` values.
///
/// The highest q-value wins; ties go to the server's preference order.
/// Returns `None` when nothing acceptable is offered.
pub fn negotiate<'a>(accept_encoding: impl IntoIterator<Item = &'a str>) -> Option<ContentCoding> {
    let mut offers: Vec<(&str, u16)> = Vec::new();
    for item in accept_encoding.into_iter().flat_map(|v| v.split(',')) {
        let mut parts = item.split(';');
        let token = parts.next().map(str::trim).unwrap_or("");
        if token.is_empty() {
            continue;
        }
        let mut quality = Some(1000);
        for param in parts {
            if let Some((name, value)) = param.split_once('=') {
                if name.trim().eq_ignore_ascii_case("q") {
                    quality = parse_qvalue(value.trim());
                }
            }
        }
        if let Some(q) = quality {
            offers.push((token, q));
        }
    }

    let wildcard = offers.iter().find(|(t, _)| *t == "*").map(|(_, q)| *q);
    let mut best: Option<(ContentCoding, u16)> = None;
    for coding in ContentCoding::PREFERENCE {
        let explicit = offers
            .iter()
            .filter(|(t, _)| coding.matches(t))
            .map(|(_, q)| *q)
            .max();
        let q = match explicit.or(wildcard) {
            Some(q) if q > 0 => q,
            _ => continue,
        };
        if best.map_or(true, |(_, best_q)| q > best_q) {
            best = Some((coding, q));
        }
    }
    best.map(|(coding, _)| coding)
}

/// Parse a qvalue into thousandths. Invalid values yield `None`.
fn parse_qvalue(text: &str) -> Option<u16> {
    let (whole, frac) = match text.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (text, ""),
    };
    if frac.len() > 3 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let whole = match whole {
        "0" => 0u16,
        "1" => 1u16,
        _ => return None,
    };
    let mut thousandths = 0u16;
    for (i, b) in frac.bytes().enumerate() {
        thousandths += (b - b'0') as u16 * [100, 10, 1][i];
    }
    let q = whole * 1000 + thousandths;
    (q <= 1000).then_some(q)
}

/// Compress a complete body.
pub fn compress(coding: ContentCoding, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = StreamEncoder::new(coding)?;
    let mut out = encoder.encode(data)?;
    out.extend(encoder.finish()?);
    Ok(out)
}

/// Incremental encoder for streamed bodies.
pub struct StreamEncoder {
    inner: Encoder,
}

enum Encoder {
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl StreamEncoder {
    pub fn new(coding: ContentCoding) -> io::Result<Self> {
        let inner = match coding {
            ContentCoding::Gzip => Encoder::Gzip(GzEncoder::new(Vec::new(), Compression::default())),
            ContentCoding::Deflate => {
                Encoder::Deflate(ZlibEncoder::new(Vec::new(), Compression::default()))
            }
            ContentCoding::Zstd => {
                Encoder::Zstd(zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL)?)
            }
        };
        Ok(Self { inner })
    }

    /// Compress one chunk and sync-flush, returning the bytes produced so far.
    pub fn encode(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match &mut self.inner {
            Encoder::Gzip(enc) => {
                enc.write_all(chunk)?;
                enc.flush()?;
                Ok(std::mem::take(enc.get_mut()))
            }
            Encoder::Deflate(enc) => {
                enc.write_all(chunk)?;
                enc.flush()?;
                Ok(std::mem::take(enc.get_mut()))
            }
            Encoder::Zstd(enc) => {
                enc.write_all(chunk)?;
                enc.flush()?;
                Ok(std::mem::take(enc.get_mut()))
            }
        }
    }

    /// Finish the stream, returning the trailing bytes.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        match self.inner {
            Encoder::Gzip(enc) => enc.finish(),
            Encoder::Deflate(enc) => enc.finish(),
            Encoder::Zstd(enc) => enc.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::{GzDecoder, ZlibDecoder};
    use std::io::Read;

    #[test]
    fn prefers_gzip_on_tie() {
        assert_eq!(negotiate(["deflate, gzip"]), Some(ContentCoding::Gzip));
    }

    #[test]
    fn honors_q_values() {
        assert_eq!(
            negotiate(["gzip;q=0.5, deflate;q=0.8"]),
            Some(ContentCoding::Deflate)
        );
        assert_eq!(negotiate(["gzip;q=0, deflate"]), Some(ContentCoding::Deflate));
        assert_eq!(negotiate(["gzip;q=0"]), None);
    }

    #[test]
    fn wildcard_and_alias() {
        assert_eq!(negotiate(["*"]), Some(ContentCoding::Gzip));
        assert_eq!(negotiate(["*;q=0.1, gzip;q=0"]), Some(ContentCoding::Deflate));
        assert_eq!(negotiate(["x-gzip"]), Some(ContentCoding::Gzip));
    }

    #[test]
    fn nothing_acceptable() {
        assert_eq!(negotiate(["br, compress"]), None);
        assert_eq!(negotiate(["identity"]), None);
        assert_eq!(negotiate(Vec::<&str>::new()), None);
    }

    #[test]
    fn malformed_q_values_skip_entry() {
        assert_eq!(negotiate(["gzip;q=2, deflate"]), Some(ContentCoding::Deflate));
        assert_eq!(parse_qvalue("0.125"), Some(125));
        assert_eq!(parse_qvalue("1.000"), Some(1000));
        assert_eq!(parse_qvalue("1.5"), None);
        assert_eq!(parse_qvalue("0.1234"), None);
    }

    #[test]
    fn zstd_ranks_after_deflate() {
        assert_eq!(negotiate(["zstd"]), Some(ContentCoding::Zstd));
        assert_eq!(negotiate(["zstd, deflate"]), Some(ContentCoding::Deflate));
        assert_eq!(negotiate(["zstd, gzip;q=0.5"]), Some(ContentCoding::Zstd));
        assert_eq!(negotiate(["*;q=0.5, gzip;q=0, deflate;q=0"]), Some(ContentCoding::Zstd));
    }

    #[test]
    fn zstd_body_decodes() {
        let body = b"zstandard zstandard zstandard".repeat(30);
        let compressed = compress(ContentCoding::Zstd, &body).unwrap();
        assert!(compressed.len() < body.len());
        assert_eq!(zstd::stream::decode_all(&compressed[..]).unwrap(), body);
    }

    #[test]
    fn zstd_streamed_chunks_decode() {
        let mut encoder = StreamEncoder::new(ContentCoding::Zstd).unwrap();
        let mut wire = encoder.encode(b"alpha ").unwrap();
        assert!(!wire.is_empty());
        wire.extend(encoder.encode(b"beta").unwrap());
        wire.extend(encoder.finish().unwrap());
        assert_eq!(zstd::stream::decode_all(&wire[..]).unwrap(), b"alpha beta");
    }

    #[test]
    fn gzip_body_decodes() {
        let body = b"hello hello hello hello".repeat(20);
        let compressed = compress(ContentCoding::Gzip, &body).unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn streamed_chunks_decode_as_one_stream() {
        let mut encoder = StreamEncoder::new(ContentCoding::Deflate).unwrap();
        let mut wire = encoder.encode(b"first chunk, ").unwrap();
        assert!(!wire.is_empty());
        wire.extend(encoder.encode(b"second chunk").unwrap());
        wire.extend(encoder.finish().unwrap());

        let mut decoded = String::new();
        ZlibDecoder::new(&wire[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "first chunk, second chunk");
    }
}
