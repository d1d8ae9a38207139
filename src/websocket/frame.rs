//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! Stateless encode/decode of single frames.
//!
//! - [`deserialize`] / [`deserialize_with_limit`]: decode one frame from the
//!   front of a buffer, or report that more bytes are needed
//! - [`serialize`]: encode an unmasked server frame
//! - [`apply_mask`]: XOR masking, one 32-bit word at a time

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::websocket::close::CloseCode;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One decoded (unmasked) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// RSV1: set on the first frame of a permessage-deflate compressed message.
    pub compressed: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            compressed: false,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// A close frame; `None` sends an empty payload.
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => crate::websocket::close::build_close_payload(code, reason),
            None => Vec::new(),
        };
        Self::new(OpCode::Close, payload)
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }
}

/// Outcome of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A frame occupying the first `consumed` bytes of the buffer.
    Frame { frame: Frame, consumed: usize },
    /// The buffer does not yet hold a complete frame.
    Incomplete,
}

/// Frame-level protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown opcode 0x{0:X}")]
    UnknownOpcode(u8),

    #[error("reserved bits RSV2/RSV3 set")]
    ReservedBits,

    #[error("fragmented control frame")]
    FragmentedControl,

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLarge(u64),

    #[error("compressed control frame")]
    CompressedControl,

    #[error("64-bit payload length has the most significant bit set")]
    LengthOverflow,

    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: u64, max: u64 },
}

impl FrameError {
    /// Close code sent to the peer for this violation.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::PayloadTooLarge { .. } => CloseCode::MESSAGE_TOO_BIG,
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }
}

/// Decode one frame with no payload size limit.
pub fn deserialize(buf: &[u8]) -> Result<Decoded, FrameError> {
    deserialize_with_limit(buf, 0)
}

/// Decode one frame, rejecting payloads over `max_payload` bytes (0 = unlimited)
/// as soon as the header reveals the length.
pub fn deserialize_with_limit(buf: &[u8], max_payload: u64) -> Result<Decoded, FrameError> {
    if buf.len() < 2 {
        return Ok(Decoded::Incomplete);
    }

    let fin = buf[0] & 0x80 != 0;
    let compressed = buf[0] & 0x40 != 0;
    if buf[0] & 0x30 != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = OpCode::from_u8(buf[0] & 0x0F).ok_or(FrameError::UnknownOpcode(buf[0] & 0x0F))?;
    let masked = buf[1] & 0x80 != 0;

    let (len, mut offset) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(Decoded::Incomplete);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(Decoded::Incomplete);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(FrameError::LengthOverflow);
            }
            (len, 10)
        }
        n => (n as u64, 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControl);
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlTooLarge(len));
        }
        if compressed {
            return Err(FrameError::CompressedControl);
        }
    }
    if max_payload > 0 && len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            len,
            max: max_payload,
        });
    }

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(Decoded::Incomplete);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let available = (buf.len() - offset) as u64;
    if available < len {
        return Ok(Decoded::Incomplete);
    }
    let end = offset + len as usize;

    let payload = match mask {
        Some(key) => {
            let mut data = buf[offset..end].to_vec();
            apply_mask(&mut data, key);
            Bytes::from(data)
        }
        None => Bytes::copy_from_slice(&buf[offset..end]),
    };

    Ok(Decoded::Frame {
        frame: Frame {
            fin,
            compressed,
            opcode,
            payload,
        },
        consumed: end,
    })
}

/// Encode a frame as the server sends it (never masked).
pub fn serialize(frame: &Frame) -> BytesMut {
    encode(frame, None)
}

/// Encode a frame masked with `key`, as a client sends it.
pub fn serialize_masked(frame: &Frame, key: [u8; 4]) -> BytesMut {
    encode(frame, Some(key))
}

fn encode(frame: &Frame, mask: Option<[u8; 4]>) -> BytesMut {
    let len = frame.payload.len();
    let mut out = BytesMut::with_capacity(len + 14);

    let mut first = frame.opcode as u8;
    if frame.fin {
        first |= 0x80;
    }
    if frame.compressed {
        first |= 0x40;
    }
    out.put_u8(first);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len < 126 {
        out.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            out.put_slice(&key);
            let start = out.len();
            out.put_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.put_slice(&frame.payload),
    }
    out
}

/// XOR `payload` with the repeating 4-byte `key`. Applying it twice restores the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);
    let mut chunks = payload.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&value.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i];
    }
}
