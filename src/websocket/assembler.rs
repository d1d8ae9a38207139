//! Message reassembly for one WebSocket connection.
//!
//! # Responsibilities
//! - Join fragmented data frames into complete messages
//! - Inflate compressed messages once, after the last fragment
//! - Validate text messages as UTF-8 on the complete payload
//! - Encode outgoing messages, compressing them when negotiated
//!
//! # Data Flow
//! ```text
//! Idle ──data(fin)──▶ emit
//! Idle ──data(!fin)──▶ Accumulating ──continuation(!fin)──▶ Accumulating
//!                           └──continuation(fin)──▶ emit, Idle
//! control frames ──▶ returned as-is, state untouched
//! ```

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::http::handler::Message;
use crate::websocket::close::CloseCode;
use crate::websocket::deflate::{CompressionContext, DeflateError};
use crate::websocket::frame::{Frame, OpCode};

/// A violation that ends the connection with the given close code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (close code {code})")]
pub struct ProtocolViolation {
    pub code: u16,
    pub reason: String,
}

impl ProtocolViolation {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    fn protocol(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::PROTOCOL_ERROR, reason)
    }

    fn too_big(max: usize) -> Self {
        Self::new(
            CloseCode::MESSAGE_TOO_BIG,
            format!("message exceeds {max} bytes"),
        )
    }
}

impl From<DeflateError> for ProtocolViolation {
    fn from(err: DeflateError) -> Self {
        ProtocolViolation::new(err.close_code(), err.to_string())
    }
}

/// What a single frame produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// A fragment was buffered; no message yet.
    Pending,
    /// A complete data message, or a ping/pong.
    Message(Message),
    /// A close frame with its raw payload.
    Close(Bytes),
}

#[derive(Debug)]
enum State {
    Idle,
    Accumulating {
        opcode: OpCode,
        buffer: BytesMut,
        compressed: bool,
    },
}

/// Stateful reassembler; one per connection.
#[derive(Debug)]
pub struct Assembler {
    state: State,
    compression: Option<CompressionContext>,
    max_message_size: usize,
    validate_utf8: bool,
}

impl Assembler {
    /// `max_message_size` of 0 means unlimited.
    pub fn new(
        compression: Option<CompressionContext>,
        max_message_size: usize,
        validate_utf8: bool,
    ) -> Self {
        Self {
            state: State::Idle,
            compression,
            max_message_size,
            validate_utf8,
        }
    }

    /// Whether a fragmented message is in progress.
    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, State::Accumulating { .. })
    }

    /// Feed one decoded frame.
    pub fn push(&mut self, frame: Frame) -> Result<Assembled, ProtocolViolation> {
        match frame.opcode {
            OpCode::Ping => Ok(Assembled::Message(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Assembled::Message(Message::Pong(frame.payload))),
            OpCode::Close => Ok(Assembled::Close(frame.payload)),
            OpCode::Text | OpCode::Binary => {
                if self.is_accumulating() {
                    let kind = if frame.opcode == OpCode::Text { "text" } else { "binary" };
                    return Err(ProtocolViolation::protocol(format!(
                        "unexpected {kind} frame during continuation"
                    )));
                }
                if frame.compressed && self.compression.is_none() {
                    return Err(ProtocolViolation::protocol(
                        "compressed frame without negotiated compression",
                    ));
                }
                if frame.fin {
                    return self.finish(frame.opcode, frame.payload, frame.compressed);
                }
                self.check_size(frame.payload.len())?;
                self.state = State::Accumulating {
                    opcode: frame.opcode,
                    buffer: BytesMut::from(&frame.payload[..]),
                    compressed: frame.compressed,
                };
                Ok(Assembled::Pending)
            }
            OpCode::Continuation => {
                let State::Accumulating { buffer, .. } = &mut self.state else {
                    return Err(ProtocolViolation::protocol("unexpected continuation frame"));
                };
                if frame.compressed {
                    return Err(ProtocolViolation::protocol("compressed continuation frame"));
                }
                buffer.extend_from_slice(&frame.payload);
                let len = buffer.len();
                self.check_size(len)?;
                if !frame.fin {
                    return Ok(Assembled::Pending);
                }

                match std::mem::replace(&mut self.state, State::Idle) {
                    State::Accumulating {
                        opcode,
                        buffer,
                        compressed,
                    } => self.finish(opcode, buffer.freeze(), compressed),
                    State::Idle => Err(ProtocolViolation::protocol("unexpected continuation frame")),
                }
            }
        }
    }

    /// Encode an outgoing message as a single frame, compressing data messages
    /// when the extension was negotiated.
    pub fn encode(&mut self, message: Message) -> Result<Frame, DeflateError> {
        let (opcode, payload) = match message {
            Message::Text(text) => (OpCode::Text, Bytes::from(text)),
            Message::Binary(data) => (OpCode::Binary, data),
            Message::Ping(data) => return Ok(Frame::ping(data)),
            Message::Pong(data) => return Ok(Frame::pong(data)),
        };
        match self.compression.as_mut() {
            Some(ctx) => {
                let compressed = ctx.compress(&payload)?;
                Ok(Frame::new(opcode, compressed).with_compressed(true))
            }
            None => Ok(Frame::new(opcode, payload)),
        }
    }

    fn check_size(&self, len: usize) -> Result<(), ProtocolViolation> {
        if self.max_message_size > 0 && len > self.max_message_size {
            return Err(ProtocolViolation::too_big(self.max_message_size));
        }
        Ok(())
    }

    fn finish(
        &mut self,
        opcode: OpCode,
        payload: Bytes,
        compressed: bool,
    ) -> Result<Assembled, ProtocolViolation> {
        let payload = match (compressed, self.compression.as_mut()) {
            (true, Some(ctx)) => Bytes::from(ctx.decompress(&payload, self.max_message_size)?),
            (true, None) => {
                return Err(ProtocolViolation::protocol(
                    "compressed frame without negotiated compression",
                ))
            }
            (false, _) => payload,
        };
        self.check_size(payload.len())?;

        let message = if opcode == OpCode::Text {
            let text = if self.validate_utf8 {
                String::from_utf8(payload.to_vec()).map_err(|_| {
                    ProtocolViolation::new(CloseCode::INVALID_PAYLOAD, "invalid UTF-8 in text message")
                })?
            } else {
                String::from_utf8_lossy(&payload).into_owned()
            };
            Message::Text(text)
        } else {
            Message::Binary(payload)
        };
        Ok(Assembled::Message(message))
    }
}
