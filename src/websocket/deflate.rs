//! Per-connection permessage-deflate context.
//!
//! Messages are raw DEFLATE streams ending in a sync flush. The trailing
//! `00 00 ff ff` of the flush is stripped on send and re-appended on receive
//! (RFC 7692 Section 7.2). With context takeover the sliding window carries
//! over between messages; `*_no_context_takeover` resets it after each one.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use thiserror::Error;

use crate::websocket::close::CloseCode;
use crate::websocket::extension::DeflateConfig;

const SYNC_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

#[derive(Debug, Error)]
pub enum DeflateError {
    #[error("inflate failed: {0}")]
    Inflate(#[from] flate2::DecompressError),

    #[error("deflate failed: {0}")]
    Deflate(#[from] flate2::CompressError),

    #[error("inflated message exceeds {0} bytes")]
    TooLarge(usize),
}

impl DeflateError {
    pub fn close_code(&self) -> u16 {
        match self {
            DeflateError::Inflate(_) => CloseCode::INVALID_PAYLOAD,
            DeflateError::TooLarge(_) => CloseCode::MESSAGE_TOO_BIG,
            DeflateError::Deflate(_) => CloseCode::INTERNAL_ERROR,
        }
    }
}

/// Inflater and deflater for one connection.
pub struct CompressionContext {
    deflater: Compress,
    inflater: Decompress,
    window_bits: u8,
    reset_deflater: bool,
    reset_inflater: bool,
}

impl std::fmt::Debug for CompressionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionContext")
            .field("window_bits", &self.window_bits)
            .field("reset_deflater", &self.reset_deflater)
            .field("reset_inflater", &self.reset_inflater)
            .finish()
    }
}

impl CompressionContext {
    /// Build the server side of a negotiated extension. The deflater uses
    /// exactly the window announced in the response header; negotiation
    /// never agrees to a window below
    /// [`MIN_SERVER_WINDOW_BITS`](crate::websocket::extension::MIN_SERVER_WINDOW_BITS).
    pub fn new(config: &DeflateConfig) -> Self {
        let window_bits = config.server_window_bits();
        Self {
            deflater: Compress::new_with_window_bits(Compression::default(), false, window_bits),
            inflater: Decompress::new(false),
            window_bits,
            reset_deflater: config.server_no_context_takeover,
            reset_inflater: config.client_no_context_takeover,
        }
    }

    /// LZ77 window of outgoing messages.
    pub fn window_bits(&self) -> u8 {
        self.window_bits
    }

    /// Compress one outgoing message.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, DeflateError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let start = self.deflater.total_in();
        loop {
            let consumed = (self.deflater.total_in() - start) as usize;
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(1024));
            }
            self.deflater
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)?;
            let consumed = (self.deflater.total_in() - start) as usize;
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&SYNC_TAIL) {
            out.truncate(out.len() - SYNC_TAIL.len());
        }
        if self.reset_deflater {
            self.deflater.reset();
        }
        Ok(out)
    }

    /// Inflate one incoming message, failing once the output passes `max_size`
    /// bytes (0 = unlimited).
    pub fn decompress(&mut self, input: &[u8], max_size: usize) -> Result<Vec<u8>, DeflateError> {
        let mut data = Vec::with_capacity(input.len() + SYNC_TAIL.len());
        data.extend_from_slice(input);
        data.extend_from_slice(&SYNC_TAIL);

        let mut out = Vec::with_capacity(input.len().saturating_mul(2) + 64);
        let start = self.inflater.total_in();
        loop {
            let consumed = (self.inflater.total_in() - start) as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(1024));
            }
            let before_in = self.inflater.total_in();
            let before_out = out.len();
            let status =
                self.inflater
                    .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)?;
            if max_size > 0 && out.len() > max_size {
                return Err(DeflateError::TooLarge(max_size));
            }

            let consumed = (self.inflater.total_in() - start) as usize;
            let stalled = self.inflater.total_in() == before_in && out.len() == before_out;
            match status {
                Status::StreamEnd => break,
                _ if consumed == data.len() && out.len() < out.capacity() => break,
                Status::BufError if stalled => break,
                _ => {}
            }
        }

        if self.reset_inflater {
            self.inflater.reset(false);
        }
        Ok(out)
    }
}
