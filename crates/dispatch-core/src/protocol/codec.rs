//! Length-prefixed frame codec for dispatch protocol messages.
//!
//! Wire format:
//! ```text
//! [payload_len:4][payload:N]
//! ```
//! `payload_len` is big-endian and bounds a UTF-8 JSON payload that parses
//! into a [`WireMessage`].
//!
//! Decoding is stream-oriented: a TCP read may deliver the prefix and
//! payload in arbitrary chunks, so [`FrameDecoder`] accumulates bytes and
//! only yields a message once the declared length is fully available.
//! After a message is yielded, bytes belonging to the next frame are
//! preserved in the buffer, so decoding is restartable mid-stream.

use thiserror::Error;

use crate::protocol::messages::{WireMessage, LENGTH_PREFIX_SIZE};

/// Errors that can occur while encoding or decoding a frame.
///
/// Any `FrameError` on the decode path is grounds for terminating the
/// connection: once framing is lost there is no way to resynchronize.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The declared payload length exceeds the configured maximum.
    #[error("frame of {declared} bytes exceeds maximum of {max}")]
    Oversize { declared: usize, max: usize },

    /// The payload is not valid UTF-8 JSON of a known message shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The stream ended partway through a frame.
    #[error("stream closed mid-frame with {buffered} byte(s) buffered")]
    TruncatedFrame { buffered: usize },
}

/// Encodes a message into one wire frame (length prefix + JSON payload).
///
/// # Errors
///
/// Returns [`FrameError::Oversize`] if the serialized payload exceeds
/// `max_message_size`. Serialization itself cannot fail for these types.
pub fn encode_frame(msg: &WireMessage, max_message_size: usize) -> Result<Vec<u8>, FrameError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| FrameError::MalformedPayload(e.to_string()))?;
    if payload.len() > max_message_size {
        return Err(FrameError::Oversize {
            declared: payload.len(),
            max: max_message_size,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder with an internal accumulation buffer.
///
/// Feed raw bytes with [`extend`](Self::extend) as they arrive, then call
/// [`try_decode`](Self::try_decode) until it returns `Ok(None)` (need more
/// data). The decoder enforces the payload size bound *before* the payload
/// arrives, so an oversize declaration is rejected after only 4 bytes.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_message_size,
        }
    }

    /// Appends newly received bytes to the accumulation buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True when no partial frame is buffered (a clean stream boundary).
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode one complete message from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Residual bytes past
    /// the decoded frame stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// [`FrameError::Oversize`] if the declared length exceeds the
    /// configured maximum, [`FrameError::MalformedPayload`] if the payload
    /// is not a valid message.
    pub fn try_decode(&mut self) -> Result<Option<WireMessage>, FrameError> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let declared =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if declared > self.max_message_size {
            return Err(FrameError::Oversize {
                declared,
                max: self.max_message_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + declared;
        if self.buf.len() < total {
            return Ok(None);
        }

        let msg = serde_json::from_slice(&self.buf[LENGTH_PREFIX_SIZE..total])
            .map_err(|e| FrameError::MalformedPayload(e.to_string()))?;
        self.buf.drain(..total);
        Ok(Some(msg))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
