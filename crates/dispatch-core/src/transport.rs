//! Framed transport: drives the codec over an async byte stream.
//!
//! [`FramedStream`] pairs any `AsyncRead + AsyncWrite` stream with a
//! [`FrameDecoder`], turning a raw connection into a message pipe. The
//! server hands it a plain or TLS-wrapped TCP stream; the agent does the
//! same on its side. Session logic lives entirely above this layer.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::protocol::codec::{encode_frame, FrameDecoder, FrameError};
use crate::protocol::messages::WireMessage;

/// Read chunk size. Frames larger than this are assembled across reads
/// by the decoder's accumulation buffer.
const READ_CHUNK_SIZE: usize = 4096;

/// Errors surfaced by the framed transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A bidirectional message pipe over a byte stream.
pub struct FramedStream<S> {
    stream: S,
    decoder: FrameDecoder,
    max_message_size: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    pub fn new(stream: S, max_message_size: usize) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(max_message_size),
            max_message_size,
        }
    }

    /// Encodes and writes one message, flushing the stream.
    ///
    /// # Errors
    ///
    /// [`TransportError::Frame`] if the message exceeds the size bound,
    /// [`TransportError::Io`] on a write failure.
    pub async fn send(&mut self, msg: &WireMessage) -> Result<(), TransportError> {
        let frame = encode_frame(msg, self.max_message_size)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        trace!(msg_type = msg.type_name(), bytes = frame.len(), "frame sent");
        Ok(())
    }

    /// Reads until one complete message is available.
    ///
    /// Returns `Ok(None)` when the peer closes the stream at a frame
    /// boundary. A close in the middle of a frame is reported as
    /// [`FrameError::TruncatedFrame`].
    ///
    /// Cancel-safe: bytes already received are retained in the decoder's
    /// accumulation buffer, so a cancelled `recv` loses nothing.
    ///
    /// # Errors
    ///
    /// [`TransportError::Frame`] on an oversize or malformed frame,
    /// [`TransportError::Io`] on a read failure.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(msg) = self.decoder.try_decode()? {
                trace!(msg_type = msg.type_name(), "frame received");
                return Ok(Some(msg));
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.decoder.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::TruncatedFrame {
                    buffered: self.decoder.buffered(),
                }
                .into());
            }
            self.decoder.extend(&chunk[..n]);
        }
    }

    /// Shuts down the write side, signalling end-of-stream to the peer.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{
        CommandMessage, ResultMessage, DEFAULT_MAX_MESSAGE_SIZE,
    };
    use tokio::io::duplex;

    fn command(text: &str) -> WireMessage {
        WireMessage::Command(CommandMessage {
            command: text.to_string(),
        })
    }

    #[tokio::test]
    async fn test_send_then_recv_delivers_the_message() {
        let (a, b) = duplex(256);
        let mut left = FramedStream::new(a, DEFAULT_MAX_MESSAGE_SIZE);
        let mut right = FramedStream::new(b, DEFAULT_MAX_MESSAGE_SIZE);

        left.send(&command("echo ok")).await.unwrap();
        let received = right.recv().await.unwrap();
        assert_eq!(received, Some(command("echo ok")));
    }

    #[tokio::test]
    async fn test_recv_reassembles_frame_larger_than_read_chunk() {
        // 64 KiB of stdout forces multiple reads through the 4 KiB chunk.
        let big = WireMessage::Result(ResultMessage {
            command: "cat big".to_string(),
            stdout: "y".repeat(64 * 1024),
            stderr: String::new(),
            return_code: 0,
            timestamp: chrono::Utc::now(),
        });

        let (a, b) = duplex(128 * 1024);
        let mut left = FramedStream::new(a, DEFAULT_MAX_MESSAGE_SIZE);
        let mut right = FramedStream::new(b, DEFAULT_MAX_MESSAGE_SIZE);

        left.send(&big).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Some(big));
    }

    #[tokio::test]
    async fn test_clean_close_at_frame_boundary_yields_none() {
        let (a, b) = duplex(256);
        let mut left = FramedStream::new(a, DEFAULT_MAX_MESSAGE_SIZE);
        let mut right = FramedStream::new(b, DEFAULT_MAX_MESSAGE_SIZE);

        left.send(&command("last")).await.unwrap();
        left.shutdown().await.unwrap();
        drop(left);

        assert_eq!(right.recv().await.unwrap(), Some(command("last")));
        assert!(right.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_frame_is_truncated_frame() {
        let (a, b) = duplex(256);
        let mut right = FramedStream::new(b, DEFAULT_MAX_MESSAGE_SIZE);

        // Hand-write a prefix declaring 100 bytes, then close after 3.
        let mut writer = a;
        writer.write_all(&100u32.to_be_bytes()).await.unwrap();
        writer.write_all(b"abc").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        match right.recv().await {
            Err(TransportError::Frame(FrameError::TruncatedFrame { buffered })) => {
                assert_eq!(buffered, 7);
            }
            other => panic!("expected TruncatedFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversize_frame_terminates_recv_with_error() {
        let (a, b) = duplex(256);
        let mut right = FramedStream::new(b, 64);

        let mut writer = a;
        writer.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();

        assert!(matches!(
            right.recv().await,
            Err(TransportError::Frame(FrameError::Oversize { .. }))
        ));
    }
}
