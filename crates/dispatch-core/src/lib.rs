//! # dispatch-core
//!
//! Shared library for the dispatch system containing the wire protocol
//! messages, the length-prefixed frame codec, and the framed transport
//! used on both ends of a connection.
//!
//! This crate is used by both the server and the agent. It holds no
//! session state and makes no policy decisions; everything here is pure
//! byte-level plumbing plus the typed message envelope.
//!
//! - **`protocol`** – How bytes travel over the network. Each frame is a
//!   4-byte big-endian length prefix followed by a UTF-8 JSON payload,
//!   decoded into a typed [`WireMessage`] at the boundary.
//!
//! - **`transport`** – A thin async wrapper that drives the codec over
//!   any `AsyncRead + AsyncWrite` stream, handling partial reads and
//!   end-of-stream detection.

pub mod protocol;
pub mod transport;

pub use protocol::codec::{encode_frame, FrameDecoder, FrameError};
pub use protocol::messages::{
    CommandMessage, ErrorMessage, RegistrationMessage, ResultMessage, WireMessage,
    DEFAULT_MAX_MESSAGE_SIZE, LENGTH_PREFIX_SIZE,
};
pub use transport::{FramedStream, TransportError};
