//! Protocol module containing the message envelope and the frame codec.

pub mod codec;
pub mod messages;

pub use codec::{encode_frame, FrameDecoder, FrameError};
pub use messages::*;
