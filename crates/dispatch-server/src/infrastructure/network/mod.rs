//! TCP listener, per-connection handler, and the TLS channel layer.

pub mod channel;
pub mod handler;
pub mod listener;
