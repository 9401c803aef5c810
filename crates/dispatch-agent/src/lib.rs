//! Dispatch agent library.
//!
//! The agent is deliberately small: it connects out to the configured
//! server, registers itself, then serves one command at a time until the
//! connection drops or the process is stopped.
//!
//! - [`application`] holds command execution.
//! - [`infrastructure`] holds configuration and the server connection.

pub mod application;
pub mod infrastructure;
