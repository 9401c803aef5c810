//! Dispatch server library.
//!
//! The binary in `main.rs` wires these layers together; integration tests
//! drive them through the same public API.

pub mod application;
pub mod infrastructure;
