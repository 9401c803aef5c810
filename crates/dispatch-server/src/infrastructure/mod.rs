//! Infrastructure layer: everything that touches the outside world.
//!
//! Network acceptance and per-connection handling, TOML configuration,
//! the on-disk event log, and the interactive operator console live here.
//! The application layer above knows none of these details; it sees only
//! the session registry and the command router.

pub mod console;
pub mod event_log;
pub mod network;
pub mod storage;
