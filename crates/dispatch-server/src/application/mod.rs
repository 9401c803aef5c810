//! Application layer for the dispatch server.
//!
//! Use cases in this layer orchestrate session state and command routing.
//! They contain no network I/O and no file system access; sockets and
//! files live in the `infrastructure` layer and communicate with these
//! types through channels.
//!
//! # Sub-modules
//!
//! - **`sessions`** – The thread-safe session registry: the authoritative
//!   map from session id to session state, with atomic id allocation and
//!   a strict lifecycle state machine.
//!
//! - **`dispatch`** – The command router: resolves the operator's selected
//!   session and places a command into exactly that session's queue.

pub mod dispatch;
pub mod sessions;
