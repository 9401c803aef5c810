//! Infrastructure layer: configuration and the server connection.

pub mod config;
pub mod connection;
