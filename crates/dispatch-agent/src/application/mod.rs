//! Application layer: what the agent does with a command once it has one.

pub mod execute;
