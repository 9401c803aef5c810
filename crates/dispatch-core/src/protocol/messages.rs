//! Typed message envelope for the dispatch wire protocol.
//!
//! Every frame payload is a JSON object with a `type` field selecting one
//! of the variants below. Parsing into the tagged enum happens once at the
//! codec boundary; downstream code never touches untyped JSON.
//!
//! Payload shapes (field names are part of the wire contract):
//!
//! ```json
//! {"type": "registration", "client_id": "...", "timestamp": "...", "auth_token": "..."}
//! {"type": "command", "command": "..."}
//! {"type": "result", "command": "...", "stdout": "...", "stderr": "...",
//!  "return_code": 0, "timestamp": "..."}
//! {"type": "error", "message": "..."}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Size of the big-endian length prefix preceding every payload.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default ceiling on a single payload: 100 MiB.
///
/// The 4-byte prefix could in principle describe up to 4 GiB; the practical
/// bound is enforced explicitly by the codec so a malicious or buggy peer
/// cannot make the server buffer arbitrary amounts of memory.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// One protocol message, discriminated by the JSON `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Sent once, agent to server, before any other message.
    Registration(RegistrationMessage),
    /// Server to agent.
    Command(CommandMessage),
    /// Agent to server, exactly one per command, in response order.
    Result(ResultMessage),
    /// Either direction; describes a protocol-level failure.
    Error(ErrorMessage),
}

impl WireMessage {
    /// Short name of the `type` tag, for log lines.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Registration(_) => "registration",
            Self::Command(_) => "command",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
        }
    }
}

/// Agent self-identification, sent immediately after the channel is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationMessage {
    /// Human-readable identity supplied by the agent. Not trusted as
    /// unique; the server assigns its own session identifier.
    pub client_id: String,
    /// Agent-local time of registration (ISO-8601).
    pub timestamp: DateTime<Utc>,
    /// Shared-secret token, checked when authentication is enabled.
    /// Absent or empty when the deployment runs without authentication.
    #[serde(default)]
    pub auth_token: String,
}

/// One command line for the agent to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
}

/// Execution outcome for one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Echo of the command this result answers.
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    /// Agent-local completion time (ISO-8601).
    pub timestamp: DateTime<Utc>,
}

/// Protocol-level failure report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
