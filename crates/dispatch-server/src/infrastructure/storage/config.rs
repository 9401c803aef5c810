//! TOML-based configuration for the dispatch server.
//!
//! The server loads a single TOML file (path given on the command line,
//! `dispatch.toml` by default) and falls back to built-in defaults when the
//! file does not exist, so a fresh checkout runs without any setup.  Example:
//!
//! ```toml
//! [network]
//! bind_address = "0.0.0.0"
//! port = 4444
//!
//! [limits]
//! max_sessions = 50
//! command_timeout_secs = 30
//!
//! [tls]
//! enabled = true
//! cert_path = "server.crt"
//! key_path = "server.key"
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent from the TOML file.  This lets a
//! partial config file override only what it names and keeps older config
//! files working when new fields are added.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener bind settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// IP address to bind the listener to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port agents connect to.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Capacity and timing limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum number of concurrently connected sessions.  Connections
    /// beyond this are refused at accept time.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Maximum accepted frame payload size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Seconds to wait for a command result before reporting a timeout.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Seconds a new connection has to present its registration frame.
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,
    /// What to do when a command arrives for a session that is still
    /// serving a previous one.
    #[serde(default)]
    pub queue_policy: QueuePolicy,
}

/// Behaviour when the selected session already has a command in flight.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Wait for the in-flight command to finish, then deliver.
    #[default]
    Queue,
    /// Fail the dispatch immediately.
    Reject,
}

/// TLS settings for the agent-facing listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    /// When false the server speaks plaintext TCP (lab use only).
    #[serde(default)]
    pub enabled: bool,
    /// PEM certificate chain presented to agents.
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// PEM private key matching the certificate.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

/// Registration authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// When true, registrations must carry `shared_token` or the
    /// connection is closed.
    #[serde(default)]
    pub enabled: bool,
    /// Token every agent must present at registration.
    #[serde(default)]
    pub shared_token: String,
}

/// Event log and diagnostic log settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Directory holding the main log and per-session log files.
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4444
}
fn default_max_sessions() -> usize {
    50
}
fn default_max_message_size() -> usize {
    100 * 1024 * 1024
}
fn default_command_timeout_secs() -> u64 {
    30
}
fn default_registration_timeout_secs() -> u64 {
    30
}
fn default_cert_path() -> PathBuf {
    PathBuf::from("server.crt")
}
fn default_key_path() -> PathBuf {
    PathBuf::from("server.key")
}
fn default_log_directory() -> PathBuf {
    PathBuf::from("logs")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            limits: LimitsConfig::default(),
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_message_size: default_max_message_size(),
            command_timeout_secs: default_command_timeout_secs(),
            registration_timeout_secs: default_registration_timeout_secs(),
            queue_policy: QueuePolicy::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            shared_token: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            level: default_log_level(),
        }
    }
}

impl LimitsConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads `ServerConfig` from `path`, returning `ServerConfig::default()` if
/// the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: ServerConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
