//! TOML-based configuration for the dispatch agent.
//!
//! Loads `agent.toml` (or a path given on the command line); every field
//! has a default aimed at a local lab setup, so the agent runs against a
//! server on localhost with no config file at all.

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

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerEndpoint,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub tls: ClientTlsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub limits: AgentLimits,
}

/// Where to dial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEndpoint {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// How the agent introduces itself at registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    /// Label prefix for this agent.  Empty means use the `HOSTNAME`
    /// environment variable, falling back to `"agent"`.
    #[serde(default)]
    pub label: String,
    /// Shared-secret token presented at registration when the server has
    /// authentication enabled.
    #[serde(default)]
    pub auth_token: String,
}

/// Client-side TLS settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientTlsConfig {
    /// When false the agent speaks plaintext TCP (lab use only).
    #[serde(default)]
    pub enabled: bool,
    /// PEM file with the CA (or self-signed server certificate) to trust.
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,
    /// Name the server certificate must be valid for.  Empty means use the
    /// configured host.
    #[serde(default)]
    pub server_name: String,
}

/// Reconnect behaviour.  Delays double on each consecutive failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Connection attempts per connect cycle before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
}

/// Local execution limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentLimits {
    /// Maximum accepted frame payload size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Seconds a shell command may run before the agent kills it and
    /// reports a failure result.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4444
}
fn default_ca_path() -> PathBuf {
    PathBuf::from("server.crt")
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_secs() -> u64 {
    2
}
fn default_max_message_size() -> usize {
    100 * 1024 * 1024
}
fn default_command_timeout_secs() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: ServerEndpoint::default(),
            identity: IdentityConfig::default(),
            tls: ClientTlsConfig::default(),
            retry: RetryConfig::default(),
            limits: AgentLimits::default(),
        }
    }
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            auth_token: String::new(),
        }
    }
}

impl Default for ClientTlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_path: default_ca_path(),
            server_name: String::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_secs: default_initial_delay_secs(),
        }
    }
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl AgentConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.command_timeout_secs)
    }

    /// Label the agent registers under: configured label or `HOSTNAME`,
    /// plus a short random suffix so restarts are distinguishable in the
    /// server's session list.
    pub fn client_label(&self) -> String {
        let base = if self.identity.label.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "agent".to_string())
        } else {
            self.identity.label.clone()
        };
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..4];
        format!("{base}-{suffix}")
    }
}

/// Loads `AgentConfig` from `path`, returning `AgentConfig::default()` if
/// the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load(path: &Path) -> Result<AgentConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: AgentConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AgentConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_target_localhost_4444() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.server_addr(), "127.0.0.1:4444");
        assert!(!cfg.tls.enabled);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.initial_delay_secs, 2);
        assert_eq!(cfg.command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_client_label_uses_configured_prefix() {
        let mut cfg = AgentConfig::default();
        cfg.identity.label = "workstation-7".to_string();

        let label = cfg.client_label();
        assert!(label.starts_with("workstation-7-"));
        assert_eq!(label.len(), "workstation-7-".len() + 4);
    }

    #[test]
    fn test_client_labels_differ_across_calls() {
        let mut cfg = AgentConfig::default();
        cfg.identity.label = "host".to_string();
        assert_ne!(cfg.client_label(), cfg.client_label());
    }

    #[test]
    fn test_partial_toml_overrides_only_named_fields() {
        let toml_str = r#"
[server]
host = "192.0.2.10"

[retry]
max_retries = 5
"#;
        let cfg: AgentConfig = toml::from_str(toml_str).expect("deserialize partial");
        assert_eq!(cfg.server.host, "192.0.2.10");
        assert_eq!(cfg.server.port, 4444);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.initial_delay_secs, 2);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(&dir.path().join("absent.toml")).expect("load missing");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn test_load_malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "[[[ nope").unwrap();
        assert!(matches!(load(&path), Err(ConfigError::Parse(_))));
    }
}
