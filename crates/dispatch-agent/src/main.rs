//! Dispatch agent entry point.
//!
//! Loads configuration, then hands off to the connect/serve/reconnect
//! loop in `infrastructure::connection`.

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dispatch_agent::infrastructure::config;
use dispatch_agent::infrastructure::connection::run_agent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("agent.toml"), PathBuf::from);
    let config = config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    info!(server = %config.server_addr(), "dispatch agent starting");

    run_agent(&config).await?;
    Ok(())
}
