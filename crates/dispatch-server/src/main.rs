//! Dispatch server entry point.
//!
//! Wires together configuration, the session registry, the command router,
//! the agent-facing listener, and the operator console, then drives the
//! graceful-shutdown sequence.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ config::load()           -- TOML config, defaults when absent
//!  └─ EventLog::open()         -- MAIN.log + per-session logs
//!  └─ services
//!       ├─ run_listener        -- accepts agents, one handler task each
//!       ├─ ctrl_c watcher      -- flips the shutdown signal
//!       └─ run_console         -- operator prompt (runs on this task)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dispatch_server::application::dispatch::CommandRouter;
use dispatch_server::application::sessions::SessionRegistry;
use dispatch_server::infrastructure::console::run_console;
use dispatch_server::infrastructure::event_log::EventLog;
use dispatch_server::infrastructure::network::channel::build_acceptor;
use dispatch_server::infrastructure::network::listener::run_listener;
use dispatch_server::infrastructure::storage::config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("dispatch.toml"), PathBuf::from);
    let config = Arc::new(
        config::load(&config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?,
    );

    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("dispatch server starting");

    let logs = Arc::new(
        EventLog::open(&config.logging.directory)
            .with_context(|| format!("opening log directory {}", config.logging.directory.display()))?,
    );

    let acceptor = build_acceptor(&config.tls).context("building TLS acceptor")?;
    if acceptor.is_some() {
        info!("TLS enabled");
    } else {
        warn!("TLS disabled; agent traffic is plaintext");
    }

    let registry = Arc::new(SessionRegistry::new(config.limits.max_sessions));
    let router = Arc::new(CommandRouter::new(
        Arc::clone(&registry),
        config.limits.queue_policy,
    ));

    let bind = format!("{}:{}", config.network.bind_address, config.network.port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding listener on {bind}"))?;
    logs.main().record(&format!("server listening on {bind}"));
    info!(%bind, max_sessions = config.limits.max_sessions, "listening for agents");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    tokio::spawn(run_listener(
        listener,
        acceptor,
        Arc::clone(&registry),
        Arc::clone(&logs),
        Arc::clone(&config),
        shutdown_rx.clone(),
    ));

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = signal_tx.send(true);
        }
    });

    run_console(
        router,
        Arc::clone(&registry),
        Arc::clone(&shutdown_tx),
        shutdown_rx.clone(),
    )
    .await;

    // Console returned: make sure every handler saw the signal, then give
    // sessions a bounded window to drain.
    let _ = shutdown_tx.send(true);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !registry.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !registry.is_empty() {
        warn!(remaining = registry.live_count(), "sessions still open at shutdown deadline");
    }

    logs.main().record("server stopped");
    info!("dispatch server stopped");
    Ok(())
}
