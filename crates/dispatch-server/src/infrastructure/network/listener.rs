//! Accept loop for agent connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::application::sessions::SessionRegistry;
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::network::handler::run_connection;
use crate::infrastructure::storage::config::ServerConfig;

/// Accepts connections until shutdown is signalled, spawning one handler
/// task per connection.
///
/// Connections beyond the session capacity are dropped at accept time;
/// registration re-checks capacity under the registry lock, so this check
/// is only an early refusal, not the enforcement point.
pub async fn run_listener(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<SessionRegistry>,
    logs: Arc<EventLog>,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("listener stopping");
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        if registry.live_count() >= config.limits.max_sessions {
                            warn!(peer = %peer_addr, "at capacity, refusing connection");
                            logs.main().record(&format!(
                                "refused connection from {peer_addr}: at capacity"
                            ));
                            drop(stream);
                            continue;
                        }
                        tokio::spawn(run_connection(
                            stream,
                            peer_addr,
                            acceptor.clone(),
                            Arc::clone(&registry),
                            Arc::clone(&logs),
                            Arc::clone(&config),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        // Transient accept errors (EMFILE and friends); back
                        // off briefly instead of spinning.
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}
