//! Per-connection session handler.
//!
//! One task per accepted connection owns that connection's socket and its
//! registry entry for the whole lifetime of the session: registration,
//! authentication, serving operator commands, and teardown.  Nothing else
//! ever reads or writes the socket, so command/result pairing is enforced
//! by construction.
//!
//! Commands arrive on a capacity-1 channel from the router.  The handler
//! serves them strictly one at a time: send the command frame, then wait
//! for the matching result, a timeout, a disconnect, or shutdown.  A
//! timeout resolves the operator's wait but keeps the session; a late
//! result for a timed-out command is logged and dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use dispatch_core::protocol::messages::{CommandMessage, ErrorMessage, WireMessage};
use dispatch_core::transport::FramedStream;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::application::dispatch::{CommandReply, CommandRequest};
use crate::application::sessions::{SessionId, SessionRegistry};
use crate::infrastructure::event_log::{EventLog, EventSink};
use crate::infrastructure::network::channel::{secure_accept, SecureStream};
use crate::infrastructure::storage::config::ServerConfig;

/// How one served command left the session.
enum CommandEnd {
    /// Command resolved; keep serving this session.
    Continue,
    /// The connection is no longer usable.
    Close(String),
    /// Server shutdown was observed mid-command.
    Shutdown,
}

/// Drives one agent connection from accept to teardown.
///
/// Spawned per connection; all failures are handled internally because
/// nobody joins this task.
pub async fn run_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<SessionRegistry>,
    logs: Arc<EventLog>,
    config: Arc<ServerConfig>,
    shutdown: watch::Receiver<bool>,
) {
    let stream = match secure_accept(stream, acceptor.as_ref()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
            return;
        }
    };

    // The accept-time capacity check races against other connections, so
    // registration re-checks under the registry lock.
    let id = match registry.create_pending(peer_addr) {
        Ok(id) => id,
        Err(e) => {
            info!(peer = %peer_addr, error = %e, "refusing connection");
            return;
        }
    };

    let sink = match logs.session(id) {
        Ok(sink) => sink,
        Err(e) => {
            warn!(session = %id, error = %e, "could not open session log");
            registry.remove(id);
            return;
        }
    };

    let framed = FramedStream::new(stream, config.limits.max_message_size);
    if let Err(reason) = serve_session(
        id,
        peer_addr,
        framed,
        &registry,
        &logs,
        &sink,
        &config,
        shutdown,
    )
    .await
    {
        debug!(session = %id, reason = %reason, "session ended");
    }

    registry.remove(id);
    logs.main().record(&format!("session {id} closed"));
    info!(session = %id, peer = %peer_addr, "session closed");
}

#[allow(clippy::too_many_arguments)]
async fn serve_session(
    id: SessionId,
    peer_addr: SocketAddr,
    mut framed: FramedStream<SecureStream>,
    registry: &SessionRegistry,
    logs: &EventLog,
    sink: &EventSink,
    config: &ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    if let Err(e) = registry.begin_authentication(id) {
        return Err(e.to_string());
    }

    // First frame must be a registration, within the deadline.
    let registration = match timeout(config.limits.registration_timeout(), framed.recv()).await {
        Ok(Ok(Some(WireMessage::Registration(r)))) => r,
        Ok(Ok(Some(other))) => {
            let _ = framed
                .send(&WireMessage::Error(ErrorMessage {
                    message: format!("expected registration, got {}", other.type_name()),
                }))
                .await;
            return Err(format!("first frame was {}", other.type_name()));
        }
        Ok(Ok(None)) => return Err("closed before registration".to_string()),
        Ok(Err(e)) => return Err(format!("registration recv failed: {e}")),
        Err(_) => return Err("registration timed out".to_string()),
    };

    if config.auth.enabled && registration.auth_token != config.auth.shared_token {
        logs.main().record(&format!(
            "authentication failure from {peer_addr} (client {:?})",
            registration.client_id
        ));
        warn!(session = %id, peer = %peer_addr, "authentication failure");
        let _ = framed
            .send(&WireMessage::Error(ErrorMessage {
                message: "authentication failed".to_string(),
            }))
            .await;
        let _ = framed.shutdown().await;
        return Err("authentication failure".to_string());
    }

    let (command_tx, mut command_rx) = mpsc::channel::<CommandRequest>(1);
    if let Err(e) = registry.promote(id, registration.client_id.clone(), command_tx) {
        return Err(e.to_string());
    }

    logs.main().record(&format!(
        "session {id} registered: {} from {peer_addr}",
        registration.client_id
    ));
    sink.record(&format!(
        "registered as {} from {peer_addr}",
        registration.client_id
    ));
    info!(session = %id, client = %registration.client_id, peer = %peer_addr, "session active");

    let end = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender also means the server is going away.
                if changed.is_err() || *shutdown.borrow() {
                    break CommandEnd::Shutdown;
                }
            }
            request = command_rx.recv() => {
                match request {
                    Some(request) => {
                        match serve_command(id, &mut framed, registry, sink, config, &mut shutdown, request).await {
                            CommandEnd::Continue => {}
                            end => break end,
                        }
                    }
                    // Router side gone; treat as shutdown.
                    None => break CommandEnd::Shutdown,
                }
            }
            frame = framed.recv() => {
                match frame {
                    Ok(Some(msg)) => {
                        registry.touch(id);
                        debug!(session = %id, kind = msg.type_name(), "unsolicited frame ignored");
                    }
                    Ok(None) => break CommandEnd::Close("peer disconnected".to_string()),
                    Err(e) => break CommandEnd::Close(format!("recv failed: {e}")),
                }
            }
        }
    };

    registry.mark_closing(id);

    match end {
        CommandEnd::Shutdown => {
            // Resolve anything the router managed to enqueue before it saw
            // the channel close.
            command_rx.close();
            while let Ok(request) = command_rx.try_recv() {
                let _ = request.reply.send(CommandReply::ShuttingDown);
            }
            sink.record("session closing: server shutdown");
            let _ = framed.shutdown().await;
            Err("server shutdown".to_string())
        }
        CommandEnd::Close(reason) => {
            sink.record(&format!("session closing: {reason}"));
            Err(reason)
        }
        CommandEnd::Continue => Ok(()),
    }
}

/// Serves exactly one command: send it, then wait for the matching result.
async fn serve_command(
    id: SessionId,
    framed: &mut FramedStream<SecureStream>,
    registry: &SessionRegistry,
    sink: &EventSink,
    config: &ServerConfig,
    shutdown: &mut watch::Receiver<bool>,
    request: CommandRequest,
) -> CommandEnd {
    sink.record(&format!("command: {}", request.command));

    let frame = WireMessage::Command(CommandMessage {
        command: request.command.clone(),
    });
    if framed.send(&frame).await.is_err() {
        // Reply slot dropped unresolved signals the session died.
        drop(request.reply);
        return CommandEnd::Close("send failed".to_string());
    }

    let deadline = tokio::time::sleep(config.limits.command_timeout());
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => {
                sink.record(&format!(
                    "timeout after {}s waiting for: {}",
                    config.limits.command_timeout_secs, request.command
                ));
                warn!(session = %id, command = %request.command, "command timed out");
                let _ = request.reply.send(CommandReply::Timeout);
                return CommandEnd::Continue;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = request.reply.send(CommandReply::ShuttingDown);
                    return CommandEnd::Shutdown;
                }
            }
            frame = framed.recv() => {
                match frame {
                    Ok(Some(WireMessage::Result(result))) => {
                        registry.touch(id);
                        // A result must answer the command in flight.  A
                        // mismatch is the late result of an earlier command
                        // that already timed out; pairing it with the
                        // current request would hand the operator the wrong
                        // output, so it is discarded and the wait continues.
                        if result.command != request.command {
                            sink.record(&format!(
                                "discarded stale result (rc {}): {}",
                                result.return_code, result.command
                            ));
                            debug!(
                                session = %id,
                                stale = %result.command,
                                awaiting = %request.command,
                                "stale result discarded"
                            );
                            continue;
                        }
                        sink.record(&format!(
                            "result (rc {}): {}", result.return_code, result.command
                        ));
                        let _ = request.reply.send(CommandReply::Completed(result));
                        return CommandEnd::Continue;
                    }
                    Ok(Some(WireMessage::Error(e))) => {
                        registry.touch(id);
                        sink.record(&format!("agent error: {}", e.message));
                        let _ = request.reply.send(CommandReply::Completed(
                            dispatch_core::protocol::messages::ResultMessage {
                                command: request.command.clone(),
                                stdout: String::new(),
                                stderr: e.message,
                                return_code: -1,
                                timestamp: Utc::now(),
                            },
                        ));
                        return CommandEnd::Continue;
                    }
                    Ok(Some(other)) => {
                        registry.touch(id);
                        debug!(session = %id, kind = other.type_name(), "unexpected frame while awaiting result");
                    }
                    Ok(None) => {
                        drop(request.reply);
                        return CommandEnd::Close("peer disconnected mid-command".to_string());
                    }
                    Err(e) => {
                        drop(request.reply);
                        return CommandEnd::Close(format!("recv failed mid-command: {e}"));
                    }
                }
            }
        }
    }
}
