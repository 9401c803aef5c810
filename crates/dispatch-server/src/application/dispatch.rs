//! Command router: the operator-facing entry point for issuing commands.
//!
//! The router holds a single selection cursor (there is one operator) and
//! resolves it to exactly one session's command queue on every dispatch.
//! It never iterates sessions and has no broadcast path, which is what
//! guarantees command isolation: a command physically cannot reach any
//! queue other than the one resolved from the cursor.
//!
//! Delivery is request/response: `dispatch` enqueues a [`CommandRequest`]
//! carrying a oneshot reply slot and suspends until the owning connection
//! handler reports a result, a timeout, or shutdown.

use std::sync::{Mutex, PoisonError};
use std::sync::Arc;

use dispatch_core::protocol::messages::ResultMessage;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tracing::debug;

use crate::application::sessions::{SessionId, SessionRegistry};
use crate::infrastructure::storage::config::QueuePolicy;

/// One command in flight from the operator to a specific session.
///
/// The handler resolves the reply slot exactly once; dropping it without
/// replying signals that the session died before a result arrived.
#[derive(Debug)]
pub struct CommandRequest {
    pub command: String,
    pub reply: oneshot::Sender<CommandReply>,
}

/// Handler-side resolution of one command.
#[derive(Debug)]
pub enum CommandReply {
    /// The agent returned a result frame.
    Completed(ResultMessage),
    /// No result arrived within the command timeout. The session stays
    /// active; the command is not retried.
    Timeout,
    /// The server is shutting down; the command was not (fully) served.
    ShuttingDown,
}

/// Operator-visible outcome of a successfully routed dispatch.
#[derive(Debug)]
pub enum DispatchOutcome {
    Completed(ResultMessage),
    Timeout,
}

/// Errors surfaced to the operator. Every `dispatch` call resolves to an
/// explicit outcome or one of these; nothing fails silently.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Nothing is selected, or the selection points at a session that is
    /// no longer in the registry.
    #[error("no active session selected")]
    NoActiveSession,

    /// The id passed to `select` is not in the registry.
    #[error("session {0} not found")]
    UnknownSession(SessionId),

    /// The selected session already has a command in flight and the
    /// configured policy is `reject`.
    #[error("session {0} is busy with another command")]
    SessionBusy(SessionId),

    /// The server is shutting down; the command was not served.
    #[error("server is shutting down")]
    ServerShuttingDown,
}

/// Routes operator commands to the single selected session.
pub struct CommandRouter {
    registry: Arc<SessionRegistry>,
    /// The operator's selection cursor. Global, not per-operator: the
    /// system has exactly one operator.
    selected: Mutex<Option<SessionId>>,
    queue_policy: QueuePolicy,
}

impl CommandRouter {
    pub fn new(registry: Arc<SessionRegistry>, queue_policy: QueuePolicy) -> Self {
        Self {
            registry,
            selected: Mutex::new(None),
            queue_policy,
        }
    }

    /// Records `id` as the session subsequent dispatches go to.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownSession`] if the id is not in the registry.
    pub fn select(&self, id: SessionId) -> Result<(), DispatchError> {
        if self.registry.get(id).is_none() {
            return Err(DispatchError::UnknownSession(id));
        }
        *self.lock_cursor() = Some(id);
        debug!(session = %id, "operator selected session");
        Ok(())
    }

    /// Currently selected session, if any.
    pub fn selected(&self) -> Option<SessionId> {
        *self.lock_cursor()
    }

    /// Sends one command to the selected session and waits for its
    /// resolution.
    ///
    /// With `queue_policy = queue`, a dispatch against a busy session
    /// waits for the in-flight command to finish; with `reject` it fails
    /// immediately with [`DispatchError::SessionBusy`]. Either way the
    /// session only ever sees one command at a time, in order.
    ///
    /// # Errors
    ///
    /// See [`DispatchError`]. A selection pointing at a session that has
    /// since disconnected resolves to `NoActiveSession` and clears the
    /// cursor.
    pub async fn dispatch(
        &self,
        command_text: impl Into<String>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let id = self.selected().ok_or(DispatchError::NoActiveSession)?;
        let Some(sender) = self.registry.command_sender(id) else {
            self.clear_if_selected(id);
            return Err(DispatchError::NoActiveSession);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CommandRequest {
            command: command_text.into(),
            reply: reply_tx,
        };

        match self.queue_policy {
            QueuePolicy::Queue => {
                if sender.send(request).await.is_err() {
                    self.clear_if_selected(id);
                    return Err(DispatchError::NoActiveSession);
                }
            }
            QueuePolicy::Reject => match sender.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => return Err(DispatchError::SessionBusy(id)),
                Err(TrySendError::Closed(_)) => {
                    self.clear_if_selected(id);
                    return Err(DispatchError::NoActiveSession);
                }
            },
        }

        match reply_rx.await {
            Ok(CommandReply::Completed(result)) => Ok(DispatchOutcome::Completed(result)),
            Ok(CommandReply::Timeout) => Ok(DispatchOutcome::Timeout),
            Ok(CommandReply::ShuttingDown) => Err(DispatchError::ServerShuttingDown),
            // Reply slot dropped: the session died mid-command.
            Err(_) => {
                self.clear_if_selected(id);
                Err(DispatchError::NoActiveSession)
            }
        }
    }

    fn clear_if_selected(&self, id: SessionId) {
        let mut cursor = self.lock_cursor();
        if *cursor == Some(id) {
            *cursor = None;
        }
    }

    fn lock_cursor(&self) -> std::sync::MutexGuard<'_, Option<SessionId>> {
        self.selected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn peer() -> std::net::SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    /// Registers an active session backed by a channel the test controls,
    /// standing in for a connection handler.
    fn activate(
        registry: &Arc<SessionRegistry>,
        label: &str,
    ) -> (SessionId, mpsc::Receiver<CommandRequest>) {
        let id = registry.create_pending(peer()).unwrap();
        registry.begin_authentication(id).unwrap();
        let (tx, rx) = mpsc::channel(1);
        registry.promote(id, label.to_string(), tx).unwrap();
        (id, rx)
    }

    fn result_for(command: &str) -> ResultMessage {
        ResultMessage {
            command: command.to_string(),
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            return_code: 0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_selection_is_no_active_session() {
        let registry = Arc::new(SessionRegistry::new(8));
        let router = CommandRouter::new(Arc::clone(&registry), QueuePolicy::Queue);
        assert_eq!(
            router.dispatch("id").await.unwrap_err(),
            DispatchError::NoActiveSession
        );
    }

    #[tokio::test]
    async fn test_select_unknown_session_fails() {
        let registry = Arc::new(SessionRegistry::new(8));
        let router = CommandRouter::new(Arc::clone(&registry), QueuePolicy::Queue);
        let (id, _rx) = activate(&registry, "host-1");
        registry.remove(id);
        assert_eq!(
            router.select(id).unwrap_err(),
            DispatchError::UnknownSession(id)
        );
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_the_selected_session() {
        let registry = Arc::new(SessionRegistry::new(8));
        let router = CommandRouter::new(Arc::clone(&registry), QueuePolicy::Queue);
        let (a, mut rx_a) = activate(&registry, "host-a");
        let (_b, mut rx_b) = activate(&registry, "host-b");

        router.select(a).unwrap();
        let serve = tokio::spawn(async move {
            let request = rx_a.recv().await.expect("host-a must receive the command");
            assert_eq!(request.command, "echo ok");
            let _ = request.reply.send(CommandReply::Completed(result_for("echo ok")));
        });

        let outcome = router.dispatch("echo ok").await.unwrap();
        serve.await.unwrap();
        match outcome {
            DispatchOutcome::Completed(result) => assert_eq!(result.stdout, "ok\n"),
            DispatchOutcome::Timeout => panic!("expected a completed result"),
        }

        // The unselected session's queue must have seen nothing.
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_reply_surfaces_as_timeout_outcome() {
        let registry = Arc::new(SessionRegistry::new(8));
        let router = CommandRouter::new(Arc::clone(&registry), QueuePolicy::Queue);
        let (id, mut rx) = activate(&registry, "host-1");
        router.select(id).unwrap();

        let serve = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            let _ = request.reply.send(CommandReply::Timeout);
        });

        let outcome = router.dispatch("sleep 60").await.unwrap();
        serve.await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Timeout));
    }

    #[tokio::test]
    async fn test_reject_policy_fails_fast_when_session_busy() {
        let registry = Arc::new(SessionRegistry::new(8));
        let router = CommandRouter::new(Arc::clone(&registry), QueuePolicy::Reject);
        let (id, mut rx) = activate(&registry, "host-1");
        router.select(id).unwrap();

        // First dispatch fills the capacity-1 queue; nobody is serving it.
        let fill = {
            let sender = registry.command_sender(id).unwrap();
            let (reply_tx, _reply_rx) = oneshot::channel();
            sender
                .try_send(CommandRequest {
                    command: "first".to_string(),
                    reply: reply_tx,
                })
                .unwrap();
            _reply_rx
        };

        assert_eq!(
            router.dispatch("second").await.unwrap_err(),
            DispatchError::SessionBusy(id)
        );

        drop(fill);
        let _ = rx.recv().await;
    }

    #[tokio::test]
    async fn test_dispatch_against_removed_session_clears_cursor() {
        let registry = Arc::new(SessionRegistry::new(8));
        let router = CommandRouter::new(Arc::clone(&registry), QueuePolicy::Queue);
        let (id, rx) = activate(&registry, "host-1");
        router.select(id).unwrap();

        // Simulate the handler tearing the session down.
        drop(rx);
        registry.remove(id);

        assert_eq!(
            router.dispatch("id").await.unwrap_err(),
            DispatchError::NoActiveSession
        );
        assert_eq!(router.selected(), None, "stale cursor must be cleared");
    }

    #[tokio::test]
    async fn test_dropped_reply_slot_is_no_active_session() {
        let registry = Arc::new(SessionRegistry::new(8));
        let router = CommandRouter::new(Arc::clone(&registry), QueuePolicy::Queue);
        let (id, mut rx) = activate(&registry, "host-1");
        router.select(id).unwrap();

        let serve = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            // Session dies mid-command: reply slot dropped unresolved.
            drop(request.reply);
        });

        assert_eq!(
            router.dispatch("id").await.unwrap_err(),
            DispatchError::NoActiveSession
        );
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_reply_surfaces_as_server_shutting_down() {
        let registry = Arc::new(SessionRegistry::new(8));
        let router = CommandRouter::new(Arc::clone(&registry), QueuePolicy::Queue);
        let (id, mut rx) = activate(&registry, "host-1");
        router.select(id).unwrap();

        let serve = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            let _ = request.reply.send(CommandReply::ShuttingDown);
        });

        assert_eq!(
            router.dispatch("id").await.unwrap_err(),
            DispatchError::ServerShuttingDown
        );
        serve.await.unwrap();
    }
}
