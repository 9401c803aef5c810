//! Session registry: thread-safe store of active agent sessions.
//!
//! The `SessionRegistry` is the server's in-memory database of every live
//! connection. Each entry tracks the assigned session id, the label the
//! agent registered under, the lifecycle state, and the channel used to
//! deliver commands to the owning connection handler.
//!
//! # Session lifecycle
//!
//! ```text
//! Connecting ──► Authenticating ──► Active ──► Closing ──► (removed)
//! ```
//!
//! - `Connecting`: the connection was accepted and an id reserved.
//! - `Authenticating`: waiting for the registration frame.
//! - `Active`: registration verified; commands may be routed.
//! - `Closing`: the owning handler is tearing the session down.
//!
//! A session id exists in the map exactly while its session is in one of
//! these states; removal happens once, performed only by the connection
//! handler that owns the session. The router and listener never insert or
//! delete entries, which rules out double-teardown races by construction.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::application::dispatch::CommandRequest;

/// Process-unique session identifier.
///
/// Drawn from an atomic counter, so concurrent registrations can never
/// collide and an id is never reused for the lifetime of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Builds an id from a raw counter value; `Display` and `FromStr`
    /// round-trip through this representation.
    pub fn from_raw(raw: u64) -> Self {
        SessionId(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SESSION-{:04}", self.0)
    }
}

/// Error returned when a session id string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session id: {0:?}")]
pub struct ParseSessionIdError(String);

impl FromStr for SessionId {
    type Err = ParseSessionIdError;

    /// Accepts both the display form (`SESSION-0007`) and a bare number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("SESSION-").unwrap_or(s);
        digits
            .parse::<u64>()
            .map(SessionId)
            .map_err(|_| ParseSessionIdError(s.to_string()))
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, id reserved, no frame exchanged yet.
    Connecting,
    /// Waiting for (or verifying) the registration frame.
    Authenticating,
    /// Registered and reachable; commands may be routed here.
    Active,
    /// The owning handler is tearing the session down.
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Error type for registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The configured maximum number of live sessions is reached.
    #[error("session capacity of {max} reached")]
    CapacityExceeded { max: usize },

    /// No session with this id is in the registry.
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// A state transition was requested that the lifecycle does not allow.
    /// Indicates a logic fault in the caller, not a runtime condition.
    #[error("session {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
}

/// One live session tracked by the registry.
#[derive(Debug)]
struct SessionEntry {
    /// Label supplied by the agent at registration. Not unique; the
    /// session id is the key. Empty until the session is promoted.
    client_label: String,
    state: SessionState,
    peer_addr: SocketAddr,
    /// Channel into the owning connection handler. `None` until promotion.
    command_tx: Option<mpsc::Sender<CommandRequest>>,
    registered_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// Read-only snapshot of one session, safe to hand to the operator side.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub client_label: String,
    pub state: SessionState,
    pub peer_addr: SocketAddr,
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Thread-safe registry of all live sessions.
///
/// Mutating operations serialize on the write lock; reads take the read
/// lock and may run concurrently with each other. Critical sections are
/// map mutation only — no I/O ever happens under the lock.
pub struct SessionRegistry {
    next_id: AtomicU64,
    max_sessions: usize,
    inner: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            max_sessions,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Atomically reserves a new unique id and inserts a `Connecting`
    /// entry for it.
    ///
    /// # Errors
    ///
    /// [`RegistryError::CapacityExceeded`] once the number of live
    /// sessions has reached the configured maximum. The caller must then
    /// decline the connection; no entry is left behind.
    pub fn create_pending(&self, peer_addr: SocketAddr) -> Result<SessionId, RegistryError> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.len() >= self.max_sessions {
            return Err(RegistryError::CapacityExceeded {
                max: self.max_sessions,
            });
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        map.insert(
            id,
            SessionEntry {
                client_label: String::new(),
                state: SessionState::Connecting,
                peer_addr,
                command_tx: None,
                registered_at: now,
                last_activity: now,
            },
        );
        Ok(id)
    }

    /// Transitions `Connecting → Authenticating`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] or [`RegistryError::InvalidTransition`].
    pub fn begin_authentication(&self, id: SessionId) -> Result<(), RegistryError> {
        self.transition(id, SessionState::Connecting, SessionState::Authenticating)
    }

    /// Transitions `Authenticating → Active`, attaching the agent's label
    /// and the command channel into the owning handler.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] or [`RegistryError::InvalidTransition`].
    pub fn promote(
        &self,
        id: SessionId,
        client_label: String,
        command_tx: mpsc::Sender<CommandRequest>,
    ) -> Result<(), RegistryError> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let entry = map.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if entry.state != SessionState::Authenticating {
            return Err(RegistryError::InvalidTransition {
                id,
                from: entry.state,
                to: SessionState::Active,
            });
        }
        entry.state = SessionState::Active;
        entry.client_label = client_label;
        entry.command_tx = Some(command_tx);
        entry.last_activity = Utc::now();
        Ok(())
    }

    /// Marks a session as `Closing`. Missing ids are ignored, since the
    /// handler may race its own teardown against shutdown.
    pub fn mark_closing(&self, id: SessionId) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(&id) {
            entry.state = SessionState::Closing;
            entry.command_tx = None;
        }
    }

    /// Removes a session. Idempotent: removing an id that is already gone
    /// is a no-op, because disconnect detection can race with shutdown.
    ///
    /// Returns `true` if an entry was actually removed.
    pub fn remove(&self, id: SessionId) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(&id).is_some()
    }

    /// Refreshes the activity timestamp after a frame arrives.
    pub fn touch(&self, id: SessionId) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(&id) {
            entry.last_activity = Utc::now();
        }
    }

    /// Returns a snapshot of one session.
    pub fn get(&self, id: SessionId) -> Option<SessionSummary> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&id).map(|entry| summarize(id, entry))
    }

    /// Returns a snapshot of all `Active` sessions, ordered by id.
    ///
    /// The snapshot is a copy; callers can iterate it without holding any
    /// lock and without observing half-finished mutations.
    pub fn list_active(&self) -> Vec<SessionSummary> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut sessions: Vec<SessionSummary> = map
            .iter()
            .filter(|(_, entry)| entry.state == SessionState::Active)
            .map(|(id, entry)| summarize(*id, entry))
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Returns the command channel for an `Active` session, or `None` if
    /// the session is gone or not yet (no longer) active.
    pub fn command_sender(&self, id: SessionId) -> Option<mpsc::Sender<CommandRequest>> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&id)
            .filter(|entry| entry.state == SessionState::Active)
            .and_then(|entry| entry.command_tx.clone())
    }

    /// Number of live (non-removed) sessions, including pending ones.
    pub fn live_count(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    fn transition(
        &self,
        id: SessionId,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), RegistryError> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let entry = map.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if entry.state != from {
            return Err(RegistryError::InvalidTransition {
                id,
                from: entry.state,
                to,
            });
        }
        entry.state = to;
        Ok(())
    }
}

fn summarize(id: SessionId, entry: &SessionEntry) -> SessionSummary {
    SessionSummary {
        id,
        client_label: entry.client_label.clone(),
        state: entry.state,
        peer_addr: entry.peer_addr,
        registered_at: entry.registered_at,
        last_activity: entry.last_activity,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn activate(registry: &SessionRegistry, label: &str) -> SessionId {
        let id = registry.create_pending(peer()).unwrap();
        registry.begin_authentication(id).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        registry.promote(id, label.to_string(), tx).unwrap();
        id
    }

    #[test]
    fn test_racing_registrations_get_distinct_ids() {
        // Many threads reserving sessions in the same instant must never
        // observe a duplicate id, and every reservation must land in the map.
        let registry = Arc::new(SessionRegistry::new(1024));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                (0..8)
                    .map(|_| registry.create_pending(peer()).unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut ids: Vec<SessionId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 256);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 256, "session ids must be unique");
        assert_eq!(registry.live_count(), 256);
    }

    #[test]
    fn test_create_pending_rejects_at_capacity() {
        let registry = SessionRegistry::new(2);
        registry.create_pending(peer()).unwrap();
        registry.create_pending(peer()).unwrap();
        assert!(matches!(
            registry.create_pending(peer()),
            Err(RegistryError::CapacityExceeded { max: 2 })
        ));
    }

    #[test]
    fn test_capacity_frees_up_after_remove() {
        let registry = SessionRegistry::new(1);
        let id = registry.create_pending(peer()).unwrap();
        assert!(registry.create_pending(peer()).is_err());
        registry.remove(id);
        assert!(registry.create_pending(peer()).is_ok());
    }

    #[test]
    fn test_promote_requires_authenticating_state() {
        let registry = SessionRegistry::new(8);
        let id = registry.create_pending(peer()).unwrap();
        let (tx, _rx) = mpsc::channel(1);

        // Still in Connecting: promotion must be rejected.
        let err = registry.promote(id, "host-1".to_string(), tx).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn test_promote_unknown_session_is_not_found() {
        let registry = SessionRegistry::new(8);
        let id = registry.create_pending(peer()).unwrap();
        registry.remove(id);
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            registry.promote(id, "gone".to_string(), tx),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new(8);
        let id = registry.create_pending(peer()).unwrap();
        assert!(registry.remove(id));
        assert!(!registry.remove(id), "second remove must be a silent no-op");
    }

    #[test]
    fn test_list_active_excludes_pending_sessions() {
        let registry = SessionRegistry::new(8);
        let _pending = registry.create_pending(peer()).unwrap();
        let active = activate(&registry, "host-2");

        let listed = registry.list_active();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active);
        assert_eq!(listed[0].client_label, "host-2");
    }

    #[test]
    fn test_list_active_is_ordered_by_id() {
        let registry = SessionRegistry::new(8);
        let a = activate(&registry, "a");
        let b = activate(&registry, "b");
        let c = activate(&registry, "c");
        let ids: Vec<SessionId> = registry.list_active().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn test_command_sender_only_for_active_sessions() {
        let registry = SessionRegistry::new(8);
        let pending = registry.create_pending(peer()).unwrap();
        assert!(registry.command_sender(pending).is_none());

        let active = activate(&registry, "host-3");
        assert!(registry.command_sender(active).is_some());

        registry.mark_closing(active);
        assert!(registry.command_sender(active).is_none());
    }

    #[test]
    fn test_same_label_reconnect_gets_new_id() {
        let registry = SessionRegistry::new(8);
        let first = activate(&registry, "host-1");
        registry.remove(first);
        let second = activate(&registry, "host-1");
        assert_ne!(first, second, "ids are never reused");
    }

    #[test]
    fn test_session_id_parses_display_form_and_bare_number() {
        let registry = SessionRegistry::new(8);
        let id = registry.create_pending(peer()).unwrap();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert_eq!("1".parse::<SessionId>().unwrap(), id);
        assert!("host-1".parse::<SessionId>().is_err());
    }
}
