//! Registry of live sessions, owned by the listener.
//!
//! The cache never learns about sessions. The registry lets the listener
//! enumerate the sessions it created, with their state, cursor and lag, for
//! diagnostics and shutdown.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fanout_core::Sequence;
use parking_lot::Mutex;

use crate::session::SessionState;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Live view of one session, shared between the session task and the
/// registry.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    remote_addr: Option<SocketAddr>,
    connected_at: Instant,
    state: AtomicU8,
    /// Sequence of the last breadcrumb fully sent, 0 before the first.
    cursor: AtomicU64,
    client_name: Mutex<Option<String>>,
}

impl SessionHandle {
    /// Create a handle for a session that is not registered anywhere.
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: SessionId::new(),
            remote_addr,
            connected_at: Instant::now(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            cursor: AtomicU64::new(0),
            client_name: Mutex::new(None),
        }
    }

    /// The session ID.
    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address, if known.
    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Sequence of the last breadcrumb fully sent.
    pub fn cursor(&self) -> Option<Sequence> {
        match self.cursor.load(Ordering::Acquire) {
            0 => None,
            seq => Some(Sequence::new(seq)),
        }
    }

    pub(crate) fn set_cursor(&self, sequence: Sequence) {
        self.cursor.store(sequence.get(), Ordering::Release);
    }

    /// Client name from the handshake.
    pub fn client_name(&self) -> Option<String> {
        self.client_name.lock().clone()
    }

    pub(crate) fn set_client_name(&self, name: String) {
        *self.client_name.lock() = Some(name);
    }

    /// Breadcrumbs between the cursor and `latest`.
    pub fn lag(&self, latest: Option<Sequence>) -> u64 {
        match (self.cursor(), latest) {
            (Some(cursor), Some(latest)) => cursor.lag_behind(latest),
            (None, Some(latest)) => latest.get(),
            (_, None) => 0,
        }
    }

    /// Snapshot the handle for reporting.
    pub fn info(&self, latest: Option<Sequence>) -> SessionInfo {
        SessionInfo {
            id: self.id,
            remote_addr: self.remote_addr,
            client_name: self.client_name(),
            state: self.state(),
            cursor: self.cursor(),
            lag: self.lag(latest),
            connected_for: self.connected_at.elapsed(),
        }
    }
}

/// Point-in-time description of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session ID.
    pub id: SessionId,
    /// Remote address, if known.
    pub remote_addr: Option<SocketAddr>,
    /// Client name from the handshake.
    pub client_name: Option<String>,
    /// State at the time of the snapshot.
    pub state: SessionState,
    /// Last breadcrumb fully sent.
    pub cursor: Option<Sequence>,
    /// Breadcrumbs behind the tail.
    pub lag: u64,
    /// Time since the connection was accepted.
    pub connected_for: Duration,
}

/// Registry of live sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. It is removed when the guard is dropped.
    pub fn register(&self, remote_addr: Option<SocketAddr>) -> Registration {
        let handle = Arc::new(SessionHandle::new(remote_addr));
        self.sessions.insert(handle.id(), Arc::clone(&handle));
        Registration {
            registry: self.clone(),
            handle,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Look up a session.
    pub fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Describe every live session, ordered by ID.
    pub fn list(&self, latest: Option<Sequence>) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info(latest))
            .collect();
        sessions.sort_by_key(|info| info.id);
        sessions
    }

    /// Largest lag among live sessions.
    pub fn max_lag(&self, latest: Option<Sequence>) -> u64 {
        self.sessions
            .iter()
            .map(|entry| entry.value().lag(latest))
            .max()
            .unwrap_or(0)
    }

    /// Number of sessions in `state`.
    pub fn count_in_state(&self, state: SessionState) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == state)
            .count()
    }
}

/// Keeps a session registered while alive.
#[derive(Debug)]
pub struct Registration {
    registry: SessionRegistry,
    handle: Arc<SessionHandle>,
}

impl Registration {
    /// The registered handle.
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.sessions.remove(&self.handle.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert!(SessionId::new().to_string().starts_with("session-"));
    }

    #[test]
    fn registration_lifecycle() {
        let registry = SessionRegistry::new();
        let reg = registry.register(None);
        let id = reg.handle().id();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());

        drop(reg);
        assert!(registry.is_empty());
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn lag_and_state_reporting() {
        let registry = SessionRegistry::new();
        let a = registry.register(None);
        let b = registry.register(None);

        a.handle().set_cursor(Sequence::new(10));
        a.handle().set_state(SessionState::Streaming);
        b.handle().set_cursor(Sequence::new(4));
        b.handle().set_client_name("edge-node-2".into());

        let latest = Some(Sequence::new(12));
        assert_eq!(registry.max_lag(latest), 8);
        assert_eq!(registry.count_in_state(SessionState::Streaming), 1);
        assert_eq!(registry.count_in_state(SessionState::Connecting), 1);

        let listed = registry.list(latest);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].lag, 2);
        assert_eq!(listed[1].client_name.as_deref(), Some("edge-node-2"));
    }

    #[test]
    fn lag_without_cursor_counts_whole_chain() {
        let handle = SessionHandle::new(None);
        assert_eq!(handle.lag(None), 0);
        assert_eq!(handle.lag(Some(Sequence::new(3))), 3);
    }
}
