//! Sessions: logical identities that outlive connections.
//!
//! A [`Session`] carries a user id, room membership, and metadata across
//! socket drops. It is in one of three states:
//!
//! - **Active**: exactly one connection is attached.
//! - **Suspended**: no connection; reserved for reconnection within the
//!   suspend timeout.
//! - **Closed**: terminal. A closed session never transitions again.
//!
//! The [`SessionRegistry`] owns every session, indexes them by user, runs
//! the lifecycle transitions, and sweeps expired suspended sessions with
//! its reaper task.
//!
//! Room membership is preserved across active↔suspended transitions and
//! cleared on close — that is what makes rooms survive socket drops.
//!
//! # Examples
//!
//! ```
//! use wstether_core::connection::Connection;
//! use wstether_core::session::{SessionRegistry, SessionState};
//!
//! let registry = SessionRegistry::new();
//! let (conn, _rx) = Connection::open("conn_1".to_string());
//! let session = registry.create(Some("alice".to_string()), Some(conn), None);
//!
//! assert_eq!(session.state(), SessionState::Active);
//! assert_eq!(session.user_id().as_deref(), Some("alice"));
//! assert_eq!(registry.by_user("alice").len(), 1);
//! ```

use crate::connection::Connection;
use crate::error::Result;
use crate::id;
use crate::protocol::{events, now_ms, WireMessage};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A unique identifier for a session.
pub type SessionId = String;

/// The lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A connection is attached and the session processes messages.
    Active,
    /// Liveness was lost; the session awaits reconnection.
    Suspended,
    /// Terminal state.
    Closed,
}

/// A logical identity surviving connection drops.
///
/// All mutable fields sit behind their own locks; lifecycle transitions are
/// additionally serialized per session by an operation lock held by the
/// registry methods, so `reconnect` and `close` cannot interleave.
pub struct Session {
    id: SessionId,
    created_at: u64,
    user_id: RwLock<Option<String>>,
    state: RwLock<SessionState>,
    connection: RwLock<Option<Arc<Connection>>>,
    rooms: RwLock<HashSet<String>>,
    metadata: RwLock<HashMap<String, Value>>,
    last_activity: AtomicU64,
    suspended_at: RwLock<Option<u64>>,
    op_lock: Mutex<()>,
}

impl Session {
    fn new(id: SessionId, user_id: Option<String>, metadata: Option<HashMap<String, Value>>) -> Self {
        let now = now_ms();
        Self {
            id,
            created_at: now,
            user_id: RwLock::new(user_id),
            state: RwLock::new(SessionState::Suspended),
            connection: RwLock::new(None),
            rooms: RwLock::new(HashSet::new()),
            metadata: RwLock::new(metadata.unwrap_or_default()),
            last_activity: AtomicU64::new(now),
            suspended_at: RwLock::new(Some(now)),
            op_lock: Mutex::new(()),
        }
    }

    /// Returns the session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Unix timestamp (ms) when the session was created.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The authenticated user, if any.
    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().ok().and_then(|g| g.clone())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.read().map(|g| *g).unwrap_or(SessionState::Closed)
    }

    /// Whether the session is active with an attached connection.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// The attached connection, if the session is active.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().ok().and_then(|g| g.clone())
    }

    /// Snapshot of the rooms this session belongs to.
    pub fn rooms(&self) -> HashSet<String> {
        self.rooms.read().map(|g| g.clone()).unwrap_or_default()
    }

    /// Snapshot of the session metadata.
    pub fn metadata(&self) -> HashMap<String, Value> {
        self.metadata.read().map(|g| g.clone()).unwrap_or_default()
    }

    /// Merges the given entries into the session metadata.
    pub fn merge_metadata(&self, entries: HashMap<String, Value>) {
        if let Ok(mut guard) = self.metadata.write() {
            guard.extend(entries);
        }
    }

    /// Unix timestamp (ms) of the last inbound activity.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Records inbound activity now.
    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    /// Unix timestamp (ms) when the session was suspended, if it is.
    pub fn suspended_at(&self) -> Option<u64> {
        self.suspended_at.read().ok().and_then(|g| *g)
    }

    pub(crate) fn set_user(&self, user_id: Option<String>) {
        if let Ok(mut guard) = self.user_id.write() {
            *guard = user_id;
        }
    }

    pub(crate) fn add_room(&self, room_id: &str) -> bool {
        self.rooms
            .write()
            .map(|mut g| g.insert(room_id.to_string()))
            .unwrap_or(false)
    }

    pub(crate) fn remove_room(&self, room_id: &str) -> bool {
        self.rooms
            .write()
            .map(|mut g| g.remove(room_id))
            .unwrap_or(false)
    }

    fn clear_rooms(&self) {
        if let Ok(mut guard) = self.rooms.write() {
            guard.clear();
        }
    }

    fn set_state(&self, state: SessionState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = state;
        }
    }

    fn attach(&self, conn: Arc<Connection>) {
        conn.attach_session(&self.id);
        if let Ok(mut guard) = self.connection.write() {
            *guard = Some(conn);
        }
    }

    fn detach(&self) -> Option<Arc<Connection>> {
        let detached = self
            .connection
            .write()
            .ok()
            .and_then(|mut g| g.take());
        if let Some(ref conn) = detached {
            // Only clear the backref if it still points here; the connection
            // may already have been rebound to another session.
            if conn.session_id().as_deref() == Some(self.id.as_str()) {
                conn.detach_session();
            }
        }
        detached
    }

    fn set_suspended_at(&self, at: Option<u64>) {
        if let Ok(mut guard) = self.suspended_at.write() {
            *guard = at;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("user_id", &self.user_id())
            .field("rooms", &self.rooms().len())
            .finish()
    }
}

/// Lifecycle callback invoked with the session in its post-transition state.
pub type SessionCallback = Arc<dyn Fn(&Arc<Session>) -> Result<()> + Send + Sync>;

type CleanupHook = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Creates, finds, and closes sessions; owns the suspended-session reaper.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    by_user: DashMap<String, Vec<SessionId>>,
    on_created: RwLock<Vec<SessionCallback>>,
    on_suspended: RwLock<Vec<SessionCallback>>,
    on_reconnected: RwLock<Vec<SessionCallback>>,
    on_closed: RwLock<Vec<SessionCallback>>,
    room_cleanup: RwLock<Option<CleanupHook>>,
    protocol_version: RwLock<String>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            by_user: DashMap::new(),
            on_created: RwLock::new(Vec::new()),
            on_suspended: RwLock::new(Vec::new()),
            on_reconnected: RwLock::new(Vec::new()),
            on_closed: RwLock::new(Vec::new()),
            room_cleanup: RwLock::new(None),
            protocol_version: RwLock::new("1.0".to_string()),
        })
    }

    /// Sets the protocol version stamped on lifecycle notices.
    pub fn set_protocol_version(&self, version: impl Into<String>) {
        if let Ok(mut guard) = self.protocol_version.write() {
            *guard = version.into();
        }
    }

    fn version(&self) -> String {
        self.protocol_version
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|_| "1.0".to_string())
    }

    /// Registers a callback fired after a session is created.
    pub fn on_created(&self, cb: SessionCallback) {
        if let Ok(mut guard) = self.on_created.write() {
            guard.push(cb);
        }
    }

    /// Registers a callback fired after a session transitions to suspended.
    pub fn on_suspended(&self, cb: SessionCallback) {
        if let Ok(mut guard) = self.on_suspended.write() {
            guard.push(cb);
        }
    }

    /// Registers a callback fired after a reconnection rebinds a session.
    pub fn on_reconnected(&self, cb: SessionCallback) {
        if let Ok(mut guard) = self.on_reconnected.write() {
            guard.push(cb);
        }
    }

    /// Registers a callback fired after a session is closed.
    pub fn on_closed(&self, cb: SessionCallback) {
        if let Ok(mut guard) = self.on_closed.write() {
            guard.push(cb);
        }
    }

    /// Installs the hook that removes a closing session from every room.
    ///
    /// Wired by the server facade to `RoomRegistry::leave_all` so that close
    /// keeps the bidirectional membership invariant.
    pub fn set_room_cleanup<F>(&self, hook: F)
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        if let Ok(mut guard) = self.room_cleanup.write() {
            *guard = Some(Arc::new(hook));
        }
    }

    /// Creates and registers a session.
    ///
    /// With a connection the session starts `Active`; without one it starts
    /// `Suspended` (an active session always has an attached connection).
    /// Metadata supplied here is merged into the fresh session.
    pub fn create(
        &self,
        user_id: Option<String>,
        connection: Option<Arc<Connection>>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(id::session_id(), user_id.clone(), metadata));
        if let Some(conn) = connection {
            session.attach(conn);
            session.set_state(SessionState::Active);
            session.set_suspended_at(None);
        }
        self.sessions.insert(session.id().clone(), session.clone());
        if let Some(user) = user_id {
            self.by_user
                .entry(user)
                .or_default()
                .push(session.id().clone());
        }
        info!(
            "Session created: {} (state: {:?}, total: {})",
            session.id(),
            session.state(),
            self.sessions.len()
        );
        self.fire(&self.on_created, &session);
        session
    }

    /// Retrieves a session by id. Closed sessions are not found.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// All sessions belonging to a user.
    pub fn by_user(&self, user_id: &str) -> Vec<Arc<Session>> {
        self.by_user
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// All registered session ids.
    pub fn all_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Assigns a user to a session and indexes it.
    pub fn assign_user(&self, session: &Arc<Session>, user_id: impl Into<String>) {
        let user_id = user_id.into();
        session.set_user(Some(user_id.clone()));
        let mut ids = self.by_user.entry(user_id).or_default();
        if !ids.contains(session.id()) {
            ids.push(session.id().clone());
        }
    }

    /// Atomically binds a new connection to an existing session.
    ///
    /// Returns `None` if the session is absent or closed. On success the
    /// previously attached connection (if any) is detached and returned so
    /// the reconnection path can notify and close it; the session becomes
    /// `Active`, `suspended_at` is cleared, and `reconnected` callbacks fire.
    pub async fn reconnect(
        &self,
        id: &str,
        new_connection: Arc<Connection>,
    ) -> Option<(Arc<Session>, Option<Arc<Connection>>)> {
        let session = self.get(id)?;
        let _guard = session.op_lock.lock().await;
        if session.state() == SessionState::Closed {
            return None;
        }
        let displaced = session.detach();
        session.attach(new_connection);
        session.set_state(SessionState::Active);
        session.set_suspended_at(None);
        session.touch();
        info!(
            "Session reconnected: {} (displaced: {})",
            id,
            displaced.as_ref().map(|c| c.id().as_str()).unwrap_or("none")
        );
        self.fire(&self.on_reconnected, &session);
        drop(_guard);
        Some((session, displaced))
    }

    /// Transitions an active session to suspended.
    ///
    /// Detaches the connection **without closing it** — the caller owns the
    /// close — and returns it. No-op on suspended or closed sessions.
    pub async fn suspend(&self, id: &str) -> Option<Arc<Connection>> {
        let session = self.get(id)?;
        let _guard = session.op_lock.lock().await;
        if session.state() != SessionState::Active {
            return None;
        }
        if let Some(conn) = session.connection() {
            let _ = conn.send(WireMessage::new(self.version(), events::SESSION_SUSPENDED));
        }
        let detached = session.detach();
        session.set_state(SessionState::Suspended);
        session.set_suspended_at(Some(now_ms()));
        info!("Session suspended: {}", id);
        self.fire(&self.on_suspended, &session);
        detached
    }

    /// Detaches a session's connection without any client notice, leaving
    /// the session suspended. Used when a connection migrates to another
    /// session mid-stream (the reconnect-over-live-handshake path).
    pub(crate) async fn release_connection(&self, id: &str) -> Option<Arc<Connection>> {
        let session = self.get(id)?;
        let _guard = session.op_lock.lock().await;
        if session.state() != SessionState::Active {
            return None;
        }
        let detached = session.detach();
        session.set_state(SessionState::Suspended);
        session.set_suspended_at(Some(now_ms()));
        self.fire(&self.on_suspended, &session);
        detached
    }

    /// Closes a session: terminal, idempotent.
    ///
    /// Leaves every room (via the installed cleanup hook), closes the
    /// attached connection with `code`/`reason`, removes the session from
    /// the user index and the registry, and fires `closed` callbacks.
    pub async fn close(&self, id: &str, code: u16, reason: Option<&str>) -> bool {
        let session = match self.get(id) {
            Some(s) => s,
            None => return false,
        };
        let _guard = session.op_lock.lock().await;
        if session.state() == SessionState::Closed {
            return false;
        }

        // The state flips first so a concurrent join can detect the race
        // and keep room membership bidirectionally consistent.
        session.set_state(SessionState::Closed);

        let hook = self.room_cleanup.read().ok().and_then(|g| g.clone());
        if let Some(hook) = hook {
            hook(&session);
        }
        session.clear_rooms();

        if let Some(conn) = session.detach() {
            let mut notice = WireMessage::new(self.version(), events::SESSION_CLOSED);
            if let Some(reason) = reason {
                notice
                    .payload
                    .insert("reason".to_string(), Value::String(reason.to_string()));
            }
            let _ = conn.send(notice);
            conn.close(code, reason.unwrap_or(""));
        }

        session.set_suspended_at(None);

        if let Some(user) = session.user_id() {
            if let Some(mut ids) = self.by_user.get_mut(&user) {
                ids.retain(|sid| sid != id);
            }
            self.by_user.remove_if(&user, |_, ids| ids.is_empty());
        }
        self.sessions.remove(id);
        info!("Session closed: {} (code: {})", id, code);
        self.fire(&self.on_closed, &session);
        true
    }

    /// Sends a message to every session with an attached active connection.
    ///
    /// Returns the number of sessions that accepted the send. Used by the
    /// pub/sub bridge for cluster-wide fan-out.
    pub fn broadcast_all(&self, message: &WireMessage) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            if let Some(conn) = entry.value().connection() {
                if conn.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!("Broadcast to all sessions: {} delivered", delivered);
        delivered
    }

    /// Closes every suspended session older than `timeout`.
    ///
    /// Returns the ids that were reaped.
    pub async fn sweep_expired(&self, timeout: Duration) -> Vec<SessionId> {
        let cutoff = now_ms().saturating_sub(timeout.as_millis() as u64);
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.value().state() == SessionState::Suspended
                    && entry.value().suspended_at().is_some_and(|at| at <= cutoff)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            debug!("Reaping expired session: {}", id);
            self.close(id, crate::error::close_code::SESSION_EXPIRED, Some("session expired"))
                .await;
        }
        expired
    }

    /// Spawns the periodic reaper. Abort the returned handle on shutdown.
    pub fn start_reaper(
        self: &Arc<Self>,
        suspend_timeout: Duration,
        interval: Duration,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = registry.sweep_expired(suspend_timeout).await;
                if !reaped.is_empty() {
                    info!("Reaper closed {} expired session(s)", reaped.len());
                }
            }
        })
    }

    /// Closes every session, for shutdown.
    pub async fn close_all(&self, code: u16, reason: Option<&str>) {
        let ids = self.all_ids();
        for id in ids {
            self.close(&id, code, reason).await;
        }
    }

    fn fire(&self, callbacks: &RwLock<Vec<SessionCallback>>, session: &Arc<Session>) {
        let snapshot: Vec<SessionCallback> = match callbacks.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for cb in snapshot {
            if let Err(e) = cb(session) {
                warn!("Session callback failed for {}: {}", session.id(), e);
            }
        }
    }
}

/// Builds the payload for `sys.session.restored`.
pub(crate) fn restored_payload(session: &Session) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("sessionId".to_string(), Value::String(session.id().clone()));
    if let Some(user) = session.user_id() {
        payload.insert("userId".to_string(), Value::String(user));
    }
    let rooms: Vec<Value> = session.rooms().into_iter().map(Value::String).collect();
    payload.insert("rooms".to_string(), Value::Array(rooms));
    payload.insert(
        "metadata".to_string(),
        Value::Object(session.metadata().into_iter().collect()),
    );
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Frame;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn conn(id: &str) -> (Arc<Connection>, UnboundedReceiver<Frame>) {
        Connection::open(id.to_string())
    }

    #[test]
    fn test_create_active_with_connection() {
        let registry = SessionRegistry::new();
        let (c, _rx) = conn("c1");
        let session = registry.create(None, Some(c.clone()), None);
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.connection().is_some());
        assert_eq!(c.session_id().as_deref(), Some(session.id().as_str()));
        assert!(session.suspended_at().is_none());
    }

    #[test]
    fn test_create_suspended_without_connection() {
        let registry = SessionRegistry::new();
        let session = registry.create(None, None, None);
        assert_eq!(session.state(), SessionState::Suspended);
        assert!(session.connection().is_none());
        assert!(session.suspended_at().is_some());
    }

    #[test]
    fn test_user_index() {
        let registry = SessionRegistry::new();
        let (c1, _r1) = conn("c1");
        let (c2, _r2) = conn("c2");
        registry.create(Some("alice".to_string()), Some(c1), None);
        registry.create(Some("alice".to_string()), Some(c2), None);
        registry.create(Some("bob".to_string()), None, None);
        assert_eq!(registry.by_user("alice").len(), 2);
        assert_eq!(registry.by_user("bob").len(), 1);
        assert!(registry.by_user("carol").is_empty());
    }

    #[tokio::test]
    async fn test_suspend_detaches_without_closing() {
        let registry = SessionRegistry::new();
        let (c, _rx) = conn("c1");
        let session = registry.create(None, Some(c.clone()), None);
        let detached = registry.suspend(session.id()).await;
        assert_eq!(session.state(), SessionState::Suspended);
        assert!(session.connection().is_none());
        // Detached, not closed: the caller owns the close decision.
        assert!(detached.unwrap().is_active());
        assert!(session.suspended_at().is_some());
    }

    #[tokio::test]
    async fn test_suspend_preserves_rooms() {
        let registry = SessionRegistry::new();
        let (c, _rx) = conn("c1");
        let session = registry.create(None, Some(c), None);
        session.add_room("general");
        registry.suspend(session.id()).await;
        assert!(session.rooms().contains("general"));
    }

    #[tokio::test]
    async fn test_reconnect_restores_identity() {
        let registry = SessionRegistry::new();
        let (c1, _r1) = conn("c1");
        let session = registry.create(Some("alice".to_string()), Some(c1), None);
        session.add_room("general");
        session.merge_metadata(HashMap::from([(
            "locale".to_string(),
            Value::String("en".to_string()),
        )]));
        registry.suspend(session.id()).await;

        let (c2, _r2) = conn("c2");
        let (restored, displaced) = registry.reconnect(session.id(), c2.clone()).await.unwrap();
        assert!(displaced.is_none());
        assert_eq!(restored.state(), SessionState::Active);
        assert_eq!(restored.user_id().as_deref(), Some("alice"));
        assert!(restored.rooms().contains("general"));
        assert_eq!(
            restored.metadata().get("locale"),
            Some(&Value::String("en".to_string()))
        );
        assert!(restored.suspended_at().is_none());
        assert_eq!(c2.session_id().as_deref(), Some(session.id().as_str()));
    }

    #[tokio::test]
    async fn test_reconnect_returns_displaced_connection() {
        let registry = SessionRegistry::new();
        let (c1, _r1) = conn("c1");
        let session = registry.create(None, Some(c1.clone()), None);
        let (c2, _r2) = conn("c2");
        let (_, displaced) = registry.reconnect(session.id(), c2.clone()).await.unwrap();
        assert_eq!(displaced.unwrap().id(), c1.id());
        assert_eq!(session.connection().unwrap().id(), c2.id());
        assert!(c1.session_id().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_unknown_session_fails() {
        let registry = SessionRegistry::new();
        let (c, _rx) = conn("c1");
        assert!(registry.reconnect("sess_missing", c).await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let registry = SessionRegistry::new();
        let (c, _rx) = conn("c1");
        let session = registry.create(Some("alice".to_string()), Some(c.clone()), None);
        session.add_room("general");

        assert!(registry.close(session.id(), 1000, Some("bye")).await);
        assert!(!registry.close(session.id(), 1000, None).await);

        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.rooms().is_empty());
        assert!(!c.is_active());
        assert!(registry.get(session.id()).is_none());
        assert!(registry.by_user("alice").is_empty());

        // A closed session cannot be reconnected.
        let (c2, _r2) = conn("c2");
        assert!(registry.reconnect(session.id(), c2).await.is_none());
    }

    #[tokio::test]
    async fn test_callbacks_fire_in_order_and_survive_errors() {
        use std::sync::Mutex as StdMutex;

        let registry = SessionRegistry::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let o = order.clone();
        registry.on_created(Arc::new(move |_| {
            o.lock().unwrap().push("first");
            Err(crate::error::Error::custom("boom"))
        }));
        let o = order.clone();
        registry.on_created(Arc::new(move |s| {
            // Callbacks observe the post-transition state.
            assert_eq!(s.state(), SessionState::Active);
            o.lock().unwrap().push("second");
            Ok(())
        }));

        let (c, _rx) = conn("c1");
        registry.create(None, Some(c), None);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_reaper_closes_only_expired() {
        let registry = SessionRegistry::new();
        let expired = registry.create(None, None, None);
        let (c, _rx) = conn("c1");
        let active = registry.create(None, Some(c), None);

        // Backdate the suspended session past the timeout.
        expired.set_suspended_at(Some(now_ms() - 10_000));

        let reaped = registry.sweep_expired(Duration::from_millis(5_000)).await;
        assert_eq!(reaped, vec![expired.id().clone()]);
        assert!(registry.get(expired.id()).is_none());
        assert!(registry.get(active.id()).is_some());
    }

    #[tokio::test]
    async fn test_fresh_suspension_not_reaped() {
        let registry = SessionRegistry::new();
        let session = registry.create(None, None, None);
        let reaped = registry.sweep_expired(Duration::from_secs(300)).await;
        assert!(reaped.is_empty());
        assert!(registry.get(session.id()).is_some());
    }

    #[tokio::test]
    async fn test_broadcast_all_skips_detached() {
        let registry = SessionRegistry::new();
        let (c, mut rx) = conn("c1");
        registry.create(None, Some(c), None);
        registry.create(None, None, None);

        let delivered = registry.broadcast_all(&WireMessage::new("1.0", "announce"));
        assert_eq!(delivered, 1);
        assert!(matches!(rx.try_recv().unwrap(), Frame::Message(_)));
    }

    #[test]
    fn test_session_ids_unique() {
        let registry = SessionRegistry::new();
        let a = registry.create(None, None, None);
        let b = registry.create(None, None, None);
        assert_ne!(a.id(), b.id());
    }
}
