//! Rooms: named sets of session ids used for fan-out.
//!
//! Rooms hold **session ids, never connections** — membership is decoupled
//! from transport state, so a session that drops its socket and reconnects
//! is still in its rooms. Bidirectional consistency is maintained on every
//! mutation: a session id appears in a room's member set exactly when the
//! room id appears in that session's membership set.
//!
//! Rooms are auto-created on first join (unless disabled) and auto-deleted
//! when the last member leaves (unless disabled).
//!
//! # Examples
//!
//! ```
//! use wstether_core::connection::Connection;
//! use wstether_core::rooms::RoomRegistry;
//! use wstether_core::session::SessionRegistry;
//!
//! let sessions = SessionRegistry::new();
//! let rooms = RoomRegistry::new(sessions.clone());
//!
//! let (conn, _rx) = Connection::open("conn_1".to_string());
//! let session = sessions.create(None, Some(conn), None);
//!
//! assert!(rooms.join("general", &session).unwrap());
//! assert!(session.rooms().contains("general"));
//! assert_eq!(rooms.get("general").unwrap().member_count(), 1);
//! ```

use crate::error::{Error, Result};
use crate::protocol::{now_ms, WireMessage};
use crate::session::{Session, SessionId, SessionRegistry};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// A named set of session ids with optional capacity and metadata.
pub struct Room {
    id: String,
    created_at: u64,
    max_members: usize,
    members: RwLock<HashSet<SessionId>>,
    metadata: RwLock<HashMap<String, Value>>,
}

impl Room {
    fn new(id: String, max_members: usize) -> Self {
        Self {
            id,
            created_at: now_ms(),
            max_members,
            members: RwLock::new(HashSet::new()),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the room id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unix timestamp (ms) when the room was created.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Maximum member count; 0 means unbounded.
    pub fn max_members(&self) -> usize {
        self.max_members
    }

    /// Snapshot of the member session ids.
    pub fn members(&self) -> HashSet<SessionId> {
        self.members.read().map(|g| g.clone()).unwrap_or_default()
    }

    /// Current member count.
    pub fn member_count(&self) -> usize {
        self.members.read().map(|g| g.len()).unwrap_or(0)
    }

    /// Whether the room is at capacity.
    pub fn is_full(&self) -> bool {
        self.max_members > 0 && self.member_count() >= self.max_members
    }

    /// Snapshot of the room metadata.
    pub fn metadata(&self) -> HashMap<String, Value> {
        self.metadata.read().map(|g| g.clone()).unwrap_or_default()
    }

    /// Merges the given entries into the room metadata.
    pub fn merge_metadata(&self, entries: HashMap<String, Value>) {
        if let Ok(mut guard) = self.metadata.write() {
            guard.extend(entries);
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("members", &self.member_count())
            .field("max_members", &self.max_members)
            .finish()
    }
}

/// Membership callback invoked with the room and the session.
pub type RoomCallback = Arc<dyn Fn(&Arc<Room>, &Arc<Session>) -> Result<()> + Send + Sync>;

/// Tracks rooms and their session-id member sets.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    sessions: Arc<SessionRegistry>,
    auto_create: bool,
    auto_delete: bool,
    default_max_members: usize,
    on_join: RwLock<Vec<RoomCallback>>,
    on_leave: RwLock<Vec<RoomCallback>>,
}

impl RoomRegistry {
    /// Creates a registry with auto-create and auto-delete enabled.
    pub fn new(sessions: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
            sessions,
            auto_create: true,
            auto_delete: true,
            default_max_members: 0,
            on_join: RwLock::new(Vec::new()),
            on_leave: RwLock::new(Vec::new()),
        })
    }

    /// Creates a registry with explicit policy knobs.
    pub fn with_policy(
        sessions: Arc<SessionRegistry>,
        auto_create: bool,
        auto_delete: bool,
        default_max_members: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
            sessions,
            auto_create,
            auto_delete,
            default_max_members,
            on_join: RwLock::new(Vec::new()),
            on_leave: RwLock::new(Vec::new()),
        })
    }

    /// Registers a callback fired after a session joins a room.
    pub fn on_join(&self, cb: RoomCallback) {
        if let Ok(mut guard) = self.on_join.write() {
            guard.push(cb);
        }
    }

    /// Registers a callback fired after a session leaves a room, before any
    /// auto-deletion of the emptied room.
    pub fn on_leave(&self, cb: RoomCallback) {
        if let Ok(mut guard) = self.on_leave.write() {
            guard.push(cb);
        }
    }

    /// Explicitly creates a room (or returns the existing one).
    pub fn create_room(&self, room_id: &str, max_members: usize) -> Arc<Room> {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!("Room created: {}", room_id);
                Arc::new(Room::new(room_id.to_string(), max_members))
            })
            .clone()
    }

    /// Retrieves a room by id.
    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }

    /// Number of rooms.
    pub fn count(&self) -> usize {
        self.rooms.len()
    }

    /// All room ids, in no particular order.
    pub fn all_ids(&self) -> Vec<String> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Adds a session to a room, updating both membership sides.
    ///
    /// Auto-creates the room unless disabled (then: [`Error::RoomNotFound`]).
    /// Returns `Ok(false)` — with both sides unchanged — when the room is at
    /// capacity. Joining a room the session is already in is a no-op that
    /// returns `Ok(true)` without firing callbacks.
    pub fn join(&self, room_id: &str, session: &Arc<Session>) -> Result<bool> {
        let room = match self.get(room_id) {
            Some(room) => room,
            None if self.auto_create => self.create_room(room_id, self.default_max_members),
            None => return Err(Error::RoomNotFound(room_id.to_string())),
        };

        {
            let mut members = room
                .members
                .write()
                .map_err(|_| Error::internal("room member lock poisoned"))?;
            if members.contains(session.id()) {
                return Ok(true);
            }
            if room.max_members > 0 && members.len() >= room.max_members {
                debug!("Join refused, room full: {} ({})", room_id, members.len());
                return Ok(false);
            }
            members.insert(session.id().clone());
        }
        session.add_room(room_id);

        if session.state() == crate::session::SessionState::Closed {
            // Lost a race against close: undo both sides.
            session.remove_room(room_id);
            if let Ok(mut members) = room.members.write() {
                members.remove(session.id());
            }
            if self.auto_delete {
                self.rooms.remove_if(room_id, |_, r| r.member_count() == 0);
            }
            return Ok(false);
        }

        debug!("Session {} joined room {}", session.id(), room_id);
        self.fire(&self.on_join, &room, session);
        Ok(true)
    }

    /// Removes a session from a room, updating both membership sides.
    ///
    /// Leave callbacks fire before the emptied room is auto-deleted.
    /// Returns whether the session was a member.
    pub fn leave(&self, room_id: &str, session: &Arc<Session>) -> bool {
        let room = match self.get(room_id) {
            Some(room) => room,
            None => {
                session.remove_room(room_id);
                return false;
            }
        };

        let removed = room
            .members
            .write()
            .map(|mut g| g.remove(session.id()))
            .unwrap_or(false);
        session.remove_room(room_id);
        if !removed {
            return false;
        }

        debug!("Session {} left room {}", session.id(), room_id);
        self.fire(&self.on_leave, &room, session);

        if self.auto_delete {
            // Re-check emptiness under the map entry so a concurrent join
            // cannot lose its room.
            let deleted = self
                .rooms
                .remove_if(room_id, |_, r| r.member_count() == 0)
                .is_some();
            if deleted {
                info!("Room deleted (empty): {}", room_id);
            }
        }
        true
    }

    /// Removes a session from every room it is in. Used on session close.
    pub fn leave_all(&self, session: &Arc<Session>) {
        for room_id in session.rooms() {
            self.leave(&room_id, session);
        }
    }

    /// Sends a message to every member with an attached active connection.
    ///
    /// Iterates a snapshot of the member set, so concurrent joins and leaves
    /// never disturb delivery — a leaving session may or may not receive the
    /// message. Send failures are swallowed per recipient. Returns the number
    /// of members the message was actually handed to.
    pub fn broadcast(
        &self,
        room_id: &str,
        message: &WireMessage,
        exclude: Option<&SessionId>,
    ) -> Result<usize> {
        let room = self
            .get(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))?;

        let members = room.members();
        let mut delivered = 0;
        for member_id in &members {
            if exclude == Some(member_id) {
                continue;
            }
            let Some(session) = self.sessions.get(member_id) else {
                continue;
            };
            let Some(conn) = session.connection() else {
                continue;
            };
            match conn.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Broadcast to {} in room {} failed: {}",
                    member_id, room_id, e
                ),
            }
        }
        debug!(
            "Broadcast to room {}: {}/{} delivered",
            room_id,
            delivered,
            members.len()
        );
        Ok(delivered)
    }

    fn fire(&self, callbacks: &RwLock<Vec<RoomCallback>>, room: &Arc<Room>, session: &Arc<Session>) {
        let snapshot: Vec<RoomCallback> = match callbacks.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for cb in snapshot {
            if let Err(e) = cb(room, session) {
                warn!(
                    "Room callback failed for {} in {}: {}",
                    session.id(),
                    room.id(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Frame};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (Arc<SessionRegistry>, Arc<RoomRegistry>) {
        let sessions = SessionRegistry::new();
        let rooms = RoomRegistry::new(sessions.clone());
        (sessions, rooms)
    }

    fn active_session(
        sessions: &Arc<SessionRegistry>,
        conn_id: &str,
    ) -> (Arc<Session>, UnboundedReceiver<Frame>) {
        let (conn, rx) = Connection::open(conn_id.to_string());
        (sessions.create(None, Some(conn), None), rx)
    }

    #[test]
    fn test_join_auto_creates_and_is_bidirectional() {
        let (sessions, rooms) = setup();
        let (session, _rx) = active_session(&sessions, "c1");

        assert!(rooms.join("general", &session).unwrap());
        let room = rooms.get("general").unwrap();
        assert!(room.members().contains(session.id()));
        assert!(session.rooms().contains("general"));
    }

    #[test]
    fn test_join_without_auto_create_fails() {
        let sessions = SessionRegistry::new();
        let rooms = RoomRegistry::with_policy(sessions.clone(), false, true, 0);
        let (session, _rx) = active_session(&sessions, "c1");
        assert!(matches!(
            rooms.join("nowhere", &session),
            Err(Error::RoomNotFound(_))
        ));
    }

    #[test]
    fn test_join_full_room_leaves_both_sides_unchanged() {
        let (sessions, rooms) = setup();
        rooms.create_room("tiny", 1);
        let (first, _r1) = active_session(&sessions, "c1");
        let (second, _r2) = active_session(&sessions, "c2");

        assert!(rooms.join("tiny", &first).unwrap());
        assert!(!rooms.join("tiny", &second).unwrap());

        let room = rooms.get("tiny").unwrap();
        assert_eq!(room.member_count(), 1);
        assert!(!room.members().contains(second.id()));
        assert!(!second.rooms().contains("tiny"));
    }

    #[test]
    fn test_rejoin_is_noop() {
        let (sessions, rooms) = setup();
        let (session, _rx) = active_session(&sessions, "c1");
        let joins = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let j = joins.clone();
        rooms.on_join(Arc::new(move |_, _| {
            j.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }));

        assert!(rooms.join("general", &session).unwrap());
        assert!(rooms.join("general", &session).unwrap());
        assert_eq!(joins.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(rooms.get("general").unwrap().member_count(), 1);
    }

    #[test]
    fn test_leave_deletes_empty_room_after_callbacks() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (sessions, rooms_reg) = setup();
        let (session, _rx) = active_session(&sessions, "c1");
        rooms_reg.join("general", &session).unwrap();

        let saw_room_alive = Arc::new(AtomicBool::new(false));
        let flag = saw_room_alive.clone();
        let reg = rooms_reg.clone();
        rooms_reg.on_leave(Arc::new(move |room, _| {
            // The room must still exist while leave callbacks run.
            flag.store(reg.get(room.id()).is_some(), Ordering::SeqCst);
            Ok(())
        }));

        assert!(rooms_reg.leave("general", &session));
        assert!(saw_room_alive.load(Ordering::SeqCst));
        assert!(rooms_reg.get("general").is_none());
        assert!(!session.rooms().contains("general"));

        // Leaving again is a no-op.
        assert!(!rooms_reg.leave("general", &session));
    }

    #[test]
    fn test_broadcast_counts_and_excludes() {
        let (sessions, rooms) = setup();
        let (alice, mut alice_rx) = active_session(&sessions, "c1");
        let (bob, mut bob_rx) = active_session(&sessions, "c2");
        let offline = sessions.create(None, None, None);

        rooms.join("general", &alice).unwrap();
        rooms.join("general", &bob).unwrap();
        rooms.join("general", &offline).unwrap();

        let msg = WireMessage::new("1.0", "chat.message");
        let delivered = rooms.broadcast("general", &msg, Some(alice.id())).unwrap();

        // Bob only: alice excluded, offline has no connection.
        assert_eq!(delivered, 1);
        assert!(matches!(bob_rx.try_recv().unwrap(), Frame::Message(_)));
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_unknown_room() {
        let (_sessions, rooms) = setup();
        let msg = WireMessage::new("1.0", "x");
        assert!(matches!(
            rooms.broadcast("nope", &msg, None),
            Err(Error::RoomNotFound(_))
        ));
    }

    #[test]
    fn test_leave_all() {
        let (sessions, rooms) = setup();
        let (session, _rx) = active_session(&sessions, "c1");
        rooms.join("a", &session).unwrap();
        rooms.join("b", &session).unwrap();

        rooms.leave_all(&session);
        assert!(session.rooms().is_empty());
        assert!(rooms.get("a").is_none());
        assert!(rooms.get("b").is_none());
    }

    #[test]
    fn test_membership_survives_suspension() {
        let (sessions, rooms) = setup();
        let (session, _rx) = active_session(&sessions, "c1");
        rooms.join("general", &session).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(sessions.suspend(session.id()));

        assert!(rooms.get("general").unwrap().members().contains(session.id()));
        assert!(session.rooms().contains("general"));
    }
}
