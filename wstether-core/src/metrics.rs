//! Metrics seam.
//!
//! The runtime reports counters through the [`Metrics`] trait; every method
//! has a no-op default so implementations override only what they sink.
//! [`NoopMetrics`] is the default; [`AtomicMetrics`] is a simple in-memory
//! implementation useful in tests and demos.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter sink for runtime events.
pub trait Metrics: Send + Sync {
    /// A connection was registered.
    fn connection_opened(&self) {}
    /// A connection was removed.
    fn connection_closed(&self) {}
    /// A session was created.
    fn session_created(&self) {}
    /// A session transitioned to suspended.
    fn session_suspended(&self) {}
    /// A session was closed.
    fn session_closed(&self) {}
    /// A session was rebound by a reconnection.
    fn session_reconnected(&self) {}
    /// A message was dispatched, keyed by event name.
    fn message_received(&self, _event: &str) {}
    /// A message was sent, keyed by event name.
    fn message_sent(&self, _event: &str) {}
    /// An error reply was produced, keyed by wire code.
    fn error(&self, _code: u16) {}
    /// A session joined a room.
    fn room_joined(&self) {}
    /// A session left a room.
    fn room_left(&self) {}
}

/// Discards everything.
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// In-memory counters backed by atomics.
#[derive(Default)]
pub struct AtomicMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    sessions_created: AtomicU64,
    sessions_suspended: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_reconnected: AtomicU64,
    received: DashMap<String, u64>,
    sent: DashMap<String, u64>,
    errors: DashMap<u16, u64>,
    rooms_joined: AtomicU64,
    rooms_left: AtomicU64,
}

impl AtomicMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total connections opened.
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    /// Total connections closed.
    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    /// Total sessions created.
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    /// Total sessions suspended.
    pub fn sessions_suspended(&self) -> u64 {
        self.sessions_suspended.load(Ordering::Relaxed)
    }

    /// Total sessions closed.
    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    /// Total successful reconnections.
    pub fn sessions_reconnected(&self) -> u64 {
        self.sessions_reconnected.load(Ordering::Relaxed)
    }

    /// Messages received for one event name.
    pub fn received_for(&self, event: &str) -> u64 {
        self.received.get(event).map(|v| *v).unwrap_or(0)
    }

    /// Messages sent for one event name.
    pub fn sent_for(&self, event: &str) -> u64 {
        self.sent.get(event).map(|v| *v).unwrap_or(0)
    }

    /// Error replies for one wire code.
    pub fn errors_for(&self, code: u16) -> u64 {
        self.errors.get(&code).map(|v| *v).unwrap_or(0)
    }

    /// Total room joins.
    pub fn rooms_joined(&self) -> u64 {
        self.rooms_joined.load(Ordering::Relaxed)
    }

    /// Total room leaves.
    pub fn rooms_left(&self) -> u64 {
        self.rooms_left.load(Ordering::Relaxed)
    }
}

impl Metrics for AtomicMetrics {
    fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    fn session_suspended(&self) {
        self.sessions_suspended.fetch_add(1, Ordering::Relaxed);
    }

    fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn session_reconnected(&self) {
        self.sessions_reconnected.fetch_add(1, Ordering::Relaxed);
    }

    fn message_received(&self, event: &str) {
        *self.received.entry(event.to_string()).or_insert(0) += 1;
    }

    fn message_sent(&self, event: &str) {
        *self.sent.entry(event.to_string()).or_insert(0) += 1;
    }

    fn error(&self, code: u16) {
        *self.errors.entry(code).or_insert(0) += 1;
    }

    fn room_joined(&self) {
        self.rooms_joined.fetch_add(1, Ordering::Relaxed);
    }

    fn room_left(&self) {
        self.rooms_left.fetch_add(1, Ordering::Relaxed);
    }
}
