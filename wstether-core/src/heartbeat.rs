//! Application-level heartbeat: liveness pings with per-session pong timers.
//!
//! Every `interval`, each watched session with an attached active connection
//! is sent a `sys.ping` carrying the current timestamp, and a pong timer of
//! `timeout` is armed. A `sys.pong` arriving in time cancels the timer; a
//! timer that fires — or a ping that cannot be sent at all — suspends the
//! session through the [`SessionRegistry`] and closes the dead connection
//! with the inactivity close code.
//!
//! Monitoring stops on session suspension or close. A pong arriving after
//! its timer fired has no effect.

use crate::error::close_code;
use crate::protocol::{events, now_ms, WireMessage};
use crate::session::{SessionId, SessionRegistry};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked after a session is suspended for missing a pong.
pub type TimeoutCallback = Arc<dyn Fn(&SessionId) + Send + Sync>;

struct Entry {
    last_ping_at: u64,
    last_pong_at: u64,
    missed: u32,
    pending: Option<(u64, JoinHandle<()>)>,
}

/// The heartbeat detector.
///
/// Created by the server facade with the configured interval and timeout;
/// sessions are watched after the handshake and unwatched on suspend/close.
pub struct Heartbeat {
    sessions: Arc<SessionRegistry>,
    interval: Duration,
    timeout: Duration,
    version: String,
    watched: DashMap<SessionId, Entry>,
    on_timeout: RwLock<Option<TimeoutCallback>>,
    generation: AtomicU64,
}

impl Heartbeat {
    /// Creates a detector. `version` stamps outgoing `sys.ping` messages.
    pub fn new(
        sessions: Arc<SessionRegistry>,
        interval: Duration,
        timeout: Duration,
        version: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            interval,
            timeout,
            version: version.into(),
            watched: DashMap::new(),
            on_timeout: RwLock::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// Registers an extra callback fired after a timeout suspension.
    pub fn on_timeout(&self, cb: TimeoutCallback) {
        if let Ok(mut guard) = self.on_timeout.write() {
            *guard = Some(cb);
        }
    }

    /// Begins monitoring a session.
    pub fn watch(&self, session_id: &SessionId) {
        self.watched.insert(
            session_id.clone(),
            Entry {
                last_ping_at: 0,
                last_pong_at: 0,
                missed: 0,
                pending: None,
            },
        );
        debug!("Heartbeat watching {}", session_id);
    }

    /// Stops monitoring a session and cancels any pending pong timer.
    pub fn unwatch(&self, session_id: &SessionId) {
        if let Some((_, entry)) = self.watched.remove(session_id) {
            if let Some((_, handle)) = entry.pending {
                handle.abort();
            }
            debug!("Heartbeat unwatched {}", session_id);
        }
    }

    /// Whether a session is currently monitored.
    pub fn is_watched(&self, session_id: &SessionId) -> bool {
        self.watched.contains_key(session_id)
    }

    /// Liveness snapshot for a watched session:
    /// `(last_ping_at, last_pong_at, missed_pongs)`, timestamps in epoch ms
    /// (zero until the first ping or pong).
    pub fn liveness(&self, session_id: &SessionId) -> Option<(u64, u64, u32)> {
        self.watched
            .get(session_id)
            .map(|e| (e.last_ping_at, e.last_pong_at, e.missed))
    }

    /// Records a pong for a session.
    ///
    /// Cancels the pending timer and resets the missed counter. Pongs for
    /// unwatched sessions — including those whose timer already fired — have
    /// no effect.
    pub fn handle_pong(&self, session_id: &SessionId) {
        if let Some(mut entry) = self.watched.get_mut(session_id) {
            if let Some((_, handle)) = entry.pending.take() {
                handle.abort();
            }
            entry.last_pong_at = now_ms();
            entry.missed = 0;
        }
    }

    /// Spawns the periodic ping loop. Abort the returned handle on shutdown.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let heartbeat = self.clone();
        info!(
            "Heartbeat started (interval: {:?}, timeout: {:?})",
            heartbeat.interval, heartbeat.timeout
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick completes immediately; skip it so
            // freshly created sessions get a full interval before pinging.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                heartbeat.tick().await;
            }
        })
    }

    /// Runs one ping round over all watched sessions.
    pub async fn tick(self: &Arc<Self>) {
        let ids: Vec<SessionId> = self.watched.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let Some(session) = self.sessions.get(&id) else {
                self.unwatch(&id);
                continue;
            };
            if !session.is_active() {
                continue;
            }
            let Some(conn) = session.connection() else {
                continue;
            };

            let mut ping = WireMessage::new(self.version.clone(), events::PING);
            ping.payload.insert("t".to_string(), Value::from(now_ms()));

            match conn.send(ping) {
                Ok(()) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                    let timer = {
                        let heartbeat = self.clone();
                        let id = id.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(heartbeat.timeout).await;
                            if heartbeat.clear_pending_if(&id, generation) {
                                heartbeat.expire(&id).await;
                            }
                        })
                    };
                    if let Some(mut entry) = self.watched.get_mut(&id) {
                        entry.last_ping_at = now_ms();
                        if let Some((_, old)) = entry.pending.replace((generation, timer)) {
                            old.abort();
                        }
                    } else {
                        timer.abort();
                    }
                }
                Err(e) => {
                    // A ping that cannot even be queued is as dead as a
                    // missed pong.
                    warn!("Heartbeat ping failed for {}: {}", id, e);
                    self.expire(&id).await;
                }
            }
        }
    }

    /// Clears the pending timer entry if it still belongs to `generation`.
    fn clear_pending_if(&self, session_id: &SessionId, generation: u64) -> bool {
        match self.watched.get_mut(session_id) {
            Some(mut entry) => match entry.pending {
                Some((pending_gen, _)) if pending_gen == generation => {
                    entry.pending = None;
                    entry.missed += 1;
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    async fn expire(&self, session_id: &SessionId) {
        info!("Heartbeat timeout, suspending session {}", session_id);
        self.unwatch(session_id);
        if let Some(conn) = self.sessions.suspend(session_id).await {
            conn.close(close_code::INACTIVITY, "inactivity timeout");
        }
        let cb = self.on_timeout.read().ok().and_then(|g| g.clone());
        if let Some(cb) = cb {
            cb(session_id);
        }
    }
}
