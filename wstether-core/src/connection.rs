//! WebSocket connection management.
//!
//! A [`Connection`] wraps a single socket: an outbound send primitive, a
//! close-once state flag, a nullable back-reference to the session it is
//! attached to, and a done-signal that completes with the close code.
//! Connections are short-lived and disposable — the session layer is what
//! survives them.
//!
//! # Architecture
//!
//! Each connection runs two concurrent tasks (see [`run_connection`]):
//!
//! - **Read task**: receives frames from the client, parses them through the
//!   [`Codec`](crate::protocol::Codec), and forwards validated messages to
//!   the inbound channel. Frames that fail parsing are surfaced on the error
//!   channel and never reach the handler path; a single bad frame does not
//!   terminate the connection.
//! - **Write task**: drains the outbound channel and writes to the socket,
//!   so slow clients never block message processing.
//!
//! # Examples
//!
//! ```
//! use wstether_core::connection::Connection;
//! use wstether_core::protocol::WireMessage;
//!
//! let (conn, _outbound) = Connection::open("conn_1".to_string());
//! conn.send(WireMessage::new("1.0", "util.echo")).unwrap();
//!
//! conn.close(1000, "bye");
//! assert!(!conn.is_active());
//! assert!(conn.send(WireMessage::new("1.0", "late")).is_err());
//! ```

use crate::error::{Error, Result};
use crate::protocol::{now_ms, Codec, WireMessage};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// A unique identifier for a WebSocket connection.
pub type ConnectionId = String;

/// An outbound unit queued on a connection.
#[derive(Debug)]
pub enum Frame {
    /// A protocol message, serialized by the write task.
    Message(WireMessage),
    /// Pre-serialized text, written verbatim.
    Raw(String),
    /// Close the socket with a code and reason.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// A single transport socket and its send side.
///
/// `Connection` is shared as `Arc<Connection>`: the registry holds one
/// reference for iteration and close-on-shutdown, the attached session holds
/// another, and the pump owns the socket itself.
///
/// State becomes closed exactly once, either via a local [`close`] request
/// or remote termination; afterwards every send fails with
/// [`Error::ConnectionClosed`].
///
/// [`close`]: Connection::close
pub struct Connection {
    id: ConnectionId,
    connected_at: u64,
    session_id: RwLock<Option<String>>,
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<Frame>,
    done: watch::Sender<Option<u16>>,
}

impl Connection {
    /// Creates a connection and returns it together with the outbound frame
    /// receiver that the write task (or a test) drains.
    pub fn open(id: ConnectionId) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done, _) = watch::channel(None);
        let conn = Arc::new(Self {
            id,
            connected_at: now_ms(),
            session_id: RwLock::new(None),
            closed: AtomicBool::new(false),
            outbound: tx,
            done,
        });
        (conn, rx)
    }

    /// Returns the unique identifier for this connection.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Unix timestamp (ms) when the connection was established.
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Whether the connection is still open.
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// The session this connection is attached to, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|g| g.clone())
    }

    pub(crate) fn attach_session(&self, session_id: &str) {
        if let Ok(mut guard) = self.session_id.write() {
            *guard = Some(session_id.to_string());
        }
    }

    pub(crate) fn detach_session(&self) {
        if let Ok(mut guard) = self.session_id.write() {
            *guard = None;
        }
    }

    /// Queues a protocol message for delivery.
    ///
    /// Returns immediately; the write task performs the actual socket write.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] if the connection has been closed.
    pub fn send(&self, message: WireMessage) -> Result<()> {
        if !self.is_active() {
            return Err(Error::ConnectionClosed(self.id.clone()));
        }
        self.outbound
            .send(Frame::Message(message))
            .map_err(|_| Error::ConnectionClosed(self.id.clone()))
    }

    /// Queues pre-serialized text for delivery.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::ConnectionClosed(self.id.clone()));
        }
        self.outbound
            .send(Frame::Raw(text.into()))
            .map_err(|_| Error::ConnectionClosed(self.id.clone()))
    }

    /// Requests a close with the given code and reason.
    ///
    /// The first close wins; later calls are no-ops. Returns whether this
    /// call performed the close.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.outbound.send(Frame::Close {
            code,
            reason: reason.into(),
        });
        let _ = self.done.send(Some(code));
        true
    }

    /// Marks the connection closed after remote termination.
    pub(crate) fn finish(&self, code: u16) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.done.send(Some(code));
        }
    }

    /// The close code, if the connection has closed.
    pub fn close_code(&self) -> Option<u16> {
        *self.done.borrow()
    }

    /// Waits until the connection closes and returns the close code.
    pub async fn done(&self) -> u16 {
        let mut rx = self.done.subscribe();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return self.close_code().unwrap_or(1006);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("session_id", &self.session_id())
            .finish()
    }
}

/// Lifecycle callback invoked with the affected connection.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) -> Result<()> + Send + Sync>;

/// Tracks live connections and emits open/close callbacks.
///
/// Uses [`DashMap`] for lock-free concurrent access. Callbacks fire in
/// registration order; a failing callback is logged and does not prevent
/// later callbacks from running.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    on_open: RwLock<Vec<ConnectionCallback>>,
    on_close: RwLock<Vec<ConnectionCallback>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            on_open: RwLock::new(Vec::new()),
            on_close: RwLock::new(Vec::new()),
        }
    }

    /// Registers a callback fired when a connection is added.
    pub fn on_open(&self, cb: ConnectionCallback) {
        if let Ok(mut guard) = self.on_open.write() {
            guard.push(cb);
        }
    }

    /// Registers a callback fired when a connection is removed.
    pub fn on_close(&self, cb: ConnectionCallback) {
        if let Ok(mut guard) = self.on_close.write() {
            guard.push(cb);
        }
    }

    /// Adds a connection. Returns the total count after adding.
    pub fn add(&self, conn: Arc<Connection>) -> usize {
        let id = conn.id().clone();
        self.connections.insert(id.clone(), conn.clone());
        let count = self.connections.len();
        info!("Connection added: {} (total: {})", id, count);
        self.fire(&self.on_open, &conn);
        count
    }

    /// Removes a connection. Returns it if it existed.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(id).map(|(_, conn)| conn);
        if let Some(ref conn) = removed {
            info!(
                "Connection removed: {} (total: {})",
                id,
                self.connections.len()
            );
            self.fire(&self.on_close, conn);
        }
        removed
    }

    /// Retrieves a connection by id.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Number of tracked connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// All tracked connection ids, in no particular order.
    pub fn all_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Closes every tracked connection, for shutdown.
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.connections.iter() {
            entry.value().close(code, reason);
        }
    }

    fn fire(&self, callbacks: &RwLock<Vec<ConnectionCallback>>, conn: &Arc<Connection>) {
        let snapshot: Vec<ConnectionCallback> = match callbacks.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for cb in snapshot {
            if let Err(e) = cb(conn) {
                warn!("Connection callback failed for {}: {}", conn.id(), e);
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a connection's socket until either side terminates.
///
/// Spawns the read and write tasks, waits for the first to finish, aborts
/// the other, and marks the connection closed with the observed close code
/// (1006 for abnormal termination). The caller owns registry removal and
/// session suspension.
pub async fn run_connection<S>(
    stream: WebSocketStream<S>,
    conn: Arc<Connection>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    codec: Arc<Codec>,
    inbound: mpsc::UnboundedSender<WireMessage>,
    errors: mpsc::UnboundedSender<Error>,
) -> u16
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = stream.split();

    let conn_id = conn.id().clone();
    let mut rx = outbound;
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::Message(message) => match message.to_json() {
                    Ok(text) => {
                        if let Err(e) = ws_sender.send(WsMessage::Text(text)).await {
                            warn!("Write failed for {}: {}", conn_id, e);
                            break;
                        }
                    }
                    Err(e) => warn!("Serialization failed for {}: {}", conn_id, e),
                },
                Frame::Raw(text) => {
                    if let Err(e) = ws_sender.send(WsMessage::Text(text)).await {
                        warn!("Write failed for {}: {}", conn_id, e);
                        break;
                    }
                }
                Frame::Close { code, reason } => {
                    let _ = ws_sender
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        debug!("Write task ended");
    });

    let conn_id = conn.id().clone();
    let read_task = tokio::spawn(async move {
        let mut close_code: u16 = 1006;
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(WsMessage::Text(text)) => match codec.parse(&text) {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Rejected frame from {}: {}", conn_id, e);
                        let _ = errors.send(e);
                    }
                },
                Ok(WsMessage::Binary(_)) => {
                    let _ = errors.send(Error::protocol("binary frames are not supported"));
                }
                Ok(WsMessage::Close(frame)) => {
                    close_code = frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                    debug!("Close frame from {} (code {})", conn_id, close_code);
                    break;
                }
                Ok(_) => {
                    // Transport ping/pong; tungstenite answers these itself.
                }
                Err(e) => {
                    warn!("Read error for {}: {}", conn_id, e);
                    break;
                }
            }
        }
        close_code
    });

    let write_abort = write_task.abort_handle();
    let read_abort = read_task.abort_handle();
    let code = tokio::select! {
        _ = write_task => {
            read_abort.abort();
            1000
        }
        result = read_task => {
            write_abort.abort();
            result.unwrap_or(1006)
        }
    };

    conn.finish(code);
    code
}
