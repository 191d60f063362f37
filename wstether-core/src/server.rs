//! The server facade: composition root, accept loop, handshake, and the
//! per-connection read pump.
//!
//! Two transport modes, selected at start:
//!
//! - **Bound**: [`Server::listen`] opens its own TCP listener and performs
//!   the WebSocket upgrade (path check, CORS headers, size limits).
//! - **Detached**: the embedding application performs the upgrade with its
//!   own HTTP stack and hands the upgraded stream to
//!   [`Server::handle_upgraded`] together with the captured request head.
//!
//! Per connection the server runs the handshake (token extraction,
//! authentication with a timeout, session creation, heartbeat arming,
//! `sys.session.created`) and then pumps the inbound stream through the
//! dispatcher — **in arrival order, one dispatch at a time per session** —
//! until the socket terminates, at which point the session is *suspended*,
//! never closed, so a later reconnection can restore it.
//!
//! # Examples
//!
//! ```no_run
//! use serde_json::json;
//! use wstether_core::config::ServerConfig;
//! use wstether_core::dispatcher::handler;
//! use wstether_core::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> wstether_core::error::Result<()> {
//!     let server = Server::new(ServerConfig::new().port(8080)).shared();
//!
//!     server.on("util.echo", handler(|ctx| async move {
//!         Ok(json!({ "echo": ctx.payload().get("msg").cloned() }))
//!     }));
//!
//!     server.listen().await
//! }
//! ```

use crate::auth::{default_extract_token, Authenticator, HandshakeInfo};
use crate::config::ServerConfig;
use crate::connection::{run_connection, Connection, ConnectionRegistry};
use crate::context::Context;
use crate::dispatcher::{Dispatcher, ErrorHandler, EventHandler, Registration};
use crate::error::{close_code, Error, Result};
use crate::heartbeat::Heartbeat;
use crate::id;
use crate::metrics::{Metrics, NoopMetrics};
use crate::middleware::Middleware;
use crate::protocol::{events, now_ms, Codec, WireMessage};
use crate::pubsub::PubSub;
use crate::reconnect::handle_reconnect;
use crate::rooms::RoomRegistry;
use crate::session::{Session, SessionRegistry};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// The WebSocket backend server.
///
/// Composes the codec, registries, heartbeat, and dispatcher; owns the
/// accept loop and every background task. Configure with the builder-style
/// methods, then call [`shared`](Server::shared) and either
/// [`listen`](Server::listen) (bound mode) or
/// [`handle_upgraded`](Server::handle_upgraded) (detached mode).
pub struct Server {
    config: ServerConfig,
    codec: Arc<Codec>,
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomRegistry>,
    heartbeat: Arc<Heartbeat>,
    dispatcher: Arc<Dispatcher>,
    authenticator: Option<Arc<dyn Authenticator>>,
    pubsub: Option<Arc<dyn PubSub>>,
    metrics: Arc<dyn Metrics>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Creates a server from a configuration and wires the components.
    pub fn new(config: ServerConfig) -> Self {
        let codec = Arc::new(config.codec());
        let sessions = SessionRegistry::new();
        sessions.set_protocol_version(config.protocol_version.clone());
        let rooms = RoomRegistry::new(sessions.clone());
        let heartbeat = Heartbeat::new(
            sessions.clone(),
            config.heartbeat_interval,
            config.heartbeat_timeout,
            config.protocol_version.clone(),
        );
        let dispatcher = Dispatcher::new();
        let (shutdown, _) = watch::channel(false);

        // Closing a session must drop it from every room.
        {
            let rooms = rooms.clone();
            sessions.set_room_cleanup(move |session| rooms.leave_all(session));
        }
        // Suspension and close both stop liveness monitoring.
        {
            let heartbeat = heartbeat.clone();
            sessions.on_suspended(Arc::new(move |session| {
                heartbeat.unwatch(session.id());
                Ok(())
            }));
        }
        {
            let heartbeat = heartbeat.clone();
            sessions.on_closed(Arc::new(move |session| {
                heartbeat.unwatch(session.id());
                Ok(())
            }));
        }

        Self {
            config,
            codec,
            connections: Arc::new(ConnectionRegistry::new()),
            sessions,
            rooms,
            heartbeat,
            dispatcher,
            authenticator: None,
            pubsub: None,
            metrics: Arc::new(NoopMetrics),
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Plugs in an authenticator.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Plugs in an external pub/sub transport for multi-node fan-out.
    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Plugs in a metrics sink. Call once, before the server starts.
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.dispatcher.set_metrics(metrics.clone());
        {
            let m = metrics.clone();
            self.connections.on_open(Arc::new(move |_| {
                m.connection_opened();
                Ok(())
            }));
        }
        {
            let m = metrics.clone();
            self.connections.on_close(Arc::new(move |_| {
                m.connection_closed();
                Ok(())
            }));
        }
        {
            let m = metrics.clone();
            self.sessions.on_created(Arc::new(move |_| {
                m.session_created();
                Ok(())
            }));
        }
        {
            let m = metrics.clone();
            self.sessions.on_suspended(Arc::new(move |_| {
                m.session_suspended();
                Ok(())
            }));
        }
        {
            let m = metrics.clone();
            self.sessions.on_reconnected(Arc::new(move |_| {
                m.session_reconnected();
                Ok(())
            }));
        }
        {
            let m = metrics.clone();
            self.sessions.on_closed(Arc::new(move |_| {
                m.session_closed();
                Ok(())
            }));
        }
        {
            let m = metrics.clone();
            self.rooms.on_join(Arc::new(move |_, _| {
                m.room_joined();
                Ok(())
            }));
        }
        {
            let m = metrics.clone();
            self.rooms.on_leave(Arc::new(move |_, _| {
                m.room_left();
                Ok(())
            }));
        }
        self.metrics = metrics;
        self
    }

    /// Registers a handler for an event with default options.
    pub fn on(&self, event: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.dispatcher.on(event, handler);
    }

    /// Adds a full handler registration.
    pub fn register(&self, registration: Registration) {
        self.dispatcher.register(registration);
    }

    /// Appends a global middleware.
    pub fn layer(&self, middleware: Arc<dyn Middleware>) {
        self.dispatcher.layer(middleware);
    }

    /// Replaces the not-found handler.
    pub fn not_found(&self, handler: Arc<dyn EventHandler>) {
        self.dispatcher.not_found(handler);
    }

    /// Replaces the handler-error callback.
    pub fn on_error(&self, handler: ErrorHandler) {
        self.dispatcher.on_error(handler);
    }

    /// The session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// The room registry.
    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// The connection registry.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// The heartbeat detector.
    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Wraps the server for sharing across tasks.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Starts the background tasks: heartbeat, reaper, and the pub/sub
    /// bridge. Idempotent; [`listen`](Server::listen) calls it for you.
    pub async fn start_background(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut tasks = vec![
            self.heartbeat.start(),
            self.sessions.start_reaper(
                self.config.session_suspend_timeout,
                self.config.session_cleanup_interval,
            ),
        ];

        if let Some(ref pubsub) = self.pubsub {
            let mut broadcast_sub = pubsub.subscribe("ws:broadcast").await?;
            let sessions = self.sessions.clone();
            tasks.push(tokio::spawn(async move {
                while let Some((_, message)) = broadcast_sub.recv().await {
                    sessions.broadcast_all(&message);
                }
            }));

            let mut room_sub = pubsub.subscribe("ws:room:*").await?;
            let rooms = self.rooms.clone();
            tasks.push(tokio::spawn(async move {
                while let Some((channel, mut message)) = room_sub.recv().await {
                    let room_id = message
                        .payload
                        .remove("_roomId")
                        .and_then(|v| v.as_str().map(String::from))
                        .or_else(|| channel.strip_prefix("ws:room:").map(String::from));
                    match room_id {
                        Some(room_id) => {
                            if let Err(e) = rooms.broadcast(&room_id, &message, None) {
                                debug!("Pub/sub room fan-out skipped: {}", e);
                            }
                        }
                        None => warn!("Pub/sub room message without a room id on {}", channel),
                    }
                }
            }));
        }

        if let Ok(mut guard) = self.tasks.lock() {
            guard.extend(tasks);
        }
        Ok(())
    }

    /// Bound mode: binds the configured address and accepts until shutdown.
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        self.start_background().await?;
        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("wstether listening on {} (path {})", addr, self.config.path);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_socket(stream, peer).await {
                            debug!("Connection from {} ended with error: {}", peer, e);
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Accept loop stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stops the accept loop, closes every connection with the going-away
    /// code, stops the heartbeat and reaper, and closes all sessions.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.connections
            .close_all(close_code::GOING_AWAY, "server shutting down");
        self.sessions
            .close_all(close_code::GOING_AWAY, Some("server shutting down"))
            .await;
        if let Some(ref pubsub) = self.pubsub {
            let _ = pubsub.close().await;
        }
        info!("Server shut down");
    }

    async fn handle_socket(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut info: Option<HandshakeInfo> = None;
        let config = &self.config;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);

        let callback = |req: &Request, mut resp: Response| {
            if req.uri().path() != config.path {
                let mut not_found = ErrorResponse::new(Some("not found".to_string()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                return Err(not_found);
            }
            if let Some(ref cors) = config.cors {
                if let Ok(value) = HeaderValue::from_str(&cors.allow_origin) {
                    resp.headers_mut().insert("access-control-allow-origin", value);
                }
                if let Ok(value) = HeaderValue::from_str(&cors.allow_headers) {
                    resp.headers_mut().insert("access-control-allow-headers", value);
                }
            }
            info = Some(HandshakeInfo {
                path: req.uri().path().to_string(),
                query: req.uri().query().map(String::from),
                headers: req
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.to_string(),
                            String::from_utf8_lossy(value.as_bytes()).to_string(),
                        )
                    })
                    .collect(),
            });
            Ok(resp)
        };

        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
        debug!("WebSocket upgrade complete from {}", peer);
        self.handle_upgraded(ws_stream, info.unwrap_or_default()).await
    }

    /// Detached mode: drives an already-upgraded WebSocket stream.
    ///
    /// The caller owns path routing and the HTTP upgrade; `info` carries the
    /// request head for token extraction. Resolves when the connection ends,
    /// after the session has been suspended.
    pub async fn handle_upgraded<S>(
        self: &Arc<Self>,
        stream: WebSocketStream<S>,
        info: HandshakeInfo,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, outbound_rx) = Connection::open(id::connection_id());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(run_connection(
            stream,
            conn.clone(),
            outbound_rx,
            self.codec.clone(),
            inbound_tx,
            errors_tx,
        ));

        self.connections.add(conn.clone());
        let result = self.drive_connection(&conn, info, inbound_rx, errors_rx).await;
        let _ = pump.await;
        self.connections.remove(conn.id());
        result
    }

    /// The handshake and read pump for one connection.
    async fn drive_connection(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        info: HandshakeInfo,
        mut inbound_rx: mpsc::UnboundedReceiver<WireMessage>,
        mut errors_rx: mpsc::UnboundedReceiver<Error>,
    ) -> Result<()> {
        // Token extraction and authentication.
        let token = match self.authenticator {
            Some(ref auth) => auth.extract_token(&info),
            None => default_extract_token(&info),
        };
        if self.config.require_auth && token.is_none() {
            conn.close(close_code::AUTH_REQUIRED, "authentication required");
            return Ok(());
        }

        let mut user_id = None;
        let mut metadata = None;
        if let (Some(auth), Some(token)) = (self.authenticator.as_ref(), token.as_deref()) {
            let attempt =
                tokio::time::timeout(self.config.auth_timeout, auth.authenticate(conn, Some(token)))
                    .await;
            match attempt {
                Ok(outcome) if outcome.success => {
                    user_id = outcome.user_id;
                    metadata = outcome.metadata;
                }
                Ok(outcome) => {
                    let reason = outcome
                        .error
                        .unwrap_or_else(|| "authentication failed".to_string());
                    info!("Handshake auth failed for {}: {}", conn.id(), reason);
                    conn.close(close_code::AUTH_FAILED, reason);
                    return Ok(());
                }
                Err(_) => {
                    warn!("Handshake auth timed out for {}", conn.id());
                    conn.close(close_code::AUTH_FAILED, "authentication timed out");
                    return Ok(());
                }
            }
        }

        // Fresh session bound to this connection; heartbeat armed.
        let mut session = self
            .sessions
            .create(user_id, Some(conn.clone()), metadata);
        self.heartbeat.watch(session.id());

        let mut created = Map::new();
        created.insert(
            "sessionId".to_string(),
            Value::String(session.id().clone()),
        );
        if let Some(user) = session.user_id() {
            created.insert("userId".to_string(), Value::String(user));
        }
        let notice = WireMessage {
            version: self.config.protocol_version.clone(),
            event: events::SESSION_CREATED.to_string(),
            payload: created,
            correlation_id: None,
            timestamp: now_ms(),
        };
        conn.send(notice)?;

        // Bad frames never reach the handler path; answer them directly.
        let error_drain = {
            let conn = conn.clone();
            let metrics = self.metrics.clone();
            let version = self.config.protocol_version.clone();
            tokio::spawn(async move {
                while let Some(err) = errors_rx.recv().await {
                    let code = err.code();
                    metrics.error(code);
                    let mut payload = Map::new();
                    payload.insert("code".to_string(), Value::from(code));
                    payload.insert("message".to_string(), Value::String(err.to_string()));
                    let reply = WireMessage {
                        version: version.clone(),
                        event: events::ERROR.to_string(),
                        payload,
                        correlation_id: None,
                        timestamp: now_ms(),
                    };
                    if conn.send(reply).is_err() {
                        break;
                    }
                }
            })
        };

        // The read pump: arrival order, one dispatch in flight per session.
        while let Some(message) = inbound_rx.recv().await {
            session.touch();
            match message.event.as_str() {
                events::PONG => self.heartbeat.handle_pong(session.id()),
                events::RECONNECT_REQUEST => {
                    session = self.reconnect_flow(conn, session, message).await;
                }
                _ => {
                    let ctx = Context::new(
                        session.clone(),
                        conn.clone(),
                        message,
                        self.sessions.clone(),
                        self.rooms.clone(),
                    );
                    self.dispatcher.dispatch(ctx).await;
                }
            }
        }
        error_drain.abort();

        // Socket gone: suspend, never close, so reconnection can restore.
        let still_attached = session
            .connection()
            .map(|c| c.id() == conn.id())
            .unwrap_or(false);
        if still_attached {
            self.sessions.suspend(session.id()).await;
        }
        Ok(())
    }

    /// Handles `sys.reconnect.request` arriving on a live connection.
    ///
    /// On success the connection migrates to the claimed session and the
    /// placeholder session created at handshake time is retired; the pump
    /// continues under the restored session.
    async fn reconnect_flow(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        current: Arc<Session>,
        message: WireMessage,
    ) -> Arc<Session> {
        let outcome = handle_reconnect(
            &self.sessions,
            self.authenticator.as_ref(),
            self.config.require_auth,
            conn,
            &message,
        )
        .await;

        match outcome {
            Ok(restored) => {
                if restored.id() != current.id() {
                    self.sessions.release_connection(current.id()).await;
                    self.sessions
                        .close(current.id(), close_code::NORMAL, Some("superseded by reconnection"))
                        .await;
                }
                self.heartbeat.watch(restored.id());
                restored
            }
            Err(e) => {
                let code = e.code();
                self.metrics.error(code);
                debug!("Reconnect refused on {}: {}", conn.id(), e);
                let mut payload = Map::new();
                payload.insert("code".to_string(), Value::from(code));
                payload.insert("message".to_string(), Value::String(e.to_string()));
                let reply = WireMessage {
                    version: message.version.clone(),
                    event: events::ERROR.to_string(),
                    payload,
                    correlation_id: message.correlation_id.clone(),
                    timestamp: now_ms(),
                };
                if let Err(send_err) = conn.send(reply) {
                    debug!("Reconnect error reply failed: {}", send_err);
                }
                current
            }
        }
    }
}
