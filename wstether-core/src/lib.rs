//! # wstether Core — Session-Oriented WebSocket Backend
//!
//! `wstether-core` is the foundational library for the wstether WebSocket
//! backend. It keeps a *session* — user identity, room membership, metadata —
//! alive across the connections that come and go underneath it, and routes
//! typed events to registered handlers.
//!
//! ## Key ideas
//!
//! - **Sessions outlive connections**: a dropped socket *suspends* the
//!   session; `sys.reconnect.request` on a fresh socket restores it, rooms
//!   and all, until the suspend timeout expires.
//! - **Rooms hold session ids, never sockets**: broadcast membership
//!   survives transport churn by construction.
//! - **Typed dispatch**: events route by name and protocol version through
//!   middlewares, an auth gate, and payload schemas; handler return values
//!   become correlated `{event}.response` replies automatically.
//! - **Liveness is explicit**: application-level `sys.ping`/`sys.pong` with
//!   per-session pong timers feed the suspend machinery.
//! - **Pluggable seams**: authentication, pub/sub fan-out across nodes, and
//!   metrics are capability traits with in-process defaults.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Application                        │
//! │     handlers · middlewares · authenticator · pub/sub      │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//! ┌───────────────────────────────────────────────────────────┐
//! │                       wstether Core                       │
//! │  ┌──────────┐ ┌──────────┐ ┌───────┐ ┌─────────────────┐  │
//! │  │ Sessions │ │ Dispatch │ │ Rooms │ │ Heartbeat/Reaper│  │
//! │  └──────────┘ └──────────┘ └───────┘ └─────────────────┘  │
//! │  ┌──────────────────┐ ┌──────────────────────────────┐    │
//! │  │ Connections/Pump │ │ Codec (v/e/p/c/t wire form)  │    │
//! │  └──────────────────┘ └──────────────────────────────┘    │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//! ┌───────────────────────────────────────────────────────────┐
//! │                     tokio-tungstenite                     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use serde_json::json;
//! use wstether_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::new(ServerConfig::new().port(8080)).shared();
//!
//!     server.on("util.echo", handler(|ctx| async move {
//!         Ok(json!({ "echo": ctx.payload().get("msg").cloned() }))
//!     }));
//!
//!     server.on("room.join", handler(|ctx| async move {
//!         ctx.rooms().join("general", &ctx.session)?;
//!         Ok(json!({ "joined": "general" }))
//!     }));
//!
//!     server.listen().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod id;
pub mod metrics;
pub mod middleware;
pub mod protocol;
pub mod pubsub;
pub mod reconnect;
pub mod rooms;
pub mod server;
pub mod session;

pub use auth::{AuthOutcome, Authenticator, HandshakeInfo};
pub use config::{CorsConfig, ServerConfig};
pub use connection::{Connection, ConnectionId, ConnectionRegistry};
pub use context::Context;
pub use correlation::CorrelationTable;
pub use dispatcher::{handler, Dispatcher, EventHandler, Registration, Reply, Schema};
pub use error::{close_code, Error, Result};
pub use heartbeat::Heartbeat;
pub use metrics::{AtomicMetrics, Metrics, NoopMetrics};
pub use middleware::{from_fn, LoggerMiddleware, Middleware, RateLimitMiddleware, Verdict};
pub use protocol::{events, Codec, WireMessage};
pub use pubsub::{LocalPubSub, PubSub};
pub use rooms::{Room, RoomRegistry};
pub use server::Server;
pub use session::{Session, SessionId, SessionRegistry, SessionState};

/// Commonly used types and traits for wstether applications.
///
/// # Examples
///
/// ```
/// use wstether_core::prelude::*;
///
/// let config = ServerConfig::new().port(9000);
/// let server = Server::new(config);
/// ```
pub mod prelude {
    pub use crate::auth::{AuthOutcome, Authenticator, HandshakeInfo};
    pub use crate::config::{CorsConfig, ServerConfig};
    pub use crate::connection::{Connection, ConnectionId};
    pub use crate::context::Context;
    pub use crate::dispatcher::{handler, Registration, Reply, Schema};
    pub use crate::error::{close_code, Error, Result};
    pub use crate::metrics::{AtomicMetrics, Metrics, NoopMetrics};
    pub use crate::middleware::{from_fn, LoggerMiddleware, Middleware, RateLimitMiddleware, Verdict};
    pub use crate::protocol::{events, Codec, WireMessage};
    pub use crate::pubsub::{LocalPubSub, PubSub};
    pub use crate::rooms::{Room, RoomRegistry};
    pub use crate::server::Server;
    pub use crate::session::{Session, SessionId, SessionRegistry, SessionState};
}
