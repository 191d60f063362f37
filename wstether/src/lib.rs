//! # wstether — Session-Oriented WebSocket Backend for Rust
//!
//! wstether is a WebSocket backend library whose unit of identity is the
//! *session*, not the socket. A client that loses its connection keeps its
//! session — user id, room membership, metadata — in a suspended state and
//! reclaims it with a single reconnect request, within a configurable
//! window. Built on `tokio-tungstenite`.
//!
//! This crate is a thin facade over [`wstether_core`]; see the core crate
//! for component-level documentation.
//!
//! ## Features
//!
//! - **Resilient sessions**: active / suspended / closed lifecycle with a
//!   reconnection protocol and a suspended-session reaper
//! - **Typed events**: JSON envelope (`v`/`e`/`p`/`c`/`t`) with versioned
//!   handler registration, payload schemas, and auth gating
//! - **Rooms**: session-id based fan-out that survives socket drops
//! - **Heartbeat**: application-level ping/pong liveness detection
//! - **Request/response**: correlation ids with automatic `.response`
//!   replies and a client-side correlation table
//! - **Pluggable**: authenticator, pub/sub (for multi-node), and metrics
//!   seams
//!
//! ## Quick start
//!
//! ```no_run
//! use serde_json::json;
//! use wstether::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::new(
//!         ServerConfig::new()
//!             .host("0.0.0.0")
//!             .port(8080)
//!             .path("/ws"),
//!     )
//!     .shared();
//!
//!     server.on("chat.message", handler(|ctx| async move {
//!         let text = ctx.payload().get("text").cloned();
//!         ctx.broadcast_to_room("general", "chat.message", json!({ "text": text }))?;
//!         Ok(())
//!     }));
//!
//!     server.listen().await
//! }
//! ```

pub use wstether_core::*;

/// Commonly used types and traits, re-exported from the core.
pub mod prelude {
    pub use wstether_core::prelude::*;
}
