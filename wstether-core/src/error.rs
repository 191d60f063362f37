//! Error types and result handling for wstether.
//!
//! This module provides a unified error type covering every failure the
//! runtime can produce, from WebSocket transport errors to application-level
//! dispatch failures. Errors that are visible to clients carry a stable
//! numeric code (see [`Error::code`]); transport close codes live in
//! [`close_code`].
//!
//! # Overview
//!
//! The error handling in wstether is designed to be:
//! - **Ergonomic**: `Result<T>` is an alias for `std::result::Result<T, Error>`
//! - **Informative**: each variant names the failing subsystem
//! - **Composable**: `From` impls allow automatic conversion with `?`
//! - **Wire-stable**: [`Error::code`] maps a variant to the numeric code the
//!   client sees in a `sys.error` payload
//!
//! # Examples
//!
//! ```
//! use wstether_core::error::{Error, Result};
//!
//! fn lookup(id: &str) -> Result<()> {
//!     if id.is_empty() {
//!         return Err(Error::SessionNotFound(id.to_string()));
//!     }
//!     Ok(())
//! }
//!
//! let err = lookup("").unwrap_err();
//! assert_eq!(err.code(), 1006);
//! ```

use std::fmt;
use thiserror::Error;

/// The main error type for wstether operations.
///
/// Variants are grouped by taxonomy: protocol, auth, session, room, handler,
/// validation, rate limit, connection, permission, and internal. Transport
/// and serialization errors from the underlying crates are wrapped with
/// `#[from]` conversions.
#[derive(Debug, Error)]
pub enum Error {
    /// WebSocket protocol error from the transport layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error from the listener or socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed wire message: not JSON, wrong root type, or a bad field.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The message carried a protocol version outside the supported set.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The handler requires authentication and the session has no user.
    #[error("Authentication required")]
    AuthRequired,

    /// The authenticator rejected the presented credentials.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Token revalidation during reconnection failed.
    #[error("Token expired")]
    TokenExpired,

    /// No session exists for the given id, or it has been closed.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session already has an attached connection.
    #[error("Session duplicate: {0}")]
    SessionDuplicate(String),

    /// No handler is registered for the event.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// A payload field failed schema validation.
    #[error("Validation failed for field: {field}")]
    Validation {
        /// The payload field that failed its predicate.
        field: String,
    },

    /// The sender exceeded a configured rate limit.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// No room exists for the given id.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The room is at capacity.
    #[error("Room is full: {0}")]
    RoomFull(String),

    /// The caller is not allowed to perform the operation.
    #[error("Forbidden")]
    Forbidden,

    /// A send was attempted on a connection that is already closed.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A pending request/response correlation timed out.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// A `sys.error` reply resolved a pending correlation; the payload is
    /// carried verbatim.
    #[error("Remote error: {0}")]
    Remote(serde_json::Value),

    /// Handler execution error with a free-form description.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Internal runtime error. Clients see an opaque code 1500.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Application-defined error.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// A type alias for `Result<T, Error>` used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the stable numeric code for this error as carried in
    /// `sys.error` payloads.
    ///
    /// Variants without a client-visible meaning map to 1000 (unknown);
    /// internal failures map to the opaque 1500.
    pub fn code(&self) -> u16 {
        match self {
            Error::Protocol(_) | Error::Json(_) => 1001,
            Error::UnsupportedVersion(_) => 1002,
            Error::AuthRequired => 1003,
            Error::AuthFailed(_) => 1004,
            Error::TokenExpired => 1005,
            Error::SessionNotFound(_) => 1006,
            Error::SessionDuplicate(_) => 1007,
            Error::HandlerNotFound(_) => 1008,
            Error::Validation { .. } => 1009,
            Error::RateLimited => 1010,
            Error::RoomNotFound(_) => 1011,
            Error::Forbidden => 1012,
            Error::WebSocket(_) | Error::Io(_) | Error::Handler(_) | Error::Internal(_) => 1500,
            _ => 1000,
        }
    }

    /// Creates a custom error with the given message.
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Creates a handler error with the given message.
    pub fn handler<T: fmt::Display>(msg: T) -> Self {
        Error::Handler(msg.to_string())
    }

    /// Creates an internal error with the given message.
    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }

    /// Creates a protocol error with the given message.
    pub fn protocol<T: fmt::Display>(msg: T) -> Self {
        Error::Protocol(msg.to_string())
    }

    /// Creates a validation error for the given payload field.
    pub fn validation<T: fmt::Display>(field: T) -> Self {
        Error::Validation {
            field: field.to_string(),
        }
    }
}

/// WebSocket close codes used by the server.
///
/// The 4xxx range is application-defined; the rest follow RFC 6455.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server is shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol violation.
    pub const PROTOCOL: u16 = 1002;
    /// Message exceeded the configured maximum size.
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
    /// Internal server error.
    pub const INTERNAL: u16 = 1011;
    /// Authentication required but no token was presented.
    pub const AUTH_REQUIRED: u16 = 4001;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 4002;
    /// Connection displaced by a reconnection to the same session.
    pub const SESSION_DUPLICATE: u16 = 4003;
    /// Heartbeat liveness lost.
    pub const INACTIVITY: u16 = 4004;
    /// Suspended session exceeded the suspend timeout.
    pub const SESSION_EXPIRED: u16 = 4005;
}
