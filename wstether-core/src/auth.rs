//! Pluggable authentication.
//!
//! The runtime never verifies credentials itself. An [`Authenticator`]
//! implementation is consulted during the handshake (and optionally during
//! reconnection token revalidation); the default token extraction reads the
//! `token` URL query parameter or the `Authorization: Bearer` header.
//!
//! # Examples
//!
//! ```
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use wstether_core::auth::{AuthOutcome, Authenticator};
//! use wstether_core::connection::Connection;
//!
//! struct ApiKeyAuth {
//!     key: String,
//! }
//!
//! #[async_trait]
//! impl Authenticator for ApiKeyAuth {
//!     async fn authenticate(&self, _conn: &Arc<Connection>, token: Option<&str>) -> AuthOutcome {
//!         match token {
//!             Some(t) if t == self.key => AuthOutcome::ok("service-account"),
//!             _ => AuthOutcome::failed("invalid API key"),
//!         }
//!     }
//! }
//! ```

use crate::connection::Connection;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The result of an authentication attempt.
#[derive(Debug, Clone, Default)]
pub struct AuthOutcome {
    /// Whether the credentials were accepted.
    pub success: bool,
    /// The authenticated user, on success.
    pub user_id: Option<String>,
    /// Extra session metadata supplied by the authenticator.
    pub metadata: Option<HashMap<String, Value>>,
    /// Human-readable failure message.
    pub error: Option<String>,
    /// Optional failure code overriding the default 1004.
    pub error_code: Option<u16>,
}

impl AuthOutcome {
    /// A successful outcome for the given user.
    pub fn ok(user_id: impl Into<String>) -> Self {
        Self {
            success: true,
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// A successful outcome with no user identity.
    pub fn anonymous() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// A failed outcome with a message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Attaches session metadata to a successful outcome.
    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The request head captured at upgrade time, for token extraction and
/// path/CORS checks. Transport-agnostic: the detached server mode fills
/// this in from whatever HTTP stack performed the upgrade.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    /// Request path without the query string.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    /// Header name/value pairs. Names are matched case-insensitively.
    pub headers: Vec<(String, String)>,
}

impl HandshakeInfo {
    /// Returns the first value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            if parts.next() == Some(name) {
                return Some(parts.next().unwrap_or("").to_string());
            }
        }
        None
    }

    /// Returns the first value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Verifies client credentials.
///
/// Implementations are consulted at two points: [`authenticate`] during the
/// handshake, and [`validate_token`] when a reconnection revalidates its
/// token. Token extraction can be overridden for custom schemes.
///
/// [`authenticate`]: Authenticator::authenticate
/// [`validate_token`]: Authenticator::validate_token
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verifies the token presented at handshake time.
    async fn authenticate(&self, conn: &Arc<Connection>, token: Option<&str>) -> AuthOutcome;

    /// Revalidates a token during reconnection. Defaults to accepting.
    async fn validate_token(&self, _token: &str) -> bool {
        true
    }

    /// Extracts a token from the upgrade request.
    fn extract_token(&self, info: &HandshakeInfo) -> Option<String> {
        default_extract_token(info)
    }
}

/// The default token extraction: `?token=` query parameter first, then the
/// `Authorization: Bearer` header.
pub fn default_extract_token(info: &HandshakeInfo) -> Option<String> {
    if let Some(token) = info.query_param("token") {
        if !token.is_empty() {
            return Some(token);
        }
    }
    info.header("authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
