//! Server configuration.
//!
//! [`ServerConfig`] enumerates every tunable the runtime honors, with
//! builder-style setters and sensible defaults.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use wstether_core::config::ServerConfig;
//!
//! let config = ServerConfig::new()
//!     .host("127.0.0.1")
//!     .port(9000)
//!     .path("/ws")
//!     .heartbeat_interval(Duration::from_secs(15))
//!     .heartbeat_timeout(Duration::from_secs(5))
//!     .require_auth(true);
//!
//! assert_eq!(config.addr(), "127.0.0.1:9000");
//! ```

use crate::protocol::Codec;
use std::collections::HashSet;
use std::time::Duration;

/// CORS headers applied to upgrade responses.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// `Access-Control-Allow-Origin` value.
    pub allow_origin: String,
    /// `Access-Control-Allow-Headers` value.
    pub allow_headers: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_headers: "*".to_string(),
        }
    }
}

/// Every knob the server honors.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host for bound mode.
    pub host: String,
    /// Bind port for bound mode.
    pub port: u16,
    /// WebSocket upgrade path.
    pub path: String,
    /// Current protocol version; the default for messages without `v`.
    pub protocol_version: String,
    /// Admissible protocol versions.
    pub supported_versions: HashSet<String>,
    /// Minimum admissible version, inclusive.
    pub minimum_version: Option<String>,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// How long to wait for a pong before suspending.
    pub heartbeat_timeout: Duration,
    /// How long a suspended session stays reconnectable.
    pub session_suspend_timeout: Duration,
    /// Interval between reaper sweeps.
    pub session_cleanup_interval: Duration,
    /// Refuse connections that present no token.
    pub require_auth: bool,
    /// Budget for the authenticator call during the handshake.
    pub auth_timeout: Duration,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Accept compressed upgrades when the transport supports negotiation.
    pub compression: bool,
    /// CORS headers for upgrade responses, if any.
    pub cors: Option<CorsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut supported = HashSet::new();
        supported.insert("1.0".to_string());
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/ws".to_string(),
            protocol_version: "1.0".to_string(),
            supported_versions: supported,
            minimum_version: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            session_suspend_timeout: Duration::from_secs(300),
            session_cleanup_interval: Duration::from_secs(60),
            require_auth: false,
            auth_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
            compression: false,
            cors: None,
        }
    }
}

impl ServerConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bind host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the bind port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the WebSocket upgrade path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the current protocol version (also marking it supported).
    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.supported_versions.insert(version.clone());
        self.protocol_version = version;
        self
    }

    /// Replaces the supported version set.
    pub fn supported_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_versions = versions.into_iter().map(Into::into).collect();
        self.supported_versions.insert(self.protocol_version.clone());
        self
    }

    /// Sets the minimum admissible version.
    pub fn minimum_version(mut self, version: impl Into<String>) -> Self {
        self.minimum_version = Some(version.into());
        self
    }

    /// Sets the heartbeat ping interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the pong timeout.
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets how long suspended sessions stay reconnectable.
    pub fn session_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.session_suspend_timeout = timeout;
        self
    }

    /// Sets the reaper sweep interval.
    pub fn session_cleanup_interval(mut self, interval: Duration) -> Self {
        self.session_cleanup_interval = interval;
        self
    }

    /// Requires a token at handshake time.
    pub fn require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    /// Sets the authenticator call budget.
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Sets the maximum inbound message size.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Enables or disables compressed upgrades.
    pub fn compression(mut self, enable: bool) -> Self {
        self.compression = enable;
        self
    }

    /// Sets the CORS headers for upgrade responses.
    pub fn cors(mut self, cors: CorsConfig) -> Self {
        self.cors = Some(cors);
        self
    }

    /// The bind address, `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds the protocol codec this configuration describes.
    pub fn codec(&self) -> Codec {
        let mut codec =
            Codec::new(self.protocol_version.clone()).supported(self.supported_versions.clone());
        if let Some(ref min) = self.minimum_version {
            codec = codec.minimum(min.clone());
        }
        codec
    }
}
