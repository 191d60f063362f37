//! Wire message types and the protocol codec.
//!
//! Every frame on the wire is a single JSON object with short keys:
//!
//! ```text
//! { "v": "1.0", "e": "<event>", "p": { ... }, "c": "<correlation-id>?", "t": <ms-since-epoch> }
//! ```
//!
//! [`WireMessage`] is the parsed form used everywhere inside the runtime.
//! [`Codec`] owns the version policy: which protocol versions are admissible
//! and what a message without a `v` field defaults to.
//!
//! # Ingress rules
//!
//! - `v` missing → the codec's current version
//! - `p` missing → empty object
//! - `c`, `t` optional
//! - unknown fields are tolerated and dropped
//! - `e` missing, empty, or not a string → protocol error
//! - `p` present but not an object → protocol error
//! - `v` present but outside the supported set → unsupported-version error
//!
//! # Examples
//!
//! ```
//! use wstether_core::protocol::Codec;
//!
//! let codec = Codec::new("1.0");
//! let msg = codec.parse(r#"{"e":"util.echo","c":"r1","p":{"msg":"hi"}}"#).unwrap();
//! assert_eq!(msg.event, "util.echo");
//! assert_eq!(msg.version, "1.0");
//! assert_eq!(msg.payload_str("msg"), Some("hi"));
//! ```

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved event names used by the runtime itself (prefix `sys.`).
pub mod events {
    /// Server → client, after a successful handshake.
    pub const SESSION_CREATED: &str = "sys.session.created";
    /// Server → client, after a successful reconnection.
    pub const SESSION_RESTORED: &str = "sys.session.restored";
    /// Server → client, when the session transitions to suspended.
    pub const SESSION_SUSPENDED: &str = "sys.session.suspended";
    /// Server → client, when the session is closed.
    pub const SESSION_CLOSED: &str = "sys.session.closed";
    /// Server → client liveness probe.
    pub const PING: &str = "sys.ping";
    /// Client → server liveness answer.
    pub const PONG: &str = "sys.pong";
    /// Client → server request to rebind to an existing session.
    pub const RECONNECT_REQUEST: &str = "sys.reconnect.request";
    /// Server → client notice that the connection is being dropped.
    pub const DISCONNECT: &str = "sys.disconnect";
    /// Server → client error report.
    pub const ERROR: &str = "sys.error";
}

/// Returns the current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A parsed wire message.
///
/// `WireMessage` is cheap to clone; payloads are plain `serde_json` maps.
///
/// # Examples
///
/// ```
/// use wstether_core::protocol::WireMessage;
/// use serde_json::json;
///
/// let msg = WireMessage::new("1.0", "chat.message")
///     .with_payload(json!({"text": "hello"}))
///     .with_correlation("r42");
///
/// let text = msg.to_json().unwrap();
/// assert!(text.contains(r#""e":"chat.message""#));
/// assert!(text.contains(r#""c":"r42""#));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// Protocol version this message speaks.
    pub version: String,
    /// Event name; never empty.
    pub event: String,
    /// Payload object; may be empty.
    pub payload: Map<String, Value>,
    /// Correlation id linking a reply to its request.
    pub correlation_id: Option<String>,
    /// Milliseconds since epoch.
    pub timestamp: u64,
}

impl WireMessage {
    /// Creates a message with an empty payload, stamped with the current time.
    pub fn new(version: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            event: event.into(),
            payload: Map::new(),
            correlation_id: None,
            timestamp: now_ms(),
        }
    }

    /// Replaces the payload. A non-object value is wrapped under `"value"`.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Returns a payload field as a string slice, if present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Returns a payload field as a u64, if present and numeric.
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    /// Serializes to the compact short-key wire form.
    ///
    /// `c` is omitted when absent; `t` is always emitted.
    pub fn to_json(&self) -> Result<String> {
        let mut root = Map::new();
        root.insert("v".to_string(), Value::String(self.version.clone()));
        root.insert("e".to_string(), Value::String(self.event.clone()));
        root.insert("p".to_string(), Value::Object(self.payload.clone()));
        if let Some(ref c) = self.correlation_id {
            root.insert("c".to_string(), Value::String(c.clone()));
        }
        root.insert("t".to_string(), Value::from(self.timestamp));
        Ok(serde_json::to_string(&Value::Object(root))?)
    }
}

/// The protocol codec: parses text frames and enforces version policy.
///
/// # Examples
///
/// ```
/// use wstether_core::protocol::Codec;
///
/// let codec = Codec::new("2.0")
///     .supported(["1.0", "2.0"])
///     .minimum("1.0");
///
/// assert!(codec.parse(r#"{"v":"1.0","e":"x"}"#).is_ok());
/// assert!(codec.parse(r#"{"v":"0.9","e":"x"}"#).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct Codec {
    current_version: String,
    supported_versions: HashSet<String>,
    minimum_version: Option<String>,
}

impl Codec {
    /// Creates a codec whose current (and only supported) version is `current`.
    pub fn new(current: impl Into<String>) -> Self {
        let current = current.into();
        let mut supported = HashSet::new();
        supported.insert(current.clone());
        Self {
            current_version: current,
            supported_versions: supported,
            minimum_version: None,
        }
    }

    /// Replaces the supported version set. The current version is always
    /// admissible regardless of this set's contents.
    pub fn supported<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_versions = versions.into_iter().map(Into::into).collect();
        self.supported_versions.insert(self.current_version.clone());
        self
    }

    /// Sets the minimum admissible version (inclusive).
    pub fn minimum(mut self, version: impl Into<String>) -> Self {
        self.minimum_version = Some(version.into());
        self
    }

    /// The version stamped on messages that arrive without a `v` field.
    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Whether `version` passes both the supported-set and minimum checks.
    pub fn is_admissible(&self, version: &str) -> bool {
        if !self.supported_versions.contains(version) {
            return false;
        }
        match self.minimum_version {
            Some(ref min) => compare_versions(version, min) != std::cmp::Ordering::Less,
            None => true,
        }
    }

    /// Parses a UTF-8 text frame into a [`WireMessage`].
    ///
    /// Rejections are structured: [`Error::Protocol`] for malformed frames,
    /// [`Error::UnsupportedVersion`] for inadmissible versions.
    pub fn parse(&self, text: &str) -> Result<WireMessage> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("invalid JSON: {}", e)))?;

        let root = match value {
            Value::Object(map) => map,
            _ => return Err(Error::protocol("message root must be an object")),
        };

        let event = match root.get("e") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::String(_)) => {
                return Err(Error::protocol("event name must not be empty"));
            }
            Some(_) => return Err(Error::protocol("event name must be a string")),
            None => return Err(Error::protocol("missing event name")),
        };

        let version = match root.get("v") {
            Some(Value::String(v)) => {
                if !self.is_admissible(v) {
                    return Err(Error::UnsupportedVersion(v.clone()));
                }
                v.clone()
            }
            Some(_) => return Err(Error::protocol("protocol version must be a string")),
            None => self.current_version.clone(),
        };

        let payload = match root.get("p") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(Error::protocol("payload must be an object")),
            None => Map::new(),
        };

        let correlation_id = match root.get("c") {
            Some(Value::String(c)) => Some(c.clone()),
            _ => None,
        };

        let timestamp = root.get("t").and_then(Value::as_u64).unwrap_or_else(now_ms);

        Ok(WireMessage {
            version,
            event,
            payload,
            correlation_id,
            timestamp,
        })
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new("1.0")
    }
}

/// Compares dot-separated versions component-wise as integers.
///
/// Missing components are treated as zero, so `"1.0" == "1"` and
/// `"1.10" > "1.9"`. Non-numeric components compare as zero.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parts(a), parts(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}
