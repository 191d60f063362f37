//! Request/response correlation over the full-duplex stream.
//!
//! A [`CorrelationTable`] maps correlation ids to pending waiters with
//! per-entry timeouts. Feed every inbound message through
//! [`resolve`](CorrelationTable::resolve): a message whose correlation id
//! matches a pending entry completes that waiter — as a failure carrying
//! the payload when the event is `sys.error`, preserving the client SDK
//! convention — and is consumed.
//!
//! # Examples
//!
//! ```no_run
//! use wstether_core::correlation::CorrelationTable;
//! use wstether_core::protocol::WireMessage;
//!
//! # async fn example() -> wstether_core::error::Result<()> {
//! let table = CorrelationTable::new();
//! let (correlation_id, waiter) = table.register(None);
//!
//! // ... send a request stamped with `correlation_id`, then on the read
//! // side call `table.resolve(&msg)` for every inbound message ...
//!
//! let reply: WireMessage = waiter.await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::id;
use crate::protocol::{events, WireMessage};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

struct Pending {
    tx: oneshot::Sender<Result<WireMessage>>,
    timer: JoinHandle<()>,
}

/// A pending waiter for one correlated reply.
pub struct Waiter {
    rx: oneshot::Receiver<Result<WireMessage>>,
}

impl std::future::Future for Waiter {
    type Output = Result<WireMessage>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match std::pin::Pin::new(&mut self.rx).poll(cx) {
            std::task::Poll::Ready(Ok(result)) => std::task::Poll::Ready(result),
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(Error::Timeout(
                "correlation dropped".to_string(),
            ))),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

/// Maps correlation ids to pending response waiters.
pub struct CorrelationTable {
    pending: DashMap<String, Pending>,
    default_timeout: Duration,
}

impl CorrelationTable {
    /// Creates a table with the default 10 second timeout.
    pub fn new() -> Arc<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Creates a table with a custom default timeout.
    pub fn with_timeout(default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            default_timeout,
        })
    }

    /// Registers a waiter and returns its fresh correlation id.
    ///
    /// The entry is removed and the waiter failed with [`Error::Timeout`]
    /// if no reply arrives within `timeout` (or the table default).
    pub fn register(self: &Arc<Self>, timeout: Option<Duration>) -> (String, Waiter) {
        let correlation_id = id::correlation_id();
        let (tx, rx) = oneshot::channel();

        let timer = {
            let table = self.clone();
            let correlation_id = correlation_id.clone();
            let timeout = timeout.unwrap_or(self.default_timeout);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some((_, pending)) = table.pending.remove(&correlation_id) {
                    debug!("Correlation {} timed out", correlation_id);
                    let _ = pending
                        .tx
                        .send(Err(Error::Timeout(correlation_id.clone())));
                }
            })
        };

        self.pending
            .insert(correlation_id.clone(), Pending { tx, timer });
        (correlation_id, Waiter { rx })
    }

    /// Routes an inbound message to its waiter, if one is pending.
    ///
    /// Returns whether the message was consumed. A `sys.error` reply
    /// resolves the waiter as a failure carrying the payload.
    pub fn resolve(&self, message: &WireMessage) -> bool {
        let Some(correlation_id) = message.correlation_id.as_deref() else {
            return false;
        };
        let Some((_, pending)) = self.pending.remove(correlation_id) else {
            return false;
        };
        pending.timer.abort();

        let result = if message.event == events::ERROR {
            Err(Error::Remote(Value::Object(message.payload.clone())))
        } else {
            Ok(message.clone())
        };
        let _ = pending.tx.send(result);
        true
    }

    /// Number of in-flight correlations.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fails and removes every pending waiter, for shutdown.
    pub fn fail_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                pending.timer.abort();
                let _ = pending.tx.send(Err(Error::ConnectionClosed(id)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reply_resolves_waiter() {
        let table = CorrelationTable::new();
        let (cid, waiter) = table.register(None);

        let mut reply = WireMessage::new("1.0", "util.echo.response").with_correlation(cid);
        reply.payload.insert("echo".to_string(), json!("hi"));
        assert!(table.resolve(&reply));

        let received = waiter.await.unwrap();
        assert_eq!(received.payload_str("echo"), Some("hi"));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sys_error_resolves_as_failure() {
        let table = CorrelationTable::new();
        let (cid, waiter) = table.register(None);

        let error_reply = WireMessage::new("1.0", events::ERROR)
            .with_payload(json!({ "code": 1006, "message": "Session not found" }))
            .with_correlation(cid);
        assert!(table.resolve(&error_reply));

        match waiter.await.unwrap_err() {
            Error::Remote(payload) => assert_eq!(payload["code"], 1006),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_fails_and_removes_entry() {
        let table = CorrelationTable::with_timeout(Duration::from_millis(20));
        let (cid, waiter) = table.register(None);

        let err = waiter.await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(table.pending_count(), 0);

        // A reply arriving after the timeout is not consumed.
        let late = WireMessage::new("1.0", "late.response").with_correlation(cid);
        assert!(!table.resolve(&late));
    }

    #[tokio::test]
    async fn test_uncorrelated_messages_pass_through() {
        let table = CorrelationTable::new();
        let (_cid, _waiter) = table.register(None);
        assert!(!table.resolve(&WireMessage::new("1.0", "broadcast")));
        assert_eq!(table.pending_count(), 1);
        table.fail_all();
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = CorrelationTable::new();
        let (_c1, w1) = table.register(None);
        let (_c2, w2) = table.register(None);
        table.fail_all();
        assert!(w1.await.is_err());
        assert!(w2.await.is_err());
        assert_eq!(table.pending_count(), 0);
    }
}
