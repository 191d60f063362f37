//! Pub/sub seam for multi-node fan-out.
//!
//! The server itself is single-node; plugging a [`PubSub`] implementation
//! in lets broadcasts cross process boundaries. When configured, the server
//! subscribes to `ws:broadcast` (fan out to every local session) and
//! `ws:room:*` (the payload's `_roomId` routes the local room fan-out).
//!
//! Channel patterns use `*` to match exactly one colon-separated segment:
//! `ws:room:*` matches `ws:room:general` but not `ws:room:a:b`.
//!
//! [`LocalPubSub`] is an in-process implementation for tests and
//! single-node deployments.

use crate::error::{Error, Result};
use crate::protocol::WireMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A subscription stream: `(channel, message)` pairs.
pub type Subscription = mpsc::UnboundedReceiver<(String, WireMessage)>;

/// External pub/sub transport.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publishes a message on a channel.
    async fn publish(&self, channel: &str, message: &WireMessage) -> Result<()>;

    /// Subscribes to a channel or a `*` wildcard pattern.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;

    /// Cancels a subscription by its pattern.
    async fn unsubscribe(&self, pattern: &str) -> Result<()>;

    /// Releases transport resources.
    async fn close(&self) -> Result<()>;
}

/// Whether `channel` matches `pattern`, where `*` stands for exactly one
/// colon-separated segment.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split(':').collect();
    let channel_parts: Vec<&str> = channel.split(':').collect();
    if pattern_parts.len() != channel_parts.len() {
        return false;
    }
    pattern_parts
        .iter()
        .zip(channel_parts.iter())
        .all(|(p, c)| *p == "*" || p == c)
}

/// In-process pub/sub for tests and single-node use.
pub struct LocalPubSub {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<(String, WireMessage)>>>,
    closed: AtomicBool,
}

impl LocalPubSub {
    /// Creates an empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, channel: &str, message: &WireMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("pubsub".to_string()));
        }
        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            if channel_matches(entry.key(), channel) {
                for tx in entry.value() {
                    if tx.send((channel.to_string(), message.clone())).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        debug!("Published on {}: {} subscriber(s)", channel, delivered);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("pubsub".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(pattern.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.subscribers.remove(pattern);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_matching() {
        assert!(channel_matches("ws:room:*", "ws:room:general"));
        assert!(channel_matches("ws:broadcast", "ws:broadcast"));
        assert!(channel_matches("*:room:*", "ws:room:general"));
        assert!(!channel_matches("ws:room:*", "ws:room:a:b"));
        assert!(!channel_matches("ws:room:*", "ws:broadcast"));
        assert!(!channel_matches("ws:room:general", "ws:room:other"));
    }

    #[tokio::test]
    async fn test_publish_reaches_wildcard_subscriber() {
        let bus = LocalPubSub::new();
        let mut sub = bus.subscribe("ws:room:*").await.unwrap();

        let msg = WireMessage::new("1.0", "chat.message");
        bus.publish("ws:room:general", &msg).await.unwrap();

        let (channel, received) = sub.recv().await.unwrap();
        assert_eq!(channel, "ws:room:general");
        assert_eq!(received.event, "chat.message");
    }

    #[tokio::test]
    async fn test_publish_skips_non_matching() {
        let bus = LocalPubSub::new();
        let mut sub = bus.subscribe("ws:broadcast").await.unwrap();
        bus.publish("ws:room:general", &WireMessage::new("1.0", "x"))
            .await
            .unwrap();
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let bus = LocalPubSub::new();
        let _sub = bus.subscribe("ws:broadcast").await.unwrap();
        bus.unsubscribe("ws:broadcast").await.unwrap();

        bus.close().await.unwrap();
        assert!(bus.subscribe("ws:broadcast").await.is_err());
        assert!(bus
            .publish("ws:broadcast", &WireMessage::new("1.0", "x"))
            .await
            .is_err());
    }
}
