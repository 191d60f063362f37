//! The handler context: everything one invocation can see and do.
//!
//! A [`Context`] is the union of the invocation's session, connection, and
//! message, plus convenience operations: [`reply`] (correlated to the
//! request), [`emit`] (uncorrelated), [`error`], [`send`],
//! [`broadcast_to_room`] (auto-excluding the invoking session), and
//! [`bind`] for converting the payload into a domain type.
//!
//! [`reply`]: Context::reply
//! [`emit`]: Context::emit
//! [`error`]: Context::error
//! [`send`]: Context::send
//! [`broadcast_to_room`]: Context::broadcast_to_room
//! [`bind`]: Context::bind
//!
//! # Examples
//!
//! ```no_run
//! use serde::Deserialize;
//! use serde_json::json;
//! use wstether_core::context::Context;
//! use wstether_core::error::Result;
//!
//! #[derive(Deserialize)]
//! struct Transfer {
//!     amount: f64,
//! }
//!
//! async fn transfer(ctx: Context) -> Result<()> {
//!     let req: Transfer = ctx.bind()?;
//!     ctx.reply("transfer.accepted", json!({ "amount": req.amount }))?;
//!     ctx.broadcast_to_room("ledger", "transfer.posted", json!({ "amount": req.amount }))?;
//!     Ok(())
//! }
//! ```

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::{events, now_ms, WireMessage};
use crate::rooms::RoomRegistry;
use crate::session::{Session, SessionRegistry};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;

/// The invocation context handed to every handler and middleware.
///
/// Cheap to clone; everything inside is shared.
#[derive(Clone)]
pub struct Context {
    /// The session the message arrived on.
    pub session: Arc<Session>,
    /// The connection the message arrived on.
    pub connection: Arc<Connection>,
    /// The inbound message.
    pub message: WireMessage,
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomRegistry>,
}

impl Context {
    /// Assembles a context. Called by the server facade per dispatch.
    pub fn new(
        session: Arc<Session>,
        connection: Arc<Connection>,
        message: WireMessage,
        sessions: Arc<SessionRegistry>,
        rooms: Arc<RoomRegistry>,
    ) -> Self {
        Self {
            session,
            connection,
            message,
            sessions,
            rooms,
        }
    }

    /// The inbound event name.
    pub fn event(&self) -> &str {
        &self.message.event
    }

    /// The inbound payload object.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.message.payload
    }

    /// The session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// The room registry.
    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Sends a message on the invoking connection verbatim.
    pub fn send(&self, message: WireMessage) -> Result<()> {
        self.connection.send(message)
    }

    /// Sends a correlated reply: same protocol version, the request's
    /// correlation id.
    pub fn reply(&self, event: impl Into<String>, payload: Value) -> Result<()> {
        let mut msg = WireMessage::new(self.message.version.clone(), event).with_payload(payload);
        msg.correlation_id = self.message.correlation_id.clone();
        self.send(msg)
    }

    /// Sends an uncorrelated event on the invoking connection.
    pub fn emit(&self, event: impl Into<String>, payload: Value) -> Result<()> {
        let msg = WireMessage::new(self.message.version.clone(), event).with_payload(payload);
        self.send(msg)
    }

    /// Sends a `sys.error` carrying a stable code, a message, and optional
    /// details. Correlated to the request so a client-side waiter resolves
    /// it as a failure.
    pub fn error(&self, code: u16, message: &str, details: Option<Value>) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("code".to_string(), Value::from(code));
        payload.insert("message".to_string(), Value::String(message.to_string()));
        if let Some(details) = details {
            payload.insert("details".to_string(), details);
        }
        let msg = WireMessage {
            version: self.message.version.clone(),
            event: events::ERROR.to_string(),
            payload,
            correlation_id: self.message.correlation_id.clone(),
            timestamp: now_ms(),
        };
        self.send(msg)
    }

    /// Broadcasts an event to a room, excluding the invoking session.
    ///
    /// Returns the number of members the message was delivered to.
    pub fn broadcast_to_room(
        &self,
        room_id: &str,
        event: impl Into<String>,
        payload: Value,
    ) -> Result<usize> {
        let msg = WireMessage::new(self.message.version.clone(), event).with_payload(payload);
        self.rooms.broadcast(room_id, &msg, Some(self.session.id()))
    }

    /// Converts the payload into a domain type.
    ///
    /// Structural failures — missing fields, wrong types — are reported as
    /// validation errors, so the dispatcher answers them with code 1009.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.message.payload.clone())).map_err(|e| {
            let detail = e.to_string();
            let field = detail.split(" at ").next().unwrap_or("payload").to_string();
            Error::Validation { field }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Frame;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn context(message: WireMessage) -> (Context, UnboundedReceiver<Frame>) {
        let sessions = SessionRegistry::new();
        let rooms = RoomRegistry::new(sessions.clone());
        let (conn, rx) = Connection::open("c1".to_string());
        let session = sessions.create(None, Some(conn.clone()), None);
        (
            Context::new(session, conn, message, sessions, rooms),
            rx,
        )
    }

    fn recv_message(rx: &mut UnboundedReceiver<Frame>) -> WireMessage {
        match rx.try_recv().unwrap() {
            Frame::Message(m) => m,
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_reply_carries_request_correlation() {
        let request = WireMessage::new("1.0", "util.echo").with_correlation("r1");
        let (ctx, mut rx) = context(request);

        ctx.reply("util.echo.response", json!({ "echo": "hi" })).unwrap();

        let msg = recv_message(&mut rx);
        assert_eq!(msg.event, "util.echo.response");
        assert_eq!(msg.correlation_id.as_deref(), Some("r1"));
        assert_eq!(msg.payload_str("echo"), Some("hi"));
    }

    #[test]
    fn test_emit_is_uncorrelated() {
        let request = WireMessage::new("1.0", "util.echo").with_correlation("r1");
        let (ctx, mut rx) = context(request);

        ctx.emit("presence.update", json!({ "online": true })).unwrap();

        let msg = recv_message(&mut rx);
        assert!(msg.correlation_id.is_none());
    }

    #[test]
    fn test_error_shape() {
        let request = WireMessage::new("1.0", "transfer").with_correlation("r2");
        let (ctx, mut rx) = context(request);

        ctx.error(1009, "Validation failed for field: amount", Some(json!({"field": "amount"})))
            .unwrap();

        let msg = recv_message(&mut rx);
        assert_eq!(msg.event, events::ERROR);
        assert_eq!(msg.payload_u64("code"), Some(1009));
        assert_eq!(
            msg.payload_str("message"),
            Some("Validation failed for field: amount")
        );
        assert_eq!(msg.payload["details"]["field"], "amount");
        assert_eq!(msg.correlation_id.as_deref(), Some("r2"));
    }

    #[test]
    fn test_bind_success_and_failure() {
        #[derive(Debug, Deserialize)]
        struct Transfer {
            amount: f64,
        }

        let request =
            WireMessage::new("1.0", "transfer").with_payload(json!({ "amount": 12.5 }));
        let (ctx, _rx) = context(request);
        let bound: Transfer = ctx.bind().unwrap();
        assert_eq!(bound.amount, 12.5);

        let request = WireMessage::new("1.0", "transfer").with_payload(json!({}));
        let (ctx, _rx) = context(request);
        let err = ctx.bind::<Transfer>().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(err.code(), 1009);
    }

    #[test]
    fn test_broadcast_to_room_excludes_self() {
        let sessions = SessionRegistry::new();
        let rooms = RoomRegistry::new(sessions.clone());

        let (conn_a, mut rx_a) = Connection::open("ca".to_string());
        let alice = sessions.create(None, Some(conn_a.clone()), None);
        let (conn_b, mut rx_b) = Connection::open("cb".to_string());
        let bob = sessions.create(None, Some(conn_b), None);

        rooms.join("general", &alice).unwrap();
        rooms.join("general", &bob).unwrap();

        let ctx = Context::new(
            alice,
            conn_a,
            WireMessage::new("1.0", "chat.message"),
            sessions,
            rooms,
        );
        let delivered = ctx
            .broadcast_to_room("general", "chat.message", json!({ "text": "hi" }))
            .unwrap();

        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }
}
