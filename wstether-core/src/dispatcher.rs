//! The dispatcher: one inbound message in, at most one handler call and at
//! most one reply out.
//!
//! For each message, in order:
//!
//! 1. Global middlewares run; a [`Verdict::Block`](crate::middleware::Verdict)
//!    ends dispatch silently.
//! 2. A handler is resolved by event name and protocol version: a
//!    registration whose version set contains the message's version wins,
//!    otherwise the first version-agnostic registration. No match replies
//!    with code 1008 (or invokes the configured not-found handler).
//! 3. The auth gate: a registration that requires auth rejects sessions
//!    without a user id with code 1003.
//! 4. Schema validation: ordered field predicates over the payload; the
//!    first failure replies with code 1009 naming the field. Predicates are
//!    untrusted — a panicking predicate counts as a failed one.
//! 5. The handler runs. Its return value drives the auto-reply: nothing,
//!    a verbatim message, or a payload wrapped as `{event}.response` with
//!    the request's version and correlation id.
//!
//! Errors escaping a handler are converted, never propagated: a validation
//! error becomes a 1009 reply, anything else goes to the configured error
//! handler or becomes an opaque 1500. A handler error never terminates the
//! connection or the session.
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use wstether_core::dispatcher::{handler, Dispatcher, Registration, Schema};
//!
//! let dispatcher = Dispatcher::new();
//!
//! // Simple echo: return a payload and get an auto-correlated reply.
//! dispatcher.on("util.echo", handler(|ctx| async move {
//!     Ok(json!({ "echo": ctx.payload().get("msg").cloned() }))
//! }));
//!
//! // A guarded, validated handler.
//! dispatcher.register(
//!     Registration::new("transfer", handler(|ctx| async move {
//!         let amount = ctx.message.payload_u64("amount").unwrap_or(0);
//!         Ok(json!({ "accepted": amount }))
//!     }))
//!     .requires_auth()
//!     .schema(Schema::new().field("amount", |v| v.as_f64().is_some_and(|n| n > 0.0))),
//! );
//! ```

use crate::context::Context;
use crate::error::{Error, Result};
use crate::metrics::{Metrics, NoopMetrics};
use crate::middleware::{Middleware, Verdict};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

/// What a handler wants sent back.
pub enum Reply {
    /// No automatic reply.
    None,
    /// Send this message verbatim.
    Message(crate::protocol::WireMessage),
    /// Wrap this payload as `{event}.response` with the request's version
    /// and correlation id.
    Payload(Map<String, Value>),
}

/// Conversion of handler return values into a [`Reply`].
pub trait IntoReply {
    /// Performs the conversion.
    fn into_reply(self) -> Reply;
}

impl IntoReply for () {
    fn into_reply(self) -> Reply {
        Reply::None
    }
}

impl IntoReply for crate::protocol::WireMessage {
    fn into_reply(self) -> Reply {
        Reply::Message(self)
    }
}

impl IntoReply for Map<String, Value> {
    fn into_reply(self) -> Reply {
        Reply::Payload(self)
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> Reply {
        match self {
            Value::Object(map) => Reply::Payload(map),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Reply::Payload(map)
            }
        }
    }
}

impl IntoReply for Reply {
    fn into_reply(self) -> Reply {
        self
    }
}

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> Reply {
        match self {
            Some(value) => value.into_reply(),
            None => Reply::None,
        }
    }
}

/// An event handler invocation target.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Processes one message in its [`Context`].
    async fn call(&self, ctx: Context) -> Result<Reply>;
}

/// Wraps async functions as [`EventHandler`]s; see [`handler()`].
pub struct FnHandler<F, R> {
    func: F,
    _marker: std::marker::PhantomData<fn() -> R>,
}

#[async_trait]
impl<F, Fut, R> EventHandler for FnHandler<F, R>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    async fn call(&self, ctx: Context) -> Result<Reply> {
        Ok((self.func)(ctx).await?.into_reply())
    }
}

/// Converts an async function into an event handler.
///
/// The function receives the invocation [`Context`] and returns
/// `Result<impl IntoReply>`: `()` for no reply, a `serde_json` object for
/// an auto-correlated `{event}.response`, or a
/// [`WireMessage`](crate::protocol::WireMessage) sent verbatim.
pub fn handler<F, Fut, R>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    Arc::new(FnHandler {
        func: f,
        _marker: std::marker::PhantomData,
    })
}

/// A single-field validation predicate.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// An ordered set of payload field predicates.
///
/// Fields are validated in insertion order; the first failure wins. A field
/// missing from the payload is validated as JSON `null`.
#[derive(Clone, Default)]
pub struct Schema {
    fields: Vec<(String, Predicate)>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate for a payload field.
    pub fn field<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.fields.push((name.into(), Arc::new(predicate)));
        self
    }

    /// Validates a payload, returning the first failing field.
    ///
    /// Predicates are untrusted: a panic inside one is treated as a failed
    /// validation, not a crash.
    pub fn validate(&self, payload: &Map<String, Value>) -> Result<()> {
        for (name, predicate) in &self.fields {
            let value = payload.get(name).cloned().unwrap_or(Value::Null);
            let passed = catch_unwind(AssertUnwindSafe(|| predicate(&value))).unwrap_or(false);
            if !passed {
                return Err(Error::validation(name));
            }
        }
        Ok(())
    }
}

/// A handler registration for one event name.
pub struct Registration {
    event: String,
    handler: Arc<dyn EventHandler>,
    versions: HashSet<String>,
    requires_auth: bool,
    schema: Option<Schema>,
}

impl Registration {
    /// Registers `handler` for `event`, matching any protocol version.
    pub fn new(event: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            event: event.into(),
            handler,
            versions: HashSet::new(),
            requires_auth: false,
            schema: None,
        }
    }

    /// Restricts the registration to the given protocol versions.
    pub fn versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versions = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Requires an authenticated session.
    pub fn requires_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    /// Attaches a payload schema.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// Callback invoked when a handler fails with a non-validation error.
/// The callback owns any reply; without one the client sees code 1500.
pub type ErrorHandler = Arc<dyn Fn(&Context, &Error) + Send + Sync>;

/// Routes inbound messages to registered handlers.
pub struct Dispatcher {
    registrations: DashMap<String, Vec<Registration>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    not_found: RwLock<Option<Arc<dyn EventHandler>>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    metrics: RwLock<Arc<dyn Metrics>>,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registrations: DashMap::new(),
            middlewares: RwLock::new(Vec::new()),
            not_found: RwLock::new(None),
            error_handler: RwLock::new(None),
            metrics: RwLock::new(Arc::new(NoopMetrics)),
        })
    }

    /// Registers a handler for an event with default options.
    pub fn on(&self, event: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.register(Registration::new(event, handler));
    }

    /// Adds a full registration.
    pub fn register(&self, registration: Registration) {
        self.registrations
            .entry(registration.event.clone())
            .or_default()
            .push(registration);
    }

    /// Appends a global middleware. Middlewares run in registration order.
    pub fn layer(&self, middleware: Arc<dyn Middleware>) {
        if let Ok(mut guard) = self.middlewares.write() {
            guard.push(middleware);
        }
    }

    /// Replaces the not-found handler invoked for unregistered events.
    pub fn not_found(&self, handler: Arc<dyn EventHandler>) {
        if let Ok(mut guard) = self.not_found.write() {
            *guard = Some(handler);
        }
    }

    /// Replaces the error handler invoked for non-validation handler errors.
    pub fn on_error(&self, handler: ErrorHandler) {
        if let Ok(mut guard) = self.error_handler.write() {
            *guard = Some(handler);
        }
    }

    /// Replaces the metrics sink.
    pub fn set_metrics(&self, metrics: Arc<dyn Metrics>) {
        if let Ok(mut guard) = self.metrics.write() {
            *guard = metrics;
        }
    }

    fn metrics(&self) -> Arc<dyn Metrics> {
        self.metrics
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|_| Arc::new(NoopMetrics))
    }

    /// Dispatches one inbound message.
    ///
    /// Every failure path replies to the client; nothing here terminates the
    /// connection or the session.
    pub async fn dispatch(&self, ctx: Context) {
        self.metrics().message_received(ctx.event());

        // 1. Global middlewares.
        let middlewares: Vec<Arc<dyn Middleware>> = match self.middlewares.read() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        };
        for middleware in middlewares {
            match middleware.handle(&ctx).await {
                Ok(Verdict::Continue) => {}
                Ok(Verdict::Block) => {
                    debug!("Dispatch blocked by middleware for {}", ctx.event());
                    return;
                }
                Err(e) => {
                    warn!("Middleware failed for {}: {}", ctx.event(), e);
                    self.send_error(&ctx, 1500, "Internal server error", None);
                    return;
                }
            }
        }

        // 2. Handler resolution by event and version.
        let resolved = self.resolve(ctx.event(), &ctx.message.version);
        let (handler, requires_auth, schema) = match resolved {
            Some(parts) => parts,
            None => {
                let not_found = self.not_found.read().ok().and_then(|g| g.clone());
                match not_found {
                    Some(handler) => {
                        self.invoke(handler, ctx).await;
                    }
                    None => {
                        debug!("No handler for event {}", ctx.event());
                        self.send_error(
                            &ctx,
                            Error::HandlerNotFound(String::new()).code(),
                            &format!("Handler not found: {}", ctx.event()),
                            None,
                        );
                    }
                }
                return;
            }
        };

        // 3. Auth gate.
        if requires_auth && ctx.session.user_id().is_none() {
            self.send_error(&ctx, Error::AuthRequired.code(), "Authentication required", None);
            return;
        }

        // 4. Schema validation.
        if let Some(schema) = schema {
            if let Err(Error::Validation { field }) = schema.validate(ctx.payload()) {
                self.send_error(
                    &ctx,
                    1009,
                    &format!("Validation failed for field: {}", field),
                    Some(json!({ "field": field })),
                );
                return;
            }
        }

        // 5. Handler invocation and auto-reply.
        self.invoke(handler, ctx).await;
    }

    fn resolve(
        &self,
        event: &str,
        version: &str,
    ) -> Option<(Arc<dyn EventHandler>, bool, Option<Schema>)> {
        let regs = self.registrations.get(event)?;
        let chosen = regs
            .iter()
            .find(|r| r.versions.contains(version))
            .or_else(|| regs.iter().find(|r| r.versions.is_empty()))?;
        Some((
            chosen.handler.clone(),
            chosen.requires_auth,
            chosen.schema.clone(),
        ))
    }

    async fn invoke(&self, handler: Arc<dyn EventHandler>, ctx: Context) {
        match handler.call(ctx.clone()).await {
            Ok(Reply::None) => {}
            Ok(Reply::Message(msg)) => {
                self.metrics().message_sent(&msg.event);
                if let Err(e) = ctx.send(msg) {
                    debug!("Reply send failed for {}: {}", ctx.event(), e);
                }
            }
            Ok(Reply::Payload(payload)) => {
                let event = format!("{}.response", ctx.event());
                let msg = crate::protocol::WireMessage {
                    version: ctx.message.version.clone(),
                    event: event.clone(),
                    payload,
                    correlation_id: ctx.message.correlation_id.clone(),
                    timestamp: crate::protocol::now_ms(),
                };
                self.metrics().message_sent(&event);
                if let Err(e) = ctx.send(msg) {
                    debug!("Reply send failed for {}: {}", ctx.event(), e);
                }
            }
            Err(Error::Validation { field }) => {
                self.send_error(
                    &ctx,
                    1009,
                    &format!("Validation failed for field: {}", field),
                    Some(json!({ "field": field })),
                );
            }
            Err(e) => {
                error!("Handler error for {}: {}", ctx.event(), e);
                let custom = self.error_handler.read().ok().and_then(|g| g.clone());
                match custom {
                    Some(error_handler) => error_handler(&ctx, &e),
                    None => self.send_error(&ctx, 1500, "Internal server error", None),
                }
            }
        }
    }

    fn send_error(&self, ctx: &Context, code: u16, message: &str, details: Option<Value>) {
        self.metrics().error(code);
        if let Err(e) = ctx.error(code, message, details) {
            debug!("Error reply send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Frame};
    use crate::protocol::{events, WireMessage};
    use crate::rooms::RoomRegistry;
    use crate::session::SessionRegistry;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn context_for(message: WireMessage, user: Option<&str>) -> (Context, UnboundedReceiver<Frame>) {
        let sessions = SessionRegistry::new();
        let rooms = RoomRegistry::new(sessions.clone());
        let (conn, rx) = Connection::open("c1".to_string());
        let session = sessions.create(user.map(String::from), Some(conn.clone()), None);
        (Context::new(session, conn, message, sessions, rooms), rx)
    }

    fn recv(rx: &mut UnboundedReceiver<Frame>) -> WireMessage {
        match rx.try_recv().unwrap() {
            Frame::Message(m) => m,
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_payload_return_becomes_correlated_response() {
        let dispatcher = Dispatcher::new();
        dispatcher.on(
            "util.echo",
            handler(|ctx| async move {
                Ok(json!({ "echo": ctx.payload().get("msg").cloned().unwrap_or(Value::Null) }))
            }),
        );

        let request = WireMessage::new("1.0", "util.echo")
            .with_payload(json!({ "msg": "hi" }))
            .with_correlation("r1");
        let (ctx, mut rx) = context_for(request, None);
        dispatcher.dispatch(ctx).await;

        let reply = recv(&mut rx);
        assert_eq!(reply.event, "util.echo.response");
        assert_eq!(reply.version, "1.0");
        assert_eq!(reply.correlation_id.as_deref(), Some("r1"));
        assert_eq!(reply.payload_str("echo"), Some("hi"));
    }

    #[tokio::test]
    async fn test_message_return_sent_verbatim() {
        let dispatcher = Dispatcher::new();
        dispatcher.on(
            "custom",
            handler(|_ctx| async move {
                Ok(WireMessage::new("1.0", "custom.notice").with_payload(json!({ "ok": true })))
            }),
        );

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "custom"), None);
        dispatcher.dispatch(ctx).await;

        let reply = recv(&mut rx);
        assert_eq!(reply.event, "custom.notice");
        assert!(reply.correlation_id.is_none());
    }

    #[tokio::test]
    async fn test_unit_return_sends_nothing() {
        let dispatcher = Dispatcher::new();
        dispatcher.on("fire.and.forget", handler(|_ctx| async move { Ok(()) }));

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "fire.and.forget"), None);
        dispatcher.dispatch(ctx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_not_found_replies_1008() {
        let dispatcher = Dispatcher::new();
        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "nope").with_correlation("r1"), None);
        dispatcher.dispatch(ctx).await;

        let reply = recv(&mut rx);
        assert_eq!(reply.event, events::ERROR);
        assert_eq!(reply.payload_u64("code"), Some(1008));
        assert_eq!(reply.payload_str("message"), Some("Handler not found: nope"));
        assert_eq!(reply.correlation_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_custom_not_found_handler() {
        let dispatcher = Dispatcher::new();
        dispatcher.not_found(handler(|_ctx| async move {
            Ok(json!({ "fallback": true }))
        }));

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "nope"), None);
        dispatcher.dispatch(ctx).await;

        let reply = recv(&mut rx);
        assert_eq!(reply.event, "nope.response");
        assert_eq!(reply.payload["fallback"], true);
    }

    #[tokio::test]
    async fn test_auth_gate_rejects_anonymous() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(Registration::new(
            "secure.op",
            handler(|_ctx| async move { Ok(json!({ "secret": 42 })) }),
        )
        .requires_auth());

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "secure.op"), None);
        dispatcher.dispatch(ctx).await;

        let reply = recv(&mut rx);
        assert_eq!(reply.event, events::ERROR);
        assert_eq!(reply.payload_u64("code"), Some(1003));
        assert_eq!(reply.payload_str("message"), Some("Authentication required"));

        // The connection stays open.
        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "secure.op"), Some("alice"));
        assert!(ctx.connection.is_active());
        dispatcher.dispatch(ctx).await;
        let reply = recv(&mut rx);
        assert_eq!(reply.event, "secure.op.response");
    }

    #[tokio::test]
    async fn test_schema_failure_replies_1009() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            Registration::new("transfer", handler(|_ctx| async move { Ok(json!({})) })).schema(
                Schema::new().field("amount", |v| v.as_f64().is_some_and(|n| n > 0.0)),
            ),
        );

        let request = WireMessage::new("1.0", "transfer").with_payload(json!({ "amount": -5 }));
        let (ctx, mut rx) = context_for(request, None);
        dispatcher.dispatch(ctx).await;

        let reply = recv(&mut rx);
        assert_eq!(reply.payload_u64("code"), Some(1009));
        assert_eq!(
            reply.payload_str("message"),
            Some("Validation failed for field: amount")
        );
        assert_eq!(reply.payload["details"]["field"], "amount");
    }

    #[tokio::test]
    async fn test_missing_schema_field_fails_validation() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            Registration::new("transfer", handler(|_ctx| async move { Ok(json!({})) }))
                .schema(Schema::new().field("amount", |v| v.is_number())),
        );

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "transfer"), None);
        dispatcher.dispatch(ctx).await;
        assert_eq!(recv(&mut rx).payload_u64("code"), Some(1009));
    }

    #[tokio::test]
    async fn test_panicking_predicate_is_validation_failure() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            Registration::new("transfer", handler(|_ctx| async move { Ok(json!({})) })).schema(
                Schema::new().field("amount", |v| {
                    // Untrusted predicate: unwraps the wrong type.
                    !v.as_str().unwrap().is_empty()
                }),
            ),
        );

        let request = WireMessage::new("1.0", "transfer").with_payload(json!({ "amount": 3 }));
        let (ctx, mut rx) = context_for(request, None);
        dispatcher.dispatch(ctx).await;
        assert_eq!(recv(&mut rx).payload_u64("code"), Some(1009));
    }

    #[tokio::test]
    async fn test_handler_validation_error_replies_1009() {
        let dispatcher = Dispatcher::new();
        dispatcher.on(
            "transfer",
            handler(|_ctx| async move {
                Err::<Value, _>(Error::validation("amount"))
            }),
        );

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "transfer"), None);
        dispatcher.dispatch(ctx).await;

        let reply = recv(&mut rx);
        assert_eq!(reply.payload_u64("code"), Some(1009));
        assert_eq!(
            reply.payload_str("message"),
            Some("Validation failed for field: amount")
        );
    }

    #[tokio::test]
    async fn test_handler_error_is_opaque_1500() {
        let dispatcher = Dispatcher::new();
        dispatcher.on(
            "boom",
            handler(|_ctx| async move {
                Err::<Value, _>(Error::internal("database exploded: secret details"))
            }),
        );

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "boom"), None);
        assert!(ctx.connection.is_active());
        dispatcher.dispatch(ctx.clone()).await;

        let reply = recv(&mut rx);
        assert_eq!(reply.payload_u64("code"), Some(1500));
        assert_eq!(reply.payload_str("message"), Some("Internal server error"));
        // Handler errors never terminate the connection or session.
        assert!(ctx.connection.is_active());
        assert!(ctx.session.is_active());
    }

    #[tokio::test]
    async fn test_custom_error_handler_takes_over() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dispatcher = Dispatcher::new();
        dispatcher.on(
            "boom",
            handler(|_ctx| async move { Err::<Value, _>(Error::handler("oops")) }),
        );
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        dispatcher.on_error(Arc::new(move |ctx, err| {
            flag.store(true, Ordering::SeqCst);
            let _ = ctx.error(err.code(), "custom rendering", None);
        }));

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "boom"), None);
        dispatcher.dispatch(ctx).await;

        assert!(called.load(Ordering::SeqCst));
        assert_eq!(recv(&mut rx).payload_str("message"), Some("custom rendering"));
    }

    #[tokio::test]
    async fn test_middleware_block_is_silent() {
        let dispatcher = Dispatcher::new();
        dispatcher.on("anything", handler(|_ctx| async move { Ok(json!({})) }));
        dispatcher.layer(crate::middleware::from_fn(|_ctx| async move {
            Ok(Verdict::Block)
        }));

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "anything"), None);
        dispatcher.dispatch(ctx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_middleware_error_replies_1500() {
        let dispatcher = Dispatcher::new();
        dispatcher.on("anything", handler(|_ctx| async move { Ok(json!({})) }));
        dispatcher.layer(crate::middleware::from_fn(|_ctx| async move {
            Err::<Verdict, _>(Error::internal("middleware bug"))
        }));

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "anything"), None);
        dispatcher.dispatch(ctx).await;
        assert_eq!(recv(&mut rx).payload_u64("code"), Some(1500));
    }

    #[tokio::test]
    async fn test_version_specific_resolution() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            Registration::new("op", handler(|_ctx| async move { Ok(json!({ "handler": "v2" })) }))
                .versions(["2.0"]),
        );
        dispatcher.on("op", handler(|_ctx| async move { Ok(json!({ "handler": "any" })) }));

        let (ctx, mut rx) = context_for(WireMessage::new("2.0", "op"), None);
        dispatcher.dispatch(ctx).await;
        assert_eq!(recv(&mut rx).payload["handler"], "v2");

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "op"), None);
        dispatcher.dispatch(ctx).await;
        assert_eq!(recv(&mut rx).payload["handler"], "any");
    }

    #[tokio::test]
    async fn test_only_mismatched_version_specific_registrations_is_not_found() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            Registration::new("op", handler(|_ctx| async move { Ok(json!({})) }))
                .versions(["2.0"]),
        );

        let (ctx, mut rx) = context_for(WireMessage::new("1.0", "op"), None);
        dispatcher.dispatch(ctx).await;
        assert_eq!(recv(&mut rx).payload_u64("code"), Some(1008));
    }

    #[tokio::test]
    async fn test_metrics_are_counted() {
        let metrics = Arc::new(crate::metrics::AtomicMetrics::new());
        let dispatcher = Dispatcher::new();
        dispatcher.set_metrics(metrics.clone());
        dispatcher.on("util.echo", handler(|_ctx| async move { Ok(json!({})) }));

        let (ctx, _rx) = context_for(WireMessage::new("1.0", "util.echo"), None);
        dispatcher.dispatch(ctx).await;
        let (ctx, _rx) = context_for(WireMessage::new("1.0", "missing"), None);
        dispatcher.dispatch(ctx).await;

        assert_eq!(metrics.received_for("util.echo"), 1);
        assert_eq!(metrics.sent_for("util.echo.response"), 1);
        assert_eq!(metrics.errors_for(1008), 1);
    }
}
