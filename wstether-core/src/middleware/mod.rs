//! Middleware: global interception before dispatch.
//!
//! Middlewares run in registration order before handler resolution. Each
//! returns a [`Verdict`]: [`Verdict::Continue`] passes the message on,
//! [`Verdict::Block`] ends dispatch silently — a blocking middleware is
//! responsible for any reply it wants the client to see (rate-limit errors
//! being the canonical case, see [`RateLimitMiddleware`]).
//!
//! # Examples
//!
//! ## Function-based middleware
//!
//! ```
//! use wstether_core::middleware::{from_fn, Verdict};
//!
//! let reject_binary_events = from_fn(|ctx| async move {
//!     if ctx.event().starts_with("internal.") {
//!         return Ok(Verdict::Block);
//!     }
//!     Ok(Verdict::Continue)
//! });
//! ```
//!
//! ## Implementing the trait
//!
//! ```
//! use async_trait::async_trait;
//! use wstether_core::context::Context;
//! use wstether_core::error::Result;
//! use wstether_core::middleware::{Middleware, Verdict};
//!
//! struct RequireCorrelation;
//!
//! #[async_trait]
//! impl Middleware for RequireCorrelation {
//!     async fn handle(&self, ctx: &Context) -> Result<Verdict> {
//!         if ctx.message.correlation_id.is_none() {
//!             ctx.error(1001, "correlation id required", None)?;
//!             return Ok(Verdict::Block);
//!         }
//!         Ok(Verdict::Continue)
//!     }
//! }
//! ```

pub mod logger;
pub mod rate_limit;

pub use logger::{LogLevel, LoggerMiddleware};
pub use rate_limit::RateLimitMiddleware;

use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// The outcome of one middleware invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the message to the next middleware or the handler.
    Continue,
    /// End dispatch silently. The middleware owns any reply.
    Block,
}

/// A global interception point run before every dispatch.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Inspects the inbound context and decides whether dispatch proceeds.
    async fn handle(&self, ctx: &Context) -> Result<Verdict>;
}

/// Function-based middleware, for closures that don't need their own type.
pub struct FnMiddleware<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Verdict>> + Send + 'static,
{
    async fn handle(&self, ctx: &Context) -> Result<Verdict> {
        (self.func)(ctx.clone()).await
    }
}

/// Wraps an async function as a [`Middleware`].
pub fn from_fn<F, Fut>(f: F) -> Arc<FnMiddleware<F>>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Verdict>> + Send + 'static,
{
    Arc::new(FnMiddleware { func: f })
}
