//! Per-session rate limiting.
//!
//! A fixed-window limiter keyed by session id. When a session exceeds the
//! configured budget, the middleware replies with a code-1010 `sys.error`
//! and blocks dispatch — the handler never sees the message.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use wstether_core::middleware::RateLimitMiddleware;
//!
//! // At most 100 messages per session per 10 seconds.
//! let limiter = RateLimitMiddleware::new(100, Duration::from_secs(10));
//! ```

use crate::context::Context;
use crate::error::{Error, Result};
use crate::middleware::{Middleware, Verdict};
use crate::protocol::now_ms;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

struct Window {
    started_at: u64,
    count: u32,
}

/// Fixed-window per-session rate limiter.
pub struct RateLimitMiddleware {
    max_requests: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl RateLimitMiddleware {
    /// Allows `max_requests` messages per session within each `window`.
    pub fn new(max_requests: u32, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            max_requests,
            window,
            windows: DashMap::new(),
        })
    }

    fn admit(&self, session_id: &str) -> bool {
        let now = now_ms();
        let window_ms = self.window.as_millis() as u64;
        let mut entry = self.windows.entry(session_id.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now.saturating_sub(entry.started_at) >= window_ms {
            entry.started_at = now;
            entry.count = 0;
        }
        entry.count += 1;
        entry.count <= self.max_requests
    }

    /// Drops the window for a session, for use on session close.
    pub fn forget(&self, session_id: &str) {
        self.windows.remove(session_id);
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(&self, ctx: &Context) -> Result<Verdict> {
        if self.admit(ctx.session.id()) {
            return Ok(Verdict::Continue);
        }
        debug!("Rate limit exceeded for session {}", ctx.session.id());
        let _ = ctx.error(Error::RateLimited.code(), "Rate limit exceeded", None);
        Ok(Verdict::Block)
    }
}
