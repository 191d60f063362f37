//! Logging middleware.
//!
//! Records every inbound message — event name, session, connection,
//! correlation — through the `tracing` crate at a configurable level, then
//! lets dispatch continue.
//!
//! # Examples
//!
//! ```
//! use wstether_core::middleware::{LoggerMiddleware, LogLevel};
//!
//! // Standard logging for production.
//! let logger = LoggerMiddleware::new();
//!
//! // Verbose logging for development.
//! let verbose = LoggerMiddleware::with_level(LogLevel::Debug);
//! ```

use crate::context::Context;
use crate::error::Result;
use crate::middleware::{Middleware, Verdict};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Verbosity of the logger middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Log every message with payload size details.
    Debug,
    /// Log every message at info level.
    Info,
}

/// Middleware that logs inbound messages and always continues.
pub struct LoggerMiddleware {
    level: LogLevel,
}

impl LoggerMiddleware {
    /// Creates a logger at [`LogLevel::Info`].
    pub fn new() -> Arc<Self> {
        Self::with_level(LogLevel::Info)
    }

    /// Creates a logger at the given level.
    pub fn with_level(level: LogLevel) -> Arc<Self> {
        Arc::new(Self { level })
    }
}

#[async_trait]
impl Middleware for LoggerMiddleware {
    async fn handle(&self, ctx: &Context) -> Result<Verdict> {
        match self.level {
            LogLevel::Debug => debug!(
                event = %ctx.event(),
                session = %ctx.session.id(),
                connection = %ctx.connection.id(),
                correlation = ctx.message.correlation_id.as_deref().unwrap_or("-"),
                payload_fields = ctx.payload().len(),
                "Inbound message"
            ),
            LogLevel::Info => info!(
                event = %ctx.event(),
                session = %ctx.session.id(),
                "Inbound message"
            ),
        }
        Ok(Verdict::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::protocol::WireMessage;
    use crate::rooms::RoomRegistry;
    use crate::session::SessionRegistry;

    #[tokio::test]
    async fn test_logger_always_continues() {
        let sessions = SessionRegistry::new();
        let rooms = RoomRegistry::new(sessions.clone());
        let (conn, _rx) = Connection::open("c1".to_string());
        let session = sessions.create(None, Some(conn.clone()), None);
        let ctx = Context::new(
            session,
            conn,
            WireMessage::new("1.0", "anything"),
            sessions,
            rooms,
        );

        let logger = LoggerMiddleware::new();
        assert_eq!(logger.handle(&ctx).await.unwrap(), Verdict::Continue);

        let verbose = LoggerMiddleware::with_level(LogLevel::Debug);
        assert_eq!(verbose.handle(&ctx).await.unwrap(), Verdict::Continue);
    }
}
