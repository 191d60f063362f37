//! Reconnection: rebinding a new connection to an existing session.
//!
//! Handles `sys.reconnect.request`. The decision algorithm:
//!
//! 1. Look up the claimed session; absent or closed fails with
//!    session-not-found.
//! 2. With revalidation enabled and an authenticator present, revalidate
//!    the token; failure is token-expired.
//! 3. Rebind atomically through the session registry (serialized per
//!    session id by the session's operation lock).
//! 4. The displaced connection, if any, receives a best-effort
//!    `sys.disconnect` with reason `replaced_by_reconnection` and is closed
//!    with the session-duplicate close code.
//! 5. The new connection receives `sys.session.restored` carrying the
//!    session id, user id, rooms, and metadata.
//!
//! Two racing reconnection attempts for the same session resolve
//! last-writer-wins: each displaced connection is closed by its displacer,
//! so the session always ends with exactly one attached connection.

use crate::auth::Authenticator;
use crate::connection::Connection;
use crate::error::{close_code, Error, Result};
use crate::protocol::{events, WireMessage};
use crate::session::{restored_payload, Session, SessionRegistry};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Processes a reconnection request arriving on `conn`.
///
/// `revalidate` controls whether a presented token is revalidated against
/// the authenticator. On success the session is active on `conn` and
/// `sys.session.restored` has been queued; the caller switches its dispatch
/// context to the returned session.
///
/// # Errors
///
/// - [`Error::Validation`] when the request carries no `sessionId`
/// - [`Error::SessionNotFound`] when the session is absent or closed
/// - [`Error::TokenExpired`] when token revalidation fails
pub async fn handle_reconnect(
    sessions: &Arc<SessionRegistry>,
    authenticator: Option<&Arc<dyn Authenticator>>,
    revalidate: bool,
    conn: &Arc<Connection>,
    request: &WireMessage,
) -> Result<Arc<Session>> {
    let session_id = request
        .payload_str("sessionId")
        .ok_or_else(|| Error::validation("sessionId"))?
        .to_string();
    let token = request.payload_str("token");

    if sessions.get(&session_id).is_none() {
        return Err(Error::SessionNotFound(session_id));
    }

    if revalidate {
        if let (Some(auth), Some(token)) = (authenticator, token) {
            if !auth.validate_token(token).await {
                debug!("Reconnect token revalidation failed for {}", session_id);
                return Err(Error::TokenExpired);
            }
        }
    }

    let (session, displaced) = sessions
        .reconnect(&session_id, conn.clone())
        .await
        .ok_or(Error::SessionNotFound(session_id))?;

    if let Some(old) = displaced {
        // A connection reclaiming its own session must not displace itself.
        if old.id() != conn.id() {
            let mut notice = WireMessage::new(request.version.clone(), events::DISCONNECT);
            notice.payload.insert(
                "reason".to_string(),
                Value::String("replaced_by_reconnection".to_string()),
            );
            let _ = old.send(notice);
            old.close(close_code::SESSION_DUPLICATE, "replaced by reconnection");
            info!(
                "Displaced connection {} from session {}",
                old.id(),
                session.id()
            );
        }
    }

    let restored = WireMessage {
        version: request.version.clone(),
        event: events::SESSION_RESTORED.to_string(),
        payload: restored_payload(&session),
        correlation_id: request.correlation_id.clone(),
        timestamp: crate::protocol::now_ms(),
    };
    conn.send(restored)?;

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthOutcome;
    use crate::connection::Frame;
    use crate::session::SessionState;
    use async_trait::async_trait;
    use serde_json::json;

    fn request(session_id: &str, token: Option<&str>) -> WireMessage {
        let mut payload = json!({ "sessionId": session_id });
        if let Some(t) = token {
            payload["token"] = json!(t);
        }
        WireMessage::new("1.0", events::RECONNECT_REQUEST).with_payload(payload)
    }

    struct FixedTokenAuth {
        valid: &'static str,
    }

    #[async_trait]
    impl Authenticator for FixedTokenAuth {
        async fn authenticate(
            &self,
            _conn: &Arc<Connection>,
            token: Option<&str>,
        ) -> AuthOutcome {
            match token {
                Some(t) if t == self.valid => AuthOutcome::ok("alice"),
                _ => AuthOutcome::failed("bad token"),
            }
        }

        async fn validate_token(&self, token: &str) -> bool {
            token == self.valid
        }
    }

    #[tokio::test]
    async fn test_restores_session_state() {
        let sessions = SessionRegistry::new();
        let (c1, _r1) = Connection::open("c1".to_string());
        let session = sessions.create(Some("alice".to_string()), Some(c1), None);
        session.add_room("general");
        sessions.suspend(session.id()).await;

        let (c2, mut r2) = Connection::open("c2".to_string());
        let restored = handle_reconnect(&sessions, None, false, &c2, &request(session.id(), None))
            .await
            .unwrap();

        assert_eq!(restored.id(), session.id());
        assert_eq!(restored.state(), SessionState::Active);

        // sys.session.restored carries identity, rooms, and metadata.
        let frame = r2.try_recv().unwrap();
        let Frame::Message(msg) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(msg.event, events::SESSION_RESTORED);
        assert_eq!(msg.payload_str("sessionId"), Some(session.id().as_str()));
        assert_eq!(msg.payload_str("userId"), Some("alice"));
        let rooms = msg.payload.get("rooms").unwrap().as_array().unwrap();
        assert_eq!(rooms, &vec![json!("general")]);
    }

    #[tokio::test]
    async fn test_unknown_session_fails() {
        let sessions = SessionRegistry::new();
        let (conn, _rx) = Connection::open("c1".to_string());
        let err = handle_reconnect(&sessions, None, false, &conn, &request("sess_nope", None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_closed_session_fails() {
        let sessions = SessionRegistry::new();
        let session = sessions.create(None, None, None);
        sessions.close(session.id(), 1000, None).await;

        let (conn, _rx) = Connection::open("c1".to_string());
        let err = handle_reconnect(&sessions, None, false, &conn, &request(session.id(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_session_id_is_validation_error() {
        let sessions = SessionRegistry::new();
        let (conn, _rx) = Connection::open("c1".to_string());
        let msg = WireMessage::new("1.0", events::RECONNECT_REQUEST);
        let err = handle_reconnect(&sessions, None, false, &conn, &msg)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field } if field == "sessionId"));
    }

    #[tokio::test]
    async fn test_token_revalidation_failure() {
        let sessions = SessionRegistry::new();
        let session = sessions.create(Some("alice".to_string()), None, None);
        let auth: Arc<dyn Authenticator> = Arc::new(FixedTokenAuth { valid: "good" });

        let (conn, _rx) = Connection::open("c1".to_string());
        let err = handle_reconnect(
            &sessions,
            Some(&auth),
            true,
            &conn,
            &request(session.id(), Some("stale")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TokenExpired));
        assert_eq!(session.state(), SessionState::Suspended);
    }

    #[tokio::test]
    async fn test_displaced_connection_notified_and_closed() {
        let sessions = SessionRegistry::new();
        let (c1, mut r1) = Connection::open("c1".to_string());
        let session = sessions.create(None, Some(c1.clone()), None);

        let (c2, _r2) = Connection::open("c2".to_string());
        handle_reconnect(&sessions, None, false, &c2, &request(session.id(), None))
            .await
            .unwrap();

        let Frame::Message(notice) = r1.try_recv().unwrap() else {
            panic!("expected disconnect notice");
        };
        assert_eq!(notice.event, events::DISCONNECT);
        assert_eq!(notice.payload_str("reason"), Some("replaced_by_reconnection"));
        match r1.try_recv().unwrap() {
            Frame::Close { code, .. } => assert_eq!(code, close_code::SESSION_DUPLICATE),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(!c1.is_active());
        assert_eq!(session.connection().unwrap().id(), c2.id());
    }

    #[tokio::test]
    async fn test_racing_reconnects_leave_one_attached() {
        let sessions = SessionRegistry::new();
        let (c0, _r0) = Connection::open("c0".to_string());
        let session = sessions.create(None, Some(c0), None);

        let (ca, _ra) = Connection::open("ca".to_string());
        let (cb, _rb) = Connection::open("cb".to_string());

        let ta = {
            let sessions = sessions.clone();
            let ca = ca.clone();
            let req = request(session.id(), None);
            tokio::spawn(async move { handle_reconnect(&sessions, None, false, &ca, &req).await })
        };
        let tb = {
            let sessions = sessions.clone();
            let cb = cb.clone();
            let req = request(session.id(), None);
            tokio::spawn(async move { handle_reconnect(&sessions, None, false, &cb, &req).await })
        };

        // The loser may fail outright (its connection was closed under it);
        // at least one attempt must succeed.
        let results = [ta.await.unwrap(), tb.await.unwrap()];
        assert!(results.iter().any(|r| r.is_ok()));

        // Last writer wins; everyone else is closed with the duplicate code.
        let attached = session.connection().unwrap();
        assert!(attached.is_active());
        let mut closed = 0;
        for conn in [&ca, &cb] {
            if conn.id() != attached.id() {
                assert!(!conn.is_active());
                assert_eq!(conn.close_code(), Some(close_code::SESSION_DUPLICATE));
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert_eq!(session.state(), SessionState::Active);
    }
}
