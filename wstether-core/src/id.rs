//! Opaque identifier generation.
//!
//! Every entity the runtime tracks — connections, sessions, request
//! correlations — gets a prefixed random id. The prefix makes log lines
//! self-describing; the uuid body guarantees uniqueness across the process
//! lifetime and prevents reuse after restarts.

use uuid::Uuid;

/// Returns a fresh connection id (`conn_<uuid>`).
pub fn connection_id() -> String {
    format!("conn_{}", Uuid::new_v4().simple())
}

/// Returns a fresh session id (`sess_<uuid>`).
pub fn session_id() -> String {
    format!("sess_{}", Uuid::new_v4().simple())
}

/// Returns a fresh correlation id (`corr_<uuid>`).
pub fn correlation_id() -> String {
    format!("corr_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_prefixes() {
        assert!(connection_id().starts_with("conn_"));
        assert!(session_id().starts_with("sess_"));
        assert!(correlation_id().starts_with("corr_"));
    }

    #[test]
    fn test_no_reuse() {
        let ids: HashSet<String> = (0..1000).map(|_| session_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
