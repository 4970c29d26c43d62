//! Connection multiplexing store
//!
//! The only globally shared mutable structure in the engine: a
//! concurrency-safe map from composite key `sessionID:connectionID` to the
//! live proxy handle for that client connection. Deleting an entry does
//! not close the underlying proxy; callers close and then delete.

use dashmap::DashMap;

use super::ProxyConnection;

/// Build the composite key a proxy is stored and addressed under.
pub fn composite_key(session_id: &str, connection_id: &str) -> String {
    format!("{session_id}:{connection_id}")
}

/// Concurrency-safe store of live proxy connections.
#[derive(Default)]
pub struct ConnectionStore {
    entries: DashMap<String, ProxyConnection>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, conn: ProxyConnection) {
        self.entries.insert(key.to_string(), conn);
    }

    /// Look up a live proxy. Handles are cheap clones over shared state.
    pub fn get(&self, key: &str) -> Option<ProxyConnection> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn delete(&self, key: &str) -> Option<ProxyConnection> {
        self.entries.remove(key).map(|(_, conn)| conn)
    }

    /// Collect every entry whose key matches the predicate. Used for bulk
    /// teardown: prefix matches for one client connection's sub-channels,
    /// session matches for a whole session.
    pub fn filter(&self, predicate: impl Fn(&str) -> bool) -> Vec<(String, ProxyConnection)> {
        self.entries
            .iter()
            .filter(|e| predicate(e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyConnection;

    fn stub() -> ProxyConnection {
        ProxyConnection::stub()
    }

    #[test]
    fn test_set_get_delete() {
        let store = ConnectionStore::new();
        let key = composite_key("sess-1", "conn-1");
        assert!(store.get(&key).is_none());

        store.set(&key, stub());
        assert!(store.get(&key).is_some());
        assert_eq!(store.len(), 1);

        assert!(store.delete(&key).is_some());
        assert!(store.get(&key).is_none());
        assert!(store.delete(&key).is_none());
    }

    #[test]
    fn test_filter_by_session_prefix() {
        let store = ConnectionStore::new();
        store.set(&composite_key("sess-1", "a"), stub());
        store.set(&composite_key("sess-1", "b"), stub());
        store.set(&composite_key("sess-2", "a"), stub());

        let matched = store.filter(|k| k.starts_with("sess-1:"));
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|(k, _)| k.starts_with("sess-1:")));
    }

    #[test]
    fn test_session_filter_does_not_cross_match_suffixes() {
        // A session id that appears as another session's connection id
        // must not be swept with it.
        let store = ConnectionStore::new();
        store.set(&composite_key("sess-1", "7"), stub());
        store.set(&composite_key("other", "sess-1"), stub());

        let session = "sess-1";
        let matched =
            store.filter(|k| k == session || k.starts_with(&format!("{session}:")));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0, "sess-1:7");
    }

    #[test]
    fn test_connection_prefix_matches_sub_channels() {
        // One SSH-style channel key plus a sibling; deleting by
        // connection prefix leaves the sibling alone.
        let store = ConnectionStore::new();
        store.set("sess-1:conn-1", stub());
        store.set("sess-1:conn-1:chan-0", stub());
        store.set("sess-1:conn-2", stub());

        let matched = store.filter(|k| k.starts_with("sess-1:conn-1"));
        assert_eq!(matched.len(), 2);

        for (key, _) in matched {
            store.delete(&key);
        }
        assert_eq!(store.len(), 1);
        assert!(store.get("sess-1:conn-2").is_some());
    }

    #[test]
    fn test_delete_does_not_close() {
        // Deleting only unlinks: the handle stays alive for the caller to
        // close.
        let store = ConnectionStore::new();
        store.set("sess-1:c", stub());
        let conn = store.delete("sess-1:c").unwrap();
        assert!(conn.is_alive());
    }
}
