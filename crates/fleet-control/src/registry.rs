//! Connection registry
//!
//! One [`Connection`] per connected agent or node. Mutated only by the hub's
//! register/unregister paths; reads clone the `Arc` out so no lock is held
//! during I/O.

use fleet_proto::ResourceKind;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::connection::Connection;

type Key = (ResourceKind, String);

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Key, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `conn`, returning the connection it replaced
    pub fn register_or_replace(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let old = connections.insert((conn.kind, conn.id.clone()), conn.clone());

        match &old {
            Some(replaced) => tracing::info!(
                kind = %conn.kind,
                id = %conn.id,
                conn_uid = conn.conn_uid,
                old_conn_uid = replaced.conn_uid,
                old_connected_at = %replaced.connected_at,
                "Re-registered connection (replaced stale connection)"
            ),
            None => tracing::info!(
                kind = %conn.kind,
                id = %conn.id,
                conn_uid = conn.conn_uid,
                "Registered connection"
            ),
        }

        old
    }

    /// Remove the entry only if it is still the connection `conn_uid`
    ///
    /// A connection that has already been replaced leaves the newer one alone.
    pub fn remove_if_current(
        &self,
        kind: ResourceKind,
        id: &str,
        conn_uid: u64,
    ) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let key = (kind, id.to_string());
        match connections.get(&key) {
            Some(current) if current.conn_uid == conn_uid => connections.remove(&key),
            _ => None,
        }
    }

    pub fn get(&self, kind: ResourceKind, id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(kind, id.to_string()))
            .cloned()
    }

    pub fn contains(&self, kind: ResourceKind, id: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(kind, id.to_string()))
    }

    /// Ids of every connected resource of `kind`, sorted
    pub fn ids(&self, kind: ResourceKind) -> Vec<String> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = connections
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn conn(kind: ResourceKind, id: &str, uid: u64) -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Connection::new(
            kind,
            id.to_string(),
            uid,
            None,
            tx,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_replace_returns_old() {
        let registry = ConnectionRegistry::new();
        assert!(registry
            .register_or_replace(conn(ResourceKind::Agent, "fa_001", 1))
            .is_none());

        let old = registry
            .register_or_replace(conn(ResourceKind::Agent, "fa_001", 2))
            .unwrap();
        assert_eq!(old.conn_uid, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(ResourceKind::Agent, "fa_001").unwrap().conn_uid, 2);
    }

    #[test]
    fn test_stale_removal_keeps_newer_connection() {
        let registry = ConnectionRegistry::new();
        registry.register_or_replace(conn(ResourceKind::Agent, "fa_001", 1));
        registry.register_or_replace(conn(ResourceKind::Agent, "fa_001", 2));

        assert!(registry
            .remove_if_current(ResourceKind::Agent, "fa_001", 1)
            .is_none());
        assert!(registry.contains(ResourceKind::Agent, "fa_001"));

        assert!(registry
            .remove_if_current(ResourceKind::Agent, "fa_001", 2)
            .is_some());
        assert!(registry
            .remove_if_current(ResourceKind::Agent, "fa_001", 2)
            .is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_kinds_are_separate() {
        let registry = ConnectionRegistry::new();
        registry.register_or_replace(conn(ResourceKind::Agent, "x", 1));
        registry.register_or_replace(conn(ResourceKind::Node, "x", 2));

        assert_eq!(registry.ids(ResourceKind::Agent), vec!["x"]);
        assert_eq!(registry.ids(ResourceKind::Node), vec!["x"]);
        registry.remove_if_current(ResourceKind::Node, "x", 2);
        assert!(registry.contains(ResourceKind::Agent, "x"));
        assert!(!registry.contains(ResourceKind::Node, "x"));
    }
}
