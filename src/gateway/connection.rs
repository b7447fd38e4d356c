//! Console connection registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

/// State tracked per console connection. Lifecycle is tied to the
/// underlying socket.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: Uuid,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub client_info: Option<String>,
    pub subscriptions: HashSet<String>,
}

/// Registry of live connections with a global cap.
pub struct ConnectionRegistry {
    max_connections: usize,
    inner: Arc<RwLock<HashMap<Uuid, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new connection, or refuse when the cap is reached.
    pub async fn register(
        &self,
        id: Uuid,
        authenticated: bool,
        client_info: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        if inner.len() >= self.max_connections {
            return false;
        }
        inner.insert(
            id,
            Connection {
                id,
                authenticated,
                connected_at: now,
                last_activity_at: now,
                client_info,
                subscriptions: HashSet::new(),
            },
        );
        true
    }

    pub async fn remove(&self, id: Uuid) {
        self.inner.write().await.remove(&id);
    }

    pub async fn set_authenticated(&self, id: Uuid, authenticated: bool, now: DateTime<Utc>) {
        if let Some(conn) = self.inner.write().await.get_mut(&id) {
            conn.authenticated = authenticated;
            conn.last_activity_at = now;
        }
    }

    pub async fn is_authenticated(&self, id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .get(&id)
            .is_some_and(|c| c.authenticated)
    }

    pub async fn subscribe(&self, id: Uuid, events: &[String], now: DateTime<Utc>) {
        if let Some(conn) = self.inner.write().await.get_mut(&id) {
            conn.subscriptions.extend(events.iter().cloned());
            conn.last_activity_at = now;
        }
    }

    /// Whether `id` is authenticated and subscribed to `topic`.
    pub async fn wants_event(&self, id: Uuid, topic: &str) -> bool {
        self.inner.read().await.get(&id).is_some_and(|c| {
            c.authenticated && (c.subscriptions.contains(topic) || c.subscriptions.contains("*"))
        })
    }

    pub async fn touch(&self, id: Uuid, now: DateTime<Utc>) {
        if let Some(conn) = self.inner.write().await.get_mut(&id) {
            conn.last_activity_at = now;
        }
    }

    pub async fn list(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> =
            self.inner.read().await.values().cloned().collect();
        connections.sort_by_key(|c| c.connected_at);
        connections
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cap_enforced() {
        let registry = ConnectionRegistry::new(2);
        let now = Utc::now();
        assert!(registry.register(Uuid::new_v4(), true, None, now).await);
        assert!(registry.register(Uuid::new_v4(), true, None, now).await);
        assert!(!registry.register(Uuid::new_v4(), true, None, now).await);
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn test_remove_frees_capacity() {
        let registry = ConnectionRegistry::new(1);
        let now = Utc::now();
        let id = Uuid::new_v4();
        assert!(registry.register(id, true, None, now).await);
        registry.remove(id).await;
        assert!(registry.register(Uuid::new_v4(), true, None, now).await);
    }

    #[tokio::test]
    async fn test_subscriptions_gate_events() {
        let registry = ConnectionRegistry::new(4);
        let now = Utc::now();
        let id = Uuid::new_v4();
        registry.register(id, false, None, now).await;
        registry
            .subscribe(id, &["task".to_string()], now)
            .await;

        // Unauthenticated connections never receive events.
        assert!(!registry.wants_event(id, "task").await);

        registry.set_authenticated(id, true, now).await;
        assert!(registry.wants_event(id, "task").await);
        assert!(!registry.wants_event(id, "agent").await);
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let registry = ConnectionRegistry::new(4);
        let now = Utc::now();
        let id = Uuid::new_v4();
        registry.register(id, true, None, now).await;
        registry.subscribe(id, &["*".to_string()], now).await;
        assert!(registry.wants_event(id, "scaling").await);
    }
}
