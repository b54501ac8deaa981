// Local connection registry plus the per-connection state side table.
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::connection::ClientConnection;

/// What the hub tracks for one registered connection: the channels it
/// subscribed on the bus and the groups it joined. Lives exactly as long as
/// the registration.
#[derive(Default)]
pub(crate) struct ConnectionState {
    subscriptions: Mutex<Vec<String>>,
    groups: Mutex<Vec<String>>,
}

impl ConnectionState {
    pub(crate) async fn record_subscription(&self, channel: String) {
        self.subscriptions.lock().await.push(channel);
    }

    pub(crate) async fn take_subscriptions(&self) -> Vec<String> {
        std::mem::take(&mut *self.subscriptions.lock().await)
    }

    /// Returns false when the connection is already in the group. Group
    /// names compare case-insensitively here; the first spelling wins.
    pub(crate) async fn add_group(&self, group_name: &str) -> bool {
        let mut groups = self.groups.lock().await;
        if groups
            .iter()
            .any(|name| name.eq_ignore_ascii_case(group_name))
        {
            return false;
        }
        groups.push(group_name.to_string());
        true
    }

    pub(crate) async fn remove_group(&self, group_name: &str) {
        self.groups
            .lock()
            .await
            .retain(|name| !name.eq_ignore_ascii_case(group_name));
    }

    pub(crate) async fn groups_snapshot(&self) -> Vec<String> {
        self.groups.lock().await.clone()
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredConnection {
    pub(crate) handle: Arc<dyn ClientConnection>,
    pub(crate) state: Arc<ConnectionState>,
}

/// Concurrent map of locally terminated connections. At most one handle per
/// connection ID; lookups are O(1) and iteration works on a snapshot.
pub(crate) struct ConnectionRegistry {
    inner: DashMap<String, RegisteredConnection>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Register a handle with a fresh state entry, replacing any stale
    /// registration under the same ID.
    pub(crate) fn insert(&self, handle: Arc<dyn ClientConnection>) -> RegisteredConnection {
        let registered = RegisteredConnection {
            handle: Arc::clone(&handle),
            state: Arc::new(ConnectionState::default()),
        };
        self.inner
            .insert(handle.connection_id().to_string(), registered.clone());
        registered
    }

    pub(crate) fn get(&self, connection_id: &str) -> Option<RegisteredConnection> {
        self.inner
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, connection_id: &str) -> Option<RegisteredConnection> {
        self.inner
            .remove(connection_id)
            .map(|(_, registered)| registered)
    }

    pub(crate) fn snapshot(&self) -> Vec<RegisteredConnection> {
        self.inner.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backplane_proto::InvocationMessage;
    use bytes::Bytes;

    struct StubConnection {
        id: String,
    }

    #[async_trait]
    impl ClientConnection for StubConnection {
        fn connection_id(&self) -> &str {
            &self.id
        }
        fn user_id(&self) -> Option<&str> {
            None
        }
        fn protocol(&self) -> &str {
            "json"
        }
        async fn write_message(&self, _message: &InvocationMessage) -> anyhow::Result<()> {
            Ok(())
        }
        async fn write_payload(&self, _payload: Bytes) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_lookup_remove() {
        let registry = ConnectionRegistry::new();
        registry.insert(Arc::new(StubConnection { id: "c1".into() }));
        assert!(registry.get("c1").is_some());
        assert!(registry.get("c2").is_none());
        assert!(registry.remove("c1").is_some());
        assert!(registry.get("c1").is_none());
        assert!(registry.remove("c1").is_none());
    }

    #[tokio::test]
    async fn group_membership_is_case_insensitive() {
        let state = ConnectionState::default();
        assert!(state.add_group("Room").await);
        assert!(!state.add_group("room").await);
        assert_eq!(state.groups_snapshot().await, vec!["Room".to_string()]);
        state.remove_group("ROOM").await;
        assert!(state.groups_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn take_subscriptions_drains() {
        let state = ConnectionState::default();
        state.record_subscription("hub:c:c1".to_string()).await;
        state.record_subscription("hub:u:u1".to_string()).await;
        let taken = state.take_subscriptions().await;
        assert_eq!(taken.len(), 2);
        assert!(state.take_subscriptions().await.is_empty());
    }
}
