// Local view of group membership, keyed by the group's bus channel so
// registry lookups and channel formatting share one key.
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Mutable core of a group entry. The surrounding mutex also guards the
/// subscribe/unsubscribe transition, so membership changes for one group
/// serialize against the bus subscription state while distinct groups
/// proceed in parallel.
#[derive(Default)]
pub(crate) struct GroupMembers {
    pub(crate) connections: HashSet<String>,
    pub(crate) subscribed: bool,
}

#[derive(Default)]
pub(crate) struct GroupEntry {
    pub(crate) members: Mutex<GroupMembers>,
}

/// Entries are created on first local add and retained once empty; a
/// retained entry re-subscribes when a member comes back.
pub(crate) struct GroupRegistry {
    inner: DashMap<String, Arc<GroupEntry>>,
}

impl GroupRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub(crate) fn get(&self, channel: &str) -> Option<Arc<GroupEntry>> {
        self.inner.get(channel).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn get_or_create(&self, channel: &str) -> Arc<GroupEntry> {
        Arc::clone(
            self.inner
                .entry(channel.to_string())
                .or_default()
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entry_is_retained_when_empty() {
        let registry = GroupRegistry::new();
        let entry = registry.get_or_create("hub:g:room");
        {
            let mut members = entry.members.lock().await;
            members.connections.insert("c1".to_string());
            members.subscribed = true;
        }
        {
            let mut members = entry.members.lock().await;
            members.connections.remove("c1");
            members.subscribed = false;
        }
        // The drained entry stays in the map and is handed back on re-add.
        let again = registry.get("hub:g:room").expect("retained");
        assert!(Arc::ptr_eq(&entry, &again));
        assert!(!again.members.lock().await.subscribed);
    }

    #[tokio::test]
    async fn get_or_create_reuses_entry() {
        let registry = GroupRegistry::new();
        let first = registry.get_or_create("hub:g:room");
        let second = registry.get_or_create("hub:g:room");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.get("hub:g:other").is_none());
    }
}
