// Tracks in-flight group commands until the owning server confirms them.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::{HubError, Result};

/// One waiter slot per outstanding group command, keyed by the command ID.
/// A slot is removed exactly once: on trigger, on timeout, or at shutdown.
pub(crate) struct AckCoordinator {
    slots: DashMap<u32, oneshot::Sender<()>>,
    timeout: Duration,
    shutdown: AtomicBool,
}

impl AckCoordinator {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            timeout,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Register a slot before publishing the command, so an ack racing the
    /// publish still finds its waiter.
    pub(crate) fn create(&self, id: u32) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        self.slots.insert(id, sender);
        receiver
    }

    pub(crate) async fn wait(&self, id: u32, receiver: oneshot::Receiver<()>) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            self.slots.remove(&id);
            return Err(HubError::ManagerShutdown);
        }
        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(())) => Ok(()),
            // The sender only disappears without firing when shutdown drains
            // the slot table.
            Ok(Err(_)) => Err(HubError::ManagerShutdown),
            Err(_) => {
                self.slots.remove(&id);
                Err(HubError::AckTimeout { id })
            }
        }
    }

    /// Drop a slot whose command was never published.
    pub(crate) fn discard(&self, id: u32) {
        self.slots.remove(&id);
    }

    /// Complete the waiter if one is still registered; late or foreign acks
    /// are ignored.
    pub(crate) fn trigger(&self, id: u32) {
        match self.slots.remove(&id) {
            Some((_, sender)) => {
                let _ = sender.send(());
            }
            None => tracing::debug!(id, "ignoring ack with no waiting slot"),
        }
    }

    /// Fail every outstanding waiter.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.slots.clear();
    }
}
