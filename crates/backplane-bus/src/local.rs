// In-process fabric: several bus handles wired together in one process.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, broadcast};

use crate::{Bus, BusError, BusEvent, BusHandler, Result};

const EVENT_CHANNEL_CAPACITY: usize = 16;

struct Subscriber {
    handle_id: u64,
    handler: BusHandler,
}

/// Shared channel table connecting any number of [`LocalBus`] handles.
///
/// Dispatch is serial per publish, in subscription order, so two publishes
/// to one channel from one handle arrive at every subscriber in publish
/// order. The publishing handle's own subscribers are included.
#[derive(Default)]
pub struct LocalFabric {
    channels: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_handle_id: AtomicU64,
}

impl LocalFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new handle, the way one server process opens one bus
    /// connection.
    pub fn connect(self: &Arc<Self>) -> Arc<LocalBus> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(LocalBus {
            fabric: Arc::clone(self),
            handle_id: self.next_handle_id.fetch_add(1, Ordering::Relaxed),
            events,
        })
    }

    /// Number of handlers currently registered for `channel`, across all
    /// handles. Useful for asserting subscription lifecycle in tests.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn dispatch(&self, channel: &str, payload: Bytes) {
        // Snapshot before awaiting so handlers may re-enter the fabric.
        let handlers: Vec<BusHandler> = {
            let guard = self.channels.read().await;
            match guard.get(channel) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|subscriber| Arc::clone(&subscriber.handler))
                    .collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(payload.clone()).await;
        }
    }
}

/// One server's handle onto a [`LocalFabric`].
pub struct LocalBus {
    fabric: Arc<LocalFabric>,
    handle_id: u64,
    events: broadcast::Sender<BusEvent>,
}

impl LocalBus {
    /// Test hook: report a connection-state transition to event consumers.
    pub fn emit_event(&self, event: BusEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.fabric.dispatch(channel, payload).await;
        metrics::counter!("backplane_bus_published_total").increment(1);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: BusHandler) -> Result<()> {
        let mut guard = self.fabric.channels.write().await;
        guard.entry(channel.to_string()).or_default().push(Subscriber {
            handle_id: self.handle_id,
            handler,
        });
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut guard = self.fabric.channels.write().await;
        if let Some(subscribers) = guard.get_mut(channel) {
            subscribers.retain(|subscriber| subscriber.handle_id != self.handle_id);
            if subscribers.is_empty() {
                guard.remove(channel);
            }
            Ok(())
        } else {
            Err(BusError::Unsubscribe {
                channel: channel.to_string(),
                reason: "not subscribed".to_string(),
            })
        }
    }

    fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handler(seen: &Arc<Mutex<Vec<Bytes>>>) -> BusHandler {
        let seen = Arc::clone(seen);
        Arc::new(
            move |payload| -> futures::future::BoxFuture<'static, ()> {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    seen.lock().expect("seen lock").push(payload);
                })
            },
        )
    }

    #[tokio::test]
    async fn publish_reaches_every_handle_including_self() {
        let fabric = LocalFabric::new();
        let a = fabric.connect();
        let b = fabric.connect();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        a.subscribe("ch", recording_handler(&seen_a)).await.expect("subscribe");
        b.subscribe("ch", recording_handler(&seen_b)).await.expect("subscribe");

        a.publish("ch", Bytes::from_static(b"hello")).await.expect("publish");

        assert_eq!(seen_a.lock().expect("lock").len(), 1);
        assert_eq!(seen_b.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn publish_order_is_preserved_per_channel() {
        let fabric = LocalFabric::new();
        let bus = fabric.connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("ch", recording_handler(&seen)).await.expect("subscribe");

        for index in 0..10u8 {
            bus.publish("ch", Bytes::from(vec![index])).await.expect("publish");
        }

        let seen = seen.lock().expect("lock");
        let order: Vec<u8> = seen.iter().map(|payload| payload[0]).collect();
        assert_eq!(order, (0..10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn unsubscribe_only_drops_own_handlers() {
        let fabric = LocalFabric::new();
        let a = fabric.connect();
        let b = fabric.connect();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        a.subscribe("ch", recording_handler(&seen_a)).await.expect("subscribe");
        b.subscribe("ch", recording_handler(&seen_b)).await.expect("subscribe");

        a.unsubscribe("ch").await.expect("unsubscribe");
        b.publish("ch", Bytes::from_static(b"x")).await.expect("publish");

        assert!(seen_a.lock().expect("lock").is_empty());
        assert_eq!(seen_b.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn unsubscribed_channel_is_not_delivered() {
        let fabric = LocalFabric::new();
        let bus = fabric.connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("ch", recording_handler(&seen)).await.expect("subscribe");

        bus.publish("other", Bytes::from_static(b"x")).await.expect("publish");

        assert!(seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_channel_errors() {
        let fabric = LocalFabric::new();
        let bus = fabric.connect();
        let err = bus.unsubscribe("missing").await.expect_err("unknown");
        assert!(matches!(err, BusError::Unsubscribe { .. }));
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let fabric = LocalFabric::new();
        let bus = fabric.connect();
        let mut events = bus.events();
        bus.emit_event(BusEvent::Failed {
            reason: "connection reset".to_string(),
        });
        match events.recv().await.expect("event") {
            BusEvent::Failed { reason } => assert_eq!(reason, "connection reset"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
