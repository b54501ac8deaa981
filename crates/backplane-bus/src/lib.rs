// Pub/sub fabric abstraction the hub coordinates over, plus the channel
// naming scheme and an in-process implementation for tests and demos.
mod channels;
mod local;

pub use channels::Channels;
pub use local::{LocalBus, LocalFabric};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("publish failed on {channel}: {reason}")]
    Publish { channel: String, reason: String },
    #[error("subscribe failed on {channel}: {reason}")]
    Subscribe { channel: String, reason: String },
    #[error("unsubscribe failed on {channel}: {reason}")]
    Unsubscribe { channel: String, reason: String },
    #[error("bus connection closed")]
    Closed,
}

/// Callback invoked with the raw payload of every message arriving on a
/// subscribed channel.
pub type BusHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connection-state transitions reported by the bus client. Subscribers are
/// expected to be sticky across transient disconnects, so consumers only
/// observe these for logging.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Restored,
    Failed { reason: String },
}

/// One server's handle onto the shared pub/sub fabric.
///
/// Delivery is at-least-once to currently subscribed consumers, and two
/// publishes to the same channel from the same handle arrive in publish
/// order. Channels this handle never subscribed to are never delivered to
/// it.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Register `handler` for `channel`. A channel may carry several
    /// handlers from the same handle; each sees every message.
    async fn subscribe(&self, channel: &str, handler: BusHandler) -> Result<()>;

    /// Drop every handler this handle registered for `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    fn events(&self) -> broadcast::Receiver<BusEvent>;
}
