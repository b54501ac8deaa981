// Manager configuration: channel prefix, server identity, ack timeout.
use std::time::Duration;

use uuid::Uuid;

pub(crate) const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`crate::HubManager`].
///
/// ```
/// use backplane_hub::HubManagerConfig;
///
/// let config = HubManagerConfig::new("chat");
/// assert_eq!(config.hub_name, "chat");
/// assert!(!config.server_name.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct HubManagerConfig {
    /// Prefix for every bus channel, so several hubs can share one fabric.
    pub hub_name: String,
    /// Cluster-unique name for this process; addressed by ack replies.
    pub server_name: String,
    /// How long a cross-server group command waits for its ack.
    pub ack_timeout: Duration,
}

impl HubManagerConfig {
    pub fn new(hub_name: impl Into<String>) -> Self {
        Self {
            hub_name: hub_name.into(),
            server_name: default_server_name(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Defaults with `BACKPLANE_ACK_TIMEOUT_MS` applied when set.
    pub fn from_env(hub_name: impl Into<String>) -> Self {
        let mut config = Self::new(hub_name);
        if let Some(millis) = read_u64_env("BACKPLANE_ACK_TIMEOUT_MS") {
            config.ack_timeout = Duration::from_millis(millis);
        }
        config
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

// Host label plus a fresh random suffix; unique across restarts so stale
// acks from a previous incarnation never match.
fn default_server_name() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "node".to_string());
    format!("{host}-{}", Uuid::new_v4())
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_names_are_unique() {
        let first = HubManagerConfig::new("hub");
        let second = HubManagerConfig::new("hub");
        assert_ne!(first.server_name, second.server_name);
    }

    #[test]
    fn builder_overrides() {
        let config = HubManagerConfig::new("hub")
            .with_server_name("srv-1")
            .with_ack_timeout(Duration::from_millis(250));
        assert_eq!(config.server_name, "srv-1");
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
    }

    #[test]
    fn default_ack_timeout() {
        assert_eq!(HubManagerConfig::new("hub").ack_timeout, DEFAULT_ACK_TIMEOUT);
    }
}
