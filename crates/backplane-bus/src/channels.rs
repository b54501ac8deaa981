// Deterministic channel names for the hub's address spaces.

/// Maps a hub name and an address to the bus channel carrying it.
///
/// Every channel is prefixed with the hub name so multiple hubs can share
/// one fabric. Identifiers are used verbatim (case preserved, no escaping);
/// embedded `:` is fine because the fabric compares whole channel strings.
///
/// ```
/// use backplane_bus::Channels;
///
/// let channels = Channels::new("chat");
/// assert_eq!(channels.all(), "chat:all");
/// assert_eq!(channels.connection("abc"), "chat:c:abc");
/// ```
#[derive(Debug, Clone)]
pub struct Channels {
    prefix: String,
}

impl Channels {
    pub fn new(hub_name: impl Into<String>) -> Self {
        Self {
            prefix: hub_name.into(),
        }
    }

    pub fn all(&self) -> String {
        format!("{}:all", self.prefix)
    }

    pub fn connection(&self, connection_id: &str) -> String {
        format!("{}:c:{}", self.prefix, connection_id)
    }

    pub fn user(&self, user_id: &str) -> String {
        format!("{}:u:{}", self.prefix, user_id)
    }

    pub fn group(&self, group_name: &str) -> String {
        format!("{}:g:{}", self.prefix, group_name)
    }

    pub fn group_management(&self) -> String {
        format!("{}:gm", self.prefix)
    }

    pub fn ack(&self, server_name: &str) -> String {
        format!("{}:ack:{}", self.prefix, server_name)
    }
}
