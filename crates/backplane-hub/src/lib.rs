// Distributed hub coordination: connection and group registries, the
// cross-server ack coordinator, and the fan-out facade.
mod ack;
mod config;
mod connection;
mod groups;
mod manager;
mod registry;

pub use config::HubManagerConfig;
pub use connection::ClientConnection;
pub use manager::HubManager;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("group command {id} timed out waiting for ack")]
    AckTimeout { id: u32 },
    #[error("hub manager is shut down")]
    ManagerShutdown,
    #[error(transparent)]
    Bus(#[from] backplane_bus::BusError),
    #[error(transparent)]
    Wire(#[from] backplane_wire::WireError),
}
