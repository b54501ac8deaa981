// Wire format for inter-server hub traffic: varint primitives, the
// multi-protocol payload cache, and the three framed message kinds.
mod cache;
mod frames;
mod varint;

pub use cache::PayloadCache;
pub use frames::{AckFrame, GroupAction, GroupCommandFrame, InvocationFrame};
pub use varint::{get_string, get_varint, put_string, put_varint};

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("no encoded payload for protocol {0}")]
    ProtocolNotAvailable(String),
    #[error("too many protocols: {0} (max 255)")]
    TooManyProtocols(usize),
    #[error(transparent)]
    Protocol(#[from] backplane_proto::ProtocolError),
}
