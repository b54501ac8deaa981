// Seam to the external transport that owns client connections.
use async_trait::async_trait;
use backplane_proto::InvocationMessage;
use bytes::Bytes;

/// A locally terminated client connection, owned by the transport layer and
/// held by the hub only while registered.
///
/// The handle serializes its own writes; the hub never orders writes across
/// different connections.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Cluster-unique sticky identifier for this connection.
    fn connection_id(&self) -> &str;

    /// Application-supplied user identity, when authenticated.
    fn user_id(&self) -> Option<&str>;

    /// Name of the wire protocol this client negotiated.
    fn protocol(&self) -> &str;

    /// Write a message, letting the transport encode it for this client.
    async fn write_message(&self, message: &InvocationMessage) -> anyhow::Result<()>;

    /// Write an already-encoded payload in this client's protocol.
    async fn write_payload(&self, payload: Bytes) -> anyhow::Result<()>;
}
