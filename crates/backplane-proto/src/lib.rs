// Hub message model and the pluggable client wire format seam.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("encode failed for protocol {protocol}: {reason}")]
    Encode { protocol: String, reason: String },
    #[error("decode failed for protocol {protocol}: {reason}")]
    Decode { protocol: String, reason: String },
}

/// An application-level RPC carried to clients: a target method name plus a
/// JSON argument array.
///
/// ```
/// use backplane_proto::InvocationMessage;
///
/// let message = InvocationMessage::new("Hello", vec!["World".into()]);
/// assert_eq!(message.target, "Hello");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationMessage {
    pub target: String,
    pub arguments: Vec<serde_json::Value>,
}

impl InvocationMessage {
    pub fn new(target: impl Into<String>, arguments: Vec<serde_json::Value>) -> Self {
        Self {
            target: target.into(),
            arguments,
        }
    }
}

/// Client wire format. Each connected client speaks exactly one protocol;
/// the hub encodes a message once per protocol and reuses the bytes for
/// every client on that protocol.
pub trait HubProtocol: Send + Sync {
    /// Stable protocol name used as the cache key. Compared ordinally.
    fn name(&self) -> &str;

    fn encode(&self, message: &InvocationMessage) -> Result<Bytes>;

    fn decode(&self, payload: &[u8]) -> Result<InvocationMessage>;
}

/// JSON protocol. The default contract emits argument object keys verbatim;
/// [`JsonProtocol::camel_case`] folds the first character of every object key
/// to lowercase, the way camel-case JSON contracts do.
///
/// Both variants share the name `"json"`: the casing is a sender-side
/// contract choice, not a distinct wire format.
#[derive(Debug, Clone, Default)]
pub struct JsonProtocol {
    camel_case_keys: bool,
}

pub const JSON_PROTOCOL_NAME: &str = "json";

impl JsonProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn camel_case() -> Self {
        Self {
            camel_case_keys: true,
        }
    }
}

impl HubProtocol for JsonProtocol {
    fn name(&self) -> &str {
        JSON_PROTOCOL_NAME
    }

    fn encode(&self, message: &InvocationMessage) -> Result<Bytes> {
        let message = if self.camel_case_keys {
            let arguments = message
                .arguments
                .iter()
                .cloned()
                .map(camelize_value)
                .collect();
            InvocationMessage {
                target: message.target.clone(),
                arguments,
            }
        } else {
            message.clone()
        };
        let encoded = serde_json::to_vec(&message).map_err(|err| ProtocolError::Encode {
            protocol: JSON_PROTOCOL_NAME.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, payload: &[u8]) -> Result<InvocationMessage> {
        serde_json::from_slice(payload).map_err(|err| ProtocolError::Decode {
            protocol: JSON_PROTOCOL_NAME.to_string(),
            reason: err.to_string(),
        })
    }
}

// Key folding applies to every object at any depth; array elements recurse.
fn camelize_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(key, value)| (camelize_key(&key), camelize_value(value)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(camelize_value).collect())
        }
        other => other,
    }
}

fn camelize_key(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
