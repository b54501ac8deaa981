// Stateless encoders/decoders for the three inter-server message kinds.
use std::sync::Arc;

use backplane_proto::HubProtocol;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{PayloadCache, Result, WireError, varint};

/// Fan-out frame carried on the all/connection/user/group channels:
/// an excluded-connection list followed by the bytes-only payload cache.
pub struct InvocationFrame {
    pub excluded: Vec<String>,
    pub cache: PayloadCache,
}

impl InvocationFrame {
    pub fn new(cache: PayloadCache, excluded: Vec<String>) -> Self {
        Self { excluded, cache }
    }

    /// Encode, pre-serializing the payload for every protocol in
    /// `protocols` so receivers never re-encode.
    pub fn encode(&self, protocols: &[Arc<dyn HubProtocol>]) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        varint::put_varint(&mut buf, self.excluded.len() as u32);
        for id in &self.excluded {
            varint::put_string(&mut buf, id);
        }
        self.cache.write_all_versions(&mut buf, protocols)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let count = varint::get_varint(&mut buf)? as usize;
        let mut excluded = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            excluded.push(varint::get_string(&mut buf)?);
        }
        let cache = PayloadCache::read_all_versions(&mut buf)?;
        // Trailing bytes are reserved for forward compatibility.
        Ok(Self { excluded, cache })
    }

    pub fn excludes(&self, connection_id: &str) -> bool {
        self.excluded.iter().any(|id| id == connection_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Add = 0,
    Remove = 1,
}

impl GroupAction {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Add),
            1 => Some(Self::Remove),
            _ => None,
        }
    }
}

/// Cross-server membership command carried on the group-management channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCommandFrame {
    /// Originating server's monotonically increasing command counter.
    pub id: u32,
    pub server: String,
    pub action: GroupAction,
    pub group: String,
    pub connection: String,
}

impl GroupCommandFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        varint::put_varint(&mut buf, self.id);
        varint::put_string(&mut buf, &self.server);
        buf.put_u8(self.action as u8);
        varint::put_string(&mut buf, &self.group);
        varint::put_string(&mut buf, &self.connection);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let id = varint::get_varint(&mut buf)?;
        let server = varint::get_string(&mut buf)?;
        if !buf.has_remaining() {
            return Err(WireError::Malformed("missing group action"));
        }
        let action = GroupAction::from_u8(buf.get_u8())
            .ok_or(WireError::Malformed("unknown group action"))?;
        let group = varint::get_string(&mut buf)?;
        let connection = varint::get_string(&mut buf)?;
        Ok(Self {
            id,
            server,
            action,
            group,
            connection,
        })
    }
}

/// Confirmation for a processed group command, carried on the originating
/// server's ack channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub id: u32,
}

impl AckFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        varint::put_varint(&mut buf, self.id);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let id = varint::get_varint(&mut buf)?;
        Ok(Self { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backplane_proto::{InvocationMessage, JsonProtocol};
    use serde_json::json;

    fn protocols() -> Vec<Arc<dyn HubProtocol>> {
        vec![Arc::new(JsonProtocol::new())]
    }

    fn invocation_round_trip(excluded_count: usize) {
        let excluded: Vec<String> = (0..excluded_count).map(|i| format!("conn-{i}")).collect();
        let cache = PayloadCache::from_message(InvocationMessage::new("m", vec![json!(1)]));
        let frame = InvocationFrame::new(cache, excluded.clone());
        let encoded = frame.encode(&protocols()).expect("encode");
        let decoded = InvocationFrame::decode(encoded).expect("decode");
        assert_eq!(decoded.excluded, excluded);
        assert!(decoded.cache.encoded_for_name("json").is_ok());
        assert!(decoded.cache.message().is_none());
    }

    #[test]
    fn invocation_round_trip_boundary_sizes() {
        invocation_round_trip(0);
        invocation_round_trip(1);
        invocation_round_trip(255);
        invocation_round_trip(65_535);
    }

    #[test]
    fn invocation_exclusion_lookup() {
        let cache = PayloadCache::from_message(InvocationMessage::new("m", vec![]));
        let frame = InvocationFrame::new(cache, vec!["a".into(), "b".into()]);
        assert!(frame.excludes("a"));
        assert!(!frame.excludes("c"));
    }

    #[test]
    fn invocation_ignores_trailing_bytes() {
        let cache = PayloadCache::from_message(InvocationMessage::new("m", vec![]));
        let frame = InvocationFrame::new(cache, vec![]);
        let mut encoded = BytesMut::from(frame.encode(&protocols()).expect("encode").as_ref());
        encoded.put_slice(b"future-extension");
        let decoded = InvocationFrame::decode(encoded.freeze()).expect("decode");
        assert!(decoded.excluded.is_empty());
    }

    #[test]
    fn group_command_round_trip() {
        for (id, action) in [(0, GroupAction::Add), (u32::MAX, GroupAction::Remove)] {
            let frame = GroupCommandFrame {
                id,
                server: "server-a".into(),
                action,
                group: "room:1".into(),
                connection: "conn-1".into(),
            };
            let decoded = GroupCommandFrame::decode(frame.encode()).expect("decode");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn group_command_rejects_unknown_action() {
        let frame = GroupCommandFrame {
            id: 1,
            server: "s".into(),
            action: GroupAction::Add,
            group: "g".into(),
            connection: "c".into(),
        };
        let mut raw = BytesMut::from(frame.encode().as_ref());
        // The action byte sits right after the id varint and server string.
        let action_index = 1 + 1 + 1;
        raw[action_index] = 7;
        let err = GroupCommandFrame::decode(raw.freeze()).expect_err("bad action");
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[test]
    fn ack_round_trip() {
        for id in [0, 127, 128, 16_383, 16_384, u32::MAX] {
            let decoded = AckFrame::decode(AckFrame { id }.encode()).expect("decode");
            assert_eq!(decoded.id, id);
        }
    }

    #[test]
    fn ack_rejects_empty_frame() {
        let err = AckFrame::decode(Bytes::new()).expect_err("empty");
        assert!(matches!(err, WireError::Malformed(_)));
    }
}
