// Per-send container of protocol-encoded payload versions.
use std::sync::{Arc, Mutex};

use backplane_proto::{HubProtocol, InvocationMessage};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Result, WireError, varint};

/// Holds one hub message together with its encoded form per protocol, so a
/// single send serializes at most once per protocol no matter how many
/// connections or servers it fans out to.
///
/// Built either from a live message (encoding happens on demand) or from
/// wire bytes received from another server (bytes only; requesting a
/// protocol that was not carried fails with
/// [`WireError::ProtocolNotAvailable`]).
#[derive(Debug)]
pub struct PayloadCache {
    message: Option<InvocationMessage>,
    slots: Mutex<Slots>,
}

// Deployments rarely configure more than two protocols; the first two
// versions live inline and the rest spill into a vector.
#[derive(Default, Debug)]
struct Slots {
    first: Option<(String, Bytes)>,
    second: Option<(String, Bytes)>,
    overflow: Vec<(String, Bytes)>,
}

impl Slots {
    fn lookup(&self, name: &str) -> Option<Bytes> {
        // Ordinal comparison on the protocol name.
        if let Some((slot_name, bytes)) = &self.first
            && slot_name == name
        {
            return Some(bytes.clone());
        }
        if let Some((slot_name, bytes)) = &self.second
            && slot_name == name
        {
            return Some(bytes.clone());
        }
        self.overflow
            .iter()
            .find(|(slot_name, _)| slot_name == name)
            .map(|(_, bytes)| bytes.clone())
    }

    // First write wins; a slot is never displaced.
    fn store(&mut self, name: String, bytes: Bytes) -> Bytes {
        if let Some(existing) = self.lookup(&name) {
            return existing;
        }
        let stored = bytes.clone();
        if self.first.is_none() {
            self.first = Some((name, bytes));
        } else if self.second.is_none() {
            self.second = Some((name, bytes));
        } else {
            self.overflow.push((name, bytes));
        }
        stored
    }

    fn entries(&self) -> Vec<(String, Bytes)> {
        let mut entries = Vec::new();
        if let Some(entry) = &self.first {
            entries.push(entry.clone());
        }
        if let Some(entry) = &self.second {
            entries.push(entry.clone());
        }
        entries.extend(self.overflow.iter().cloned());
        entries
    }
}

impl PayloadCache {
    pub fn from_message(message: InvocationMessage) -> Self {
        Self {
            message: Some(message),
            slots: Mutex::new(Slots::default()),
        }
    }

    /// The source message, absent when this cache was decoded off the wire.
    pub fn message(&self) -> Option<&InvocationMessage> {
        self.message.as_ref()
    }

    /// Return the encoded form for `protocol`, encoding and caching it on
    /// first use when a source message is present.
    pub fn encoded_for(&self, protocol: &dyn HubProtocol) -> Result<Bytes> {
        let mut slots = self.slots.lock().expect("cache lock");
        if let Some(bytes) = slots.lookup(protocol.name()) {
            return Ok(bytes);
        }
        let Some(message) = &self.message else {
            return Err(WireError::ProtocolNotAvailable(protocol.name().to_string()));
        };
        let encoded = protocol.encode(message)?;
        Ok(slots.store(protocol.name().to_string(), encoded))
    }

    /// Lookup-only variant for delivery paths that know a protocol name but
    /// hold no encoder for it.
    pub fn encoded_for_name(&self, name: &str) -> Result<Bytes> {
        self.slots
            .lock()
            .expect("cache lock")
            .lookup(name)
            .ok_or_else(|| WireError::ProtocolNotAvailable(name.to_string()))
    }

    pub fn protocol_names(&self) -> Vec<String> {
        self.slots
            .lock()
            .expect("cache lock")
            .entries()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Write the bytes-only form: u8 version count, then per protocol a
    /// length-prefixed name, an i32 LE byte length, and the payload bytes.
    /// Every protocol in `protocols` is encoded first.
    pub fn write_all_versions(
        &self,
        buf: &mut BytesMut,
        protocols: &[Arc<dyn HubProtocol>],
    ) -> Result<()> {
        if protocols.len() > u8::MAX as usize {
            return Err(WireError::TooManyProtocols(protocols.len()));
        }
        buf.put_u8(protocols.len() as u8);
        for protocol in protocols {
            let encoded = self.encoded_for(protocol.as_ref())?;
            varint::put_string(buf, protocol.name());
            buf.put_i32_le(encoded.len() as i32);
            buf.put_slice(&encoded);
        }
        Ok(())
    }

    /// Inverse of [`PayloadCache::write_all_versions`]; the source message is
    /// left absent.
    pub fn read_all_versions(buf: &mut impl Buf) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(WireError::Malformed("missing protocol count"));
        }
        let count = buf.get_u8();
        let mut slots = Slots::default();
        for _ in 0..count {
            let name = varint::get_string(buf)?;
            if buf.remaining() < 4 {
                return Err(WireError::Malformed("truncated payload length"));
            }
            let length = buf.get_i32_le();
            if length < 0 {
                return Err(WireError::Malformed("negative payload length"));
            }
            let length = length as usize;
            if buf.remaining() < length {
                return Err(WireError::Malformed("payload length past end of frame"));
            }
            let payload = buf.copy_to_bytes(length);
            slots.store(name, payload);
        }
        Ok(Self {
            message: None,
            slots: Mutex::new(slots),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backplane_proto::JsonProtocol;
    use serde_json::json;

    fn protocols() -> Vec<Arc<dyn HubProtocol>> {
        vec![Arc::new(JsonProtocol::new())]
    }

    #[test]
    fn encodes_lazily_and_caches() {
        let cache = PayloadCache::from_message(InvocationMessage::new("m", vec![json!(1)]));
        let protocol = JsonProtocol::new();
        let first = cache.encoded_for(&protocol).expect("encode");
        let second = cache.encoded_for(&protocol).expect("cached");
        assert_eq!(first, second);
        assert_eq!(cache.protocol_names(), vec!["json".to_string()]);
    }

    #[test]
    fn bytes_only_cache_rejects_unknown_protocol() {
        let cache = PayloadCache::from_message(InvocationMessage::new("m", vec![]));
        let mut buf = BytesMut::new();
        cache
            .write_all_versions(&mut buf, &protocols())
            .expect("write");
        let decoded = PayloadCache::read_all_versions(&mut buf.freeze()).expect("read");
        assert!(decoded.message().is_none());
        assert!(decoded.encoded_for_name("json").is_ok());
        let err = decoded.encoded_for_name("messagepack").expect_err("unknown");
        assert!(matches!(err, WireError::ProtocolNotAvailable(name) if name == "messagepack"));
    }

    #[test]
    fn all_versions_round_trip() {
        let cache = PayloadCache::from_message(InvocationMessage::new("m", vec![json!("x")]));
        let protocols = protocols();
        let expected = cache.encoded_for(protocols[0].as_ref()).expect("encode");
        let mut buf = BytesMut::new();
        cache
            .write_all_versions(&mut buf, &protocols)
            .expect("write");
        let decoded = PayloadCache::read_all_versions(&mut buf.freeze()).expect("read");
        assert_eq!(decoded.encoded_for_name("json").expect("lookup"), expected);
    }

    #[test]
    fn store_keeps_first_write() {
        let mut slots = Slots::default();
        slots.store("json".to_string(), Bytes::from_static(b"one"));
        let kept = slots.store("json".to_string(), Bytes::from_static(b"two"));
        assert_eq!(kept, Bytes::from_static(b"one"));
        assert_eq!(slots.lookup("json"), Some(Bytes::from_static(b"one")));
    }

    #[test]
    fn overflow_beyond_two_inline_slots() {
        let mut slots = Slots::default();
        for name in ["a", "b", "c", "d"] {
            slots.store(name.to_string(), Bytes::from(name.as_bytes().to_vec()));
        }
        for name in ["a", "b", "c", "d"] {
            assert_eq!(
                slots.lookup(name),
                Some(Bytes::from(name.as_bytes().to_vec())),
                "missing slot {name}"
            );
        }
    }

    #[test]
    fn read_rejects_truncated_payload() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        varint::put_string(&mut buf, "json");
        buf.put_i32_le(100);
        buf.put_slice(b"short");
        let err = PayloadCache::read_all_versions(&mut buf.freeze()).expect_err("truncated");
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[test]
    fn read_rejects_negative_payload_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        varint::put_string(&mut buf, "json");
        buf.put_i32_le(-1);
        let err = PayloadCache::read_all_versions(&mut buf.freeze()).expect_err("negative");
        assert!(matches!(err, WireError::Malformed(_)));
    }
}
