//! Wire framing for messages exchanged between agents and the hub.
//!
//! The encoding is a self-describing MessagePack map rather than the embedded
//! CRDT engine's own internal `postcard` framing: unknown keys have to be
//! ignorable for forward compatibility, which a non-self-describing format
//! can't give us without a version negotiation dance.

use rmpv::Value;

use crate::error::{PlutusError, PlutusResult};

/// The kind of message carried by an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A batch of CRDT updates (an exported update blob from the replica).
    CrdtUpdate = 1,
    /// A liveness ping from a connected peer.
    Heartbeat = 2,
    /// Announces a peer joining the swarm.
    Join = 3,
    /// Announces a peer leaving the swarm.
    Leave = 4,
    /// Requests a full snapshot from the hub or a peer.
    SnapshotRequest = 5,
    /// Carries a full snapshot in response to a [`MessageKind::SnapshotRequest`].
    SnapshotResponse = 6,
}

impl MessageKind {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(MessageKind::CrdtUpdate),
            2 => Some(MessageKind::Heartbeat),
            3 => Some(MessageKind::Join),
            4 => Some(MessageKind::Leave),
            5 => Some(MessageKind::SnapshotRequest),
            6 => Some(MessageKind::SnapshotResponse),
            _ => None,
        }
    }
}

/// The current envelope wire version. Bump on any breaking field change.
pub const WIRE_VERSION: i64 = 1;

/// A framed message on the wire between an agent's transport and the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Wire protocol version; must be positive.
    pub version: i64,
    /// What kind of message this is.
    pub kind: MessageKind,
    /// The peer id that produced this message.
    pub sender: u64,
    /// The intended recipient, or `None` to mean "broadcast to everyone else".
    pub recipient: Option<u64>,
    /// Opaque message body (e.g. an exported CRDT update blob).
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build a new envelope at the current wire version.
    pub fn new(kind: MessageKind, sender: u64, recipient: Option<u64>, payload: Vec<u8>) -> Self {
        Envelope {
            version: WIRE_VERSION,
            kind,
            sender,
            recipient,
            payload,
        }
    }

    /// Encode into a self-describing MessagePack map.
    ///
    /// Field keys are single letters to keep the frame small: `v` (version),
    /// `t` (type), `s` (sender), `r` (recipient), `p` (payload).
    pub fn encode(&self) -> Vec<u8> {
        let recipient = match self.recipient {
            Some(id) => Value::from(id),
            None => Value::Nil,
        };
        let value = Value::Map(vec![
            (Value::from("v"), Value::from(self.version)),
            (Value::from("t"), Value::from(self.kind as i64)),
            (Value::from("s"), Value::from(self.sender)),
            (Value::from("r"), recipient),
            (Value::from("p"), Value::from(self.payload.clone())),
        ]);

        let mut buf = Vec::new();
        // Infallible: `buf` is an in-memory `Vec<u8>` writer.
        rmpv::encode::write_value(&mut buf, &value).expect("encoding an envelope cannot fail");
        buf
    }

    /// Decode a MessagePack map back into an [`Envelope`].
    ///
    /// Rejects, with a [`PlutusError::Decode`], any input that is not
    /// parseable, is missing a required field, has a field of the wrong
    /// shape, carries a non-positive version, or carries an unknown message
    /// kind. Map keys other than `v`/`t`/`s`/`r`/`p` are ignored.
    pub fn decode(bytes: &[u8]) -> PlutusResult<Self> {
        let mut cursor = bytes;
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| PlutusError::Decode(format!("malformed msgpack: {e}")))?;

        let entries = match value {
            Value::Map(entries) => entries,
            _ => return Err(PlutusError::Decode("envelope is not a map".to_string())),
        };

        let mut version = None;
        let mut kind_raw = None;
        let mut sender = None;
        let mut recipient = None;
        let mut recipient_seen = false;
        let mut payload = None;

        for (key, val) in entries {
            let Some(key) = key.as_str() else { continue };
            match key {
                "v" => version = val.as_i64(),
                "t" => kind_raw = val.as_u64(),
                "s" => sender = val.as_u64(),
                "r" => {
                    recipient_seen = true;
                    recipient = if val.is_nil() { Some(None) } else { val.as_u64().map(Some) };
                }
                "p" => payload = val.as_slice().map(|s| s.to_vec()),
                _ => {}
            }
        }

        let version = version.ok_or_else(|| PlutusError::Decode("missing field: v".to_string()))?;
        if version <= 0 {
            return Err(PlutusError::Decode(format!("non-positive version: {version}")));
        }

        let kind_raw = kind_raw.ok_or_else(|| PlutusError::Decode("missing field: t".to_string()))?;
        let kind_raw: u8 = kind_raw
            .try_into()
            .map_err(|_| PlutusError::Decode(format!("message kind out of range: {kind_raw}")))?;
        let kind = MessageKind::from_u8(kind_raw)
            .ok_or_else(|| PlutusError::Decode(format!("unknown message kind: {kind_raw}")))?;

        let sender = sender.ok_or_else(|| PlutusError::Decode("missing field: s".to_string()))?;

        if !recipient_seen {
            return Err(PlutusError::Decode("missing field: r".to_string()));
        }
        let recipient = recipient.ok_or_else(|| PlutusError::Decode("recipient is not null or an integer".to_string()))?;

        let payload = payload.ok_or_else(|| PlutusError::Decode("payload is not bytes".to_string()))?;

        Ok(Envelope {
            version,
            kind,
            sender,
            recipient,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(MessageKind::CrdtUpdate, 42, Some(7), vec![1, 2, 3])
    }

    #[test]
    fn round_trips() {
        let original = sample();
        let decoded = Envelope::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn round_trips_broadcast_recipient() {
        let original = Envelope::new(MessageKind::Heartbeat, 1, None, vec![]);
        let decoded = Envelope::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn rejects_garbage_bytes() {
        let err = Envelope::decode(&[0xc1]).unwrap_err();
        assert!(matches!(err, PlutusError::Decode(_)));
    }

    #[test]
    fn rejects_non_map_top_level() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::from(5)).unwrap();
        assert!(Envelope::decode(&buf).is_err());
    }

    #[test]
    fn rejects_missing_required_field() {
        let value = Value::Map(vec![
            (Value::from("v"), Value::from(1)),
            (Value::from("t"), Value::from(1)),
            (Value::from("s"), Value::from(1)),
            // "r" missing entirely
            (Value::from("p"), Value::from(Vec::<u8>::new())),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        assert!(Envelope::decode(&buf).is_err());
    }

    #[test]
    fn rejects_non_integer_sender() {
        let value = Value::Map(vec![
            (Value::from("v"), Value::from(1)),
            (Value::from("t"), Value::from(1)),
            (Value::from("s"), Value::from("not-a-number")),
            (Value::from("r"), Value::Nil),
            (Value::from("p"), Value::from(Vec::<u8>::new())),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        assert!(Envelope::decode(&buf).is_err());
    }

    #[test]
    fn rejects_non_null_non_integer_recipient() {
        let value = Value::Map(vec![
            (Value::from("v"), Value::from(1)),
            (Value::from("t"), Value::from(1)),
            (Value::from("s"), Value::from(1)),
            (Value::from("r"), Value::from("bob")),
            (Value::from("p"), Value::from(Vec::<u8>::new())),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        assert!(Envelope::decode(&buf).is_err());
    }

    #[test]
    fn rejects_non_bytes_payload() {
        let value = Value::Map(vec![
            (Value::from("v"), Value::from(1)),
            (Value::from("t"), Value::from(1)),
            (Value::from("s"), Value::from(1)),
            (Value::from("r"), Value::Nil),
            (Value::from("p"), Value::from("not bytes")),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        assert!(Envelope::decode(&buf).is_err());
    }

    #[test]
    fn rejects_non_positive_version() {
        let value = Value::Map(vec![
            (Value::from("v"), Value::from(0)),
            (Value::from("t"), Value::from(1)),
            (Value::from("s"), Value::from(1)),
            (Value::from("r"), Value::Nil),
            (Value::from("p"), Value::from(Vec::<u8>::new())),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        assert!(Envelope::decode(&buf).is_err());
    }

    #[test]
    fn rejects_unknown_message_kind() {
        let value = Value::Map(vec![
            (Value::from("v"), Value::from(1)),
            (Value::from("t"), Value::from(99)),
            (Value::from("s"), Value::from(1)),
            (Value::from("r"), Value::Nil),
            (Value::from("p"), Value::from(Vec::<u8>::new())),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        assert!(Envelope::decode(&buf).is_err());
    }

    #[test]
    fn ignores_unknown_fields() {
        let value = Value::Map(vec![
            (Value::from("v"), Value::from(1)),
            (Value::from("t"), Value::from(1)),
            (Value::from("s"), Value::from(1)),
            (Value::from("r"), Value::Nil),
            (Value::from("p"), Value::from(Vec::<u8>::new())),
            (Value::from("future_field"), Value::from("ignored")),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        let decoded = Envelope::decode(&buf).unwrap();
        assert_eq!(decoded.sender, 1);
    }
}
