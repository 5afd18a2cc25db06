//! Message envelope: discriminant validation and relay-safe forwarding.
//!
//! An [`Envelope`] is the raw text of one inbound message plus its validated
//! `"type"` discriminant. Relay forwarding works on envelopes so a message is
//! passed on without being decoded into (and re-encoded from) its typed form.

use super::message::ProtocolMessage;
use crate::core::config::REQUEST_PREFIX;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Field holding the number of relay hops a forwarded copy has taken.
pub const HOPS_FIELD: &str = "hops";

/// Why an inbound message failed envelope validation.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("message is not a JSON object: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotObject,
    #[error("message lacks a non-empty \"type\" discriminant")]
    MissingType,
}

/// A validated inbound message.
#[derive(Debug, Clone)]
pub struct Envelope {
    kind: Arc<str>,
    hops: u32,
    text: Arc<str>,
}

impl Envelope {
    /// Validate raw wire text: it must be a JSON object with a non-empty
    /// string `"type"` field.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(EnvelopeError::NotObject);
        };
        Self::from_map(&map, Arc::from(text))
    }

    /// Wrap an outgoing typed message.
    pub fn from_message(msg: &ProtocolMessage) -> serde_json::Result<Self> {
        let text = msg.to_json()?;
        Ok(Self {
            kind: Arc::from(msg.kind()),
            hops: 0,
            text: Arc::from(text),
        })
    }

    fn from_map(map: &Map<String, Value>, text: Arc<str>) -> Result<Self, EnvelopeError> {
        let kind = match map.get("type") {
            Some(Value::String(s)) if !s.is_empty() => Arc::from(s.as_str()),
            _ => return Err(EnvelopeError::MissingType),
        };
        let hops = map
            .get(HOPS_FIELD)
            .and_then(Value::as_u64)
            .map(|h| h.min(u32::MAX as u64) as u32)
            .unwrap_or(0);
        Ok(Self { kind, hops, text })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Relay hops this copy has already taken.
    pub fn hops(&self) -> u32 {
        self.hops
    }

    /// Decode into the typed message. Fails on unknown discriminants and on
    /// missing mandatory fields.
    pub fn decode(&self) -> serde_json::Result<ProtocolMessage> {
        serde_json::from_str(&self.text)
    }

    /// File-transfer traffic bypasses the router's control path.
    pub fn is_transfer(&self) -> bool {
        self.kind.starts_with("transfer-")
    }

    /// Privileged guest request that travels towards the host.
    pub fn is_request(&self) -> bool {
        self.kind.starts_with(REQUEST_PREFIX)
    }

    /// Copy for forwarding one hop further. Every other field stays as
    /// received.
    pub fn forwarded(&self) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(&self.text)?;
        let Value::Object(mut map) = value else {
            return Err(EnvelopeError::NotObject);
        };
        map.insert(HOPS_FIELD.to_string(), Value::from(self.hops + 1));
        let text = serde_json::to_string(&map)?;
        Ok(Self {
            kind: self.kind.clone(),
            hops: self.hops + 1,
            text: Arc::from(text),
        })
    }
}

/// Serde adapter carrying raw chunk bytes as standard base64 text.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::message::TransportState;
    use crate::core::storage::SlotKind;

    #[test]
    fn rejects_missing_or_empty_type() {
        assert!(matches!(
            Envelope::parse(r#"{"time":1}"#),
            Err(EnvelopeError::MissingType)
        ));
        assert!(matches!(
            Envelope::parse(r#"{"type":""}"#),
            Err(EnvelopeError::MissingType)
        ));
        assert!(matches!(
            Envelope::parse(r#"{"type":7}"#),
            Err(EnvelopeError::MissingType)
        ));
        assert!(matches!(
            Envelope::parse("[1,2]"),
            Err(EnvelopeError::NotObject)
        ));
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn forwarded_copy_bumps_hops_and_keeps_payload() {
        let env = Envelope::from_message(&ProtocolMessage::SyncBroadcast {
            time: 12.5,
            state: TransportState::Playing,
            sub_index: Some(1),
        })
        .unwrap();
        assert_eq!(env.hops(), 0);

        let fwd = env.forwarded().unwrap().forwarded().unwrap();
        assert_eq!(fwd.hops(), 2);
        assert_eq!(fwd.kind(), "sync-broadcast");
        assert_eq!(fwd.decode().unwrap(), env.decode().unwrap());
    }

    #[test]
    fn classifies_transfer_and_request_kinds() {
        let write = Envelope::from_message(&ProtocolMessage::TransferWrite {
            filename: "a.mp3".into(),
            session_id: 3,
            index: 0,
            bytes: vec![1, 2, 3],
            slot: SlotKind::Preload,
        })
        .unwrap();
        assert!(write.is_transfer());
        assert!(!write.is_request());

        let req = Envelope::parse(r#"{"type":"request-play","from":"g1"}"#).unwrap();
        assert!(req.is_request());
        assert!(!req.is_transfer());
    }

    #[test]
    fn chunk_bytes_survive_base64() {
        let env = Envelope::from_message(&ProtocolMessage::TransferWrite {
            filename: "a.mp3".into(),
            session_id: 3,
            index: 9,
            bytes: vec![0, 255, 16, 32],
            slot: SlotKind::Current,
        })
        .unwrap();
        assert!(env.text().contains("\"bytes\":\"AP8QIA==\""));
        match env.decode().unwrap() {
            ProtocolMessage::TransferWrite { bytes, index, .. } => {
                assert_eq!(index, 9);
                assert_eq!(bytes, vec![0, 255, 16, 32]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
