use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::canonical::{canonical_json, CanonicalJsonError};
use crate::event::ScrubbedEvent;
use crate::identity::Principal;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HashParseError {
    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl Eq for HashParseError {}

/// Deterministic identifier of a ledger event: the SHA-256 over the block
/// height (LE64), the submitting principal and the canonical-JSON scrubbed
/// event. Hex encoded in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId([u8; 32]);

impl EventId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        EventId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashParseError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| HashParseError::Length(bytes.len()))?;
        Ok(EventId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derives the event id for a scrubbed event finalized at `block_height`
    /// by `principal`. Equal inputs yield equal ids on every replica.
    pub fn derive(
        block_height: u64,
        principal: &Principal,
        event: &ScrubbedEvent,
    ) -> Result<Self, CanonicalJsonError> {
        let mut digest = Sha256::new();
        digest.update(block_height.to_le_bytes());
        digest.update(principal.as_bytes());
        digest.update(canonical_json(event)?);
        Ok(EventId(digest.finalize().into()))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for EventId {
    type Err = HashParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value)?;
        EventId::from_slice(&bytes)
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash of the chain transaction that carried an event create. Opaque bytes,
/// hex encoded in transit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxHash(Vec<u8>);

impl TxHash {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        TxHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for TxHash {
    type Err = hex::FromHexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(TxHash(hex::decode(value)?))
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_hex_round_trip() {
        let id = EventId::from_bytes([0xab; 32]);
        let encoded = serde_json::to_string(&id).unwrap();
        assert_eq!(encoded, format!("\"{}\"", "ab".repeat(32)));
        let decoded: EventId = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            "abcd".parse::<EventId>(),
            Err(HashParseError::Length(2))
        ));
    }
}
