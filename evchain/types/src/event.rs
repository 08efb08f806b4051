use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical::{canonical_json, CanonicalJsonError};
use crate::guid::Guid;
use crate::hash::{EventId, TxHash};
use crate::identity::Principal;

/// Source provider of a Windows event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub name: Option<String>,
    pub guid: Option<Guid>,
    pub event_source_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeCreated {
    pub system_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub activity_id: Option<Guid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub process_id: Option<u32>,
    pub thread_id: Option<u32>,
}

/// The `<System>` block of a Windows event record: everything that is safe
/// to keep on-chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMetadata {
    pub provider: Provider,
    pub event_id: u32,
    pub time_created: TimeCreated,
    pub event_record_id: u64,
    pub correlation: Correlation,
    pub execution: Execution,
    pub channel: String,
    pub computer: String,
}

/// The on-chain face of an event: system metadata plus the lowercase-hex
/// SHA-256 of the off-chain payload bytes. No payload content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubbedEvent {
    pub system: SystemMetadata,
    pub off_chain_hash: String,
}

/// One name/value pair of the off-chain `<EventData>` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadField {
    pub name: Option<String>,
    pub value: Option<String>,
}

/// Ordered list of payload fields. Order is preserved; the hash is computed
/// over the canonical JSON serialisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPayload(pub Vec<PayloadField>);

impl EventPayload {
    pub fn hash(&self) -> Result<[u8; 32], CanonicalJsonError> {
        let bytes = canonical_json(self)?;
        Ok(Sha256::digest(&bytes).into())
    }

    pub fn hash_hex(&self) -> Result<String, CanonicalJsonError> {
        Ok(hex::encode(self.hash()?))
    }
}

/// Ledger-assigned metadata, produced at block finalization. `received_time`
/// is the consensus block time, never a local clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: EventId,
    pub received_time: DateTime<Utc>,
    pub principal: Principal,
}

/// The on-chain event record: scrubbed event plus ledger metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWithMetadata {
    pub event: ScrubbedEvent,
    pub metadata: EventMetadata,
}

/// A fully reconciled off-chain record: on-chain metadata joined with the
/// payload and the transaction that admitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: ScrubbedEvent,
    pub payload: EventPayload,
    pub metadata: EventMetadata,
    pub tx_hash: TxHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_hash_is_order_sensitive() {
        let a = EventPayload(vec![
            PayloadField {
                name: Some("SubjectUserName".into()),
                value: Some("user".into()),
            },
            PayloadField {
                name: Some("SubjectDomainName".into()),
                value: Some("laptop".into()),
            },
        ]);
        let mut reversed = a.clone();
        reversed.0.reverse();
        assert_ne!(a.hash().unwrap(), reversed.hash().unwrap());
        assert_eq!(a.hash().unwrap(), a.clone().hash().unwrap());
    }
}
