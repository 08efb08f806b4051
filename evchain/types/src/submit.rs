use serde::{Deserialize, Serialize};

use crate::event::{EventPayload, StoredEvent};
use crate::hash::{EventId, TxHash};

/// An off-chain payload submission: sent by agents over HTTP and re-broadcast
/// between replicas as a gossip `BroadcastEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub event_id: EventId,
    /// Hash of the chain transaction that admitted the event.
    pub tx_hash: TxHash,
    /// The off-chain payload to store.
    pub event_data: EventPayload,
    /// Principal that generated the event and is submitting this request.
    pub principal: String,
    /// Hex-encoded Ed25519 signature over the payload hash.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetEventResponse {
    pub event: StoredEvent,
}
