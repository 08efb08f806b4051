//! Off-chain replica machinery.
//!
//! Keeps a durable record of what the chain has admitted versus what this
//! replica holds, and closes the gap: the harmoniser loops discover missing
//! blocks and events and drive backfill over the gossip transport, while
//! the retention agent deletes payloads that fall outside the committed
//! policy.

pub mod handlers;
pub mod harmoniser;
pub mod payload;
pub mod repository;
pub mod retention;
pub mod state;
pub mod submit;
pub mod transport;

pub use handlers::ReplicaProcessor;
pub use harmoniser::{gap_range, BackfillConfig, Harmoniser};
pub use payload::{
    encode_payload, spawn_payload_worker, BackfillEventData, EventBackfillResponse, EventRequest,
    GossipPayload, PayloadProcessor, TYPE_BACKFILL_RESPONSE, TYPE_BROADCAST_EVENT,
    TYPE_REQUEST_EVENT,
};
pub use repository::{EventRepository, MemoryEventRepository, RepositoryError};
pub use retention::{RetentionAgent, RetentionAgentConfig};
pub use state::{
    ReplicaStateStore, StateKey, StateStoreError, TrackedBlockRange, TrackedMissingEvent,
};
pub use submit::{SubmitError, SubmitPipeline};
pub use transport::{EventTransport, TransportError};
