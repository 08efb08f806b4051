//! Shared data model for the evchain ledger and its off-chain replicas.
//!
//! Everything that crosses a wire or a storage boundary lives here: the
//! identity registry types, the scrubbed Windows event model, deterministic
//! event-id derivation, the signed transaction envelope, retention policy
//! types and the per-codespace result codes.

pub mod canonical;
pub mod codes;
pub mod envelope;
pub mod event;
pub mod guid;
pub mod hash;
pub mod identity;
pub mod missing;
pub mod proof;
pub mod requests;
pub mod retention;
pub mod submit;

pub use canonical::{canonical_json, CanonicalJsonError};
pub use envelope::{Payload, SignedPayload, TxBuilder, TxEnvelope, UnsignedPayload};
pub use event::{
    Correlation, EventMetadata, EventPayload, EventWithMetadata, Execution, PayloadField,
    Provider, ScrubbedEvent, StoredEvent, SystemMetadata, TimeCreated,
};
pub use guid::Guid;
pub use hash::{EventId, HashParseError, TxHash};
pub use identity::{IdentityRecord, Principal, PrincipalError, PublicKey, Role};
pub use missing::{BlockRange, MissingEvent};
pub use proof::{
    verify_membership, verify_non_membership, AbsenceProof, ExistenceProof, ProofError,
    ProofNode, TreeProof,
};
pub use requests::{
    CreateRequest, CreateResponse, EventCountResponse, RegisterRequest, SeedRequest,
    SetPolicyRequest, SetPolicyResponse,
};
pub use retention::{
    MatchRule, PolicyAction, PolicyType, RetentionFilter, RetentionPolicy, RetentionPolicyError,
    RuleGroup, StoredPolicy,
};
pub use submit::{GetEventResponse, SubmitRequest};
