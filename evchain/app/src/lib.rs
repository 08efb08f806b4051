//! The evchain replicated state machine.
//!
//! Three sub-applications share one block lifecycle behind a multiplexer:
//! an identity registry, an append-only event ledger and a set-once
//! retention policy. Each sub-app keeps its own authenticated data
//! structure; the multiplexer folds their roots into a single app hash and
//! drives the two-phase finalize/commit protocol on behalf of the consensus
//! engine.

pub mod events;
pub mod identity;
pub mod multiplexer;
pub mod protocol;
pub mod retention;
pub mod storage;
pub mod tree;

pub use events::{EventsApp, EventsRepository, ProvenEvent};
pub use identity::{IdentityApp, IdentityRepository, ProvenIdentity};
pub use multiplexer::{parse_validator_tx, CommitError, Multiplexer};
pub use protocol::{
    AppFinalizeOutcome, BlockContext, CheckTxResponse, CommitFn, ErrorResponse, EventAttribute,
    ExecTxResult, FinalizeBlockRequest, FinalizeBlockResponse, InfoResponse, Misbehavior,
    MisbehaviorKind, QueryRequest, QueryResponse, SubApp, TypedEvent, ValidatorUpdate,
};
pub use retention::RetentionPolicyApp;
pub use storage::{LedgerDb, StorageError};
pub use evchain_types::proof::{
    verify_membership, verify_non_membership, AbsenceProof, ExistenceProof, ProofNode, TreeProof,
};
pub use tree::{TreeError, VersionedTree};
