use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tree::TreeProof;

/// Consensus-supplied block facts handed to sub-apps during finalization.
/// Both fields are deterministic across replicas.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub height: i64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
    pub index: bool,
}

impl EventAttribute {
    pub fn indexed(key: impl Into<String>, value: impl Into<String>) -> Self {
        EventAttribute {
            key: key.into(),
            value: value.into(),
            index: true,
        }
    }
}

/// Typed event attached to a transaction result, visible to chain
/// subscribers without fetching the tx body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: Vec<EventAttribute>,
}

impl TypedEvent {
    pub fn new(kind: impl Into<String>, attributes: Vec<EventAttribute>) -> Self {
        TypedEvent {
            kind: kind.into(),
            attributes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecTxResult {
    pub code: u32,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
    pub log: String,
    pub events: Vec<TypedEvent>,
    pub codespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTxResponse {
    pub code: u32,
    pub log: String,
    pub codespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub path: String,
    pub height: i64,
    pub prove: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub code: u32,
    pub log: String,
    pub index: i64,
    #[serde(with = "hex")]
    pub key: Vec<u8>,
    #[serde(with = "hex")]
    pub value: Vec<u8>,
    pub proof: Option<TreeProof>,
    pub height: i64,
    pub codespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub data: serde_json::Value,
    pub app_version: u64,
    pub last_block_height: i64,
    #[serde(with = "hex")]
    pub last_block_app_hash: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisbehaviorKind {
    DuplicateVote,
    LightClientAttack,
}

/// Evidence forwarded by the consensus engine at block finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Misbehavior {
    pub kind: MisbehaviorKind,
    #[serde(with = "hex")]
    pub validator_address: Vec<u8>,
    pub power: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    pub key_type: String,
    #[serde(with = "hex")]
    pub pub_key: Vec<u8>,
    pub power: i64,
}

#[derive(Debug)]
pub struct FinalizeBlockRequest {
    pub height: i64,
    pub time: DateTime<Utc>,
    pub txs: Vec<Vec<u8>>,
    pub misbehavior: Vec<Misbehavior>,
}

#[derive(Debug)]
pub struct FinalizeBlockResponse {
    pub tx_results: Vec<ExecTxResult>,
    pub validator_updates: Vec<ValidatorUpdate>,
    pub app_hash: Vec<u8>,
}

/// Deferred write staged by a sub-app during finalization and applied at
/// commit, in block order. A failing closure is fatal to the node.
pub type CommitFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A sub-app's verdict on one transaction: the result surfaced to the
/// consensus engine, the sub-app root reflecting the staged change, and the
/// commit closure that makes it durable.
pub struct AppFinalizeOutcome {
    pub tx_result: ExecTxResult,
    pub app_hash: Vec<u8>,
    pub commit: Option<CommitFn>,
}

/// Capability set every sub-application exposes to the multiplexer.
pub trait SubApp: Send {
    fn name(&self) -> &'static str;

    fn info(&self) -> serde_json::Value;

    /// Returns the sub-app's initial root hash.
    fn init_chain(&mut self) -> Vec<u8>;

    /// Admission check. Cheap validation only; must not mutate state.
    fn check_tx(&self, data: &str) -> CheckTxResponse;

    fn finalize_block(&mut self, block: &BlockContext, data: &str) -> AppFinalizeOutcome;

    fn query(&self, request: &QueryRequest) -> QueryResponse;
}

/// Uniform error result carrying a (codespace, code) pair, convertible into
/// each response shape. Deterministic failures inside the block lifecycle
/// are always returned this way, never panicked.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub code: u32,
    pub codespace: &'static str,
    pub log: String,
}

impl ErrorResponse {
    pub fn new(code: u32, codespace: &'static str, log: impl Into<String>) -> Self {
        ErrorResponse {
            code,
            codespace,
            log: log.into(),
        }
    }

    pub fn into_check_tx(self) -> CheckTxResponse {
        CheckTxResponse {
            code: self.code,
            log: self.log,
            codespace: self.codespace.to_string(),
        }
    }

    /// A rejected transaction stages nothing: the outcome carries an empty
    /// root so the multiplexer keeps the sub-app's previous hash.
    pub fn into_finalize(self) -> AppFinalizeOutcome {
        AppFinalizeOutcome {
            tx_result: ExecTxResult {
                code: self.code,
                log: self.log,
                codespace: self.codespace.to_string(),
                ..ExecTxResult::default()
            },
            app_hash: Vec::new(),
            commit: None,
        }
    }

    pub fn into_query(self, height: i64) -> QueryResponse {
        QueryResponse {
            code: self.code,
            log: self.log,
            codespace: self.codespace.to_string(),
            height,
            ..QueryResponse::default()
        }
    }
}
