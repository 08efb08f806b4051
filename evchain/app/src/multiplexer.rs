use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use evchain_types::codes::multiplex as codes;
use evchain_types::TxEnvelope;

use crate::protocol::{
    BlockContext, CheckTxResponse, CommitFn, ErrorResponse, ExecTxResult, FinalizeBlockRequest,
    FinalizeBlockResponse, InfoResponse, Misbehavior, MisbehaviorKind, QueryRequest,
    QueryResponse, SubApp, ValidatorUpdate,
};
use crate::storage::{LedgerDb, StorageError, CF_MUXER};

pub const APP_VERSION: u64 = 1;

const VALIDATOR_PREFIX: &str = "val:";
const STATE_KEY: &[u8] = b"muxer_state";

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit closure failed: {0}")]
    Closure(anyhow::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
#[error("invalid validator tx: {0}")]
pub struct ValidatorTxError(String);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MuxerState {
    height: i64,
    /// Sub-app roots keyed by app name. Kept sorted so the composite hash
    /// is stable under registration order.
    app_hashes: BTreeMap<String, String>,
}

impl MuxerState {
    /// Composite app hash: SHA-256 over the concatenation of sub-app roots
    /// in app-name order.
    fn composite_hash(&self) -> Vec<u8> {
        let mut digest = Sha256::new();
        for encoded in self.app_hashes.values() {
            if let Ok(bytes) = hex::decode(encoded) {
                digest.update(&bytes);
            }
        }
        digest.finalize().to_vec()
    }
}

/// Routes block transactions to sub-apps, combines their roots into one app
/// hash and drives the finalize/commit two-phase protocol.
pub struct Multiplexer {
    db: LedgerDb,
    apps: BTreeMap<String, Box<dyn SubApp>>,
    state: MuxerState,
    commit_queue: Vec<CommitFn>,
    /// Known validators by hex address, for resolving misbehaviour evidence.
    validators: HashMap<String, ValidatorUpdate>,
    /// Blocks to retain after commit; zero keeps everything.
    pub retain_blocks: i64,
}

impl Multiplexer {
    pub fn new(db: LedgerDb, apps: Vec<Box<dyn SubApp>>) -> Result<Self, StorageError> {
        let state = match db.get(CF_MUXER, STATE_KEY)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => MuxerState::default(),
        };

        let apps = apps
            .into_iter()
            .map(|app| (app.name().to_string(), app))
            .collect();

        Ok(Multiplexer {
            db,
            apps,
            state,
            commit_queue: Vec::new(),
            validators: HashMap::new(),
            retain_blocks: 0,
        })
    }

    pub fn height(&self) -> i64 {
        self.state.height
    }

    pub fn app_hash(&self) -> Vec<u8> {
        self.state.composite_hash()
    }

    pub fn info(&self) -> InfoResponse {
        let data = self
            .apps
            .values()
            .map(|app| (app.name().to_string(), app.info()))
            .collect::<serde_json::Map<String, serde_json::Value>>();

        InfoResponse {
            data: serde_json::Value::Object(data),
            app_version: APP_VERSION,
            last_block_height: self.state.height,
            last_block_app_hash: self.state.composite_hash(),
        }
    }

    pub fn init_chain(&mut self) -> Vec<u8> {
        let mut hashes = BTreeMap::new();
        for (name, app) in self.apps.iter_mut() {
            hashes.insert(name.clone(), hex::encode(app.init_chain()));
        }
        self.state.app_hashes = hashes;
        self.state.composite_hash()
    }

    pub fn check_tx(&self, tx: &[u8]) -> CheckTxResponse {
        if let Some(raw) = as_validator_tx(tx) {
            return match parse_validator_tx(raw) {
                Ok(_) => CheckTxResponse {
                    code: codes::CODE_OK,
                    ..CheckTxResponse::default()
                },
                Err(err) => {
                    warn!(%err, "rejected validator tx");
                    ErrorResponse::new(
                        codes::CODE_INVALID_VALIDATOR_TX,
                        codes::CODESPACE,
                        "error parsing validator tx",
                    )
                    .into_check_tx()
                }
            };
        }

        let envelope: TxEnvelope = match serde_json::from_slice(tx) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(?err, "failed to decode tx envelope");
                return ErrorResponse::new(
                    codes::CODE_ENCODING_ERROR,
                    codes::CODESPACE,
                    "error decoding request",
                )
                .into_check_tx();
            }
        };

        match self.apps.get(&envelope.app) {
            Some(app) => app.check_tx(envelope.data.get()),
            None => {
                warn!(app = %envelope.app, "tx targets unknown app");
                ErrorResponse::new(codes::CODE_UNKNOWN_APP, codes::CODESPACE, "unknown app name")
                    .into_check_tx()
            }
        }
    }

    pub fn finalize_block(&mut self, request: FinalizeBlockRequest) -> FinalizeBlockResponse {
        self.commit_queue = Vec::with_capacity(request.txs.len());
        let block = BlockContext {
            height: request.height,
            time: request.time,
        };

        let mut validator_updates = self.punish_misbehavior(&request.misbehavior);

        let mut tx_results = Vec::with_capacity(request.txs.len());
        for tx in &request.txs {
            if let Some(raw) = as_validator_tx(tx) {
                match parse_validator_tx(raw) {
                    Ok(update) => {
                        self.register_validator(update.clone());
                        validator_updates.push(update);
                        tx_results.push(ExecTxResult {
                            code: codes::CODE_OK,
                            log: "validator updated".to_string(),
                            codespace: codes::CODESPACE.to_string(),
                            ..ExecTxResult::default()
                        });
                    }
                    Err(err) => {
                        warn!(%err, "rejected validator tx");
                        tx_results.push(ExecTxResult {
                            code: codes::CODE_INVALID_VALIDATOR_TX,
                            codespace: codes::CODESPACE.to_string(),
                            ..ExecTxResult::default()
                        });
                    }
                }
                continue;
            }

            let envelope: TxEnvelope = match serde_json::from_slice(tx) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(?err, "failed to decode tx envelope");
                    tx_results.push(ExecTxResult {
                        code: codes::CODE_ENCODING_ERROR,
                        codespace: codes::CODESPACE.to_string(),
                        ..ExecTxResult::default()
                    });
                    continue;
                }
            };

            let Some(app) = self.apps.get_mut(&envelope.app) else {
                warn!(app = %envelope.app, "tx targets unknown app");
                tx_results.push(ExecTxResult {
                    code: codes::CODE_UNKNOWN_APP,
                    codespace: codes::CODESPACE.to_string(),
                    ..ExecTxResult::default()
                });
                continue;
            };

            let outcome = app.finalize_block(&block, envelope.data.get());
            if let Some(commit) = outcome.commit {
                self.commit_queue.push(commit);
            }
            if !outcome.app_hash.is_empty() {
                self.state
                    .app_hashes
                    .insert(envelope.app.clone(), hex::encode(&outcome.app_hash));
            }
            info!(
                app = %envelope.app,
                code = outcome.tx_result.code,
                "finalized tx"
            );
            tx_results.push(outcome.tx_result);
        }

        self.state.height = request.height;
        let app_hash = self.state.composite_hash();
        info!(height = request.height, app_hash = %hex::encode(&app_hash), "finalized block");

        FinalizeBlockResponse {
            tx_results,
            validator_updates,
            app_hash,
        }
    }

    /// Applies every staged commit closure in block order and persists the
    /// multiplexer state. Any closure failure is fatal: the caller must
    /// stop the node rather than continue with partial commits.
    pub fn commit(&mut self) -> Result<i64, CommitError> {
        for commit in self.commit_queue.drain(..) {
            commit().map_err(CommitError::Closure)?;
        }

        let encoded = serde_json::to_vec(&self.state).map_err(StorageError::from)?;
        self.db.put(CF_MUXER, STATE_KEY, &encoded)?;

        let retain_height = if self.retain_blocks > 0 && self.state.height >= self.retain_blocks {
            self.state.height - self.retain_blocks + 1
        } else {
            0
        };
        Ok(retain_height)
    }

    pub fn query(&self, app: &str, request: &QueryRequest) -> QueryResponse {
        match self.apps.get(app) {
            Some(app) => app.query(request),
            None => {
                warn!(app, "query targets unknown app");
                ErrorResponse::new(codes::CODE_UNKNOWN_APP, codes::CODESPACE, "unknown app name")
                    .into_query(request.height)
            }
        }
    }

    fn punish_misbehavior(&mut self, misbehavior: &[Misbehavior]) -> Vec<ValidatorUpdate> {
        let mut updates = Vec::new();
        for evidence in misbehavior {
            warn!(?evidence, "misbehaviour detected");
            if evidence.kind != MisbehaviorKind::DuplicateVote {
                continue;
            }

            let address = hex::encode(&evidence.validator_address);
            let Some(validator) = self.validators.get(&address) else {
                warn!(%address, "duplicate vote evidence for unknown validator");
                continue;
            };

            updates.push(ValidatorUpdate {
                key_type: validator.key_type.clone(),
                pub_key: validator.pub_key.clone(),
                power: (evidence.power - 1).max(0),
            });
        }
        updates
    }

    fn register_validator(&mut self, update: ValidatorUpdate) {
        self.validators.insert(validator_address(&update.pub_key), update);
    }
}

/// Validator address: first twenty bytes of the SHA-256 of the public key,
/// hex encoded.
fn validator_address(pub_key: &[u8]) -> String {
    let digest: [u8; 32] = Sha256::digest(pub_key).into();
    hex::encode(&digest[..20])
}

fn as_validator_tx(tx: &[u8]) -> Option<&str> {
    std::str::from_utf8(tx)
        .ok()
        .filter(|tx| tx.starts_with(VALIDATOR_PREFIX))
}

/// Parses `val:<keytype>!<base64 pubkey>!<power>`.
pub fn parse_validator_tx(tx: &str) -> Result<ValidatorUpdate, ValidatorTxError> {
    let stripped = tx.strip_prefix(VALIDATOR_PREFIX).unwrap_or(tx);

    let parts: Vec<&str> = stripped.split('!').collect();
    let &[key_type, pub_key, power] = parts.as_slice() else {
        return Err(ValidatorTxError(format!(
            "expected 3 '!'-separated fields, got {}",
            parts.len()
        )));
    };

    let pub_key = BASE64
        .decode(pub_key)
        .map_err(|err| ValidatorTxError(format!("error decoding base64 pubkey: {err}")))?;

    let power: i64 = power
        .parse()
        .map_err(|err| ValidatorTxError(format!("error parsing power: {err}")))?;
    if power < 0 {
        return Err(ValidatorTxError("power must be non-negative".to_string()));
    }

    Ok(ValidatorUpdate {
        key_type: key_type.to_string(),
        pub_key,
        power,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_validator_tx() {
        let encoded = BASE64.encode([9u8; 32]);
        let update = parse_validator_tx(&format!("val:ed25519!{encoded}!10")).unwrap();
        assert_eq!(update.key_type, "ed25519");
        assert_eq!(update.pub_key, vec![9u8; 32]);
        assert_eq!(update.power, 10);
    }

    #[test]
    fn rejects_negative_power_and_bad_framing() {
        let encoded = BASE64.encode([9u8; 32]);
        assert!(parse_validator_tx(&format!("val:ed25519!{encoded}!-1")).is_err());
        assert!(parse_validator_tx("val:ed25519!only-two").is_err());
        assert!(parse_validator_tx("val:ed25519!***!1").is_err());
    }
}
