use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use evchain_types::codes::{multiplex, retention as codes};
use evchain_types::retention::policy_structural_hash;
use evchain_types::{
    SetPolicyRequest, SetPolicyResponse, SignedPayload, StoredPolicy,
};

use crate::identity::IdentityRepository;
use crate::protocol::{
    AppFinalizeOutcome, BlockContext, CheckTxResponse, ErrorResponse, EventAttribute,
    ExecTxResult, QueryRequest, QueryResponse, SubApp, TypedEvent,
};
use crate::storage::{LedgerDb, StorageError, CF_RETENTION};

const POLICY_KEY: &[u8] = b"policy";

/// The retention sub-app: a set-once policy singleton. The cached policy
/// lives on the struct and is loaded from disk at startup.
pub struct RetentionPolicyApp {
    db: LedgerDb,
    identities: IdentityRepository,
    policy: Arc<Mutex<Option<StoredPolicy>>>,
    tx_state: Arc<Mutex<Option<StoredPolicy>>>,
}

impl RetentionPolicyApp {
    pub fn load(db: LedgerDb, identities: IdentityRepository) -> Result<Self, StorageError> {
        let policy = match db.get(CF_RETENTION, POLICY_KEY)? {
            Some(raw) => Some(serde_json::from_slice(&raw)?),
            None => None,
        };

        Ok(RetentionPolicyApp {
            db,
            identities,
            policy: Arc::new(Mutex::new(policy)),
            tx_state: Arc::new(Mutex::new(None)),
        })
    }

    pub fn policy(&self) -> Option<StoredPolicy> {
        self.policy.lock().clone()
    }

    /// Root hash: little-endian bytes of the structural hash over the
    /// optional policy, so an unset policy still contributes a stable root.
    fn app_hash(&self) -> Vec<u8> {
        let policy = self.policy.lock();
        match policy_structural_hash(&policy) {
            Ok(hash) => hash.to_le_bytes().to_vec(),
            Err(err) => {
                // Canonical JSON over a plain data type cannot fail; keep a
                // deterministic fallback anyway.
                warn!(?err, "failed to hash retention policy");
                0u64.to_le_bytes().to_vec()
            }
        }
    }

    fn decode(&self, data: &str) -> Result<SignedPayload, ErrorResponse> {
        let payload: SignedPayload = serde_json::from_str(data).map_err(|err| {
            warn!(?err, "failed to decode retention payload");
            ErrorResponse::new(
                multiplex::CODE_ENCODING_ERROR,
                multiplex::CODESPACE,
                "error decoding request",
            )
        })?;

        let requester = match self.identities.get(&payload.principal) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(ErrorResponse::new(
                    multiplex::CODE_UNKNOWN_ERROR,
                    multiplex::CODESPACE,
                    format!("unknown principal {}", payload.principal),
                ))
            }
            Err(err) => {
                warn!(?err, principal = %payload.principal, "failed to load requester identity");
                return Err(ErrorResponse::new(
                    multiplex::CODE_UNKNOWN_ERROR,
                    multiplex::CODESPACE,
                    "failed to load requester identity",
                ));
            }
        };

        if !requester.is_admin() {
            return Err(ErrorResponse::new(
                codes::CODE_UNAUTHORIZED,
                codes::CODESPACE,
                "only principals with the admin role can set the retention policy",
            ));
        }

        match payload.validate_signature(&requester.public_key) {
            Ok(true) => Ok(payload),
            Ok(false) => Err(ErrorResponse::new(
                evchain_types::codes::rpc::CODE_INVALID_SIGNATURE,
                evchain_types::codes::rpc::CODESPACE,
                "signature does not verify against the principal's key",
            )),
            Err(err) => {
                warn!(?err, principal = %payload.principal, "malformed request signature");
                Err(ErrorResponse::new(
                    evchain_types::codes::rpc::CODE_INVALID_SIGNATURE,
                    evchain_types::codes::rpc::CODESPACE,
                    "malformed signature encoding",
                ))
            }
        }
    }

    fn validate_set_policy(
        &self,
        payload: &SignedPayload,
    ) -> Result<SetPolicyRequest, ErrorResponse> {
        if self.policy.lock().is_some() || self.tx_state.lock().is_some() {
            return Err(ErrorResponse::new(
                codes::CODE_POLICY_ALREADY_SET,
                codes::CODESPACE,
                "retention policy already set",
            ));
        }

        let request: SetPolicyRequest = serde_json::from_str(payload.payload.data.get())
            .map_err(|err| {
                warn!(?err, "failed to decode set-policy request");
                ErrorResponse::new(
                    multiplex::CODE_ENCODING_ERROR,
                    multiplex::CODESPACE,
                    "error decoding request",
                )
            })?;

        request.policy.validate().map_err(|err| {
            ErrorResponse::new(codes::CODE_INVALID_POLICY, codes::CODESPACE, err.to_string())
        })?;

        Ok(request)
    }
}

impl SubApp for RetentionPolicyApp {
    fn name(&self) -> &'static str {
        codes::APP_NAME
    }

    fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "app_hash": hex::encode(self.app_hash()),
            "is_set": self.policy.lock().is_some(),
        })
    }

    fn init_chain(&mut self) -> Vec<u8> {
        self.app_hash()
    }

    fn check_tx(&self, data: &str) -> CheckTxResponse {
        let payload = match self.decode(data) {
            Ok(payload) => payload,
            Err(err) => return err.into_check_tx(),
        };

        match payload.payload.request_type.as_str() {
            codes::REQUEST_SET_POLICY => match self.validate_set_policy(&payload) {
                Ok(_) => CheckTxResponse {
                    code: codes::CODE_OK,
                    codespace: codes::CODESPACE.to_string(),
                    ..CheckTxResponse::default()
                },
                Err(err) => err.into_check_tx(),
            },
            _ => ErrorResponse::new(codes::CODE_UNKNOWN_REQUEST_TYPE, codes::CODESPACE, "")
                .into_check_tx(),
        }
    }

    fn finalize_block(&mut self, block: &BlockContext, data: &str) -> AppFinalizeOutcome {
        let payload = match self.decode(data) {
            Ok(payload) => payload,
            Err(err) => return err.into_finalize(),
        };

        match payload.payload.request_type.as_str() {
            codes::REQUEST_SET_POLICY => {
                let request = match self.validate_set_policy(&payload) {
                    Ok(request) => request,
                    Err(err) => return err.into_finalize(),
                };

                let response_data = match serde_json::to_vec(&SetPolicyResponse::default()) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(?err, "failed to encode set-policy response");
                        return ErrorResponse::new(
                            multiplex::CODE_ENCODING_ERROR,
                            multiplex::CODESPACE,
                            "failed to encode response",
                        )
                        .into_finalize();
                    }
                };

                let stored = StoredPolicy {
                    policy: request.policy,
                    author: payload.principal.clone(),
                    applied_at: block.time,
                };
                *self.tx_state.lock() = Some(stored.clone());

                // Root reflecting the staged policy; identical to the
                // committed root once the closure runs.
                let staged_hash = match policy_structural_hash(&Some(stored.clone())) {
                    Ok(hash) => hash.to_le_bytes().to_vec(),
                    Err(err) => {
                        warn!(?err, "failed to hash staged retention policy");
                        return ErrorResponse::new(
                            multiplex::CODE_UNKNOWN_ERROR,
                            multiplex::CODESPACE,
                            "failed to hash staged policy",
                        )
                        .into_finalize();
                    }
                };

                let db = self.db.clone();
                let policy = Arc::clone(&self.policy);
                let tx_state = Arc::clone(&self.tx_state);
                AppFinalizeOutcome {
                    tx_result: ExecTxResult {
                        code: codes::CODE_OK,
                        data: response_data,
                        log: "policy set".to_string(),
                        events: vec![TypedEvent::new(
                            "policy_set",
                            vec![EventAttribute::indexed("author", payload.principal.as_str())],
                        )],
                        codespace: codes::CODESPACE.to_string(),
                    },
                    app_hash: staged_hash,
                    commit: Some(Box::new(move || {
                        *policy.lock() = Some(stored.clone());
                        *tx_state.lock() = None;
                        let encoded = serde_json::to_vec(&stored)?;
                        db.put(CF_RETENTION, POLICY_KEY, &encoded)?;
                        Ok(())
                    })),
                }
            }
            _ => ErrorResponse::new(codes::CODE_UNKNOWN_REQUEST_TYPE, codes::CODESPACE, "")
                .into_finalize(),
        }
    }

    fn query(&self, request: &QueryRequest) -> QueryResponse {
        if request.prove {
            // Single value, not in a tree: nothing to prove against.
            return ErrorResponse::new(
                codes::CODE_UNSUPPORTED_REQUEST,
                codes::CODESPACE,
                "proof operation not valid for the retention policy",
            )
            .into_query(request.height);
        }

        let policy = self.policy.lock();
        let Some(stored) = policy.as_ref() else {
            return ErrorResponse::new(codes::CODE_POLICY_NOT_SET, codes::CODESPACE, "")
                .into_query(request.height);
        };

        match serde_json::to_vec(stored) {
            Ok(value) => QueryResponse {
                code: codes::CODE_OK,
                log: "policy found".to_string(),
                value,
                height: request.height,
                codespace: codes::CODESPACE.to_string(),
                ..QueryResponse::default()
            },
            Err(err) => {
                warn!(?err, "failed to encode stored policy");
                ErrorResponse::new(multiplex::CODE_UNKNOWN_ERROR, multiplex::CODESPACE, "")
                    .into_query(request.height)
            }
        }
    }
}
