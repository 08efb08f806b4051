use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use evchain_types::codes::{identity as codes, multiplex};
use evchain_types::{
    IdentityRecord, Principal, RegisterRequest, Role, SeedRequest, SignedPayload, UnsignedPayload,
};

use crate::protocol::{
    AppFinalizeOutcome, BlockContext, CheckTxResponse, ErrorResponse, ExecTxResult, QueryRequest,
    QueryResponse, SubApp,
};
use crate::storage::{LedgerDb, CF_IDENTITY};
use crate::tree::{TreeError, TreeProof, VersionedTree};

const PRINCIPAL_PREFIX: &str = "principal/";
const SEEDED_KEY: &[u8] = b"meta/seeded";

/// Handle on the identity tree, shared with sub-apps that resolve signers.
#[derive(Clone)]
pub struct IdentityRepository {
    tree: Arc<Mutex<VersionedTree>>,
}

/// Result of a proven lookup: the record (when present), its sorted index,
/// the proof and the tree version the proof was generated against.
pub struct ProvenIdentity {
    pub record: Option<IdentityRecord>,
    pub index: i64,
    pub proof: TreeProof,
    pub version: u64,
}

impl IdentityRepository {
    pub fn load(db: LedgerDb) -> Result<Self, TreeError> {
        let tree = VersionedTree::load_latest(db, CF_IDENTITY)?;
        Ok(IdentityRepository {
            tree: Arc::new(Mutex::new(tree)),
        })
    }

    fn principal_key(principal: &Principal) -> Vec<u8> {
        format!("{PRINCIPAL_PREFIX}{principal}").into_bytes()
    }

    pub fn get(&self, principal: &Principal) -> Result<Option<IdentityRecord>, serde_json::Error> {
        let tree = self.tree.lock();
        match tree.get(&Self::principal_key(principal)) {
            Some(raw) => Ok(Some(serde_json::from_slice(raw)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, principal: &Principal) -> bool {
        self.tree.lock().has(&Self::principal_key(principal))
    }

    pub fn is_seeded(&self) -> bool {
        self.tree.lock().has(SEEDED_KEY)
    }

    pub fn store(
        &self,
        principal: &Principal,
        record: &IdentityRecord,
    ) -> Result<(), serde_json::Error> {
        let encoded = serde_json::to_vec(record)?;
        self.tree.lock().set(Self::principal_key(principal), encoded);
        Ok(())
    }

    pub fn set_seeded(&self) {
        self.tree.lock().set(SEEDED_KEY.to_vec(), b"true".to_vec());
    }

    pub fn hash(&self) -> [u8; 32] {
        self.tree.lock().hash()
    }

    pub fn save(&self) -> Result<([u8; 32], u64), TreeError> {
        self.tree.lock().save()
    }

    pub fn version(&self) -> u64 {
        self.tree.lock().version()
    }

    pub fn get_with_proof(&self, principal: &Principal) -> Result<ProvenIdentity, TreeError> {
        let tree = self.tree.lock();
        let key = Self::principal_key(principal);
        let proof = tree.proof_for(&key)?;
        let (value, index) = tree.get_with_index(&key);
        let record = match value {
            Some(raw) => Some(serde_json::from_slice(raw)?),
            None => None,
        };
        Ok(ProvenIdentity {
            record,
            index,
            proof,
            version: tree.version(),
        })
    }
}

#[derive(Default)]
struct TxState {
    seeded: bool,
    registering: Vec<Principal>,
}

/// The identity sub-app: a seed-once registry of principals with roles.
pub struct IdentityApp {
    repository: IdentityRepository,
    tx_state: Arc<Mutex<TxState>>,
}

impl IdentityApp {
    pub fn new(repository: IdentityRepository) -> Self {
        IdentityApp {
            repository,
            tx_state: Arc::new(Mutex::new(TxState::default())),
        }
    }

    pub fn repository(&self) -> IdentityRepository {
        self.repository.clone()
    }

    /// Resolves the requester of a signed payload and checks the signature.
    fn authenticate(&self, payload: &SignedPayload) -> Result<IdentityRecord, ErrorResponse> {
        let requester = match self.repository.get(&payload.principal) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(ErrorResponse::new(
                    codes::CODE_NOT_FOUND,
                    codes::CODESPACE,
                    format!("unknown principal {}", payload.principal),
                ))
            }
            Err(err) => {
                warn!(?err, principal = %payload.principal, "failed to load requester identity");
                return Err(ErrorResponse::new(
                    codes::CODE_UNKNOWN_ERROR,
                    codes::CODESPACE,
                    "failed to load requester identity",
                ));
            }
        };

        match payload.validate_signature(&requester.public_key) {
            Ok(true) => Ok(requester),
            Ok(false) => Err(ErrorResponse::new(
                codes::CODE_INVALID_SIGNATURE,
                codes::CODESPACE,
                "signature does not verify against the principal's key",
            )),
            Err(err) => {
                warn!(?err, principal = %payload.principal, "malformed request signature");
                Err(ErrorResponse::new(
                    codes::CODE_INVALID_SIGNATURE,
                    codes::CODESPACE,
                    "malformed signature encoding",
                ))
            }
        }
    }

    fn validate_seed(&self, data: &str) -> Result<SeedRequest, ErrorResponse> {
        let request: SeedRequest = serde_json::from_str(data).map_err(|err| {
            warn!(?err, "failed to decode seed request");
            ErrorResponse::new(
                multiplex::CODE_ENCODING_ERROR,
                multiplex::CODESPACE,
                "error decoding request",
            )
        })?;

        if self.repository.is_seeded() || self.tx_state.lock().seeded {
            return Err(ErrorResponse::new(
                codes::CODE_ALREADY_SEEDED,
                codes::CODESPACE,
                "identity app is already seeded",
            ));
        }

        Ok(request)
    }

    fn validate_register(
        &self,
        requester: &IdentityRecord,
        data: &str,
    ) -> Result<RegisterRequest, ErrorResponse> {
        if !requester.is_admin() {
            return Err(ErrorResponse::new(
                codes::CODE_UNAUTHORIZED,
                codes::CODESPACE,
                "only principals with the administrator role can register new principals",
            ));
        }

        let request: RegisterRequest = serde_json::from_str(data).map_err(|err| {
            warn!(?err, "failed to decode register request");
            ErrorResponse::new(
                multiplex::CODE_ENCODING_ERROR,
                multiplex::CODESPACE,
                "error decoding request",
            )
        })?;

        let pending = self.tx_state.lock().registering.contains(&request.principal);
        if pending || self.repository.has(&request.principal) {
            return Err(ErrorResponse::new(
                codes::CODE_PRINCIPAL_ALREADY_EXISTS,
                codes::CODESPACE,
                "principal already exists",
            ));
        }

        Ok(request)
    }
}

impl SubApp for IdentityApp {
    fn name(&self) -> &'static str {
        codes::APP_NAME
    }

    fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "version": self.repository.version(),
            "app_hash": hex::encode(self.repository.hash()),
        })
    }

    fn init_chain(&mut self) -> Vec<u8> {
        self.repository.hash().to_vec()
    }

    fn check_tx(&self, data: &str) -> CheckTxResponse {
        let request: UnsignedPayload = match serde_json::from_str(data) {
            Ok(request) => request,
            Err(err) => {
                warn!(?err, "failed to decode identity payload");
                return ErrorResponse::new(
                    multiplex::CODE_ENCODING_ERROR,
                    multiplex::CODESPACE,
                    "error decoding request",
                )
                .into_check_tx();
            }
        };

        match request.payload.request_type.as_str() {
            codes::REQUEST_SEED => match self.validate_seed(request.payload.data.get()) {
                Ok(_) => CheckTxResponse {
                    code: codes::CODE_OK,
                    codespace: codes::CODESPACE.to_string(),
                    ..CheckTxResponse::default()
                },
                Err(err) => err.into_check_tx(),
            },
            codes::REQUEST_REGISTER => {
                let signed: SignedPayload = match serde_json::from_str(data) {
                    Ok(signed) => signed,
                    Err(err) => {
                        warn!(?err, "failed to decode signed identity payload");
                        return ErrorResponse::new(
                            multiplex::CODE_ENCODING_ERROR,
                            multiplex::CODESPACE,
                            "error decoding request",
                        )
                        .into_check_tx();
                    }
                };
                let requester = match self.authenticate(&signed) {
                    Ok(requester) => requester,
                    Err(err) => return err.into_check_tx(),
                };
                match self.validate_register(&requester, signed.payload.data.get()) {
                    Ok(_) => CheckTxResponse {
                        code: codes::CODE_OK,
                        codespace: codes::CODESPACE.to_string(),
                        ..CheckTxResponse::default()
                    },
                    Err(err) => err.into_check_tx(),
                }
            }
            other => {
                warn!(request_type = other, "unknown identity request type");
                ErrorResponse::new(codes::CODE_UNKNOWN_REQUEST_TYPE, codes::CODESPACE, "")
                    .into_check_tx()
            }
        }
    }

    fn finalize_block(&mut self, _block: &BlockContext, data: &str) -> AppFinalizeOutcome {
        let request: UnsignedPayload = match serde_json::from_str(data) {
            Ok(request) => request,
            Err(err) => {
                warn!(?err, "failed to decode identity payload");
                return ErrorResponse::new(
                    multiplex::CODE_ENCODING_ERROR,
                    multiplex::CODESPACE,
                    "error decoding request",
                )
                .into_finalize();
            }
        };

        match request.payload.request_type.as_str() {
            codes::REQUEST_SEED => {
                let seed = match self.validate_seed(request.payload.data.get()) {
                    Ok(seed) => seed,
                    Err(err) => return err.into_finalize(),
                };

                let record = IdentityRecord::new(seed.key, Role::Admin);
                {
                    let mut tx_state = self.tx_state.lock();
                    tx_state.seeded = true;
                    tx_state.registering.push(seed.principal.clone());
                }

                // Stage the write now so the returned root reflects it; the
                // commit closure only persists.
                if let Err(err) = self.repository.store(&seed.principal, &record) {
                    warn!(?err, "failed to stage seed principal");
                    return ErrorResponse::new(
                        codes::CODE_UNKNOWN_ERROR,
                        codes::CODESPACE,
                        "failed to stage seed principal",
                    )
                    .into_finalize();
                }
                self.repository.set_seeded();

                let repository = self.repository.clone();
                let tx_state = Arc::clone(&self.tx_state);
                AppFinalizeOutcome {
                    tx_result: ExecTxResult {
                        code: codes::CODE_OK,
                        codespace: codes::CODESPACE.to_string(),
                        ..ExecTxResult::default()
                    },
                    app_hash: self.repository.hash().to_vec(),
                    commit: Some(Box::new(move || {
                        *tx_state.lock() = TxState::default();
                        repository.save()?;
                        Ok(())
                    })),
                }
            }
            codes::REQUEST_REGISTER => {
                let signed: SignedPayload = match serde_json::from_str(data) {
                    Ok(signed) => signed,
                    Err(err) => {
                        warn!(?err, "failed to decode signed identity payload");
                        return ErrorResponse::new(
                            multiplex::CODE_ENCODING_ERROR,
                            multiplex::CODESPACE,
                            "error decoding request",
                        )
                        .into_finalize();
                    }
                };
                let requester = match self.authenticate(&signed) {
                    Ok(requester) => requester,
                    Err(err) => return err.into_finalize(),
                };
                let register = match self.validate_register(&requester, signed.payload.data.get())
                {
                    Ok(register) => register,
                    Err(err) => return err.into_finalize(),
                };

                let record = IdentityRecord::new(register.public_key, register.role);
                self.tx_state.lock().registering.push(register.principal.clone());

                if let Err(err) = self.repository.store(&register.principal, &record) {
                    warn!(?err, "failed to stage registered principal");
                    return ErrorResponse::new(
                        codes::CODE_UNKNOWN_ERROR,
                        codes::CODESPACE,
                        "failed to stage registered principal",
                    )
                    .into_finalize();
                }

                let repository = self.repository.clone();
                let tx_state = Arc::clone(&self.tx_state);
                AppFinalizeOutcome {
                    tx_result: ExecTxResult {
                        code: codes::CODE_OK,
                        codespace: codes::CODESPACE.to_string(),
                        ..ExecTxResult::default()
                    },
                    app_hash: self.repository.hash().to_vec(),
                    commit: Some(Box::new(move || {
                        *tx_state.lock() = TxState::default();
                        repository.save()?;
                        Ok(())
                    })),
                }
            }
            other => {
                warn!(request_type = other, "unknown identity request type");
                ErrorResponse::new(codes::CODE_UNKNOWN_REQUEST_TYPE, codes::CODESPACE, "")
                    .into_finalize()
            }
        }
    }

    fn query(&self, request: &QueryRequest) -> QueryResponse {
        let name = request.path.trim_start_matches('/');
        let principal = match Principal::new(name) {
            Ok(principal) => principal,
            Err(err) => {
                return ErrorResponse::new(
                    codes::CODE_NOT_FOUND,
                    codes::CODESPACE,
                    err.to_string(),
                )
                .into_query(request.height)
            }
        };

        let proven = match self.repository.get_with_proof(&principal) {
            Ok(proven) => proven,
            Err(TreeError::Uninitialized) => {
                return ErrorResponse::new(
                    codes::CODE_TREE_UNINITIALIZED,
                    codes::CODESPACE,
                    "identity tree has never been written",
                )
                .into_query(request.height)
            }
            Err(err) => {
                warn!(?err, principal = %principal, "identity query failed");
                return ErrorResponse::new(
                    codes::CODE_UNKNOWN_ERROR,
                    codes::CODESPACE,
                    "failed to read identity tree",
                )
                .into_query(request.height);
            }
        };

        match proven.record {
            None => QueryResponse {
                code: codes::CODE_NOT_FOUND,
                log: "principal not found".to_string(),
                index: proven.index,
                key: principal.as_bytes().to_vec(),
                value: Vec::new(),
                proof: Some(proven.proof),
                height: proven.version as i64,
                codespace: codes::CODESPACE.to_string(),
            },
            Some(record) => {
                let value = match serde_json::to_vec(&record) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(?err, "failed to encode identity record");
                        return ErrorResponse::new(
                            codes::CODE_UNKNOWN_ERROR,
                            codes::CODESPACE,
                            "failed to encode identity record",
                        )
                        .into_query(request.height);
                    }
                };
                QueryResponse {
                    code: codes::CODE_OK,
                    log: String::new(),
                    index: proven.index,
                    key: principal.as_bytes().to_vec(),
                    value,
                    proof: Some(proven.proof),
                    height: proven.version as i64,
                    codespace: codes::CODESPACE.to_string(),
                }
            }
        }
    }
}
