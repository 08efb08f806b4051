use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use evchain_types::codes::{events as codes, multiplex, rpc};
use evchain_types::{
    CreateRequest, CreateResponse, EventCountResponse, EventId, EventMetadata, EventWithMetadata,
    SignedPayload,
};

use crate::identity::IdentityRepository;
use crate::protocol::{
    AppFinalizeOutcome, BlockContext, CheckTxResponse, ErrorResponse, EventAttribute,
    ExecTxResult, QueryRequest, QueryResponse, SubApp, TypedEvent,
};
use crate::storage::{LedgerDb, CF_EVENTS};
use crate::tree::{TreeError, TreeProof, VersionedTree};

const EVENT_BY_ID_PREFIX: &str = "/event-by-id/";

/// Handle on the event ledger tree.
#[derive(Clone)]
pub struct EventsRepository {
    tree: Arc<Mutex<VersionedTree>>,
}

pub struct ProvenEvent {
    pub event: Option<EventWithMetadata>,
    pub index: i64,
    pub proof: TreeProof,
    pub version: u64,
}

impl EventsRepository {
    pub fn load(db: LedgerDb) -> Result<Self, TreeError> {
        let tree = VersionedTree::load_latest(db, CF_EVENTS)?;
        Ok(EventsRepository {
            tree: Arc::new(Mutex::new(tree)),
        })
    }

    pub fn get(&self, id: &EventId) -> Result<Option<EventWithMetadata>, serde_json::Error> {
        let tree = self.tree.lock();
        match tree.get(id.as_bytes()) {
            Some(raw) => Ok(Some(serde_json::from_slice(raw)?)),
            None => Ok(None),
        }
    }

    pub fn store(&self, event: &EventWithMetadata) -> Result<(), serde_json::Error> {
        let encoded = serde_json::to_vec(event)?;
        self.tree
            .lock()
            .set(event.metadata.event_id.as_bytes().to_vec(), encoded);
        Ok(())
    }

    pub fn event_count(&self) -> u64 {
        self.tree.lock().len()
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

    pub fn get_with_proof(&self, id: &EventId) -> Result<ProvenEvent, TreeError> {
        let tree = self.tree.lock();
        let proof = tree.proof_for(id.as_bytes())?;
        let (value, index) = tree.get_with_index(id.as_bytes());
        let event = match value {
            Some(raw) => Some(serde_json::from_slice(raw)?),
            None => None,
        };
        Ok(ProvenEvent {
            event,
            index,
            proof,
            version: tree.version(),
        })
    }
}

/// The events sub-app: an append-only ledger of scrubbed event metadata
/// keyed by deterministic event hash.
pub struct EventsApp {
    repository: EventsRepository,
    identities: IdentityRepository,
    tx_state: Arc<Mutex<Vec<EventId>>>,
}

impl EventsApp {
    pub fn new(repository: EventsRepository, identities: IdentityRepository) -> Self {
        EventsApp {
            repository,
            identities,
            tx_state: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn repository(&self) -> EventsRepository {
        self.repository.clone()
    }

    /// Decodes the signed payload and authenticates the submitting
    /// principal against the identity registry.
    fn decode(&self, data: &str) -> Result<SignedPayload, ErrorResponse> {
        let payload: SignedPayload = serde_json::from_str(data).map_err(|err| {
            warn!(?err, "failed to decode events payload");
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

        match payload.validate_signature(&requester.public_key) {
            Ok(true) => Ok(payload),
            Ok(false) => Err(ErrorResponse::new(
                rpc::CODE_INVALID_SIGNATURE,
                rpc::CODESPACE,
                "signature does not verify against the principal's key",
            )),
            Err(err) => {
                warn!(?err, principal = %payload.principal, "malformed request signature");
                Err(ErrorResponse::new(
                    rpc::CODE_INVALID_SIGNATURE,
                    rpc::CODESPACE,
                    "malformed signature encoding",
                ))
            }
        }
    }

    fn query_count(&self, request: &QueryRequest) -> QueryResponse {
        let response = EventCountResponse {
            count: self.repository.event_count(),
        };
        match serde_json::to_vec(&response) {
            Ok(value) => QueryResponse {
                code: codes::CODE_OK,
                log: "event count".to_string(),
                value,
                height: request.height,
                codespace: codes::CODESPACE.to_string(),
                ..QueryResponse::default()
            },
            Err(err) => {
                warn!(?err, "failed to encode event count");
                ErrorResponse::new(codes::CODE_UNKNOWN_ERROR, codes::CODESPACE, "")
                    .into_query(request.height)
            }
        }
    }

    fn query_by_id(&self, request: &QueryRequest, id_hex: &str) -> QueryResponse {
        if id_hex.len() != 64 || !id_hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return ErrorResponse::new(codes::CODE_INVALID_QUERY_PATH, codes::CODESPACE, "")
                .into_query(request.height);
        }
        let Ok(event_id) = id_hex.parse::<EventId>() else {
            return ErrorResponse::new(codes::CODE_INVALID_QUERY_PATH, codes::CODESPACE, "")
                .into_query(request.height);
        };

        let proven = match self.repository.get_with_proof(&event_id) {
            Ok(proven) => proven,
            Err(TreeError::Uninitialized) => {
                return ErrorResponse::new(
                    codes::CODE_TREE_UNINITIALIZED,
                    codes::CODESPACE,
                    "event tree has never been written",
                )
                .into_query(request.height)
            }
            Err(err) => {
                warn!(?err, event_id = %event_id, "event query failed");
                return ErrorResponse::new(
                    codes::CODE_UNKNOWN_ERROR,
                    codes::CODESPACE,
                    "failed to read event tree",
                )
                .into_query(request.height);
            }
        };

        let height = if request.height == 0 {
            proven.version as i64
        } else {
            request.height
        };

        match proven.event {
            None => QueryResponse {
                code: codes::CODE_EVENT_NOT_FOUND,
                log: "event not found".to_string(),
                index: proven.index,
                key: event_id.as_bytes().to_vec(),
                value: Vec::new(),
                proof: Some(proven.proof),
                height,
                codespace: codes::CODESPACE.to_string(),
            },
            Some(event) => match serde_json::to_vec(&event) {
                Ok(value) => QueryResponse {
                    code: codes::CODE_OK,
                    log: "event found".to_string(),
                    index: proven.index,
                    key: event_id.as_bytes().to_vec(),
                    value,
                    proof: Some(proven.proof),
                    height,
                    codespace: codes::CODESPACE.to_string(),
                },
                Err(err) => {
                    warn!(?err, event_id = %event_id, "failed to encode event record");
                    ErrorResponse::new(codes::CODE_UNKNOWN_ERROR, codes::CODESPACE, "")
                        .into_query(height)
                }
            },
        }
    }
}

impl SubApp for EventsApp {
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
        let payload = match self.decode(data) {
            Ok(payload) => payload,
            Err(err) => return err.into_check_tx(),
        };

        match payload.payload.request_type.as_str() {
            codes::REQUEST_CREATE => {
                if let Err(err) =
                    serde_json::from_str::<CreateRequest>(payload.payload.data.get())
                {
                    warn!(?err, "failed to decode create request");
                    return ErrorResponse::new(
                        multiplex::CODE_ENCODING_ERROR,
                        multiplex::CODESPACE,
                        "error decoding request",
                    )
                    .into_check_tx();
                }
                CheckTxResponse {
                    code: multiplex::CODE_OK,
                    codespace: multiplex::CODESPACE.to_string(),
                    ..CheckTxResponse::default()
                }
            }
            other => ErrorResponse::new(
                rpc::CODE_UNKNOWN_REQUEST_TYPE,
                rpc::CODESPACE,
                format!("unknown request type: {other}"),
            )
            .into_check_tx(),
        }
    }

    fn finalize_block(&mut self, block: &BlockContext, data: &str) -> AppFinalizeOutcome {
        let payload = match self.decode(data) {
            Ok(payload) => payload,
            Err(err) => return err.into_finalize(),
        };

        match payload.payload.request_type.as_str() {
            codes::REQUEST_CREATE => {
                let request: CreateRequest =
                    match serde_json::from_str(payload.payload.data.get()) {
                        Ok(request) => request,
                        Err(err) => {
                            warn!(?err, "failed to decode create request");
                            return ErrorResponse::new(
                                multiplex::CODE_ENCODING_ERROR,
                                multiplex::CODESPACE,
                                "error decoding request",
                            )
                            .into_finalize();
                        }
                    };

                let event_id = match EventId::derive(
                    block.height as u64,
                    &payload.principal,
                    &request.event,
                ) {
                    Ok(event_id) => event_id,
                    Err(err) => {
                        warn!(?err, height = block.height, "failed to derive event id");
                        return ErrorResponse::new(
                            multiplex::CODE_UNKNOWN_ERROR,
                            multiplex::CODESPACE,
                            "failed to derive event id",
                        )
                        .into_finalize();
                    }
                };

                // Two creates colliding in one block produce one record.
                {
                    let mut creating = self.tx_state.lock();
                    if creating.contains(&event_id) {
                        warn!(event_id = %event_id, "duplicate event creation in block");
                        return ErrorResponse::new(
                            codes::CODE_UNKNOWN_ERROR,
                            codes::CODESPACE,
                            "duplicate event creation request",
                        )
                        .into_finalize();
                    }
                    creating.push(event_id);
                }

                let metadata = EventMetadata {
                    event_id,
                    received_time: block.time,
                    principal: payload.principal.clone(),
                };
                let record = EventWithMetadata {
                    event: request.event,
                    metadata: metadata.clone(),
                };

                let response_data = match serde_json::to_vec(&CreateResponse {
                    metadata: metadata.clone(),
                }) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(?err, "failed to encode create response");
                        return ErrorResponse::new(
                            multiplex::CODE_UNKNOWN_ERROR,
                            multiplex::CODESPACE,
                            "failed to encode create response",
                        )
                        .into_finalize();
                    }
                };

                // Stage the record now so the returned root reflects it;
                // the commit closure only persists.
                if let Err(err) = self.repository.store(&record) {
                    warn!(?err, event_id = %event_id, "failed to stage event record");
                    return ErrorResponse::new(
                        codes::CODE_UNKNOWN_ERROR,
                        codes::CODESPACE,
                        "failed to stage event record",
                    )
                    .into_finalize();
                }

                let repository = self.repository.clone();
                let tx_state = Arc::clone(&self.tx_state);
                let committed_id = event_id;
                AppFinalizeOutcome {
                    tx_result: ExecTxResult {
                        code: codes::CODE_OK,
                        data: response_data,
                        log: "event stored".to_string(),
                        events: vec![TypedEvent::new(
                            codes::EVENT_CREATE,
                            vec![
                                EventAttribute::indexed(
                                    codes::ATTRIBUTE_TYPE,
                                    codes::ATTRIBUTE_VALUE_CREATE,
                                ),
                                EventAttribute::indexed(
                                    codes::ATTRIBUTE_EVENT_ID,
                                    event_id.to_hex(),
                                ),
                                EventAttribute::indexed(
                                    codes::ATTRIBUTE_PRINCIPAL,
                                    metadata.principal.as_str(),
                                ),
                            ],
                        )],
                        codespace: codes::CODESPACE.to_string(),
                    },
                    app_hash: self.repository.hash().to_vec(),
                    commit: Some(Box::new(move || {
                        info!(event_id = %committed_id, "committing event");
                        tx_state.lock().clear();
                        repository.save()?;
                        Ok(())
                    })),
                }
            }
            other => ErrorResponse::new(
                rpc::CODE_UNKNOWN_REQUEST_TYPE,
                rpc::CODESPACE,
                format!("unknown request type: {other}"),
            )
            .into_finalize(),
        }
    }

    fn query(&self, request: &QueryRequest) -> QueryResponse {
        if request.path == "/count" {
            return self.query_count(request);
        }

        match request.path.strip_prefix(EVENT_BY_ID_PREFIX) {
            Some(id_hex) => self.query_by_id(request, id_hex),
            None => ErrorResponse::new(codes::CODE_INVALID_QUERY_PATH, codes::CODESPACE, "")
                .into_query(request.height),
        }
    }
}
