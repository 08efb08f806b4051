use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use evchain_client::{ChainReader, ClientError};
use evchain_types::{Principal, StoredEvent, SubmitRequest};

use crate::repository::{EventRepository, RepositoryError};
use crate::state::ReplicaStateStore;

/// Rejection reasons for an inbound payload submission, each mapped to the
/// HTTP status the submit surface returns.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    BadRequest(&'static str),
    #[error("principal not found")]
    PrincipalNotFound,
    #[error("signature is invalid")]
    SignatureInvalid,
    #[error("principal does not match")]
    PrincipalMismatch,
    #[error("event not found")]
    EventNotFound,
    #[error("internal failure: {0}")]
    Internal(String),
}

impl SubmitError {
    pub fn status(&self) -> u16 {
        match self {
            SubmitError::BadRequest(_) => 400,
            SubmitError::PrincipalNotFound => 401,
            SubmitError::SignatureInvalid | SubmitError::PrincipalMismatch => 403,
            SubmitError::EventNotFound => 404,
            SubmitError::Internal(_) => 500,
        }
    }
}

/// Validates and stores an inbound payload submission, whether it arrived
/// over HTTP or as a gossip broadcast. Every check runs against the chain:
/// the signer, the on-chain metadata and the payload hash must all line up.
pub struct SubmitPipeline<C, R> {
    chain: Arc<C>,
    repository: Arc<R>,
    state: Arc<ReplicaStateStore>,
}

impl<C: ChainReader, R: EventRepository> SubmitPipeline<C, R> {
    pub fn new(chain: Arc<C>, repository: Arc<R>, state: Arc<ReplicaStateStore>) -> Self {
        SubmitPipeline {
            chain,
            repository,
            state,
        }
    }

    pub async fn store_event(&self, request: &SubmitRequest) -> Result<StoredEvent, SubmitError> {
        let principal = Principal::new(request.principal.clone())
            .map_err(|_| SubmitError::BadRequest("invalid principal"))?;

        let identity = match self.chain.get_identity(&principal).await {
            Ok(identity) => identity,
            Err(ClientError::PrincipalNotFound) => return Err(SubmitError::PrincipalNotFound),
            Err(err) => {
                error!(?err, "failed to get identity");
                return Err(SubmitError::Internal("failed to get identity".to_string()));
            }
        };

        let signature = hex::decode(&request.signature)
            .map_err(|_| SubmitError::BadRequest("invalid signature encoding"))?;
        let payload_hash = request
            .event_data
            .hash()
            .map_err(|err| SubmitError::Internal(err.to_string()))?;
        if !identity.public_key.verify(&payload_hash, &signature) {
            warn!(
                principal = %request.principal,
                event_id = %request.event_id,
                tx_hash = %request.tx_hash,
                "got invalid event data signature"
            );
            return Err(SubmitError::SignatureInvalid);
        }

        let on_chain = match self.chain.get_event_by_tx(&request.tx_hash).await {
            Ok(event) => event,
            Err(ClientError::EventNotFound) => return Err(SubmitError::EventNotFound),
            Err(err) => {
                error!(?err, "failed to get event by tx");
                return Err(SubmitError::Internal(
                    "failed to get event by tx".to_string(),
                ));
            }
        };

        if on_chain.metadata.event_id != request.event_id {
            warn!(
                tx_hash = %request.tx_hash,
                on_chain_event_id = %on_chain.metadata.event_id,
                request_event_id = %request.event_id,
                "event id does not match"
            );
            return Err(SubmitError::BadRequest("event id does not match"));
        }

        // The signature check already ties the submitter to this key; the
        // metadata principal must be the same party.
        if on_chain.metadata.principal != principal {
            warn!(
                tx_hash = %request.tx_hash,
                on_chain_principal = %on_chain.metadata.principal,
                submitted_principal = %request.principal,
                "event data submitted by different principal"
            );
            return Err(SubmitError::PrincipalMismatch);
        }

        if on_chain.event.off_chain_hash != hex::encode(payload_hash) {
            warn!(
                tx_hash = %request.tx_hash,
                event_id = %on_chain.metadata.event_id,
                on_chain_hash = %on_chain.event.off_chain_hash,
                submitted_hash = %hex::encode(payload_hash),
                "event data does not match the on-chain hash"
            );
            return Err(SubmitError::BadRequest("event data does not match"));
        }

        let stored = StoredEvent {
            event: on_chain.event,
            payload: request.event_data.clone(),
            metadata: on_chain.metadata,
            tx_hash: request.tx_hash.clone(),
        };

        match self.repository.store(stored.clone()).await {
            Ok(()) => {}
            Err(RepositoryError::AlreadyStored) => {
                debug!(event_id = %request.event_id, "received duplicate event");
            }
            Err(err) => {
                error!(?err, "failed to store event");
                return Err(SubmitError::Internal("failed to store event".to_string()));
            }
        }

        // Failures here self-heal: the harmoniser notices the event exists
        // on its next pass and clears the marker.
        if let Err(err) = self
            .state
            .remove_missing_event(&stored.metadata.event_id)
        {
            error!(?err, "failed to remove missing event marker");
        }

        Ok(stored)
    }
}
