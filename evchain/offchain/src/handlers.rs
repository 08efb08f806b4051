use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use evchain_client::{ChainReader, ClientError};
use evchain_types::{StoredEvent, SubmitRequest};

use crate::payload::{
    encode_payload, BackfillEventData, EventBackfillResponse, EventRequest, PayloadProcessor,
    TYPE_BACKFILL_RESPONSE,
};
use crate::repository::{EventRepository, RepositoryError};
use crate::state::ReplicaStateStore;
use crate::submit::SubmitPipeline;
use crate::transport::EventTransport;

struct BackfillItem {
    source: String,
    event: BackfillEventData,
}

/// The replica's handler set for the three gossip payload kinds.
///
/// Backfill responses are verified and stored by one serial worker: each
/// response re-fetches the transaction from the chain and checks both the
/// event id and the payload hash before anything is written.
pub struct ReplicaProcessor<C, R, T> {
    chain: Arc<C>,
    repository: Arc<R>,
    state: Arc<ReplicaStateStore>,
    transport: Arc<T>,
    submit: SubmitPipeline<C, R>,
    backfill_tx: mpsc::UnboundedSender<BackfillItem>,
}

impl<C, R, T> ReplicaProcessor<C, R, T>
where
    C: ChainReader,
    R: EventRepository,
    T: EventTransport,
{
    /// Builds the processor and starts its serial backfill worker.
    pub fn spawn(
        chain: Arc<C>,
        repository: Arc<R>,
        state: Arc<ReplicaStateStore>,
        transport: Arc<T>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (backfill_tx, backfill_rx) = mpsc::unbounded_channel();
        let processor = Arc::new(ReplicaProcessor {
            submit: SubmitPipeline::new(
                Arc::clone(&chain),
                Arc::clone(&repository),
                Arc::clone(&state),
            ),
            chain,
            repository,
            state,
            transport,
            backfill_tx,
        });

        let worker = tokio::spawn(backfill_worker(
            Arc::clone(&processor),
            backfill_rx,
            shutdown,
        ));
        (processor, worker)
    }

    async fn process_backfill_item(&self, item: BackfillItem) {
        let BackfillItem { source, event } = item;
        debug!(event_id = %event.event_id, source = %source, "processing backfilled event");

        // Re-fetch the transaction so a peer cannot plant fabricated data.
        let on_chain = match self.chain.get_event_by_tx(&event.tx_hash).await {
            Ok(on_chain) => on_chain,
            Err(ClientError::EventNotFound) => {
                warn!(
                    event_id = %event.event_id,
                    tx_hash = %event.tx_hash,
                    source = %source,
                    "backfilled event not found on chain"
                );
                return;
            }
            Err(err) => {
                error!(?err, "failed to get event metadata by tx");
                return;
            }
        };

        let payload_hash = match event.payload.hash() {
            Ok(hash) => hash,
            Err(err) => {
                error!(?err, "failed to hash backfilled payload");
                return;
            }
        };
        if on_chain.event.off_chain_hash != hex::encode(payload_hash) {
            warn!(
                tx_hash = %event.tx_hash,
                event_id = %on_chain.metadata.event_id,
                on_chain_hash = %on_chain.event.off_chain_hash,
                submitted_hash = %hex::encode(payload_hash),
                source = %source,
                "backfilled event data does not match the on-chain hash"
            );
            return;
        }

        if on_chain.metadata.event_id != event.event_id {
            warn!(
                tx_hash = %event.tx_hash,
                on_chain_event_id = %on_chain.metadata.event_id,
                provided_event_id = %event.event_id,
                source = %source,
                "backfilled event id does not match"
            );
            return;
        }

        let stored = StoredEvent {
            event: on_chain.event,
            payload: event.payload,
            metadata: on_chain.metadata,
            tx_hash: event.tx_hash.clone(),
        };
        let event_id = stored.metadata.event_id;

        match self.repository.store(stored).await {
            Ok(()) => {}
            Err(RepositoryError::AlreadyStored) => {
                debug!(event_id = %event_id, "received duplicate backfilled event");
            }
            Err(err) => {
                error!(?err, "failed to store backfilled event");
                return;
            }
        }

        // On failure the next harmoniser pass clears the marker instead.
        if let Err(err) = self.state.remove_missing_event(&event_id) {
            error!(?err, "failed to remove missing event marker");
            return;
        }

        info!(
            event_id = %event_id,
            tx_hash = %event.tx_hash,
            "event backfilled successfully"
        );
    }
}

#[async_trait]
impl<C, R, T> PayloadProcessor for ReplicaProcessor<C, R, T>
where
    C: ChainReader,
    R: EventRepository,
    T: EventTransport,
{
    async fn handle_broadcast(&self, source: &str, request: SubmitRequest) {
        info!(
            event_id = %request.event_id,
            source = %source,
            "received broadcast event"
        );
        if let Err(err) = self.submit.store_event(&request).await {
            error!(%err, status = err.status(), "failed to store broadcast event");
        }
    }

    async fn handle_event_request(&self, source: &str, request: EventRequest) {
        info!(
            count = request.event_ids.len(),
            source = %source,
            "received event backfill request"
        );

        // A request from ourselves means we do not have the events.
        if source == self.transport.identifier() {
            debug!(source = %source, "ignoring event request from self");
            return;
        }

        let events = match self.repository.get_events_by_id(&request.event_ids).await {
            Ok(events) => events,
            Err(err) => {
                error!(?err, "failed to get events from repository");
                return;
            }
        };
        if events.is_empty() {
            debug!(source = %source, "no events held for request");
            return;
        }

        let response = EventBackfillResponse {
            events: events
                .into_iter()
                .map(|event| BackfillEventData {
                    event_id: event.metadata.event_id,
                    tx_hash: event.tx_hash,
                    payload: event.payload,
                })
                .collect(),
        };
        let count = response.events.len();

        let encoded = match encode_payload(TYPE_BACKFILL_RESPONSE, &response) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(?err, "failed to encode backfill response");
                return;
            }
        };

        if let Err(err) = self.transport.unicast(source, encoded).await {
            error!(%err, requester = %source, "failed to unicast backfill response");
            return;
        }
        info!(count, requester = %source, "responded to event backfill request");
    }

    async fn handle_backfill_response(&self, source: &str, response: EventBackfillResponse) {
        debug!(
            count = response.events.len(),
            source = %source,
            "received event backfill response"
        );
        for event in response.events {
            let _ = self.backfill_tx.send(BackfillItem {
                source: source.to_string(),
                event,
            });
        }
    }
}

/// Serial processor for backfill responses. Each item is independent; a
/// failing item aborts only itself.
async fn backfill_worker<C, R, T>(
    processor: Arc<ReplicaProcessor<C, R, T>>,
    mut items: mpsc::UnboundedReceiver<BackfillItem>,
    mut shutdown: watch::Receiver<bool>,
) where
    C: ChainReader,
    R: EventRepository,
    T: EventTransport,
{
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("backfill worker received shutdown signal");
                    return;
                }
            }
            item = items.recv() => {
                let Some(item) = item else {
                    return;
                };
                processor.process_backfill_item(item).await;
            }
        }
    }
}
