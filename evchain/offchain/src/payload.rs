use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use evchain_gossip::InboundMessage;
use evchain_types::{EventId, EventPayload, SubmitRequest, TxHash};

/// Received event from an agent; the serving replica re-broadcasts it.
pub const TYPE_BROADCAST_EVENT: u8 = 0;
/// "Who has these events?"
pub const TYPE_REQUEST_EVENT: u8 = 1;
/// "Here is the event data."
pub const TYPE_BACKFILL_RESPONSE: u8 = 2;

/// Envelope for every message on the gossip bus. Field keys are a single
/// character to keep multicast traffic small.
#[derive(Debug, Serialize, Deserialize)]
pub struct GossipPayload {
    #[serde(rename = "t")]
    pub payload_type: u8,
    #[serde(rename = "d")]
    pub data: Box<RawValue>,
}

pub fn encode_payload<T: Serialize>(
    payload_type: u8,
    data: &T,
) -> Result<Vec<u8>, serde_json::Error> {
    let data = RawValue::from_string(serde_json::to_string(data)?)?;
    serde_json::to_vec(&GossipPayload { payload_type, data })
}

/// Request for event data from peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRequest {
    #[serde(rename = "e")]
    pub event_ids: Vec<EventId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillEventData {
    #[serde(rename = "e")]
    pub event_id: EventId,
    #[serde(rename = "h")]
    pub tx_hash: TxHash,
    #[serde(rename = "d")]
    pub payload: EventPayload,
}

/// Answer to an [`EventRequest`]. The receiver re-validates every entry
/// against the chain before storing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBackfillResponse {
    #[serde(rename = "e")]
    pub events: Vec<BackfillEventData>,
}

impl EventBackfillResponse {
    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.iter().map(|event| event.event_id).collect()
    }
}

/// Handles the three payload kinds carried by the transport.
#[async_trait]
pub trait PayloadProcessor: Send + Sync + 'static {
    async fn handle_broadcast(&self, source: &str, request: SubmitRequest);

    async fn handle_event_request(&self, source: &str, request: EventRequest);

    async fn handle_backfill_response(&self, source: &str, response: EventBackfillResponse);
}

/// Drains the transport's inbound channel and dispatches decoded payloads.
/// Runs until shutdown or until the transport drops the channel.
pub fn spawn_payload_worker<P: PayloadProcessor>(
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    processor: Arc<P>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("payload worker received shutdown signal");
                        return;
                    }
                }
                message = inbound.recv() => {
                    let Some(message) = message else {
                        debug!("transport inbound channel closed");
                        return;
                    };
                    dispatch(&processor, message).await;
                }
            }
        }
    })
}

async fn dispatch<P: PayloadProcessor>(processor: &Arc<P>, message: InboundMessage) {
    let payload: GossipPayload = match serde_json::from_slice(&message.data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(?err, source = %message.source, "undecodable gossip payload");
            return;
        }
    };

    match payload.payload_type {
        TYPE_BROADCAST_EVENT => match serde_json::from_str(payload.data.get()) {
            Ok(request) => processor.handle_broadcast(&message.source, request).await,
            Err(err) => warn!(?err, "undecodable broadcast payload"),
        },
        TYPE_REQUEST_EVENT => match serde_json::from_str(payload.data.get()) {
            Ok(request) => {
                processor
                    .handle_event_request(&message.source, request)
                    .await
            }
            Err(err) => warn!(?err, "undecodable event request payload"),
        },
        TYPE_BACKFILL_RESPONSE => match serde_json::from_str(payload.data.get()) {
            Ok(response) => {
                processor
                    .handle_backfill_response(&message.source, response)
                    .await
            }
            Err(err) => warn!(?err, "undecodable backfill response payload"),
        },
        other => warn!(payload_type = other, "unknown payload type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingProcessor {
        requests: Mutex<Vec<(String, EventRequest)>>,
    }

    #[async_trait]
    impl PayloadProcessor for RecordingProcessor {
        async fn handle_broadcast(&self, _source: &str, _request: SubmitRequest) {}

        async fn handle_event_request(&self, source: &str, request: EventRequest) {
            self.requests.lock().push((source.to_string(), request));
        }

        async fn handle_backfill_response(
            &self,
            _source: &str,
            _response: EventBackfillResponse,
        ) {
        }
    }

    #[test]
    fn payload_envelope_uses_single_character_keys() {
        let request = EventRequest {
            event_ids: vec![EventId::from_bytes([1; 32])],
        };
        let encoded = encode_payload(TYPE_REQUEST_EVENT, &request).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("\"t\":1"));
        assert!(text.contains("\"e\":["));
        assert!(!text.contains("event_ids"));
    }

    #[tokio::test]
    async fn worker_routes_payloads_by_type() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let processor = Arc::new(RecordingProcessor::default());
        let worker = spawn_payload_worker(rx, Arc::clone(&processor), shutdown_rx);

        let request = EventRequest {
            event_ids: vec![EventId::from_bytes([2; 32])],
        };
        tx.send(InboundMessage {
            source: "replica-2".to_string(),
            data: encode_payload(TYPE_REQUEST_EVENT, &request).unwrap(),
        })
        .unwrap();
        // Junk is logged and skipped, not fatal.
        tx.send(InboundMessage {
            source: "replica-2".to_string(),
            data: b"not json".to_vec(),
        })
        .unwrap();
        drop(tx);

        worker.await.unwrap();
        let requests = processor.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "replica-2");
        assert_eq!(requests[0].1, request);
    }
}
