use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use evchain_types::codes::events as event_codes;
use evchain_types::{EventId, MissingEvent};

const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// HTTP addresses of the chain nodes; converted to websocket urls.
    pub nodes: Vec<String>,
    /// Initial reconnect back-off; doubled per failure up to `max_backoff`.
    pub reconnect_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        FollowerConfig {
            nodes: Vec::new(),
            reconnect_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Streams surfaced by the follower: new block heights and event ids the
/// chain has admitted.
pub struct FollowerStreams {
    pub block_heights: mpsc::Receiver<i64>,
    pub missing_events: mpsc::Receiver<MissingEvent>,
    pub handles: Vec<JoinHandle<()>>,
}

/// Opens one websocket per chain node, all in parallel. Subscribing on
/// every node keeps a single malicious node from hiding events.
pub fn spawn_follower(config: FollowerConfig, shutdown: watch::Receiver<bool>) -> FollowerStreams {
    let (height_tx, block_heights) = mpsc::channel(CHANNEL_CAPACITY);
    let (event_tx, missing_events) = mpsc::channel(CHANNEL_CAPACITY);

    let handles = config
        .nodes
        .iter()
        .map(|node| {
            tokio::spawn(follow_node(
                node.clone(),
                config.reconnect_backoff,
                config.max_backoff,
                height_tx.clone(),
                event_tx.clone(),
                shutdown.clone(),
            ))
        })
        .collect();

    FollowerStreams {
        block_heights,
        missing_events,
        handles,
    }
}

fn websocket_url(node: &str) -> String {
    let stripped = node
        .strip_prefix("http://")
        .map(|rest| (rest, "ws://"))
        .or_else(|| node.strip_prefix("https://").map(|rest| (rest, "wss://")));
    match stripped {
        Some((rest, scheme)) => format!("{scheme}{}/websocket", rest.trim_end_matches('/')),
        None => format!("ws://{}/websocket", node.trim_end_matches('/')),
    }
}

async fn follow_node(
    node: String,
    base_backoff: Duration,
    max_backoff: Duration,
    height_tx: mpsc::Sender<i64>,
    event_tx: mpsc::Sender<MissingEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = websocket_url(&node);
    let mut backoff = base_backoff;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match listen_once(&url, &height_tx, &event_tx, &mut shutdown).await {
            Ok(ListenOutcome::Shutdown) => return,
            Ok(ListenOutcome::Disconnected) => {
                warn!(node = %node, "chain websocket closed, reconnecting");
                backoff = base_backoff;
            }
            Err(err) => {
                warn!(?err, node = %node, "chain websocket failed, backing off");
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

enum ListenOutcome {
    Shutdown,
    Disconnected,
}

async fn listen_once(
    url: &str,
    height_tx: &mpsc::Sender<i64>,
    event_tx: &mpsc::Sender<MissingEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ListenOutcome, tokio_tungstenite::tungstenite::Error> {
    let (mut socket, _) = connect_async(url).await?;
    info!(%url, "subscribed to chain events");

    let subscriptions = [
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "subscribe",
            "id": 1,
            "params": { "query": "tm.event='NewBlock'" },
        }),
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "subscribe",
            "id": 2,
            "params": {
                "query": format!(
                    "{}.{}='{}'",
                    event_codes::EVENT_CREATE,
                    event_codes::ATTRIBUTE_TYPE,
                    event_codes::ATTRIBUTE_VALUE_CREATE,
                ),
            },
        }),
    ];
    for subscription in &subscriptions {
        socket.send(Message::Text(subscription.to_string())).await?;
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = socket.close(None).await;
                    return Ok(ListenOutcome::Shutdown);
                }
            }
            message = socket.next() => {
                let Some(message) = message else {
                    return Ok(ListenOutcome::Disconnected);
                };
                match message? {
                    Message::Text(text) => {
                        // A single undecodable message is logged and skipped.
                        if let Err(err) = handle_message(&text, height_tx, event_tx).await {
                            warn!(%err, "failed to handle chain event message");
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
                    Message::Close(_) => return Ok(ListenOutcome::Disconnected),
                }
            }
        }
    }
}

async fn handle_message(
    text: &str,
    height_tx: &mpsc::Sender<i64>,
    event_tx: &mpsc::Sender<MissingEvent>,
) -> Result<(), String> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|err| format!("decode error: {err}"))?;
    let Some(result) = value.get("result") else {
        // Subscription acknowledgement.
        return Ok(());
    };

    if let Some(height) = new_block_height(result) {
        debug!(height, "observed new block");
        let _ = height_tx.send(height).await;
        return Ok(());
    }

    if let Some(events) = result.get("events").and_then(|events| events.as_object()) {
        let id_key = format!(
            "{}.{}",
            event_codes::EVENT_CREATE,
            event_codes::ATTRIBUTE_EVENT_ID
        );
        let Some(id_hex) = first_event_value(events, &id_key) else {
            return Ok(());
        };
        let Some(height_raw) = first_event_value(events, "tx.height") else {
            return Err("create event without tx.height".to_string());
        };

        let height: i64 = height_raw
            .parse()
            .map_err(|err| format!("bad tx.height: {err}"))?;
        let event_id: EventId = id_hex
            .parse()
            .map_err(|err| format!("bad event id: {err}"))?;

        debug!(event_id = %event_id, height, "observed admitted event");
        let _ = event_tx
            .send(MissingEvent::new(event_id, Utc::now(), height))
            .await;
    }

    Ok(())
}

fn new_block_height(result: &serde_json::Value) -> Option<i64> {
    result
        .get("data")?
        .get("value")?
        .get("block")?
        .get("header")?
        .get("height")?
        .as_str()?
        .parse()
        .ok()
}

fn first_event_value<'a>(
    events: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<&'a str> {
    events.get(key)?.as_array()?.first()?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_conversion() {
        assert_eq!(
            websocket_url("http://localhost:26657"),
            "ws://localhost:26657/websocket"
        );
        assert_eq!(
            websocket_url("https://chain.example.com/"),
            "wss://chain.example.com/websocket"
        );
        assert_eq!(
            websocket_url("localhost:26657"),
            "ws://localhost:26657/websocket"
        );
    }

    #[tokio::test]
    async fn parses_new_block_messages() {
        let (height_tx, mut height_rx) = mpsc::channel(4);
        let (event_tx, _event_rx) = mpsc::channel(4);

        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "data": { "value": { "block": { "header": { "height": "42" } } } }
            }
        });
        handle_message(&message.to_string(), &height_tx, &event_tx)
            .await
            .unwrap();
        assert_eq!(height_rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn parses_create_event_messages() {
        let (height_tx, _height_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(4);

        let id_hex = "ab".repeat(32);
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {
                "events": {
                    "create.event_id": [id_hex],
                    "tx.height": ["7"],
                }
            }
        });
        handle_message(&message.to_string(), &height_tx, &event_tx)
            .await
            .unwrap();

        let missing = event_rx.recv().await.unwrap();
        assert_eq!(missing.block_height, 7);
        assert_eq!(missing.event_id.to_hex(), "ab".repeat(32));
        assert_eq!(missing.retry_count, 0);
    }

    #[tokio::test]
    async fn acknowledgements_are_ignored() {
        let (height_tx, mut height_rx) = mpsc::channel(4);
        let (event_tx, _event_rx) = mpsc::channel(4);

        handle_message(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#, &height_tx, &event_tx)
            .await
            .unwrap();
        assert!(height_rx.try_recv().is_err());
    }
}
