//! Off-chain replica node.
//!
//! Wires the durable state store, the in-process event repository, the
//! gossip transport, the chain follower and the harmoniser into one
//! runnable unit with a shared shutdown signal.

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use evchain_client::{spawn_follower, RoundRobinClient};
use evchain_gossip::GossipTransport;
use evchain_offchain::{
    spawn_payload_worker, Harmoniser, MemoryEventRepository, ReplicaProcessor, ReplicaStateStore,
    RetentionAgent, SubmitError, SubmitPipeline, TYPE_BROADCAST_EVENT,
};
use evchain_types::{StoredEvent, SubmitRequest};

pub use config::NodeConfig;

/// Budget for joining all workers at shutdown.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(15);

/// A running off-chain replica.
pub struct ReplicaNode {
    transport: Arc<GossipTransport>,
    submit: SubmitPipeline<RoundRobinClient, MemoryEventRepository>,
    repository: Arc<MemoryEventRepository>,
    chain: Arc<RoundRobinClient>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ReplicaNode {
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let state = Arc::new(
            ReplicaStateStore::open(&config.state.path)
                .context("failed to open replica state store")?,
        );
        let repository = Arc::new(MemoryEventRepository::new());

        let chain = Arc::new(
            RoundRobinClient::connect(
                &config.blockchain.node_addresses,
                config.blockchain.minimum_nodes,
                config.pool_config(),
            )
            .await
            .context("failed to connect to chain nodes")?,
        );

        let transport = GossipTransport::bind(config.gossip_config()?)
            .await
            .context("failed to start gossip transport")?;
        let inbound = transport
            .take_inbound()
            .context("transport inbound stream already taken")?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let (processor, backfill_worker) = ReplicaProcessor::spawn(
            Arc::clone(&chain),
            Arc::clone(&repository),
            Arc::clone(&state),
            Arc::clone(&transport),
            shutdown_rx.clone(),
        );
        handles.push(backfill_worker);
        handles.push(spawn_payload_worker(
            inbound,
            processor,
            shutdown_rx.clone(),
        ));

        let follower = spawn_follower(config.follower_config(), shutdown_rx.clone());
        handles.extend(follower.handles);

        let harmoniser = Harmoniser::new(
            Arc::clone(&chain),
            Arc::clone(&repository),
            Arc::clone(&state),
            Arc::clone(&transport),
            config.backfill_config(),
        );
        handles.extend(harmoniser.spawn(
            follower.block_heights,
            follower.missing_events,
            shutdown_rx.clone(),
        ));

        let retention = RetentionAgent::new(
            Arc::clone(&chain),
            Arc::clone(&repository),
            config.retention_config(),
        );
        handles.push(retention.spawn(shutdown_rx));

        let submit = SubmitPipeline::new(
            Arc::clone(&chain),
            Arc::clone(&repository),
            Arc::clone(&state),
        );

        info!(node = %transport.identifier(), "off-chain replica started");
        Ok(ReplicaNode {
            transport,
            submit,
            repository,
            chain,
            shutdown,
            handles,
        })
    }

    /// Validates and stores a payload submission, then re-broadcasts it to
    /// sibling replicas. This is the entry point the external HTTP submit
    /// surface calls into.
    pub async fn submit_event(&self, request: &SubmitRequest) -> Result<StoredEvent, SubmitError> {
        let stored = self.submit.store_event(request).await?;

        let encoded = evchain_offchain::encode_payload(TYPE_BROADCAST_EVENT, request)
            .map_err(|err| SubmitError::Internal(err.to_string()))?;
        if let Err(err) = self.transport.broadcast(encoded).await {
            warn!(%err, "failed to broadcast submitted event to siblings");
        }

        Ok(stored)
    }

    pub fn repository(&self) -> Arc<MemoryEventRepository> {
        Arc::clone(&self.repository)
    }

    /// Flags every worker to stop and waits for them within a global
    /// budget.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("shutting down off-chain replica");
        let _ = self.shutdown.send(true);

        let drain = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_BUDGET, drain).await.is_err() {
            warn!("workers did not drain within the shutdown budget");
        }

        self.transport.shutdown().await;
        self.chain.close().await;
        Ok(())
    }
}
