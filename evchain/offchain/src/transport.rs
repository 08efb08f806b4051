use async_trait::async_trait;
use thiserror::Error;

use evchain_gossip::{GossipError, GossipTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cluster is empty")]
    ClusterEmpty,
    #[error("target {0} not found in cluster")]
    TargetNotFound(String),
    #[error("transport failure: {0}")]
    Other(String),
}

impl From<GossipError> for TransportError {
    fn from(err: GossipError) -> Self {
        match err {
            GossipError::ClusterEmpty => TransportError::ClusterEmpty,
            GossipError::TargetNotFound(name) => TransportError::TargetNotFound(name),
            other => TransportError::Other(other.to_string()),
        }
    }
}

/// Transport surface the reconciliation machinery depends on. Implemented
/// by the gossip transport; tests plug in loopback fakes.
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    /// This replica's name inside the cluster.
    fn identifier(&self) -> &str;

    /// Best-effort delivery to all members.
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Reliable delivery to a named member.
    async fn unicast(&self, target: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Reliable delivery to a uniformly random member other than self.
    async fn unicast_random_neighbour(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
}

#[async_trait]
impl EventTransport for GossipTransport {
    fn identifier(&self) -> &str {
        GossipTransport::identifier(self)
    }

    async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        GossipTransport::broadcast(self, bytes).await.map_err(Into::into)
    }

    async fn unicast(&self, target: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        GossipTransport::unicast(self, target, bytes)
            .await
            .map_err(Into::into)
    }

    async fn unicast_random_neighbour(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        GossipTransport::unicast_random_neighbour(self, bytes)
            .await
            .map_err(Into::into)
    }
}
