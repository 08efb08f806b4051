use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use evchain_client::{FollowerConfig, PoolConfig};
use evchain_gossip::GossipConfig;
use evchain_offchain::{BackfillConfig, RetentionAgentConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub blockchain: BlockchainSettings,
    pub state: StateSettings,
    pub transport: TransportSettings,
    pub backfill: BackfillSettings,
    pub event_retention: RetentionSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            blockchain: BlockchainSettings::default(),
            state: StateSettings::default(),
            transport: TransportSettings::default(),
            backfill: BackfillSettings::default(),
            event_retention: RetentionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockchainSettings {
    pub node_addresses: Vec<String>,
    pub minimum_nodes: usize,
}

impl Default for BlockchainSettings {
    fn default() -> Self {
        BlockchainSettings {
            node_addresses: Vec::new(),
            minimum_nodes: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateSettings {
    pub path: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        StateSettings {
            path: PathBuf::from("state.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    pub node_name: String,
    pub bind_address: IpAddr,
    pub bind_port: u16,
    pub peers: Vec<SocketAddr>,
    pub retransmit_multiplier: usize,
    pub use_gossip: bool,
    /// Hex-encoded 32-byte shared key; enables transport encryption.
    pub shared_key: Option<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            node_name: String::new(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 7946,
            peers: Vec::new(),
            retransmit_multiplier: 2,
            use_gossip: true,
            shared_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackfillSettings {
    pub try_unicast_first: bool,
    pub block_poll_interval_secs: u64,
    pub block_fetch_chunk_size: u32,
    pub event_poll_interval_secs: u64,
    pub event_fetch_chunk_size: usize,
    pub new_event_ignore_threshold_secs: u64,
    pub event_retry_interval_secs: u64,
    pub event_max_retries: u32,
    pub multicast_backoff_secs: u64,
    pub unicast_backoff_secs: u64,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        BackfillSettings {
            try_unicast_first: true,
            block_poll_interval_secs: 60,
            block_fetch_chunk_size: 100,
            event_poll_interval_secs: 60,
            event_fetch_chunk_size: 100,
            new_event_ignore_threshold_secs: 300,
            event_retry_interval_secs: 1800,
            event_max_retries: 48,
            multicast_backoff_secs: 5,
            unicast_backoff_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionSettings {
    pub run_at_startup: bool,
    pub scan_interval_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings {
            run_at_startup: false,
            scan_interval_secs: 3600,
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<NodeConfig> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        let config: NodeConfig = toml::from_str(&raw).context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.blockchain.node_addresses.is_empty() {
            bail!("at least one blockchain node address is required");
        }
        if self.transport.node_name.is_empty() {
            bail!("transport.node_name is required");
        }
        if let Some(key) = &self.transport.shared_key {
            let decoded = hex::decode(key).context("transport.shared_key is not valid hex")?;
            if decoded.len() != 32 {
                bail!("transport.shared_key must encode exactly 32 bytes");
            }
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
    }

    pub fn follower_config(&self) -> FollowerConfig {
        FollowerConfig {
            nodes: self.blockchain.node_addresses.clone(),
            ..FollowerConfig::default()
        }
    }

    pub fn gossip_config(&self) -> anyhow::Result<GossipConfig> {
        let shared_key = match &self.transport.shared_key {
            Some(key) => {
                let decoded = hex::decode(key).context("transport.shared_key is not valid hex")?;
                let key: [u8; 32] = decoded
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("transport.shared_key must encode 32 bytes"))?;
                Some(key)
            }
            None => None,
        };

        Ok(GossipConfig {
            node_name: self.transport.node_name.clone(),
            bind_addr: self.transport.bind_address,
            bind_port: self.transport.bind_port,
            peers: self.transport.peers.clone(),
            retransmit_multiplier: self.transport.retransmit_multiplier,
            use_gossip: self.transport.use_gossip,
            shared_key,
            ..GossipConfig::default()
        })
    }

    pub fn backfill_config(&self) -> BackfillConfig {
        BackfillConfig {
            try_unicast_first: self.backfill.try_unicast_first,
            block_poll_interval: Duration::from_secs(self.backfill.block_poll_interval_secs),
            block_fetch_chunk_size: self.backfill.block_fetch_chunk_size,
            event_poll_interval: Duration::from_secs(self.backfill.event_poll_interval_secs),
            event_fetch_chunk_size: self.backfill.event_fetch_chunk_size,
            new_event_ignore_threshold: Duration::from_secs(
                self.backfill.new_event_ignore_threshold_secs,
            ),
            event_retry_interval: Duration::from_secs(self.backfill.event_retry_interval_secs),
            event_max_retries: self.backfill.event_max_retries,
            multicast_backoff: Duration::from_secs(self.backfill.multicast_backoff_secs),
            unicast_backoff: Duration::from_secs(self.backfill.unicast_backoff_secs),
        }
    }

    pub fn retention_config(&self) -> RetentionAgentConfig {
        RetentionAgentConfig {
            scan_interval: Duration::from_secs(self.event_retention.scan_interval_secs),
            run_at_startup: self.event_retention.run_at_startup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config_file() {
        let config: NodeConfig = toml::from_str(
            r#"
            [blockchain]
            node_addresses = ["http://127.0.0.1:26657"]
            minimum_nodes = 2

            [transport]
            node_name = "replica-1"
            bind_port = 7950
            peers = ["10.0.0.2:7950"]

            [backfill]
            event_max_retries = 10
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.blockchain.minimum_nodes, 2);
        assert_eq!(config.transport.bind_port, 7950);
        assert_eq!(config.backfill.event_max_retries, 10);
        // Untouched sections keep their defaults.
        assert_eq!(config.event_retention.scan_interval_secs, 3600);
        assert_eq!(config.backfill.block_fetch_chunk_size, 100);
    }

    #[test]
    fn rejects_missing_required_fields_and_bad_keys() {
        let config = NodeConfig::default();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.blockchain.node_addresses = vec!["http://127.0.0.1:26657".to_string()];
        config.transport.node_name = "replica-1".to_string();
        config.transport.shared_key = Some("abcd".to_string());
        assert!(config.validate().is_err());

        config.transport.shared_key = Some("11".repeat(32));
        assert!(config.validate().is_ok());
    }
}
