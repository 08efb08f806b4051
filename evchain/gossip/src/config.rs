use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Transport tuning. Defaults suit a LAN deployment.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Unique name of this replica inside the cluster.
    pub node_name: String,
    pub bind_addr: IpAddr,
    /// Port shared by the UDP gossip socket and the TCP unicast listener.
    /// Zero picks an ephemeral port.
    pub bind_port: u16,
    /// Address advertised to peers; defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
    /// Seed peers to join through.
    pub peers: Vec<SocketAddr>,
    /// Scales both retransmissions and per-tick gossip fan-out.
    pub retransmit_multiplier: usize,
    /// When false, broadcast falls back to one reliable unicast per member.
    pub use_gossip: bool,
    /// Optional 32-byte key; when set, every packet is sealed with
    /// ChaCha20-Poly1305.
    pub shared_key: Option<[u8; 32]>,
    /// Maximum UDP datagram size budget, including transport overhead.
    pub mtu: usize,
    pub gossip_interval: Duration,
    pub probe_interval: Duration,
    /// A member silent for this long is suspect; twice this long, removed.
    pub suspicion_timeout: Duration,
    /// Cadence of the stale-stream prune sweep.
    pub prune_interval: Duration,
    /// Streams with no traffic for this long are dropped by the sweep.
    pub wait_timeout: Duration,
    pub join_retry_interval: Duration,
    pub unicast_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            node_name: String::new(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 7946,
            advertise_addr: None,
            peers: Vec::new(),
            retransmit_multiplier: 2,
            use_gossip: true,
            shared_key: None,
            mtu: 1400,
            gossip_interval: Duration::from_millis(200),
            probe_interval: Duration::from_secs(1),
            suspicion_timeout: Duration::from_secs(6),
            prune_interval: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(10),
            join_retry_interval: Duration::from_secs(10),
            unicast_timeout: Duration::from_secs(10),
        }
    }
}
