//! Sentinel configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{GOSSIP_MAX_SIZE, MAX_CHUNK_SIZE};
use crate::discovery::{DiscoveryConfig, LookupConfig, CAP_GOSSIP, CAP_LIGHT_CLIENT, CAP_REQRESP};
use crate::error::{SentinelError, SentinelResult};
use crate::gossip::{GossipConfig, GossipKind};
use crate::peers::PeerManagerConfig;
use crate::reqresp::ReqRespConfig;
use crate::types::ForkDigest;

/// Chain constants the networking layer needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Current fork digest, hex encoded in JSON
    #[serde(with = "hex_digest")]
    pub fork_digest: ForkDigest,
    /// Maximum decompressed gossip payload
    pub gossip_max_size: usize,
    /// Maximum uncompressed request/response chunk
    pub max_chunk_size: usize,
    /// Seed records in `enr:` form
    pub bootnodes: Vec<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            fork_digest: [0u8; 4],
            gossip_max_size: GOSSIP_MAX_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            bootnodes: Vec::new(),
        }
    }
}

impl ChainConfig {
    /// Parse from JSON
    pub fn from_json(json: &str) -> SentinelResult<Self> {
        serde_json::from_str(json).map_err(|e| SentinelError::Config(e.to_string()))
    }
}

mod hex_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use crate::types::ForkDigest;

    pub fn serialize<S: Serializer>(digest: &ForkDigest, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(digest)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ForkDigest, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("fork digest must be 4 bytes"))
    }
}

/// Sentinel configuration
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Advertised IP address
    pub addr: String,
    /// Discovery UDP port
    pub port: u16,
    /// Transport TCP port
    pub tcp_port: u16,
    /// Maximum admitted peers
    pub max_peers: usize,
    /// Hex private key; generated when absent
    pub private_key: Option<String>,
    /// Chain constants
    pub chain: ChainConfig,
    /// Extra seed records on top of the chain config ones
    pub bootnodes: Vec<String>,
    /// Topics subscribed at start
    pub topics: Vec<GossipKind>,
    /// Pause between discovery random walks
    pub discovery_interval: Duration,
    /// Pause between liveness pings
    pub ping_interval: Duration,
    /// Bound on waiting for open streams at shutdown
    pub shutdown_timeout: Duration,
    /// Request/response timeouts
    pub reqresp: ReqRespConfig,
    /// Lookup parameters
    pub lookup: LookupConfig,
    /// Peer manager settings (`max_peers` is taken from this struct)
    pub peer_manager: PeerManagerConfig,
    /// Gossip settings (`max_size` is taken from the chain config)
    pub gossip: GossipConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            port: 7777,
            tcp_port: 4000,
            max_peers: 80,
            private_key: None,
            chain: ChainConfig::default(),
            bootnodes: Vec::new(),
            topics: GossipKind::ALL.to_vec(),
            discovery_interval: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            reqresp: ReqRespConfig::default(),
            lookup: LookupConfig::default(),
            peer_manager: PeerManagerConfig::default(),
            gossip: GossipConfig::default(),
        }
    }
}

impl SentinelConfig {
    pub(crate) fn discovery_config(&self) -> DiscoveryConfig {
        let mut bootnodes = self.chain.bootnodes.clone();
        bootnodes.extend(self.bootnodes.iter().cloned());
        DiscoveryConfig {
            addr: self.addr.clone(),
            udp_port: self.port,
            tcp_port: self.tcp_port,
            private_key: self.private_key.clone(),
            bootnodes,
            capabilities: CAP_GOSSIP | CAP_REQRESP | CAP_LIGHT_CLIENT,
            bucket_size: self.lookup.k,
            lookup: self.lookup.clone(),
        }
    }

    pub(crate) fn peer_manager_config(&self) -> PeerManagerConfig {
        PeerManagerConfig {
            max_peers: self.max_peers,
            ..self.peer_manager.clone()
        }
    }

    pub(crate) fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            max_size: self.chain.gossip_max_size,
            ..self.gossip.clone()
        }
    }

    pub(crate) fn reqresp_config(&self) -> ReqRespConfig {
        ReqRespConfig {
            max_chunk_size: self.chain.max_chunk_size,
            ..self.reqresp.clone()
        }
    }
}
