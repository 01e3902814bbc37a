//! UDP peer discovery
//!
//! - [`NodeIdentity`]: secp256k1 key and derived node id
//! - [`NodeRecord`]: signed endpoint record, `enr:<hex>` text form
//! - [`RoutingTable`]: 256 k-buckets by log2 XOR distance
//! - [`Lookup`]: iterative closest-node search
//! - [`Discovery`]: UDP service answering `Ping` and `FindNode`

mod identity;
mod lookup;
mod packet;
mod record;
mod service;
mod table;

pub use identity::NodeIdentity;
pub use lookup::{FindNode, Lookup, LookupConfig, LookupResult, LookupState, Termination};
pub use packet::{Packet, PacketBody, MAX_PACKET_SIZE, RECORDS_PER_PACKET};
pub use record::{
    NodeRecord, CAP_GOSSIP, CAP_LIGHT_CLIENT, CAP_REQRESP, MAX_RECORD_SIZE, RECORD_PREFIX,
};
pub use service::Discovery;
pub use table::{InsertOutcome, RoutingTable, DEFAULT_BUCKET_SIZE, NUM_BUCKETS};

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Advertised IP address (IPv4 or IPv6)
    pub addr: String,
    /// UDP port; 0 picks a free port
    pub udp_port: u16,
    /// Advertised transport port
    pub tcp_port: u16,
    /// Hex private key; a fresh key is generated when absent
    pub private_key: Option<String>,
    /// Seed records in `enr:` form
    pub bootnodes: Vec<String>,
    /// Capability flags advertised in the local record
    pub capabilities: u64,
    /// Routing table bucket size
    pub bucket_size: usize,
    /// Lookup parameters
    pub lookup: LookupConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            udp_port: 7777,
            tcp_port: 4000,
            private_key: None,
            bootnodes: Vec::new(),
            capabilities: CAP_GOSSIP | CAP_REQRESP | CAP_LIGHT_CLIENT,
            bucket_size: DEFAULT_BUCKET_SIZE,
            lookup: LookupConfig::default(),
        }
    }
}
