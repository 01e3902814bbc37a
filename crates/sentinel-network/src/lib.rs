//! # sentinel-network
//!
//! Peer-to-peer networking layer of a beacon-chain light client.
//!
//! This crate provides:
//! - Snappy-compressed, varint-framed request/response codec
//! - UDP discovery with signed node records and iterative lookups
//! - Bounded peer admission with bans
//! - Topic gossip with content-id dedup and validation
//! - Request/response protocols (ping, status, metadata, goodbye, blocks by range)
//!
//! ## Architecture
//!
//! ```text
//! +-------------------+
//! |     Sentinel      |  <- Orchestrator, owns background tasks
//! +-------------------+
//!     |          |
//! +--------+ +-----------+
//! |Discovery| | Transport |  <- UDP lookups / stream transport
//! +--------+ +-----------+
//!                 |
//! +-------------------+
//! |   PeerManager     |  <- Admission, bans, topic mesh
//! +-------------------+
//!     |          |
//! +--------+ +-----------+
//! | Gossip | |  ReqResp  |  <- Broadcast / point-to-point
//! +--------+ +-----------+
//!                 |
//! +-------------------+
//! |      Codec        |  <- Frames on every stream
//! +-------------------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use sentinel_network::{Sentinel, SentinelConfig, GossipKind};
//!
//! let config = SentinelConfig::default();
//! let chain = Sentinel::static_chain_state(&config);
//! let sentinel = Sentinel::new(config, chain).await?;
//! sentinel.start().await?;
//!
//! let mut events = sentinel.gossip_events();
//! while let Some(msg) = events.next().await {
//!     println!("{} bytes on {}", msg.data.len(), msg.topic);
//! }
//!
//! sentinel.shutdown().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
mod config;
pub mod discovery;
mod error;
pub mod gossip;
pub mod messages;
pub mod peers;
pub mod reqresp;
mod sentinel;
pub mod transport;
mod types;

pub use codec::{ResponseCode, GOSSIP_MAX_SIZE, MAX_CHUNK_SIZE};
pub use config::{ChainConfig, SentinelConfig};
pub use discovery::{Discovery, DiscoveryConfig, NodeIdentity, NodeRecord};
pub use error::{
    CodecError, CodecResult, DiscoveryError, DiscoveryResult, GossipError, GossipResult,
    PeerError, PeerResult, ReqRespError, ReqRespResult, SentinelError, SentinelResult,
    TransportError, TransportResult,
};
pub use gossip::{
    accept_all, GossipConfig, GossipKind, GossipManager, GossipMessage, MessageId,
    SubscriptionHandle, ValidationResult, Validator,
};
pub use messages::ProtocolMessage;
pub use peers::{Admission, PeerManager, PeerManagerConfig, RejectReason};
pub use reqresp::{ChainStateProvider, Protocol, ReqResp, ReqRespConfig, StaticChainState};
pub use sentinel::{Sentinel, ShutdownReport, ShutdownStep};
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, Transport};
pub use types::{ForkDigest, NodeId, PeerId, Root};
