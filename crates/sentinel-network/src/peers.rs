//! Peer management
//!
//! Tracks admitted peers, enforces the connection cap, keeps an expiring ban
//! list and the per-peer topic sets used to build gossip meshes.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use tracing::{debug, info};

use crate::error::{PeerError, PeerResult};
use crate::types::PeerId;

/// Default ban duration
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(30 * 60);

/// Protocol faults tolerated before a peer is banned
pub const DEFAULT_FAULT_THRESHOLD: u32 = 3;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Connecting (admission in progress)
    Connecting,
    /// Connected and admitted
    Connected,
    /// Disconnecting
    Disconnecting,
    /// Banned
    Banned,
}

/// Why a connection was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// `max_peers` already reached
    AtCapacity,
    /// Peer already has a record
    AlreadyConnected,
    /// Peer is on the ban list
    Banned,
    /// Connection to ourselves
    SelfConnection,
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Peer admitted
    Accepted,
    /// Peer rejected; the caller terminates the connection
    Rejected(RejectReason),
}

impl Admission {
    /// Whether the peer was admitted
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Peer information
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Peer ID
    pub id: PeerId,
    /// Known addresses
    pub addresses: Vec<SocketAddr>,
    /// Gossip topics the peer announced
    pub topics: HashSet<String>,
    /// Last activity
    pub last_seen: Instant,
    /// Connection state
    pub status: PeerStatus,
    /// Is inbound connection
    pub inbound: bool,
    /// Protocol faults since admission
    pub faults: u32,
}

impl PeerRecord {
    /// Create a record for a newly admitted peer
    pub fn new(id: PeerId, addr: SocketAddr, inbound: bool) -> Self {
        Self {
            id,
            addresses: vec![addr],
            topics: HashSet::new(),
            last_seen: Instant::now(),
            status: PeerStatus::Connected,
            inbound,
            faults: 0,
        }
    }

    /// Update last activity
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// Peer manager configuration
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// Maximum admitted peers
    pub max_peers: usize,
    /// How long a ban lasts
    pub ban_duration: Duration,
    /// Faults before a ban
    pub fault_threshold: u32,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            ban_duration: DEFAULT_BAN_DURATION,
            fault_threshold: DEFAULT_FAULT_THRESHOLD,
        }
    }
}

/// Peer manager
pub struct PeerManager {
    local: PeerId,
    config: PeerManagerConfig,
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    banned: RwLock<HashMap<PeerId, Instant>>,
}

impl PeerManager {
    /// Create new peer manager
    pub fn new(local: PeerId, config: PeerManagerConfig) -> Self {
        Self {
            local,
            config,
            peers: RwLock::new(HashMap::new()),
            banned: RwLock::new(HashMap::new()),
        }
    }

    /// Create with default settings and the given cap
    pub fn with_max_peers(local: PeerId, max_peers: usize) -> Self {
        Self::new(
            local,
            PeerManagerConfig {
                max_peers,
                ..Default::default()
            },
        )
    }

    /// Maximum admitted peers
    pub fn max_peers(&self) -> usize {
        self.config.max_peers
    }

    /// Admit or reject a new connection
    pub fn on_connect(&self, peer_id: PeerId, addr: SocketAddr, inbound: bool) -> Admission {
        if peer_id == self.local {
            return Admission::Rejected(RejectReason::SelfConnection);
        }
        if self.is_banned(&peer_id) {
            debug!("Rejecting banned peer {}", peer_id);
            return Admission::Rejected(RejectReason::Banned);
        }

        let mut peers = self.peers.write();
        if peers.contains_key(&peer_id) {
            return Admission::Rejected(RejectReason::AlreadyConnected);
        }
        if peers.len() >= self.config.max_peers {
            debug!("Rejecting peer {}: at capacity ({})", peer_id, peers.len());
            return Admission::Rejected(RejectReason::AtCapacity);
        }
        peers.insert(peer_id, PeerRecord::new(peer_id, addr, inbound));
        info!(
            "Peer {} admitted at {} ({}), {} connected",
            peer_id,
            addr,
            if inbound { "inbound" } else { "outbound" },
            peers.len()
        );
        Admission::Accepted
    }

    /// Remove a peer; returns whether it was known
    pub fn on_disconnect(&self, peer_id: &PeerId) -> bool {
        let removed = self.peers.write().remove(peer_id).is_some();
        if removed {
            debug!("Peer {} disconnected", peer_id);
        }
        removed
    }

    /// Whether another peer can be admitted
    pub fn has_capacity(&self) -> bool {
        self.peers.read().len() < self.config.max_peers
    }

    /// Pick a random connected peer
    pub fn select_random_peer(&self) -> PeerResult<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|p| p.status == PeerStatus::Connected)
            .map(|p| p.id)
            .choose(&mut rand::thread_rng())
            .ok_or(PeerError::NoPeers)
    }

    /// Ban a peer for `duration` and drop its record
    pub fn ban(&self, peer_id: &PeerId, duration: Duration) {
        self.banned.write().insert(*peer_id, Instant::now() + duration);
        self.peers.write().remove(peer_id);
        info!("Peer {} banned for {:?}", peer_id, duration);
    }

    /// Whether a peer is on the ban list; expired bans are purged
    pub fn is_banned(&self, peer_id: &PeerId) -> bool {
        let expiry = self.banned.read().get(peer_id).copied();
        match expiry {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                self.banned.write().remove(peer_id);
                false
            }
            None => false,
        }
    }

    /// Record a protocol fault; returns `true` if the peer got banned
    pub fn penalize(&self, peer_id: &PeerId) -> bool {
        let faults = {
            let mut peers = self.peers.write();
            match peers.get_mut(peer_id) {
                Some(peer) => {
                    peer.faults += 1;
                    peer.faults
                }
                None => return false,
            }
        };
        debug!("Peer {} fault count {}", peer_id, faults);
        if faults >= self.config.fault_threshold {
            self.ban(peer_id, self.config.ban_duration);
            return true;
        }
        false
    }

    /// Current status; banned peers report `Banned` even without a record
    pub fn status(&self, peer_id: &PeerId) -> Option<PeerStatus> {
        if self.is_banned(peer_id) {
            return Some(PeerStatus::Banned);
        }
        self.peers.read().get(peer_id).map(|p| p.status)
    }

    /// Update peer status
    pub fn set_status(&self, peer_id: &PeerId, status: PeerStatus) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.status = status;
        }
    }

    /// Touch peer (update last activity)
    pub fn touch(&self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.touch();
        }
    }

    /// Record that a peer subscribed to `topic`
    pub fn add_topic(&self, peer_id: &PeerId, topic: &str) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.topics.insert(topic.to_string());
        }
    }

    /// Record that a peer unsubscribed from `topic`
    pub fn remove_topic(&self, peer_id: &PeerId, topic: &str) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.topics.remove(topic);
        }
    }

    /// Replace a peer's topic set
    pub fn set_topics(&self, peer_id: &PeerId, topics: HashSet<String>) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.topics = topics;
        }
    }

    /// Connected peers subscribed to `topic`
    pub fn peers_on_topic(&self, topic: &str) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|p| p.status == PeerStatus::Connected && p.topics.contains(topic))
            .map(|p| p.id)
            .collect()
    }

    /// Get peer record
    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Whether a peer has a record
    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// IDs of connected peers
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|p| p.status == PeerStatus::Connected)
            .map(|p| p.id)
            .collect()
    }

    /// Number of peers with a record
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}
