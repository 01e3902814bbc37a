//! Topic-based gossip
//!
//! The mesh of a topic is the set of connected peers that announced it.
//! Inbound messages on subscribed topics are decompressed, deduplicated by
//! content id, validated and, once accepted, delivered locally and forwarded
//! to the mesh minus the source. Local delivery goes through one bounded
//! queue; overflow drops the newest message.

mod message;
mod seen;
mod topic;

pub use message::{
    compute_message_id, message_id_for_wire, GossipMessage, GossipRpc, MessageId,
    MESSAGE_DOMAIN_INVALID_SNAPPY, MESSAGE_DOMAIN_VALID_SNAPPY,
};
pub use seen::SeenCache;
pub use topic::{topic_name, GossipKind, GossipTopic};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, trace, warn};

use crate::codec::{compress_gossip, GOSSIP_MAX_SIZE};
use crate::error::{GossipError, GossipResult};
use crate::messages::Ssz;
use crate::peers::PeerManager;
use crate::transport::{Stream, Transport};
use crate::types::PeerId;

/// Protocol id of gossip streams
pub const GOSSIP_PROTOCOL: &str = "/meshsub/1.1.0";

/// Room for the RPC envelope around a compressed payload
const RPC_OVERHEAD: usize = 64 * 1024;

/// Validator verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// Deliver and forward
    Accept,
    /// Drop silently
    Ignore,
    /// Drop and penalise the source
    Reject,
}

/// Per-topic message validator
pub type Validator = Arc<dyn Fn(&GossipMessage) -> ValidationResult + Send + Sync>;

/// Validator accepting every message
pub fn accept_all() -> Validator {
    Arc::new(|_| ValidationResult::Accept)
}

/// What happened to an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Accepted, delivered and forwarded
    Delivered,
    /// Already seen inside the dedup window
    Duplicate,
    /// No local subscription for the topic
    NotSubscribed,
    /// Validator ignored it
    Ignored,
    /// Validator rejected it
    Rejected,
    /// Payload failed to decompress
    Invalid,
}

/// Gossip configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Maximum decompressed payload
    pub max_size: usize,
    /// Dedup window capacity
    pub seen_capacity: usize,
    /// Dedup window TTL
    pub seen_ttl: Duration,
    /// Local delivery queue capacity
    pub delivery_capacity: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_size: GOSSIP_MAX_SIZE,
            seen_capacity: 16 * 1024,
            seen_ttl: Duration::from_secs(385),
            delivery_capacity: 1024,
        }
    }
}

/// Returned by [`GossipManager::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: String,
}

impl SubscriptionHandle {
    /// Subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

struct TopicState {
    validator: Validator,
}

struct GossipState {
    topics: HashMap<String, TopicState>,
    seen: SeenCache,
}

/// Gossip manager
pub struct GossipManager {
    local: PeerId,
    config: GossipConfig,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerManager>,
    state: Mutex<GossipState>,
    delivery: Mutex<Option<mpsc::Sender<GossipMessage>>>,
    delivery_closed: AtomicBool,
    delivery_closes: AtomicUsize,
    dropped: AtomicU64,
}

impl GossipManager {
    /// Create a manager sending over `transport`
    pub fn new(config: GossipConfig, transport: Arc<dyn Transport>, peers: Arc<PeerManager>) -> Self {
        let state = GossipState {
            topics: HashMap::new(),
            seen: SeenCache::new(config.seen_capacity, config.seen_ttl),
        };
        Self {
            local: transport.local_peer_id(),
            config,
            transport,
            peers,
            state: Mutex::new(state),
            delivery: Mutex::new(None),
            delivery_closed: AtomicBool::new(false),
            delivery_closes: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to `topic`; one active subscription per topic
    pub fn subscribe(&self, topic: &str, validator: Validator) -> GossipResult<SubscriptionHandle> {
        if self.delivery_closed.load(Ordering::SeqCst) {
            return Err(GossipError::Closed);
        }
        {
            let mut state = self.state.lock();
            if state.topics.contains_key(topic) {
                return Err(GossipError::AlreadySubscribed(topic.to_string()));
            }
            state
                .topics
                .insert(topic.to_string(), TopicState { validator });
        }
        info!("Subscribed to {}", topic);
        self.announce(GossipRpc::Subscribe {
            topics: vec![topic.to_string()],
        });
        Ok(SubscriptionHandle {
            topic: topic.to_string(),
        })
    }

    /// Leave `topic`
    pub fn unsubscribe(&self, topic: &str) -> GossipResult<()> {
        if self.state.lock().topics.remove(topic).is_none() {
            return Err(GossipError::NotSubscribed(topic.to_string()));
        }
        info!("Unsubscribed from {}", topic);
        self.announce(GossipRpc::Unsubscribe {
            topics: vec![topic.to_string()],
        });
        Ok(())
    }

    /// Leave every topic; returns how many were active
    pub fn unsubscribe_all(&self) -> usize {
        let mut topics: Vec<String> = self.state.lock().topics.drain().map(|(t, _)| t).collect();
        let count = topics.len();
        if count > 0 {
            topics.sort();
            debug!("Unsubscribed from {} topics", count);
            self.announce(GossipRpc::Unsubscribe { topics });
        }
        count
    }

    /// Whether `topic` has an active subscription
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    /// Active topics
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of mesh peers on `topic`
    pub fn topic_peer_count(&self, topic: &str) -> usize {
        self.peers.peers_on_topic(topic).len()
    }

    /// Start a fresh delivery stream; a previous stream ends
    pub fn events(&self) -> ReceiverStream<GossipMessage> {
        let (tx, rx) = mpsc::channel(self.config.delivery_capacity.max(1));
        if !self.delivery_closed.load(Ordering::SeqCst) {
            *self.delivery.lock() = Some(tx);
        }
        ReceiverStream::new(rx)
    }

    /// Close the delivery queue; only the first call has an effect
    pub fn close_delivery(&self) -> bool {
        if self.delivery_closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.delivery.lock().take();
        self.delivery_closes.fetch_add(1, Ordering::SeqCst);
        debug!("Gossip delivery queue closed");
        true
    }

    /// How many times the delivery queue was closed
    pub fn delivery_closes(&self) -> usize {
        self.delivery_closes.load(Ordering::SeqCst)
    }

    /// Messages dropped at a full delivery queue
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Broadcast `data` on `topic`
    ///
    /// Best effort: no delivery guarantee to the mesh. The id is recorded so
    /// echoes are dropped; publishing identical content twice inside the
    /// dedup window fails with [`GossipError::Duplicate`].
    pub fn publish(&self, topic: &str, data: &[u8]) -> GossipResult<MessageId> {
        if self.delivery_closed.load(Ordering::SeqCst) {
            return Err(GossipError::Closed);
        }
        if data.len() > self.config.max_size {
            return Err(GossipError::MessageTooLarge {
                size: data.len(),
                max: self.config.max_size,
            });
        }
        let compressed = compress_gossip(data, self.config.max_size)
            .map_err(|e| GossipError::Compression(e.to_string()))?;
        let id = compute_message_id(MESSAGE_DOMAIN_VALID_SNAPPY, topic, data);

        let subscribed = {
            let mut state = self.state.lock();
            if !state.seen.insert(id) {
                return Err(GossipError::Duplicate);
            }
            state.topics.contains_key(topic)
        };
        if subscribed {
            self.deliver(GossipMessage {
                topic: topic.to_string(),
                data: Bytes::copy_from_slice(data),
                source: self.local,
                id,
            });
        }

        let mesh = self.peers.peers_on_topic(topic);
        trace!("Publishing {} bytes on {} to {} peers", data.len(), topic, mesh.len());
        let rpc = GossipRpc::Publish {
            topic: topic.to_string(),
            data: compressed,
        };
        for peer in mesh {
            self.send_rpc(peer, rpc.clone());
        }
        Ok(id)
    }

    /// Handle one inbound RPC from `source`
    pub fn handle_rpc(&self, source: PeerId, rpc: GossipRpc) -> Option<InboundOutcome> {
        match rpc {
            GossipRpc::Subscribe { topics } => {
                for topic in &topics {
                    self.peers.add_topic(&source, topic);
                }
                None
            }
            GossipRpc::Unsubscribe { topics } => {
                for topic in &topics {
                    self.peers.remove_topic(&source, topic);
                }
                None
            }
            GossipRpc::Publish { topic, data } => Some(self.handle_publish(source, topic, data)),
        }
    }

    fn handle_publish(&self, source: PeerId, topic: String, compressed: Bytes) -> InboundOutcome {
        let validator = self
            .state
            .lock()
            .topics
            .get(&topic)
            .map(|t| t.validator.clone());
        let Some(validator) = validator else {
            return InboundOutcome::NotSubscribed;
        };

        let (id, data) = message_id_for_wire(&topic, &compressed, self.config.max_size);
        let Some(data) = data else {
            debug!("Undecodable gossip on {} from {}", topic, source);
            self.peers.penalize(&source);
            return InboundOutcome::Invalid;
        };
        if !self.state.lock().seen.insert(id) {
            return InboundOutcome::Duplicate;
        }

        let message = GossipMessage {
            topic,
            data,
            source,
            id,
        };
        match validator(&message) {
            ValidationResult::Accept => {
                let rpc = GossipRpc::Publish {
                    topic: message.topic.clone(),
                    data: compressed,
                };
                for peer in self.peers.peers_on_topic(&message.topic) {
                    if peer != source {
                        self.send_rpc(peer, rpc.clone());
                    }
                }
                self.deliver(message);
                InboundOutcome::Delivered
            }
            ValidationResult::Ignore => InboundOutcome::Ignored,
            ValidationResult::Reject => {
                debug!("Rejected gossip on {} from {}", message.topic, source);
                self.peers.penalize(&source);
                InboundOutcome::Rejected
            }
        }
    }

    fn deliver(&self, message: GossipMessage) {
        let delivery = self.delivery.lock();
        let Some(tx) = delivery.as_ref() else {
            return;
        };
        match tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Gossip delivery queue full, dropped message on {} ({} dropped total)",
                    message.topic, dropped
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Gossip consumer gone");
            }
        }
    }

    /// Tell a newly connected peer which topics we are on
    pub fn on_peer_connected(&self, peer: PeerId) {
        let topics = self.topics();
        if !topics.is_empty() {
            self.send_rpc(peer, GossipRpc::Subscribe { topics });
        }
    }

    fn announce(&self, rpc: GossipRpc) {
        for peer in self.peers.connected_peers() {
            self.send_rpc(peer, rpc.clone());
        }
    }

    fn max_frame_len(&self) -> usize {
        snap::raw::max_compress_len(self.config.max_size).max(self.config.max_size) + RPC_OVERHEAD
    }

    fn send_rpc(&self, peer: PeerId, rpc: GossipRpc) {
        let transport = self.transport.clone();
        let max_frame_len = self.max_frame_len();
        tokio::spawn(async move {
            let result = async {
                let stream = transport.open_stream(&peer, GOSSIP_PROTOCOL).await?;
                let codec = LengthDelimitedCodec::builder()
                    .max_frame_length(max_frame_len)
                    .new_codec();
                let mut framed = FramedWrite::new(stream, codec);
                framed.send(rpc.to_ssz_bytes()).await?;
                SinkExt::<Bytes>::close(&mut framed).await?;
                Ok::<_, crate::error::TransportError>(())
            }
            .await;
            if let Err(e) = result {
                debug!("Failed to send gossip rpc to {}: {}", peer, e);
            }
        });
    }

    /// Read RPCs from an inbound gossip stream until it closes
    pub async fn handle_stream(&self, stream: Stream) {
        let source = stream.peer();
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.max_frame_len())
            .new_codec();
        let mut framed = FramedRead::new(stream, codec);
        while let Some(frame) = framed.next().await {
            let rpc = match frame {
                Ok(bytes) => GossipRpc::ssz_decode(&bytes),
                Err(e) => {
                    debug!("Gossip stream from {} failed: {}", source, e);
                    self.peers.penalize(&source);
                    return;
                }
            };
            match rpc {
                Ok(rpc) => {
                    self.peers.touch(&source);
                    if let Some(outcome) = self.handle_rpc(source, rpc) {
                        trace!("Gossip from {}: {:?}", source, outcome);
                    }
                }
                Err(e) => {
                    debug!("Malformed gossip rpc from {}: {}", source, e);
                    self.peers.penalize(&source);
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for GossipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipManager")
            .field("local", &self.local)
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}
