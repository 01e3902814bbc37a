//! Sentinel orchestrator
//!
//! Wires discovery, transport, peer admission, gossip and request/response
//! together and owns the background tasks:
//!
//! - discovery receive loop and random-walk loop
//! - transport event loop (admission, inbound stream dispatch)
//! - periodic liveness ping
//!
//! Shutdown runs strictly in order: stop discovery, say goodbye to peers,
//! close streams and wait for the open-stream gauge to drain, unsubscribe
//! every topic, close the delivery queue.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SentinelConfig;
use crate::discovery::{Discovery, NodeRecord, CAP_REQRESP};
use crate::error::{SentinelError, SentinelResult};
use crate::gossip::{
    accept_all, topic_name, GossipKind, GossipManager, GossipMessage, MessageId, SubscriptionHandle,
    Validator, GOSSIP_PROTOCOL,
};
use crate::messages::{Goodbye, Status};
use crate::peers::{Admission, PeerManager, RejectReason};
use crate::reqresp::{ChainStateProvider, ReqResp, StaticChainState};
use crate::transport::{TcpTransport, Transport, TransportEvent};
use crate::types::PeerId;

/// A step of the shutdown sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Discovery loops stopped
    DiscoveryStopped,
    /// Streams closed and transport shut
    StreamsClosed,
    /// All topics unsubscribed
    TopicsUnsubscribed,
    /// Delivery queue closed
    DeliveryClosed,
}

/// Outcome of [`Sentinel::shutdown`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Steps in the order they completed
    pub steps: Vec<ShutdownStep>,
    /// Streams still open when the drain deadline hit
    pub leaked_streams: usize,
    /// Topics that were active
    pub topics_unsubscribed: usize,
    /// Total delivery-queue closes over the lifetime of the node
    pub delivery_closes: usize,
}

struct Shared {
    config: SentinelConfig,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerManager>,
    gossip: Arc<GossipManager>,
    reqresp: Arc<ReqResp>,
    discovery: Discovery,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Tasks {
    discovery: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

/// Networking layer of the light client
pub struct Sentinel {
    shared: Arc<Shared>,
    discovery_cancel: CancellationToken,
    running: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Tasks>,
}

fn wildcard(addr: &str) -> IpAddr {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

impl Sentinel {
    /// Bind discovery and a TCP transport
    pub async fn new(config: SentinelConfig, chain: Arc<dyn ChainStateProvider>) -> SentinelResult<Self> {
        let cancel = CancellationToken::new();
        let discovery = Discovery::bind(config.discovery_config()).await?;
        let listen = SocketAddr::new(wildcard(&config.addr), config.tcp_port);
        let transport = TcpTransport::bind(listen, discovery.local_id(), cancel.child_token()).await?;
        Self::assemble(config, chain, discovery, Arc::new(transport), cancel)
    }

    /// Bind discovery and use a transport built for the local peer id
    pub async fn with_transport<F>(
        config: SentinelConfig,
        chain: Arc<dyn ChainStateProvider>,
        make_transport: F,
    ) -> SentinelResult<Self>
    where
        F: FnOnce(PeerId) -> Arc<dyn Transport>,
    {
        let discovery = Discovery::bind(config.discovery_config()).await?;
        let transport = make_transport(discovery.local_id());
        if transport.local_peer_id() != discovery.local_id() {
            return Err(SentinelError::Config(
                "transport peer id differs from node id".into(),
            ));
        }
        Self::assemble(config, chain, discovery, transport, CancellationToken::new())
    }

    /// Default chain state derived from the chain config
    pub fn static_chain_state(config: &SentinelConfig) -> Arc<StaticChainState> {
        Arc::new(StaticChainState::new(Status {
            fork_digest: config.chain.fork_digest,
            ..Default::default()
        }))
    }

    fn assemble(
        config: SentinelConfig,
        chain: Arc<dyn ChainStateProvider>,
        discovery: Discovery,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> SentinelResult<Self> {
        let tcp_port = transport.listen_addr().port();
        if discovery.local_record().tcp_addr().port() != tcp_port {
            discovery.set_tcp_port(tcp_port)?;
        }

        let peers = Arc::new(PeerManager::new(
            transport.local_peer_id(),
            config.peer_manager_config(),
        ));
        let gossip = Arc::new(GossipManager::new(
            config.gossip_config(),
            transport.clone(),
            peers.clone(),
        ));
        let reqresp = Arc::new(ReqResp::new(
            config.reqresp_config(),
            transport.clone(),
            peers.clone(),
            chain,
            cancel.child_token(),
        ));
        let discovery_cancel = cancel.child_token();

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                peers,
                gossip,
                reqresp,
                discovery,
                cancel,
            }),
            discovery_cancel,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    /// Start background tasks and subscribe the configured topics
    pub async fn start(&self) -> SentinelResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SentinelError::NotRunning);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SentinelError::AlreadyRunning);
        }
        let events = self
            .shared
            .transport
            .take_events()
            .ok_or_else(|| SentinelError::Config("transport events already taken".into()))?;

        for kind in &self.shared.config.topics {
            self.subscribe(&self.topic(*kind), accept_all())?;
        }

        let mut tasks = self.tasks.lock();
        tasks
            .discovery
            .push(self.shared.discovery.start(self.discovery_cancel.clone()));
        tasks.discovery.push(tokio::spawn(discovery_loop(
            self.shared.clone(),
            self.discovery_cancel.clone(),
        )));
        tasks
            .background
            .push(tokio::spawn(event_loop(self.shared.clone(), events)));
        tasks
            .background
            .push(tokio::spawn(ping_loop(self.shared.clone())));

        info!(
            "Sentinel started as {} ({})",
            self.local_peer_id(),
            self.local_record()
        );
        Ok(())
    }

    /// Whether [`Sentinel::start`] ran and shutdown has not
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Local peer id
    pub fn local_peer_id(&self) -> PeerId {
        self.shared.transport.local_peer_id()
    }

    /// Local record in `enr:` form
    pub fn local_record(&self) -> String {
        self.shared.discovery.local_record().to_text()
    }

    /// Admitted peer count
    pub fn peer_count(&self) -> usize {
        self.shared.peers.peer_count()
    }

    /// Whether at least `n` peers are admitted
    pub fn has_min_peers(&self, n: usize) -> bool {
        self.peer_count() >= n
    }

    /// Whether the peer cap is reached
    pub fn has_too_many_peers(&self) -> bool {
        !self.shared.peers.has_capacity()
    }

    /// Topic string for `kind` on the configured fork
    pub fn topic(&self, kind: GossipKind) -> String {
        topic_name(&self.shared.config.chain.fork_digest, kind)
    }

    /// Mesh size of `topic`
    pub fn topic_peer_count(&self, topic: &str) -> usize {
        self.shared.gossip.topic_peer_count(topic)
    }

    /// Fresh gossip delivery stream; a previous stream ends
    pub fn gossip_events(&self) -> ReceiverStream<GossipMessage> {
        self.shared.gossip.events()
    }

    /// Subscribe to `topic`
    pub fn subscribe(&self, topic: &str, validator: Validator) -> SentinelResult<SubscriptionHandle> {
        Ok(self.shared.gossip.subscribe(topic, validator)?)
    }

    /// Publish on `topic`
    pub fn publish(&self, topic: &str, data: &[u8]) -> SentinelResult<MessageId> {
        Ok(self.shared.gossip.publish(topic, data)?)
    }

    /// Dial `peer` at `addr` and run admission
    pub async fn dial(&self, peer: PeerId, addr: SocketAddr) -> SentinelResult<Admission> {
        Ok(self.shared.dial(peer, addr).await?)
    }

    /// Peer manager
    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.shared.peers
    }

    /// Gossip manager
    pub fn gossip(&self) -> &Arc<GossipManager> {
        &self.shared.gossip
    }

    /// Request/response handler
    pub fn reqresp(&self) -> &Arc<ReqResp> {
        &self.shared.reqresp
    }

    /// Discovery service
    pub fn discovery(&self) -> &Discovery {
        &self.shared.discovery
    }

    /// Transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Stop everything in order
    ///
    /// Calling it again is a no-op returning an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport {
            steps: Vec::new(),
            leaked_streams: 0,
            topics_unsubscribed: 0,
            delivery_closes: self.shared.gossip.delivery_closes(),
        };
        if self.stopped.swap(true, Ordering::SeqCst) {
            return report;
        }
        info!("Shutting down sentinel");

        let (discovery_tasks, background_tasks) = {
            let mut tasks = self.tasks.lock();
            (
                std::mem::take(&mut tasks.discovery),
                std::mem::take(&mut tasks.background),
            )
        };

        self.discovery_cancel.cancel();
        for task in discovery_tasks {
            if let Err(e) = task.await {
                warn!("Discovery task ended abnormally: {}", e);
            }
        }
        report.steps.push(ShutdownStep::DiscoveryStopped);

        let shared = &self.shared;
        shared.say_goodbye().await;
        shared.cancel.cancel();
        shared.transport.close();
        let tracker = shared.transport.tracker();
        if !tracker.wait_idle(shared.config.shutdown_timeout).await {
            warn!("{} streams still open after {:?}", tracker.open_streams(), shared.config.shutdown_timeout);
        }
        report.leaked_streams = tracker.open_streams();
        for task in background_tasks {
            task.abort();
        }
        report.steps.push(ShutdownStep::StreamsClosed);

        report.topics_unsubscribed = shared.gossip.unsubscribe_all();
        report.steps.push(ShutdownStep::TopicsUnsubscribed);

        shared.gossip.close_delivery();
        report.delivery_closes = shared.gossip.delivery_closes();
        report.steps.push(ShutdownStep::DeliveryClosed);

        info!("Sentinel stopped");
        report
    }
}

impl std::fmt::Debug for Sentinel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sentinel")
            .field("peer_id", &self.local_peer_id())
            .field("peers", &self.peer_count())
            .finish_non_exhaustive()
    }
}

impl Shared {
    async fn dial(&self, peer: PeerId, addr: SocketAddr) -> Result<Admission, crate::error::TransportError> {
        if self.transport.is_connected(&peer) {
            return Ok(Admission::Rejected(RejectReason::AlreadyConnected));
        }
        self.transport.connect(peer, addr).await?;
        let admission = self.peers.on_connect(peer, addr, false);
        self.after_admission(peer, &admission);
        Ok(admission)
    }

    fn after_admission(&self, peer: PeerId, admission: &Admission) {
        match admission {
            Admission::Accepted => self.gossip.on_peer_connected(peer),
            Admission::Rejected(RejectReason::AlreadyConnected) => {}
            Admission::Rejected(reason) => {
                debug!("Dropping peer {}: {:?}", peer, reason);
                let code = match reason {
                    RejectReason::Banned => Goodbye::BANNED,
                    _ => Goodbye::TOO_MANY_PEERS,
                };
                let transport = self.transport.clone();
                let reqresp = self.reqresp.clone();
                tokio::spawn(async move {
                    if let Err(e) = reqresp.goodbye(&peer, code).await {
                        debug!("Goodbye to {} failed: {}", peer, e);
                    }
                    transport.disconnect(&peer);
                });
            }
        }
    }

    /// Tell every admitted peer we are leaving, bounded by the shutdown timeout
    async fn say_goodbye(&self) {
        let peers = self.peers.connected_peers();
        if peers.is_empty() {
            return;
        }
        let farewells = peers
            .iter()
            .map(|peer| self.reqresp.goodbye(peer, Goodbye::CLIENT_SHUTDOWN));
        match tokio::time::timeout(self.config.shutdown_timeout, join_all(farewells)).await {
            Ok(results) => {
                for (peer, result) in peers.iter().zip(results) {
                    if let Err(e) = result {
                        debug!("Goodbye to {} failed: {}", peer, e);
                    }
                }
            }
            Err(_) => warn!("Goodbye to {} peers timed out", peers.len()),
        }
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, addr } => {
                let admission = self.peers.on_connect(peer, addr, true);
                self.after_admission(peer, &admission);
            }
            TransportEvent::Disconnected(peer) => {
                self.peers.on_disconnect(&peer);
            }
            TransportEvent::InboundStream(stream) => {
                let peer = stream.peer();
                if !self.peers.has_peer(&peer) {
                    debug!("Ignoring {} stream from unadmitted {}", stream.protocol(), peer);
                    return;
                }
                let shared = self.clone();
                if stream.protocol() == GOSSIP_PROTOCOL {
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shared.cancel.cancelled() => {}
                            _ = shared.gossip.handle_stream(stream) => {}
                        }
                    });
                } else {
                    tokio::spawn(async move { shared.reqresp.handle_inbound(stream).await });
                }
            }
        }
    }
}

async fn event_loop(shared: Arc<Shared>, mut events: mpsc::Receiver<TransportEvent>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => shared.handle_event(event),
                None => break,
            },
        }
    }
    debug!("Transport event loop stopped");
}

async fn discovery_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let seeds = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Discovery loop stopped during bootstrap");
            return;
        }
        seeds = shared.discovery.bootstrap() => seeds,
    };
    if seeds == 0 && !shared.config.chain.bootnodes.is_empty() {
        warn!("No seed answered; discovery relies on inbound pings");
    }

    let mut interval = tokio::time::interval(shared.config.discovery_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if !shared.peers.has_capacity() {
                    continue;
                }
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = shared.discovery.random_walk() => result,
                };
                connect_candidates(&shared, result.nodes, &cancel).await;
            }
        }
    }
    debug!("Discovery loop stopped");
}

async fn connect_candidates(shared: &Arc<Shared>, candidates: Vec<NodeRecord>, cancel: &CancellationToken) {
    for record in candidates {
        if cancel.is_cancelled() || !shared.peers.has_capacity() {
            break;
        }
        let peer = record.node_id();
        if !record.has_capability(CAP_REQRESP)
            || shared.peers.has_peer(&peer)
            || shared.peers.is_banned(&peer)
        {
            continue;
        }
        match shared.dial(peer, record.tcp_addr()).await {
            Ok(admission) => debug!("Dialed {}: {:?}", peer, admission),
            Err(e) => debug!("Failed to dial {} at {}: {}", peer, record.tcp_addr(), e),
        }
    }
}

async fn ping_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.ping_interval);
    // first tick fires immediately
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => {
                if shared.peers.peer_count() == 0 {
                    continue;
                }
                // an unreachable peer is dropped inside the exchange
                if let Err(e) = shared.reqresp.ping_random_peer().await {
                    debug!("Liveness ping failed: {}", e);
                }
            }
        }
    }
}

