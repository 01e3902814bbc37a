//! Discovery service

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::identity::NodeIdentity;
use super::lookup::{FindNode, Lookup, LookupResult};
use super::packet::{Packet, PacketBody, MAX_PACKET_SIZE};
use super::record::NodeRecord;
use super::table::RoutingTable;
use super::DiscoveryConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::NodeId;

struct PendingRequest {
    peer: SocketAddr,
    tx: mpsc::Sender<PacketBody>,
}

struct DiscoveryInner {
    identity: NodeIdentity,
    config: DiscoveryConfig,
    socket: UdpSocket,
    local_record: RwLock<NodeRecord>,
    table: RwLock<RoutingTable>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_request_id: AtomicU64,
    bootnodes: Vec<NodeRecord>,
}

/// Discovery service handle
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

fn advertised_ip(addr: &str) -> DiscoveryResult<IpAddr> {
    let ip: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| DiscoveryError::InvalidAddress(addr.to_string()))?;
    if ip.is_unspecified() || ip.is_multicast() {
        return Err(DiscoveryError::InvalidAddress(addr.to_string()));
    }
    Ok(ip)
}

impl Discovery {
    /// Validate configuration, bind the UDP socket and sign the local record
    ///
    /// Bad addresses, bind failures and malformed seed records are fatal.
    pub async fn bind(config: DiscoveryConfig) -> DiscoveryResult<Self> {
        let ip = advertised_ip(&config.addr)?;
        let bootnodes = config
            .bootnodes
            .iter()
            .map(|s| s.parse::<NodeRecord>())
            .collect::<DiscoveryResult<Vec<_>>>()?;

        let identity = match &config.private_key {
            Some(hex) => NodeIdentity::from_hex(hex)?,
            None => NodeIdentity::generate(),
        };

        let bind_ip = match ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, config.udp_port))
            .await
            .map_err(DiscoveryError::Bind)?;
        let udp_port = socket.local_addr()?.port();

        let record = NodeRecord::signed(
            &identity,
            1,
            ip,
            udp_port,
            config.tcp_port,
            config.capabilities,
        )?;
        info!(
            "Discovery bound on {}:{} as {}",
            bind_ip,
            udp_port,
            identity.node_id()
        );

        Ok(Self {
            inner: Arc::new(DiscoveryInner {
                table: RwLock::new(RoutingTable::new(identity.node_id(), config.bucket_size)),
                identity,
                config,
                socket,
                local_record: RwLock::new(record),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(rand::random()),
                bootnodes,
            }),
        })
    }

    /// Local node id
    pub fn local_id(&self) -> NodeId {
        self.inner.identity.node_id()
    }

    /// Current signed local record
    pub fn local_record(&self) -> NodeRecord {
        self.inner.local_record.read().clone()
    }

    /// Actual UDP address the socket is bound to
    pub fn local_addr(&self) -> DiscoveryResult<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Re-sign the local record with a new transport port
    pub fn set_tcp_port(&self, tcp_port: u16) -> DiscoveryResult<NodeRecord> {
        let mut record = self.inner.local_record.write();
        let updated = record.with_endpoint(
            &self.inner.identity,
            record.ip(),
            record.udp_addr().port(),
            tcp_port,
        )?;
        *record = updated.clone();
        Ok(updated)
    }

    /// Number of nodes in the routing table
    pub fn table_len(&self) -> usize {
        self.inner.table.read().len()
    }

    /// Known nodes closest to `target`
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<NodeRecord> {
        self.inner.table.read().closest(target, n)
    }

    /// All known nodes
    pub fn known_nodes(&self) -> Vec<NodeRecord> {
        self.inner.table.read().iter().cloned().collect()
    }

    /// Insert a verified record
    pub fn add_node(&self, record: NodeRecord) {
        self.inner.table.write().insert(record);
    }

    /// Spawn the receive loop
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Discovery receive loop stopped");
                        break;
                    }
                    received = this.inner.socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            if len > MAX_PACKET_SIZE {
                                debug!("Dropping oversize datagram from {}", from);
                                continue;
                            }
                            this.handle_datagram(&buf[..len], from).await;
                        }
                        Err(e) => warn!("Discovery receive error: {}", e),
                    }
                }
            }
        })
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Invalid packet from {}: {}", from, e);
                return;
            }
        };
        trace!("Packet {:?} from {}", packet.body, from);

        match packet.body {
            PacketBody::Ping { record } => {
                match NodeRecord::decode(&record) {
                    Ok(record) if record.udp_addr() == from => {
                        self.inner.table.write().insert(record);
                    }
                    Ok(record) => {
                        debug!("Ping from {} advertises {}, not adding", from, record.udp_addr());
                    }
                    Err(e) => {
                        debug!("Ping from {} with bad record: {}", from, e);
                        return;
                    }
                }
                let pong = Packet {
                    request_id: packet.request_id,
                    body: PacketBody::Pong {
                        enr_seq: self.inner.local_record.read().seq(),
                        observed_ip: from.ip(),
                        observed_port: from.port(),
                    },
                };
                self.send(&pong, from).await;
            }
            PacketBody::FindNode { target } => {
                let records = self.closest(&NodeId::from_bytes(target), self.inner.config.lookup.k);
                for reply in Packet::nodes(packet.request_id, &records) {
                    self.send(&reply, from).await;
                }
            }
            body @ (PacketBody::Pong { .. } | PacketBody::Nodes { .. }) => {
                let pending = self.inner.pending.lock();
                match pending.get(&packet.request_id) {
                    Some(request) if request.peer == from => {
                        let _ = request.tx.try_send(body);
                    }
                    Some(_) => debug!("Response id {} from unexpected {}", packet.request_id, from),
                    None => trace!("Unsolicited response {} from {}", packet.request_id, from),
                }
            }
        }
    }

    async fn send(&self, packet: &Packet, to: SocketAddr) {
        match packet.encode() {
            Ok(bytes) => {
                if let Err(e) = self.inner.socket.send_to(&bytes, to).await {
                    debug!("Failed to send to {}: {}", to, e);
                }
            }
            Err(e) => warn!("Failed to encode packet: {}", e),
        }
    }

    fn register(&self, peer: SocketAddr) -> (u64, mpsc::Receiver<PacketBody>) {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(32);
        self.inner
            .pending
            .lock()
            .insert(request_id, PendingRequest { peer, tx });
        (request_id, rx)
    }

    fn unregister(&self, request_id: u64) {
        self.inner.pending.lock().remove(&request_id);
    }

    fn request_timeout(&self) -> Duration {
        self.inner.config.lookup.request_timeout
    }

    /// How long `find_node` collects `Nodes` chunks
    ///
    /// Shorter than the lookup's per-request timeout so partial replies are
    /// returned before the lookup gives up on the node.
    fn reply_window(&self) -> Duration {
        self.request_timeout() * 3 / 4
    }

    /// Liveness check; returns the remote record sequence number
    pub async fn ping(&self, record: &NodeRecord) -> DiscoveryResult<u64> {
        let peer = record.udp_addr();
        let (request_id, mut rx) = self.register(peer);
        let ping = Packet {
            request_id,
            body: PacketBody::Ping {
                record: self.local_record().encode(),
            },
        };
        self.send(&ping, peer).await;

        let result = tokio::time::timeout(self.request_timeout(), rx.recv()).await;
        self.unregister(request_id);
        match result {
            Ok(Some(PacketBody::Pong { enr_seq, .. })) => {
                self.inner.table.write().insert(record.clone());
                Ok(enr_seq)
            }
            Ok(Some(other)) => Err(DiscoveryError::UnexpectedResponse(format!("{:?}", other))),
            Ok(None) | Err(_) => Err(DiscoveryError::Timeout(format!("ping {}", peer))),
        }
    }

    /// Ask `record` for nodes close to `target`
    pub async fn find_node(&self, record: &NodeRecord, target: NodeId) -> DiscoveryResult<Vec<NodeRecord>> {
        let peer = record.udp_addr();
        let (request_id, mut rx) = self.register(peer);
        self.send(&Packet::find_node(request_id, target), peer).await;

        let deadline = tokio::time::Instant::now() + self.reply_window();
        let mut records = Vec::new();
        let mut received = 0usize;
        let outcome = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(PacketBody::Nodes { total, records: chunk })) => {
                    received += 1;
                    for bytes in chunk {
                        match NodeRecord::decode(&bytes) {
                            Ok(r) if r.node_id() != self.local_id() => records.push(r),
                            Ok(_) => {}
                            Err(e) => debug!("Dropping record from {}: {}", peer, e),
                        }
                    }
                    if received >= total as usize {
                        break Ok(());
                    }
                }
                Ok(Some(other)) => {
                    break Err(DiscoveryError::UnexpectedResponse(format!("{:?}", other)))
                }
                Ok(None) => break Err(DiscoveryError::Timeout(format!("find_node {}", peer))),
                // keep partial replies from a responsive node
                Err(_) if received > 0 => break Ok(()),
                Err(_) => break Err(DiscoveryError::Timeout(format!("find_node {}", peer))),
            }
        };
        self.unregister(request_id);
        outcome?;

        self.inner.table.write().insert(record.clone());
        Ok(records)
    }

    /// Ping every seed and keep the responsive ones
    ///
    /// Returns the number of seeds that answered.
    pub async fn bootstrap(&self) -> usize {
        let results = join_all(self.inner.bootnodes.iter().map(|seed| async move {
            match self.ping(seed).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Seed {} unresponsive: {}", seed.udp_addr(), e);
                    false
                }
            }
        }))
        .await;
        let alive = results.into_iter().filter(|ok| *ok).count();
        info!("Bootstrapped from {}/{} seeds", alive, self.inner.bootnodes.len());
        alive
    }

    /// Iterative lookup for `target` seeded from the routing table
    pub async fn lookup(&self, target: NodeId) -> LookupResult {
        let config = self.inner.config.lookup.clone();
        let mut seeds = self.closest(&target, config.k);
        if seeds.is_empty() {
            seeds = self.inner.bootnodes.clone();
        }
        let result = Lookup::new(self.local_id(), target, config, seeds).run(self).await;
        debug!(
            "Lookup for {} finished after {} rounds with {} nodes ({:?})",
            target,
            result.rounds,
            result.nodes.len(),
            result.termination
        );
        result
    }

    /// Lookup for a random target
    pub async fn random_walk(&self) -> LookupResult {
        self.lookup(NodeId::random()).await
    }
}

#[async_trait]
impl FindNode for Discovery {
    async fn find_node(&self, peer: &NodeRecord, target: NodeId) -> DiscoveryResult<Vec<NodeRecord>> {
        Discovery::find_node(self, peer, target).await
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("node_id", &self.local_id())
            .field("table_len", &self.table_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LookupConfig;

    fn test_config() -> DiscoveryConfig {
        DiscoveryConfig {
            addr: "127.0.0.1".into(),
            udp_port: 0,
            tcp_port: 9000,
            lookup: LookupConfig {
                request_timeout: Duration::from_millis(500),
                ..LookupConfig::default()
            },
            ..DiscoveryConfig::default()
        }
    }

    async fn spawn_node(bootnodes: Vec<String>, cancel: &CancellationToken) -> Discovery {
        let node = Discovery::bind(DiscoveryConfig {
            bootnodes,
            ..test_config()
        })
        .await
        .unwrap();
        node.start(cancel.child_token());
        node
    }

    #[tokio::test]
    async fn test_invalid_address_is_fatal() {
        for addr in ["not-an-ip", "0.0.0.0", "::", "224.0.0.1"] {
            let err = Discovery::bind(DiscoveryConfig {
                addr: addr.into(),
                ..test_config()
            })
            .await
            .unwrap_err();
            assert!(matches!(err, DiscoveryError::InvalidAddress(_)), "{}", addr);
        }
    }

    #[tokio::test]
    async fn test_malformed_seed_is_fatal() {
        let err = Discovery::bind(DiscoveryConfig {
            bootnodes: vec!["enr:nothex".into()],
            ..test_config()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedRecord(_)));
    }

    #[tokio::test]
    async fn test_local_record_uses_bound_port() {
        let node = Discovery::bind(test_config()).await.unwrap();
        let record = node.local_record();
        assert_eq!(record.udp_addr().port(), node.local_addr().unwrap().port());
        assert_eq!(record.tcp_addr().port(), 9000);
        assert_eq!(record.node_id(), node.local_id());

        let updated = node.set_tcp_port(9100).unwrap();
        assert_eq!(updated.seq(), record.seq() + 1);
        assert_eq!(node.local_record().tcp_addr().port(), 9100);
    }

    #[tokio::test]
    async fn test_ping_and_bootstrap() {
        let cancel = CancellationToken::new();
        let a = spawn_node(Vec::new(), &cancel).await;
        let b = spawn_node(vec![a.local_record().to_text()], &cancel).await;

        assert_eq!(b.bootstrap().await, 1);
        assert_eq!(b.table_len(), 1);
        // a learns b from the ping
        assert_eq!(a.known_nodes()[0].node_id(), b.local_id());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unresponsive_seed_skipped() {
        let cancel = CancellationToken::new();
        let dead = Discovery::bind(test_config()).await.unwrap();
        let seed = dead.local_record().to_text();
        let node = spawn_node(vec![seed], &cancel).await;
        assert_eq!(node.bootstrap().await, 0);
        assert_eq!(node.table_len(), 0);
        cancel.cancel();
    }

    /// Plain UDP socket posing as a node
    async fn raw_node() -> (UdpSocket, NodeRecord) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let record = NodeRecord::signed(
            &NodeIdentity::generate(),
            1,
            "127.0.0.1".parse().unwrap(),
            port,
            9000,
            0,
        )
        .unwrap();
        (socket, record)
    }

    async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        (Packet::decode(&buf[..len]).unwrap(), from)
    }

    #[tokio::test]
    async fn test_ping_with_foreign_endpoint_not_added() {
        let cancel = CancellationToken::new();
        let node = spawn_node(Vec::new(), &cancel).await;
        let node_addr: SocketAddr = format!("127.0.0.1:{}", node.local_addr().unwrap().port())
            .parse()
            .unwrap();
        let (socket, honest) = raw_node().await;

        // the record points somewhere other than the sending socket
        let foreign = NodeRecord::signed(
            &NodeIdentity::generate(),
            1,
            "127.0.0.1".parse().unwrap(),
            1,
            9000,
            0,
        )
        .unwrap();
        for (request_id, record) in [(1u64, &foreign), (2, &honest)] {
            let ping = Packet {
                request_id,
                body: PacketBody::Ping {
                    record: record.encode(),
                },
            };
            socket.send_to(&ping.encode().unwrap(), node_addr).await.unwrap();
            let (pong, _) = recv_packet(&socket).await;
            assert_eq!(pong.request_id, request_id);
            assert!(matches!(pong.body, PacketBody::Pong { .. }));
        }

        let known: Vec<NodeId> = node.known_nodes().iter().map(|r| r.node_id()).collect();
        assert_eq!(known, vec![honest.node_id()]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_partial_nodes_reply_survives_lookup() {
        let cancel = CancellationToken::new();
        let (socket, responder) = raw_node().await;
        let asker = spawn_node(vec![responder.to_text()], &cancel).await;

        // announce two chunks, send only the first
        tokio::spawn(async move {
            loop {
                let (packet, from) = recv_packet(&socket).await;
                if let PacketBody::FindNode { .. } = packet.body {
                    let reply = Packet {
                        request_id: packet.request_id,
                        body: PacketBody::Nodes {
                            total: 2,
                            records: Vec::new(),
                        },
                    };
                    socket.send_to(&reply.encode().unwrap(), from).await.unwrap();
                }
            }
        });

        let result = asker.lookup(NodeId::random()).await;
        assert!(result.nodes.iter().any(|r| r.node_id() == responder.node_id()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_find_node_and_lookup() {
        let cancel = CancellationToken::new();
        let hub = spawn_node(Vec::new(), &cancel).await;
        let mut nodes = Vec::new();
        for _ in 0..6 {
            let node = spawn_node(vec![hub.local_record().to_text()], &cancel).await;
            node.bootstrap().await;
            nodes.push(node);
        }
        assert_eq!(hub.table_len(), 6);

        let asker = &nodes[0];
        let found = asker
            .find_node(&hub.local_record(), NodeId::random())
            .await
            .unwrap();
        assert_eq!(found.len(), 5);
        assert!(found.iter().all(|r| r.node_id() != asker.local_id()));

        let result = asker.lookup(NodeId::random()).await;
        assert!(result.nodes.len() >= 6);
        assert!(asker.table_len() >= 6);
        cancel.cancel();
    }
}
