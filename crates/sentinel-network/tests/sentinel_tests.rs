//! End-to-end tests for the sentinel orchestrator
//!
//! Nodes bind real UDP discovery on an ephemeral port and talk over the
//! in-memory transport.
//!
//! Test categories:
//! 1. Request/response between two started nodes
//! 2. Admission limits and bans
//! 3. Gossip publish and dedup
//! 4. Shutdown ordering, idle and with streams in flight
//! 5. Unreachable peers over TCP

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sentinel_network::gossip::GOSSIP_PROTOCOL;
use sentinel_network::messages::{BlocksByRangeRequest, Metadata, SignedBlock, Status};
use sentinel_network::{
    Admission, ChainStateProvider, GossipError, GossipKind, MemoryNetwork, ReqRespError, Sentinel,
    SentinelConfig, SentinelError, TcpTransport, Transport,
};
use sentinel_network::{PeerId, ShutdownStep};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Helpers
// =============================================================================

fn test_config(max_peers: usize) -> SentinelConfig {
    SentinelConfig {
        port: 0,
        max_peers,
        discovery_interval: Duration::from_secs(60),
        ping_interval: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(2),
        ..SentinelConfig::default()
    }
}

async fn start_node(network: &MemoryNetwork, max_peers: usize) -> Sentinel {
    let chain = Sentinel::static_chain_state(&test_config(max_peers));
    start_node_with_chain(network, max_peers, chain).await
}

async fn start_node_with_chain(
    network: &MemoryNetwork,
    max_peers: usize,
    chain: Arc<dyn ChainStateProvider>,
) -> Sentinel {
    let config = test_config(max_peers);
    let network = network.clone();
    let node = Sentinel::with_transport(config, chain, move |id| {
        Arc::new(network.transport(id)) as Arc<dyn Transport>
    })
    .await
    .unwrap();
    node.start().await.unwrap();
    node
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn start_tcp_node() -> Sentinel {
    let config = SentinelConfig {
        tcp_port: 0,
        ..test_config(10)
    };
    let chain = Sentinel::static_chain_state(&config);
    let node = Sentinel::new(config, chain).await.unwrap();
    node.start().await.unwrap();
    node
}

fn loopback(node: &Sentinel) -> SocketAddr {
    SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        node.transport().listen_addr().port(),
    )
}

/// Chain state whose range queries never finish in test time
struct StalledChain;

#[async_trait]
impl ChainStateProvider for StalledChain {
    fn status(&self) -> Status {
        Status::default()
    }

    fn metadata(&self) -> Metadata {
        Metadata::default()
    }

    async fn blocks_by_range(&self, _: &BlocksByRangeRequest) -> Result<Vec<SignedBlock>, String> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

async fn connect(from: &Sentinel, to: &Sentinel) -> Admission {
    from.dial(to.local_peer_id(), to.transport().listen_addr())
        .await
        .unwrap()
}

// =============================================================================
// Request/response
// =============================================================================

#[tokio::test]
async fn test_ping_between_nodes() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, 10).await;
    let b = start_node(&network, 10).await;

    assert_eq!(connect(&a, &b).await, Admission::Accepted);
    wait_until(|| b.peer_count() == 1).await;

    let pong = a.reqresp().ping(&b.local_peer_id(), 1).await.unwrap();
    assert_eq!(pong.id, 1);

    let (peer, id) = a.reqresp().ping_random_peer().await.unwrap();
    assert_eq!(peer, b.local_peer_id());
    assert_eq!(id, 1);

    let status = a.reqresp().status(&b.local_peer_id()).await.unwrap();
    assert_eq!(status.fork_digest, [0u8; 4]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_local_record_advertises_transport_port() {
    let network = MemoryNetwork::new();
    let node = start_node(&network, 10).await;

    let record = node.discovery().local_record();
    assert_eq!(record.tcp_addr().port(), node.transport().listen_addr().port());
    assert_eq!(record.node_id(), node.local_peer_id());
    assert!(node.local_record().starts_with("enr:"));

    node.shutdown().await;
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_capacity_rejects_extra_peer() {
    let network = MemoryNetwork::new();
    let hub = start_node(&network, 1).await;
    let first = start_node(&network, 10).await;
    let second = start_node(&network, 10).await;

    connect(&first, &hub).await;
    wait_until(|| hub.peer_count() == 1).await;
    assert!(hub.has_too_many_peers());

    // the dialer admits the hub, the hub says goodbye and hangs up
    assert_eq!(connect(&second, &hub).await, Admission::Accepted);
    wait_until(|| second.peer_count() == 0).await;

    assert_eq!(hub.peer_count(), 1);
    assert!(hub.peers().has_peer(&first.local_peer_id()));
    assert!(!hub.peers().has_peer(&second.local_peer_id()));

    for node in [&hub, &first, &second] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_banned_peer_is_dropped() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, 10).await;
    let b = start_node(&network, 10).await;

    b.peers().ban(&a.local_peer_id(), Duration::from_secs(60));
    connect(&a, &b).await;
    wait_until(|| a.peer_count() == 0).await;
    assert_eq!(b.peer_count(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_dial_twice_is_already_connected() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, 10).await;
    let b = start_node(&network, 10).await;

    assert!(connect(&a, &b).await.is_accepted());
    assert!(!connect(&a, &b).await.is_accepted());
    assert_eq!(a.peer_count(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

// =============================================================================
// Gossip
// =============================================================================

#[tokio::test]
async fn test_publish_reaches_peer_once() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, 10).await;
    let b = start_node(&network, 10).await;
    let topic = a.topic(GossipKind::LightClientFinalityUpdate);
    let mut b_events = b.gossip_events();

    connect(&a, &b).await;
    wait_until(|| a.topic_peer_count(&topic) == 1 && b.topic_peer_count(&topic) == 1).await;

    let id = a.publish(&topic, b"finality update").unwrap();
    assert!(matches!(
        a.publish(&topic, b"finality update"),
        Err(SentinelError::Gossip(GossipError::Duplicate))
    ));

    let message = tokio::time::timeout(Duration::from_secs(5), b_events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, topic);
    assert_eq!(&message.data[..], b"finality update");
    assert_eq!(message.source, a.local_peer_id());
    assert_eq!(message.id, id);

    // B does not echo the message back, so nothing else arrives
    assert!(
        tokio::time::timeout(Duration::from_millis(200), b_events.next())
            .await
            .is_err()
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_publish_without_subscription_skips_local_delivery() {
    let network = MemoryNetwork::new();
    let node = start_node(&network, 10).await;
    let topic = node.topic(GossipKind::BeaconBlock);

    node.gossip().unsubscribe(&topic).unwrap();
    let mut events = node.gossip_events();
    node.publish(&topic, b"block").unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(100), events.next())
            .await
            .is_err()
    );
    node.shutdown().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_twice_fails() {
    let network = MemoryNetwork::new();
    let node = start_node(&network, 10).await;
    assert!(node.is_running());
    assert!(matches!(node.start().await, Err(SentinelError::AlreadyRunning)));
    node.shutdown().await;
}

#[tokio::test]
async fn test_transport_must_match_node_id() {
    let network = MemoryNetwork::new();
    let config = test_config(10);
    let chain = Sentinel::static_chain_state(&config);
    let result = Sentinel::with_transport(config, chain, |_| {
        Arc::new(network.transport(PeerId::random())) as Arc<dyn Transport>
    })
    .await;
    assert!(matches!(result, Err(SentinelError::Config(_))));
}

#[tokio::test]
async fn test_shutdown_order() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, 10).await;
    let b = start_node(&network, 10).await;
    connect(&a, &b).await;
    wait_until(|| b.peer_count() == 1).await;
    a.reqresp().ping(&b.local_peer_id(), 7).await.unwrap();

    let report = a.shutdown().await;
    assert_eq!(
        report.steps,
        vec![
            ShutdownStep::DiscoveryStopped,
            ShutdownStep::StreamsClosed,
            ShutdownStep::TopicsUnsubscribed,
            ShutdownStep::DeliveryClosed,
        ]
    );
    assert_eq!(report.leaked_streams, 0);
    assert_eq!(report.topics_unsubscribed, GossipKind::ALL.len());
    assert_eq!(report.delivery_closes, 1);
    assert!(!a.is_running());
    assert!(a.gossip().topics().is_empty());

    // second shutdown is a no-op
    let again = a.shutdown().await;
    assert!(again.steps.is_empty());
    assert_eq!(again.delivery_closes, 1);
    assert!(matches!(a.start().await, Err(SentinelError::NotRunning)));

    // the remote notices the connection went away
    wait_until(|| b.peer_count() == 0).await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_with_streams_in_flight() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, 10).await;
    let b = start_node_with_chain(&network, 10, Arc::new(StalledChain)).await;
    let a_id = a.local_peer_id();
    let b_id = b.local_peer_id();
    let topic = a.topic(GossipKind::BeaconBlock);

    connect(&a, &b).await;
    wait_until(|| a.topic_peer_count(&topic) == 1 && b.topic_peer_count(&topic) == 1).await;
    // let the subscription streams finish
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reqresp = a.reqresp().clone();
    let pending = tokio::spawn(async move {
        reqresp
            .blocks_by_range(
                &b_id,
                BlocksByRangeRequest {
                    start_slot: 0,
                    count: 4,
                    step: 1,
                },
            )
            .await
    });
    // b keeps a gossip stream into a open without writing
    let _idle = b.transport().open_stream(&a_id, GOSSIP_PROTOCOL).await.unwrap();

    let tracker = a.transport().tracker();
    wait_until(|| tracker.open_streams() == 2).await;

    let report = a.shutdown().await;
    assert_eq!(
        report.steps,
        vec![
            ShutdownStep::DiscoveryStopped,
            ShutdownStep::StreamsClosed,
            ShutdownStep::TopicsUnsubscribed,
            ShutdownStep::DeliveryClosed,
        ]
    );
    assert_eq!(report.leaked_streams, 0);
    assert_eq!(tracker.open_streams(), 0);

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ReqRespError::Cancelled)), "{:?}", result);

    b.shutdown().await;
}

// =============================================================================
// Unreachable peers
// =============================================================================

#[tokio::test]
async fn test_tcp_shutdown_says_goodbye() {
    let a = start_tcp_node().await;
    let b = start_tcp_node().await;
    let b_id = b.local_peer_id();

    assert_eq!(a.dial(b_id, loopback(&b)).await.unwrap(), Admission::Accepted);
    wait_until(|| b.peer_count() == 1).await;
    assert_eq!(a.reqresp().ping(&b_id, 1).await.unwrap().id, 1);

    b.shutdown().await;
    wait_until(|| a.peer_count() == 0).await;
    assert!(!a.transport().is_connected(&b_id));

    a.shutdown().await;
}

#[tokio::test]
async fn test_tcp_dead_peer_marked_disconnected() {
    let a = start_tcp_node().await;
    let silent = TcpTransport::bind(
        "127.0.0.1:0".parse().unwrap(),
        PeerId::random(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let silent_id = silent.local_peer_id();

    assert_eq!(
        a.dial(silent_id, silent.listen_addr()).await.unwrap(),
        Admission::Accepted
    );
    assert_eq!(a.peer_count(), 1);

    // gone without a goodbye
    silent.close();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = a.reqresp().ping(&silent_id, 1).await.unwrap_err();
    assert!(err.is_transport_failure(), "{:?}", err);
    assert_eq!(a.peer_count(), 0);
    assert!(!a.has_min_peers(1));
    assert!(!a.transport().is_connected(&silent_id));
    assert!(!a.peers().is_banned(&silent_id));

    a.shutdown().await;
}
