//! In-process transport over `tokio::io::duplex` pipes

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::{Stream, StreamTracker, Transport, TransportEvent, EVENT_CHANNEL_SIZE};
use crate::error::{TransportError, TransportResult};
use crate::types::PeerId;

/// Buffer size of each in-memory stream direction
const PIPE_CAPACITY: usize = 64 * 1024;

/// Shared switchboard connecting [`MemoryTransport`]s
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<PeerId, Weak<MemoryInner>>>>,
    next_port: Arc<AtomicU16>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new transport for `local`
    pub fn transport(&self, local: PeerId) -> MemoryTransport {
        let port = 10_000 + self.next_port.fetch_add(1, Ordering::SeqCst);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let inner = Arc::new(MemoryInner {
            local,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            network: self.clone(),
            connections: RwLock::new(HashSet::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            tracker: StreamTracker::new(),
            closed: AtomicBool::new(false),
        });
        self.nodes.lock().insert(local, Arc::downgrade(&inner));
        MemoryTransport { inner }
    }

    fn lookup(&self, peer: &PeerId) -> Option<Arc<MemoryInner>> {
        self.nodes.lock().get(peer).and_then(Weak::upgrade)
    }
}

struct MemoryInner {
    local: PeerId,
    addr: SocketAddr,
    network: MemoryNetwork,
    connections: RwLock<HashSet<PeerId>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    tracker: Arc<StreamTracker>,
    closed: AtomicBool,
}

impl MemoryInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-memory implementation of [`Transport`]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl MemoryTransport {
    fn remote(&self, peer: &PeerId) -> TransportResult<Arc<MemoryInner>> {
        if self.inner.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.inner.network.lookup(peer) {
            Some(remote) if !remote.is_closed() => Ok(remote),
            _ => Err(TransportError::NotConnected(peer.to_string())),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.inner.local
    }

    fn listen_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    async fn connect(&self, peer: PeerId, _addr: SocketAddr) -> TransportResult<()> {
        let remote = self.remote(&peer)?;
        self.inner.connections.write().insert(peer);
        remote.connections.write().insert(self.inner.local);
        remote
            .event_tx
            .send(TransportEvent::Connected {
                peer: self.inner.local,
                addr: self.inner.addr,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&self, peer: &PeerId) {
        self.inner.connections.write().remove(peer);
        if let Some(remote) = self.inner.network.lookup(peer) {
            if remote.connections.write().remove(&self.inner.local) {
                let _ = remote
                    .event_tx
                    .try_send(TransportEvent::Disconnected(self.inner.local));
            }
        }
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.connections.read().contains(peer)
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> TransportResult<Stream> {
        if !self.is_connected(peer) {
            return Err(TransportError::NotConnected(peer.to_string()));
        }
        let remote = self.remote(peer)?;
        let (local_io, remote_io) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = Stream::new(remote_io, self.inner.local, protocol, remote.tracker.acquire());
        remote
            .event_tx
            .send(TransportEvent::InboundStream(inbound))
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(Stream::new(local_io, *peer, protocol, self.inner.tracker.acquire()))
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.inner.event_rx.lock().take()
    }

    fn tracker(&self) -> Arc<StreamTracker> {
        self.inner.tracker.clone()
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let peers: Vec<PeerId> = self.inner.connections.read().iter().copied().collect();
        for peer in peers {
            self.disconnect(&peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_connect_and_stream() {
        let network = MemoryNetwork::new();
        let a = network.transport(PeerId::random());
        let b = network.transport(PeerId::random());
        let mut b_events = b.take_events().unwrap();

        a.connect(b.local_peer_id(), b.listen_addr()).await.unwrap();
        assert!(a.is_connected(&b.local_peer_id()));
        assert!(b.is_connected(&a.local_peer_id()));
        assert!(matches!(
            b_events.recv().await.unwrap(),
            TransportEvent::Connected { .. }
        ));

        let mut out = a.open_stream(&b.local_peer_id(), "/echo/1").await.unwrap();
        let mut inbound = match b_events.recv().await.unwrap() {
            TransportEvent::InboundStream(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(b.tracker().open_streams(), 1);

        out.write_all(b"ping").await.unwrap();
        out.shutdown().await.unwrap();
        let mut buf = Vec::new();
        inbound.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");

        drop(inbound);
        assert_eq!(b.tracker().open_streams(), 0);
    }

    #[tokio::test]
    async fn test_memory_unknown_peer() {
        let network = MemoryNetwork::new();
        let a = network.transport(PeerId::random());
        let err = a
            .connect(PeerId::random(), "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_memory_disconnect_notifies_remote() {
        let network = MemoryNetwork::new();
        let a = network.transport(PeerId::random());
        let b = network.transport(PeerId::random());
        let mut b_events = b.take_events().unwrap();
        a.connect(b.local_peer_id(), b.listen_addr()).await.unwrap();
        let _ = b_events.recv().await;

        a.disconnect(&b.local_peer_id());
        assert!(!b.is_connected(&a.local_peer_id()));
        assert!(matches!(
            b_events.recv().await.unwrap(),
            TransportEvent::Disconnected(peer) if peer == a.local_peer_id()
        ));
    }

    #[tokio::test]
    async fn test_memory_closed_transport_refuses() {
        let network = MemoryNetwork::new();
        let a = network.transport(PeerId::random());
        let b = network.transport(PeerId::random());
        b.close();
        assert!(a.connect(b.local_peer_id(), b.listen_addr()).await.is_err());
    }
}
