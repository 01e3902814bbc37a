//! Stream transport capability
//!
//! Peers are reached through a multiplexed, stream-capable transport. Each
//! request/response exchange or gossip RPC runs on its own [`Stream`], tagged
//! with a protocol id. Every open stream holds a [`StreamGuard`] so shutdown
//! can wait for the open-stream gauge to drain.

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};

use crate::error::TransportResult;
use crate::types::PeerId;

/// Capacity of the transport event channel
pub const EVENT_CHANNEL_SIZE: usize = 1024;

/// Byte stream usable as a protocol stream
pub trait ProtocolIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProtocolIo for T {}

/// Counts open streams across a transport
#[derive(Debug, Default)]
pub struct StreamTracker {
    open: AtomicUsize,
    idle: Notify,
}

impl StreamTracker {
    /// Create a tracker
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an open stream
    pub fn acquire(self: &Arc<Self>) -> StreamGuard {
        self.open.fetch_add(1, Ordering::SeqCst);
        StreamGuard {
            tracker: self.clone(),
        }
    }

    /// Current open-stream gauge
    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Wait until no streams are open; `false` if `timeout` elapsed first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.open_streams() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.open_streams() == 0;
            }
        }
    }
}

/// Decrements the open-stream gauge when dropped
#[derive(Debug)]
pub struct StreamGuard {
    tracker: Arc<StreamTracker>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.tracker.open.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// A single protocol stream to a peer
pub struct Stream {
    io: Box<dyn ProtocolIo>,
    peer: PeerId,
    protocol: String,
    _guard: StreamGuard,
}

impl Stream {
    /// Wrap an IO object
    pub fn new(
        io: impl ProtocolIo + 'static,
        peer: PeerId,
        protocol: impl Into<String>,
        guard: StreamGuard,
    ) -> Self {
        Self {
            io: Box::new(io),
            peer,
            protocol: protocol.into(),
            _guard: guard,
        }
    }

    /// Remote peer
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Protocol id negotiated for this stream
    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Event raised by a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote peer established a connection to us
    Connected {
        /// Remote peer
        peer: PeerId,
        /// Remote dialable address
        addr: SocketAddr,
    },
    /// A peer's connection went away
    Disconnected(PeerId),
    /// A remote peer opened a stream
    InboundStream(Stream),
}

/// Stream-capable transport
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Our peer id
    fn local_peer_id(&self) -> PeerId;

    /// Address other peers dial
    fn listen_addr(&self) -> SocketAddr;

    /// Establish a connection to `peer` at `addr`
    async fn connect(&self, peer: PeerId, addr: SocketAddr) -> TransportResult<()>;

    /// Drop the connection to `peer`
    fn disconnect(&self, peer: &PeerId);

    /// Whether a connection to `peer` exists
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Open a new stream to a connected peer
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> TransportResult<Stream>;

    /// Take the event receiver (only once)
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Open-stream gauge
    fn tracker(&self) -> Arc<StreamTracker>;

    /// Stop accepting connections and drop all peers
    fn close(&self);
}
