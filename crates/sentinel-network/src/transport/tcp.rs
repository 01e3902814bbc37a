//! TCP transport: one TCP connection per stream, announced by a preface
//!
//! Preface layout:
//!
//! ```text
//! [peer id: 32] [listen port: u16 BE] [protocol len: u16 BE] [protocol]
//! ```
//!
//! A connection is established with the hello protocol; the listener answers
//! with its own preface. Later streams are accepted only from connected peers,
//! and only from the IP address recorded when the connection was made.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{Stream, StreamTracker, Transport, TransportEvent, EVENT_CHANNEL_SIZE};
use crate::error::{TransportError, TransportResult};
use crate::types::PeerId;

/// Protocol id of the connection handshake
pub const HELLO_PROTOCOL: &str = "/sentinel/hello/1";

/// Longest accepted protocol id
const MAX_PROTOCOL_LEN: usize = 256;

/// Deadline for dialing and exchanging prefaces
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Preface {
    peer: PeerId,
    listen_port: u16,
    protocol: String,
}

async fn write_preface<W: AsyncWrite + Unpin>(io: &mut W, preface: &Preface) -> TransportResult<()> {
    let protocol = preface.protocol.as_bytes();
    if protocol.len() > MAX_PROTOCOL_LEN {
        return Err(TransportError::InvalidPreface("protocol id too long".into()));
    }
    let mut buf = BytesMut::with_capacity(36 + protocol.len());
    buf.put_slice(preface.peer.as_bytes());
    buf.put_u16(preface.listen_port);
    buf.put_u16(protocol.len() as u16);
    buf.put_slice(protocol);
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

async fn read_preface<R: AsyncRead + Unpin>(io: &mut R) -> TransportResult<Preface> {
    let mut id = [0u8; 32];
    io.read_exact(&mut id).await?;
    let listen_port = io.read_u16().await?;
    let len = io.read_u16().await? as usize;
    if len == 0 || len > MAX_PROTOCOL_LEN {
        return Err(TransportError::InvalidPreface(format!("protocol length {}", len)));
    }
    let mut protocol = vec![0u8; len];
    io.read_exact(&mut protocol).await?;
    let protocol = String::from_utf8(protocol)
        .map_err(|_| TransportError::InvalidPreface("protocol id not utf-8".into()))?;
    Ok(Preface {
        peer: PeerId::from_bytes(id),
        listen_port,
        protocol,
    })
}

fn timed_out(what: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, what.to_string()))
}

struct TcpInner {
    local: PeerId,
    listen_addr: SocketAddr,
    connections: RwLock<HashMap<PeerId, SocketAddr>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    tracker: Arc<StreamTracker>,
    cancel: CancellationToken,
}

impl TcpInner {
    fn preface(&self, protocol: &str) -> Preface {
        Preface {
            peer: self.local,
            listen_port: self.listen_addr.port(),
            protocol: protocol.to_string(),
        }
    }

    /// Whether `remote` may open streams as `peer`
    fn admits_stream(&self, peer: &PeerId, remote: &SocketAddr) -> bool {
        self.connections
            .read()
            .get(peer)
            .is_some_and(|recorded| recorded.ip() == remote.ip())
    }

    async fn handle_inbound(&self, mut socket: TcpStream, remote: SocketAddr) -> TransportResult<()> {
        let preface = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_preface(&mut socket))
            .await
            .map_err(|_| TransportError::InvalidPreface("preface timeout".into()))??;

        if preface.peer == self.local {
            return Err(TransportError::InvalidPreface("self dial".into()));
        }

        if preface.protocol == HELLO_PROTOCOL {
            let addr = SocketAddr::new(remote.ip(), preface.listen_port);
            {
                let mut connections = self.connections.write();
                if let Some(recorded) = connections.get(&preface.peer) {
                    if recorded.ip() != remote.ip() {
                        return Err(TransportError::AddressMismatch {
                            peer: preface.peer.to_string(),
                            remote,
                        });
                    }
                }
                connections.insert(preface.peer, addr);
            }
            write_preface(&mut socket, &self.preface(HELLO_PROTOCOL)).await?;
            debug!("Inbound connection from {} at {}", preface.peer, addr);
            self.event_tx
                .send(TransportEvent::Connected {
                    peer: preface.peer,
                    addr,
                })
                .await
                .map_err(|_| TransportError::Closed)?;
            return Ok(());
        }

        if !self.connections.read().contains_key(&preface.peer) {
            return Err(TransportError::NotConnected(preface.peer.to_string()));
        }
        if !self.admits_stream(&preface.peer, &remote) {
            return Err(TransportError::AddressMismatch {
                peer: preface.peer.to_string(),
                remote,
            });
        }
        trace!("Inbound stream {} from {}", preface.protocol, preface.peer);
        let stream = Stream::new(socket, preface.peer, preface.protocol, self.tracker.acquire());
        self.event_tx
            .send(TransportEvent::InboundStream(stream))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// TCP implementation of [`Transport`]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    /// Bind the listener and start accepting connections
    pub async fn bind(
        addr: SocketAddr,
        local: PeerId,
        cancel: CancellationToken,
    ) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let listen_addr = listener.local_addr()?;
        info!("TCP transport listening on {}", listen_addr);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let inner = Arc::new(TcpInner {
            local,
            listen_addr,
            connections: RwLock::new(HashMap::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            tracker: StreamTracker::new(),
            cancel,
        });

        tokio::spawn(accept_loop(inner.clone(), listener));
        Ok(Self { inner })
    }
}

async fn accept_loop(inner: Arc<TcpInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, remote)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.handle_inbound(socket, remote).await {
                            debug!("Rejected inbound socket from {}: {}", remote, e);
                        }
                    });
                }
                Err(e) => warn!("Accept error: {}", e),
            },
        }
    }
    debug!("TCP accept loop stopped");
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer_id(&self) -> PeerId {
        self.inner.local
    }

    fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    async fn connect(&self, peer: PeerId, addr: SocketAddr) -> TransportResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let handshake = async {
            let mut socket = TcpStream::connect(addr).await?;
            let observed = socket.peer_addr()?;
            write_preface(&mut socket, &self.inner.preface(HELLO_PROTOCOL)).await?;
            let reply = read_preface(&mut socket).await?;
            Ok::<_, TransportError>((reply, observed))
        };
        let (reply, observed) = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| timed_out("handshake timed out"))??;

        if reply.peer != peer {
            return Err(TransportError::PeerMismatch {
                expected: peer.to_string(),
                actual: reply.peer.to_string(),
            });
        }
        // a wildcard dial address resolves to the peer's real one
        let addr = SocketAddr::new(observed.ip(), addr.port());
        self.inner.connections.write().insert(peer, addr);
        debug!("Connected to {} at {}", peer, addr);
        Ok(())
    }

    fn disconnect(&self, peer: &PeerId) {
        if self.inner.connections.write().remove(peer).is_some() {
            let _ = self.inner.event_tx.try_send(TransportEvent::Disconnected(*peer));
        }
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.connections.read().contains_key(peer)
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> TransportResult<Stream> {
        let addr = self
            .inner
            .connections
            .read()
            .get(peer)
            .copied()
            .ok_or_else(|| TransportError::NotConnected(peer.to_string()))?;
        let open = async {
            let mut socket = TcpStream::connect(addr).await?;
            write_preface(&mut socket, &self.inner.preface(protocol)).await?;
            Ok::<_, TransportError>(socket)
        };
        let socket = tokio::time::timeout(HANDSHAKE_TIMEOUT, open)
            .await
            .map_err(|_| timed_out("stream open timed out"))??;
        Ok(Stream::new(socket, *peer, protocol, self.inner.tracker.acquire()))
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.inner.event_rx.lock().take()
    }

    fn tracker(&self) -> Arc<StreamTracker> {
        self.inner.tracker.clone()
    }

    fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.connections.write().clear();
    }
}
