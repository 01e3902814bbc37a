//! Request/response protocols
//!
//! Each exchange runs on its own stream:
//!
//! ```text
//! requester                           responder
//!   open stream(protocol id)  ----->
//!   [request frame]           ----->    decode, consult chain state
//!   close write half
//!                             <-----    [status][varint][payload] x N
//!                             <-----    close
//! ```
//!
//! The stream guard releases the stream on every exit path. No retries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{
    read_request, read_response_chunk, response_reader, write_request, write_response_chunk, Chunk,
    ResponseCode, MAX_CHUNK_SIZE,
};
use crate::error::{CodecError, ReqRespError, ReqRespResult};
use crate::messages::{
    BlocksByRangeRequest, ErrorMessage, Goodbye, Metadata, Ping, SignedBlock, Ssz, Status,
};
use crate::peers::PeerManager;
use crate::transport::{Stream, Transport};
use crate::types::PeerId;

/// Largest `count` a blocks-by-range request may ask for
pub const MAX_REQUEST_BLOCKS: u64 = 1024;

/// Request/response protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `ping/1`
    Ping,
    /// `status/1`
    Status,
    /// `metadata/2`
    Metadata,
    /// `goodbye/1`
    Goodbye,
    /// `beacon_blocks_by_range/2`
    BlocksByRange,
}

impl Protocol {
    /// Every supported protocol
    pub const ALL: [Protocol; 5] = [
        Protocol::Ping,
        Protocol::Status,
        Protocol::Metadata,
        Protocol::Goodbye,
        Protocol::BlocksByRange,
    ];

    /// Full protocol id
    pub fn id(&self) -> &'static str {
        match self {
            Self::Ping => "/eth2/beacon_chain/req/ping/1/ssz_snappy",
            Self::Status => "/eth2/beacon_chain/req/status/1/ssz_snappy",
            Self::Metadata => "/eth2/beacon_chain/req/metadata/2/ssz_snappy",
            Self::Goodbye => "/eth2/beacon_chain/req/goodbye/1/ssz_snappy",
            Self::BlocksByRange => "/eth2/beacon_chain/req/beacon_blocks_by_range/2/ssz_snappy",
        }
    }

    /// Look up by protocol id
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }
}

/// Request/response configuration
#[derive(Debug, Clone)]
pub struct ReqRespConfig {
    /// Deadline for the first response byte
    pub ttfb_timeout: Duration,
    /// Deadline for a whole exchange
    pub resp_timeout: Duration,
    /// Maximum uncompressed chunk size
    pub max_chunk_size: usize,
}

impl Default for ReqRespConfig {
    fn default() -> Self {
        Self {
            ttfb_timeout: Duration::from_secs(5),
            resp_timeout: Duration::from_secs(10),
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

/// Local chain view served to peers
#[async_trait]
pub trait ChainStateProvider: Send + Sync {
    /// Current status
    fn status(&self) -> Status;

    /// Current metadata
    fn metadata(&self) -> Metadata;

    /// Blocks for a validated range request
    async fn blocks_by_range(&self, request: &BlocksByRangeRequest) -> Result<Vec<SignedBlock>, String>;
}

/// In-memory [`ChainStateProvider`]
#[derive(Debug, Default)]
pub struct StaticChainState {
    status: RwLock<Status>,
    metadata: RwLock<Metadata>,
    blocks: RwLock<BTreeMap<u64, SignedBlock>>,
}

impl StaticChainState {
    /// Create with the given status
    pub fn new(status: Status) -> Self {
        Self {
            status: RwLock::new(status),
            ..Default::default()
        }
    }

    /// Replace the status
    pub fn set_status(&self, status: Status) {
        *self.status.write() = status;
    }

    /// Replace the metadata
    pub fn set_metadata(&self, metadata: Metadata) {
        *self.metadata.write() = metadata;
    }

    /// Store a block at `slot`
    pub fn insert_block(&self, slot: u64, block: SignedBlock) {
        self.blocks.write().insert(slot, block);
    }
}

#[async_trait]
impl ChainStateProvider for StaticChainState {
    fn status(&self) -> Status {
        *self.status.read()
    }

    fn metadata(&self) -> Metadata {
        *self.metadata.read()
    }

    async fn blocks_by_range(&self, request: &BlocksByRangeRequest) -> Result<Vec<SignedBlock>, String> {
        let blocks = self.blocks.read();
        let step = request.step.max(1);
        let end = request
            .start_slot
            .saturating_add(request.count.saturating_mul(step));
        Ok(blocks
            .range(request.start_slot..end)
            .filter(|(slot, _)| (*slot - request.start_slot) % step == 0)
            .map(|(_, block)| block.clone())
            .take(request.count as usize)
            .collect())
    }
}

/// Request/response handler
pub struct ReqResp {
    config: ReqRespConfig,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerManager>,
    chain: Arc<dyn ChainStateProvider>,
    ping_seq: AtomicU64,
    cancel: CancellationToken,
}

impl ReqResp {
    /// Create a handler
    pub fn new(
        config: ReqRespConfig,
        transport: Arc<dyn Transport>,
        peers: Arc<PeerManager>,
        chain: Arc<dyn ChainStateProvider>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            transport,
            peers,
            chain,
            ping_seq: AtomicU64::new(1),
            cancel,
        }
    }

    /// Configuration
    pub fn config(&self) -> &ReqRespConfig {
        &self.config
    }

    // ---- outbound ----

    /// Send `Ping{id}`; returns the echoed ping
    pub async fn ping(&self, peer: &PeerId, id: u64) -> ReqRespResult<Ping> {
        self.single(peer, Protocol::Ping, Some(Ping { id })).await
    }

    /// Exchange status
    pub async fn status(&self, peer: &PeerId) -> ReqRespResult<Status> {
        self.single(peer, Protocol::Status, Some(self.chain.status()))
            .await
    }

    /// Fetch metadata (no request body)
    pub async fn metadata(&self, peer: &PeerId) -> ReqRespResult<Metadata> {
        self.single::<Ping, Metadata>(peer, Protocol::Metadata, None)
            .await
    }

    /// Send goodbye; no response is expected
    pub async fn goodbye(&self, peer: &PeerId, reason: u64) -> ReqRespResult<()> {
        let deadline = self.config.resp_timeout;
        let max = self.config.max_chunk_size;
        let send = async {
            let mut stream = self
                .transport
                .open_stream(peer, Protocol::Goodbye.id())
                .await?;
            write_request(&mut stream, Goodbye { reason }, max).await?;
            stream.shutdown().await.map_err(CodecError::from)?;
            Ok::<_, ReqRespError>(())
        };
        tokio::time::timeout(deadline, send)
            .await
            .map_err(|_| ReqRespError::Timeout(format!("goodbye to {}", peer)))?
    }

    /// Request a range of blocks; reads at most `count` chunks
    pub async fn blocks_by_range(
        &self,
        peer: &PeerId,
        request: BlocksByRangeRequest,
    ) -> ReqRespResult<Vec<SignedBlock>> {
        validate_range(&request).map_err(ReqRespError::InvalidRequest)?;
        self.exchange(peer, Protocol::BlocksByRange, Some(request), request.count as usize)
            .await
    }

    /// Ping a random connected peer; returns the peer and echoed id
    pub async fn ping_random_peer(&self) -> ReqRespResult<(PeerId, u64)> {
        let peer = self.peers.select_random_peer()?;
        let id = self.ping_seq.fetch_add(1, Ordering::Relaxed);
        let pong = self.ping(&peer, id).await?;
        info!("Ping {} to {} answered with {}", id, peer, pong.id);
        Ok((peer, pong.id))
    }

    async fn single<Req: Ssz, Resp: Ssz>(
        &self,
        peer: &PeerId,
        protocol: Protocol,
        request: Option<Req>,
    ) -> ReqRespResult<Resp> {
        self.exchange(peer, protocol, request, 1)
            .await?
            .pop()
            .ok_or(ReqRespError::EmptyResponse)
    }

    async fn exchange<Req: Ssz, Resp: Ssz>(
        &self,
        peer: &PeerId,
        protocol: Protocol,
        request: Option<Req>,
        max_chunks: usize,
    ) -> ReqRespResult<Vec<Resp>> {
        let started = Instant::now();
        let run = self.run_exchange(peer, protocol, request, max_chunks, started);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ReqRespError::Cancelled),
            result = tokio::time::timeout(self.config.resp_timeout, run) => match result {
                Ok(result) => result,
                Err(_) => Err(ReqRespError::Timeout(format!("{} to {}", protocol.id(), peer))),
            },
        };
        match &result {
            Ok(chunks) => {
                self.peers.touch(peer);
                trace!("{} to {}: {} chunks", protocol.id(), peer, chunks.len());
            }
            Err(e) if e.is_transport_failure() => {
                debug!("{} to {} failed: {}", protocol.id(), peer, e);
                self.drop_peer(peer);
            }
            Err(e) if e.is_protocol_fault() => {
                debug!("{} to {} failed: {}", protocol.id(), peer, e);
                self.peers.penalize(peer);
            }
            Err(e) => debug!("{} to {} failed: {}", protocol.id(), peer, e),
        }
        result
    }

    /// Forget a peer whose transport failed
    fn drop_peer(&self, peer: &PeerId) {
        self.transport.disconnect(peer);
        if self.peers.on_disconnect(peer) {
            info!("Peer {} unreachable, marked disconnected", peer);
        }
    }

    async fn run_exchange<Req: Ssz, Resp: Ssz>(
        &self,
        peer: &PeerId,
        protocol: Protocol,
        request: Option<Req>,
        max_chunks: usize,
        started: Instant,
    ) -> ReqRespResult<Vec<Resp>> {
        let max = self.config.max_chunk_size;
        let mut stream = self.transport.open_stream(peer, protocol.id()).await?;
        if let Some(request) = request {
            write_request(&mut stream, request, max).await?;
        }
        stream.shutdown().await.map_err(CodecError::from)?;

        let mut reader = response_reader::<_, Resp>(stream, max);
        let mut chunks = Vec::new();
        while chunks.len() < max_chunks {
            let next = if chunks.is_empty() {
                tokio::time::timeout_at(started + self.config.ttfb_timeout, read_response_chunk(&mut reader))
                    .await
                    .map_err(|_| ReqRespError::Timeout(format!("ttfb {} from {}", protocol.id(), peer)))??
            } else {
                read_response_chunk(&mut reader).await?
            };
            match next {
                Some(decoded) => match decoded.chunk {
                    Chunk::Success(message) => chunks.push(message),
                    Chunk::Error(code, message) => {
                        return Err(ReqRespError::ErrorResponse {
                            code,
                            message: message.0,
                        })
                    }
                },
                None => break,
            }
        }
        Ok(chunks)
    }

    // ---- inbound ----

    /// Serve one inbound stream
    pub async fn handle_inbound(&self, stream: Stream) {
        let peer = stream.peer();
        let Some(protocol) = Protocol::from_id(stream.protocol()) else {
            debug!("Unsupported protocol {} from {}", stream.protocol(), peer);
            return;
        };
        let serve = self.serve(protocol, stream);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ReqRespError::Cancelled),
            result = tokio::time::timeout(self.config.resp_timeout, serve) => match result {
                Ok(result) => result,
                Err(_) => Err(ReqRespError::Timeout(format!("serving {}", protocol.id()))),
            },
        };
        match result {
            Ok(()) => self.peers.touch(&peer),
            Err(e) if e.is_protocol_fault() => {
                debug!("Bad {} request from {}: {}", protocol.id(), peer, e);
                self.peers.penalize(&peer);
            }
            Err(e) => debug!("Serving {} to {} failed: {}", protocol.id(), peer, e),
        }
    }

    async fn serve(&self, protocol: Protocol, mut stream: Stream) -> ReqRespResult<()> {
        let peer = stream.peer();
        let max = self.config.max_chunk_size;
        match protocol {
            Protocol::Ping => {
                let ping = match read_or_reject::<Ping>(&mut stream, max).await? {
                    Some(ping) => ping,
                    None => return Ok(()),
                };
                trace!("Ping {} from {}", ping.id, peer);
                write_response_chunk(&mut stream, Chunk::Success(ping), max).await?;
            }
            Protocol::Status => {
                let remote = match read_or_reject::<Status>(&mut stream, max).await? {
                    Some(status) => status,
                    None => return Ok(()),
                };
                trace!("Status from {}: head slot {}", peer, remote.head_slot);
                write_response_chunk(&mut stream, Chunk::Success(self.chain.status()), max).await?;
            }
            Protocol::Metadata => {
                write_response_chunk(&mut stream, Chunk::Success(self.chain.metadata()), max).await?;
            }
            Protocol::Goodbye => {
                if let Some(goodbye) = read_or_reject::<Goodbye>(&mut stream, max).await? {
                    info!("Goodbye from {} (reason {})", peer, goodbye.reason);
                }
                drop(stream);
                self.transport.disconnect(&peer);
                self.peers.on_disconnect(&peer);
                return Ok(());
            }
            Protocol::BlocksByRange => {
                let request = match read_or_reject::<BlocksByRangeRequest>(&mut stream, max).await? {
                    Some(request) => request,
                    None => return Ok(()),
                };
                if let Err(reason) = validate_range(&request) {
                    reject(&mut stream, ResponseCode::InvalidRequest, &reason, max).await?;
                    return Ok(());
                }
                match self.chain.blocks_by_range(&request).await {
                    Ok(blocks) => {
                        for block in blocks.into_iter().take(request.count as usize) {
                            write_response_chunk(&mut stream, Chunk::Success(block), max).await?;
                        }
                    }
                    Err(reason) => {
                        warn!("Blocks-by-range for {} failed: {}", peer, reason);
                        reject(&mut stream, ResponseCode::ServerError, &reason, max).await?;
                    }
                }
            }
        }
        stream.shutdown().await.map_err(CodecError::from)?;
        Ok(())
    }
}

impl std::fmt::Debug for ReqResp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqResp")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate_range(request: &BlocksByRangeRequest) -> Result<(), String> {
    if request.count == 0 || request.count > MAX_REQUEST_BLOCKS {
        return Err(format!(
            "count {} outside 1..={}",
            request.count, MAX_REQUEST_BLOCKS
        ));
    }
    if request.step == 0 {
        return Err("step must be positive".to_string());
    }
    Ok(())
}

async fn reject(stream: &mut Stream, code: ResponseCode, reason: &str, max: usize) -> ReqRespResult<()> {
    write_response_chunk::<_, SignedBlock>(stream, Chunk::Error(code, ErrorMessage::new(reason)), max)
        .await?;
    stream.shutdown().await.map_err(CodecError::from)?;
    Ok(())
}

/// Read a request; a malformed one is answered with status 1
///
/// The codec error is returned so the caller can decide whether the peer
/// gets penalised. A failed socket gets no answer.
async fn read_or_reject<T: Ssz>(stream: &mut Stream, max: usize) -> ReqRespResult<Option<T>> {
    match read_request::<_, T>(stream, max).await {
        Ok((message, _raw)) => Ok(Some(message)),
        Err(e @ CodecError::Io(_)) => Err(ReqRespError::Codec(e)),
        Err(e) => {
            if let Err(write_err) = reject(stream, ResponseCode::InvalidRequest, &e.to_string(), max).await {
                debug!("Failed to reject request from {}: {}", stream.peer(), write_err);
            }
            Err(ReqRespError::Codec(e))
        }
    }
}
