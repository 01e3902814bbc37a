//! Network error types

use thiserror::Error;

use crate::codec::ResponseCode;

/// Wire codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Declared compressed length exceeds the configured maximum
    #[error("frame too large: {declared} bytes (max {max})")]
    FrameTooLarge {
        /// Length announced by the varint prefix
        declared: u64,
        /// Configured maximum
        max: usize,
    },

    /// Snappy-declared uncompressed length exceeds the configured maximum
    #[error("decompressed payload too large: {declared} bytes (max {max})")]
    DecompressedTooLarge {
        /// Length announced by the snappy header
        declared: usize,
        /// Configured maximum
        max: usize,
    },

    /// Varint prefix longer than 10 bytes or overflowing u64
    #[error("invalid length prefix")]
    InvalidVarint,

    /// Snappy compression or decompression failed
    #[error("snappy error: {0}")]
    Snappy(String),

    /// Payload does not match the expected schema
    #[error("schema violation: {0}")]
    Schema(String),

    /// Bytes left over after a complete message
    #[error("trailing bytes: {0}")]
    TrailingBytes(usize),

    /// Stream ended mid-frame or before a frame started
    #[error("truncated frame")]
    Truncated,

    /// Error chunks are only valid in responses
    #[error("error chunk in request frame")]
    UnexpectedErrorChunk,
}

impl CodecError {
    /// Whether the underlying stream failed rather than the peer sending a bad frame
    ///
    /// A reset or premature close mid-frame is a connection problem; only
    /// malformed content counts as a protocol fault.
    pub fn is_stream_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Truncated)
    }
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested listen address
        addr: std::net::SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },

    /// No connection to the peer
    #[error("not connected to peer: {0}")]
    NotConnected(String),

    /// Remote identified as a different peer than expected
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerMismatch {
        /// Expected peer
        expected: String,
        /// Peer that answered
        actual: String,
    },

    /// Malformed stream preface
    #[error("invalid preface: {0}")]
    InvalidPreface(String),

    /// Stream claims a connected peer but comes from another address
    #[error("peer {peer} is not connected from {remote}")]
    AddressMismatch {
        /// Claimed peer
        peer: String,
        /// Address the stream came from
        remote: std::net::SocketAddr,
    },

    /// Transport has been closed
    #[error("transport closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Peer manager errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// No connected peers to choose from
    #[error("no peers connected")]
    NoPeers,

    /// Peer not found
    #[error("peer not found: {0}")]
    PeerNotFound(String),
}

/// Result type for peer manager operations
pub type PeerResult<T> = Result<T, PeerError>;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configured address is not usable
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Bind failed
    #[error("failed to bind discovery socket: {0}")]
    Bind(std::io::Error),

    /// Node record could not be decoded
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Node record signature did not verify
    #[error("record signature invalid")]
    InvalidSignature,

    /// Identity key problem
    #[error("identity error: {0}")]
    Identity(#[from] sentinel_crypto::CryptoError),

    /// Packet could not be encoded or decoded
    #[error("packet error: {0}")]
    Packet(String),

    /// Request timed out
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Unexpected response body
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Gossip errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GossipError {
    /// Topic already has an active subscription
    #[error("already subscribed to topic: {0}")]
    AlreadySubscribed(String),

    /// Topic has no active subscription
    #[error("not subscribed to topic: {0}")]
    NotSubscribed(String),

    /// Topic string is not a valid gossip topic
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Identical message already seen in the dedup window
    #[error("duplicate message")]
    Duplicate,

    /// Payload exceeds gossip_max_size
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Compression failure
    #[error("compression failed: {0}")]
    Compression(String),

    /// Manager is shut down
    #[error("gossip manager closed")]
    Closed,
}

/// Result type for gossip operations
pub type GossipResult<T> = Result<T, GossipError>;

/// Request/response errors
#[derive(Debug, Error)]
pub enum ReqRespError {
    /// Codec failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Peer selection failure
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// Deadline elapsed
    #[error("timeout: {0}")]
    Timeout(String),

    /// Remote answered with a non-success status
    #[error("error response ({code:?}): {message}")]
    ErrorResponse {
        /// Status code
        code: ResponseCode,
        /// Remote error message
        message: String,
    },

    /// Remote closed the stream without a response
    #[error("empty response")]
    EmptyResponse,

    /// Request fails local validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Protocol id not supported
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Handler is shutting down
    #[error("cancelled")]
    Cancelled,
}

impl ReqRespError {
    /// Transport-level failure; the peer is dropped, not penalised
    pub fn is_transport_failure(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Codec(e) => e.is_stream_failure(),
            _ => false,
        }
    }

    /// Malformed frame or payload from the peer
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, Self::Codec(e) if !e.is_stream_failure())
    }
}

/// Result type for request/response operations
pub type ReqRespResult<T> = Result<T, ReqRespError>;

/// Sentinel orchestrator errors
#[derive(Debug, Error)]
pub enum SentinelError {
    /// Discovery startup failure
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Transport startup failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Gossip failure
    #[error("gossip error: {0}")]
    Gossip(#[from] GossipError),

    /// Invalid configuration
    #[error("invalid config: {0}")]
    Config(String),

    /// Already running
    #[error("sentinel already running")]
    AlreadyRunning,

    /// Not running
    #[error("sentinel not running")]
    NotRunning,
}

/// Result type for sentinel operations
pub type SentinelResult<T> = Result<T, SentinelError>;
