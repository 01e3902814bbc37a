//! Health check error types

use thiserror::Error;

/// Health check errors
///
/// The `Display` form of a check failure is what the endpoint reports after
/// the `ERROR: ` prefix.
#[derive(Debug, Error)]
pub enum HealthError {
    /// Fewer peers than requested
    #[error("not enough peers: {have} (minimum {min})")]
    NotEnoughPeers {
        /// Connected peers
        have: usize,
        /// Requested minimum
        min: usize,
    },

    /// Node is still syncing
    #[error("not synced")]
    NotSynced,

    /// Requested block is not known
    #[error("no known block with number {0}")]
    BlockNotFound(u64),

    /// Latest block is older than allowed
    #[error("got ts: {timestamp}, need: {need}")]
    TooFarBehind {
        /// Latest block timestamp
        timestamp: u64,
        /// Oldest acceptable timestamp
        need: u64,
    },

    /// Header names no registered check
    #[error("unknown check")]
    UnknownCheck,

    /// Check argument did not parse
    #[error("invalid argument for {check}: {value:?}")]
    InvalidArgument {
        /// Check name
        check: &'static str,
        /// Offending argument
        value: String,
    },

    /// Request body is not valid JSON
    #[error("{0}")]
    InvalidBody(String),

    /// Backing source cannot answer
    #[error("{0}")]
    Source(String),

    /// Server failed to bind or serve
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for health checks
pub type HealthResult<T> = Result<T, HealthError>;
