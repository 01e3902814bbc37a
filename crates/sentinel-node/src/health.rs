//! Health source backed by a running sentinel

use std::sync::Arc;

use async_trait::async_trait;
use sentinel_health::{HealthError, HealthResult, HealthSource};
use sentinel_network::Sentinel;

/// Exposes sentinel state to the health endpoint
///
/// The p2p node keeps no chain; block and sync checks report an error
/// instead of guessing.
pub struct SentinelHealth {
    sentinel: Arc<Sentinel>,
}

impl SentinelHealth {
    /// Wrap a sentinel
    pub fn new(sentinel: Arc<Sentinel>) -> Self {
        Self { sentinel }
    }
}

fn unsupported(what: &str) -> HealthError {
    HealthError::Source(format!("{} is not tracked by the p2p node", what))
}

#[async_trait]
impl HealthSource for SentinelHealth {
    async fn peer_count(&self) -> HealthResult<usize> {
        Ok(self.sentinel.peer_count())
    }

    async fn is_syncing(&self) -> HealthResult<bool> {
        Err(unsupported("sync status"))
    }

    async fn has_block(&self, _number: u64) -> HealthResult<bool> {
        Err(unsupported("block history"))
    }

    async fn latest_block_timestamp(&self) -> HealthResult<u64> {
        Err(unsupported("latest block"))
    }
}
