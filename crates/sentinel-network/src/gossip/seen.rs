//! Bounded dedup window of message ids

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use super::message::MessageId;

/// LRU of recently seen message ids with a time-to-live
#[derive(Debug)]
pub struct SeenCache {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenCache {
    /// Create a cache holding at most `capacity` ids for `ttl`
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Record `id`; `false` if it was already seen within the TTL
    pub fn insert(&mut self, id: MessageId) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.entries.get(&id) {
            if now.duration_since(*seen_at) < self.ttl {
                return false;
            }
        }
        self.entries.put(id, now);
        true
    }

    /// Whether `id` is inside the window
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries
            .peek(id)
            .map(|seen_at| seen_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Number of tracked ids
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no ids are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
