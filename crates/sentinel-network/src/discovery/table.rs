//! Kademlia-style routing table
//!
//! 256 buckets indexed by log2 XOR distance from the local id. Each bucket
//! keeps entries ordered from least to most recently seen.

use std::collections::VecDeque;
use std::time::Instant;

use super::record::NodeRecord;
use crate::types::NodeId;

/// Number of buckets (one per possible log2 distance)
pub const NUM_BUCKETS: usize = 256;

/// Default bucket size
pub const DEFAULT_BUCKET_SIZE: usize = 16;

#[derive(Debug, Clone)]
struct Entry {
    record: NodeRecord,
    last_seen: Instant,
}

/// Outcome of [`RoutingTable::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry added
    Inserted,
    /// Existing entry refreshed
    Updated,
    /// Bucket was full; the least recently seen entry was replaced
    Evicted(NodeId),
    /// Our own record is never stored
    IgnoredSelf,
}

/// Routing table of verified node records
#[derive(Debug)]
pub struct RoutingTable {
    local: NodeId,
    bucket_size: usize,
    buckets: Vec<VecDeque<Entry>>,
}

impl RoutingTable {
    /// Create an empty table centred on `local`
    pub fn new(local: NodeId, bucket_size: usize) -> Self {
        Self {
            local,
            bucket_size: bucket_size.max(1),
            buckets: (0..NUM_BUCKETS).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Local node id
    pub fn local_id(&self) -> NodeId {
        self.local
    }

    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        self.local.log2_distance(id).map(|d| d - 1)
    }

    /// Insert or refresh a record
    ///
    /// A refreshed entry moves to the most-recently-seen end. A record with
    /// a lower sequence number than the stored one only refreshes liveness.
    pub fn insert(&mut self, record: NodeRecord) -> InsertOutcome {
        let Some(index) = self.bucket_index(&record.node_id()) else {
            return InsertOutcome::IgnoredSelf;
        };
        let bucket_size = self.bucket_size;
        let bucket = &mut self.buckets[index];
        let now = Instant::now();

        if let Some(pos) = bucket
            .iter()
            .position(|e| e.record.node_id() == record.node_id())
        {
            if let Some(mut entry) = bucket.remove(pos) {
                if record.seq() >= entry.record.seq() {
                    entry.record = record;
                }
                entry.last_seen = now;
                bucket.push_back(entry);
            }
            return InsertOutcome::Updated;
        }

        let evicted = if bucket.len() >= bucket_size {
            bucket.pop_front().map(|e| e.record.node_id())
        } else {
            None
        };
        bucket.push_back(Entry {
            record,
            last_seen: now,
        });
        match evicted {
            Some(id) => InsertOutcome::Evicted(id),
            None => InsertOutcome::Inserted,
        }
    }

    /// Mark a node as seen now
    pub fn touch(&mut self, id: &NodeId) -> bool {
        let Some(index) = self.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        match bucket.iter().position(|e| e.record.node_id() == *id) {
            Some(pos) => {
                if let Some(mut entry) = bucket.remove(pos) {
                    entry.last_seen = Instant::now();
                    bucket.push_back(entry);
                }
                true
            }
            None => false,
        }
    }

    /// Remove a node
    pub fn remove(&mut self, id: &NodeId) -> Option<NodeRecord> {
        let index = self.bucket_index(id)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.iter().position(|e| e.record.node_id() == *id)?;
        bucket.remove(pos).map(|e| e.record)
    }

    /// Look up a node
    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        let index = self.bucket_index(id)?;
        self.buckets[index]
            .iter()
            .find(|e| e.record.node_id() == *id)
            .map(|e| &e.record)
    }

    /// Up to `n` records closest to `target`, nearest first
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<NodeRecord> {
        let mut all: Vec<&NodeRecord> = self.iter().collect();
        all.sort_by(|a, b| target.cmp_distance(&a.node_id(), &b.node_id()));
        all.into_iter().take(n).cloned().collect()
    }

    /// All stored records
    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.buckets.iter().flatten().map(|e| &e.record)
    }

    /// Records in the bucket at log2 distance `distance` (1..=256)
    pub fn bucket(&self, distance: usize) -> Vec<NodeRecord> {
        if distance == 0 || distance > NUM_BUCKETS {
            return Vec::new();
        }
        self.buckets[distance - 1]
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }
}
