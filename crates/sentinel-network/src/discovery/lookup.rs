//! Iterative node lookup
//!
//! ```text
//! Idle -> Querying -> Collecting -+-> Querying ...
//!                                 +-> Converged            -> Done
//!                                 +-> RoundBudgetExhausted -> Done
//! ```
//!
//! Each round queries the `alpha` closest unqueried candidates. When a round
//! brings no closer node, one final sweep queries every unqueried candidate
//! among the `k` closest before the lookup converges.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, trace};

use super::record::NodeRecord;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::NodeId;

/// Remote `FindNode` capability used by [`Lookup`]
#[async_trait]
pub trait FindNode: Send + Sync {
    /// Ask `peer` for the nodes it knows closest to `target`
    async fn find_node(&self, peer: &NodeRecord, target: NodeId) -> DiscoveryResult<Vec<NodeRecord>>;
}

/// Lookup parameters
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Concurrent queries per round
    pub alpha: usize,
    /// Result size
    pub k: usize,
    /// Round budget
    pub max_rounds: usize,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            alpha: 3,
            k: 16,
            max_rounds: 8,
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Lookup progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    /// Not started
    Idle,
    /// Queries in flight
    Querying,
    /// Merging responses
    Collecting,
    /// No closer node found
    Converged,
    /// Round budget used up
    RoundBudgetExhausted,
    /// Finished
    Done,
}

/// Why a lookup stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No closer node found
    Converged,
    /// Round budget used up
    RoundBudgetExhausted,
}

/// Lookup outcome
#[derive(Debug, Clone)]
pub struct LookupResult {
    /// Lookup target
    pub target: NodeId,
    /// Up to `k` responsive nodes, nearest first
    pub nodes: Vec<NodeRecord>,
    /// Rounds executed
    pub rounds: usize,
    /// Why the lookup stopped
    pub termination: Termination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateStatus {
    Pending,
    Responded,
}

#[derive(Debug, Clone)]
struct Candidate {
    record: NodeRecord,
    status: CandidateStatus,
}

/// A single iterative lookup
#[derive(Debug)]
pub struct Lookup {
    local: NodeId,
    target: NodeId,
    config: LookupConfig,
    state: LookupState,
    // keyed by XOR distance to target; unresponsive nodes are removed
    candidates: BTreeMap<[u8; 32], Candidate>,
    rounds: usize,
}

impl Lookup {
    /// Create a lookup for `target` seeded with `seeds`
    pub fn new(local: NodeId, target: NodeId, config: LookupConfig, seeds: Vec<NodeRecord>) -> Self {
        let mut lookup = Self {
            local,
            target,
            config,
            state: LookupState::Idle,
            candidates: BTreeMap::new(),
            rounds: 0,
        };
        for record in seeds {
            lookup.add_candidate(record);
        }
        lookup
    }

    /// Current state
    pub fn state(&self) -> LookupState {
        self.state
    }

    fn add_candidate(&mut self, record: NodeRecord) {
        let id = record.node_id();
        if id == self.local {
            return;
        }
        self.candidates
            .entry(self.target.distance(&id))
            .or_insert(Candidate {
                record,
                status: CandidateStatus::Pending,
            });
    }

    fn best_distance(&self) -> Option<[u8; 32]> {
        self.candidates.keys().next().copied()
    }

    fn next_batch(&self, sweep: bool) -> Vec<([u8; 32], NodeRecord)> {
        let pending = |(key, c): (&[u8; 32], &Candidate)| {
            (c.status == CandidateStatus::Pending).then(|| (*key, c.record.clone()))
        };
        if sweep {
            self.candidates
                .iter()
                .take(self.config.k)
                .filter_map(pending)
                .collect()
        } else {
            self.candidates
                .iter()
                .filter_map(pending)
                .take(self.config.alpha)
                .collect()
        }
    }

    /// Drive the lookup to completion
    pub async fn run<F: FindNode + ?Sized>(mut self, finder: &F) -> LookupResult {
        let mut sweeping = false;
        let termination = loop {
            if self.rounds >= self.config.max_rounds {
                self.state = LookupState::RoundBudgetExhausted;
                break Termination::RoundBudgetExhausted;
            }
            let batch = self.next_batch(sweeping);
            if batch.is_empty() {
                self.state = LookupState::Converged;
                break Termination::Converged;
            }

            self.state = LookupState::Querying;
            self.rounds += 1;
            let best_before = self.best_distance();
            trace!(target = %self.target, round = self.rounds, queries = batch.len(), "Lookup round");

            let timeout = self.config.request_timeout;
            let target = self.target;
            let responses = join_all(batch.iter().map(|(_, record)| async move {
                match tokio::time::timeout(timeout, finder.find_node(record, target)).await {
                    Ok(result) => result,
                    Err(_) => Err(DiscoveryError::Timeout(record.node_id().to_string())),
                }
            }))
            .await;

            self.state = LookupState::Collecting;
            for ((key, record), response) in batch.into_iter().zip(responses) {
                match response {
                    Ok(found) => {
                        if let Some(c) = self.candidates.get_mut(&key) {
                            c.status = CandidateStatus::Responded;
                        }
                        for r in found {
                            self.add_candidate(r);
                        }
                    }
                    Err(e) => {
                        debug!(node = %record.node_id(), error = %e, "Dropping unresponsive node");
                        self.candidates.remove(&key);
                    }
                }
            }

            let improved = match (best_before, self.best_distance()) {
                (Some(before), Some(after)) => after < before,
                (None, Some(_)) => true,
                _ => false,
            };
            if improved {
                sweeping = false;
            } else if sweeping {
                self.state = LookupState::Converged;
                break Termination::Converged;
            } else {
                sweeping = true;
            }
        };

        self.state = LookupState::Done;
        let nodes = self
            .candidates
            .into_values()
            .filter(|c| c.status == CandidateStatus::Responded)
            .take(self.config.k)
            .map(|c| c.record)
            .collect();
        LookupResult {
            target: self.target,
            nodes,
            rounds: self.rounds,
            termination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::identity::NodeIdentity;
    use crate::discovery::table::RoutingTable;
    use std::collections::{HashMap, HashSet};

    struct SyntheticNetwork {
        tables: HashMap<NodeId, RoutingTable>,
        unresponsive: HashSet<NodeId>,
        k: usize,
    }

    impl SyntheticNetwork {
        fn new(size: usize, bucket_size: usize) -> (Self, Vec<NodeRecord>) {
            let records: Vec<NodeRecord> = (0..size)
                .map(|i| {
                    let identity = NodeIdentity::generate();
                    NodeRecord::signed(
                        &identity,
                        1,
                        "127.0.0.1".parse().unwrap(),
                        20_000 + i as u16,
                        20_000 + i as u16,
                        0,
                    )
                    .unwrap()
                })
                .collect();
            let mut tables = HashMap::new();
            for record in &records {
                let mut table = RoutingTable::new(record.node_id(), bucket_size);
                for other in &records {
                    table.insert(other.clone());
                }
                tables.insert(record.node_id(), table);
            }
            let network = Self {
                tables,
                unresponsive: HashSet::new(),
                k: 16,
            };
            (network, records)
        }
    }

    #[async_trait]
    impl FindNode for SyntheticNetwork {
        async fn find_node(&self, peer: &NodeRecord, target: NodeId) -> DiscoveryResult<Vec<NodeRecord>> {
            if self.unresponsive.contains(&peer.node_id()) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.tables
                .get(&peer.node_id())
                .map(|t| t.closest(&target, self.k))
                .ok_or_else(|| DiscoveryError::UnexpectedResponse("unknown node".into()))
        }
    }

    fn config() -> LookupConfig {
        LookupConfig {
            alpha: 3,
            k: 16,
            max_rounds: 10,
            request_timeout: Duration::from_millis(50),
        }
    }

    fn expected_closest(records: &[NodeRecord], target: &NodeId, skip: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = records
            .iter()
            .map(|r| r.node_id())
            .filter(|id| !skip.contains(id))
            .collect();
        ids.sort_by(|a, b| target.cmp_distance(a, b));
        ids
    }

    #[tokio::test]
    async fn test_lookup_converges_on_synthetic_network() {
        let (network, records) = SyntheticNetwork::new(32, 16);
        let local = NodeId::random();
        let target = NodeId::random();

        let lookup = Lookup::new(local, target, config(), records[..3].to_vec());
        assert_eq!(lookup.state(), LookupState::Idle);
        let result = lookup.run(&network).await;

        assert_eq!(result.termination, Termination::Converged);
        assert!(result.rounds <= 10);
        assert_eq!(result.nodes.len(), 16);

        let expected = expected_closest(&records, &target, &HashSet::new());
        assert_eq!(result.nodes[0].node_id(), expected[0]);
        for pair in result.nodes.windows(2) {
            assert_eq!(
                target.cmp_distance(&pair[0].node_id(), &pair[1].node_id()),
                std::cmp::Ordering::Less
            );
        }
    }

    #[tokio::test]
    async fn test_lookup_full_knowledge_returns_exact_closest() {
        let (network, records) = SyntheticNetwork::new(24, 64);
        let target = NodeId::random();
        let result = Lookup::new(NodeId::random(), target, config(), vec![records[0].clone()])
            .run(&network)
            .await;

        let got: Vec<NodeId> = result.nodes.iter().map(|r| r.node_id()).collect();
        let expected = expected_closest(&records, &target, &HashSet::new());
        assert_eq!(got, expected[..16].to_vec());
    }

    #[tokio::test]
    async fn test_unresponsive_nodes_dropped() {
        let (mut network, records) = SyntheticNetwork::new(24, 64);
        let target = NodeId::random();
        let all = expected_closest(&records, &target, &HashSet::new());
        let dead: HashSet<NodeId> = all[..2].iter().copied().collect();
        network.unresponsive = dead.clone();

        let seed = records
            .iter()
            .find(|r| !dead.contains(&r.node_id()))
            .cloned()
            .unwrap();
        let result = Lookup::new(NodeId::random(), target, config(), vec![seed])
            .run(&network)
            .await;

        assert!(result.nodes.iter().all(|r| !dead.contains(&r.node_id())));
        let expected = expected_closest(&records, &target, &dead);
        assert_eq!(result.nodes[0].node_id(), expected[0]);
    }

    #[tokio::test]
    async fn test_round_budget() {
        let (network, records) = SyntheticNetwork::new(24, 64);
        let config = LookupConfig {
            max_rounds: 1,
            ..config()
        };
        let result = Lookup::new(NodeId::random(), NodeId::random(), config, records[..3].to_vec())
            .run(&network)
            .await;
        assert_eq!(result.rounds, 1);
        assert_eq!(result.termination, Termination::RoundBudgetExhausted);
    }

    #[tokio::test]
    async fn test_lookup_without_seeds() {
        let (network, _) = SyntheticNetwork::new(4, 16);
        let result = Lookup::new(NodeId::random(), NodeId::random(), config(), Vec::new())
            .run(&network)
            .await;
        assert!(result.nodes.is_empty());
        assert_eq!(result.rounds, 0);
        assert_eq!(result.termination, Termination::Converged);
    }

    #[tokio::test]
    async fn test_local_id_excluded() {
        let (network, records) = SyntheticNetwork::new(8, 16);
        let local = records[0].node_id();
        let result = Lookup::new(local, NodeId::random(), config(), records.clone())
            .run(&network)
            .await;
        assert!(result.nodes.iter().all(|r| r.node_id() != local));
    }
}
