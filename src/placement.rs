//! Deterministic assignment of partition replicas onto brokers.
//!
//! The goals, in priority order:
//!
//! 1. Spread replicas evenly across brokers.
//! 2. Do not place two replicas of one partition on the same broker.
//! 3. With rack information, spread each partition's replicas across as many
//!    racks as possible.
//!
//! Both modes pick a start index for the leaders and a rotating shift for
//! the followers, so consecutive partitions get distinct follower sets and
//! the same inputs always produce the same layout. Random starts come from
//! the caller-supplied rng; fixing them makes the output reproducible, which
//! is also how an existing topic is extended without disturbing its layout.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::cluster::{BrokerId, BrokerMetadata};
use crate::config::RackAwareMode;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Number of partitions must be positive, got {0}")]
    InvalidPartitionCount(i32),

    #[error("Replication factor must be positive, got {0}")]
    InvalidReplicationFactor(i32),

    #[error("Replication factor {replication_factor} cannot exceed broker count {brokers}")]
    ReplicationFactorTooLarge {
        replication_factor: i32,
        brokers: usize,
    },

    #[error("Duplicate broker id {0} among candidates")]
    DuplicateBroker(BrokerId),

    #[error("No candidate brokers")]
    NoBrokers,

    #[error("Rack information is partial: broker {0} has no rack")]
    PartialRackInfo(BrokerId),

    #[error("Existing assignment is empty or lacks partition 0")]
    MissingExistingAssignment,

    #[error("Existing assignment has inconsistent replica counts")]
    InconsistentReplicaCount,

    #[error("Broker {0} from the existing assignment is not a candidate")]
    UnknownBroker(BrokerId),

    #[error("Follower scan did not converge for partition {0}")]
    ScanDidNotConverge(i32),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Replica lists keyed by partition id; index 0 is the preferred replica.
pub type Assignment = BTreeMap<i32, Vec<BrokerId>>;

/// Assign `n_partitions` partition replica lists onto `brokers`, with start
/// positions drawn from `rng`.
pub fn assign_replicas_with_rng(
    brokers: &[BrokerMetadata],
    n_partitions: i32,
    replication_factor: i32,
    mode: RackAwareMode,
    rng: &mut impl Rng,
) -> Result<Assignment> {
    let plan = Plan::new(brokers, replication_factor, mode)?;
    let n = plan.candidates.len();
    plan.run(
        n_partitions,
        replication_factor,
        rng.gen_range(0..n),
        0,
        rng.gen_range(0..n),
    )
}

/// Like [`assign_replicas_with_rng`] but with pinned start positions.
///
/// `fixed_start_index` seeds both the leader start index and the follower
/// shift; `start_partition` is the id of the first emitted partition. With
/// both pinned the output is bitwise reproducible.
pub fn assign_replicas_with_starts(
    brokers: &[BrokerMetadata],
    n_partitions: i32,
    replication_factor: i32,
    mode: RackAwareMode,
    fixed_start_index: usize,
    start_partition: i32,
) -> Result<Assignment> {
    let plan = Plan::new(brokers, replication_factor, mode)?;
    let n = plan.candidates.len();
    plan.run(
        n_partitions,
        replication_factor,
        fixed_start_index % n,
        start_partition.max(0),
        fixed_start_index % n,
    )
}

/// Compute replica lists for `additional` partitions appended to `existing`.
///
/// The replica count is taken from partition 0 of the existing assignment
/// and the start index from the position of its preferred replica, so the
/// continuation is consistent with the original layout. Only the new
/// partitions are returned.
pub fn extend_assignment(
    brokers: &[BrokerMetadata],
    existing: &Assignment,
    additional: i32,
    mode: RackAwareMode,
) -> Result<Assignment> {
    if additional <= 0 {
        return Err(Error::InvalidPartitionCount(additional));
    }
    let first = existing.get(&0).ok_or(Error::MissingExistingAssignment)?;
    let replication_factor = first.len() as i32;
    if replication_factor == 0 {
        return Err(Error::MissingExistingAssignment);
    }
    if existing.values().any(|r| r.len() != first.len()) {
        return Err(Error::InconsistentReplicaCount);
    }

    let plan = Plan::new(brokers, replication_factor, mode)?;
    let head = first[0];
    let start_index = plan
        .candidates
        .iter()
        .position(|id| *id == head)
        .ok_or(Error::UnknownBroker(head))?;

    plan.run(
        additional,
        replication_factor,
        start_index,
        existing.len() as i32,
        start_index,
    )
}

/// Validated candidate list plus rack lookup, ready to run the shift scheme.
struct Plan {
    /// Candidate brokers: ascending id order, or the rack-alternated
    /// interleaving when rack-aware.
    candidates: Vec<BrokerId>,
    /// Empty when rack-unaware.
    rack_of: HashMap<BrokerId, String>,
    num_racks: usize,
}

impl Plan {
    fn new(
        brokers: &[BrokerMetadata],
        replication_factor: i32,
        mode: RackAwareMode,
    ) -> Result<Self> {
        if brokers.is_empty() {
            return Err(Error::NoBrokers);
        }
        if replication_factor <= 0 {
            return Err(Error::InvalidReplicationFactor(replication_factor));
        }
        if replication_factor as usize > brokers.len() {
            return Err(Error::ReplicationFactorTooLarge {
                replication_factor,
                brokers: brokers.len(),
            });
        }
        let mut seen = HashSet::new();
        for b in brokers {
            if !seen.insert(b.id) {
                return Err(Error::DuplicateBroker(b.id));
            }
        }

        let tagged = brokers.iter().filter(|b| b.rack.is_some()).count();
        let rack_aware = match mode {
            RackAwareMode::Disabled => false,
            RackAwareMode::Safe => {
                if tagged > 0 && tagged < brokers.len() {
                    debug!(
                        tagged,
                        total = brokers.len(),
                        "partial rack information, downgrading to rack-unaware placement"
                    );
                }
                tagged == brokers.len()
            }
            RackAwareMode::Enforced => {
                if tagged > 0 && tagged < brokers.len() {
                    let missing = brokers
                        .iter()
                        .find(|b| b.rack.is_none())
                        .expect("partial rack info implies an untagged broker");
                    return Err(Error::PartialRackInfo(missing.id));
                }
                tagged == brokers.len()
            }
        };

        if rack_aware {
            let mut by_rack: BTreeMap<&str, Vec<BrokerId>> = BTreeMap::new();
            for b in brokers {
                by_rack
                    .entry(b.rack.as_deref().expect("rack-aware mode requires racks"))
                    .or_default()
                    .push(b.id);
            }
            for ids in by_rack.values_mut() {
                ids.sort_unstable();
            }

            let num_racks = by_rack.len();
            let mut rack_of = HashMap::with_capacity(brokers.len());
            for (rack, ids) in &by_rack {
                for id in ids {
                    rack_of.insert(*id, (*rack).to_string());
                }
            }

            // Interleave racks round-robin so adjacent candidates sit on
            // different racks wherever rack sizes permit.
            let mut cursors: Vec<std::slice::Iter<'_, BrokerId>> =
                by_rack.values().map(|ids| ids.iter()).collect();
            let mut candidates = Vec::with_capacity(brokers.len());
            while candidates.len() < brokers.len() {
                for cursor in &mut cursors {
                    if let Some(id) = cursor.next() {
                        candidates.push(*id);
                    }
                }
            }

            Ok(Self {
                candidates,
                rack_of,
                num_racks,
            })
        } else {
            let mut candidates: Vec<BrokerId> = brokers.iter().map(|b| b.id).collect();
            candidates.sort_unstable();
            Ok(Self {
                candidates,
                rack_of: HashMap::new(),
                num_racks: 0,
            })
        }
    }

    fn run(
        &self,
        n_partitions: i32,
        replication_factor: i32,
        start_index: usize,
        start_partition: i32,
        mut next_replica_shift: usize,
    ) -> Result<Assignment> {
        if n_partitions <= 0 {
            return Err(Error::InvalidPartitionCount(n_partitions));
        }

        let n = self.candidates.len();
        let rack_aware = !self.rack_of.is_empty();
        let mut assignment = Assignment::new();
        let mut partition = start_partition.max(0);

        for _ in 0..n_partitions {
            if partition > 0 && partition as usize % n == 0 {
                next_replica_shift += 1;
            }
            let first = (partition as usize + start_index) % n;
            let leader = self.candidates[first];

            let replicas = if rack_aware {
                self.pick_rack_aware(partition, first, leader, replication_factor, next_replica_shift)?
            } else {
                let mut replicas = vec![leader];
                for j in 0..replication_factor as usize - 1 {
                    replicas.push(self.candidates[replica_index(first, next_replica_shift, j, n)]);
                }
                replicas
            };

            assignment.insert(partition, replicas);
            partition += 1;
        }

        Ok(assignment)
    }

    /// Select the followers of one partition under the rack constraints:
    /// prefer unused racks while any rack lacks a replica, and unused
    /// brokers while any broker lacks one.
    fn pick_rack_aware(
        &self,
        partition: i32,
        first: usize,
        leader: BrokerId,
        replication_factor: i32,
        shift: usize,
    ) -> Result<Vec<BrokerId>> {
        let n = self.candidates.len();
        let mut replicas = vec![leader];
        let mut racks_used: BTreeSet<&str> = BTreeSet::new();
        racks_used.insert(&self.rack_of[&leader]);
        let mut brokers_used: BTreeSet<BrokerId> = BTreeSet::new();
        brokers_used.insert(leader);

        // k advances across followers so the rotation continues where the
        // previous follower left off.
        let mut k = 0;
        for _ in 0..replication_factor as usize - 1 {
            let mut scanned = 0;
            loop {
                // One sweep over the candidates must produce a legal
                // follower; anything longer loops forever.
                if scanned > 2 * n {
                    return Err(Error::ScanDidNotConverge(partition));
                }
                let broker =
                    self.candidates[replica_index(first, shift * self.num_racks, k, n)];
                let rack = self.rack_of[&broker].as_str();
                k += 1;
                scanned += 1;

                let rack_ok = !racks_used.contains(rack) || racks_used.len() == self.num_racks;
                let broker_ok = !brokers_used.contains(&broker) || brokers_used.len() == n;
                if rack_ok && broker_ok {
                    replicas.push(broker);
                    racks_used.insert(self.rack_of[&broker].as_str());
                    brokers_used.insert(broker);
                    break;
                }
            }
        }

        Ok(replicas)
    }
}

/// Follower slot for replica `j` of the partition whose leader sits at
/// `first`: one past the leader, rotated by the per-epoch shift, and never
/// wrapping onto the leader itself.
fn replica_index(first: usize, shift: usize, j: usize, n: usize) -> usize {
    let hop = 1 + (shift + j) % (n - 1);
    (first + hop) % n
}
