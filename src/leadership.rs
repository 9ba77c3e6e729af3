//! Partition leader selection.
//!
//! Each policy is a pure function over a [`ClusterState`] snapshot: given a
//! partition and its current [`LeaderAndIsr`], it either produces the next
//! leadership state plus the brokers that must hear about it, or a typed
//! failure the controller decides how to escalate. Nothing in here persists
//! state; committing the result is the caller's job.

use std::collections::{HashMap, HashSet};

use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::{BrokerId, LeaderAndIsr, TopicPartition};

/// Counter bumped on every data-loss (out-of-ISR) election.
pub const UNCLEAN_ELECTIONS_TOTAL: &str = "rsbroker_unclean_leader_elections_total";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// No eligible replica is online; the caller escalates.
    #[error("No replica online for {partition}: {reason}")]
    NoReplicaOnline {
        partition: TopicPartition,
        reason: String,
    },

    /// The requested transition is already in effect; the caller suppresses.
    #[error("Leader election not needed for {partition}: {reason}")]
    ElectionNotNeeded {
        partition: TopicPartition,
        reason: String,
    },

    /// Invariants ruled out the transition; the partition keeps its state.
    #[error("State change failed for {partition}: {reason}")]
    StateChangeFailed {
        partition: TopicPartition,
        reason: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Controller view of the cluster, read-only to the selectors.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub live_brokers: HashSet<BrokerId>,
    pub shutting_down: HashSet<BrokerId>,
    pub partition_assignment: HashMap<TopicPartition, Vec<BrokerId>>,
    pub leader_info: HashMap<TopicPartition, LeaderAndIsr>,
    /// Topics for which electing a leader outside the ISR is permitted.
    pub unclean_election_enabled: HashMap<String, bool>,
}

impl ClusterState {
    pub fn is_live(&self, id: BrokerId) -> bool {
        self.live_brokers.contains(&id)
    }

    fn unclean_allowed(&self, topic: &str) -> bool {
        self.unclean_election_enabled
            .get(topic)
            .copied()
            .unwrap_or(false)
    }

    fn assigned_replicas(&self, partition: &TopicPartition) -> Result<&[BrokerId]> {
        self.partition_assignment
            .get(partition)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::NoReplicaOnline {
                partition: partition.clone(),
                reason: "partition has no assigned replicas".to_string(),
            })
    }
}

/// Outcome of a successful election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    pub leader_and_isr: LeaderAndIsr,
    /// Brokers that must receive the leadership-change notification.
    pub notify: Vec<BrokerId>,
}

/// The election policies the controller dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionPolicy {
    /// The previous leader died.
    Offline,

    /// A reassignment completed and leadership must move into the target
    /// replica set.
    Reassigned { targets: Vec<BrokerId> },

    /// Rebalance leadership back onto the preferred replica.
    PreferredReplica,

    /// A broker is being shut down cleanly and must shed leadership.
    ControlledShutdown,

    /// Leave leadership as it is.
    NoOp,
}

impl ElectionPolicy {
    /// Choose the next leader and ISR for `partition`.
    ///
    /// Every successful transition (all policies but [`Self::NoOp`]) bumps
    /// `leader_epoch` and `zk_version` by one.
    pub fn select(
        &self,
        state: &ClusterState,
        partition: &TopicPartition,
        current: &LeaderAndIsr,
    ) -> Result<Election> {
        match self {
            Self::Offline => select_offline(state, partition, current),
            Self::Reassigned { targets } => select_reassigned(state, partition, current, targets),
            Self::PreferredReplica => select_preferred(state, partition, current),
            Self::ControlledShutdown => select_controlled_shutdown(state, partition, current),
            Self::NoOp => {
                let notify = state
                    .partition_assignment
                    .get(partition)
                    .cloned()
                    .unwrap_or_default();
                Ok(Election {
                    leader_and_isr: current.clone(),
                    notify,
                })
            }
        }
    }
}

fn advanced(current: &LeaderAndIsr, leader: BrokerId, isr: Vec<BrokerId>) -> LeaderAndIsr {
    LeaderAndIsr::new(
        leader,
        current.leader_epoch + 1,
        isr,
        current.zk_version + 1,
    )
}

fn select_offline(
    state: &ClusterState,
    partition: &TopicPartition,
    current: &LeaderAndIsr,
) -> Result<Election> {
    let assigned = state.assigned_replicas(partition)?;
    let live_assigned: Vec<BrokerId> = assigned
        .iter()
        .copied()
        .filter(|r| state.is_live(*r))
        .collect();
    let live_isr: Vec<BrokerId> = current
        .isr
        .iter()
        .copied()
        .filter(|r| state.is_live(*r))
        .collect();

    if !live_isr.is_empty() {
        // "first" is assigned-replica order, never ISR order
        let leader = assigned
            .iter()
            .copied()
            .find(|r| live_isr.contains(r))
            .ok_or_else(|| Error::StateChangeFailed {
                partition: partition.clone(),
                reason: "ISR contains no assigned replica".to_string(),
            })?;
        debug!(%partition, leader, "elected new leader from the live ISR");
        return Ok(Election {
            leader_and_isr: advanced(current, leader, live_isr),
            notify: live_assigned,
        });
    }

    if !state.unclean_allowed(&partition.topic) {
        return Err(Error::NoReplicaOnline {
            partition: partition.clone(),
            reason: format!(
                "no broker in the ISR {:?} is alive and unclean election is disabled",
                current.isr
            ),
        });
    }

    if live_assigned.is_empty() {
        return Err(Error::NoReplicaOnline {
            partition: partition.clone(),
            reason: format!("no assigned replica of {:?} is alive", assigned),
        });
    }

    // Data-loss transition: the new leader was not in sync.
    let leader = live_assigned[0];
    counter!(UNCLEAN_ELECTIONS_TOTAL).increment(1);
    warn!(
        %partition,
        leader,
        isr = ?current.isr,
        "electing leader outside the ISR; committed data may be lost"
    );
    Ok(Election {
        leader_and_isr: advanced(current, leader, vec![leader]),
        notify: live_assigned,
    })
}

fn select_reassigned(
    state: &ClusterState,
    partition: &TopicPartition,
    current: &LeaderAndIsr,
    targets: &[BrokerId],
) -> Result<Election> {
    if targets.is_empty() {
        return Err(Error::NoReplicaOnline {
            partition: partition.clone(),
            reason: "empty reassignment".to_string(),
        });
    }

    let leader = targets
        .iter()
        .copied()
        .find(|r| state.is_live(*r) && current.isr.contains(r))
        .ok_or_else(|| Error::NoReplicaOnline {
            partition: partition.clone(),
            reason: format!(
                "none of the reassigned replicas {:?} are alive and in the ISR {:?}",
                targets, current.isr
            ),
        })?;

    Ok(Election {
        leader_and_isr: advanced(current, leader, current.isr.clone()),
        notify: targets.to_vec(),
    })
}

fn select_preferred(
    state: &ClusterState,
    partition: &TopicPartition,
    current: &LeaderAndIsr,
) -> Result<Election> {
    let assigned = state.assigned_replicas(partition)?;
    let preferred = assigned[0];

    if preferred == current.leader {
        return Err(Error::ElectionNotNeeded {
            partition: partition.clone(),
            reason: format!("preferred replica {} is already the leader", preferred),
        });
    }

    if state.is_live(preferred) && current.isr.contains(&preferred) {
        Ok(Election {
            leader_and_isr: advanced(current, preferred, current.isr.clone()),
            notify: assigned.to_vec(),
        })
    } else {
        Err(Error::StateChangeFailed {
            partition: partition.clone(),
            reason: format!(
                "preferred replica {} is either offline or not in the ISR {:?}",
                preferred, current.isr
            ),
        })
    }
}

fn select_controlled_shutdown(
    state: &ClusterState,
    partition: &TopicPartition,
    current: &LeaderAndIsr,
) -> Result<Election> {
    let assigned = state.assigned_replicas(partition)?;
    let live_or_shutting_down: Vec<BrokerId> = assigned
        .iter()
        .copied()
        .filter(|r| state.is_live(*r) || state.shutting_down.contains(r))
        .collect();
    let new_isr: Vec<BrokerId> = current
        .isr
        .iter()
        .copied()
        .filter(|r| !state.shutting_down.contains(r))
        .collect();

    let leader = live_or_shutting_down
        .iter()
        .copied()
        .find(|r| new_isr.contains(r))
        .ok_or_else(|| Error::StateChangeFailed {
            partition: partition.clone(),
            reason: format!(
                "no replica in the ISR {:?} remains once brokers {:?} shut down",
                current.isr, state.shutting_down
            ),
        })?;

    Ok(Election {
        leader_and_isr: advanced(current, leader, new_isr),
        notify: live_or_shutting_down,
    })
}
