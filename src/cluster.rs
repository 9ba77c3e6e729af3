//! Cluster-wide metadata entities shared by the controller-side algorithms
//! and the network client.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::messages::MetadataResponse;

/// Broker identity. Two brokers with the same id are indistinguishable.
pub type BrokerId = i32;

/// A broker as the placement algorithm sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    /// The broker ID.
    pub id: BrokerId,

    /// Fault-domain tag, if the deployment assigns one.
    pub rack: Option<String>,
}

impl BrokerMetadata {
    pub fn new(id: BrokerId, rack: Option<String>) -> Self {
        Self { id, rack }
    }
}

/// A connectable endpoint of a broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    /// The broker ID.
    pub id: BrokerId,

    /// The broker hostname.
    pub host: String,

    /// The broker port.
    pub port: i32,
}

impl Node {
    pub fn new(id: BrokerId, host: impl Into<String>, port: i32) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// True if this node cannot be connected to.
    ///
    /// Empty nodes are rejected at API boundaries.
    pub fn is_empty(&self) -> bool {
        self.host.is_empty() || self.port < 0
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (id: {})", self.host, self.port, self.id)
    }
}

/// Topic/partition pair keying all per-partition state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.topic, self.partition)
    }
}

/// Per-partition placement and sync state within a [`Cluster`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Current leader, or `None` while leadership is unavailable.
    pub leader: Option<BrokerId>,

    /// All replicas hosting the partition, preferred replica first.
    pub replicas: Vec<BrokerId>,

    /// Replicas currently in sync with the leader.
    pub isr: Vec<BrokerId>,
}

/// Leadership state of one partition as persisted by the controller.
///
/// Invariants: `leader` is a member of `isr`, and `isr` is a subset of the
/// assigned replicas. `leader_epoch` and `zk_version` only ever grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderAndIsr {
    pub leader: BrokerId,
    pub leader_epoch: i32,
    pub isr: Vec<BrokerId>,
    pub zk_version: i32,
}

impl LeaderAndIsr {
    pub fn new(leader: BrokerId, leader_epoch: i32, isr: Vec<BrokerId>, zk_version: i32) -> Self {
        Self {
            leader,
            leader_epoch,
            isr,
            zk_version,
        }
    }
}

/// Immutable snapshot of the cluster as known to a client.
///
/// Created from the bootstrap node list at construction and replaced
/// atomically on every successful metadata refresh. Never mutated in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cluster {
    nodes: Vec<Node>,
    topics: HashMap<String, BTreeMap<i32, PartitionInfo>>,
    bootstrap: bool,
}

impl Cluster {
    /// Cluster view seeded from configured bootstrap endpoints only.
    pub fn bootstrap(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            topics: HashMap::new(),
            bootstrap: true,
        }
    }

    pub fn new(nodes: Vec<Node>, topics: HashMap<String, BTreeMap<i32, PartitionInfo>>) -> Self {
        Self {
            nodes,
            topics,
            bootstrap: false,
        }
    }

    /// Build a snapshot from a metadata response body.
    pub fn from_metadata(response: &MetadataResponse) -> Self {
        let nodes = response
            .brokers
            .iter()
            .map(|b| Node::new(b.node_id.0, b.host.0.clone(), b.port.0))
            .collect();

        let mut topics: HashMap<String, BTreeMap<i32, PartitionInfo>> = HashMap::new();
        for topic in &response.topics {
            let partitions = topics.entry(topic.name.0.clone()).or_default();
            for p in &topic.partitions {
                partitions.insert(
                    p.partition_index.0,
                    PartitionInfo {
                        leader: (p.leader_id.0 >= 0).then_some(p.leader_id.0),
                        replicas: p
                            .replica_nodes
                            .0
                            .iter()
                            .flatten()
                            .map(|id| id.0)
                            .collect(),
                        isr: p.isr_nodes.0.iter().flatten().map(|id| id.0).collect(),
                    },
                );
            }
        }

        Self {
            nodes,
            topics,
            bootstrap: false,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_by_id(&self, id: BrokerId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn partition(&self, tp: &TopicPartition) -> Option<&PartitionInfo> {
        self.topics.get(&tp.topic)?.get(&tp.partition)
    }

    pub fn partitions_for(&self, topic: &str) -> Option<&BTreeMap<i32, PartitionInfo>> {
        self.topics.get(topic)
    }

    /// True if this snapshot still only reflects bootstrap configuration.
    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }
}
