//! Client surface of the hierarchical coordination store.
//!
//! The controller persists assignments and configuration under well-known
//! paths; admin tooling and brokers watch them for changes. Only the store
//! operations this crate depends on are modeled. [`MemoryStore`] is the
//! in-process implementation used by tests and single-node setups.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::cluster::BrokerId;
use crate::placement::Assignment;

/// Payload schema version understood by this crate.
const DATA_VERSION: i32 = 1;

pub fn topic_path(topic: &str) -> String {
    format!("/brokers/topics/{}", topic)
}

pub const TOPICS_PATH: &str = "/brokers/topics";

pub fn entity_config_path(entity_type: &str, name: &str) -> String {
    format!("/config/{}/{}", entity_type, name)
}

pub const CONFIG_CHANGES_PATH: &str = "/config/changes";

/// Prefix of sequential config-change notification nodes.
pub fn config_change_prefix() -> String {
    format!("{}/config_change_", CONFIG_CHANGES_PATH)
}

pub fn delete_topic_path(topic: &str) -> String {
    format!("/admin/delete_topics/{}", topic)
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Malformed payload at {path}: {source}")]
    Payload {
        path: String,
        source: serde_json::Error,
    },

    #[error("Unsupported data version {version} at {path}")]
    UnsupportedVersion { path: String, version: i32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Change notification delivered to subscribers registered via
/// [`CoordinationStore::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { path: String, data: String },
    Delete { path: String },
}

pub type WatchHandler = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// The store operations the admin and controller layers depend on.
pub trait CoordinationStore {
    fn exists(&self, path: &str) -> Result<bool>;

    /// Read a node's payload; `None` if the node does not exist.
    fn read(&self, path: &str) -> Result<Option<String>>;

    /// Create a node, failing if it already exists.
    fn create_persistent(&self, path: &str, data: &str) -> Result<()>;

    /// Create a node or overwrite its payload.
    fn update_persistent(&self, path: &str, data: &str) -> Result<()>;

    /// Create a node at `prefix` plus the next sequence number, returning
    /// the full path of the created node.
    fn create_persistent_sequential(&self, prefix: &str, data: &str) -> Result<String>;

    /// Direct children names (not full paths) of `path`.
    fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Delete the node and everything below it. Deleting a missing path is
    /// not an error.
    fn delete_recursive(&self, path: &str) -> Result<()>;

    /// Register a callback for mutations under `prefix`.
    fn subscribe(&self, prefix: &str, handler: WatchHandler);
}

impl<S: CoordinationStore + ?Sized> CoordinationStore for &S {
    fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path)
    }
    fn read(&self, path: &str) -> Result<Option<String>> {
        (**self).read(path)
    }
    fn create_persistent(&self, path: &str, data: &str) -> Result<()> {
        (**self).create_persistent(path, data)
    }
    fn update_persistent(&self, path: &str, data: &str) -> Result<()> {
        (**self).update_persistent(path, data)
    }
    fn create_persistent_sequential(&self, prefix: &str, data: &str) -> Result<String> {
        (**self).create_persistent_sequential(prefix, data)
    }
    fn children(&self, path: &str) -> Result<Vec<String>> {
        (**self).children(path)
    }
    fn delete_recursive(&self, path: &str) -> Result<()> {
        (**self).delete_recursive(path)
    }
    fn subscribe(&self, prefix: &str, handler: WatchHandler) {
        (**self).subscribe(prefix, handler)
    }
}

/// In-memory hierarchical store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, String>,
    sequences: BTreeMap<String, u64>,
    watchers: Vec<(String, WatchHandler)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, event: WatchEvent) {
        let path = match &event {
            WatchEvent::Put { path, .. } | WatchEvent::Delete { path } => path.clone(),
        };
        // handlers run outside the lock so they may call back into the store
        let handlers: Vec<WatchHandler> = {
            let inner = self.inner.lock();
            inner
                .watchers
                .iter()
                .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };
        for handler in handlers {
            handler(&event);
        }
    }
}

impl CoordinationStore for MemoryStore {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.inner.lock().nodes.contains_key(path))
    }

    fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().nodes.get(path).cloned())
    }

    fn create_persistent(&self, path: &str, data: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.nodes.contains_key(path) {
                return Err(Error::NodeExists(path.to_string()));
            }
            inner.nodes.insert(path.to_string(), data.to_string());
        }
        trace!(path, "created node");
        self.notify(WatchEvent::Put {
            path: path.to_string(),
            data: data.to_string(),
        });
        Ok(())
    }

    fn update_persistent(&self, path: &str, data: &str) -> Result<()> {
        self.inner
            .lock()
            .nodes
            .insert(path.to_string(), data.to_string());
        self.notify(WatchEvent::Put {
            path: path.to_string(),
            data: data.to_string(),
        });
        Ok(())
    }

    fn create_persistent_sequential(&self, prefix: &str, data: &str) -> Result<String> {
        let path = {
            let mut inner = self.inner.lock();
            let seq = inner.sequences.entry(prefix.to_string()).or_insert(0);
            let path = format!("{}{:010}", prefix, *seq);
            *seq += 1;
            inner.nodes.insert(path.clone(), data.to_string());
            path
        };
        self.notify(WatchEvent::Put {
            path: path.clone(),
            data: data.to_string(),
        });
        Ok(path)
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        let parent = format!("{}/", path.trim_end_matches('/'));
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .keys()
            .filter_map(|key| key.strip_prefix(&parent))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn delete_recursive(&self, path: &str) -> Result<()> {
        let removed: Vec<String> = {
            let mut inner = self.inner.lock();
            let subtree = format!("{}/", path.trim_end_matches('/'));
            let keys: Vec<String> = inner
                .nodes
                .keys()
                .filter(|key| *key == path || key.starts_with(&subtree))
                .cloned()
                .collect();
            for key in &keys {
                inner.nodes.remove(key);
            }
            keys
        };
        for path in removed {
            self.notify(WatchEvent::Delete { path });
        }
        Ok(())
    }

    fn subscribe(&self, prefix: &str, handler: WatchHandler) {
        self.inner
            .lock()
            .watchers
            .push((prefix.to_string(), handler));
    }
}

/// Payload of `/brokers/topics/<topic>`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicAssignmentData {
    pub version: i32,
    pub partitions: BTreeMap<String, Vec<BrokerId>>,
}

impl TopicAssignmentData {
    pub fn from_assignment(assignment: &Assignment) -> Self {
        Self {
            version: DATA_VERSION,
            partitions: assignment
                .iter()
                .map(|(partition, replicas)| (partition.to_string(), replicas.clone()))
                .collect(),
        }
    }

    pub fn into_assignment(self, path: &str) -> Result<Assignment> {
        if self.version != DATA_VERSION {
            return Err(Error::UnsupportedVersion {
                path: path.to_string(),
                version: self.version,
            });
        }
        self.partitions
            .into_iter()
            .map(|(partition, replicas)| {
                let id = partition.parse::<i32>().map_err(|e| Error::Payload {
                    path: path.to_string(),
                    source: <serde_json::Error as serde::de::Error>::custom(e),
                })?;
                Ok((id, replicas))
            })
            .collect()
    }
}

/// Payload of `/config/<entity_type>/<name>`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityConfigData {
    pub version: i32,
    pub config: BTreeMap<String, String>,
}

impl EntityConfigData {
    pub fn new(config: BTreeMap<String, String>) -> Self {
        Self {
            version: DATA_VERSION,
            config,
        }
    }
}

/// Payload of a `/config/changes/config_change_<seq>` notification.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigChangeData {
    pub version: i32,
    pub entity_type: String,
    pub entity_name: String,
}

impl ConfigChangeData {
    pub fn new(entity_type: impl Into<String>, entity_name: impl Into<String>) -> Self {
        Self {
            version: DATA_VERSION,
            entity_type: entity_type.into(),
            entity_name: entity_name.into(),
        }
    }
}

pub fn read_json<T: serde::de::DeserializeOwned>(
    store: &impl CoordinationStore,
    path: &str,
) -> Result<Option<T>> {
    match store.read(path)? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| Error::Payload {
                path: path.to_string(),
                source,
            }),
    }
}

pub fn write_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("payload structs serialize infallibly")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_is_exclusive() {
        let store = MemoryStore::new();
        store.create_persistent("/brokers/topics/a", "x").unwrap();
        let err = store.create_persistent("/brokers/topics/a", "y").unwrap_err();
        assert!(matches!(err, Error::NodeExists(_)));
        assert_eq!(store.read("/brokers/topics/a").unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn test_sequential_nodes_are_zero_padded_and_ordered() {
        let store = MemoryStore::new();
        let prefix = config_change_prefix();
        let first = store.create_persistent_sequential(&prefix, "{}").unwrap();
        let second = store.create_persistent_sequential(&prefix, "{}").unwrap();
        assert_eq!(first, format!("{}0000000000", prefix));
        assert_eq!(second, format!("{}0000000001", prefix));
        assert_eq!(store.children(CONFIG_CHANGES_PATH).unwrap().len(), 2);
    }

    #[test]
    fn test_children_lists_only_direct_descendants() {
        let store = MemoryStore::new();
        store.create_persistent("/config/topics/a", "{}").unwrap();
        store.create_persistent("/config/topics/b", "{}").unwrap();
        store.create_persistent("/config/clients/c", "{}").unwrap();

        let mut children = store.children("/config/topics").unwrap();
        children.sort();
        assert_eq!(children, vec!["a", "b"]);
    }

    #[test]
    fn test_delete_recursive_removes_subtree() {
        let store = MemoryStore::new();
        store.create_persistent("/admin/delete_topics/a", "").unwrap();
        store.create_persistent("/admin/delete_topics/a/x", "").unwrap();
        store.delete_recursive("/admin/delete_topics/a").unwrap();
        assert!(!store.exists("/admin/delete_topics/a").unwrap());
        assert!(!store.exists("/admin/delete_topics/a/x").unwrap());
    }

    #[test]
    fn test_watch_fires_for_prefix() {
        let store = MemoryStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_captured = Arc::clone(&hits);
        store.subscribe(
            CONFIG_CHANGES_PATH,
            Arc::new(move |event| {
                assert!(matches!(event, WatchEvent::Put { .. }));
                hits_captured.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store
            .create_persistent_sequential(&config_change_prefix(), "{}")
            .unwrap();
        store.create_persistent("/brokers/topics/x", "{}").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_assignment_payload_roundtrip() {
        let mut assignment = Assignment::new();
        assignment.insert(0, vec![1, 2]);
        assignment.insert(1, vec![2, 3]);

        let raw = write_json(&TopicAssignmentData::from_assignment(&assignment));
        let parsed: TopicAssignmentData = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.into_assignment("/brokers/topics/t").unwrap(), assignment);
    }

    #[test]
    fn test_assignment_payload_rejects_future_version() {
        let raw = r#"{"version":2,"partitions":{"0":[1]}}"#;
        let parsed: TopicAssignmentData = serde_json::from_str(raw).unwrap();
        let err = parsed.into_assignment("/brokers/topics/t").unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { version: 2, .. }));
    }
}
