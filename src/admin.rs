//! Topic administration over the coordination store.
//!
//! An [`Admin`] owns its store handle; there are no free functions mutating
//! global state. It computes placements via [`crate::placement`] and
//! persists them under the paths in [`crate::coordination`].

use std::collections::BTreeMap;

use rand::thread_rng;
use thiserror::Error;
use tracing::info;

use crate::cluster::BrokerMetadata;
use crate::config::RackAwareMode;
use crate::coordination::{
    self, config_change_prefix, delete_topic_path, entity_config_path, read_json, topic_path,
    write_json, ConfigChangeData, CoordinationStore, EntityConfigData, TopicAssignmentData,
};
use crate::placement::{self, Assignment};

const MAX_NAME_LENGTH: usize = 249;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Topic \"{0}\" already exists")]
    TopicAlreadyExists(String),

    #[error("Topic \"{0}\" is already marked for deletion")]
    AlreadyMarkedForDeletion(String),

    #[error("Topic \"{0}\" does not exist")]
    UnknownTopic(String),

    #[error("Invalid topic name \"{name}\": {reason}")]
    InvalidTopicName { name: String, reason: String },

    #[error(transparent)]
    Placement(#[from] placement::Error),

    #[error(transparent)]
    Store(#[from] coordination::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Handle for topic lifecycle and configuration operations.
pub struct Admin<S> {
    store: S,
}

impl<S> Admin<S>
where
    S: CoordinationStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a topic: compute a placement and persist it.
    ///
    /// Returns the assignment that was written.
    pub fn create_topic(
        &self,
        name: &str,
        n_partitions: i32,
        replication_factor: i32,
        brokers: &[BrokerMetadata],
        mode: RackAwareMode,
        config: Option<BTreeMap<String, String>>,
    ) -> Result<Assignment> {
        validate_topic_name(name)?;
        self.check_collisions(name)?;

        let path = topic_path(name);
        if self.store.exists(&path)? {
            return Err(Error::TopicAlreadyExists(name.to_string()));
        }

        let assignment = placement::assign_replicas_with_rng(
            brokers,
            n_partitions,
            replication_factor,
            mode,
            &mut thread_rng(),
        )?;

        if let Some(config) = config {
            self.write_entity_config("topics", name, config)?;
        }
        self.store
            .create_persistent(&path, &write_json(&TopicAssignmentData::from_assignment(&assignment)))?;
        info!(
            topic = name,
            partitions = n_partitions,
            replication_factor,
            "created topic"
        );
        Ok(assignment)
    }

    /// Append `additional` partitions to an existing topic.
    ///
    /// The new partitions continue the existing layout; the merged
    /// assignment is persisted and returned.
    pub fn add_partitions(
        &self,
        name: &str,
        additional: i32,
        brokers: &[BrokerMetadata],
        mode: RackAwareMode,
    ) -> Result<Assignment> {
        let existing = self
            .topic_assignment(name)?
            .ok_or_else(|| Error::UnknownTopic(name.to_string()))?;

        let delta = placement::extend_assignment(brokers, &existing, additional, mode)?;

        let mut merged = existing;
        merged.extend(delta);
        self.store.update_persistent(
            &topic_path(name),
            &write_json(&TopicAssignmentData::from_assignment(&merged)),
        )?;
        info!(topic = name, additional, "added partitions");
        Ok(merged)
    }

    /// Mark a topic for deletion.
    ///
    /// Actual cleanup happens asynchronously on the controller; this only
    /// plants the marker node.
    pub fn delete_topic(&self, name: &str) -> Result<()> {
        if !self.store.exists(&topic_path(name))? {
            return Err(Error::UnknownTopic(name.to_string()));
        }
        let marker = delete_topic_path(name);
        if self.store.exists(&marker)? {
            return Err(Error::AlreadyMarkedForDeletion(name.to_string()));
        }
        self.store.create_persistent(&marker, "")?;
        info!(topic = name, "marked topic for deletion");
        Ok(())
    }

    pub fn topic_exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.exists(&topic_path(name))?)
    }

    pub fn topic_assignment(&self, name: &str) -> Result<Option<Assignment>> {
        let path = topic_path(name);
        let Some(data) = read_json::<TopicAssignmentData>(&self.store, &path)? else {
            return Ok(None);
        };
        Ok(Some(data.into_assignment(&path)?))
    }

    /// Persist an entity config and emit the sequential change notification
    /// that brokers watch for.
    ///
    /// Returns the path of the notification node.
    pub fn write_entity_config(
        &self,
        entity_type: &str,
        name: &str,
        config: BTreeMap<String, String>,
    ) -> Result<String> {
        self.store.update_persistent(
            &entity_config_path(entity_type, name),
            &write_json(&EntityConfigData::new(config)),
        )?;
        let change = self.store.create_persistent_sequential(
            &config_change_prefix(),
            &write_json(&ConfigChangeData::new(entity_type, name)),
        )?;
        Ok(change)
    }

    fn check_collisions(&self, name: &str) -> Result<()> {
        let normalized = normalize(name);
        for existing in self.store.children(coordination::TOPICS_PATH)? {
            if existing != name && normalize(&existing) == normalized {
                return Err(Error::InvalidTopicName {
                    name: name.to_string(),
                    reason: format!("collides with existing topic \"{}\"", existing),
                });
            }
        }
        Ok(())
    }
}

/// Periods and underscores collide in metric names derived from topics.
fn normalize(name: &str) -> String {
    name.replace('.', "_")
}

fn validate_topic_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidTopicName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name cannot be \".\" or \"..\""));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(invalid("name exceeds 249 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(invalid(
            "allowed characters are ASCII alphanumerics, '.', '_' and '-'",
        ));
    }
    Ok(())
}
