//! Tracking Tree Collaborator
//!
//! The tracking tree is the external, user-edited project-management
//! hierarchy that originates change notifications. The engine consumes it
//! through the `TrackingTree` trait:
//!
//! - snapshot queries (by id, by name, by parent) used by the addition phase,
//!   the duplicate-resolution sweep and hierarchical attribute resolution
//! - staged writes (`create_entity`, `write_field`) followed by `commit` or
//!   `rollback`, used to push rejected edits back onto the tree
//!
//! Session management and reconnects are the concern of concrete clients.

mod error;
mod memory;

pub use error::TrackingError;
pub use memory::{FieldWrite, MemoryTrackingTree};

use crate::models::EntityKind;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Snapshot of one tracking tree entity
///
/// `attributes` holds the entity's OWN values only: a hierarchical key is
/// present when the entity overrides it locally and absent when it inherits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEntity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub entity_type: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl TrackedEntity {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: EntityKind,
        entity_type: impl Into<String>,
        parent_id: Option<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            entity_type: entity_type.into(),
            parent_id: parent_id.map(str::to_string),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn is_task(&self) -> bool {
        self.kind == EntityKind::Task
    }
}

/// Abstraction over the tracking tree session used for one batch
///
/// Writes are staged until `commit`; a failed commit must be followed by
/// `rollback` before the session is reused.
#[async_trait]
pub trait TrackingTree: Send + Sync {
    /// Snapshots for the given ids; unknown ids are silently absent
    async fn query_entities(&self, ids: &[String]) -> Result<Vec<TrackedEntity>>;

    /// Every non-project entity named exactly `name`
    async fn query_by_name(&self, name: &str) -> Result<Vec<TrackedEntity>>;

    /// Direct children of the given parents
    async fn query_children(&self, parent_ids: &[String]) -> Result<Vec<TrackedEntity>>;

    /// Stage creation of a new entity, returning its tracking id
    async fn create_entity(
        &self,
        parent_id: &str,
        name: &str,
        kind: EntityKind,
        entity_type: &str,
    ) -> Result<String>;

    /// Stage a field write; `name` and `parent_id` address the structural fields
    async fn write_field(&self, id: &str, key: &str, value: Value) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}
