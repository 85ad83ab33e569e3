//! Entity Data Structures
//!
//! This module defines the `Entity` struct stored in the project database and
//! the partial-update and query types used to read and write it.
//!
//! # Architecture
//!
//! - **One document per hierarchy node**: the project root and every
//!   container-like node are stored as `Entity` documents
//! - **Tasks are not entities**: task-kind leaves live as a name set on their
//!   parent (`Entity::tasks`)
//! - **Soft deletion**: removal sets `archived`; documents are never dropped
//!   so a later addition can relink to them
//! - **Denormalized ancestry**: `ancestor_names` and `hierarchy_path` are a
//!   cache recomputed after every batch's structural phases
//!
//! # Examples
//!
//! ```rust
//! use treesync_core::models::Entity;
//!
//! let project = Entity::new_project("Demo", "ft-project");
//! let sequence = Entity::new_child("Seq01", "Sequence", &project, "ft-seq01");
//! let shot = Entity::new_child("sh010", "Shot", &sequence, "ft-sh010");
//!
//! assert_eq!(shot.ancestor_names, vec!["Seq01".to_string()]);
//! assert_eq!(shot.hierarchy_path, "Seq01");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;

/// Validation errors for Entity construction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid entity kind: {0}")]
    InvalidKind(String),

    #[error("Invalid parent reference: {0}")]
    InvalidParent(String),

    #[error("Invalid name '{name}' for entity type '{entity_type}'")]
    InvalidName { name: String, entity_type: String },
}

/// Closed set of hierarchy node kinds.
///
/// Notifications carry the tracking tree's free-form type name separately in
/// `entity_type`; this tag only decides how the engine dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// The unique project root
    Project,
    /// Any container-like node (folder, sequence, shot, asset, ...)
    Node,
    /// Name-only leaf stored on its parent's task set
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Node => "node",
            EntityKind::Task => "task",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the project database's hierarchy.
///
/// # Fields
///
/// - `id`: Opaque id minted on creation, stable across archival and relink
/// - `name`: Unique among live siblings
/// - `kind`: `Project` or `Node` (tasks are never stored as entities)
/// - `entity_type`: Tracking tree type name, e.g. "Sequence" or "Shot"
/// - `parent_id`: Owning entity, `None` only for the project root
/// - `tracking_id`: Join key into the tracking tree, unique among live entities
/// - `ancestor_names`: Names from (excluding) the root to (excluding) self
/// - `hierarchy_path`: `/`-joined `ancestor_names`
/// - `attributes`: Flat and resolved hierarchical attribute values
/// - `tasks`: Names of task-kind children
/// - `archived`: Soft-deletion tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,

    pub name: String,

    pub kind: EntityKind,

    #[serde(default)]
    pub entity_type: String,

    pub parent_id: Option<String>,

    pub tracking_id: Option<String>,

    #[serde(default)]
    pub ancestor_names: Vec<String>,

    #[serde(default)]
    pub hierarchy_path: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,

    #[serde(default)]
    pub tasks: BTreeSet<String>,

    #[serde(default)]
    pub archived: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// Create the project root entity with a freshly minted id
    pub fn new_project(name: impl Into<String>, tracking_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind: EntityKind::Project,
            entity_type: "Project".to_string(),
            parent_id: None,
            tracking_id: Some(tracking_id.into()),
            ancestor_names: Vec::new(),
            hierarchy_path: String::new(),
            attributes: BTreeMap::new(),
            tasks: BTreeSet::new(),
            archived: false,
            archived_at: None,
        }
    }

    /// Create a `Node` entity under `parent`, deriving its ancestry from the parent.
    pub fn new_child(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        parent: &Entity,
        tracking_id: impl Into<String>,
    ) -> Self {
        let ancestor_names = parent.child_ancestor_names();
        let hierarchy_path = ancestor_names.join("/");

        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind: EntityKind::Node,
            entity_type: entity_type.into(),
            parent_id: Some(parent.id.clone()),
            tracking_id: Some(tracking_id.into()),
            ancestor_names,
            hierarchy_path,
            attributes: BTreeMap::new(),
            tasks: BTreeSet::new(),
            archived: false,
            archived_at: None,
        }
    }

    /// Replace the generated id (used by tests and when relinking)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set a single attribute value
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Mark the entity archived
    pub fn archived(mut self) -> Self {
        self.archived = true;
        self.archived_at = Some(Utc::now());
        self
    }

    pub fn is_project(&self) -> bool {
        self.kind == EntityKind::Project
    }

    /// Ancestor names a direct child of this entity carries.
    ///
    /// The project root is never part of the chain.
    pub fn child_ancestor_names(&self) -> Vec<String> {
        if self.is_project() {
            return Vec::new();
        }
        let mut names = self.ancestor_names.clone();
        names.push(self.name.clone());
        names
    }

    /// Check structural invariants before the entity is written
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name".to_string()));
        }
        match self.kind {
            EntityKind::Task => Err(ValidationError::InvalidKind(
                "tasks are stored on their parent, not as entities".to_string(),
            )),
            EntityKind::Project if self.parent_id.is_some() => Err(
                ValidationError::InvalidParent(format!("project '{}' cannot have a parent", self.name)),
            ),
            EntityKind::Node if self.parent_id.is_none() => Err(ValidationError::InvalidParent(
                format!("entity '{}' has no parent", self.name),
            )),
            EntityKind::Node if self.parent_id.as_deref() == Some(self.id.as_str()) => Err(
                ValidationError::InvalidParent(format!("entity '{}' is its own parent", self.name)),
            ),
            _ => Ok(()),
        }
    }
}

fn deserialize_optional_field<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Some(Option::<T>::deserialize(deserializer)?))
}

/// Partial entity update staged by the phase processors
///
/// All fields are optional; only provided fields are written. `attributes`
/// is merged key by key so independent writes to different keys of the same
/// entity never clobber each other.
///
/// # Double-Option Pattern for Nullable Fields
///
/// - `None`: Don't change the field
/// - `Some(None)`: Set the field to NULL
/// - `Some(Some(value))`: Set the field to `value`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub parent_id: Option<Option<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub tracking_id: Option<Option<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Replaces both `ancestor_names` and the derived `hierarchy_path`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ancestor_names: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<BTreeSet<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub archived_at: Option<Option<DateTime<Utc>>>,
}

impl EntityUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(Some(parent_id.into()));
        self
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = Some(Some(tracking_id.into()));
        self
    }

    pub fn with_ancestor_names(mut self, names: Vec<String>) -> Self {
        self.ancestor_names = Some(names);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_tasks(mut self, tasks: BTreeSet<String>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Soft-delete: set the archived tag and stamp the time
    pub fn archive() -> Self {
        Self {
            archived: Some(true),
            archived_at: Some(Some(Utc::now())),
            ..Self::default()
        }
    }

    /// Clear the archived tag (relink)
    pub fn unarchive() -> Self {
        Self {
            archived: Some(false),
            archived_at: Some(None),
            ..Self::default()
        }
    }

    /// Check if update contains any changes
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.parent_id.is_none()
            && self.tracking_id.is_none()
            && self.entity_type.is_none()
            && self.ancestor_names.is_none()
            && self.attributes.is_empty()
            && self.tasks.is_none()
            && self.archived.is_none()
            && self.archived_at.is_none()
    }

    /// Fold a later update into this one.
    ///
    /// Fields set by `later` win; attribute keys are merged individually.
    pub fn merge(&mut self, later: EntityUpdate) {
        if later.name.is_some() {
            self.name = later.name;
        }
        if later.parent_id.is_some() {
            self.parent_id = later.parent_id;
        }
        if later.tracking_id.is_some() {
            self.tracking_id = later.tracking_id;
        }
        if later.entity_type.is_some() {
            self.entity_type = later.entity_type;
        }
        if later.ancestor_names.is_some() {
            self.ancestor_names = later.ancestor_names;
        }
        self.attributes.extend(later.attributes);
        if later.tasks.is_some() {
            self.tasks = later.tasks;
        }
        if later.archived.is_some() {
            self.archived = later.archived;
        }
        if later.archived_at.is_some() {
            self.archived_at = later.archived_at;
        }
    }

    /// Drop every field that would not change `entity`.
    ///
    /// Replaying a batch against its own result therefore stages nothing.
    pub fn changes_against(mut self, entity: &Entity) -> Self {
        if self.name.as_deref() == Some(entity.name.as_str()) {
            self.name = None;
        }
        if self.parent_id.as_ref() == Some(&entity.parent_id) {
            self.parent_id = None;
        }
        if self.tracking_id.as_ref() == Some(&entity.tracking_id) {
            self.tracking_id = None;
        }
        if self.entity_type.as_deref() == Some(entity.entity_type.as_str()) {
            self.entity_type = None;
        }
        if self.ancestor_names.as_ref() == Some(&entity.ancestor_names) {
            self.ancestor_names = None;
        }
        self.attributes
            .retain(|key, value| entity.attributes.get(key) != Some(value));
        if self.tasks.as_ref() == Some(&entity.tasks) {
            self.tasks = None;
        }
        if self.archived == Some(entity.archived) {
            self.archived = None;
            self.archived_at = None;
        }
        self
    }

    /// Apply the update to an in-memory entity
    pub fn apply_to(&self, entity: &mut Entity) {
        if let Some(name) = &self.name {
            entity.name = name.clone();
        }
        if let Some(parent_id) = &self.parent_id {
            entity.parent_id = parent_id.clone();
        }
        if let Some(tracking_id) = &self.tracking_id {
            entity.tracking_id = tracking_id.clone();
        }
        if let Some(entity_type) = &self.entity_type {
            entity.entity_type = entity_type.clone();
        }
        if let Some(names) = &self.ancestor_names {
            entity.ancestor_names = names.clone();
            entity.hierarchy_path = names.join("/");
        }
        for (key, value) in &self.attributes {
            entity.attributes.insert(key.clone(), value.clone());
        }
        if let Some(tasks) = &self.tasks {
            entity.tasks = tasks.clone();
        }
        if let Some(archived) = self.archived {
            entity.archived = archived;
        }
        if let Some(archived_at) = self.archived_at {
            entity.archived_at = archived_at;
        }
    }
}

/// Filter for `EntityStore::find`
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl EntityQuery {
    /// Match every entity, live and archived
    pub fn all() -> Self {
        Self::default()
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = Some(tracking_id.into());
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &entity.id) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if name != &entity.name {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if entity.parent_id.as_ref() != Some(parent_id) {
                return false;
            }
        }
        if let Some(tracking_id) = &self.tracking_id {
            if entity.tracking_id.as_ref() != Some(tracking_id) {
                return false;
            }
        }
        if let Some(archived) = self.archived {
            if entity.archived != archived {
                return false;
            }
        }
        true
    }
}
