//! Tracking Tree Change Notifications
//!
//! The raw shape of a change event emitted by the tracking tree whenever a
//! user edits the hierarchy. One batch is a `Vec<Notification>`; the
//! classifier turns it into disjoint action groups.

use crate::models::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field key carrying an entity's name
pub const NAME_KEY: &str = "name";

/// Field key carrying an entity's parent reference
pub const PARENT_KEY: &str = "parent_id";

/// Action reported by the tracking tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Remove,
    Move,
    Update,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Add => "add",
            ChangeAction::Remove => "remove",
            ChangeAction::Move => "move",
            ChangeAction::Update => "update",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Old and new value of one changed field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(default)]
    pub old: Option<Value>,
    #[serde(default)]
    pub new: Option<Value>,
}

impl FieldChange {
    pub fn new(old: Option<Value>, new: Option<Value>) -> Self {
        Self { old, new }
    }

    pub fn old_str(&self) -> Option<&str> {
        self.old.as_ref().and_then(Value::as_str)
    }

    pub fn new_str(&self) -> Option<&str> {
        self.new.as_ref().and_then(Value::as_str)
    }
}

/// One ancestor link of the notified entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentLink {
    pub entity_id: String,
    pub entity_kind: EntityKind,
}

/// A single change notification from the tracking tree
///
/// `parents` lists the entity's ancestors nearest-first, ending at the
/// project; for a move it reflects the new position. Its length is the
/// ancestor depth the addition and move phases sort by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Tracking tree id of the changed entity
    pub entity_id: String,

    pub entity_kind: EntityKind,

    /// Tracking tree type name (e.g. "Shot", "Task", "Session")
    #[serde(default)]
    pub entity_type: String,

    pub action: ChangeAction,

    #[serde(default)]
    pub changed_keys: Vec<String>,

    #[serde(default)]
    pub changes: BTreeMap<String, FieldChange>,

    #[serde(default)]
    pub parents: Vec<ParentLink>,
}

impl Notification {
    pub fn new(
        entity_id: impl Into<String>,
        entity_kind: EntityKind,
        entity_type: impl Into<String>,
        action: ChangeAction,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_kind,
            entity_type: entity_type.into(),
            action,
            changed_keys: Vec::new(),
            changes: BTreeMap::new(),
            parents: Vec::new(),
        }
    }

    /// Record a changed field
    pub fn with_change(mut self, key: impl Into<String>, old: Option<Value>, new: Option<Value>) -> Self {
        let key = key.into();
        if !self.changed_keys.contains(&key) {
            self.changed_keys.push(key.clone());
        }
        self.changes.insert(key, FieldChange::new(old, new));
        self
    }

    /// Append an ancestor link (call nearest-first)
    pub fn with_parent(mut self, entity_id: impl Into<String>, entity_kind: EntityKind) -> Self {
        self.parents.push(ParentLink {
            entity_id: entity_id.into(),
            entity_kind,
        });
        self
    }

    pub fn is_task(&self) -> bool {
        self.entity_kind == EntityKind::Task
    }

    /// Number of ancestors between the entity and the project (inclusive)
    pub fn depth(&self) -> usize {
        self.parents.len()
    }

    /// Tracking id of the direct parent
    ///
    /// Prefers the new value of a parent change, falling back to the first
    /// ancestor link.
    pub fn parent_tracking_id(&self) -> Option<&str> {
        self.changes
            .get(PARENT_KEY)
            .and_then(FieldChange::new_str)
            .or_else(|| self.parents.first().map(|p| p.entity_id.as_str()))
    }

    /// Best-known name: the new value of a name change, else the old one
    pub fn entity_name(&self) -> Option<&str> {
        self.changes
            .get(NAME_KEY)
            .and_then(|change| change.new_str().or_else(|| change.old_str()))
    }

    /// Fold a later notification for the same entity into this one.
    ///
    /// The earliest `old` and the latest `new` survive per key.
    pub fn absorb(&mut self, later: Notification) {
        for key in later.changed_keys {
            if !self.changed_keys.contains(&key) {
                self.changed_keys.push(key);
            }
        }
        for (key, change) in later.changes {
            match self.changes.get_mut(&key) {
                Some(existing) => existing.new = change.new,
                None => {
                    self.changes.insert(key, change);
                }
            }
        }
        if !later.parents.is_empty() {
            self.parents = later.parents;
        }
    }

    /// Keep only `keys` in the changed set
    pub(crate) fn retain_keys(&mut self, keys: impl Fn(&str) -> bool) {
        self.changed_keys.retain(|key| keys(key));
        self.changes.retain(|key, _| keys(key));
    }
}
