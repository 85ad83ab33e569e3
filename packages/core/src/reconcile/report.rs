//! Per-batch outcome summary
use crate::models::ChangeAction;
use crate::models::ValidationError;
use crate::services::SyncError;
use serde::{Deserialize, Serialize};

/// Why a single change was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The entity is not represented in the project database
    NotSynced,
    /// The entity's tracking tree parent is not represented yet
    ParentNotSynced,
    /// The tracking tree no longer holds the entity
    NotInTrackingTree,
    /// The name does not match the naming pattern for its type
    InvalidName,
    /// The entity failed schema validation
    InvalidEntity,
    /// A live sibling already holds the name
    DuplicateName,
    /// Still colliding after all rename passes, or a move into a taken name
    NameConflict,
    /// The entity is locked by downstream published work
    Locked,
    /// Writing the rejection back to the tracking tree failed
    WriteBackFailed,
}

impl SkipReason {
    /// Map an entity-scoped error onto a skip reason
    pub fn from_error(error: &SyncError) -> Self {
        match error {
            SyncError::Validation(ValidationError::InvalidName { .. }) => SkipReason::InvalidName,
            SyncError::Validation(_) => SkipReason::InvalidEntity,
            SyncError::ParentNotSynced { .. } => SkipReason::ParentNotSynced,
            _ => SkipReason::NotSynced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedChange {
    pub tracking_id: String,
    pub action: ChangeAction,
    pub reason: SkipReason,
    pub detail: String,
}

/// What one batch did to the project database
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// `false` when auto-sync is disabled for the project
    pub processed: bool,
    pub created: Vec<String>,
    pub relinked: Vec<String>,
    pub archived: Vec<String>,
    pub recreated: Vec<String>,
    pub renamed: Vec<String>,
    pub moved: Vec<String>,
    pub updated: Vec<String>,
    pub skipped: Vec<SkippedChange>,
    /// Documents written by the batch's bulk call
    pub operations: usize,
}

impl BatchReport {
    pub fn processed() -> Self {
        Self {
            processed: true,
            ..Self::default()
        }
    }

    pub fn skip(
        &mut self,
        tracking_id: impl Into<String>,
        action: ChangeAction,
        reason: SkipReason,
        detail: impl Into<String>,
    ) {
        self.skipped.push(SkippedChange {
            tracking_id: tracking_id.into(),
            action,
            reason,
            detail: detail.into(),
        });
    }

    pub fn mark_updated(&mut self, entity_id: &str) {
        if !self.updated.iter().any(|id| id == entity_id) {
            self.updated.push(entity_id.to_string());
        }
    }

    /// Number of skipped changes with `reason`
    pub fn skips(&self, reason: SkipReason) -> usize {
        self.skipped.iter().filter(|s| s.reason == reason).count()
    }
}
