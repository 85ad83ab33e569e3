//! Service Layer Error Types
//!
//! This module defines the error type of the reconciliation engine. Errors
//! fall into two classes:
//!
//! - **Entity-scoped** (`Validation`, `EntityNotFound`, `ParentNotSynced`):
//!   a phase logs them with tracking id and hierarchy path, skips the entity
//!   and continues with the rest of the batch
//! - **Batch-fatal** (everything else): the batch returns without persisting
//!   and the caller redelivers it

use crate::models::ValidationError;
use thiserror::Error;

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// Entity failed schema validation
    #[error("Entity validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Notification referenced an entity the project database doesn't hold
    #[error("Entity not found: {id}")]
    EntityNotFound { id: String },

    /// Parent of a tracking entity is not represented in the project database
    #[error("Parent '{parent_tracking_id}' of '{tracking_id}' is not synced")]
    ParentNotSynced {
        tracking_id: String,
        parent_tracking_id: String,
    },

    /// The project root is missing from the project database
    #[error("Project root not found in project database")]
    ProjectNotFound,

    /// Mandatory project configuration is absent
    #[error("Project is missing mandatory configuration '{key}'")]
    MissingProjectConfig { key: String },

    /// Engine configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reading the project database failed
    #[error("Project database query failed during {context}: {cause}")]
    Store {
        context: String,
        cause: anyhow::Error,
    },

    /// Querying the tracking tree failed
    #[error("Tracking tree query failed during {context}: {cause}")]
    Tracking {
        context: String,
        cause: anyhow::Error,
    },

    /// The batch's single bulk write failed
    #[error("Bulk write of {operations} operation(s) failed: {cause}")]
    PersistFailed {
        operations: usize,
        cause: anyhow::Error,
    },
}

impl SyncError {
    /// Create an entity not found error
    pub fn entity_not_found(id: impl Into<String>) -> Self {
        Self::EntityNotFound { id: id.into() }
    }

    /// Create a parent not synced error
    pub fn parent_not_synced(
        tracking_id: impl Into<String>,
        parent_tracking_id: impl Into<String>,
    ) -> Self {
        Self::ParentNotSynced {
            tracking_id: tracking_id.into(),
            parent_tracking_id: parent_tracking_id.into(),
        }
    }

    /// Create a missing project config error
    pub fn missing_project_config(key: impl Into<String>) -> Self {
        Self::MissingProjectConfig { key: key.into() }
    }

    /// Create a store error
    pub fn store(context: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Store {
            context: context.into(),
            cause,
        }
    }

    /// Create a tracking tree error
    pub fn tracking(context: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Tracking {
            context: context.into(),
            cause,
        }
    }

    /// Whether a phase should log and skip instead of aborting the batch
    pub fn is_entity_scoped(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_)
                | SyncError::EntityNotFound { .. }
                | SyncError::ParentNotSynced { .. }
        )
    }
}
