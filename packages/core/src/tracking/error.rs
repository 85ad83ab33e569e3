//! Tracking Tree Error Types

use thiserror::Error;

/// Errors raised by the in-memory tracking tree
#[derive(Error, Debug)]
pub enum TrackingError {
    /// Referenced tracking entity does not exist
    #[error("Tracking entity not found: {id}")]
    EntityNotFound { id: String },

    /// Commit of staged writes failed
    #[error("Commit failed: {context}")]
    CommitFailed { context: String },
}

impl TrackingError {
    /// Create an entity not found error
    pub fn entity_not_found(id: impl Into<String>) -> Self {
        Self::EntityNotFound { id: id.into() }
    }

    /// Create a commit failed error
    pub fn commit_failed(context: impl Into<String>) -> Self {
        Self::CommitFailed {
            context: context.into(),
        }
    }
}
