//! Database Error Types
//!
//! This module defines error types raised by project database backends.

use thiserror::Error;

/// Project database operation errors
///
/// Covers failures of the in-memory backend's writes. Transport failures of
/// remote backends are reported through `anyhow` by the `EntityStore` trait.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Insert collided with an existing document id
    #[error("Entity already exists: {id}")]
    DuplicateId { id: String },

    /// Update targeted a document that does not exist
    #[error("Entity not found: {id}")]
    EntityNotFound { id: String },

    /// Backend refused the write
    #[error("Bulk write rejected: {context}")]
    WriteRejected { context: String },
}

impl DatabaseError {
    /// Create a duplicate id error
    pub fn duplicate_id(id: impl Into<String>) -> Self {
        Self::DuplicateId { id: id.into() }
    }

    /// Create an entity not found error
    pub fn entity_not_found(id: impl Into<String>) -> Self {
        Self::EntityNotFound { id: id.into() }
    }

    /// Create a write rejected error
    pub fn write_rejected(context: impl Into<String>) -> Self {
        Self::WriteRejected {
            context: context.into(),
        }
    }
}
