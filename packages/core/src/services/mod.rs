//! Business Services
//!
//! This module contains the service layer of the reconciliation engine:
//!
//! - `SyncService` - Runs one batch of tracking tree notifications end to end
//! - `SyncError` - Engine error type, split into entity-scoped and batch-fatal
//!
//! Services coordinate the collaborators and the reconcile phases; the phase
//! logic itself lives in [`crate::reconcile`].

pub mod error;
pub mod sync_service;

pub use error::SyncError;
pub use sync_service::SyncService;
