//! TreeSync Core Reconciliation Engine
//!
//! This crate keeps a project database in step with an externally edited
//! tracking tree. Each batch of change notifications is classified,
//! reconciled through a fixed sequence of phases and persisted in a single
//! bulk write.
//!
//! # Architecture
//!
//! - **Batch-scoped state**: every phase reads and stages through one
//!   `BatchContext`; nothing is cached across batches
//! - **Soft deletion**: removed entities are archived, never dropped, so a
//!   later addition can relink to them
//! - **Lock preservation**: entities with published downstream work keep
//!   their id, name and parent; conflicting edits are written back onto the
//!   tracking tree
//! - **Idempotence**: replaying a batch against its own result writes nothing
//!
//! # Modules
//!
//! - [`models`] - Entities, partial updates, queries and notifications
//! - [`db`] - Project database trait and in-memory backend
//! - [`tracking`] - Tracking tree trait and in-memory backend
//! - [`config`] - Engine configuration and naming validation
//! - [`reconcile`] - Classifier, phase processors and batch persistence
//! - [`services`] - `SyncService`, the per-batch entry point

pub mod config;
pub mod db;
pub mod models;
pub mod reconcile;
pub mod services;
pub mod tracking;

// Re-export commonly used types
pub use config::{NameValidator, SyncConfig};
pub use models::*;
pub use reconcile::{BatchReport, SkipReason, SkippedChange};
pub use services::*;
