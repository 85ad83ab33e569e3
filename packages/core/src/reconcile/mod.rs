//! Reconciliation Engine
//!
//! Translates one batch of tracking tree notifications into idempotent
//! mutations of the project database.
//!
//! # Phases
//!
//! The phases run in a fixed order because later phases depend on the
//! effects of earlier ones (an addition may target a name a rename just
//! released, a move may target a parent the addition phase just created):
//!
//! 1. [`RemovalProcessor`] - archive changeable entities, recreate locked ones
//! 2. [`RenameProcessor`] - bounded-pass renames with conflict detection
//! 3. [`AdditionProcessor`] - create or relink, parents before children
//! 4. [`MoveProcessor`] - re-parent, shallowest new parent first
//! 5. [`AttributeUpdateProcessor`] - flat writes, hierarchical keys marked dirty
//! 6. [`HierarchyCleanupProcessor`] - ancestry, inheritance and task sets
//!
//! [`BatchPersister`] then flushes every staged write in one bulk call.
//! All phases share a [`BatchContext`]; none of them touches the store
//! directly.

mod addition;
mod attributes;
mod changeability;
mod classifier;
mod context;
mod duplicates;
mod hierarchy;
mod index;
mod moves;
mod persister;
mod removal;
mod rename;
mod report;

pub use addition::AdditionProcessor;
pub use attributes::AttributeUpdateProcessor;
pub use changeability::ChangeabilityResolver;
pub use classifier::{ActionGroups, EventClassifier};
pub use context::{BatchContext, PendingWrites};
pub use duplicates::DuplicateSweep;
pub use hierarchy::HierarchyCleanupProcessor;
pub use index::{EntityIndex, IndexKey};
pub use moves::MoveProcessor;
pub use persister::BatchPersister;
pub use removal::RemovalProcessor;
pub use rename::RenameProcessor;
pub use report::{BatchReport, SkipReason, SkippedChange};

use crate::config::{NameValidator, SyncConfig};
use crate::db::EntityStore;
use crate::tracking::TrackingTree;
use serde_json::Value;

/// Collaborators and configuration shared by every phase of a batch
#[derive(Clone, Copy)]
pub struct SyncEnv<'a> {
    pub store: &'a dyn EntityStore,
    pub tracking: &'a dyn TrackingTree,
    pub config: &'a SyncConfig,
    pub names: &'a NameValidator,
}

/// Write one field onto a tracking node and commit.
///
/// Failures are logged and rolled back; the caller's structural change is
/// simply not reflected and the next batch sees the notification again.
pub(crate) async fn write_back(
    tracking: &dyn TrackingTree,
    tracking_id: &str,
    key: &str,
    value: Value,
) -> bool {
    let result: anyhow::Result<()> = async {
        tracking.write_field(tracking_id, key, value).await?;
        tracking.commit().await
    }
    .await;

    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                "Failed to write '{}' back to tracking entity {}: {}",
                key,
                tracking_id,
                e
            );
            if let Err(e) = tracking.rollback().await {
                tracing::warn!("Rollback after failed write-back also failed: {}", e);
            }
            false
        }
    }
}
