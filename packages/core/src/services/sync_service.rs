//! Sync Service - One Batch End to End
//!
//! `SyncService` is the entry point the event listener calls for every batch
//! of tracking tree notifications:
//!
//! 1. classify the notifications into action groups
//! 2. load the batch context (entity index and changeability) from the store
//! 3. check the project's auto-sync flag
//! 4. run removal, rename, addition, move, attribute update and hierarchy
//!    cleanup in that order
//! 5. persist every staged write in one bulk call
//!
//! A batch either completes including the bulk write or returns an error
//! without writing to the project database; the caller redelivers it. Write
//! backs to the tracking tree are committed as the phases go and are not
//! undone when the bulk write fails, which is safe because every phase is
//! idempotent against a replayed batch.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use treesync_core::config::SyncConfig;
//! use treesync_core::db::MemoryStore;
//! use treesync_core::services::SyncService;
//! use treesync_core::tracking::MemoryTrackingTree;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = SyncService::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryTrackingTree::new()),
//!         SyncConfig::default(),
//!     )?;
//!     let report = service.process_batch(Vec::new()).await?;
//!     assert!(report.processed);
//!     Ok(())
//! }
//! ```

use crate::config::{NameValidator, SyncConfig};
use crate::db::EntityStore;
use crate::models::Notification;
use crate::reconcile::{
    AdditionProcessor, AttributeUpdateProcessor, BatchContext, BatchPersister, BatchReport,
    EventClassifier, HierarchyCleanupProcessor, MoveProcessor, RemovalProcessor, RenameProcessor,
    SyncEnv,
};
use crate::services::error::SyncError;
use crate::tracking::TrackingTree;
use std::sync::Arc;

pub struct SyncService {
    store: Arc<dyn EntityStore>,
    tracking: Arc<dyn TrackingTree>,
    config: SyncConfig,
    names: NameValidator,
}

impl SyncService {
    /// Create a service, validating the configuration and compiling its
    /// naming patterns up front
    pub fn new(
        store: Arc<dyn EntityStore>,
        tracking: Arc<dyn TrackingTree>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate().map_err(SyncError::InvalidConfig)?;
        let names = NameValidator::from_config(&config).map_err(SyncError::InvalidConfig)?;
        Ok(Self {
            store,
            tracking,
            config,
            names,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn env(&self) -> SyncEnv<'_> {
        SyncEnv {
            store: self.store.as_ref(),
            tracking: self.tracking.as_ref(),
            config: &self.config,
            names: &self.names,
        }
    }

    /// Reconcile one batch of notifications against the project database
    pub async fn process_batch(
        &self,
        notifications: Vec<Notification>,
    ) -> Result<BatchReport, SyncError> {
        let received = notifications.len();
        let groups = EventClassifier::new(&self.config).classify(notifications);
        if groups.is_empty() {
            tracing::debug!("Batch of {} notification(s) has nothing to sync", received);
            return Ok(BatchReport::processed());
        }

        let env = self.env();
        let mut ctx = BatchContext::load(env.store).await?;
        if !self.auto_sync_enabled(&ctx).await? {
            tracing::info!("Auto-sync is disabled for this project, batch ignored");
            return Ok(BatchReport::default());
        }

        tracing::info!(
            "Processing batch: {} notification(s), {} change(s) against {} live entities ({} locked)",
            received,
            groups.len(),
            ctx.index().live_len(),
            ctx.changeability.locked_count()
        );

        RemovalProcessor::new(env).run(&mut ctx, groups.removed).await?;
        RenameProcessor::new(env).run(&mut ctx, groups.renamed).await?;
        AdditionProcessor::new(env).run(&mut ctx, groups.added).await?;
        MoveProcessor::new(env).run(&mut ctx, groups.moved).await?;
        AttributeUpdateProcessor::new(env)
            .run(&mut ctx, groups.updated)
            .await?;
        HierarchyCleanupProcessor::new(env).run(&mut ctx).await?;

        let (pending, mut report) = ctx.finish();
        let result = BatchPersister::new(env.store).flush(pending).await?;
        report.operations = result.inserted + result.modified;

        if !report.skipped.is_empty() {
            tracing::info!("Batch finished with {} skipped change(s)", report.skipped.len());
        }
        Ok(report)
    }

    /// Read the project's auto-sync flag from the tracking tree.
    ///
    /// A project without the flag is a configuration error that aborts the
    /// batch before anything is written.
    async fn auto_sync_enabled(&self, ctx: &BatchContext) -> Result<bool, SyncError> {
        let project = ctx.index().project().ok_or(SyncError::ProjectNotFound)?;
        let key = &self.config.auto_sync_attribute;

        let tracking_id = project.tracking_id.clone().unwrap_or_default();
        let snapshot = self
            .tracking
            .query_entities(&[tracking_id])
            .await
            .map_err(|e| SyncError::tracking("project lookup", e))?
            .into_iter()
            .next();

        match snapshot
            .as_ref()
            .and_then(|project| project.attributes.get(key))
            .and_then(|value| value.as_bool())
        {
            Some(enabled) => Ok(enabled),
            None => {
                tracing::error!(
                    "Project '{}' has no '{}' attribute, batch aborted",
                    project.name,
                    key
                );
                Err(SyncError::missing_project_config(key.clone()))
            }
        }
    }
}
