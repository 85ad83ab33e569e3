//! Rename phase
//!
//! Task renames only touch the parent's task set. Entity renames are applied
//! in bounded passes: each pass attempts every still-blocked rename once in
//! ascending entity id order, so the lowest id wins a contested name and a
//! rename chain (A→B while B→C) settles within a few passes. Renames still
//! blocked after the last pass, or after a pass that made no progress, are
//! reported as conflicts.

use crate::models::{ChangeAction, EntityUpdate, Notification, NAME_KEY};
use crate::reconcile::{write_back, BatchContext, DuplicateSweep, SkipReason, SyncEnv};
use crate::services::SyncError;
use serde_json::Value;
use std::collections::BTreeMap;

/// A rename waiting for its target name to become free
#[derive(Debug, Clone)]
struct PendingRename {
    tracking_id: String,
    new_name: String,
}

pub struct RenameProcessor<'a> {
    env: SyncEnv<'a>,
}

impl<'a> RenameProcessor<'a> {
    pub fn new(env: SyncEnv<'a>) -> Self {
        Self { env }
    }

    pub async fn run(
        &self,
        ctx: &mut BatchContext,
        renamed: BTreeMap<String, Notification>,
    ) -> Result<(), SyncError> {
        let mut pending: BTreeMap<String, PendingRename> = BTreeMap::new();

        for notification in renamed.into_values() {
            if notification.is_task() {
                self.rename_task(ctx, &notification);
            } else if let Some((id, rename)) = self.admit(ctx, &notification).await {
                pending.insert(id, rename);
            }
        }

        self.resolve(ctx, pending);

        let freed = ctx.take_freed_names();
        DuplicateSweep::new(self.env).run(ctx, freed).await
    }

    fn rename_task(&self, ctx: &mut BatchContext, notification: &Notification) {
        let Some(change) = notification.changes.get(NAME_KEY) else {
            return;
        };
        let (Some(old), Some(new)) = (change.old_str(), change.new_str()) else {
            return;
        };

        if !self.env.names.is_valid(&notification.entity_type, new) {
            tracing::warn!("Task {} renamed to invalid name '{}'", notification.entity_id, new);
            ctx.report.skip(
                &notification.entity_id,
                ChangeAction::Update,
                SkipReason::InvalidName,
                new,
            );
            return;
        }

        let parent_id = notification
            .parent_tracking_id()
            .and_then(|tid| ctx.index.by_tracking_id(tid))
            .map(|parent| parent.id.clone());
        let Some(parent_id) = parent_id else {
            ctx.report.skip(
                &notification.entity_id,
                ChangeAction::Update,
                SkipReason::ParentNotSynced,
                new,
            );
            return;
        };

        if let Some(tasks) = ctx.task_set(&parent_id) {
            tasks.remove(old);
            tasks.insert(new.to_string());
        }
    }

    /// Filter an entity rename down to one that can be attempted.
    ///
    /// Locked targets get their current name written back instead.
    async fn admit(
        &self,
        ctx: &mut BatchContext,
        notification: &Notification,
    ) -> Option<(String, PendingRename)> {
        let tracking_id = &notification.entity_id;
        let Some(entity) = ctx.index.by_tracking_id(tracking_id).cloned() else {
            tracing::debug!("Renamed tracking entity {} is not synced", tracking_id);
            ctx.report
                .skip(tracking_id, ChangeAction::Update, SkipReason::NotSynced, "");
            return None;
        };
        let new_name = notification
            .changes
            .get(NAME_KEY)
            .and_then(|change| change.new_str())?
            .to_string();
        if new_name == entity.name {
            return None;
        }

        if !ctx.is_changeable(&entity.id) {
            tracing::info!(
                "Rejecting rename of locked entity {} at {} to '{}'",
                entity.id,
                ctx.path_of(&entity.id),
                new_name
            );
            let reason = if write_back(
                self.env.tracking,
                tracking_id,
                NAME_KEY,
                Value::String(entity.name.clone()),
            )
            .await
            {
                SkipReason::Locked
            } else {
                SkipReason::WriteBackFailed
            };
            ctx.report
                .skip(tracking_id, ChangeAction::Update, reason, new_name);
            return None;
        }

        if !self.env.names.is_valid(&entity.entity_type, &new_name) {
            tracing::warn!(
                "Rename of {} at {} to '{}' does not match the naming pattern",
                tracking_id,
                ctx.path_of(&entity.id),
                new_name
            );
            ctx.report
                .skip(tracking_id, ChangeAction::Update, SkipReason::InvalidName, new_name);
            return None;
        }

        Some((
            entity.id,
            PendingRename {
                tracking_id: tracking_id.clone(),
                new_name,
            },
        ))
    }

    fn resolve(&self, ctx: &mut BatchContext, mut pending: BTreeMap<String, PendingRename>) {
        let mut passes = 0;
        while !pending.is_empty() && passes < self.env.config.max_rename_passes {
            passes += 1;
            let before = pending.len();

            pending.retain(|id, rename| !Self::try_apply(ctx, id, rename));

            if pending.len() == before {
                break;
            }
        }

        for (id, rename) in pending {
            tracing::warn!(
                "Rename of {} at {} to '{}' still conflicts after {} pass(es)",
                rename.tracking_id,
                ctx.path_of(&id),
                rename.new_name,
                passes
            );
            ctx.report.skip(
                &rename.tracking_id,
                ChangeAction::Update,
                SkipReason::NameConflict,
                rename.new_name,
            );
        }
    }

    /// Apply one rename if its target name is free; returns whether it applied
    fn try_apply(ctx: &mut BatchContext, id: &str, rename: &PendingRename) -> bool {
        let Some(entity) = ctx.index.get(id) else {
            return true;
        };
        let old_name = entity.name.clone();
        if let Some(parent_id) = entity.parent_id.clone() {
            if let Some(holder) = ctx.index.live_sibling_named(&parent_id, &rename.new_name) {
                if holder.id != id {
                    return false;
                }
            }
        }

        ctx.stage_update(id, EntityUpdate::new().with_name(rename.new_name.clone()));
        ctx.mark_renamed(id);
        ctx.free_name(&old_name);
        ctx.report.renamed.push(id.to_string());
        tracing::info!("Renamed {} from '{}' to '{}'", id, old_name, rename.new_name);
        true
    }
}
