//! Move phase
//!
//! Re-parents entities, shallowest new position first so a parent created or
//! moved earlier in the batch is in place before its children follow.
//! Ancestry is recomputed later by the hierarchy cleanup; every hierarchical
//! key of a moved entity is marked dirty so its subtree re-inherits from the
//! new parent. A moved task only changes which parent's task set holds its
//! name.

use crate::models::{ChangeAction, Entity, EntityUpdate, Notification, PARENT_KEY};
use crate::reconcile::{write_back, BatchContext, SkipReason, SyncEnv};
use crate::services::SyncError;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub struct MoveProcessor<'a> {
    env: SyncEnv<'a>,
}

impl<'a> MoveProcessor<'a> {
    pub fn new(env: SyncEnv<'a>) -> Self {
        Self { env }
    }

    pub async fn run(
        &self,
        ctx: &mut BatchContext,
        moved: BTreeMap<String, Notification>,
    ) -> Result<(), SyncError> {
        let mut ordered: Vec<Notification> = moved.into_values().collect();
        ordered.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        let task_names = self.task_names(&ordered).await?;
        for notification in &ordered {
            if notification.is_task() {
                let name = task_names.get(&notification.entity_id).map(String::as_str);
                self.move_task(ctx, notification, name);
            } else {
                self.move_entity(ctx, notification).await;
            }
        }
        Ok(())
    }

    /// Names of the moved tasks, from the notification or else the tracking tree
    async fn task_names(
        &self,
        ordered: &[Notification],
    ) -> Result<HashMap<String, String>, SyncError> {
        let mut names: HashMap<String, String> = HashMap::new();
        let mut unnamed: Vec<String> = Vec::new();
        for notification in ordered.iter().filter(|n| n.is_task()) {
            match notification.entity_name() {
                Some(name) => {
                    names.insert(notification.entity_id.clone(), name.to_string());
                }
                None => unnamed.push(notification.entity_id.clone()),
            }
        }
        if unnamed.is_empty() {
            return Ok(names);
        }

        let snapshots = self
            .env
            .tracking
            .query_entities(&unnamed)
            .await
            .map_err(|e| SyncError::tracking("moved task lookup", e))?;
        for snapshot in snapshots {
            names.insert(snapshot.id, snapshot.name);
        }
        Ok(names)
    }

    /// Move a task name from the old parent's task set to the new one's
    fn move_task(&self, ctx: &mut BatchContext, notification: &Notification, name: Option<&str>) {
        let tracking_id = &notification.entity_id;
        let Some(name) = name else {
            tracing::warn!("Moved task {} has no known name", tracking_id);
            ctx.report.skip(
                tracking_id,
                ChangeAction::Move,
                SkipReason::NotSynced,
                "task name unknown",
            );
            return;
        };

        let new_parent_tracking_id = notification.parent_tracking_id().unwrap_or_default();
        let Some(new_parent_id) = ctx
            .index
            .by_tracking_id(new_parent_tracking_id)
            .map(|parent| parent.id.clone())
        else {
            ctx.report.skip(
                tracking_id,
                ChangeAction::Move,
                SkipReason::ParentNotSynced,
                new_parent_tracking_id,
            );
            return;
        };

        let old_parent_id = notification
            .changes
            .get(PARENT_KEY)
            .and_then(|change| change.old_str())
            .and_then(|tid| ctx.index.by_tracking_id(tid))
            .map(|parent| parent.id.clone());
        if old_parent_id.as_deref() == Some(new_parent_id.as_str()) {
            return;
        }

        if let Some(old_parent_id) = old_parent_id {
            if let Some(tasks) = ctx.task_set(&old_parent_id) {
                tasks.remove(name);
            }
        }
        if let Some(tasks) = ctx.task_set(&new_parent_id) {
            tasks.insert(name.to_string());
        }
        tracing::debug!(
            "Task '{}' moved under {}",
            name,
            ctx.path_of(&new_parent_id)
        );
    }

    async fn move_entity(&self, ctx: &mut BatchContext, notification: &Notification) {
        let tracking_id = &notification.entity_id;
        let Some(entity) = ctx.index.by_tracking_id(tracking_id).cloned() else {
            tracing::debug!("Moved tracking entity {} is not synced", tracking_id);
            ctx.report
                .skip(tracking_id, ChangeAction::Move, SkipReason::NotSynced, "");
            return;
        };

        let new_parent_tracking_id = notification.parent_tracking_id().unwrap_or_default();
        let Some(new_parent) = ctx.index.by_tracking_id(new_parent_tracking_id).cloned() else {
            tracing::warn!(
                "Move of {} at {} targets unsynced parent {}",
                tracking_id,
                ctx.path_of(&entity.id),
                new_parent_tracking_id
            );
            ctx.report.skip(
                tracking_id,
                ChangeAction::Move,
                SkipReason::ParentNotSynced,
                new_parent_tracking_id,
            );
            return;
        };

        if entity.parent_id.as_deref() == Some(new_parent.id.as_str()) {
            return;
        }

        if !ctx.is_changeable(&entity.id) {
            tracing::info!(
                "Rejecting move of locked entity {} at {}",
                entity.id,
                ctx.path_of(&entity.id)
            );
            self.reject(ctx, &entity, SkipReason::Locked).await;
            return;
        }

        if ctx.index.subtree_ids(&entity.id).contains(&new_parent.id) {
            tracing::warn!(
                "Move of {} under its own descendant {} rejected",
                entity.id,
                new_parent.id
            );
            self.reject(ctx, &entity, SkipReason::NameConflict).await;
            return;
        }

        if let Some(holder) = ctx.index.live_sibling_named(&new_parent.id, &entity.name) {
            tracing::warn!(
                "Move of {} rejected: '{}' already exists under {} ({})",
                entity.id,
                entity.name,
                ctx.path_of(&new_parent.id),
                holder.id
            );
            self.reject(ctx, &entity, SkipReason::NameConflict).await;
            return;
        }

        ctx.stage_update(&entity.id, EntityUpdate::new().with_parent(new_parent.id.clone()));
        ctx.mark_moved(&entity.id);
        for key in &self.env.config.hierarchical_attributes {
            ctx.mark_dirty(&entity.id, key);
        }
        ctx.report.moved.push(entity.id.clone());
        tracing::info!(
            "Moved {} ({}) under {}",
            entity.id,
            entity.name,
            ctx.path_of(&new_parent.id)
        );
    }

    /// Write the current parent back onto the tracking node
    async fn reject(&self, ctx: &mut BatchContext, entity: &Entity, reason: SkipReason) {
        let tracking_id = entity.tracking_id.clone().unwrap_or_default();
        let old_parent_tracking_id = entity
            .parent_id
            .as_deref()
            .and_then(|id| ctx.index.get(id))
            .and_then(|parent| parent.tracking_id.clone());

        let reason = match old_parent_tracking_id {
            Some(parent_tid) => {
                let written = write_back(
                    self.env.tracking,
                    &tracking_id,
                    PARENT_KEY,
                    Value::String(parent_tid),
                )
                .await;
                if written {
                    reason
                } else {
                    SkipReason::WriteBackFailed
                }
            }
            None => SkipReason::WriteBackFailed,
        };
        ctx.report
            .skip(tracking_id, ChangeAction::Move, reason, entity.name.clone());
    }
}
