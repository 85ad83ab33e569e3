//! Addition phase
//!
//! Creates project database entities for newly added tracking nodes. Input
//! is processed shallowest first so a parent added in the same batch exists
//! before its children are attempted. An archived entity with the same name
//! is relinked (its id reused) instead of minting a new one when it sits at
//! the same ancestor path or is itself changeable.

use crate::models::{ChangeAction, Entity, EntityUpdate, Notification, ValidationError};
use crate::reconcile::{write_back, BatchContext, SkipReason, SyncEnv};
use crate::services::SyncError;
use crate::tracking::TrackedEntity;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub struct AdditionProcessor<'a> {
    env: SyncEnv<'a>,
}

impl<'a> AdditionProcessor<'a> {
    pub fn new(env: SyncEnv<'a>) -> Self {
        Self { env }
    }

    pub async fn run(
        &self,
        ctx: &mut BatchContext,
        added: BTreeMap<String, Notification>,
    ) -> Result<(), SyncError> {
        if added.is_empty() {
            return Ok(());
        }

        let mut ordered: Vec<Notification> = added.into_values().collect();
        ordered.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        let ids: Vec<String> = ordered.iter().map(|n| n.entity_id.clone()).collect();
        let snapshots: HashMap<String, TrackedEntity> = self
            .env
            .tracking
            .query_entities(&ids)
            .await
            .map_err(|e| SyncError::tracking("added entity lookup", e))?
            .into_iter()
            .map(|snapshot| (snapshot.id.clone(), snapshot))
            .collect();

        for notification in ordered {
            let Some(snapshot) = snapshots.get(&notification.entity_id) else {
                tracing::debug!(
                    "Added entity {} no longer exists in the tracking tree",
                    notification.entity_id
                );
                ctx.report.skip(
                    &notification.entity_id,
                    ChangeAction::Add,
                    SkipReason::NotInTrackingTree,
                    "",
                );
                continue;
            };

            let result = if snapshot.is_task() {
                self.add_task(ctx, snapshot)
            } else {
                self.create_from_snapshot(ctx, snapshot).await.map(|_| ())
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_entity_scoped() => {
                    tracing::warn!("Skipping addition of {}: {}", snapshot.id, e);
                    ctx.report.skip(
                        &snapshot.id,
                        ChangeAction::Add,
                        SkipReason::from_error(&e),
                        e.to_string(),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Merge a task-kind tracking node into its parent's task set
    pub fn add_task(&self, ctx: &mut BatchContext, snapshot: &TrackedEntity) -> Result<(), SyncError> {
        let parent_tracking_id = snapshot.parent_id.as_deref().unwrap_or_default();
        let parent_id = ctx
            .index
            .by_tracking_id(parent_tracking_id)
            .map(|parent| parent.id.clone())
            .ok_or_else(|| SyncError::parent_not_synced(&snapshot.id, parent_tracking_id))?;

        if !self.env.names.is_valid(&snapshot.entity_type, &snapshot.name) {
            return Err(ValidationError::InvalidName {
                name: snapshot.name.clone(),
                entity_type: snapshot.entity_type.clone(),
            }
            .into());
        }

        if let Some(tasks) = ctx.task_set(&parent_id) {
            if tasks.insert(snapshot.name.clone()) {
                tracing::debug!(
                    "Task '{}' added under {}",
                    snapshot.name,
                    ctx.path_of(&parent_id)
                );
            }
        }
        Ok(())
    }

    /// Create (or relink) the entity for a non-task tracking node.
    ///
    /// Returns the entity id, or `None` when the node is already synced or
    /// was skipped as a duplicate name.
    pub async fn create_from_snapshot(
        &self,
        ctx: &mut BatchContext,
        snapshot: &TrackedEntity,
    ) -> Result<Option<String>, SyncError> {
        if let Some(synced_id) = ctx.index.by_tracking_id(&snapshot.id).map(|e| e.id.clone()) {
            tracing::debug!("Tracking entity {} is already synced", snapshot.id);
            // A previous batch may have synced it without landing the id write-back
            self.write_back_id(ctx, snapshot, &synced_id).await;
            return Ok(None);
        }

        let parent_tracking_id = snapshot.parent_id.as_deref().unwrap_or_default();
        let parent = ctx
            .index
            .by_tracking_id(parent_tracking_id)
            .cloned()
            .ok_or_else(|| SyncError::parent_not_synced(&snapshot.id, parent_tracking_id))?;

        if !self.env.names.is_valid(&snapshot.entity_type, &snapshot.name) {
            return Err(ValidationError::InvalidName {
                name: snapshot.name.clone(),
                entity_type: snapshot.entity_type.clone(),
            }
            .into());
        }

        if let Some(existing) = ctx.index.live_sibling_named(&parent.id, &snapshot.name) {
            tracing::warn!(
                "Duplicate name '{}' under {} (held by {}), tracking entity {} not synced",
                snapshot.name,
                ctx.path_of(&parent.id),
                existing.id,
                snapshot.id
            );
            ctx.report.skip(
                &snapshot.id,
                ChangeAction::Add,
                SkipReason::DuplicateName,
                snapshot.name.clone(),
            );
            return Ok(None);
        }

        let mut entity = Entity::new_child(
            snapshot.name.clone(),
            snapshot.entity_type.clone(),
            &parent,
            snapshot.id.clone(),
        );
        entity.attributes = self.initial_attributes(snapshot, &parent);

        let id = match self.relink_candidate(ctx, &entity) {
            Some(archived_id) => {
                entity.id = archived_id.clone();
                entity.validate()?;

                let mut update = EntityUpdate::unarchive()
                    .with_name(entity.name.clone())
                    .with_parent(parent.id.clone())
                    .with_tracking_id(snapshot.id.clone())
                    .with_ancestor_names(entity.ancestor_names.clone())
                    .with_tasks(Default::default());
                update.entity_type = Some(entity.entity_type.clone());
                update.attributes = entity.attributes.clone();
                if let Some(archived) = ctx.index.get_archived(&archived_id) {
                    // Values the tracking node no longer carries are cleared
                    for key in archived.attributes.keys() {
                        if !update.attributes.contains_key(key) {
                            update.attributes.insert(key.clone(), Value::Null);
                        }
                    }
                }

                ctx.stage_update(&archived_id, update);
                ctx.report.relinked.push(archived_id.clone());
                tracing::info!(
                    "Relinked archived entity {} to tracking entity {} at {}",
                    archived_id,
                    snapshot.id,
                    ctx.path_of(&archived_id)
                );
                archived_id
            }
            None => {
                entity.validate()?;
                let id = entity.id.clone();
                ctx.stage_insert(entity);
                ctx.report.created.push(id.clone());
                tracing::info!(
                    "Created entity {} for tracking entity {} at {}",
                    id,
                    snapshot.id,
                    ctx.path_of(&id)
                );
                id
            }
        };

        self.write_back_id(ctx, snapshot, &id).await;
        Ok(Some(id))
    }

    /// Store the entity id on the tracking node unless it already carries it.
    ///
    /// A failed write is reported; the redelivered notification retries it.
    async fn write_back_id(&self, ctx: &mut BatchContext, snapshot: &TrackedEntity, id: &str) {
        let id_attribute = &self.env.config.id_attribute;
        if snapshot.attributes.get(id_attribute).and_then(Value::as_str) == Some(id) {
            return;
        }
        let written = write_back(
            self.env.tracking,
            &snapshot.id,
            id_attribute,
            Value::String(id.to_string()),
        )
        .await;
        if !written {
            ctx.report.skip(
                &snapshot.id,
                ChangeAction::Add,
                SkipReason::WriteBackFailed,
                id_attribute.clone(),
            );
        }
    }

    /// Flat values as stored in the tracking tree; hierarchical values are
    /// the node's own override or else the parent's resolved value.
    fn initial_attributes(
        &self,
        snapshot: &TrackedEntity,
        parent: &Entity,
    ) -> BTreeMap<String, Value> {
        let config = self.env.config;
        let mut attributes: BTreeMap<String, Value> = snapshot
            .attributes
            .iter()
            .filter(|(key, _)| !config.is_ignored_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        for key in &config.hierarchical_attributes {
            let own = attributes.get(key).filter(|value| !value.is_null());
            if own.is_none() {
                match parent.attributes.get(key) {
                    Some(inherited) => {
                        attributes.insert(key.clone(), inherited.clone());
                    }
                    None => {
                        attributes.remove(key);
                    }
                }
            }
        }
        attributes
    }

    /// An archived entity whose id the new entity should reuse.
    ///
    /// Same ancestor path wins; otherwise the first changeable candidate.
    fn relink_candidate(&self, ctx: &BatchContext, entity: &Entity) -> Option<String> {
        let candidates: Vec<&Entity> = ctx
            .index
            .archived_named(&entity.name)
            .into_iter()
            .filter(|candidate| !candidate.is_project())
            .collect();

        candidates
            .iter()
            .find(|candidate| candidate.ancestor_names == entity.ancestor_names)
            .or_else(|| {
                candidates
                    .iter()
                    .find(|candidate| ctx.is_changeable(&candidate.id))
            })
            .map(|candidate| candidate.id.clone())
    }
}
