//! Removal phase
//!
//! Changeable entities are archived, never deleted. Locked entities are
//! recreated in the tracking tree under their parent and remapped to the new
//! tracking id, so the downstream pipeline keeps its node. Names released by
//! archival feed the duplicate sweep.

use crate::models::{ChangeAction, Entity, EntityKind, EntityUpdate, Notification};
use crate::reconcile::{BatchContext, DuplicateSweep, SkipReason, SyncEnv};
use crate::services::SyncError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Type name given to task nodes recreated in the tracking tree
const RECREATED_TASK_TYPE: &str = "Task";

pub struct RemovalProcessor<'a> {
    env: SyncEnv<'a>,
}

impl<'a> RemovalProcessor<'a> {
    pub fn new(env: SyncEnv<'a>) -> Self {
        Self { env }
    }

    pub async fn run(
        &self,
        ctx: &mut BatchContext,
        removed: BTreeMap<String, Notification>,
    ) -> Result<(), SyncError> {
        let (tasks, mut entities): (Vec<Notification>, Vec<Notification>) =
            removed.into_values().partition(Notification::is_task);

        for notification in &tasks {
            self.remove_task(ctx, notification);
        }

        entities.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        for notification in &entities {
            let Some(entity) = ctx.index.by_tracking_id(&notification.entity_id).cloned() else {
                tracing::debug!(
                    "Removed tracking entity {} has no live counterpart",
                    notification.entity_id
                );
                continue;
            };

            if ctx.is_changeable(&entity.id) {
                self.archive(ctx, &entity);
            } else {
                self.recreate(ctx, &entity, notification).await?;
            }
        }

        let freed = ctx.take_freed_names();
        DuplicateSweep::new(self.env).run(ctx, freed).await
    }

    fn remove_task(&self, ctx: &mut BatchContext, notification: &Notification) {
        let Some(name) = notification.entity_name().map(str::to_string) else {
            tracing::warn!(
                "Removed task {} carries no name, task set left unchanged",
                notification.entity_id
            );
            ctx.report.skip(
                &notification.entity_id,
                ChangeAction::Remove,
                SkipReason::NotSynced,
                "task name unknown",
            );
            return;
        };

        let parent_id = notification
            .parent_tracking_id()
            .and_then(|tid| ctx.index.by_tracking_id(tid))
            .map(|parent| parent.id.clone());
        let Some(parent_id) = parent_id else {
            ctx.report.skip(
                &notification.entity_id,
                ChangeAction::Remove,
                SkipReason::ParentNotSynced,
                name,
            );
            return;
        };

        if let Some(tasks) = ctx.task_set(&parent_id) {
            if tasks.remove(&name) {
                tracing::debug!("Task '{}' removed from {}", name, ctx.path_of(&parent_id));
            }
        }
    }

    fn archive(&self, ctx: &mut BatchContext, entity: &Entity) {
        tracing::info!(
            "Archiving {} ({}) at {}",
            entity.id,
            entity.tracking_id.as_deref().unwrap_or_default(),
            ctx.path_of(&entity.id)
        );
        if ctx.stage_update(&entity.id, EntityUpdate::archive()) {
            ctx.free_name(&entity.name);
            ctx.report.archived.push(entity.id.clone());
        }
    }

    /// Put a locked entity back into the tracking tree
    async fn recreate(
        &self,
        ctx: &mut BatchContext,
        entity: &Entity,
        notification: &Notification,
    ) -> Result<(), SyncError> {
        let parent = entity
            .parent_id
            .as_deref()
            .and_then(|id| ctx.index.get(id))
            .cloned();
        let Some(parent_tracking_id) = parent.as_ref().and_then(|p| p.tracking_id.clone()) else {
            tracing::warn!(
                "Locked entity {} at {} has no synced parent to recreate under",
                entity.id,
                ctx.path_of(&entity.id)
            );
            ctx.report.skip(
                &notification.entity_id,
                ChangeAction::Remove,
                SkipReason::ParentNotSynced,
                entity.name.clone(),
            );
            return Ok(());
        };

        tracing::info!(
            "Entity {} at {} is locked, recreating it in the tracking tree",
            entity.id,
            ctx.path_of(&entity.id)
        );

        let tracking = self.env.tracking;
        let attributes = self.recreated_attributes(entity, parent.as_ref());
        let result: anyhow::Result<String> = async {
            let new_id = tracking
                .create_entity(
                    &parent_tracking_id,
                    &entity.name,
                    EntityKind::Node,
                    &entity.entity_type,
                )
                .await?;
            for (key, value) in attributes {
                tracking.write_field(&new_id, &key, value).await?;
            }
            for task in &entity.tasks {
                tracking
                    .create_entity(&new_id, task, EntityKind::Task, RECREATED_TASK_TYPE)
                    .await?;
            }
            tracking.commit().await?;
            Ok(new_id)
        }
        .await;

        let new_tracking_id = match result {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    "Recreating locked entity {} at {} failed: {}",
                    entity.id,
                    ctx.path_of(&entity.id),
                    e
                );
                if let Err(e) = tracking.rollback().await {
                    tracing::warn!("Rollback after failed recreate also failed: {}", e);
                }
                ctx.report.skip(
                    &notification.entity_id,
                    ChangeAction::Remove,
                    SkipReason::WriteBackFailed,
                    e.to_string(),
                );
                return Ok(());
            }
        };

        ctx.stage_update(
            &entity.id,
            EntityUpdate::new().with_tracking_id(new_tracking_id.clone()),
        );
        ctx.task_sets.insert(entity.id.clone(), entity.tasks.clone());
        ctx.report.recreated.push(entity.id.clone());
        ctx.report.skip(
            &notification.entity_id,
            ChangeAction::Remove,
            SkipReason::Locked,
            new_tracking_id,
        );
        Ok(())
    }

    /// Values to write onto the recreated node: flat attributes, hierarchical
    /// ones only where they override the parent, and the entity id.
    fn recreated_attributes(&self, entity: &Entity, parent: Option<&Entity>) -> Vec<(String, Value)> {
        let config = self.env.config;
        let mut attributes: Vec<(String, Value)> = entity
            .attributes
            .iter()
            .filter(|(key, value)| {
                if config.is_ignored_key(key) || value.is_null() {
                    return false;
                }
                if config.is_hierarchical(key) {
                    return parent.and_then(|p| p.attributes.get(*key)) != Some(*value);
                }
                true
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        attributes.push((config.id_attribute.clone(), Value::String(entity.id.clone())));
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NameValidator, SyncConfig};
    use crate::db::MemoryStore;
    use crate::reconcile::EntityIndex;
    use crate::tracking::{MemoryTrackingTree, TrackedEntity, TrackingTree};
    use serde_json::json;
    use std::collections::HashSet;

    struct Fixture {
        store: MemoryStore,
        tracking: MemoryTrackingTree,
        config: SyncConfig,
        names: NameValidator,
    }

    impl Fixture {
        fn new() -> Self {
            let config = SyncConfig::default();
            let names = NameValidator::from_config(&config).unwrap();
            let tracking = MemoryTrackingTree::with_entities(vec![
                TrackedEntity::new("ft-p", "Demo", EntityKind::Project, "Project", None),
                TrackedEntity::new("ft-seq", "Seq01", EntityKind::Node, "Sequence", Some("ft-p")),
            ]);
            Self {
                store: MemoryStore::new(),
                tracking,
                config,
                names,
            }
        }

        fn env(&self) -> SyncEnv<'_> {
            SyncEnv {
                store: &self.store,
                tracking: &self.tracking,
                config: &self.config,
                names: &self.names,
            }
        }
    }

    fn entities() -> Vec<Entity> {
        let project = Entity::new_project("Demo", "ft-p")
            .with_id("p")
            .with_attribute("fps", json!(24));
        let seq = Entity::new_child("Seq01", "Sequence", &project, "ft-seq").with_id("seq");
        let mut shot = Entity::new_child("sh010", "Shot", &seq, "ft-sh")
            .with_id("sh")
            .with_attribute("fps", json!(25))
            .with_attribute("comment", json!("hero"));
        shot.tasks.insert("comp".to_string());
        vec![project, seq, shot]
    }

    fn removed(id: &str) -> BTreeMap<String, Notification> {
        let n = Notification::new(id, EntityKind::Node, "Shot", ChangeAction::Remove)
            .with_parent("ft-seq", EntityKind::Node)
            .with_parent("ft-p", EntityKind::Project);
        BTreeMap::from([(id.to_string(), n)])
    }

    #[tokio::test]
    async fn test_changeable_entity_is_archived() {
        let fixture = Fixture::new();
        let mut ctx = BatchContext::new(EntityIndex::from_entities(entities()), &HashSet::new());

        RemovalProcessor::new(fixture.env())
            .run(&mut ctx, removed("ft-sh"))
            .await
            .unwrap();

        assert!(ctx.index().get("sh").is_none());
        assert!(ctx.index().get_archived("sh").is_some());
        assert_eq!(ctx.report().archived, vec!["sh"]);
    }

    #[tokio::test]
    async fn test_locked_entity_is_recreated() {
        let fixture = Fixture::new();
        let published = HashSet::from(["sh".to_string()]);
        let mut ctx = BatchContext::new(EntityIndex::from_entities(entities()), &published);

        RemovalProcessor::new(fixture.env())
            .run(&mut ctx, removed("ft-sh"))
            .await
            .unwrap();

        let shot = ctx.index().get("sh").unwrap().clone();
        let new_tid = shot.tracking_id.clone().unwrap();
        assert_ne!(new_tid, "ft-sh");
        assert_eq!(shot.name, "sh010");
        assert_eq!(ctx.report().recreated, vec!["sh"]);

        let recreated = fixture.tracking.get(&new_tid).await.unwrap();
        assert_eq!(recreated.parent_id.as_deref(), Some("ft-seq"));
        assert_eq!(recreated.attributes.get("comment"), Some(&json!("hero")));
        assert_eq!(recreated.attributes.get("fps"), Some(&json!(25)));
        assert_eq!(recreated.attributes.get("sync_id"), Some(&json!("sh")));

        let tasks = fixture
            .tracking
            .query_children(&[new_tid])
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].is_task());
    }

    #[tokio::test]
    async fn test_failed_recreate_is_reported() {
        let fixture = Fixture::new();
        fixture.tracking.set_fail_commits(true);
        let published = HashSet::from(["sh".to_string()]);
        let mut ctx = BatchContext::new(EntityIndex::from_entities(entities()), &published);

        RemovalProcessor::new(fixture.env())
            .run(&mut ctx, removed("ft-sh"))
            .await
            .unwrap();

        assert_eq!(
            ctx.index().get("sh").unwrap().tracking_id.as_deref(),
            Some("ft-sh")
        );
        assert_eq!(ctx.report().skips(SkipReason::WriteBackFailed), 1);
        assert!(ctx.pending.is_empty());
    }

    #[tokio::test]
    async fn test_task_removal_updates_parent_task_set() {
        let fixture = Fixture::new();
        let mut ctx = BatchContext::new(EntityIndex::from_entities(entities()), &HashSet::new());
        let task = Notification::new("ft-comp", EntityKind::Task, "Task", ChangeAction::Remove)
            .with_change("name", Some(json!("comp")), None)
            .with_parent("ft-sh", EntityKind::Node);

        RemovalProcessor::new(fixture.env())
            .run(&mut ctx, BTreeMap::from([("ft-comp".to_string(), task)]))
            .await
            .unwrap();

        assert!(ctx.task_sets["sh"].is_empty());
        assert!(ctx.index().get("sh").is_some());
    }
}
