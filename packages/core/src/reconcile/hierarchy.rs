//! Hierarchy cleanup phase
//!
//! Runs after every structural phase and consumes the bookkeeping they left
//! in the `BatchContext`:
//!
//! 1. `ancestor_names` of every entity under a moved or renamed entity is
//!    recomputed breadth-first from the project root, so each entity reuses
//!    its parent's freshly staged chain
//! 2. dirty hierarchical attributes are resolved over the project-rooted
//!    tree limited to the ancestors and descendants of dirty entities: a
//!    node's own override wins, otherwise it inherits its parent's value
//! 3. working task sets are staged as one replacement per parent
//!
//! Entities that cannot be reached from the project root are logged and
//! left as they are.

use crate::models::EntityUpdate;
use crate::reconcile::{BatchContext, SyncEnv};
use crate::services::SyncError;
use crate::tracking::TrackedEntity;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub struct HierarchyCleanupProcessor<'a> {
    env: SyncEnv<'a>,
}

impl<'a> HierarchyCleanupProcessor<'a> {
    pub fn new(env: SyncEnv<'a>) -> Self {
        Self { env }
    }

    pub async fn run(&self, ctx: &mut BatchContext) -> Result<(), SyncError> {
        if !ctx.needs_cleanup() {
            return Ok(());
        }
        let Some(project_id) = ctx.index.project().map(|project| project.id.clone()) else {
            tracing::warn!("Hierarchy cleanup skipped: project root is not live");
            return Ok(());
        };

        self.recompute_ancestry(ctx, &project_id);
        self.resolve_hierarchical(ctx, &project_id).await?;
        self.stage_task_sets(ctx);
        Ok(())
    }

    fn recompute_ancestry(&self, ctx: &mut BatchContext, project_id: &str) {
        let mut affected: BTreeSet<String> = BTreeSet::new();
        for id in ctx.moved.iter().chain(ctx.renamed.iter()) {
            affected.extend(ctx.index.subtree_ids(id));
        }
        if affected.is_empty() {
            return;
        }

        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut worklist = vec![project_id.to_string()];
        let mut head = 0;
        while head < worklist.len() {
            let node = worklist[head].clone();
            head += 1;

            let Some(chain) = ctx.index.get(&node).map(|e| e.child_ancestor_names()) else {
                continue;
            };
            for child in ctx.index.child_ids(&node) {
                if !visited.insert(child.clone()) {
                    continue;
                }
                if affected.contains(&child) {
                    ctx.stage_update(&child, EntityUpdate::new().with_ancestor_names(chain.clone()));
                }
                worklist.push(child);
            }
        }

        for orphan in affected.difference(&visited) {
            tracing::warn!(
                "Entity {} ({}) is not reachable from the project root, ancestry left unchanged",
                orphan,
                ctx.path_of(orphan)
            );
        }
    }

    async fn resolve_hierarchical(
        &self,
        ctx: &mut BatchContext,
        project_id: &str,
    ) -> Result<(), SyncError> {
        let dirty = std::mem::take(&mut ctx.dirty_attributes);
        if dirty.is_empty() {
            return Ok(());
        }

        let mut dirty_by_key: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, key) in dirty {
            dirty_by_key.entry(key).or_default().insert(id);
        }

        // Ancestors supply inherited values, descendants receive them
        let mut scope: BTreeSet<String> = BTreeSet::from([project_id.to_string()]);
        for ids in dirty_by_key.values() {
            for id in ids {
                scope.extend(ctx.index.ancestor_ids(id));
                scope.extend(ctx.index.subtree_ids(id));
            }
        }

        let tracking_ids: Vec<String> = scope
            .iter()
            .filter_map(|id| ctx.index.get(id).and_then(|e| e.tracking_id.clone()))
            .collect();
        let snapshots: HashMap<String, TrackedEntity> = self
            .env
            .tracking
            .query_entities(&tracking_ids)
            .await
            .map_err(|e| SyncError::tracking("hierarchical attribute lookup", e))?
            .into_iter()
            .map(|snapshot| (snapshot.id.clone(), snapshot))
            .collect();

        let mut writes: Vec<(String, String, Value)> = Vec::new();
        for (key, dirty_ids) in &dirty_by_key {
            let targets: BTreeSet<String> = dirty_ids
                .iter()
                .flat_map(|id| ctx.index.subtree_ids(id))
                .collect();
            writes.extend(self.resolve_key(ctx, project_id, key, &scope, &targets, &snapshots));
        }

        for (id, key, value) in writes {
            if ctx.stage_update(&id, EntityUpdate::new().with_attribute(key, value)) {
                ctx.report.mark_updated(&id);
            }
        }
        Ok(())
    }

    /// Walk the scoped tree for one key, returning the writes for `targets`
    fn resolve_key(
        &self,
        ctx: &BatchContext,
        project_id: &str,
        key: &str,
        scope: &BTreeSet<String>,
        targets: &BTreeSet<String>,
        snapshots: &HashMap<String, TrackedEntity>,
    ) -> Vec<(String, String, Value)> {
        let own_value = |id: &str| -> Option<Value> {
            let entity = ctx.index.get(id)?;
            match entity.tracking_id.as_ref().and_then(|tid| snapshots.get(tid)) {
                Some(snapshot) => snapshot.attributes.get(key).filter(|v| !v.is_null()).cloned(),
                // No snapshot to compare against: keep what is stored
                None => entity.attributes.get(key).filter(|v| !v.is_null()).cloned(),
            }
        };

        let mut resolved: HashMap<String, Option<Value>> = HashMap::new();
        let seed = own_value(project_id).or_else(|| {
            ctx.index
                .get(project_id)
                .and_then(|project| project.attributes.get(key).cloned())
        });
        resolved.insert(project_id.to_string(), seed);

        let mut writes = Vec::new();
        let mut worklist = vec![project_id.to_string()];
        let mut head = 0;
        while head < worklist.len() {
            let node = worklist[head].clone();
            head += 1;

            let value = resolved.get(&node).cloned().flatten();
            if targets.contains(&node) {
                let stored = ctx
                    .index
                    .get(&node)
                    .and_then(|entity| entity.attributes.get(key));
                match (&value, stored) {
                    (Some(value), stored) if stored != Some(value) => {
                        writes.push((node.clone(), key.to_string(), value.clone()));
                    }
                    (None, Some(stored)) if !stored.is_null() => {
                        writes.push((node.clone(), key.to_string(), Value::Null));
                    }
                    _ => {}
                }
            }

            for child in ctx.index.child_ids(&node) {
                if !scope.contains(&child) || resolved.contains_key(&child) {
                    continue;
                }
                let child_value = own_value(&child).or_else(|| value.clone());
                resolved.insert(child.clone(), child_value);
                worklist.push(child);
            }
        }
        writes
    }

    fn stage_task_sets(&self, ctx: &mut BatchContext) {
        let task_sets = std::mem::take(&mut ctx.task_sets);
        for (id, tasks) in task_sets {
            if ctx.stage_update(&id, EntityUpdate::new().with_tasks(tasks)) {
                tracing::debug!("Task set of {} updated", ctx.path_of(&id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NameValidator, SyncConfig};
    use crate::db::MemoryStore;
    use crate::models::{Entity, EntityKind};
    use crate::reconcile::EntityIndex;
    use crate::tracking::MemoryTrackingTree;
    use serde_json::json;
    use std::collections::HashSet;

    struct Fixture {
        store: MemoryStore,
        tracking: MemoryTrackingTree,
        config: SyncConfig,
        names: NameValidator,
    }

    impl Fixture {
        fn new(tracked: Vec<TrackedEntity>) -> Self {
            let config = SyncConfig::default();
            let names = NameValidator::from_config(&config).unwrap();
            Self {
                store: MemoryStore::new(),
                tracking: MemoryTrackingTree::with_entities(tracked),
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

    /// Demo(fps 24) / Ep01 / Seq01 (fps 25 override) / sh010
    fn chain() -> (Vec<Entity>, Vec<TrackedEntity>) {
        let project = Entity::new_project("Demo", "ft-p")
            .with_id("p")
            .with_attribute("fps", json!(24));
        let ep = Entity::new_child("Ep01", "Episode", &project, "ft-ep")
            .with_id("ep")
            .with_attribute("fps", json!(24));
        let seq = Entity::new_child("Seq01", "Sequence", &ep, "ft-seq")
            .with_id("seq")
            .with_attribute("fps", json!(24));
        let shot = Entity::new_child("sh010", "Shot", &seq, "ft-sh")
            .with_id("sh")
            .with_attribute("fps", json!(24));

        let tracked = vec![
            TrackedEntity::new("ft-p", "Demo", EntityKind::Project, "Project", None)
                .with_attribute("fps", json!(24)),
            TrackedEntity::new("ft-ep", "Ep01", EntityKind::Node, "Episode", Some("ft-p")),
            TrackedEntity::new("ft-seq", "Seq01", EntityKind::Node, "Sequence", Some("ft-ep"))
                .with_attribute("fps", json!(25)),
            TrackedEntity::new("ft-sh", "sh010", EntityKind::Node, "Shot", Some("ft-seq")),
        ];
        (vec![project, ep, seq, shot], tracked)
    }

    #[tokio::test]
    async fn test_intermediate_override_flows_down() {
        let (entities, tracked) = chain();
        let fixture = Fixture::new(tracked);
        let mut ctx = BatchContext::new(EntityIndex::from_entities(entities), &HashSet::new());
        ctx.mark_dirty("seq", "fps");

        HierarchyCleanupProcessor::new(fixture.env())
            .run(&mut ctx)
            .await
            .unwrap();

        let fps = |id: &str| ctx.index().get(id).unwrap().attributes.get("fps").cloned();
        assert_eq!(fps("p"), Some(json!(24)));
        assert_eq!(fps("ep"), Some(json!(24)));
        assert_eq!(fps("seq"), Some(json!(25)));
        assert_eq!(fps("sh"), Some(json!(25)));
        assert_eq!(ctx.pending.updates.len(), 2);
    }

    #[tokio::test]
    async fn test_rename_recomputes_descendant_ancestry() {
        let (entities, tracked) = chain();
        let fixture = Fixture::new(tracked);
        let mut ctx = BatchContext::new(EntityIndex::from_entities(entities), &HashSet::new());
        ctx.stage_update("ep", EntityUpdate::new().with_name("Ep02"));
        ctx.mark_renamed("ep");

        HierarchyCleanupProcessor::new(fixture.env())
            .run(&mut ctx)
            .await
            .unwrap();

        let shot = ctx.index().get("sh").unwrap();
        assert_eq!(shot.ancestor_names, vec!["Ep02", "Seq01"]);
        assert_eq!(shot.hierarchy_path, "Ep02/Seq01");
        assert_eq!(ctx.index().get("seq").unwrap().ancestor_names, vec!["Ep02"]);
    }

    #[tokio::test]
    async fn test_task_sets_staged_once_per_parent() {
        let (entities, tracked) = chain();
        let fixture = Fixture::new(tracked);
        let mut ctx = BatchContext::new(EntityIndex::from_entities(entities), &HashSet::new());
        ctx.task_set("sh").unwrap().insert("comp".to_string());
        ctx.task_set("sh").unwrap().insert("lighting".to_string());

        HierarchyCleanupProcessor::new(fixture.env())
            .run(&mut ctx)
            .await
            .unwrap();

        assert_eq!(ctx.pending.updates.len(), 1);
        assert_eq!(ctx.index().get("sh").unwrap().tasks.len(), 2);
        assert!(ctx.task_sets.is_empty());
    }
}
