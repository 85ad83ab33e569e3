//! Batch-scoped lookup index over the project database
//!
//! Built from a single scan of the store when a batch first needs it, then
//! kept in step with every staged write so all phases of the batch read one
//! consistent snapshot instead of querying the store.
//!
//! # Maps
//!
//! - `live`: id → entity (non-archived)
//! - `by_parent`: parent id → child ids
//! - `by_name`: name → ids (names repeat across parents)
//! - `by_tracking_id`: tracking id → id
//! - `archived` / `archived_by_name`: the soft-deleted parallel index
//!
//! Staged changes re-key an entity by first invalidating its entries, so a
//! lookup under a stale key finds nothing rather than a ghost.

use crate::db::EntityStore;
use crate::models::{Entity, EntityQuery, EntityUpdate};
use crate::services::SyncError;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Lookup key families that `EntityIndex::invalidate` can purge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKey {
    /// The entity itself and every entry pointing at it
    Id,
    Parent,
    Name,
    TrackingId,
}

#[derive(Debug, Default)]
pub struct EntityIndex {
    live: HashMap<String, Entity>,
    by_parent: HashMap<String, BTreeSet<String>>,
    by_name: HashMap<String, BTreeSet<String>>,
    by_tracking_id: HashMap<String, String>,
    archived: HashMap<String, Entity>,
    archived_by_name: HashMap<String, BTreeSet<String>>,
    project_id: Option<String>,
    pristine_parents: HashMap<String, Option<String>>,
}

impl EntityIndex {
    /// Scan the whole project database once
    pub async fn build(store: &dyn EntityStore) -> Result<Self, SyncError> {
        let entities = store
            .find(EntityQuery::all())
            .await
            .map_err(|e| SyncError::store("entity index build", e))?;
        let index = Self::from_entities(entities);
        tracing::debug!(
            "Entity index built: {} live, {} archived",
            index.live.len(),
            index.archived.len()
        );
        Ok(index)
    }

    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut index = Self::default();
        for entity in entities {
            index
                .pristine_parents
                .insert(entity.id.clone(), entity.parent_id.clone());
            if entity.archived {
                index.insert_archived(entity);
            } else {
                index.insert(entity);
            }
        }
        index
    }

    /// Parent links of every entity (live and archived) as first loaded
    pub fn pristine_parents(&self) -> &HashMap<String, Option<String>> {
        &self.pristine_parents
    }

    pub fn project(&self) -> Option<&Entity> {
        self.project_id.as_ref().and_then(|id| self.live.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.live.get(id)
    }

    pub fn get_archived(&self, id: &str) -> Option<&Entity> {
        self.archived.get(id)
    }

    pub fn by_tracking_id(&self, tracking_id: &str) -> Option<&Entity> {
        self.by_tracking_id
            .get(tracking_id)
            .and_then(|id| self.live.get(id))
    }

    /// Live children of `id` in id order
    pub fn children(&self, id: &str) -> Vec<&Entity> {
        self.by_parent
            .get(id)
            .map(|ids| ids.iter().filter_map(|child| self.live.get(child)).collect())
            .unwrap_or_default()
    }

    pub fn child_ids(&self, id: &str) -> Vec<String> {
        self.by_parent
            .get(id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The live entity named `name` under `parent_id`, if any
    pub fn live_sibling_named(&self, parent_id: &str, name: &str) -> Option<&Entity> {
        self.by_name.get(name).and_then(|ids| {
            ids.iter()
                .filter_map(|id| self.live.get(id))
                .find(|entity| entity.parent_id.as_deref() == Some(parent_id))
        })
    }

    /// Archived entities named `name`, ordered by id
    pub fn archived_named(&self, name: &str) -> Vec<&Entity> {
        self.archived_by_name
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| self.archived.get(id)).collect())
            .unwrap_or_default()
    }

    /// Live ancestor ids of `id`, nearest first, ending at the project root
    pub fn ancestor_ids(&self, id: &str) -> Vec<String> {
        let mut ancestors = Vec::new();
        let mut current = self.live.get(id).and_then(|e| e.parent_id.clone());
        while let Some(parent_id) = current {
            if ancestors.contains(&parent_id) || parent_id == id {
                tracing::warn!("Parent cycle detected above entity {}", id);
                break;
            }
            current = self.live.get(&parent_id).and_then(|e| e.parent_id.clone());
            ancestors.push(parent_id);
        }
        ancestors
    }

    /// `id` and all of its live descendants, breadth-first
    pub fn subtree_ids(&self, id: &str) -> Vec<String> {
        if !self.live.contains_key(id) {
            return Vec::new();
        }
        let mut visited: HashSet<String> = HashSet::from([id.to_string()]);
        let mut worklist = vec![id.to_string()];
        let mut head = 0;
        while head < worklist.len() {
            let children = self.child_ids(&worklist[head]);
            head += 1;
            for child in children {
                if visited.insert(child.clone()) {
                    worklist.push(child);
                }
            }
        }
        worklist
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    /// Register a live entity under every key
    pub fn insert(&mut self, entity: Entity) {
        if let Some(parent_id) = &entity.parent_id {
            self.by_parent
                .entry(parent_id.clone())
                .or_default()
                .insert(entity.id.clone());
        } else if entity.is_project() {
            self.project_id = Some(entity.id.clone());
        }
        self.by_name
            .entry(entity.name.clone())
            .or_default()
            .insert(entity.id.clone());
        if let Some(tracking_id) = &entity.tracking_id {
            if let Some(previous) = self
                .by_tracking_id
                .insert(tracking_id.clone(), entity.id.clone())
            {
                if previous != entity.id {
                    tracing::warn!(
                        "Tracking id {} was held by {} and is now held by {}",
                        tracking_id,
                        previous,
                        entity.id
                    );
                }
            }
        }
        self.live.insert(entity.id.clone(), entity);
    }

    fn insert_archived(&mut self, entity: Entity) {
        self.archived_by_name
            .entry(entity.name.clone())
            .or_default()
            .insert(entity.id.clone());
        self.archived.insert(entity.id.clone(), entity);
    }

    fn remove_archived(&mut self, id: &str) -> Option<Entity> {
        let entity = self.archived.remove(id)?;
        if let Some(ids) = self.archived_by_name.get_mut(&entity.name) {
            ids.remove(id);
        }
        Some(entity)
    }

    /// Purge the live lookup entries of `entity_id` under `key`
    pub fn invalidate(&mut self, key: IndexKey, entity_id: &str) {
        let Some(entity) = self.live.get(entity_id) else {
            return;
        };
        match key {
            IndexKey::Parent => {
                if let Some(parent_id) = &entity.parent_id {
                    if let Some(ids) = self.by_parent.get_mut(parent_id) {
                        ids.remove(entity_id);
                    }
                }
            }
            IndexKey::Name => {
                if let Some(ids) = self.by_name.get_mut(&entity.name) {
                    ids.remove(entity_id);
                }
            }
            IndexKey::TrackingId => {
                if let Some(tracking_id) = &entity.tracking_id {
                    if self.by_tracking_id.get(tracking_id).map(String::as_str) == Some(entity_id) {
                        self.by_tracking_id.remove(tracking_id);
                    }
                }
            }
            IndexKey::Id => {
                self.invalidate(IndexKey::Parent, entity_id);
                self.invalidate(IndexKey::Name, entity_id);
                self.invalidate(IndexKey::TrackingId, entity_id);
                if self.project_id.as_deref() == Some(entity_id) {
                    self.project_id = None;
                }
                self.live.remove(entity_id);
            }
        }
    }

    /// Apply a staged update, re-keying the entity and moving it between the
    /// live and archived sides as its `archived` tag dictates.
    ///
    /// Returns `false` if the id is unknown.
    pub fn apply(&mut self, id: &str, update: &EntityUpdate) -> bool {
        let mut entity = if let Some(entity) = self.live.get(id).cloned() {
            self.invalidate(IndexKey::Id, id);
            entity
        } else if let Some(entity) = self.remove_archived(id) {
            entity
        } else {
            return false;
        };

        update.apply_to(&mut entity);
        if entity.archived {
            self.insert_archived(entity);
        } else {
            self.insert(entity);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn fixture() -> (EntityIndex, Entity, Entity, Entity) {
        let project = Entity::new_project("Demo", "ft-p").with_id("p");
        let seq = Entity::new_child("Seq01", "Sequence", &project, "ft-seq").with_id("seq");
        let shot = Entity::new_child("sh010", "Shot", &seq, "ft-sh").with_id("sh");
        let old = Entity::new_child("sh010", "Shot", &seq, "ft-old")
            .with_id("old")
            .archived();
        let index = EntityIndex::from_entities(vec![
            project.clone(),
            seq.clone(),
            shot.clone(),
            old,
        ]);
        (index, project, seq, shot)
    }

    #[test]
    fn test_lookups() {
        let (index, project, seq, shot) = fixture();

        assert_eq!(index.project().map(|p| p.id.as_str()), Some(project.id.as_str()));
        assert_eq!(index.by_tracking_id("ft-sh").map(|e| e.id.as_str()), Some("sh"));
        assert!(index.by_tracking_id("ft-old").is_none());
        assert_eq!(index.children(&seq.id).len(), 1);
        assert_eq!(
            index.live_sibling_named(&seq.id, "sh010").map(|e| &e.id),
            Some(&shot.id)
        );
        assert_eq!(index.archived_named("sh010").len(), 1);
        assert_eq!(index.ancestor_ids(&shot.id), vec!["seq", "p"]);
        assert_eq!(index.subtree_ids(&seq.id), vec!["seq", "sh"]);
        assert_eq!(index.pristine_parents().len(), 4);
    }

    #[test]
    fn test_subtree_walk_terminates_on_parent_cycle() {
        let (_, project, seq, _) = fixture();
        let mut a = Entity::new_child("A", "Sequence", &seq, "ft-a").with_id("a");
        let b = Entity::new_child("B", "Sequence", &a, "ft-b").with_id("b");
        a.parent_id = Some("b".to_string());
        let index = EntityIndex::from_entities(vec![project, seq, a, b]);

        assert_eq!(index.subtree_ids("a"), vec!["a", "b"]);
    }

    #[test]
    fn test_rename_purges_old_name_entry() {
        let (mut index, _, seq, shot) = fixture();

        assert!(index.apply(&shot.id, &EntityUpdate::new().with_name("sh020")));
        assert!(index.live_sibling_named(&seq.id, "sh010").is_none());
        assert!(index.live_sibling_named(&seq.id, "sh020").is_some());
    }

    #[test]
    fn test_archive_moves_entity_to_archived_side() {
        let (mut index, _, seq, shot) = fixture();

        index.apply(&shot.id, &EntityUpdate::archive());
        assert!(index.get(&shot.id).is_none());
        assert!(index.by_tracking_id("ft-sh").is_none());
        assert!(index.children(&seq.id).is_empty());
        assert!(index.get_archived(&shot.id).is_some());
        assert_eq!(index.archived_named("sh010").len(), 2);

        index.apply(&shot.id, &EntityUpdate::unarchive());
        assert!(index.by_tracking_id("ft-sh").is_some());
        assert_eq!(index.archived_named("sh010").len(), 1);
    }

    #[test]
    fn test_invalidate_tracking_id_only() {
        let (mut index, _, _, shot) = fixture();

        index.invalidate(IndexKey::TrackingId, &shot.id);
        assert!(index.by_tracking_id("ft-sh").is_none());
        assert!(index.get(&shot.id).is_some());
        assert!(!index.apply("missing", &EntityUpdate::new().with_name("x")));
    }

    #[tokio::test]
    async fn test_build_from_store() {
        let project = Entity::new_project("Demo", "ft-p");
        let seq = Entity::new_child("Seq01", "Sequence", &project, "ft-seq");
        let store = MemoryStore::with_entities(vec![project, seq]);

        let index = EntityIndex::build(&store).await.unwrap();
        assert_eq!(index.live_len(), 2);
    }
}
