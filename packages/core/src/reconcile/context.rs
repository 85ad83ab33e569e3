//! Per-batch state threaded through every phase
//!
//! A `BatchContext` is created when a batch has work, carries the entity
//! index, the memoized changeability, every staged write and the dirty
//! bookkeeping the hierarchy cleanup consumes, and is dropped once the batch
//! is persisted. Nothing here outlives a batch.

use crate::db::EntityStore;
use crate::models::{Entity, EntityUpdate};
use crate::reconcile::{BatchReport, ChangeabilityResolver, EntityIndex};
use crate::services::SyncError;
use std::collections::{BTreeMap, BTreeSet};

/// Writes staged for the batch's single bulk call, in staging order
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PendingWrites {
    pub inserts: Vec<Entity>,
    pub updates: Vec<(String, EntityUpdate)>,
}

impl PendingWrites {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

#[derive(Debug)]
pub struct BatchContext {
    pub(crate) index: EntityIndex,
    pub(crate) changeability: ChangeabilityResolver,
    pub(crate) pending: PendingWrites,
    /// Working task sets of parents touched this batch
    pub(crate) task_sets: BTreeMap<String, BTreeSet<String>>,
    /// (entity id, hierarchical key) pairs needing re-resolution
    pub(crate) dirty_attributes: BTreeSet<(String, String)>,
    pub(crate) moved: BTreeSet<String>,
    pub(crate) renamed: BTreeSet<String>,
    /// Names released by archival or rename, input of the duplicate sweep
    pub(crate) freed_names: BTreeSet<String>,
    pub(crate) report: BatchReport,
}

impl BatchContext {
    /// Build the index and the changeability snapshot from the store
    pub async fn load(store: &dyn EntityStore) -> Result<Self, SyncError> {
        let index = EntityIndex::build(store).await?;
        let published = store
            .published_entity_ids()
            .await
            .map_err(|e| SyncError::store("published entity lookup", e))?;
        Ok(Self::new(index, &published))
    }

    pub fn new(index: EntityIndex, published: &std::collections::HashSet<String>) -> Self {
        let changeability = ChangeabilityResolver::resolve(index.pristine_parents(), published);
        Self {
            index,
            changeability,
            pending: PendingWrites::default(),
            task_sets: BTreeMap::new(),
            dirty_attributes: BTreeSet::new(),
            moved: BTreeSet::new(),
            renamed: BTreeSet::new(),
            freed_names: BTreeSet::new(),
            report: BatchReport::processed(),
        }
    }

    pub fn index(&self) -> &EntityIndex {
        &self.index
    }

    pub fn report(&self) -> &BatchReport {
        &self.report
    }

    pub fn is_changeable(&self, entity_id: &str) -> bool {
        self.changeability.is_changeable(entity_id)
    }

    /// Stage creation of a new entity
    pub fn stage_insert(&mut self, entity: Entity) {
        self.index.insert(entity.clone());
        self.pending.inserts.push(entity);
    }

    /// Stage an update, narrowed to the fields that actually change.
    ///
    /// Returns `false` when nothing would change or the id is unknown.
    pub fn stage_update(&mut self, id: &str, update: EntityUpdate) -> bool {
        let current = self.index.get(id).or_else(|| self.index.get_archived(id));
        let Some(current) = current else {
            tracing::warn!("Dropping update for unknown entity {}", id);
            return false;
        };

        let update = update.changes_against(current);
        if update.is_empty() {
            return false;
        }
        self.index.apply(id, &update);
        self.pending.updates.push((id.to_string(), update));
        true
    }

    /// Working task set of `entity_id`, seeded from the stored set
    pub fn task_set(&mut self, entity_id: &str) -> Option<&mut BTreeSet<String>> {
        if !self.task_sets.contains_key(entity_id) {
            let tasks = self.index.get(entity_id)?.tasks.clone();
            self.task_sets.insert(entity_id.to_string(), tasks);
        }
        self.task_sets.get_mut(entity_id)
    }

    pub fn mark_dirty(&mut self, entity_id: &str, key: &str) {
        self.dirty_attributes
            .insert((entity_id.to_string(), key.to_string()));
    }

    pub fn mark_moved(&mut self, entity_id: &str) {
        self.moved.insert(entity_id.to_string());
    }

    pub fn mark_renamed(&mut self, entity_id: &str) {
        self.renamed.insert(entity_id.to_string());
    }

    pub fn free_name(&mut self, name: &str) {
        self.freed_names.insert(name.to_string());
    }

    pub fn take_freed_names(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.freed_names)
    }

    /// Hierarchy path of an entity for log context
    pub fn path_of(&self, entity_id: &str) -> String {
        match self.index.get(entity_id) {
            Some(entity) if entity.hierarchy_path.is_empty() => entity.name.clone(),
            Some(entity) => format!("{}/{}", entity.hierarchy_path, entity.name),
            None => format!("<{}>", entity_id),
        }
    }

    /// Whether the hierarchy cleanup has anything to do
    pub fn needs_cleanup(&self) -> bool {
        !self.moved.is_empty()
            || !self.renamed.is_empty()
            || !self.dirty_attributes.is_empty()
            || !self.task_sets.is_empty()
    }

    /// Consume the context, yielding staged writes and the report
    pub fn finish(self) -> (PendingWrites, BatchReport) {
        (self.pending, self.report)
    }
}
