//! Changeability (lock) resolution
//!
//! An entity is locked when it, or any of its descendants, owns downstream
//! published work: renaming, moving or deleting it would orphan that work.
//! The locked set is seeded from the store's published entities and then
//! walked upward to the root. Computed once per batch from the pre-batch
//! parent links and never refreshed mid-batch.

use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct ChangeabilityResolver {
    locked: HashSet<String>,
}

impl ChangeabilityResolver {
    /// Build the locked set from parent links and the published seed ids
    pub fn resolve(
        parents: &HashMap<String, Option<String>>,
        published: &HashSet<String>,
    ) -> Self {
        let mut locked = HashSet::new();
        let mut queue: VecDeque<String> = published.iter().cloned().collect();

        while let Some(id) = queue.pop_front() {
            if !locked.insert(id.clone()) {
                continue;
            }
            if let Some(Some(parent_id)) = parents.get(&id) {
                if !locked.contains(parent_id) {
                    queue.push_back(parent_id.clone());
                }
            }
        }

        tracing::debug!(
            "Changeability resolved: {} locked of {} entities",
            locked.len(),
            parents.len()
        );
        Self { locked }
    }

    pub fn is_changeable(&self, entity_id: &str) -> bool {
        !self.locked.contains(entity_id)
    }

    pub fn locked_count(&self) -> usize {
        self.locked.len()
    }
}
