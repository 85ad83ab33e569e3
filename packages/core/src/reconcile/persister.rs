//! Batch persistence
//!
//! Folds every staged write of a batch into one op per document and issues a
//! single bulk call. Later updates merge into earlier ones key by key; an
//! update to an entity created in the same batch is folded into its insert.
//! Nothing is written when the plan is empty.

use crate::db::{BulkWriteResult, EntityStore, WriteOp};
use crate::models::EntityUpdate;
use crate::reconcile::PendingWrites;
use crate::services::SyncError;
use std::collections::HashMap;

pub struct BatchPersister<'a> {
    store: &'a dyn EntityStore,
}

impl<'a> BatchPersister<'a> {
    pub fn new(store: &'a dyn EntityStore) -> Self {
        Self { store }
    }

    /// Deduplicate staged writes by entity id, preserving first-seen order
    pub fn plan(pending: PendingWrites) -> Vec<WriteOp> {
        let mut inserts = pending.inserts;
        let insert_slots: HashMap<String, usize> = inserts
            .iter()
            .enumerate()
            .map(|(slot, entity)| (entity.id.clone(), slot))
            .collect();

        let mut order: Vec<String> = Vec::new();
        let mut updates: HashMap<String, EntityUpdate> = HashMap::new();
        for (id, update) in pending.updates {
            if let Some(&slot) = insert_slots.get(&id) {
                update.apply_to(&mut inserts[slot]);
                continue;
            }
            match updates.get_mut(&id) {
                Some(existing) => existing.merge(update),
                None => {
                    order.push(id.clone());
                    updates.insert(id, update);
                }
            }
        }

        let mut ops: Vec<WriteOp> = inserts.into_iter().map(WriteOp::Insert).collect();
        for id in order {
            if let Some(update) = updates.remove(&id) {
                if !update.is_empty() {
                    ops.push(WriteOp::Update { id, update });
                }
            }
        }
        ops
    }

    pub async fn flush(&self, pending: PendingWrites) -> Result<BulkWriteResult, SyncError> {
        let ops = Self::plan(pending);
        if ops.is_empty() {
            tracing::debug!("Nothing to persist for this batch");
            return Ok(BulkWriteResult::default());
        }

        let operations = ops.len();
        let result = self
            .store
            .bulk_write(ops)
            .await
            .map_err(|cause| {
                tracing::error!("Bulk write of {} operation(s) failed: {}", operations, cause);
                SyncError::PersistFailed { operations, cause }
            })?;

        tracing::info!(
            "Persisted batch: {} inserted, {} modified",
            result.inserted,
            result.modified
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::Entity;
    use serde_json::json;

    fn tree() -> (Entity, Entity) {
        let project = Entity::new_project("Demo", "ft-p").with_id("p");
        let seq = Entity::new_child("Seq01", "Sequence", &project, "ft-seq").with_id("seq");
        (project, seq)
    }

    #[test]
    fn test_plan_merges_updates_per_entity() {
        let (project, seq) = tree();
        let shot = Entity::new_child("sh010", "Shot", &seq, "ft-sh").with_id("sh");

        let pending = PendingWrites {
            inserts: vec![shot],
            updates: vec![
                ("seq".to_string(), EntityUpdate::new().with_name("Seq02")),
                (project.id.clone(), EntityUpdate::new().with_attribute("fps", json!(25))),
                ("sh".to_string(), EntityUpdate::new().with_attribute("fps", json!(25))),
                ("seq".to_string(), EntityUpdate::new().with_attribute("fps", json!(25))),
            ],
        };

        let ops = BatchPersister::plan(pending);
        assert_eq!(ops.len(), 3);
        match &ops[0] {
            WriteOp::Insert(entity) => assert_eq!(entity.attributes.get("fps"), Some(&json!(25))),
            other => panic!("expected insert, got {:?}", other),
        }
        match &ops[1] {
            WriteOp::Update { id, update } => {
                assert_eq!(id, "seq");
                assert_eq!(update.name.as_deref(), Some("Seq02"));
                assert_eq!(update.attributes.get("fps"), Some(&json!(25)));
            }
            other => panic!("expected update, got {:?}", other),
        }
        assert_eq!(ops[2].entity_id(), "p");
    }

    #[tokio::test]
    async fn test_flush_skips_empty_plan() {
        let store = MemoryStore::new();
        let result = BatchPersister::new(&store)
            .flush(PendingWrites::default())
            .await
            .unwrap();
        assert_eq!(result, BulkWriteResult::default());
        assert_eq!(store.bulk_write_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_failure_is_fatal() {
        let (project, seq) = tree();
        let store = MemoryStore::with_entities(vec![project]);
        store.set_fail_writes(true);

        let err = BatchPersister::new(&store)
            .flush(PendingWrites {
                inserts: vec![seq],
                updates: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PersistFailed { operations: 1, .. }));
    }
}
