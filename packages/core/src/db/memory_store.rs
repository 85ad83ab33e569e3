//! In-memory `EntityStore` backend
//!
//! Keeps every document in a `BTreeMap` behind a `tokio::sync::RwLock`.
//! Used by embedders that keep the project database in process and by the
//! engine's tests, which rely on `bulk_write_count` to assert idempotence.

use crate::db::{BulkWriteResult, DatabaseError, EntityStore, WriteOp};
use crate::models::{Entity, EntityQuery};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<BTreeMap<String, Entity>>,
    published: RwLock<HashSet<String>>,
    bulk_writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `entities`
    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let documents = entities
            .into_iter()
            .map(|entity| (entity.id.clone(), entity))
            .collect();
        Self {
            documents: RwLock::new(documents),
            ..Self::default()
        }
    }

    /// Record that `entity_id` owns published downstream work
    pub async fn mark_published(&self, entity_id: impl Into<String>) {
        self.published.write().await.insert(entity_id.into());
    }

    /// Snapshot of every stored document
    pub async fn all(&self) -> Vec<Entity> {
        self.documents.read().await.values().cloned().collect()
    }

    /// Number of successful `bulk_write` calls so far
    pub fn bulk_write_count(&self) -> usize {
        self.bulk_writes.load(Ordering::Acquire)
    }

    /// Make subsequent `bulk_write` calls fail (transport failure simulation)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find(&self, query: EntityQuery) -> Result<Vec<Entity>> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|entity| query.matches(entity))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<BulkWriteResult> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(DatabaseError::write_rejected("store is configured to fail writes").into());
        }

        let mut documents = self.documents.write().await;

        // Validate the whole call first so a rejected call leaves no partial state
        let mut seen = HashSet::new();
        for op in &ops {
            let id = op.entity_id();
            if !seen.insert(id.to_string()) {
                return Err(DatabaseError::write_rejected(format!(
                    "document '{}' targeted more than once",
                    id
                ))
                .into());
            }
            match op {
                WriteOp::Insert(entity) if documents.contains_key(&entity.id) => {
                    return Err(DatabaseError::duplicate_id(&entity.id).into());
                }
                WriteOp::Update { id, .. } if !documents.contains_key(id) => {
                    return Err(DatabaseError::entity_not_found(id).into());
                }
                _ => {}
            }
        }

        let mut result = BulkWriteResult::default();
        for op in ops {
            match op {
                WriteOp::Insert(entity) => {
                    documents.insert(entity.id.clone(), entity);
                    result.inserted += 1;
                }
                WriteOp::Update { id, update } => {
                    if let Some(entity) = documents.get_mut(&id) {
                        update.apply_to(entity);
                        result.modified += 1;
                    }
                }
            }
        }

        self.bulk_writes.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            "Bulk write applied: {} inserted, {} modified",
            result.inserted,
            result.modified
        );
        Ok(result)
    }

    async fn published_entity_ids(&self) -> Result<HashSet<String>> {
        Ok(self.published.read().await.clone())
    }
}
