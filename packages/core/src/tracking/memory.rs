//! In-memory `TrackingTree`
//!
//! Holds committed entities in a map and stages creates and field writes
//! until `commit`. Commit failures can be injected to exercise the engine's
//! write-back error handling.

use crate::models::{EntityKind, NAME_KEY, PARENT_KEY};
use crate::tracking::{TrackedEntity, TrackingError, TrackingTree};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum StagedOp {
    Create(TrackedEntity),
    Write { id: String, key: String, value: Value },
}

/// A committed field write, recorded for inspection
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub id: String,
    pub key: String,
    pub value: Value,
}

#[derive(Default)]
pub struct MemoryTrackingTree {
    entities: RwLock<BTreeMap<String, TrackedEntity>>,
    staged: RwLock<Vec<StagedOp>>,
    history: RwLock<Vec<FieldWrite>>,
    fail_commits: AtomicBool,
}

impl MemoryTrackingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = TrackedEntity>) -> Self {
        let entities = entities
            .into_iter()
            .map(|entity| (entity.id.clone(), entity))
            .collect();
        Self {
            entities: RwLock::new(entities),
            ..Self::default()
        }
    }

    /// Insert or replace a committed entity
    pub async fn insert(&self, entity: TrackedEntity) {
        self.entities.write().await.insert(entity.id.clone(), entity);
    }

    /// Delete a committed entity (simulates a user removal)
    pub async fn remove(&self, id: &str) -> Option<TrackedEntity> {
        self.entities.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<TrackedEntity> {
        self.entities.read().await.get(id).cloned()
    }

    /// Committed field writes in commit order
    pub async fn committed_writes(&self) -> Vec<FieldWrite> {
        self.history.read().await.clone()
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::Release);
    }

    async fn is_known(&self, id: &str) -> bool {
        if self.entities.read().await.contains_key(id) {
            return true;
        }
        self.staged
            .read()
            .await
            .iter()
            .any(|op| matches!(op, StagedOp::Create(entity) if entity.id == id))
    }
}

#[async_trait]
impl TrackingTree for MemoryTrackingTree {
    async fn query_entities(&self, ids: &[String]) -> Result<Vec<TrackedEntity>> {
        let entities = self.entities.read().await;
        Ok(ids.iter().filter_map(|id| entities.get(id).cloned()).collect())
    }

    async fn query_by_name(&self, name: &str) -> Result<Vec<TrackedEntity>> {
        let entities = self.entities.read().await;
        Ok(entities
            .values()
            .filter(|entity| entity.name == name && entity.kind != EntityKind::Project)
            .cloned()
            .collect())
    }

    async fn query_children(&self, parent_ids: &[String]) -> Result<Vec<TrackedEntity>> {
        let entities = self.entities.read().await;
        Ok(entities
            .values()
            .filter(|entity| {
                entity
                    .parent_id
                    .as_ref()
                    .is_some_and(|parent| parent_ids.contains(parent))
            })
            .cloned()
            .collect())
    }

    async fn create_entity(
        &self,
        parent_id: &str,
        name: &str,
        kind: EntityKind,
        entity_type: &str,
    ) -> Result<String> {
        if !self.is_known(parent_id).await {
            return Err(TrackingError::entity_not_found(parent_id).into());
        }
        let id = Uuid::new_v4().to_string();
        let entity = TrackedEntity::new(id.clone(), name, kind, entity_type, Some(parent_id));
        self.staged.write().await.push(StagedOp::Create(entity));
        Ok(id)
    }

    async fn write_field(&self, id: &str, key: &str, value: Value) -> Result<()> {
        if !self.is_known(id).await {
            return Err(TrackingError::entity_not_found(id).into());
        }
        self.staged.write().await.push(StagedOp::Write {
            id: id.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if self.fail_commits.load(Ordering::Acquire) {
            return Err(TrackingError::commit_failed("tracking tree rejected the commit").into());
        }

        let staged: Vec<StagedOp> = self.staged.write().await.drain(..).collect();
        let mut entities = self.entities.write().await;
        let mut history = self.history.write().await;

        for op in staged {
            match op {
                StagedOp::Create(entity) => {
                    entities.insert(entity.id.clone(), entity);
                }
                StagedOp::Write { id, key, value } => {
                    let entity = entities
                        .get_mut(&id)
                        .ok_or_else(|| TrackingError::entity_not_found(&id))?;
                    match key.as_str() {
                        NAME_KEY => {
                            if let Some(name) = value.as_str() {
                                entity.name = name.to_string();
                            }
                        }
                        PARENT_KEY => {
                            entity.parent_id = value.as_str().map(str::to_string);
                        }
                        _ => {
                            entity.attributes.insert(key.clone(), value.clone());
                        }
                    }
                    history.push(FieldWrite { id, key, value });
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.staged.write().await.clear();
        Ok(())
    }
}
