//! EntityStore Trait - Project Database Abstraction
//!
//! This module defines the `EntityStore` trait the reconciliation engine uses
//! to read the project database and persist a batch's staged writes.
//!
//! # Design Decisions
//!
//! 1. **Async-First**: All methods are async so both embedded and network
//!    backends fit behind the trait
//! 2. **Ownership Semantics**: Write operations take ownership of their
//!    payloads; callers clone if they need to retain them
//! 3. **Error Handling**: Uses `anyhow::Result` so backends can attach their
//!    own transport context
//! 4. **One write per batch**: `bulk_write` is the only mutating method; the
//!    engine never writes document by document
//!
//! # Examples
//!
//! ```rust,no_run
//! use treesync_core::db::{EntityStore, MemoryStore, WriteOp};
//! use treesync_core::models::{Entity, EntityQuery};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = MemoryStore::new();
//!     let project = Entity::new_project("Demo", "ft-project");
//!     store.bulk_write(vec![WriteOp::Insert(project)]).await?;
//!
//!     let live = store.find(EntityQuery::all().archived(false)).await?;
//!     assert_eq!(live.len(), 1);
//!     Ok(())
//! }
//! ```

use crate::models::{Entity, EntityQuery, EntityUpdate};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One document write within a bulk call
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a new document
    Insert(Entity),
    /// Merge `update` into the existing document `id`
    Update { id: String, update: EntityUpdate },
}

impl WriteOp {
    /// Id of the document this op targets
    pub fn entity_id(&self) -> &str {
        match self {
            WriteOp::Insert(entity) => &entity.id,
            WriteOp::Update { id, .. } => id,
        }
    }
}

/// Outcome of a bulk write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteResult {
    pub inserted: usize,
    pub modified: usize,
}

/// Abstraction over the project database
///
/// A store instance is scoped to a single project.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` so the engine can hold them behind
/// `Arc<dyn EntityStore>` across await points.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Return every document matching `query`, live and archived alike
    /// unless the query says otherwise.
    async fn find(&self, query: EntityQuery) -> Result<Vec<Entity>>;

    /// Get a document by id
    ///
    /// - `Ok(Some(entity))` if it exists (archived or not)
    /// - `Ok(None)` if it doesn't exist (not an error)
    async fn get(&self, id: &str) -> Result<Option<Entity>>;

    /// Apply all ops as a single bulk call.
    ///
    /// Each op targets a distinct document. A failure is fatal for the
    /// caller's batch; no partial-success accounting is attempted.
    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<BulkWriteResult>;

    /// Ids of entities that own at least one downstream published artifact.
    ///
    /// These seed the locked set of the changeability resolver.
    async fn published_entity_ids(&self) -> Result<HashSet<String>>;
}
