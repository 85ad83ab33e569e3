//! Database Layer
//!
//! This module defines the project database collaborator consumed by the
//! reconciliation engine:
//!
//! - `EntityStore` - Async trait over document lookup and bulk writes
//! - `MemoryStore` - In-process backend used by embedders and tests
//!
//! Connection management, authentication and reconnect-and-retry belong to
//! concrete backends; the engine only sees this narrow surface.

mod entity_store;
mod error;
mod memory_store;

pub use entity_store::{BulkWriteResult, EntityStore, WriteOp};
pub use error::DatabaseError;
pub use memory_store::MemoryStore;
