//! Data Models
//!
//! This module contains the core data structures used throughout TreeSync:
//!
//! - `Entity` - A project database hierarchy node, plus its update/query types
//! - `Notification` - A raw change event from the tracking tree
//!
//! Tasks are not modeled as entities; they live as a name set on their parent.

mod entity;
mod notification;

pub use entity::{Entity, EntityKind, EntityQuery, EntityUpdate, ValidationError};
pub use notification::{
    ChangeAction, FieldChange, Notification, ParentLink, NAME_KEY, PARENT_KEY,
};
