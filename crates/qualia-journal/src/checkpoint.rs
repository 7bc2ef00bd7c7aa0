//! Core journal data structures: changes, checkpoints, and object keys.
//!
//! A [`Change`] is one row of the append-only journal. A [`Checkpoint`] groups a
//! contiguous run of changes (by `serial`) under a single id; undo operates on the
//! most recent checkpoint's change set, in reverse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the object a change applies to. Property-only objects are addressed by
/// their assigned integer id; blob objects are addressed by their content hash, which
/// also serves as their primary identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKey {
    Id(i64),
    Hash(String),
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKey::Id(id) => write!(f, "id:{id}"),
            ObjectKey::Hash(hash) => write!(f, "hash:{hash}"),
        }
    }
}

/// The mutation an object underwent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// An object was created (`previous` is empty).
    Add,
    /// A single typed field was written on a blob object (journal form used by the
    /// blob object model).
    Set,
    /// An object was removed (`previous` holds its full property map).
    Delete,
    /// An object's property map was patched (`previous` holds the pre-patch map).
    Update,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Set => "set",
            Action::Delete => "delete",
            Action::Update => "update",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Action::Add),
            "set" => Some(Action::Set),
            "delete" => Some(Action::Delete),
            "update" => Some(Action::Update),
            _ => None,
        }
    }
}

/// One row of the append-only journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub serial: i64,
    pub timestamp: DateTime<Utc>,
    pub object_key: ObjectKey,
    pub action: Action,
    /// Serialized prior state, used by undo. Empty JSON object/array for `add`.
    pub previous: serde_json::Value,
    /// Action-specific payload (e.g. `(field, value)` for `Set`).
    pub extra: serde_json::Value,
}

/// A named grouping of consecutive journal changes -- the unit of undo.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: i64,
    pub timestamp: DateTime<Utc>,
    /// The largest `serial` observed at the moment of checkpointing.
    pub serial_upper_bound: i64,
}
