//! Error types for Qualia.
//!
//! One `thiserror` enum per error taxonomy, wrapping the journal crate's
//! own error type rather than re-stating its variants.

use crate::config::ConstrainedError;

pub type Result<T> = std::result::Result<T, QualiaError>;

#[derive(Debug, thiserror::Error)]
pub enum QualiaError {
    /// A short hash matched more than one object.
    #[error("hash {0:?} is ambiguous")]
    AmbiguousHash(String),

    /// No object matches the given hash or short hash.
    #[error("no object found for {0:?}")]
    FileDoesNotExist(String),

    /// `add_file` was asked to store a hash that is already present.
    #[error("file already exists: {0}")]
    FileExists(String),

    /// A query or update referenced a field that has never been declared.
    #[error("field does not exist: {0}")]
    FieldDoesNotExist(String),

    /// An update tried to write a field marked read-only.
    #[error("field is read-only: {0}")]
    FieldReadOnly(String),

    /// A value didn't match its field's declared type.
    #[error("invalid value for field {field}: {message}")]
    InvalidFieldValue { field: String, message: String },

    /// A field's type was declared differently than what the index already has on
    /// file -- field types are pinned for the life of the store.
    #[error("field {field} is already type {existing}, cannot redeclare as {requested}")]
    FieldConfigChanged { field: String, existing: String, requested: String },

    /// `undo`/`dump journal` referenced a checkpoint id that isn't in the journal.
    #[error("checkpoint does not exist: {0}")]
    CheckpointDoesNotExist(i64),

    /// Undo would need to re-synthesize bytes for a deleted blob.
    #[error("cannot undo: {0}")]
    UndoFailed(String),

    /// A write was attempted against a store opened without `--read-write`.
    #[error("database is read-only")]
    DatabaseReadOnly,

    /// A config value violated its declared shape.
    #[error(transparent)]
    Constrained(#[from] ConstrainedError),

    /// A malformed query string.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A config file failed to parse.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("journal error: {0}")]
    Journal(#[from] qualia_journal::error::JournalError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(String),
}
