//! Error types for journal operations

use thiserror::Error;

/// Result type for journal operations
pub type Result<T> = std::result::Result<T, JournalError>;

/// Errors that can occur while appending to, committing, or replaying the journal
#[derive(Error, Debug)]
pub enum JournalError {
    /// No checkpoint exists with the given id
    #[error("checkpoint does not exist: {0}")]
    CheckpointDoesNotExist(i64),

    /// A checkpoint's change set contains an action that cannot be inverted
    #[error("undo failed: {0}")]
    UndoFailed(String),

    /// JSON (de)serialization of a change's `previous`/`extra` payload failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary (de)serialization failed
    #[error("binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// The underlying SQLite journal failed
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// I/O failure opening or upgrading the journal file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
