//! # qualia-journal — append-only change journal with checkpoint/undo
//!
//! Every mutation made to a Qualia object store is recorded here before it takes
//! effect, so that an arbitrary user-delimited run of operations (a "checkpoint") can
//! later be inspected or reversed as a unit.
//!
//! ## Core types
//!
//! - [`Journal`] -- the append-only log itself: `append`, `commit`, `undo_plan` /
//!   `finalize_undo`, `transactions_of`.
//! - [`checkpoint::Change`] -- one journal row.
//! - [`checkpoint::Checkpoint`] -- a named grouping of changes, the unit of undo.
//! - [`checkpoint::ObjectKey`] -- the property-object id or blob hash a change applies to.
//!
//! ## Undo protocol
//!
//! Because the journal and the object store it describes can live in separate SQLite
//! connections (directory-mode Qualia databases keep them in separate files), undo is
//! two-phase rather than a single SQL transaction spanning both:
//!
//! 1. [`Journal::undo_plan`] validates that every change in the target checkpoint is
//!    invertible and returns the change rows, in reverse-serial order, for the caller
//!    to apply against its own storage.
//! 2. Once the caller has successfully applied every inverse, it calls
//!    [`Journal::finalize_undo`] to delete the consumed journal rows and the
//!    checkpoint row.
//!
//! If step 1's inverse application fails partway, the journal is untouched. Step 2 is
//! the only state-mutating call on the journal's own storage, so a crash between 1 and
//! 2 leaves the checkpoint intact for a retried undo (idempotent from the journal's
//! point of view, since the caller's mutations were themselves journaled operations
//! that a second `undo` attempt would simply redo).

pub mod checkpoint;
pub mod error;
pub mod serializer;

pub use checkpoint::{Action, Change, Checkpoint, ObjectKey};
pub use error::{JournalError, Result};
pub use serializer::{BincodeSerializer, JsonSerializer, Serializer};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Ordering for [`Journal::all_checkpoints`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// The upgrade scripts applied in order to bring a journal database to its current
/// schema. `PRAGMA user_version` records how many have been applied, so reopening an
/// up-to-date database is a no-op and partial failures don't reapply earlier scripts.
const UPGRADES: &[&str] = &[r#"
    CREATE TABLE changes (
        serial INTEGER PRIMARY KEY,
        timestamp TEXT NOT NULL,
        object_key TEXT NOT NULL,
        action TEXT NOT NULL,
        previous_blob BLOB NOT NULL,
        extra_blob BLOB NOT NULL
    );
    CREATE TABLE checkpoints (
        checkpoint_id INTEGER PRIMARY KEY,
        timestamp TEXT NOT NULL,
        serial INTEGER NOT NULL
    );
"#];

/// The append-only journal.
pub struct Journal {
    conn: Connection,
    serializer: JsonSerializer,
    has_changes: bool,
}

fn encode_object_key(key: &ObjectKey) -> String {
    key.to_string()
}

fn decode_object_key(s: &str) -> rusqlite::Result<ObjectKey> {
    if let Some(rest) = s.strip_prefix("id:") {
        rest.parse::<i64>()
            .map(ObjectKey::Id)
            .map_err(|_| rusqlite::Error::InvalidColumnType(0, "object_key".into(), rusqlite::types::Type::Text))
    } else if let Some(rest) = s.strip_prefix("hash:") {
        Ok(ObjectKey::Hash(rest.to_string()))
    } else {
        Err(rusqlite::Error::InvalidColumnType(0, "object_key".into(), rusqlite::types::Type::Text))
    }
}

impl Journal {
    /// Open (creating if needed) the journal database at `path`, applying any pending
    /// upgrade scripts and enabling WAL mode so readers never block the writer.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::upgrade_if_needed(&conn)?;

        Ok(Self {
            conn,
            serializer: JsonSerializer::new(),
            has_changes: false,
        })
    }

    /// Open an in-memory journal, used by tests and by ephemeral query-only sessions.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::upgrade_if_needed(&conn)?;

        Ok(Self {
            conn,
            serializer: JsonSerializer::new(),
            has_changes: false,
        })
    }

    fn upgrade_if_needed(conn: &Connection) -> Result<()> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let version = version as usize;

        for (i, script) in UPGRADES.iter().enumerate().skip(version) {
            conn.execute_batch(script)?;
            conn.pragma_update(None, "user_version", (i + 1) as i64)?;
        }

        Ok(())
    }

    /// Record one change. Marks the journal as having pending changes so the next
    /// [`Journal::commit`] produces a checkpoint.
    pub fn append(
        &mut self,
        object_key: ObjectKey,
        action: Action,
        previous: serde_json::Value,
        extra: serde_json::Value,
        time: Option<chrono::DateTime<Utc>>,
    ) -> Result<i64> {
        let timestamp = time.unwrap_or_else(Utc::now);

        self.conn.execute(
            "INSERT INTO changes(timestamp, object_key, action, previous_blob, extra_blob)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                timestamp.to_rfc3339(),
                encode_object_key(&object_key),
                action.as_str(),
                self.serializer.dumps(&previous)?,
                self.serializer.dumps(&extra)?,
            ],
        )?;

        self.has_changes = true;
        Ok(self.conn.last_insert_rowid())
    }

    /// Promote pending changes to a new checkpoint. Returns `None` (and does nothing)
    /// if there are no pending changes -- a checkpoint is never created for free.
    pub fn commit(&mut self) -> Result<Option<i64>> {
        if !self.has_changes {
            return Ok(None);
        }

        let timestamp = Utc::now();
        self.conn.execute(
            "INSERT INTO checkpoints(timestamp, serial)
             SELECT ?1, MAX(serial) FROM changes",
            params![timestamp.to_rfc3339()],
        )?;

        self.has_changes = false;
        Ok(Some(self.conn.last_insert_rowid()))
    }

    fn row_to_checkpoint(row: &rusqlite::Row) -> rusqlite::Result<Checkpoint> {
        let timestamp: String = row.get("timestamp")?;
        Ok(Checkpoint {
            checkpoint_id: row.get("checkpoint_id")?,
            timestamp: timestamp
                .parse()
                .map_err(|_| rusqlite::Error::InvalidColumnType(0, "timestamp".into(), rusqlite::types::Type::Text))?,
            serial_upper_bound: row.get("serial")?,
        })
    }

    pub fn last_checkpoint(&self) -> Result<Option<Checkpoint>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM checkpoints ORDER BY checkpoint_id DESC LIMIT 1",
                [],
                Self::row_to_checkpoint,
            )
            .optional()?)
    }

    pub fn checkpoint(&self, checkpoint_id: i64) -> Result<Option<Checkpoint>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM checkpoints WHERE checkpoint_id = ?1",
                params![checkpoint_id],
                Self::row_to_checkpoint,
            )
            .optional()?)
    }

    pub fn all_checkpoints(&self, order: Order) -> Result<Vec<Checkpoint>> {
        let order_sql = match order {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        };
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM checkpoints ORDER BY checkpoint_id {order_sql}"))?;
        let rows = stmt.query_map([], Self::row_to_checkpoint)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn row_to_change(&self, row: &rusqlite::Row) -> rusqlite::Result<Change> {
        let timestamp: String = row.get("timestamp")?;
        let object_key: String = row.get("object_key")?;
        let action: String = row.get("action")?;
        let previous_blob: Vec<u8> = row.get("previous_blob")?;
        let extra_blob: Vec<u8> = row.get("extra_blob")?;

        Ok(Change {
            serial: row.get("serial")?,
            timestamp: timestamp
                .parse()
                .map_err(|_| rusqlite::Error::InvalidColumnType(0, "timestamp".into(), rusqlite::types::Type::Text))?,
            object_key: decode_object_key(&object_key)?,
            action: Action::from_str(&action)
                .ok_or_else(|| rusqlite::Error::InvalidColumnType(0, "action".into(), rusqlite::types::Type::Text))?,
            previous: self
                .serializer
                .loads(&previous_blob)
                .map_err(|_| rusqlite::Error::InvalidColumnType(0, "previous_blob".into(), rusqlite::types::Type::Blob))?,
            extra: self
                .serializer
                .loads(&extra_blob)
                .map_err(|_| rusqlite::Error::InvalidColumnType(0, "extra_blob".into(), rusqlite::types::Type::Blob))?,
        })
    }

    /// The changes belonging to `checkpoint_id`: serials in `(previous.serial_upper_bound,
    /// this.serial_upper_bound]`, ascending.
    pub fn transactions_of(&self, checkpoint_id: i64) -> Result<Vec<Change>> {
        let (start, end) = self.checkpoint_bounds(checkpoint_id)?;

        let mut stmt = self.conn.prepare(
            "SELECT * FROM changes WHERE serial > ?1 AND serial <= ?2 ORDER BY serial ASC",
        )?;
        let rows = stmt.query_map(params![start, end], |row| self.row_to_change(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn checkpoint_bounds(&self, checkpoint_id: i64) -> Result<(i64, i64)> {
        let end = self
            .checkpoint(checkpoint_id)?
            .ok_or(JournalError::CheckpointDoesNotExist(checkpoint_id))?
            .serial_upper_bound;

        let start = self
            .conn
            .query_row(
                "SELECT serial FROM checkpoints WHERE checkpoint_id < ?1 ORDER BY checkpoint_id DESC LIMIT 1",
                params![checkpoint_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .unwrap_or(0);

        Ok((start, end))
    }

    /// Validate and plan an undo of `checkpoint_id` (or the most recent checkpoint if
    /// `None`). Returns the resolved checkpoint id and its changes in reverse-serial
    /// order. Performs no mutation; pair with [`Journal::finalize_undo`] once the
    /// caller has applied every inverse.
    ///
    /// A checkpoint containing a `delete` of a blob object (an [`ObjectKey::Hash`]) is
    /// not invertible, since the blob's bytes were already unlinked from disk at
    /// delete time -- this fails with [`JournalError::UndoFailed`] and leaves the
    /// journal untouched.
    pub fn undo_plan(&self, checkpoint_id: Option<i64>) -> Result<Option<(i64, Vec<Change>)>> {
        let checkpoint_id = match checkpoint_id {
            Some(id) => id,
            None => match self.last_checkpoint()? {
                Some(cp) => cp.checkpoint_id,
                None => return Ok(None),
            },
        };

        let mut changes = self.transactions_of(checkpoint_id)?;
        changes.reverse();

        for change in &changes {
            if change.action == Action::Delete && matches!(change.object_key, ObjectKey::Hash(_)) {
                return Err(JournalError::UndoFailed(format!(
                    "checkpoint {checkpoint_id} deletes blob {} -- blob deletes cannot be undone",
                    change.object_key
                )));
            }
        }

        Ok(Some((checkpoint_id, changes)))
    }

    /// Delete the journal rows and checkpoint row consumed by a successfully-applied
    /// undo. Must only be called after every inverse from [`Journal::undo_plan`] has
    /// been applied to the object store.
    pub fn finalize_undo(&mut self, checkpoint_id: i64) -> Result<()> {
        let (start, end) = self.checkpoint_bounds(checkpoint_id)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM changes WHERE serial > ?1 AND serial <= ?2",
            params![start, end],
        )?;
        tx.execute(
            "DELETE FROM checkpoints WHERE checkpoint_id = ?1",
            params![checkpoint_id],
        )?;
        tx.commit()?;

        Ok(())
    }

    /// Convenience for callers with nothing of their own to journal on undo (e.g.
    /// tests): plans and immediately finalizes. A no-op, returning `None`, when there
    /// is no checkpoint to undo.
    pub fn undo(&mut self, checkpoint_id: Option<i64>) -> Result<Option<Vec<Change>>> {
        match self.undo_plan(checkpoint_id)? {
            None => Ok(None),
            Some((id, changes)) => {
                self.finalize_undo(id)?;
                Ok(Some(changes))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open() -> Journal {
        Journal::open_in_memory().unwrap()
    }

    #[test]
    fn commit_is_noop_without_changes() {
        let mut j = open();
        assert_eq!(j.commit().unwrap(), None);
    }

    #[test]
    fn append_then_commit_creates_checkpoint() {
        let mut j = open();
        j.append(ObjectKey::Id(1), Action::Add, json!({}), json!(null), None).unwrap();
        let cp = j.commit().unwrap().unwrap();
        assert_eq!(j.last_checkpoint().unwrap().unwrap().checkpoint_id, cp);
    }

    #[test]
    fn undo_on_empty_journal_is_noop() {
        let mut j = open();
        assert_eq!(j.undo(None).unwrap(), None);
    }

    #[test]
    fn undo_round_trips_add() {
        let mut j = open();
        j.append(ObjectKey::Id(1), Action::Add, json!({}), json!(null), None).unwrap();
        j.commit().unwrap();

        let changes = j.undo(None).unwrap().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, Action::Add);

        assert_eq!(j.last_checkpoint().unwrap(), None);
        assert!(j.undo(None).unwrap().is_none());
    }

    #[test]
    fn undo_rejects_blob_delete() {
        let mut j = open();
        j.append(
            ObjectKey::Hash("deadbeef".into()),
            Action::Delete,
            json!({"hash": "deadbeef"}),
            json!(null),
            None,
        )
        .unwrap();
        j.commit().unwrap();

        let err = j.undo(None).unwrap_err();
        assert!(matches!(err, JournalError::UndoFailed(_)));
        // Failed undo leaves the checkpoint intact.
        assert!(j.last_checkpoint().unwrap().is_some());
    }

    #[test]
    fn transactions_of_are_scoped_to_one_checkpoint() {
        let mut j = open();
        j.append(ObjectKey::Id(1), Action::Add, json!({}), json!(null), None).unwrap();
        let cp1 = j.commit().unwrap().unwrap();
        j.append(ObjectKey::Id(2), Action::Add, json!({}), json!(null), None).unwrap();
        let cp2 = j.commit().unwrap().unwrap();

        assert_eq!(j.transactions_of(cp1).unwrap().len(), 1);
        assert_eq!(j.transactions_of(cp2).unwrap().len(), 1);
    }

    #[test]
    fn reopening_an_up_to_date_journal_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        {
            let mut j = Journal::open(&path).unwrap();
            j.append(ObjectKey::Id(1), Action::Add, json!({}), json!(null), None).unwrap();
            j.commit().unwrap();
        }

        let j2 = Journal::open(&path).unwrap();
        assert_eq!(j2.all_checkpoints(Order::Ascending).unwrap().len(), 1);
    }
}
