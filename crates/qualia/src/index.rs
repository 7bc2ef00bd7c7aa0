//! Property store and search index.
//!
//! Both components share one table: every object -- blob-backed or not -- gets an
//! `object_id`, and blob objects additionally carry their content hash as a unique
//! column. "Search" isn't a separate inverted-index structure; a query compiles to a
//! `WHERE` clause filtered straight against the `properties` JSON column, exactly the
//! way `_StoreSubset` builds its SQL in `store.py`. This also collapses the
//! `object_id` vs. `hash` addressing split into one table: `hash` is just one more
//! (read-only) property, not a second identity scheme.

use crate::error::{QualiaError, Result};
use crate::query::CompiledQuery;
use crate::schema::FieldSchema;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;

const UPGRADE: &str = "
    CREATE TABLE IF NOT EXISTS objects (
        object_id INTEGER PRIMARY KEY AUTOINCREMENT,
        hash TEXT UNIQUE,
        properties TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS objects_hash_idx ON objects(hash);
";

/// One row of the store: a stable id, an optional content hash, and its property map.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub object_id: i64,
    pub hash: Option<String>,
    pub properties: Value,
}

fn row_to_object(row: &Row) -> rusqlite::Result<Object> {
    let raw: String = row.get(2)?;
    Ok(Object {
        object_id: row.get(0)?,
        hash: row.get(1)?,
        properties: serde_json::from_str(&raw).unwrap_or(Value::Object(Default::default())),
    })
}

pub struct Index {
    conn: Connection,
}

impl Index {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        register_regexp(&conn)?;
        upgrade_if_needed(&conn)?;
        Ok(Self { conn })
    }

    pub fn insert(&self, hash: Option<&str>, properties: &Value) -> Result<i64> {
        if let Some(hash) = hash {
            if self.get_by_hash(hash)?.is_some() {
                return Err(QualiaError::FileExists(hash.to_string()));
            }
        }
        self.conn.execute(
            "INSERT INTO objects (hash, properties) VALUES (?1, ?2)",
            rusqlite::params![hash, serde_json::to_string(properties)?],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Re-insert an object at a specific `object_id`, used by undo to restore a
    /// deleted row. Fails if that id is already occupied.
    pub fn insert_with_id(&self, object_id: i64, hash: Option<&str>, properties: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO objects (object_id, hash, properties) VALUES (?1, ?2, ?3)",
            rusqlite::params![object_id, hash, serde_json::to_string(properties)?],
        )?;
        Ok(())
    }

    pub fn get(&self, object_id: i64) -> Result<Option<Object>> {
        Ok(self
            .conn
            .query_row("SELECT object_id, hash, properties FROM objects WHERE object_id = ?1", [object_id], row_to_object)
            .optional()?)
    }

    pub fn get_by_hash(&self, hash: &str) -> Result<Option<Object>> {
        Ok(self
            .conn
            .query_row("SELECT object_id, hash, properties FROM objects WHERE hash = ?1", [hash], row_to_object)
            .optional()?)
    }

    /// Resolve a (possibly abbreviated) hash prefix to the one object it names.
    pub fn resolve_hash_prefix(&self, prefix: &str) -> Result<Object> {
        let mut stmt = self.conn.prepare("SELECT object_id, hash, properties FROM objects WHERE hash LIKE ?1 || '%' LIMIT 2")?;
        let mut rows = stmt.query_map([prefix], row_to_object)?;
        let first = rows.next().transpose()?.ok_or_else(|| QualiaError::FileDoesNotExist(prefix.to_string()))?;
        if rows.next().transpose()?.is_some() {
            return Err(QualiaError::AmbiguousHash(prefix.to_string()));
        }
        Ok(first)
    }

    pub fn delete(&self, object_id: i64) -> Result<()> {
        self.conn.execute("DELETE FROM objects WHERE object_id = ?1", [object_id])?;
        Ok(())
    }

    pub fn update_properties(&self, object_id: i64, properties: &Value) -> Result<()> {
        self.conn.execute(
            "UPDATE objects SET properties = ?1 WHERE object_id = ?2",
            rusqlite::params![serde_json::to_string(properties)?, object_id],
        )?;
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<Object>> {
        let mut stmt = self.conn.prepare("SELECT object_id, hash, properties FROM objects ORDER BY object_id")?;
        let rows = stmt.query_map([], row_to_object)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn len(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM objects", [], |r| r.get(0))?)
    }

    /// Run a compiled query's filter against the property store.
    pub fn select(&self, compiled: &CompiledQuery) -> Result<Vec<Object>> {
        let sql = format!("SELECT object_id, hash, properties FROM objects WHERE {} ORDER BY object_id", compiled.sql);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(compiled.params.iter()), row_to_object)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn find_hashes(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT hash FROM objects WHERE hash LIKE ?1 || '%' ORDER BY hash")?;
        let rows = stmt.query_map([prefix], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The shortest prefix of `hash` (starting at 4 hex chars, widening by 2) that
    /// resolves back to exactly one stored hash.
    pub fn shortest_unambiguous_prefix(&self, hash: &str) -> Result<String> {
        let mut len = 4.min(hash.len());
        loop {
            let prefix = &hash[..len];
            if self.find_hashes(prefix)?.len() <= 1 || len >= hash.len() {
                return Ok(prefix.to_string());
            }
            len = (len + 2).min(hash.len());
        }
    }

    /// Every distinct field name seen across stored properties, for `qualia field list`.
    pub fn observed_fields(&self) -> Result<Vec<String>> {
        let objects = self.all()?;
        let mut fields = std::collections::BTreeSet::new();
        for object in objects {
            if let Value::Object(map) = &object.properties {
                fields.extend(map.keys().cloned());
            }
        }
        Ok(fields.into_iter().collect())
    }
}

fn register_regexp(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern = ctx.get::<String>(0)?;
            let text = ctx.get::<String>(1)?;
            let re = regex::Regex::new(&pattern).map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(re.is_match(&text))
        },
    )?;
    Ok(())
}

/// Uses `CREATE TABLE/INDEX IF NOT EXISTS` rather than `PRAGMA user_version` tracking:
/// in single-file mode this connection shares its backing file with the journal's own
/// connection, which keeps its own `user_version` counter for its own tables. Two
/// independent migration systems can't share that one pragma.
fn upgrade_if_needed(conn: &Connection) -> Result<()> {
    conn.execute_batch(UPGRADE)?;
    Ok(())
}

/// Validates a store-wide property write against the declared schema, so a caller
/// building a new property map can fail fast before it reaches the index. A `null`
/// value is always accepted without a type check: in a merge patch it means "remove
/// this field", not a value to validate.
pub fn validate_properties(schema: &mut FieldSchema, properties: &Value) -> Result<()> {
    let Value::Object(map) = properties else {
        return Ok(());
    };
    for (name, value) in map {
        let descriptor = schema.require_or_infer(name, value)?;
        if !value.is_null() && !descriptor.field_type.validate(value) {
            return Err(QualiaError::InvalidFieldValue {
                field: name.clone(),
                message: format!("not a valid {}", descriptor.field_type.as_str()),
            });
        }
    }
    Ok(())
}
