//! `Database`: the single entry point, coordinating the blob store, journal, and
//! property/search index. The CLI (`bin/qualia.rs`) is a thin wrapper over it.

use crate::archive::{self, ImportSummary};
use crate::auto_import;
use crate::blob::BlobStore;
use crate::error::{QualiaError, Result};
use crate::index::{validate_properties, Index, Object};
use crate::query;
use crate::schema::{FieldDescriptor, FieldSchema};
use crate::store_backend::{self, StoreBackend};
use chrono::Utc;
use qualia_journal::checkpoint::{Action, Change, ObjectKey};
use qualia_journal::Journal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A way to name an object in CLI-facing calls: either its full/short hash or its
/// bare integer id (property-only objects have no hash).
#[derive(Debug, Clone)]
pub enum ObjectRef {
    Hash(String),
    Id(i64),
}

impl ObjectRef {
    pub fn hash(s: impl Into<String>) -> Self {
        ObjectRef::Hash(s.into())
    }
}

fn object_key_of(object: &Object) -> ObjectKey {
    match &object.hash {
        Some(hash) => ObjectKey::Hash(hash.clone()),
        None => ObjectKey::Id(object.object_id),
    }
}

pub struct Database {
    schema: FieldSchema,
    index: Index,
    journal: Journal,
    blobs: Option<BlobStore>,
    state_path: Option<PathBuf>,
    read_only: bool,
}

impl Database {
    /// Open the store at `path`. A field-type mismatch between a prior open's
    /// persisted schema and this process's declarations is fatal when `read_only`
    /// is false (`QualiaError::FieldConfigChanged`), but tolerated -- logged as a
    /// warning rather than raised -- when the caller already asked to open
    /// read-only, per spec's "index schema drift that would otherwise be fatal is
    /// tolerated" read-only-mode carve-out.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let backend = store_backend::detect_backend(path);
        let opened = backend.open()?;
        let mut schema = FieldSchema::new();
        if let Some(state_path) = &opened.state_path {
            let drifted = schema.load_persisted_tolerant(state_path)?;
            if let Some(first) = drifted.first() {
                if !read_only {
                    return Err(drifted.into_iter().next().unwrap());
                }
                tracing::warn!(error = %first, "field schema drift detected at open; database opened read-only");
            }
        }
        Ok(Self {
            schema,
            index: opened.index,
            journal: opened.journal,
            blobs: opened.blobs,
            state_path: opened.state_path,
            read_only,
        })
    }

    /// Persist any newly-inferred fields so they're pinned across the next open.
    /// Single-file stores have no `state` file, so this is a no-op there.
    fn persist_schema(&self) -> Result<()> {
        match &self.state_path {
            Some(state_path) => self.schema.persist_custom_fields(state_path),
            None => Ok(()),
        }
    }

    /// The shortest hex prefix of `hash` that still resolves back to exactly that
    /// object.
    pub fn shortest_hash(&self, hash: &str) -> Result<String> {
        Ok(self.index.shortest_unambiguous_prefix(hash)?)
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            Err(QualiaError::DatabaseReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.schema.iter()
    }

    pub fn declare_field(&mut self, descriptor: FieldDescriptor) -> Result<()> {
        self.schema.declare(descriptor)
    }

    pub fn resolve(&self, reference: &ObjectRef) -> Result<Object> {
        match reference {
            ObjectRef::Hash(prefix) => self.index.resolve_hash_prefix(prefix),
            ObjectRef::Id(id) => self.index.get(*id)?.ok_or_else(|| QualiaError::FileDoesNotExist(id.to_string())),
        }
    }

    /// Stream a file into the blob store and record it as a new object.
    pub fn add_file(&mut self, path: &Path) -> Result<String> {
        self.add_file_impl(path, false)
    }

    /// Like [`Self::add_file`], but takes ownership of `path` instead of copying it
    /// (the CLI's `take` alias) via the blob store's rename-first path.
    pub fn take_file(&mut self, path: &Path) -> Result<String> {
        self.add_file_impl(path, true)
    }

    fn add_file_impl(&mut self, path: &Path, take: bool) -> Result<String> {
        self.require_writable()?;
        let blobs = self.blobs.as_ref().ok_or(QualiaError::Archive("store has no blob support".to_string()))?;
        let content_for_import = std::fs::read(path)?;
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();

        let (hash, _len) = if take { blobs.add_move(path)? } else { blobs.add_reader(content_for_import.as_slice())? };
        if self.index.get_by_hash(&hash)?.is_some() {
            return Err(QualiaError::FileExists(hash));
        }

        let mut properties = auto_import::run_all(path, &content_for_import);
        if let Value::Object(ref mut map) = properties {
            map.insert("hash".to_string(), json!(hash));
            map.insert("imported_at".to_string(), json!(Utc::now().to_rfc3339()));
            if let Some(modified) = modified {
                let modified: chrono::DateTime<Utc> = modified.into();
                map.insert("file_modified_at".to_string(), json!(modified.to_rfc3339()));
            }
        }
        validate_properties(&mut self.schema, &properties)?;
        self.persist_schema()?;

        let object_id = self.index.insert(Some(&hash), &properties)?;
        self.journal.append(ObjectKey::Id(object_id), Action::Add, json!({}), properties, None)?;
        tracing::info!(object_id, %hash, take, "added object");
        Ok(hash)
    }

    /// Create a property-only object (no backing blob).
    pub fn add(&mut self, properties: Value) -> Result<i64> {
        self.require_writable()?;
        validate_properties(&mut self.schema, &properties)?;
        self.persist_schema()?;
        let object_id = self.index.insert(None, &properties)?;
        self.journal.append(ObjectKey::Id(object_id), Action::Add, json!({}), properties, None)?;
        Ok(object_id)
    }

    /// Write a single field on an existing object.
    pub fn set(&mut self, reference: &ObjectRef, field: &str, value: Value) -> Result<()> {
        self.require_writable()?;
        let descriptor = self.schema.require_or_infer(field, &value)?.clone();
        self.persist_schema()?;
        if descriptor.read_only {
            return Err(QualiaError::FieldReadOnly(field.to_string()));
        }
        if !descriptor.field_type.validate(&value) {
            return Err(QualiaError::InvalidFieldValue {
                field: field.to_string(),
                message: format!("not a valid {}", descriptor.field_type.as_str()),
            });
        }

        let object = self.resolve(reference)?;
        let previous = object.properties.get(field).cloned().unwrap_or(Value::Null);
        let mut properties = object.properties.clone();
        if let Value::Object(ref mut map) = properties {
            map.insert(field.to_string(), value.clone());
        }
        self.index.update_properties(object.object_id, &properties)?;
        self.journal.append(
            object_key_of(&object),
            Action::Set,
            json!({ field: previous }),
            json!({ field: value }),
            None,
        )?;
        Ok(())
    }

    /// Merge a patch of fields onto an existing object's property map. Standard JSON
    /// merge-patch semantics: a key with a `null` value in `patch` removes that key
    /// from the object rather than setting it to `null`.
    pub fn update(&mut self, reference: &ObjectRef, patch: &Value) -> Result<()> {
        self.require_writable()?;
        let Value::Object(patch_fields) = patch else {
            return Err(QualiaError::InvalidFieldValue { field: "patch".to_string(), message: "must be a map".to_string() });
        };
        for (name, value) in patch_fields {
            let descriptor = self.schema.require_or_infer(name, value)?;
            if descriptor.read_only {
                return Err(QualiaError::FieldReadOnly(name.clone()));
            }
        }
        validate_properties(&mut self.schema, patch)?;
        self.persist_schema()?;

        let object = self.resolve(reference)?;
        let previous = object.properties.clone();
        let mut merged = object.properties.clone();
        if let Value::Object(ref mut map) = merged {
            for (key, value) in patch_fields {
                if value.is_null() {
                    map.remove(key);
                } else {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        self.index.update_properties(object.object_id, &merged)?;
        self.journal.append(object_key_of(&object), Action::Update, previous, patch.clone(), None)?;
        Ok(())
    }

    /// Remove an object and, if it has one, its backing blob.
    pub fn delete(&mut self, reference: &ObjectRef) -> Result<()> {
        self.require_writable()?;
        let object = self.resolve(reference)?;
        self.index.delete(object.object_id)?;
        if let (Some(hash), Some(blobs)) = (&object.hash, &self.blobs) {
            blobs.remove(hash)?;
        }
        self.journal.append(object_key_of(&object), Action::Delete, object.properties.clone(), json!({}), None)?;
        Ok(())
    }

    pub fn get(&self, reference: &ObjectRef) -> Result<Object> {
        self.resolve(reference)
    }

    pub fn all(&self) -> Result<Vec<Object>> {
        Ok(self.index.all()?)
    }

    pub fn find_hashes(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.index.find_hashes(prefix)?)
    }

    /// Run a query-language string against the store.
    pub fn select(&self, query_str: &str) -> Result<Vec<Object>> {
        let expr = query::parse(query_str).map_err(QualiaError::InvalidQuery)?;
        let compiled = query::compile(&expr, &self.schema)?;
        Ok(self.index.select(&compiled)?)
    }

    /// Close out the pending changes since the last commit into one checkpoint.
    pub fn commit(&mut self) -> Result<Option<i64>> {
        let checkpoint_id = self.journal.commit()?;
        if let Some(id) = checkpoint_id {
            tracing::debug!(checkpoint_id = id, "committed checkpoint");
        }
        Ok(checkpoint_id)
    }

    /// Reverse the given checkpoint (or the most recent one), re-applying each of
    /// its changes' inverse in turn.
    pub fn undo(&mut self, checkpoint_id: Option<i64>) -> Result<Option<i64>> {
        self.require_writable()?;
        let resolved_id = match checkpoint_id {
            Some(id) => id,
            None => match self.journal.last_checkpoint()? {
                Some(checkpoint) => checkpoint.checkpoint_id,
                None => return Ok(None),
            },
        };

        let Some((_, changes)) = self.journal.undo_plan(Some(resolved_id))? else {
            return Ok(None);
        };
        for change in &changes {
            self.apply_reverse(change)?;
        }
        self.journal.finalize_undo(resolved_id)?;
        tracing::info!(checkpoint_id = resolved_id, changes = changes.len(), "reverted checkpoint");
        Ok(Some(resolved_id))
    }

    fn get_by_key(&self, key: &ObjectKey) -> Result<Object> {
        let object = match key {
            ObjectKey::Id(id) => self.index.get(*id)?,
            ObjectKey::Hash(hash) => self.index.get_by_hash(hash)?,
        };
        object.ok_or_else(|| QualiaError::UndoFailed("object no longer exists".to_string()))
    }

    fn object_id_for(&self, key: &ObjectKey) -> Result<i64> {
        Ok(self.get_by_key(key)?.object_id)
    }

    fn apply_reverse(&mut self, change: &Change) -> Result<()> {
        match change.action {
            Action::Add => {
                if let ObjectKey::Id(id) = change.object_key {
                    self.index.delete(id)?;
                }
            }
            Action::Delete => {
                let hash = match &change.object_key {
                    ObjectKey::Hash(hash) => Some(hash.clone()),
                    ObjectKey::Id(_) => None,
                };
                let object_id = match change.object_key {
                    ObjectKey::Id(id) => id,
                    ObjectKey::Hash(_) => {
                        return Err(QualiaError::UndoFailed("cannot restore a deleted blob's bytes".to_string()))
                    }
                };
                self.index.insert_with_id(object_id, hash.as_deref(), &change.previous)?;
            }
            // `update` undo writes the whole pre-patch map back, which
            // also undoes any field the patch newly introduced -- a merge would
            // leave those behind, since they have no counterpart in `previous`.
            Action::Update => {
                let object_id = self.object_id_for(&change.object_key)?;
                self.index.update_properties(object_id, &change.previous)?;
            }
            // `set` undo restores a single field; absence of a prior value (`previous`
            // journaled as `null`) means the field didn't exist before and is removed
            // rather than set back to `null`.
            Action::Set => {
                let object = self.get_by_key(&change.object_key)?;
                let Value::Object(patch) = &change.previous else {
                    return Err(QualiaError::UndoFailed("malformed set journal entry".to_string()));
                };
                let mut restored = object.properties.clone();
                if let Value::Object(ref mut map) = restored {
                    for (field, value) in patch {
                        if value.is_null() {
                            map.remove(field);
                        } else {
                            map.insert(field.clone(), value.clone());
                        }
                    }
                }
                self.index.update_properties(object.object_id, &restored)?;
            }
        }
        Ok(())
    }

    pub fn dump_journal(&self, order: qualia_journal::Order) -> Result<Vec<Change>> {
        Ok(self.journal.all_checkpoints(order)?.into_iter().try_fold(Vec::new(), |mut acc, checkpoint| {
            acc.extend(self.journal.transactions_of(checkpoint.checkpoint_id)?);
            Ok::<_, QualiaError>(acc)
        })?)
    }

    pub fn dump_metadata(&self) -> Result<Vec<Object>> {
        self.all()
    }

    /// Re-derive an object's properties from its last `Add`/`Update`/`Set` journal
    /// entries, for recovering from an index that's been wiped or corrupted.
    pub fn restore_metadata(&mut self, reference: &ObjectRef) -> Result<()> {
        self.require_writable()?;
        let object = self.resolve(reference)?;
        let key = object_key_of(&object);
        let mut properties = json!({});
        for checkpoint in self.journal.all_checkpoints(qualia_journal::Order::Ascending)? {
            for change in self.journal.transactions_of(checkpoint.checkpoint_id)? {
                if change.object_key != key {
                    continue;
                }
                match change.action {
                    Action::Add => properties = change.extra.clone(),
                    Action::Set | Action::Update => {
                        if let (Value::Object(ref mut map), Value::Object(extra)) = (&mut properties, &change.extra) {
                            for (k, v) in extra {
                                if v.is_null() {
                                    map.remove(k);
                                } else {
                                    map.insert(k.clone(), v.clone());
                                }
                            }
                        }
                    }
                    Action::Delete => {}
                }
            }
        }
        self.index.update_properties(object.object_id, &properties)?;
        Ok(())
    }

    pub fn export(&self, hashes: Option<&[String]>, metadata_only: bool, writer: impl std::io::Write) -> Result<()> {
        archive::export(&self.index, self.blobs.as_ref(), hashes, metadata_only, writer)
    }

    pub fn import(&mut self, reader: impl std::io::Read, renames: &BTreeMap<String, String>) -> Result<ImportSummary> {
        self.require_writable()?;
        let summary = archive::import(&self.index, self.blobs.as_ref(), &mut self.journal, reader, renames)?;
        self.journal.commit()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_file_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");
        let mut db = Database::open(&store_root, false).unwrap();

        let file_path = dir.path().join("note.txt");
        std::fs::write(&file_path, b"hello qualia").unwrap();
        let hash = db.add_file(&file_path).unwrap();

        let object = db.get(&ObjectRef::hash(hash.clone())).unwrap();
        assert_eq!(object.hash.as_deref(), Some(hash.as_str()));
        assert_eq!(object.properties["filename"], json!("note.txt"));
    }

    #[test]
    fn set_and_undo_restores_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open(&dir.path().join("store"), false).unwrap();
        let id = db.add(json!({"tags": "draft"})).unwrap();
        db.commit().unwrap();

        db.set(&ObjectRef::Id(id), "tags", json!("final")).unwrap();
        db.commit().unwrap();
        assert_eq!(db.get(&ObjectRef::Id(id)).unwrap().properties["tags"], json!("final"));

        db.undo(None).unwrap();
        assert_eq!(db.get(&ObjectRef::Id(id)).unwrap().properties["tags"], json!("draft"));
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");
        Database::open(&store_root, false).unwrap();

        let mut reopened = Database::open(&store_root, true).unwrap();
        assert!(matches!(reopened.add(json!({})), Err(QualiaError::DatabaseReadOnly)));
    }

    #[test]
    fn query_selects_matching_objects() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open(&dir.path().join("store"), false).unwrap();
        db.add(json!({"tags": "rust"})).unwrap();
        db.add(json!({"tags": "python"})).unwrap();
        db.commit().unwrap();

        let results = db.select("tags:rust").unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn unseen_field_is_declared_lazily_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open(&dir.path().join("store"), false).unwrap();
        let id = db.add(json!({"rating": 5})).unwrap();
        db.commit().unwrap();
        assert_eq!(db.get(&ObjectRef::Id(id)).unwrap().properties["rating"], json!(5));
        assert!(db.fields().any(|f| f.name == "rating"));
    }

    #[test]
    fn lazily_inferred_field_type_is_pinned_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");
        let mut db = Database::open(&store_root, false).unwrap();
        db.add(json!({"rating": 5})).unwrap();
        db.commit().unwrap();
        drop(db);

        let mut reopened = Database::open(&store_root, false).unwrap();
        let err = reopened.set(&ObjectRef::Id(1), "rating", json!("not a number")).unwrap_err();
        assert!(matches!(err, QualiaError::InvalidFieldValue { .. }));
    }

    #[test]
    fn schema_drift_is_fatal_on_read_write_open() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");
        let mut db = Database::open(&store_root, false).unwrap();
        db.add(json!({"rating": 5})).unwrap();
        db.commit().unwrap();
        drop(db);

        // Simulate another process having since redeclared `rating` as text.
        let state_path = store_root.join("state");
        std::fs::write(&state_path, "fields:\n  rating: text\n").unwrap();

        let err = Database::open(&store_root, false).unwrap_err();
        assert!(matches!(err, QualiaError::FieldConfigChanged { .. }));
    }

    #[test]
    fn schema_drift_degrades_to_read_only_open() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");
        let mut db = Database::open(&store_root, false).unwrap();
        db.add(json!({"rating": 5})).unwrap();
        db.commit().unwrap();
        drop(db);

        let state_path = store_root.join("state");
        std::fs::write(&state_path, "fields:\n  rating: text\n").unwrap();

        let mut reopened = Database::open(&store_root, true).unwrap();
        assert!(matches!(reopened.add(json!({})), Err(QualiaError::DatabaseReadOnly)));
    }

    #[test]
    fn import_is_undoable() {
        let src_dir = tempfile::tempdir().unwrap();
        let mut src = Database::open(&src_dir.path().join("store"), false).unwrap();
        let file_path = src_dir.path().join("note.txt");
        std::fs::write(&file_path, b"hello qualia").unwrap();
        let hash = src.add_file(&file_path).unwrap();
        src.commit().unwrap();

        let mut buf = Vec::new();
        src.export(None, false, &mut buf).unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let mut dst = Database::open(&dst_dir.path().join("store"), false).unwrap();
        let summary = dst.import(buf.as_slice(), &BTreeMap::new()).unwrap();
        assert_eq!(summary.added, 1);
        assert!(dst.get(&ObjectRef::hash(hash.clone())).is_ok());

        dst.undo(None).unwrap();
        assert!(dst.get(&ObjectRef::hash(hash)).is_err());
    }
}
