//! End-to-end scenarios against the facade, each run against a
//! fresh directory-mode store.

use qualia::facade::ObjectRef;
use qualia::schema::{FieldDescriptor, FieldType};
use qualia::Database;
use serde_json::json;

fn open_store(dir: &std::path::Path) -> Database {
    Database::open(&dir.join("store"), false).unwrap()
}

#[test]
fn s1_empty_open_close_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open_store(dir.path());
        assert_eq!(db.all().unwrap().len(), 0);
    }
    let db = open_store(dir.path());
    assert_eq!(db.all().unwrap().len(), 0);
}

#[test]
fn s2_add_then_delete() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_store(dir.path());
    db.declare_field(FieldDescriptor::new("name", FieldType::ExactText)).unwrap();

    db.add(json!({"name": "alice"})).unwrap();
    db.commit().unwrap();

    let all = db.all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].properties["name"], json!("alice"));

    let matches = db.select("name:alice").unwrap();
    assert_eq!(matches.len(), 1);
    db.delete(&ObjectRef::Id(matches[0].object_id)).unwrap();
    db.commit().unwrap();

    assert_eq!(db.all().unwrap().len(), 0);
}

fn seed_eight(db: &mut Database) {
    db.declare_field(FieldDescriptor::new("name", FieldType::ExactText)).unwrap();
    db.declare_field(FieldDescriptor::new("value", FieldType::Number)).unwrap();
    db.declare_field(FieldDescriptor::new("ordinal", FieldType::Keyword)).unwrap();

    let ordinal_names = ["first", "second", "third", "fourth"];
    let cardinal_names = ["one", "two", "three", "four"];
    for (i, name) in ordinal_names.iter().enumerate() {
        db.add(json!({"name": name, "value": (i + 1) as f64, "ordinal": "yes"})).unwrap();
    }
    for (i, name) in cardinal_names.iter().enumerate() {
        db.add(json!({"name": name, "value": (i + 1) as f64, "ordinal": "no"})).unwrap();
    }
    db.commit().unwrap();
}

#[test]
fn s3_rename_via_update() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_store(dir.path());
    seed_eight(&mut db);

    let found = db.select("name:first").unwrap();
    assert_eq!(found.len(), 1);
    db.update(&ObjectRef::Id(found[0].object_id), &json!({"name": "zeroth"})).unwrap();
    db.commit().unwrap();

    assert_eq!(db.select("name:zeroth").unwrap().len(), 1);
    assert_eq!(db.select("name:first").unwrap().len(), 0);
}

#[test]
fn s4_query_numeric_range() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_store(dir.path());
    seed_eight(&mut db);

    let results = db.select("value: between 2 and 3").unwrap();
    assert_eq!(results.len(), 4);
}

#[test]
fn s5_query_phrase() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_store(dir.path());
    db.add(json!({"comments": "the quick brown fox"})).unwrap();
    db.commit().unwrap();

    assert_eq!(db.select(r#"comments:"quick brown""#).unwrap().len(), 1);
    assert_eq!(db.select(r#"comments:"quick slow""#).unwrap().len(), 0);
}

#[test]
fn s6_undo_add() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_store(dir.path());
    db.declare_field(FieldDescriptor::new("n", FieldType::Number)).unwrap();

    db.add(json!({"n": 1})).unwrap();
    db.commit().unwrap();
    assert_eq!(db.all().unwrap().len(), 1);

    db.undo(None).unwrap();
    assert_eq!(db.all().unwrap().len(), 0);

    // A subsequent undo is a no-op, not an error.
    assert_eq!(db.undo(None).unwrap(), None);
}

#[test]
fn s7_undo_update() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_store(dir.path());
    db.declare_field(FieldDescriptor::new("name", FieldType::ExactText)).unwrap();

    let id = db.add(json!({"name": "a"})).unwrap();
    db.commit().unwrap();

    db.update(&ObjectRef::Id(id), &json!({"name": "b"})).unwrap();
    db.commit().unwrap();
    assert_eq!(db.select("name:b").unwrap().len(), 1);

    db.undo(None).unwrap();
    assert_eq!(db.select("name:a").unwrap().len(), 1);
}

#[test]
fn s8_blob_round_trip() {
    use sha2::{Digest, Sha512};

    let dir = tempfile::tempdir().unwrap();
    let mut db = open_store(dir.path());

    let file_path = dir.path().join("hello.txt");
    std::fs::write(&file_path, b"hello world").unwrap();
    let hash = db.add_file(&file_path).unwrap();

    let expected = hex::encode(Sha512::digest(b"hello world"));
    assert_eq!(hash, expected);

    let stored_path = dir.path().join("store").join("files").join(&hash[..2]).join(&hash);
    assert!(stored_path.is_file());
    assert_eq!(std::fs::read(&stored_path).unwrap(), b"hello world");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&stored_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0, "stored blob must have no write bits set");
    }

    // Writing through the stored path must fail; the file is read-only on disk.
    #[cfg(unix)]
    assert!(std::fs::OpenOptions::new().write(true).open(&stored_path).is_err());
}
