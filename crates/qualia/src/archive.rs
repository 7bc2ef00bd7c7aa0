//! Export/import archive: a gzipped tarball whose first entry is
//! `qualia_export.yaml`, followed by `metadata.yaml` (a `hash -> {field: value}` map,
//! `hash` itself excluded since the key already carries it) and, unless
//! `metadata_only`, a `files/<hash>` entry per exported blob.

use crate::blob::BlobStore;
use crate::error::{QualiaError, Result};
use crate::index::Index;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use qualia_journal::checkpoint::{Action, ObjectKey};
use qualia_journal::Journal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tar::{Archive, Builder, Header};

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    metadata_only: bool,
    timestamp: DateTime<Utc>,
}

fn properties_without_hash(properties: &serde_json::Value) -> BTreeMap<String, serde_json::Value> {
    let mut map = BTreeMap::new();
    if let serde_json::Value::Object(fields) = properties {
        for (key, value) in fields {
            if key != "hash" {
                map.insert(key.clone(), value.clone());
            }
        }
    }
    map
}

/// Write an export archive for `hashes` (or every blob object, if `None`) to `writer`.
pub fn export(
    index: &Index,
    blobs: Option<&BlobStore>,
    hashes: Option<&[String]>,
    metadata_only: bool,
    writer: impl Write,
) -> Result<()> {
    let objects = match hashes {
        Some(hashes) => hashes
            .iter()
            .map(|h| index.resolve_hash_prefix(h))
            .collect::<Result<Vec<_>>>()?,
        None => index.all()?.into_iter().filter(|o| o.hash.is_some()).collect(),
    };

    let gz = GzEncoder::new(writer, Compression::default());
    let mut tar = Builder::new(gz);

    let manifest = Manifest { version: 1, metadata_only, timestamp: Utc::now() };
    add_yaml_entry(&mut tar, "qualia_export.yaml", &manifest)?;

    let mut metadata: BTreeMap<String, BTreeMap<String, serde_json::Value>> = BTreeMap::new();
    for object in &objects {
        let hash = object.hash.clone().expect("export only selects blob objects");
        metadata.insert(hash, properties_without_hash(&object.properties));
    }
    add_yaml_entry(&mut tar, "metadata.yaml", &metadata)?;

    if !metadata_only {
        let blobs = blobs.ok_or_else(|| QualiaError::Archive("metadata-only store has no files to export".to_string()))?;
        for object in &objects {
            let hash = object.hash.as_ref().expect("export only selects blob objects");
            let mut file = blobs.open(hash)?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            let mut header = Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o444);
            header.set_cksum();
            tar.append_data(&mut header, format!("files/{hash}"), bytes.as_slice())?;
        }
    }

    tar.finish()?;
    Ok(())
}

fn add_yaml_entry<W: Write, T: Serialize>(tar: &mut Builder<W>, name: &str, value: &T) -> Result<()> {
    let bytes = serde_yaml::to_string(value).map_err(|e| QualiaError::Archive(e.to_string()))?.into_bytes();
    let mut header = Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, name, bytes.as_slice())?;
    Ok(())
}

/// The result of importing one archive: how many objects were newly added versus
/// already present (and therefore left untouched).
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub added: usize,
    pub already_present: usize,
}

/// Import an archive written by [`export`]. `renames` maps field names in the
/// archive's `metadata.yaml` to field names in this store (`--rename FROM=TO`).
pub fn import(
    index: &Index,
    blobs: Option<&BlobStore>,
    journal: &mut Journal,
    reader: impl Read,
    renames: &BTreeMap<String, String>,
) -> Result<ImportSummary> {
    let gz = GzDecoder::new(reader);
    let mut archive = Archive::new(gz);
    let mut manifest: Option<Manifest> = None;
    let mut metadata: BTreeMap<String, BTreeMap<String, serde_json::Value>> = BTreeMap::new();
    let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        let name = path.to_string_lossy().to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;

        if name == "qualia_export.yaml" {
            manifest = Some(serde_yaml::from_slice(&bytes).map_err(|e| QualiaError::Archive(e.to_string()))?);
        } else if name == "metadata.yaml" {
            metadata = serde_yaml::from_slice(&bytes).map_err(|e| QualiaError::Archive(e.to_string()))?;
        } else if let Some(hash) = name.strip_prefix("files/") {
            files.insert(hash.to_string(), bytes);
        }
    }

    manifest.ok_or_else(|| QualiaError::Archive("missing qualia_export.yaml".to_string()))?;

    let mut summary = ImportSummary::default();
    for (hash, fields) in metadata {
        if index.get_by_hash(&hash)?.is_some() {
            summary.already_present += 1;
            continue;
        }

        if let Some(bytes) = files.get(&hash) {
            let blobs = blobs.ok_or_else(|| QualiaError::Archive("store has no blob support".to_string()))?;
            blobs.add_reader(bytes.as_slice())?;
        }

        let mut renamed = serde_json::Map::new();
        for (field, value) in fields {
            let target = renames.get(&field).cloned().unwrap_or(field);
            renamed.insert(target, value);
        }
        let properties = serde_json::Value::Object(renamed);
        let object_id = index.insert(Some(&hash), &properties)?;
        journal.append(ObjectKey::Id(object_id), Action::Add, json!({}), properties, None)?;
        summary.added += 1;
    }

    tracing::info!(added = summary.added, already_present = summary.already_present, "import finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn export_then_import_round_trips_metadata() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_index = Index::open_in_memory().unwrap();
        let src_blobs = BlobStore::new(src_dir.path());
        src_blobs.init().unwrap();
        let (hash, _) = src_blobs.add_reader(std::io::Cursor::new(b"hello")).unwrap();
        src_index.insert(Some(&hash), &json!({"hash": hash, "tags": "rust"})).unwrap();

        let mut buf = Vec::new();
        export(&src_index, Some(&src_blobs), None, false, &mut buf).unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dst_index = Index::open_in_memory().unwrap();
        let dst_blobs = BlobStore::new(dst_dir.path());
        dst_blobs.init().unwrap();
        let mut journal = Journal::open_in_memory().unwrap();
        let summary = import(&dst_index, Some(&dst_blobs), &mut journal, buf.as_slice(), &BTreeMap::new()).unwrap();

        assert_eq!(summary.added, 1);
        assert!(dst_blobs.exists(&hash));
        let object = dst_index.get_by_hash(&hash).unwrap().unwrap();
        assert_eq!(object.properties["tags"], json!("rust"));
    }

    #[test]
    fn metadata_only_export_skips_files() {
        let src_index = Index::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path());
        blobs.init().unwrap();
        let (hash, _) = blobs.add_reader(std::io::Cursor::new(b"x")).unwrap();
        src_index.insert(Some(&hash), &json!({"hash": hash})).unwrap();

        let mut buf = Vec::new();
        export(&src_index, Some(&blobs), None, true, &mut buf).unwrap();

        let dst_index = Index::open_in_memory().unwrap();
        let mut journal = Journal::open_in_memory().unwrap();
        let summary = import(&dst_index, None, &mut journal, buf.as_slice(), &BTreeMap::new()).unwrap();
        assert_eq!(summary.added, 1);
    }

    #[test]
    fn duplicate_hash_is_left_untouched() {
        let index = Index::open_in_memory().unwrap();
        index.insert(Some("abc"), &json!({"tags": "original"})).unwrap();

        let mut metadata = BTreeMap::new();
        let mut fields = BTreeMap::new();
        fields.insert("tags".to_string(), json!("imported"));
        metadata.insert("abc".to_string(), fields);

        let manifest = Manifest { version: 1, metadata_only: true, timestamp: Utc::now() };
        let mut buf = Vec::new();
        {
            let gz = GzEncoder::new(&mut buf, Compression::default());
            let mut tar = Builder::new(gz);
            add_yaml_entry(&mut tar, "qualia_export.yaml", &manifest).unwrap();
            add_yaml_entry(&mut tar, "metadata.yaml", &metadata).unwrap();
            tar.finish().unwrap();
        }

        let mut journal = Journal::open_in_memory().unwrap();
        let summary = import(&index, None, &mut journal, buf.as_slice(), &BTreeMap::new()).unwrap();
        assert_eq!(summary.already_present, 1);
        assert_eq!(index.get_by_hash("abc").unwrap().unwrap().properties["tags"], json!("original"));
    }
}
