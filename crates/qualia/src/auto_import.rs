//! Auto-importers: plugins that inspect a file being added and contribute extra
//! properties, modeled on `plugins/image.py` and `plugins/magic.py`, which
//! discovered these via setuptools entry points at import time. Here they're an
//! explicit, alphabetically-sorted list built at compile time instead -- no dynamic
//! loading, deterministic run order.

use serde_json::{json, Value};
use std::path::Path;

pub trait AutoImporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect the bytes and path of a file as it's added, returning extra
    /// properties to merge into the object (or `None` if this importer doesn't
    /// recognize the content).
    fn import(&self, path: &Path, content: &[u8]) -> Option<Value>;
}

/// Always contributes the on-disk filename, stripped of its directory.
struct FilenameImporter;

impl AutoImporter for FilenameImporter {
    fn name(&self) -> &'static str {
        "filename"
    }

    fn import(&self, path: &Path, _content: &[u8]) -> Option<Value> {
        let name = path.file_name()?.to_str()?;
        Some(json!({ "filename": name }))
    }
}

/// Sniffs a handful of common file signatures, mirroring `plugins/magic.py`'s MIME
/// detection without requiring a native `libmagic` binding.
struct MagicBytesImporter;

impl AutoImporter for MagicBytesImporter {
    fn name(&self) -> &'static str {
        "magic_bytes"
    }

    fn import(&self, _path: &Path, content: &[u8]) -> Option<Value> {
        let mime = sniff_mime(content)?;
        Some(json!({ "mime_type": mime }))
    }
}

fn sniff_mime(content: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
    ];
    SIGNATURES.iter().find(|(magic, _)| content.starts_with(magic)).map(|(_, mime)| *mime)
}

/// All registered importers, sorted by name so they always run in the same order.
pub fn importers() -> Vec<Box<dyn AutoImporter>> {
    let mut list: Vec<Box<dyn AutoImporter>> = vec![Box::new(FilenameImporter), Box::new(MagicBytesImporter)];
    list.sort_by_key(|importer| importer.name());
    list
}

/// Run every registered importer over `content`/`path` and merge their
/// contributions into one property map.
pub fn run_all(path: &Path, content: &[u8]) -> Value {
    let mut merged = serde_json::Map::new();
    for importer in importers() {
        if let Some(Value::Object(contributed)) = importer.import(path, content) {
            for (key, value) in contributed {
                merged.entry(key).or_insert(value);
            }
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importers_are_sorted_by_name() {
        let names: Vec<_> = importers().iter().map(|i| i.name()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn run_all_merges_filename_and_mime() {
        let result = run_all(Path::new("/tmp/photo.png"), b"\x89PNG\r\n\x1a\nrest");
        assert_eq!(result["filename"], json!("photo.png"));
        assert_eq!(result["mime_type"], json!("image/png"));
    }

    #[test]
    fn unrecognized_content_only_gets_filename() {
        let result = run_all(Path::new("/tmp/notes.txt"), b"plain text");
        assert_eq!(result["filename"], json!("notes.txt"));
        assert!(result.get("mime_type").is_none());
    }
}
