//! On-disk layouts.
//!
//! Two backends share the same facade: the canonical directory layout (a `state`
//! YAML file, a `files/` blob tree, a standalone `journal` database and a `search/`
//! database holding the property table), and a single-file `.qualia` mode modeled on
//! `store.py`, which never grew blob support -- so single-file mode is
//! property-objects-only, with `objects`, `object_changes`, and `checkpoints` tables
//! and no file bytes.
//!
//! Both modes open the journal and the index as two independent SQLite connections.
//! In directory mode those connections point at two different files; in single-file
//! mode they point at the same file. Either way, a change to the object store and its
//! corresponding journal entry can't commit as one SQLite transaction -- this is the
//! reason [`qualia_journal::Journal::undo_plan`]/`finalize_undo` exist as a two-phase
//! protocol rather than the index just subscribing to the journal's own transaction.

use crate::blob::BlobStore;
use crate::error::Result;
use crate::index::Index;
use qualia_journal::Journal;
use std::fs;
use std::path::{Path, PathBuf};

/// A fully opened store: its journal, its property/search index, and -- in
/// directory mode -- its blob store.
pub struct OpenedStore {
    pub journal: Journal,
    pub index: Index,
    pub blobs: Option<BlobStore>,
    pub state_path: Option<PathBuf>,
}

pub trait StoreBackend {
    fn init(&self) -> Result<()>;
    fn open(&self) -> Result<OpenedStore>;
}

/// The canonical on-disk layout: `<root>/{state,journal,files/,search/index.sqlite3}`.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join("journal")
    }

    fn search_path(&self) -> PathBuf {
        self.root.join("search").join("index.sqlite3")
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("state")
    }

    fn blob_root(&self) -> PathBuf {
        self.root.join("files")
    }
}

impl StoreBackend for DirStore {
    fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.root.join("search"))?;
        BlobStore::new(self.blob_root()).init()?;
        if !self.state_path().is_file() {
            fs::write(self.state_path(), "---\n")?;
        }
        Ok(())
    }

    fn open(&self) -> Result<OpenedStore> {
        self.init()?;
        Ok(OpenedStore {
            journal: Journal::open(self.journal_path())?,
            index: Index::open(self.search_path())?,
            blobs: Some(BlobStore::new(self.blob_root())),
            state_path: Some(self.state_path()),
        })
    }
}

/// The single-file `.qualia` layout: one SQLite file holding both the journal and the
/// property store, no blob support.
pub struct SingleFileStore {
    path: PathBuf,
}

impl SingleFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StoreBackend for SingleFileStore {
    fn init(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<OpenedStore> {
        self.init()?;
        Ok(OpenedStore {
            journal: Journal::open(&self.path)?,
            index: Index::open(&self.path)?,
            blobs: None,
            state_path: None,
        })
    }
}

/// Picks a backend by inspecting the path: an existing file (or a path ending in
/// `.qualia`) opens single-file mode, anything else opens directory mode.
pub fn detect_backend(path: &Path) -> Box<dyn StoreBackend> {
    let looks_like_file = path.extension().map(|ext| ext == "qualia").unwrap_or(false)
        || (path.exists() && path.is_file());
    if looks_like_file {
        Box::new(SingleFileStore::new(path.to_path_buf()))
    } else {
        Box::new(DirStore::new(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_store_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let backend = DirStore::new(&root);
        let opened = backend.open().unwrap();
        assert!(root.join("files").is_dir());
        assert!(root.join("state").is_file());
        assert!(opened.blobs.is_some());
    }

    #[test]
    fn single_file_store_has_no_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.qualia");
        let backend = SingleFileStore::new(&path);
        let opened = backend.open().unwrap();
        assert!(opened.blobs.is_none());
    }

    #[test]
    fn detect_backend_picks_single_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.qualia");
        let backend = detect_backend(&path);
        let opened = backend.open().unwrap();
        assert!(opened.blobs.is_none());
    }
}
