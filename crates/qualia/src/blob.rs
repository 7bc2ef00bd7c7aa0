//! Content-addressed blob storage.
//!
//! Bytes are hashed with SHA-512 as they're streamed to a temp file, then the temp
//! file is renamed into a two-level shard (`files/<first two hex chars>/<hash>`) so no
//! directory holds an unbounded number of entries. Stored files are made read-only
//! immediately after the rename: content-addressing only holds if nothing can mutate
//! a blob once its hash has been recorded.

use crate::error::{QualiaError, Result};
use sha2::{Digest, Sha512};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("tmp"))?;
        Ok(())
    }

    fn shard_dir(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2.min(hash.len())])
    }

    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.shard_dir(hash).join(hash)
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.path_for(hash).is_file()
    }

    /// Stream `reader` to content-addressed storage, returning its hash and length.
    /// Writing the same bytes twice is a harmless no-op at this layer; whether a
    /// second logical `add` of the same hash is an error is the facade's call.
    pub fn add_reader<R: Read>(&self, mut reader: R) -> Result<(String, u64)> {
        fs::create_dir_all(self.root.join("tmp"))?;
        let tmp_path = self.root.join("tmp").join(format!("{}.partial", std::process::id()));
        let mut tmp_file = File::create(&tmp_path)?;
        let mut hasher = Sha512::new();
        let mut buf = [0u8; 64 * 1024];
        let mut len = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp_file.write_all(&buf[..n])?;
            len += n as u64;
        }
        tmp_file.sync_all()?;
        drop(tmp_file);

        let hash = hex::encode(hasher.finalize());
        let dest_dir = self.shard_dir(&hash);
        fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(&hash);

        if dest.is_file() {
            tracing::debug!(%hash, "blob already stored, discarding duplicate bytes");
            fs::remove_file(&tmp_path)?;
        } else {
            fs::rename(&tmp_path, &dest)?;
            make_read_only(&dest)?;
            tracing::debug!(%hash, len, "stored new blob");
        }

        Ok((hash, len))
    }

    pub fn add_file(&self, path: &Path) -> Result<(String, u64)> {
        self.add_reader(File::open(path)?)
    }

    /// Take ownership of `path` rather than copying it: hash it first (so a failed
    /// rename doesn't lose the source), try `rename` straight into its shard, and
    /// fall back to the stream-and-rename path (then unlink the source) if the
    /// rename fails -- e.g. because source and store live on different filesystems.
    pub fn add_move(&self, path: &Path) -> Result<(String, u64)> {
        let (hash, len) = hash_file(path)?;

        let dest_dir = self.shard_dir(&hash);
        fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(&hash);

        if dest.is_file() {
            fs::remove_file(path)?;
            return Ok((hash, len));
        }

        match fs::rename(path, &dest) {
            Ok(()) => {
                make_read_only(&dest)?;
                Ok((hash, len))
            }
            Err(_) => {
                let (hash, len) = self.add_file(path)?;
                fs::remove_file(path)?;
                Ok((hash, len))
            }
        }
    }

    pub fn open(&self, hash: &str) -> Result<File> {
        File::open(self.path_for(hash)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                QualiaError::FileDoesNotExist(hash.to_string())
            } else {
                QualiaError::Io(e)
            }
        })
    }

    /// Remove the bytes for `hash` from disk. Callers must already have removed its
    /// property record from the index -- the blob store itself tracks no metadata.
    pub fn remove(&self, hash: &str) -> Result<()> {
        let path = self.path_for(hash);
        let mut perms = fs::metadata(&path)?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o644);
        }
        fs::set_permissions(&path, perms)?;
        fs::remove_file(&path)?;
        Ok(())
    }
}

fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buf = [0u8; 64 * 1024];
    let mut len = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), len))
}

#[cfg(unix)]
fn make_read_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o444);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_read_only(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn add_reader_hashes_and_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let (hash, len) = store.add_reader(Cursor::new(b"hello world")).unwrap();
        assert_eq!(len, 11);
        assert!(store.exists(&hash));
        assert!(store.path_for(&hash).starts_with(dir.path().join(&hash[..2])));
    }

    #[test]
    fn stored_blob_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let (hash, _) = store.add_reader(Cursor::new(b"immutable")).unwrap();
        let perms = fs::metadata(store.path_for(&hash)).unwrap().permissions();
        assert!(perms.readonly());
    }

    #[test]
    fn re_adding_same_bytes_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let (h1, _) = store.add_reader(Cursor::new(b"same")).unwrap();
        let (h2, _) = store.add_reader(Cursor::new(b"same")).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn missing_hash_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        assert!(matches!(store.open("deadbeef"), Err(QualiaError::FileDoesNotExist(_))));
    }

    #[test]
    fn add_move_removes_the_source() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(store_dir.path());
        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("source.bin");
        fs::write(&src_path, b"move me").unwrap();

        let (hash, len) = store.add_move(&src_path).unwrap();
        assert_eq!(len, 7);
        assert!(store.exists(&hash));
        assert!(!src_path.exists());
    }
}
