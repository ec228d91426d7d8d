//! A filesystem content-addressed blob store, keyed by SHA-256, with
//! hash-then-write-if-missing semantics, streaming write/read, and a
//! retain-set GC sweep.

use crate::error::{CoreError, Result};
use crate::hash::Hash;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub struct BlobStore {
    root: PathBuf,
    extension: &'static str,
}

impl BlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_extension(root, "data")
    }

    /// Same store, different on-disk filename extension. Structured object
    /// stores use `cbor`; raw attachment blobs stay `data`.
    pub fn open_with_extension(root: impl Into<PathBuf>, extension: &'static str) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(BlobStore { root, extension })
    }

    pub fn get_path(&self, hash: &Hash) -> PathBuf {
        self.root
            .join(hash.shard_prefix())
            .join(format!("{}.{}", hash.shard_rest(), self.extension))
    }

    /// Writes `data`, computing its hash. Idempotent: a blob already on disk
    /// is not rewritten.
    pub fn write(&self, data: &[u8]) -> Result<Hash> {
        let hash = Hash::of_bytes(data);
        let path = self.get_path(&hash);
        if path.exists() {
            return Ok(hash);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(hash)
    }

    /// Streams `reader` to a temp file while hashing it, then atomically
    /// renames into place, avoiding buffering the whole blob in memory.
    pub fn write_iter<R: Read>(&self, reader: R) -> Result<Hash> {
        self.write_iter_capped(reader, u64::MAX)
    }

    /// Same as [`BlobStore::write_iter`], but aborts (and removes the temp
    /// file) as soon as more than `max_bytes` have been read, instead of
    /// writing an unbounded amount of data to disk first.
    pub fn write_iter_capped<R: Read>(&self, reader: R, max_bytes: u64) -> Result<Hash> {
        let (hash, tmp) = self.stage_iter_capped(reader, max_bytes)?;
        self.commit_staged(&hash, tmp)?;
        Ok(hash)
    }

    /// Streams `reader` to a temp file while hashing, without publishing
    /// the blob. The caller passes the temp path to
    /// [`BlobStore::commit_staged`] once it holds whatever lock governs the
    /// hash.
    pub fn stage_iter_capped<R: Read>(
        &self,
        mut reader: R,
        max_bytes: u64,
    ) -> Result<(Hash, PathBuf)> {
        use sha2::{Digest, Sha256};

        fs::create_dir_all(&self.root)?;
        let tmp = self.root.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        {
            let mut f = fs::File::create(&tmp)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                total += n as u64;
                if total > max_bytes {
                    drop(f);
                    let _ = fs::remove_file(&tmp);
                    return Err(CoreError::TooLarge { bytes: total, max: max_bytes });
                }
                hasher.update(&buf[..n]);
                f.write_all(&buf[..n])?;
            }
            f.sync_all()?;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Ok((Hash::from_bytes(out), tmp))
    }

    /// Publishes a staged temp file under its hash. Idempotent: if the blob
    /// already exists the temp file is discarded instead.
    pub fn commit_staged(&self, hash: &Hash, tmp: PathBuf) -> Result<()> {
        let path = self.get_path(hash);
        if path.exists() {
            fs::remove_file(&tmp)?;
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read(&self, hash: &Hash) -> Result<Vec<u8>> {
        let path = self.get_path(hash);
        fs::read(&path).map_err(|e| map_not_found(e, hash))
    }

    pub fn read_stream(&self, hash: &Hash) -> Result<impl Read> {
        let path = self.get_path(hash);
        fs::File::open(&path).map_err(|e| map_not_found(e, hash))
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        self.get_path(hash).exists()
    }

    /// Best-effort delete: a missing blob is not an error.
    pub fn delete(&self, hash: &Hash) -> Result<()> {
        match fs::remove_file(self.get_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// GC sweep: deletes every on-disk blob whose hash is not in `keep`,
    /// along with any partial temp file a crashed writer left behind.
    pub fn retain(&self, keep: &HashSet<Hash>) -> Result<()> {
        if !self.root.is_dir() {
            return Ok(());
        }
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                // Stray staging temp at the root.
                let _ = fs::remove_file(shard.path());
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let path = entry.path();
                match hash_from_path(&shard.path(), &path, self.extension) {
                    Some(hash) if keep.contains(&hash) => {}
                    _ => {
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        Ok(())
    }
}

fn hash_from_path(shard_dir: &Path, file: &Path, extension: &str) -> Option<Hash> {
    if file.extension()? != extension {
        return None;
    }
    let prefix = shard_dir.file_name()?.to_str()?;
    let stem = file.file_stem()?.to_str()?;
    Hash::from_hex(&format!("{prefix}{stem}")).ok()
}

fn map_not_found(e: io::Error, hash: &Hash) -> CoreError {
    if e.kind() == io::ErrorKind::NotFound {
        CoreError::not_found(format!("blob {hash}"))
    } else {
        CoreError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let hash = store.write(b"hello world").unwrap();
        assert_eq!(store.read(&hash).unwrap(), b"hello world");
    }

    #[test]
    fn write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let a = store.write(b"same bytes").unwrap();
        let b = store.write(b"same bytes").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn write_iter_matches_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let a = store.write(b"streamed content").unwrap();
        let b = store.write_iter(std::io::Cursor::new(b"streamed content")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn retain_sweeps_unreferenced_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let keep = store.write(b"keep me").unwrap();
        let drop_hash = store.write(b"drop me").unwrap();
        let mut keep_set = HashSet::new();
        keep_set.insert(keep);
        store.retain(&keep_set).unwrap();
        assert!(store.exists(&keep));
        assert!(!store.exists(&drop_hash));
    }

    #[test]
    fn retain_sweeps_stray_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let keep = store.write(b"keep me").unwrap();
        std::fs::write(dir.path().join(".tmp-abandoned"), b"partial").unwrap();
        let mut keep_set = HashSet::new();
        keep_set.insert(keep);
        store.retain(&keep_set).unwrap();
        assert!(store.exists(&keep));
        assert!(!dir.path().join(".tmp-abandoned").exists());
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let hash = Hash::of_bytes(b"never written");
        assert!(matches!(store.read(&hash), Err(CoreError::NotFound { .. })));
    }
}
