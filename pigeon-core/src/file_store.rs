//! A path-keyed persistent map of [`StructuredValue`]s, each entry stored as
//! a canonical-CBOR file. [`FileStore::update`] is the pivotal atomic
//! read-modify-write primitive every higher layer (dataset meta, attachment
//! meta) builds on: write to a temp file, `sync_all`, then rename over the
//! target, guarded by [`LockManager`] so concurrent updates serialize.

use crate::codec::cbor;
use crate::error::{CoreError, Result};
use crate::lock::LockManager;
use crate::value::StructuredValue;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

pub struct FileStore {
    root: PathBuf,
    locks: LockManager,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileStore {
            root,
            locks: LockManager::new(),
        })
    }

    fn key_of(segments: &[String]) -> Result<String> {
        if segments.is_empty() {
            return Err(CoreError::validation("file store path must not be empty"));
        }
        let mut parts = Vec::with_capacity(segments.len());
        for seg in segments {
            parts.push(sanitize_segment(seg)?);
        }
        Ok(parts.join("/"))
    }

    fn path_for(&self, segments: &[String]) -> Result<PathBuf> {
        let key = Self::key_of(segments)?;
        Ok(self.root.join(format!("{key}.cbor")))
    }

    pub fn exists(&self, segments: &[String]) -> Result<bool> {
        Ok(self.path_for(segments)?.is_file())
    }

    pub fn read(&self, segments: &[String]) -> Result<StructuredValue> {
        let path = self.path_for(segments)?;
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::not_found(format!("{}", segments.join("/")))
            } else {
                CoreError::Io(e)
            }
        })?;
        cbor::decode(&bytes)
    }

    pub fn write(&self, segments: &[String], value: &StructuredValue) -> Result<()> {
        let key = Self::key_of(segments)?;
        let _guard = self.locks.lock_one(&key);
        self.write_locked(segments, value)
    }

    fn write_locked(&self, segments: &[String], value: &StructuredValue) -> Result<()> {
        let path = self.path_for(segments)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = cbor::encode_canonical(value)?;
        let tmp = path.with_extension("cbor.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn delete(&self, segments: &[String]) -> Result<()> {
        let key = Self::key_of(segments)?;
        let _guard = self.locks.lock_one(&key);
        let path = self.path_for(segments)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// The scoped read-modify-write critical section: locks `segments`,
    /// reads the current value (`None` if absent), invokes `f`, and writes
    /// the result back atomically iff `f` returns `Some`. The lock is held
    /// for the whole closure and released on every exit path, including
    /// `f` returning `Err`.
    pub fn update<F>(&self, segments: &[String], f: F) -> Result<()>
    where
        F: FnOnce(Option<StructuredValue>) -> Result<Option<StructuredValue>>,
    {
        let key = Self::key_of(segments)?;
        let _guard = self.locks.lock_one(&key);
        let current = match self.read(segments) {
            Ok(v) => Some(v),
            Err(CoreError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        if let Some(next) = f(current)? {
            self.write_locked(segments, &next)?;
        }
        Ok(())
    }

    /// Removes a whole folder prefix and every entry below it. Used when a
    /// dataset is deleted outright rather than record by record.
    pub fn delete_subtree(&self, prefix: &[String]) -> Result<()> {
        let key = Self::key_of(prefix)?;
        let _guard = self.locks.lock_one(&key);
        match fs::remove_dir_all(self.root.join(&key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// Lists the immediate sub-folder names under a path prefix, used to
    /// enumerate users/datasets for the system virtual read-path.
    pub fn iterate_folders(&self, prefix: &[String]) -> Result<Vec<String>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            let key = Self::key_of(prefix)?;
            self.root.join(key)
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Accepts a segment only if it is exactly one normal path component:
/// no `..`, no absolute prefix, no embedded separators, no `.`. Everything
/// that turns a segment into a filesystem path — the meta tree here and
/// each dataset's objects tree — goes through this.
pub(crate) fn sanitize_segment(segment: &str) -> Result<String> {
    let s = segment.trim();
    if s.is_empty() {
        return Err(CoreError::validation("empty path segment"));
    }
    let mut components = Path::new(s).components();
    if !matches!(components.next(), Some(Component::Normal(_))) || components.next().is_some() {
        return Err(CoreError::validation(format!(
            "invalid path segment: {segment}"
        )));
    }
    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let path = seg(&["a", "b", "meta"]);
        store.write(&path, &StructuredValue::Int(5)).unwrap();
        assert_eq!(store.read(&path).unwrap(), StructuredValue::Int(5));
    }

    #[test]
    fn missing_entry_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.read(&seg(&["nope"])),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn update_writes_only_on_some() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let path = seg(&["counter"]);
        store
            .update(&path, |current| {
                assert!(current.is_none());
                Ok(Some(StructuredValue::Int(1)))
            })
            .unwrap();
        store
            .update(&path, |current| {
                assert_eq!(current, Some(StructuredValue::Int(1)));
                Ok(None)
            })
            .unwrap();
        assert_eq!(store.read(&path).unwrap(), StructuredValue::Int(1));
    }

    #[test]
    fn update_propagates_errors_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let path = seg(&["x"]);
        let result = store.update(&path, |_| Err(CoreError::validation("nope")));
        assert!(result.is_err());
        assert!(!store.exists(&path).unwrap());
    }

    #[test]
    fn rejects_parent_dir_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.read(&seg(&["..", "etc"])).is_err());
    }

    #[test]
    fn rejects_segments_with_embedded_separators() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.read(&seg(&["a/b"])).is_err());
        assert!(store.read(&seg(&["/absolute"])).is_err());
        assert!(store.read(&seg(&["."])).is_err());
    }

    #[test]
    fn concurrent_updates_to_same_path_serialize() {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let path = seg(&["shared"]);
        store.write(&path, &StructuredValue::Int(0)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let path = path.clone();
            handles.push(thread::spawn(move || {
                store
                    .update(&path, |current| {
                        let n = match current {
                            Some(StructuredValue::Int(n)) => n,
                            _ => 0,
                        };
                        Ok(Some(StructuredValue::Int(n + 1)))
                    })
                    .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.read(&path).unwrap(), StructuredValue::Int(16));
    }
}
