//! The attachment store. Two underlying stores — `attachments/blobs`
//! (raw bytes, keyed by hash) and `attachments/meta` (linker bookkeeping,
//! keyed by hash) — plus an in-process hold refcount table. An attachment
//! stays on disk while any dataset record links it or any in-flight
//! operation holds it.

use crate::blob_store::BlobStore;
use crate::error::{CoreError, Result};
use crate::file_store::FileStore;
use crate::hash::Hash;
use crate::lock::LockManager;
use crate::value::{HashUrl, StructuredValue};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Implemented by whatever layer can answer "what does the record at this
/// dataset path currently link to?" — the read-path resolver in
/// production, a stub in tests. Kept as a trait rather than a direct
/// dependency on the read-path resolver to avoid a cycle (it reads through
/// dataset meta, which does not need to know about attachment GC).
pub trait LinkResolver {
    /// Returns `None` if `path` no longer resolves to a record at all.
    fn resolve_links(&self, path: &str) -> Result<Option<Vec<HashUrl>>>;
}

#[derive(Debug, Clone, Default)]
pub struct AttachmentMeta {
    pub created: Option<chrono::DateTime<Utc>>,
    pub updated: Option<chrono::DateTime<Utc>>,
    pub linkers: HashSet<String>,
    pub extra: BTreeMap<String, StructuredValue>,
}

impl AttachmentMeta {
    fn to_value(&self) -> StructuredValue {
        let mut map = self.extra.clone();
        if let Some(c) = self.created {
            map.insert("created".to_string(), StructuredValue::Timestamp(c));
        }
        if let Some(u) = self.updated {
            map.insert("updated".to_string(), StructuredValue::Timestamp(u));
        }
        let mut linkers: Vec<String> = self.linkers.iter().cloned().collect();
        linkers.sort();
        map.insert(
            "linkers".to_string(),
            StructuredValue::Array(linkers.into_iter().map(StructuredValue::String).collect()),
        );
        StructuredValue::Mapping(map)
    }

    fn from_value(value: StructuredValue) -> Result<Self> {
        let mut map = value
            .as_mapping()
            .ok_or_else(|| CoreError::Codec("attachment meta must be a mapping".into()))?
            .clone();
        let created = match map.remove("created") {
            Some(StructuredValue::Timestamp(ts)) => Some(ts),
            _ => None,
        };
        let updated = match map.remove("updated") {
            Some(StructuredValue::Timestamp(ts)) => Some(ts),
            _ => None,
        };
        let linkers = match map.remove("linkers") {
            Some(StructuredValue::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => HashSet::new(),
        };
        Ok(AttachmentMeta {
            created,
            updated,
            linkers,
            extra: map,
        })
    }
}

pub struct AttachmentStore {
    blobs: BlobStore,
    meta: FileStore,
    /// One exclusive lock per attachment hash; every mutation (blob
    /// publish, meta update, delete) runs under it.
    locks: LockManager,
    holds: Mutex<std::collections::HashMap<Hash, u64>>,
    max_object_bytes: u64,
    hold_watchdog_secs: u64,
}

/// Returned by [`AttachmentStore::hold`]. Dropping it (or calling
/// [`HoldGuard::release`] explicitly) decrements the refcount exactly once;
/// the consuming `release` makes a second release unrepresentable.
pub struct HoldGuard<'a> {
    store: &'a AttachmentStore,
    hash: Hash,
    /// Shared with the watchdog thread, which logs if this is still false
    /// after the configured timeout.
    released_flag: Arc<AtomicBool>,
    released: bool,
}

impl std::fmt::Debug for HoldGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoldGuard")
            .field("hash", &self.hash)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl HoldGuard<'_> {
    pub fn release(mut self, resolver: &dyn LinkResolver) -> Result<bool> {
        self.released = true;
        self.released_flag.store(true, Ordering::Release);
        self.store.release(&self.hash, resolver)
    }
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort: a resolver isn't available in Drop, so a
            // dropped-without-release guard just decrements the refcount.
            // Validation (and possible deletion) happens the next time
            // someone calls `release` or `validate` explicitly.
            self.released_flag.store(true, Ordering::Release);
            let mut holds = self.store.holds.lock().expect("holds mutex poisoned");
            if let Some(count) = holds.get_mut(&self.hash) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    holds.remove(&self.hash);
                }
            }
        }
    }
}

/// Matches `AttachmentsConfig` defaults for callers that open a store
/// directly rather than through `PigeonOptics::open`.
const DEFAULT_MAX_OBJECT_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_HOLD_WATCHDOG_SECS: u64 = 10;

impl AttachmentStore {
    pub fn open(blobs_root: impl Into<std::path::PathBuf>, meta_root: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::open_with_limit(blobs_root, meta_root, DEFAULT_MAX_OBJECT_BYTES)
    }

    pub fn open_with_limit(
        blobs_root: impl Into<std::path::PathBuf>,
        meta_root: impl Into<std::path::PathBuf>,
        max_object_bytes: u64,
    ) -> Result<Self> {
        Ok(AttachmentStore {
            blobs: BlobStore::open(blobs_root)?,
            meta: FileStore::open(meta_root)?,
            locks: LockManager::new(),
            holds: Mutex::new(std::collections::HashMap::new()),
            max_object_bytes,
            hold_watchdog_secs: DEFAULT_HOLD_WATCHDOG_SECS,
        })
    }

    pub fn with_hold_watchdog_secs(mut self, secs: u64) -> Self {
        self.hold_watchdog_secs = secs;
        self
    }

    fn meta_key(hash: &Hash) -> Vec<String> {
        vec![hash.to_hex()]
    }

    pub fn has(&self, hash: &Hash) -> Result<bool> {
        Ok(self.blobs.exists(hash) && self.meta.exists(&Self::meta_key(hash))?)
    }

    pub fn read_meta(&self, hash: &Hash) -> Result<AttachmentMeta> {
        AttachmentMeta::from_value(self.meta.read(&Self::meta_key(hash))?)
    }

    pub fn read_stream(&self, hash: &Hash) -> Result<impl Read> {
        self.blobs.read_stream(hash)
    }

    /// Streams an attachment into the blob store, registers `linker` (the
    /// dataset-record path that references it) and merges `extra` into the
    /// persisted metadata. Idempotent: writing the same bytes again with a
    /// new linker just adds to the linker set.
    ///
    /// Returns the hash together with a [`HoldGuard`] already taken on it,
    /// so an attachment uploaded before any record references it can't be
    /// collected between the upload and the record write.
    pub fn write_stream<R: Read>(
        &self,
        reader: R,
        linker: Option<&str>,
        extra: BTreeMap<String, StructuredValue>,
    ) -> Result<(Hash, HoldGuard<'_>)> {
        let (hash, tmp) = self.blobs.stage_iter_capped(reader, self.max_object_bytes)?;
        let hold = self.hold(&hash);
        let _guard = self.locks.lock_one(&hash.to_hex());
        self.blobs.commit_staged(&hash, tmp)?;
        let key = Self::meta_key(&hash);
        let now = Utc::now();
        self.meta.update(&key, |current| {
            let mut meta = match current {
                Some(v) => AttachmentMeta::from_value(v)?,
                None => AttachmentMeta {
                    created: Some(now),
                    ..Default::default()
                },
            };
            if let Some(l) = linker {
                meta.linkers.insert(l.to_string());
            }
            meta.updated = Some(now);
            for (k, v) in extra {
                meta.extra.insert(k, v);
            }
            Ok(Some(meta.to_value()))
        })?;
        Ok((hash, hold))
    }

    /// Adds `data_paths` to an existing attachment's linker set. Fails if
    /// the attachment's metadata does not already exist.
    pub fn link(&self, hash: &Hash, data_paths: &[String]) -> Result<()> {
        let _guard = self.locks.lock_one(&hash.to_hex());
        let key = Self::meta_key(hash);
        let now = Utc::now();
        self.meta.update(&key, |current| {
            let Some(v) = current else {
                return Err(CoreError::not_found(format!("attachment {hash}")));
            };
            let mut meta = AttachmentMeta::from_value(v)?;
            for p in data_paths {
                meta.linkers.insert(p.clone());
            }
            meta.updated = Some(now);
            Ok(Some(meta.to_value()))
        })
    }

    /// Increments the process-wide hold refcount for `hash`. A background
    /// watchdog logs a warning if the hold outlives `hold_watchdog_secs`
    /// without being released; this is diagnostic only and never releases
    /// the hold itself.
    pub fn hold(&self, hash: &Hash) -> HoldGuard<'_> {
        let mut holds = self.holds.lock().expect("holds mutex poisoned");
        *holds.entry(*hash).or_insert(0) += 1;
        drop(holds);

        let released_flag = Arc::new(AtomicBool::new(false));
        let watchdog_secs = self.hold_watchdog_secs;
        if watchdog_secs > 0 {
            let flag = released_flag.clone();
            let hex = hash.to_hex();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(watchdog_secs));
                if !flag.load(Ordering::Acquire) {
                    tracing::warn!(
                        hash = %hex,
                        after_secs = watchdog_secs,
                        "attachment hold not released in time"
                    );
                }
            });
        }

        HoldGuard {
            store: self,
            hash: *hash,
            released_flag,
            released: false,
        }
    }

    fn release(&self, hash: &Hash, resolver: &dyn LinkResolver) -> Result<bool> {
        let should_validate = {
            let mut holds = self.holds.lock().expect("holds mutex poisoned");
            match holds.get_mut(hash) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let hit_zero = *count == 0;
                    if hit_zero {
                        holds.remove(hash);
                    }
                    hit_zero
                }
                None => true,
            }
        };
        if should_validate {
            self.validate(hash, resolver)
        } else {
            Ok(true)
        }
    }

    fn is_held(&self, hash: &Hash) -> bool {
        self.holds
            .lock()
            .expect("holds mutex poisoned")
            .contains_key(hash)
    }

    /// The GC oracle: re-resolves every recorded linker path through
    /// `resolver`, keeps only the ones that still reference this hash,
    /// and deletes the blob+meta once no linkers and no holds remain.
    /// Returns whether the attachment was retained.
    pub fn validate(&self, hash: &Hash, resolver: &dyn LinkResolver) -> Result<bool> {
        let _guard = self.locks.lock_one(&hash.to_hex());
        let key = Self::meta_key(hash);
        let mut retained = true;
        self.meta.update(&key, |current| {
            let Some(v) = current else {
                retained = false;
                return Ok(None);
            };
            let mut meta = AttachmentMeta::from_value(v)?;
            let mut survivors = HashSet::new();
            for linker in &meta.linkers {
                if let Some(links) = resolver.resolve_links(linker)? {
                    if links.iter().any(|l| l.hash_hex == hash.to_hex()) {
                        survivors.insert(linker.clone());
                    }
                }
            }
            meta.linkers = survivors;
            retained = !meta.linkers.is_empty();
            Ok(Some(meta.to_value()))
        })?;

        if !retained && !self.is_held(hash) {
            self.blobs.delete(hash)?;
            self.meta.delete(&key)?;
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct AlwaysEmpty;
    impl LinkResolver for AlwaysEmpty {
        fn resolve_links(&self, _path: &str) -> Result<Option<Vec<HashUrl>>> {
            Ok(None)
        }
    }

    struct StillLinked(String, Hash);
    impl LinkResolver for StillLinked {
        fn resolve_links(&self, path: &str) -> Result<Option<Vec<HashUrl>>> {
            if path == self.0 {
                Ok(Some(vec![HashUrl::new(self.1.to_hex(), None)]))
            } else {
                Ok(None)
            }
        }
    }

    fn store() -> (tempfile::TempDir, AttachmentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            AttachmentStore::open(dir.path().join("blobs"), dir.path().join("meta")).unwrap();
        (dir, store)
    }

    #[test]
    fn write_then_has_and_read() {
        let (_dir, store) = store();
        let (hash, _hold) = store
            .write_stream(Cursor::new(b"payload"), Some("p/u:n/1"), BTreeMap::new())
            .unwrap();
        assert!(store.has(&hash).unwrap());
        let meta = store.read_meta(&hash).unwrap();
        assert!(meta.linkers.contains("p/u:n/1"));
    }

    #[test]
    fn validate_drops_attachment_once_unlinked() {
        let (_dir, store) = store();
        let (hash, hold) = store
            .write_stream(Cursor::new(b"payload"), Some("p/u:n/1"), BTreeMap::new())
            .unwrap();
        drop(hold);
        let retained = store.validate(&hash, &AlwaysEmpty).unwrap();
        assert!(!retained);
        assert!(!store.has(&hash).unwrap());
    }

    #[test]
    fn validate_keeps_attachment_when_still_linked() {
        let (_dir, store) = store();
        let (hash, hold) = store
            .write_stream(Cursor::new(b"payload"), Some("p/u:n/1"), BTreeMap::new())
            .unwrap();
        drop(hold);
        let resolver = StillLinked("p/u:n/1".to_string(), hash);
        let retained = store.validate(&hash, &resolver).unwrap();
        assert!(retained);
        assert!(store.has(&hash).unwrap());
    }

    #[test]
    fn write_stream_rejects_blobs_over_the_configured_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            AttachmentStore::open_with_limit(dir.path().join("blobs"), dir.path().join("meta"), 4)
                .unwrap();
        let err = store
            .write_stream(Cursor::new(b"way too big"), None, BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::TooLarge { .. }));
    }

    #[test]
    fn write_streams_own_hold_prevents_deletion_until_released() {
        let (_dir, store) = store();
        let (hash, hold) = store
            .write_stream(Cursor::new(b"payload"), None, BTreeMap::new())
            .unwrap();
        store.validate(&hash, &AlwaysEmpty).unwrap();
        // No linkers, but the write's own hold keeps the blob on disk.
        assert!(store.blobs.exists(&hash));
        let retained = hold.release(&AlwaysEmpty).unwrap();
        assert!(!retained);
        assert!(!store.blobs.exists(&hash));
    }

    #[test]
    fn dropping_the_hold_decrements_without_validating() {
        let (_dir, store) = store();
        let (hash, hold) = store
            .write_stream(Cursor::new(b"payload"), None, BTreeMap::new())
            .unwrap();
        drop(hold);
        // Drop without release skips validation; the attachment survives
        // until someone validates it explicitly.
        assert!(store.has(&hash).unwrap());
        assert!(!store.validate(&hash, &AlwaysEmpty).unwrap());
        assert!(!store.has(&hash).unwrap());
    }
}
