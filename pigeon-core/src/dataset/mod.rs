//! The dataset model. A dataset's metadata lives in the file store at
//! `[source, user, name, "meta"]`; its records' blobs live in a per-dataset
//! object store rooted at `[source, user, name, "objects"]`.
//!
//! `update_meta` is the pivotal primitive every mutation (`write_entries`,
//! `delete`) goes through: lock the dataset, read its current meta, let the
//! caller draft the next version, reconcile attachment holds against the
//! old and new link sets, write the new meta, unlock, then emit a
//! `pathUpdated` event.

pub mod lens;

use crate::attachment::{AttachmentStore, LinkResolver};
use crate::error::{CoreError, Result};
use crate::events::EventBus;
use crate::file_store::{sanitize_segment, FileStore};
use crate::hash::Hash;
use crate::object_store::ObjectStore;
use crate::path::DatasetPath;
use crate::validator::Validator;
use crate::value::{HashUrl, StructuredValue};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordMeta {
    pub hash: Hash,
    pub links: Vec<HashUrl>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetMeta {
    pub version: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub config: BTreeMap<String, StructuredValue>,
    /// Keyed by record id; `BTreeMap` gives sorted-by-natural-string-order
    /// iteration for free.
    pub records: BTreeMap<String, RecordMeta>,
}

impl DatasetMeta {
    fn new_empty(config: BTreeMap<String, StructuredValue>, now: DateTime<Utc>) -> Self {
        DatasetMeta {
            version: 0,
            created: now,
            updated: now,
            config,
            records: BTreeMap::new(),
        }
    }

    fn to_value(&self) -> StructuredValue {
        let mut map = BTreeMap::new();
        map.insert("version".to_string(), StructuredValue::Int(self.version as i64));
        map.insert("created".to_string(), StructuredValue::Timestamp(self.created));
        map.insert("updated".to_string(), StructuredValue::Timestamp(self.updated));
        map.insert("config".to_string(), StructuredValue::Mapping(self.config.clone()));
        let mut records = BTreeMap::new();
        for (id, rm) in &self.records {
            let mut r = BTreeMap::new();
            r.insert("hash".to_string(), StructuredValue::String(rm.hash.to_hex()));
            r.insert(
                "links".to_string(),
                StructuredValue::Array(
                    rm.links.iter().map(|l| StructuredValue::String(l.to_uri())).collect(),
                ),
            );
            r.insert("version".to_string(), StructuredValue::Int(rm.version as i64));
            records.insert(id.clone(), StructuredValue::Mapping(r));
        }
        map.insert("records".to_string(), StructuredValue::Mapping(records));
        StructuredValue::Mapping(map)
    }

    fn from_value(value: StructuredValue) -> Result<Self> {
        let map = value
            .as_mapping()
            .ok_or_else(|| CoreError::Codec("dataset meta must be a mapping".into()))?;
        let version = match map.get("version") {
            Some(StructuredValue::Int(i)) => *i as u64,
            _ => return Err(CoreError::Codec("dataset meta missing version".into())),
        };
        let created = match map.get("created") {
            Some(StructuredValue::Timestamp(ts)) => *ts,
            _ => Utc::now(),
        };
        let updated = match map.get("updated") {
            Some(StructuredValue::Timestamp(ts)) => *ts,
            _ => created,
        };
        let config = match map.get("config") {
            Some(StructuredValue::Mapping(m)) => m.clone(),
            _ => BTreeMap::new(),
        };
        let mut records = BTreeMap::new();
        if let Some(StructuredValue::Mapping(rmap)) = map.get("records") {
            for (id, v) in rmap {
                let rm = v
                    .as_mapping()
                    .ok_or_else(|| CoreError::Codec("record meta must be a mapping".into()))?;
                let hash = match rm.get("hash") {
                    Some(StructuredValue::String(s)) => Hash::from_hex(s)?,
                    _ => return Err(CoreError::Codec("record missing hash".into())),
                };
                let links = match rm.get("links") {
                    Some(StructuredValue::Array(items)) => items
                        .iter()
                        .filter_map(|v| v.as_str().and_then(HashUrl::parse))
                        .collect(),
                    _ => Vec::new(),
                };
                let rversion = match rm.get("version") {
                    Some(StructuredValue::Int(i)) => *i as u64,
                    _ => version,
                };
                records.insert(
                    id.clone(),
                    RecordMeta {
                        hash,
                        links,
                        version: rversion,
                    },
                );
            }
        }
        Ok(DatasetMeta {
            version,
            created,
            updated,
            config,
            records,
        })
    }

    /// Every hash currently referenced by a record, used to seed the
    /// object-store GC retain set before a mutation is applied.
    pub fn record_hashes(&self) -> std::collections::HashSet<Hash> {
        self.records.values().map(|r| r.hash).collect()
    }
}

/// The two dataset families. Anything else under the data root
/// (attachments, auth, config) is not a source.
pub const SOURCES: [&str; 2] = ["datasets", "lenses"];

pub struct DatasetStore {
    meta_store: Arc<FileStore>,
    data_root: std::path::PathBuf,
    attachments: Arc<AttachmentStore>,
    events: Arc<EventBus>,
    paranoid: bool,
    validator: Arc<dyn Validator>,
    validate_on_write: bool,
}

impl DatasetStore {
    pub fn new(
        meta_store: Arc<FileStore>,
        data_root: impl Into<std::path::PathBuf>,
        attachments: Arc<AttachmentStore>,
        events: Arc<EventBus>,
        paranoid: bool,
        validator: Arc<dyn Validator>,
        validate_on_write: bool,
    ) -> Self {
        DatasetStore {
            meta_store,
            data_root: data_root.into(),
            attachments,
            events,
            paranoid,
            validator,
            validate_on_write,
        }
    }

    fn meta_key(path: &DatasetPath) -> Vec<String> {
        let [s, u, n] = path.dataset_key();
        vec![s, u, n, "meta".to_string()]
    }

    /// `<data_root>/<source>/<user>/<name>/objects`, next to that dataset's
    /// `meta.cbor`. Segments pass the same traversal guard as the meta
    /// tree's keys, so a hostile path errors here before any directory is
    /// created for it.
    fn objects_root_for(&self, path: &DatasetPath) -> Result<std::path::PathBuf> {
        let [s, u, n] = path.dataset_key();
        let mut root = self.data_root.clone();
        for segment in [s, u, n] {
            root.push(sanitize_segment(&segment)?);
        }
        root.push("objects");
        Ok(root)
    }

    fn object_store_for(&self, path: &DatasetPath) -> Result<ObjectStore> {
        ObjectStore::open(self.objects_root_for(path)?, self.paranoid)
    }

    pub fn exists(&self, path: &DatasetPath) -> Result<bool> {
        self.meta_store.exists(&Self::meta_key(path))
    }

    pub fn create(&self, path: &DatasetPath, config: BTreeMap<String, StructuredValue>) -> Result<()> {
        let key = Self::meta_key(path);
        if self.meta_store.exists(&key)? {
            return Err(CoreError::already_exists(format!("dataset {path}")));
        }
        if self.validate_on_write {
            self.validator.validate_config(path, &config)?;
        }
        let now = Utc::now();
        let meta = DatasetMeta::new_empty(config, now);
        self.meta_store.write(&key, &meta.to_value())?;
        self.events
            .emit(format!("meta/system/system/{}", path.source), meta.version);
        self.events.emit(path.encode(), meta.version);
        Ok(())
    }

    pub fn read_meta(&self, path: &DatasetPath) -> Result<DatasetMeta> {
        let key = Self::meta_key(path);
        match self.meta_store.read(&key) {
            Ok(v) => DatasetMeta::from_value(v),
            Err(CoreError::NotFound { .. }) => Err(CoreError::not_found(format!("dataset {path}"))),
            Err(e) => Err(e),
        }
    }

    /// The pivotal primitive: locks the dataset's meta entry, reads the
    /// current state, hands a draft (version + 1, updated = now) to `block`,
    /// validates the result, retains the referenced object hashes (old and
    /// new) against GC, writes the result, and emits `pathUpdated` once
    /// unlocked.
    pub fn update_meta<F>(&self, path: &DatasetPath, block: F) -> Result<DatasetMeta>
    where
        F: FnOnce(&mut DatasetMeta) -> Result<()>,
    {
        let key = Self::meta_key(path);
        let object_store = self.object_store_for(path)?;
        let mut result_meta: Option<DatasetMeta> = None;

        self.meta_store.update(&key, |current| {
            let current = match current {
                Some(v) => DatasetMeta::from_value(v)?,
                None => return Err(CoreError::not_found(format!("dataset {path}"))),
            };
            let retain_set = current.record_hashes();

            let mut draft = current.clone();
            draft.version = current.version + 1;
            draft.updated = Utc::now();
            let mut outcome = block(&mut draft);
            if outcome.is_ok() {
                let draft_version = draft.version;
                for rm in draft.records.values_mut() {
                    if rm.version == 0 {
                        rm.version = draft_version;
                    }
                }
                if self.validate_on_write {
                    outcome = self.validator.validate_config(path, &draft.config);
                }
            }

            // Retain runs whether or not the block succeeded: objects it
            // wrote before failing must not survive unreferenced past the
            // next committed version.
            let new_hashes = draft.record_hashes();
            let keep: std::collections::HashSet<Hash> =
                retain_set.union(&new_hashes).cloned().collect();
            object_store.retain(&keep)?;
            outcome?;

            result_meta = Some(draft.clone());
            Ok(Some(draft.to_value()))
        })?;

        let meta = result_meta.ok_or_else(|| CoreError::not_found(format!("dataset {path}")))?;
        // The event names the dataset, not the record a caller happened to
        // route the mutation through.
        let dataset_path = DatasetPath::new(&*path.source, &*path.user, &*path.name);
        self.events.emit(dataset_path.encode(), meta.version);
        Ok(meta)
    }

    pub fn read(&self, path: &DatasetPath) -> Result<StructuredValue> {
        let record_id = path
            .record_id
            .as_ref()
            .ok_or_else(|| CoreError::validation("read requires a record id"))?;
        let meta = self.read_meta(path)?;
        let record = meta
            .records
            .get(record_id)
            .ok_or_else(|| CoreError::not_found(format!("record {path}")))?;
        self.object_store_for(path)?.read(&record.hash)
    }

    pub fn write(&self, path: &DatasetPath, value: StructuredValue) -> Result<DatasetMeta> {
        let record_id = path
            .record_id
            .clone()
            .ok_or_else(|| CoreError::validation("write requires a record id"))?;
        let mut entries = BTreeMap::new();
        entries.insert(record_id, Some(value));
        self.write_entries(path, entries, false)
    }

    /// `merge`: keeps existing records not named in `entries`.
    pub fn merge(&self, path: &DatasetPath, entries: BTreeMap<String, Option<StructuredValue>>) -> Result<DatasetMeta> {
        self.write_entries(path, entries, false)
    }

    /// `overwrite`: removes any existing record not named in `entries`.
    pub fn overwrite(&self, path: &DatasetPath, entries: BTreeMap<String, Option<StructuredValue>>) -> Result<DatasetMeta> {
        self.write_entries(path, entries, true)
    }

    /// Writes (or, for `None` values, deletes) a batch of records. Every
    /// value's `hash://sha256/...` links must already `has()` in the
    /// attachment store, or the whole batch is rejected with
    /// `MISSING_ATTACHMENTS`. Each written record's path is registered as a
    /// linker on every attachment it references, before the record write
    /// commits, so `AttachmentStore::validate` can tell a live reference
    /// from an orphan later.
    pub fn write_entries(
        &self,
        path: &DatasetPath,
        entries: BTreeMap<String, Option<StructuredValue>>,
        overwrite: bool,
    ) -> Result<DatasetMeta> {
        // Attachment-existence check happens before the dataset lock is
        // taken, so a batch with a dangling link fails before anything
        // commits.
        let mut missing = Vec::new();
        for value in entries.values().flatten() {
            for link in value.list_hash_urls() {
                let hash = Hash::from_hex(&link.hash_hex)?;
                if !self.attachments.has(&hash)? {
                    missing.push(link.to_uri());
                }
            }
        }
        if !missing.is_empty() {
            return Err(CoreError::missing_attachments(missing));
        }

        if self.validate_on_write {
            for (id, value) in entries.iter() {
                if let Some(v) = value {
                    self.validator.validate_record(path, id, v)?;
                }
            }
        }

        let object_store = self.object_store_for(path)?;
        self.update_meta(path, move |draft| {
            if overwrite {
                draft.records.retain(|id, _| entries.contains_key(id));
            }
            for (id, value) in &entries {
                match value {
                    None => {
                        draft.records.remove(id);
                    }
                    Some(v) => {
                        let links = v.list_hash_urls();
                        let hash = object_store.write(v)?;
                        // An unchanged hash keeps the existing RecordMeta
                        // (and its version); only new or changed records
                        // re-register linkers and take the draft version.
                        if draft.records.get(id).map(|r| r.hash) == Some(hash) {
                            continue;
                        }
                        let record_path = path.clone().with_record(id.clone()).encode();
                        for link in &links {
                            let attachment_hash = Hash::from_hex(&link.hash_hex)?;
                            self.attachments.link(&attachment_hash, &[record_path.clone()])?;
                        }
                        draft.records.insert(
                            id.clone(),
                            RecordMeta {
                                hash,
                                links,
                                version: 0,
                            },
                        );
                    }
                }
            }
            Ok(())
        })
    }

    pub fn delete(&self, path: &DatasetPath) -> Result<DatasetMeta> {
        match &path.record_id {
            Some(id) => {
                let id = id.clone();
                self.update_meta(path, move |draft| {
                    draft.records.remove(&id);
                    Ok(())
                })
            }
            None => {
                // Whole-dataset deletion drops the dataset's subtree (meta
                // and objects both live under it) outright. Attachment
                // linkers pointing into the deleted dataset go stale; the
                // GC oracle prunes them on its next validate pass.
                let meta = self.read_meta(path)?;
                let [s, u, n] = path.dataset_key();
                self.meta_store.delete_subtree(&[s, u, n])?;
                // Deleting the whole dataset changes the system listings,
                // not a record inside this dataset; the deviation from the
                // original's mismatched event path/argument pairing is
                // resolved by emitting a dedicated system-listing event.
                self.events
                    .emit(format!("meta/system/system/{}", path.source), meta.version);
                Ok(meta)
            }
        }
    }

    /// Enumerates every dataset known to the meta store, across all sources
    /// and users. A folder only counts once a `meta.cbor` exists under it,
    /// which keeps the non-dataset trees sharing the data root
    /// (attachments, auth) out of the listing. Used to re-register lens
    /// watchers after a restart.
    pub fn enumerate(&self) -> Result<Vec<DatasetPath>> {
        let mut out = Vec::new();
        for source in self.meta_store.iterate_folders(&[])? {
            for user in self.meta_store.iterate_folders(&[source.clone()])? {
                for name in self
                    .meta_store
                    .iterate_folders(&[source.clone(), user.clone()])?
                {
                    let path = DatasetPath::new(source.clone(), user.clone(), name);
                    if self.exists(&path)? {
                        out.push(path);
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn list(&self, path: &DatasetPath) -> Result<Vec<String>> {
        Ok(self.read_meta(path)?.records.keys().cloned().collect())
    }

    /// Lazily yields `(record_id, RecordMeta)` in record-id order; the
    /// consumer may stop early.
    pub fn iterate(&self, path: &DatasetPath) -> Result<impl Iterator<Item = (String, RecordMeta)>> {
        Ok(self.read_meta(path)?.records.into_iter())
    }
}

/// Lets the attachment GC oracle ask "what does this dataset record
/// currently link to" without the attachment store depending on this module
/// directly.
pub struct DatasetLinkResolver<'a> {
    pub store: &'a DatasetStore,
}

impl<'a> LinkResolver for DatasetLinkResolver<'a> {
    fn resolve_links(&self, path: &str) -> Result<Option<Vec<HashUrl>>> {
        let decoded = match DatasetPath::decode(path) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        let Some(record_id) = &decoded.record_id else {
            return Ok(None);
        };
        match self.store.read_meta(&decoded) {
            Ok(meta) => Ok(meta.records.get(record_id).map(|r| r.links.clone())),
            Err(CoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
