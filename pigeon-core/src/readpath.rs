//! The unified read-path resolver. Fans out across ordinary dataset
//! paths and the virtual `meta/system/system/<kind>` listing paths, without
//! ever letting the latter reach attachment or hash resolution — a system
//! path has no record hash, so `meta()` reports one with `hash: None`
//! instead of inventing a placeholder.

use crate::dataset::{DatasetStore, SOURCES};
use crate::error::{CoreError, Result};
use crate::file_store::FileStore;
use crate::path::DatasetPath;
use crate::value::{HashUrl, StructuredValue};
use std::sync::Arc;

const SYSTEM_PREFIX: &str = "meta/system/system/";

/// One resolved entry from [`ReadPath::meta`]. System paths carry no hash,
/// since they don't name a content-addressed record.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub path: String,
    pub links: Vec<HashUrl>,
    pub version: u64,
    pub hash: Option<String>,
}

/// `meta()` never aborts the batch on a single bad path; failures are
/// reported per-path instead.
#[derive(Debug, Clone)]
pub struct EntryError {
    pub path: String,
    pub error: String,
}

pub enum Resolved {
    Meta(EntryMeta),
    Error(EntryError),
}

pub struct ReadPath {
    datasets: Arc<DatasetStore>,
    meta_store: Arc<FileStore>,
}

/// The dataset meta store is keyed `[source, user, name]`; these mirror
/// that hierarchy one level at a time rather than inventing a flat "users"
/// concept the store doesn't actually have.
enum SystemKind {
    Sources,
    Users { source: String },
    Datasets { source: String, user: String },
}

impl ReadPath {
    pub fn new(datasets: Arc<DatasetStore>, meta_store: Arc<FileStore>) -> Self {
        ReadPath { datasets, meta_store }
    }

    fn parse_system(path: &str) -> Option<SystemKind> {
        let rest = path.strip_prefix(SYSTEM_PREFIX)?;
        let mut segments = rest.split('/');
        match segments.next()? {
            "sources" => Some(SystemKind::Sources),
            "users" => Some(SystemKind::Users {
                source: segments.next()?.to_string(),
            }),
            "datasets" => Some(SystemKind::Datasets {
                source: segments.next()?.to_string(),
                user: segments.next()?.to_string(),
            }),
            _ => None,
        }
    }

    pub fn is_system_path(path: &str) -> bool {
        path.starts_with(SYSTEM_PREFIX)
    }

    /// Resolves each path independently; a failure on one path does not
    /// stop the others from resolving. The sequence is lazy, so a consumer
    /// that stops early never pays for the remaining paths.
    pub fn meta<'a, I>(&'a self, paths: I) -> impl Iterator<Item = Resolved> + 'a
    where
        I: IntoIterator<Item = &'a str>,
        I::IntoIter: 'a,
    {
        paths.into_iter().map(move |path| match self.meta_one(path) {
            Ok(m) => Resolved::Meta(m),
            Err(e) => Resolved::Error(EntryError {
                path: path.to_string(),
                error: e.to_string(),
            }),
        })
    }

    fn meta_one(&self, path: &str) -> Result<EntryMeta> {
        if let Some(kind) = Self::parse_system(path) {
            let entries = self.list_system(kind)?;
            return Ok(EntryMeta {
                path: path.to_string(),
                links: Vec::new(),
                version: entries.len() as u64,
                hash: None,
            });
        }
        let decoded = DatasetPath::decode(path)?;
        let meta = self.datasets.read_meta(&decoded)?;
        let Some(record_id) = &decoded.record_id else {
            // A dataset-level path resolves to the dataset itself, which
            // has a version but no record hash.
            return Ok(EntryMeta {
                path: path.to_string(),
                links: Vec::new(),
                version: meta.version,
                hash: None,
            });
        };
        let record = meta
            .records
            .get(record_id)
            .ok_or_else(|| CoreError::not_found(format!("record {path}")))?;
        Ok(EntryMeta {
            path: path.to_string(),
            links: record.links.clone(),
            version: record.version,
            hash: Some(record.hash.to_hex()),
        })
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        if Self::is_system_path(path) {
            return Ok(true);
        }
        let decoded = DatasetPath::decode(path)?;
        match &decoded.record_id {
            Some(id) => match self.datasets.read_meta(&decoded) {
                Ok(meta) => Ok(meta.records.contains_key(id)),
                Err(CoreError::NotFound { .. }) => Ok(false),
                Err(e) => Err(e),
            },
            None => self.datasets.exists(&decoded),
        }
    }

    pub fn read(&self, path: &str) -> Result<StructuredValue> {
        if Self::is_system_path(path) {
            let kind = Self::parse_system(path)
                .ok_or_else(|| CoreError::validation(format!("malformed system path: {path}")))?;
            let entries = self.list_system(kind)?;
            return Ok(StructuredValue::Array(
                entries.into_iter().map(StructuredValue::string).collect(),
            ));
        }
        let decoded = DatasetPath::decode(path)?;
        self.datasets.read(&decoded)
    }

    fn list_system(&self, kind: SystemKind) -> Result<Vec<String>> {
        match kind {
            // Other trees share the data root (attachments, auth), so the
            // sources listing is the canonical pair filtered by presence,
            // not a raw directory listing.
            SystemKind::Sources => {
                let present = self.meta_store.iterate_folders(&[])?;
                Ok(SOURCES
                    .iter()
                    .map(|s| s.to_string())
                    .filter(|s| present.contains(s))
                    .collect())
            }
            SystemKind::Users { source } => self.meta_store.iterate_folders(&[source]),
            SystemKind::Datasets { source, user } => {
                self.meta_store.iterate_folders(&[source, user])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentStore;
    use crate::events::EventBus;
    use std::collections::BTreeMap;

    fn env() -> (tempfile::TempDir, ReadPath) {
        let dir = tempfile::tempdir().unwrap();
        let meta_store = Arc::new(FileStore::open(dir.path().join("data")).unwrap());
        let attachments = Arc::new(
            AttachmentStore::open(dir.path().join("att-blobs"), dir.path().join("att-meta")).unwrap(),
        );
        let events = Arc::new(EventBus::new());
        let datasets = Arc::new(DatasetStore::new(
            meta_store.clone(),
            dir.path().join("data"),
            attachments,
            events,
            false,
            Arc::new(crate::validator::NoopValidator),
            true,
        ));
        (dir, ReadPath::new(datasets, meta_store))
    }

    #[test]
    fn resolves_record_meta() {
        let (_dir, rp) = env();
        let path = DatasetPath::new("src", "alice", "tweets");
        rp.datasets.create(&path, BTreeMap::new()).unwrap();
        rp.datasets
            .write(&path.clone().with_record("1"), StructuredValue::string("hi"))
            .unwrap();

        let results: Vec<_> = rp.meta([path.with_record("1").encode().as_str()]).collect();
        assert_eq!(results.len(), 1);
        match &results[0] {
            Resolved::Meta(m) => assert!(m.hash.is_some()),
            Resolved::Error(_) => panic!("expected a resolved entry"),
        }
    }

    #[test]
    fn dataset_level_path_resolves_to_version_without_hash() {
        let (_dir, rp) = env();
        let path = DatasetPath::new("src", "alice", "tweets");
        rp.datasets.create(&path, BTreeMap::new()).unwrap();
        rp.datasets
            .write(&path.clone().with_record("1"), StructuredValue::Int(1))
            .unwrap();

        let results: Vec<_> = rp.meta([path.encode().as_str()]).collect();
        match &results[0] {
            Resolved::Meta(m) => {
                assert_eq!(m.version, 1);
                assert!(m.hash.is_none());
            }
            Resolved::Error(e) => panic!("unexpected error: {}", e.error),
        }
    }

    #[test]
    fn meta_reports_errors_per_path_without_aborting() {
        let (_dir, rp) = env();
        let results: Vec<_> = rp
            .meta(["pigeon-optics:/src/alice:missing/1", "not-a-path"])
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| matches!(r, Resolved::Error(_))));
    }

    #[test]
    fn system_path_has_no_hash() {
        let (_dir, rp) = env();
        let path = DatasetPath::new("src", "alice", "tweets");
        rp.datasets.create(&path, BTreeMap::new()).unwrap();

        let results: Vec<_> = rp.meta(["meta/system/system/sources"]).collect();
        match &results[0] {
            Resolved::Meta(m) => assert!(m.hash.is_none()),
            Resolved::Error(e) => panic!("unexpected error: {}", e.error),
        }
    }

    #[test]
    fn system_users_lists_user_folders_under_a_source() {
        let (_dir, rp) = env();
        let path = DatasetPath::new("src", "alice", "tweets");
        rp.datasets.create(&path, BTreeMap::new()).unwrap();

        let value = rp.read("meta/system/system/users/src").unwrap();
        let StructuredValue::Array(users) = value else {
            panic!("expected an array")
        };
        assert!(users.contains(&StructuredValue::string("alice")));
    }
}
