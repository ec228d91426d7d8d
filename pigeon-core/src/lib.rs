//! Pigeon Optics core: a multi-tenant, versioned, content-addressed dataset
//! store with a derived-view (lens) layer.
//!
//! This crate owns the stores and never executes a lens map function
//! itself — that's delegated to whatever [`sandbox::Sandbox`] implementation
//! the embedder supplies (see the sibling sandbox crate).

pub mod attachment;
pub mod blob_store;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod error;
pub mod events;
pub mod file_store;
pub mod hash;
pub mod lock;
pub mod object_store;
pub mod path;
pub mod readpath;
pub mod sandbox;
pub mod validator;
pub mod value;

pub use error::{CoreError, Result};

use attachment::AttachmentStore;
use config::CoreConfig;
use dataset::lens::LensEngine;
use dataset::{DatasetLinkResolver, DatasetStore};
use events::EventBus;
use file_store::FileStore;
use hash::Hash;
use readpath::ReadPath;
use sandbox::Sandbox;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use validator::{NoopValidator, Validator};

/// Overrides the data root when no explicit path is given.
pub const ROOT_ENV_VAR: &str = "PIGEON_OPTICS_ROOT";

/// Bundles every store so an embedder constructs one object instead of
/// wiring them together by hand.
pub struct PigeonOptics {
    pub config: CoreConfig,
    pub attachments: Arc<AttachmentStore>,
    pub datasets: Arc<DatasetStore>,
    pub events: Arc<EventBus>,
    pub read_path: ReadPath,
    pub lenses: Arc<LensEngine>,
}

impl PigeonOptics {
    /// Resolves the data root: an explicit `root`, then `PIGEON_OPTICS_ROOT`,
    /// then the current directory.
    pub fn resolve_root(root: Option<PathBuf>) -> PathBuf {
        root.or_else(|| std::env::var_os(ROOT_ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Opens with no source-specific validation (`validateConfig`/
    /// `validateRecord` both accept anything).
    pub fn open(root: impl AsRef<Path>, sandbox: Arc<dyn Sandbox>) -> anyhow::Result<Self> {
        Self::open_with_validator(root, sandbox, Arc::new(NoopValidator))
    }

    pub fn open_with_validator(
        root: impl AsRef<Path>,
        sandbox: Arc<dyn Sandbox>,
        validator: Arc<dyn Validator>,
    ) -> anyhow::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let config = CoreConfig::load(root)?;

        let meta_store = Arc::new(FileStore::open(config.storage.data_path.clone())?);
        let attachments = Arc::new(
            AttachmentStore::open_with_limit(
                config.storage.attachments_path.join("blobs"),
                config.storage.attachments_path.join("meta"),
                config.attachments.max_object_bytes,
            )?
            .with_hold_watchdog_secs(config.attachments.hold_watchdog_secs),
        );
        let events = Arc::new(EventBus::with_capacity(config.events.queue_capacity));
        let datasets = Arc::new(DatasetStore::new(
            meta_store.clone(),
            config.storage.data_path.clone(),
            attachments.clone(),
            events.clone(),
            config.storage.paranoid,
            validator,
            config.datasets.validate_on_write,
        ));
        let read_path = ReadPath::new(datasets.clone(), meta_store);
        let lenses = Arc::new(LensEngine::new(
            datasets.clone(),
            sandbox,
            config.lenses.max_dirty_reruns,
        ));
        lenses.watch_all()?;
        // Weak, so the bus's listener doesn't keep the engine (and through
        // it the whole store graph, including the bus itself) alive forever.
        let engine = Arc::downgrade(&lenses);
        events.on(Box::new(move |path, version| {
            if let Some(engine) = engine.upgrade() {
                engine.on_path_updated(path, version);
            }
        }));

        Ok(PigeonOptics {
            config,
            attachments,
            datasets,
            events,
            read_path,
            lenses,
        })
    }

    /// Runs the attachment GC oracle for `hash` against the current dataset
    /// state. Intended for embedders that dropped a hold without a resolver
    /// on hand, and for CLI-style GC sweeps.
    pub fn validate_attachment(&self, hash: &Hash) -> Result<bool> {
        let resolver = DatasetLinkResolver {
            store: self.datasets.as_ref(),
        };
        self.attachments.validate(hash, &resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::{DependencyReader, SandboxOutcome};
    use value::StructuredValue;

    struct NoopSandbox;
    impl Sandbox for NoopSandbox {
        fn evaluate(
            &self,
            _map_function_source: &str,
            _record_id: &str,
            _record_value: &StructuredValue,
            _dependencies: &dyn DependencyReader,
        ) -> SandboxOutcome {
            SandboxOutcome::Ok {
                entries: Vec::new(),
                logs: Vec::new(),
            }
        }
    }

    #[test]
    fn open_creates_the_data_root_and_a_working_store() {
        let dir = tempfile::tempdir().unwrap();
        let core = PigeonOptics::open(dir.path(), Arc::new(NoopSandbox)).unwrap();
        let path = path::DatasetPath::new("src", "alice", "tweets");
        core.datasets.create(&path, Default::default()).unwrap();
        assert!(core.datasets.exists(&path).unwrap());
    }

    #[test]
    fn resolve_root_prefers_explicit_over_env() {
        let explicit = PathBuf::from("/explicit");
        assert_eq!(PigeonOptics::resolve_root(Some(explicit.clone())), explicit);
    }
}
