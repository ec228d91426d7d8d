//! The lens engine. A lens is a dataset whose records are derived from
//! one or more input datasets by running a sandboxed map function once per
//! changed input record. Builds are serialized per lens and a build
//! requested while one is already running coalesces into a single rerun
//! once the in-flight build finishes, rather than queuing one rerun per
//! request.

use super::{DatasetMeta, DatasetStore};
use crate::error::{CoreError, Result};
use crate::lock::LockManager;
use crate::path::DatasetPath;
use crate::sandbox::{DependencyReader, Sandbox, SandboxOutcome};
use crate::value::StructuredValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

const CONFIG_KEY: &str = "lens";

/// A lens's declared shape, round-tripped through `DatasetMeta.config["lens"]`
/// so a lens is, at rest, an ordinary dataset with one reserved config entry.
#[derive(Debug, Clone, Default)]
struct LensConfig {
    map_function_source: String,
    inputs: Vec<DatasetPath>,
    dependencies: BTreeMap<String, DatasetPath>,
    /// Per input path, the record-id -> hash-hex snapshot as of the last
    /// build that processed it.
    last_processed: BTreeMap<String, BTreeMap<String, String>>,
    /// Per input path, the input dataset version as of the last build.
    /// `pathUpdated` events at or below this version are ignored.
    last_processed_version: BTreeMap<String, u64>,
    /// Per emitted output record id, the set of `"<inputPath>#<recordID>"`
    /// producer keys currently responsible for it.
    output_producers: BTreeMap<String, Vec<String>>,
    build_log: Vec<String>,
}

impl LensConfig {
    fn to_value(&self) -> StructuredValue {
        let mut map = BTreeMap::new();
        map.insert(
            "mapFunctionSource".to_string(),
            StructuredValue::string(self.map_function_source.clone()),
        );
        map.insert(
            "inputs".to_string(),
            StructuredValue::Array(
                self.inputs
                    .iter()
                    .map(|p| StructuredValue::string(p.encode()))
                    .collect(),
            ),
        );
        let mut deps = BTreeMap::new();
        for (name, path) in &self.dependencies {
            deps.insert(name.clone(), StructuredValue::string(path.encode()));
        }
        map.insert("dependencies".to_string(), StructuredValue::Mapping(deps));

        let mut last_processed = BTreeMap::new();
        for (input_path, snapshot) in &self.last_processed {
            let mut inner = BTreeMap::new();
            for (id, hash) in snapshot {
                inner.insert(id.clone(), StructuredValue::string(hash.clone()));
            }
            last_processed.insert(input_path.clone(), StructuredValue::Mapping(inner));
        }
        map.insert("lastProcessed".to_string(), StructuredValue::Mapping(last_processed));

        let mut last_versions = BTreeMap::new();
        for (input_path, version) in &self.last_processed_version {
            last_versions.insert(input_path.clone(), StructuredValue::Int(*version as i64));
        }
        map.insert(
            "lastProcessedVersion".to_string(),
            StructuredValue::Mapping(last_versions),
        );

        let mut producers = BTreeMap::new();
        for (output_id, keys) in &self.output_producers {
            producers.insert(
                output_id.clone(),
                StructuredValue::Array(keys.iter().cloned().map(StructuredValue::string).collect()),
            );
        }
        map.insert("outputProducers".to_string(), StructuredValue::Mapping(producers));
        map.insert(
            "buildLog".to_string(),
            StructuredValue::Array(self.build_log.iter().cloned().map(StructuredValue::string).collect()),
        );
        StructuredValue::Mapping(map)
    }

    fn from_value(value: Option<&StructuredValue>) -> Result<Self> {
        let Some(map) = value.and_then(|v| v.as_mapping()) else {
            return Ok(LensConfig::default());
        };
        let map_function_source = map
            .get("mapFunctionSource")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let inputs = match map.get("inputs") {
            Some(StructuredValue::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().and_then(|s| DatasetPath::decode(s).ok()))
                .collect(),
            _ => Vec::new(),
        };
        let dependencies = match map.get("dependencies") {
            Some(StructuredValue::Mapping(m)) => m
                .iter()
                .filter_map(|(k, v)| {
                    v.as_str()
                        .and_then(|s| DatasetPath::decode(s).ok())
                        .map(|p| (k.clone(), p))
                })
                .collect(),
            _ => BTreeMap::new(),
        };
        let last_processed = match map.get("lastProcessed") {
            Some(StructuredValue::Mapping(m)) => m
                .iter()
                .map(|(input_path, v)| {
                    let inner = match v {
                        StructuredValue::Mapping(inner) => inner
                            .iter()
                            .filter_map(|(id, h)| h.as_str().map(|h| (id.clone(), h.to_string())))
                            .collect(),
                        _ => BTreeMap::new(),
                    };
                    (input_path.clone(), inner)
                })
                .collect(),
            _ => BTreeMap::new(),
        };
        let last_processed_version = match map.get("lastProcessedVersion") {
            Some(StructuredValue::Mapping(m)) => m
                .iter()
                .filter_map(|(input_path, v)| match v {
                    StructuredValue::Int(i) => Some((input_path.clone(), *i as u64)),
                    _ => None,
                })
                .collect(),
            _ => BTreeMap::new(),
        };
        let output_producers = match map.get("outputProducers") {
            Some(StructuredValue::Mapping(m)) => m
                .iter()
                .map(|(output_id, v)| {
                    let keys = match v {
                        StructuredValue::Array(items) => {
                            items.iter().filter_map(|i| i.as_str().map(String::from)).collect()
                        }
                        _ => Vec::new(),
                    };
                    (output_id.clone(), keys)
                })
                .collect(),
            _ => BTreeMap::new(),
        };
        let build_log = match map.get("buildLog") {
            Some(StructuredValue::Array(items)) => {
                items.iter().filter_map(|v| v.as_str().map(String::from)).collect()
            }
            _ => Vec::new(),
        };
        Ok(LensConfig {
            map_function_source,
            inputs,
            dependencies,
            last_processed,
            last_processed_version,
            output_producers,
            build_log,
        })
    }
}

/// Describes a new lens to [`LensEngine::create`].
pub struct LensSpec {
    pub map_function_source: String,
    pub inputs: Vec<DatasetPath>,
    pub dependencies: BTreeMap<String, DatasetPath>,
}

pub struct LensEngine {
    datasets: Arc<DatasetStore>,
    sandbox: Arc<dyn Sandbox>,
    build_locks: LockManager,
    dirty: Mutex<HashSet<String>>,
    /// Input dataset path -> the lens paths watching it, fed by
    /// [`LensEngine::on_path_updated`].
    watchers: Mutex<HashMap<String, HashSet<String>>>,
    max_dirty_reruns: u32,
}

struct LensDependencyReader<'a> {
    datasets: &'a DatasetStore,
    dependencies: &'a BTreeMap<String, DatasetPath>,
}

impl DependencyReader for LensDependencyReader<'_> {
    fn read(&self, dependency_name: &str) -> Result<Option<StructuredValue>> {
        let Some(path) = self.dependencies.get(dependency_name) else {
            return Ok(None);
        };
        match self.datasets.iterate(path) {
            Ok(records) => {
                let object_store = self.datasets.object_store_for(path)?;
                let mut out = BTreeMap::new();
                for (id, record) in records {
                    out.insert(id, object_store.read(&record.hash)?);
                }
                Ok(Some(StructuredValue::Mapping(out)))
            }
            Err(CoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl LensEngine {
    pub fn new(datasets: Arc<DatasetStore>, sandbox: Arc<dyn Sandbox>, max_dirty_reruns: u32) -> Self {
        LensEngine {
            datasets,
            sandbox,
            build_locks: LockManager::new(),
            dirty: Mutex::new(HashSet::new()),
            watchers: Mutex::new(HashMap::new()),
            max_dirty_reruns,
        }
    }

    pub fn create(&self, path: &DatasetPath, spec: LensSpec) -> Result<DatasetMeta> {
        let config = LensConfig {
            map_function_source: spec.map_function_source,
            inputs: spec.inputs.clone(),
            dependencies: spec.dependencies,
            last_processed: BTreeMap::new(),
            last_processed_version: BTreeMap::new(),
            output_producers: BTreeMap::new(),
            build_log: Vec::new(),
        };
        let mut root = BTreeMap::new();
        root.insert(CONFIG_KEY.to_string(), config.to_value());
        self.datasets.create(path, root)?;
        self.register_watchers(path, &spec.inputs);
        self.build(path)
    }

    /// Re-registers every lens found in the meta store. Called once on
    /// open, so lenses created in previous process runs stay change-driven.
    pub fn watch_all(&self) -> Result<()> {
        for path in self.datasets.enumerate()? {
            let meta = match self.datasets.read_meta(&path) {
                Ok(m) => m,
                Err(CoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if meta.config.contains_key(CONFIG_KEY) {
                let config = LensConfig::from_value(meta.config.get(CONFIG_KEY))?;
                self.register_watchers(&path, &config.inputs);
            }
        }
        Ok(())
    }

    fn register_watchers(&self, lens_path: &DatasetPath, inputs: &[DatasetPath]) {
        let lens_key = lens_path.encode();
        let mut watchers = self.watchers.lock().expect("lens watchers mutex poisoned");
        for input in inputs {
            watchers
                .entry(input.encode())
                .or_default()
                .insert(lens_key.clone());
        }
    }

    fn unwatch(&self, lens_key: &str) {
        let mut watchers = self.watchers.lock().expect("lens watchers mutex poisoned");
        for lenses in watchers.values_mut() {
            lenses.remove(lens_key);
        }
        watchers.retain(|_, lenses| !lenses.is_empty());
    }

    /// The event-bus entry point: a `pathUpdated(input, version)` wakes every
    /// lens watching that input. Events at or below the input version the
    /// lens last processed are ignored, so a build is attempted at most once
    /// per input version. A lens already mid-build just has its dirty flag
    /// set; the in-flight build reruns before releasing its slot.
    pub fn on_path_updated(&self, input_path: &str, version: u64) {
        let lens_keys: Vec<String> = {
            let watchers = self.watchers.lock().expect("lens watchers mutex poisoned");
            match watchers.get(input_path) {
                Some(lenses) => lenses.iter().cloned().collect(),
                None => return,
            }
        };
        for lens_key in lens_keys {
            let Ok(lens_path) = DatasetPath::decode(&lens_key) else {
                continue;
            };
            match self.last_processed_version(&lens_path, input_path) {
                Ok(Some(stored)) if version <= stored => continue,
                Ok(_) => {}
                Err(CoreError::NotFound { .. }) => {
                    self.unwatch(&lens_key);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(lens = %lens_key, error = %e, "skipping lens wake-up");
                    continue;
                }
            }
            self.mark_dirty(&lens_path);
            if let Some(_guard) = self.build_locks.try_lock_one(&lens_key) {
                if let Err(e) = self.build_locked(&lens_path) {
                    tracing::warn!(lens = %lens_key, error = %e, "event-driven lens build failed");
                }
            }
        }
    }

    fn last_processed_version(&self, lens_path: &DatasetPath, input_key: &str) -> Result<Option<u64>> {
        let meta = self.datasets.read_meta(lens_path)?;
        let config = LensConfig::from_value(meta.config.get(CONFIG_KEY))?;
        Ok(config.last_processed_version.get(input_key).copied())
    }

    /// Marks `path` for a rerun once any build currently in flight for it
    /// finishes, instead of racing a second build against the first.
    pub fn mark_dirty(&self, path: &DatasetPath) {
        self.dirty
            .lock()
            .expect("lens dirty-flags mutex poisoned")
            .insert(path.encode());
    }

    fn clear_dirty(&self, key: &str) {
        self.dirty
            .lock()
            .expect("lens dirty-flags mutex poisoned")
            .remove(key);
    }

    fn is_dirty(&self, key: &str) -> bool {
        self.dirty
            .lock()
            .expect("lens dirty-flags mutex poisoned")
            .contains(key)
    }

    /// Runs at most one build immediately, then as many additional builds as
    /// were requested (via [`LensEngine::mark_dirty`]) while it ran, up to
    /// `max_dirty_reruns`.
    pub fn build(&self, path: &DatasetPath) -> Result<DatasetMeta> {
        let key = path.encode();
        let _build_guard = self.build_locks.lock_one(&key);
        self.build_locked(path)
    }

    fn build_locked(&self, path: &DatasetPath) -> Result<DatasetMeta> {
        let key = path.encode();
        let mut reruns = 0;
        loop {
            self.clear_dirty(&key);
            let last = self.run_build_once(path)?;
            if reruns >= self.max_dirty_reruns || !self.is_dirty(&key) {
                return Ok(last);
            }
            reruns += 1;
        }
    }

    fn run_build_once(&self, path: &DatasetPath) -> Result<DatasetMeta> {
        let meta = self.datasets.read_meta(path)?;
        let old_config_value = meta.config.get(CONFIG_KEY).cloned();
        let mut config = LensConfig::from_value(old_config_value.as_ref())?;
        config.build_log.clear();

        let mut emitted: BTreeMap<String, StructuredValue> = BTreeMap::new();

        for input_path in config.inputs.clone() {
            let input_key = input_path.encode();
            let (current_snapshot, input_version): (BTreeMap<String, String>, u64) =
                match self.datasets.read_meta(&input_path) {
                    Ok(input_meta) => (
                        input_meta
                            .records
                            .iter()
                            .map(|(id, r)| (id.clone(), r.hash.to_hex()))
                            .collect(),
                        input_meta.version,
                    ),
                    Err(CoreError::NotFound { .. }) => (BTreeMap::new(), 0),
                    Err(e) => return Err(e),
                };
            let previous_snapshot = config
                .last_processed
                .get(&input_key)
                .cloned()
                .unwrap_or_default();

            let mut changed_ids: HashSet<String> = HashSet::new();
            for (id, hash) in &current_snapshot {
                if previous_snapshot.get(id) != Some(hash) {
                    changed_ids.insert(id.clone());
                }
            }
            for id in previous_snapshot.keys() {
                if !current_snapshot.contains_key(id) {
                    changed_ids.insert(id.clone());
                }
            }

            for record_id in changed_ids {
                let producer_key = format!("{input_key}#{record_id}");
                for producers in config.output_producers.values_mut() {
                    producers.retain(|p| p != &producer_key);
                }

                if current_snapshot.contains_key(&record_id) {
                    let value = self.datasets.read(&input_path.clone().with_record(&record_id))?;
                    let dependency_reader = LensDependencyReader {
                        datasets: &self.datasets,
                        dependencies: &config.dependencies,
                    };
                    let outcome = self.sandbox.evaluate(
                        &config.map_function_source,
                        &record_id,
                        &value,
                        &dependency_reader,
                    );
                    match outcome {
                        SandboxOutcome::Ok { entries, logs } => {
                            for (output_id, output_value) in entries {
                                emitted.insert(output_id.clone(), output_value);
                                config
                                    .output_producers
                                    .entry(output_id)
                                    .or_default()
                                    .push(producer_key.clone());
                            }
                            config.build_log.extend(logs);
                        }
                        SandboxOutcome::Err { message, stack } => {
                            config.build_log.push(format!(
                                "{producer_key}: {message}{}",
                                stack.map(|s| format!("\n{s}")).unwrap_or_default()
                            ));
                        }
                    }
                }
            }

            config.last_processed.insert(input_key.clone(), current_snapshot);
            config.last_processed_version.insert(input_key, input_version);
        }

        config.output_producers.retain(|_, producers| !producers.is_empty());
        let orphaned: Vec<String> = meta
            .records
            .keys()
            .filter(|id| !emitted.contains_key(*id) && !config.output_producers.contains_key(*id))
            .cloned()
            .collect();

        let mut entries: BTreeMap<String, Option<StructuredValue>> = BTreeMap::new();
        for (id, value) in emitted {
            entries.insert(id, Some(value));
        }
        for id in orphaned {
            entries.insert(id, None);
        }
        let had_entries = !entries.is_empty();
        if had_entries {
            self.datasets.write_entries(path, entries, false)?;
        }

        let new_config_value = config.to_value();
        if !had_entries && Some(&new_config_value) == old_config_value.as_ref() {
            return self.datasets.read_meta(path);
        }

        self.datasets.update_meta(path, |draft| {
            draft.config.insert(CONFIG_KEY.to_string(), new_config_value.clone());
            Ok(())
        })
    }
}
