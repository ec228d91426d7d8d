//! End-to-end scenarios spanning more than one store, exercised through
//! [`PigeonOptics`] the way an embedder would rather than through a single
//! module's internal API.

use pigeon_core::dataset::lens::LensSpec;
use pigeon_core::dataset::DatasetLinkResolver;
use pigeon_core::hash::object_hash;
use pigeon_core::path::DatasetPath;
use pigeon_core::sandbox::{DependencyReader, Sandbox, SandboxOutcome};
use pigeon_core::value::StructuredValue;
use pigeon_core::PigeonOptics;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct NoopSandbox;
impl Sandbox for NoopSandbox {
    fn evaluate(
        &self,
        _map_function_source: &str,
        _record_id: &str,
        _record_value: &StructuredValue,
        _dependencies: &dyn DependencyReader,
    ) -> SandboxOutcome {
        SandboxOutcome::Ok { entries: Vec::new(), logs: Vec::new() }
    }
}

struct DoublingSandbox;
impl Sandbox for DoublingSandbox {
    fn evaluate(
        &self,
        _map_function_source: &str,
        record_id: &str,
        record_value: &StructuredValue,
        _dependencies: &dyn DependencyReader,
    ) -> SandboxOutcome {
        let StructuredValue::Int(n) = record_value else {
            return SandboxOutcome::Err { message: "expected an integer".to_string(), stack: None };
        };
        SandboxOutcome::Ok {
            entries: vec![(record_id.to_string(), StructuredValue::Int(n * 2))],
            logs: Vec::new(),
        }
    }
}

fn open() -> (tempfile::TempDir, PigeonOptics) {
    open_with(Arc::new(NoopSandbox))
}

fn open_with(sandbox: Arc<dyn Sandbox>) -> (tempfile::TempDir, PigeonOptics) {
    let dir = tempfile::tempdir().unwrap();
    let core = PigeonOptics::open(dir.path(), sandbox).unwrap();
    (dir, core)
}

#[test]
fn create_write_read_back() {
    let (_dir, core) = open();
    let path = DatasetPath::new("datasets", "alice", "songs");

    let mut config = BTreeMap::new();
    config.insert("memo".to_string(), StructuredValue::string("x"));
    core.datasets.create(&path, config).unwrap();
    assert_eq!(core.datasets.read_meta(&path).unwrap().version, 0);

    let value = StructuredValue::mapping([("title".to_string(), StructuredValue::string("A"))]);
    let record_path = path.clone().with_record("a");
    core.datasets.write(&record_path, value.clone()).unwrap();

    let meta = core.datasets.read_meta(&path).unwrap();
    assert_eq!(meta.version, 1);
    let record = &meta.records["a"];
    assert_eq!(record.version, 1);
    assert!(record.links.is_empty());
    assert_eq!(record.hash, object_hash(&value).unwrap());
    assert_eq!(core.datasets.read(&record_path).unwrap(), value);
}

#[test]
fn attachment_retention_through_versions() {
    let (_dir, core) = open();
    let path = DatasetPath::new("datasets", "alice", "videos");
    core.datasets.create(&path, Default::default()).unwrap();

    let (hash, hold) = core
        .attachments
        .write_stream(Cursor::new(b"hello"), None, Default::default())
        .unwrap();

    let link = format!("hash://sha256/{}", hash.to_hex());
    let mut value = BTreeMap::new();
    value.insert("video".to_string(), StructuredValue::string(link));
    core.datasets
        .write(&path.clone().with_record("k"), StructuredValue::Mapping(value))
        .unwrap();

    assert!(core.attachments.has(&hash).unwrap());
    let linkers = core.attachments.read_meta(&hash).unwrap().linkers;
    assert!(linkers.contains(&path.clone().with_record("k").encode()));

    // Releasing the upload hold validates; the record still links the
    // attachment, so it is retained.
    let resolver = DatasetLinkResolver { store: core.datasets.as_ref() };
    assert!(hold.release(&resolver).unwrap());
    assert!(core.attachments.has(&hash).unwrap());

    // Deleting the only referencing record empties the linker set and the
    // next validate collects blob and meta both.
    core.datasets.delete(&path.with_record("k")).unwrap();
    assert!(!core.validate_attachment(&hash).unwrap());
    assert!(!core.attachments.has(&hash).unwrap());
}

#[test]
fn missing_attachment_rejects_the_whole_batch() {
    let (_dir, core) = open();
    let path = DatasetPath::new("datasets", "alice", "videos");
    core.datasets.create(&path, Default::default()).unwrap();

    let mut value = BTreeMap::new();
    value.insert(
        "v".to_string(),
        StructuredValue::string(format!("hash://sha256/{}", "0".repeat(64))),
    );
    let err = core
        .datasets
        .write(&path.clone().with_record("k"), StructuredValue::Mapping(value))
        .unwrap_err();
    match err {
        pigeon_core::CoreError::MissingAttachments { hash_urls } => {
            assert_eq!(hash_urls, vec![format!("hash://sha256/{}", "0".repeat(64))]);
        }
        other => panic!("expected MissingAttachments, got {other}"),
    }
    // The failed batch must not have bumped the version.
    assert_eq!(core.datasets.read_meta(&path).unwrap().version, 0);
}

#[test]
fn overwrite_drops_unlisted_records_and_collects_their_objects() {
    let (_dir, core) = open();
    let path = DatasetPath::new("datasets", "alice", "songs");
    core.datasets.create(&path, Default::default()).unwrap();

    let value_b = StructuredValue::string("b-payload");
    let value_c = StructuredValue::string("c-payload");
    core.datasets.write(&path.clone().with_record("a"), StructuredValue::string("a-payload")).unwrap();
    core.datasets.write(&path.clone().with_record("b"), value_b.clone()).unwrap();
    core.datasets.write(&path.clone().with_record("c"), value_c.clone()).unwrap();

    let mut entries = BTreeMap::new();
    entries.insert("a".to_string(), Some(StructuredValue::string("a-rewritten")));
    core.datasets.overwrite(&path, entries).unwrap();

    let meta = core.datasets.read_meta(&path).unwrap();
    assert_eq!(meta.records.keys().collect::<Vec<_>>(), vec!["a"]);

    // Objects for b and c survive the overwrite itself (the previous
    // version's hashes stay in the retain set for one transition, so
    // readers of that version aren't clobbered) and are swept once the
    // meta moves past the next successor version.
    core.datasets
        .write(&path.clone().with_record("a"), StructuredValue::string("a-again"))
        .unwrap();
    let objects_dir = core
        .config
        .storage
        .data_path
        .join("datasets")
        .join("alice")
        .join("songs")
        .join("objects");
    for gone in [&value_b, &value_c] {
        let h = object_hash(gone).unwrap();
        let blob = objects_dir.join(h.shard_prefix()).join(format!("{}.cbor", h.shard_rest()));
        assert!(!blob.exists(), "object for dropped record still on disk");
    }
    let kept = meta.records["a"].hash;
    let kept_blob = objects_dir.join(kept.shard_prefix()).join(format!("{}.cbor", kept.shard_rest()));
    assert!(kept_blob.exists());
}

#[test]
fn concurrent_writers_reach_a_total_order() {
    let (_dir, core) = open();
    let path = DatasetPath::new("datasets", "alice", "counters");
    core.datasets.create(&path, Default::default()).unwrap();

    let writers = 8;
    let mut handles = Vec::new();
    for i in 0..writers {
        let datasets = core.datasets.clone();
        let path = path.clone();
        handles.push(thread::spawn(move || {
            datasets
                .write(&path.with_record(format!("w{i}")), StructuredValue::Int(i))
                .unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let meta = core.datasets.read_meta(&path).unwrap();
    assert_eq!(meta.version, writers as u64);
    assert_eq!(meta.records.len(), writers as usize);
}

#[test]
fn lens_derivation_recomputes_only_changed_inputs() {
    let (_dir, core) = open_with(Arc::new(DoublingSandbox));
    let input = DatasetPath::new("datasets", "alice", "in");
    core.datasets.create(&input, Default::default()).unwrap();
    let mut entries = BTreeMap::new();
    entries.insert("1".to_string(), Some(StructuredValue::Int(2)));
    entries.insert("2".to_string(), Some(StructuredValue::Int(3)));
    core.datasets.merge(&input, entries).unwrap();

    let lens_path = DatasetPath::new("lenses", "alice", "double");
    core.lenses
        .create(
            &lens_path,
            LensSpec {
                map_function_source: "double".to_string(),
                inputs: vec![input.clone()],
                dependencies: Default::default(),
            },
        )
        .unwrap();

    assert_eq!(core.datasets.read(&lens_path.clone().with_record("1")).unwrap(), StructuredValue::Int(4));
    assert_eq!(core.datasets.read(&lens_path.clone().with_record("2")).unwrap(), StructuredValue::Int(6));
    let before = core.datasets.read_meta(&lens_path).unwrap();

    core.datasets.write(&input.with_record("1"), StructuredValue::Int(5)).unwrap();
    core.lenses.build(&lens_path).unwrap();

    let after = core.datasets.read_meta(&lens_path).unwrap();
    assert_eq!(core.datasets.read(&lens_path.clone().with_record("1")).unwrap(), StructuredValue::Int(10));
    assert_eq!(core.datasets.read(&lens_path.clone().with_record("2")).unwrap(), StructuredValue::Int(6));
    // The untouched output record kept its version: its hash didn't change.
    assert_eq!(after.records["2"].version, before.records["2"].version);
    assert!(after.records["1"].version > before.records["1"].version);
}

#[test]
fn lens_rebuild_with_no_input_change_produces_no_new_version() {
    let (_dir, core) = open();
    let input = DatasetPath::new("datasets", "alice", "numbers");
    core.datasets.create(&input, Default::default()).unwrap();
    core.datasets.write(&input.clone().with_record("1"), StructuredValue::Int(1)).unwrap();

    let lens_path = DatasetPath::new("lenses", "alice", "doubled");
    let first = core
        .lenses
        .create(
            &lens_path,
            LensSpec {
                map_function_source: "identity".to_string(),
                inputs: vec![input.clone()],
                dependencies: Default::default(),
            },
        )
        .unwrap();

    let rebuilt = core.lenses.build(&lens_path).unwrap();
    assert_eq!(rebuilt.version, first.version);
}

#[test]
fn writing_an_input_rebuilds_the_lens_through_the_event_bus() {
    let (_dir, core) = open_with(Arc::new(DoublingSandbox));
    let input = DatasetPath::new("datasets", "alice", "numbers");
    core.datasets.create(&input, Default::default()).unwrap();
    core.datasets.write(&input.clone().with_record("a"), StructuredValue::Int(3)).unwrap();

    let lens_path = DatasetPath::new("lenses", "alice", "doubled");
    core.lenses
        .create(
            &lens_path,
            LensSpec {
                map_function_source: "double".to_string(),
                inputs: vec![input.clone()],
                dependencies: Default::default(),
            },
        )
        .unwrap();

    // No explicit build call after this write: the pathUpdated event alone
    // must wake the lens.
    core.datasets.write(&input.with_record("b"), StructuredValue::Int(7)).unwrap();

    let record = lens_path.with_record("b");
    let mut derived = None;
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(20));
        if let Ok(v) = core.datasets.read(&record) {
            derived = Some(v);
            break;
        }
    }
    assert_eq!(derived, Some(StructuredValue::Int(14)));
}
