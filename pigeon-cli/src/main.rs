use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pigeon_core::dataset::lens::LensSpec;
use pigeon_core::path::DatasetPath;
use pigeon_core::value::StructuredValue;
use pigeon_core::PigeonOptics;
use pigeon_sandbox::NativeSandbox;

#[derive(Parser, Debug)]
#[command(name = "pigeon", about = "Pigeon Optics: a content-addressed dataset store with a lens layer")]
struct Cli {
    /// Data root; falls back to PIGEON_OPTICS_ROOT, then the current directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a dataset.
    Create {
        source: String,
        user: String,
        name: String,
    },
    /// Write one record's value (as JSON) into a dataset.
    Write {
        source: String,
        user: String,
        name: String,
        record: String,
        /// JSON value for the record.
        value: String,
    },
    /// Read one record's value, printed as JSON.
    Read {
        source: String,
        user: String,
        name: String,
        record: String,
    },
    /// List the record ids in a dataset.
    List { source: String, user: String, name: String },
    /// Delete a record, or the whole dataset if no record id is given.
    Delete {
        source: String,
        user: String,
        name: String,
        record: Option<String>,
    },
    /// Store a file's bytes as a content-addressed attachment, printing its
    /// hash:// URI.
    Attach {
        file: PathBuf,
        #[arg(long)]
        linker: Option<String>,
    },
    /// Create a lens dataset with the built-in `identity` map function.
    LensCreate {
        source: String,
        user: String,
        name: String,
        /// Input dataset path(s), e.g. pigeon-optics:/src/alice:tweets
        #[arg(long = "input", required = true)]
        inputs: Vec<String>,
    },
    /// Rebuild a lens against its current inputs.
    LensBuild { source: String, user: String, name: String },
    /// Resolve a read-path (dataset record or a meta/system/system/... path).
    Resolve { path: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let root = PigeonOptics::resolve_root(cli.root);
    let sandbox = Arc::new(identity_sandbox());
    let core = PigeonOptics::open(&root, sandbox).with_context(|| format!("opening {}", root.display()))?;

    match cli.command {
        Command::Create { source, user, name } => {
            let path = DatasetPath::new(source, user, name);
            core.datasets.create(&path, BTreeMap::new())?;
            println!("created {}", path.encode());
        }
        Command::Write { source, user, name, record, value } => {
            let path = DatasetPath::new(source, user, name).with_record(record);
            let json: serde_json::Value = serde_json::from_str(&value).context("parsing --value as JSON")?;
            let structured = json_to_structured(&json);
            let meta = core.datasets.write(&path, structured)?;
            println!("wrote {} (dataset version {})", path.encode(), meta.version);
        }
        Command::Read { source, user, name, record } => {
            let path = DatasetPath::new(source, user, name).with_record(record);
            let value = core.datasets.read(&path)?;
            println!("{}", serde_json::to_string_pretty(&structured_to_json(&value))?);
        }
        Command::List { source, user, name } => {
            let path = DatasetPath::new(source, user, name);
            for id in core.datasets.list(&path)? {
                println!("{id}");
            }
        }
        Command::Delete { source, user, name, record } => {
            let mut path = DatasetPath::new(source, user, name);
            if let Some(record) = record {
                path = path.with_record(record);
            }
            let meta = core.datasets.delete(&path)?;
            println!("deleted {} (dataset version {})", path.encode(), meta.version);
        }
        Command::Attach { file, linker } => {
            let f = std::fs::File::open(&file).with_context(|| format!("opening {}", file.display()))?;
            // The guard is dropped, not released: releasing would validate
            // and immediately collect a not-yet-linked attachment. The blob
            // stays until a record links it or a later validate prunes it.
            let (hash, _hold) = core.attachments.write_stream(f, linker.as_deref(), BTreeMap::new())?;
            println!("hash://sha256/{}", hash.to_hex());
        }
        Command::LensCreate { source, user, name, inputs } => {
            let path = DatasetPath::new(source, user, name);
            let inputs = inputs
                .iter()
                .map(|s| DatasetPath::decode(s))
                .collect::<pigeon_core::Result<Vec<_>>>()?;
            let meta = core.lenses.create(
                &path,
                LensSpec {
                    map_function_source: "identity".to_string(),
                    inputs,
                    dependencies: BTreeMap::new(),
                },
            )?;
            println!("created lens {} (version {})", path.encode(), meta.version);
        }
        Command::LensBuild { source, user, name } => {
            let path = DatasetPath::new(source, user, name);
            let meta = core.lenses.build(&path)?;
            println!("built lens {} (version {})", path.encode(), meta.version);
        }
        Command::Resolve { path } => {
            let value = core.read_path.read(&path)?;
            println!("{}", serde_json::to_string_pretty(&structured_to_json(&value))?);
        }
    }

    Ok(())
}

/// The CLI's one built-in map function: re-emits each input record
/// unchanged under its own record id. Useful for smoke-testing a lens
/// pipeline without writing a custom sandbox.
fn identity_sandbox() -> NativeSandbox {
    let sandbox = NativeSandbox::new();
    sandbox.register("identity", |record_id, value, _deps| {
        pigeon_core::sandbox::SandboxOutcome::Ok {
            entries: vec![(record_id.to_string(), value.clone())],
            logs: Vec::new(),
        }
    });
    sandbox
}

fn json_to_structured(value: &serde_json::Value) -> StructuredValue {
    match value {
        serde_json::Value::Null => StructuredValue::Null,
        serde_json::Value::Bool(b) => StructuredValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                StructuredValue::Int(i)
            } else {
                StructuredValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => StructuredValue::string(s.clone()),
        serde_json::Value::Array(items) => {
            StructuredValue::Array(items.iter().map(json_to_structured).collect())
        }
        serde_json::Value::Object(map) => StructuredValue::Mapping(
            map.iter().map(|(k, v)| (k.clone(), json_to_structured(v))).collect(),
        ),
    }
}

fn structured_to_json(value: &StructuredValue) -> serde_json::Value {
    match value {
        StructuredValue::Null => serde_json::Value::Null,
        StructuredValue::Bool(b) => serde_json::Value::Bool(*b),
        StructuredValue::Int(i) => serde_json::Value::from(*i),
        StructuredValue::Float(f) => serde_json::json!(f),
        StructuredValue::String(s) => serde_json::Value::String(s.clone()),
        StructuredValue::Bytes(b) => {
            serde_json::Value::String(base64_encode(b))
        }
        StructuredValue::Array(items) => {
            serde_json::Value::Array(items.iter().map(structured_to_json).collect())
        }
        StructuredValue::Mapping(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), structured_to_json(v))).collect(),
        ),
        StructuredValue::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
