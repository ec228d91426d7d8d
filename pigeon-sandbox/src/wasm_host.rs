//! Experimental WASM-guest sandbox for lens map functions — EXPERIMENTAL,
//! only compiled behind the `wasm_host` feature.
//!
//! A guest module must export `memory`, `alloc(len: i32) -> i32`, and
//! `evaluate(ptr: i32, len: i32) -> i64` (a packed `(outPtr << 32) | outLen`),
//! reading its input as UTF-8 JSON `{"recordId","recordValue"}` at the given
//! pointer and writing UTF-8 JSON `{"entries":[[id,value],...],"logs":[...]}`
//! or `{"error":"...","stack":...}` at the returned pointer. Hardened the
//! same way the native contract sandbox this crate grew out of was: no WASI
//! imports, a fixed linear-memory cap, and fuel metering so a runaway guest
//! traps instead of hanging a build.
//!
//! Roadmap: a safer string/buffer marshalling layer than raw pointer+length,
//! module validation beyond wasmtime's own checks, fuzzing against
//! `NativeSandbox` for differential testing.

use pigeon_core::codec::Codec;
use pigeon_core::sandbox::{DependencyReader, Sandbox, SandboxOutcome};
use pigeon_core::value::StructuredValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use wasmtime::{Config, Engine, Linker, Module, Store};

const WASM_MEMORY_MAX_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_FUEL_BUDGET: u64 = 10_000_000;

pub struct WasmSandbox {
    engine: Engine,
    modules: Arc<Mutex<HashMap<String, Module>>>,
}

impl WasmSandbox {
    pub fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.wasm_memory64(false);
        config.static_memory_maximum_size(WASM_MEMORY_MAX_BYTES);
        config.consume_fuel(true);
        let engine = Engine::new(&config)?;
        Ok(WasmSandbox {
            engine,
            modules: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Compiles and registers `wasm_bytes` under `name`, so a lens whose
    /// `mapFunctionSource` equals `name` is routed to this module.
    pub fn register(&self, name: impl Into<String>, wasm_bytes: &[u8]) -> anyhow::Result<()> {
        let module = Module::new(&self.engine, wasm_bytes)?;
        self.modules
            .lock()
            .expect("wasm module registry poisoned")
            .insert(name.into(), module);
        Ok(())
    }

    fn run(&self, module: &Module, record_id: &str, record_value: &StructuredValue) -> anyhow::Result<StructuredValue> {
        let mut input_fields = BTreeMap::new();
        input_fields.insert("recordId".to_string(), StructuredValue::string(record_id));
        input_fields.insert("recordValue".to_string(), record_value.clone());
        let input_bytes = Codec::Json.encode(&StructuredValue::Mapping(input_fields))?;

        // No WASI imports: a guest map function can't touch FS/network/clock.
        let linker: Linker<()> = Linker::new(&self.engine);
        let mut store = Store::new(&self.engine, ());
        store.add_fuel(DEFAULT_FUEL_BUDGET)?;
        let instance = linker.instantiate(&mut store, module)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| anyhow::anyhow!("guest module does not export 'memory'"))?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut store, "alloc")?;
        let evaluate = instance.get_typed_func::<(i32, i32), i64>(&mut store, "evaluate")?;

        let ptr = alloc.call(&mut store, input_bytes.len() as i32)?;
        memory.write(&mut store, ptr as usize, &input_bytes)?;

        let packed = evaluate.call(&mut store, (ptr, input_bytes.len() as i32))?;
        let out_ptr = ((packed as u64) >> 32) as usize;
        let out_len = (packed as u64 & 0xffff_ffff) as usize;
        let mut buf = vec![0u8; out_len];
        memory.read(&store, out_ptr, &mut buf)?;

        Ok(Codec::Json.decode(&buf)?)
    }
}

impl Sandbox for WasmSandbox {
    fn evaluate(
        &self,
        map_function_source: &str,
        record_id: &str,
        record_value: &StructuredValue,
        _dependencies: &dyn DependencyReader,
    ) -> SandboxOutcome {
        let module = {
            let modules = self.modules.lock().expect("wasm module registry poisoned");
            match modules.get(map_function_source) {
                Some(m) => m.clone(),
                None => {
                    return SandboxOutcome::Err {
                        message: format!("no wasm module registered for {map_function_source:?}"),
                        stack: None,
                    }
                }
            }
        };
        match self.run(&module, record_id, record_value) {
            Ok(value) => parse_outcome(&value),
            Err(e) => {
                tracing::warn!(map_function_source, record_id, error = %e, "wasm guest evaluation failed");
                SandboxOutcome::Err {
                    message: e.to_string(),
                    stack: None,
                }
            }
        }
    }
}

fn parse_outcome(value: &StructuredValue) -> SandboxOutcome {
    let Some(map) = value.as_mapping() else {
        return SandboxOutcome::Err {
            message: "guest output was not a JSON object".to_string(),
            stack: None,
        };
    };
    if let Some(message) = map.get("error").and_then(|v| v.as_str()) {
        let stack = map.get("stack").and_then(|v| v.as_str()).map(String::from);
        return SandboxOutcome::Err {
            message: message.to_string(),
            stack,
        };
    }
    let mut entries = Vec::new();
    if let Some(StructuredValue::Array(items)) = map.get("entries") {
        for item in items {
            if let Some(pair) = item.as_array() {
                if pair.len() == 2 {
                    if let Some(id) = pair[0].as_str() {
                        entries.push((id.to_string(), pair[1].clone()));
                    }
                }
            }
        }
    }
    let logs = match map.get("logs") {
        Some(StructuredValue::Array(items)) => {
            items.iter().filter_map(|v| v.as_str().map(String::from)).collect()
        }
        _ => Vec::new(),
    };
    SandboxOutcome::Ok { entries, logs }
}
