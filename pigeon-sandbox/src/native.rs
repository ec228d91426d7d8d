//! Runs lens map functions as pre-registered in-process closures, keyed by
//! `mapFunctionSource`. Intended for tests and CLI embedding, where map
//! functions are compiled into the host binary rather than supplied as
//! untrusted bytecode at runtime — see [`crate::wasm_host::WasmSandbox`] for
//! the latter.

use pigeon_core::sandbox::{DependencyReader, Sandbox, SandboxOutcome};
use pigeon_core::value::StructuredValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type MapFn = dyn Fn(&str, &StructuredValue, &dyn DependencyReader) -> SandboxOutcome + Send + Sync;

#[derive(Clone, Default)]
pub struct NativeSandbox {
    functions: Arc<Mutex<HashMap<String, Arc<MapFn>>>>,
}

impl NativeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a map function under `name`; a lens whose
    /// `mapFunctionSource` equals `name` is evaluated by calling `f`.
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&str, &StructuredValue, &dyn DependencyReader) -> SandboxOutcome + Send + Sync + 'static,
    {
        self.functions
            .lock()
            .expect("native sandbox registry poisoned")
            .insert(name.into(), Arc::new(f));
    }
}

impl Sandbox for NativeSandbox {
    fn evaluate(
        &self,
        map_function_source: &str,
        record_id: &str,
        record_value: &StructuredValue,
        dependencies: &dyn DependencyReader,
    ) -> SandboxOutcome {
        let functions = self.functions.lock().expect("native sandbox registry poisoned");
        match functions.get(map_function_source) {
            Some(f) => f(record_id, record_value, dependencies),
            None => {
                tracing::warn!(map_function_source, record_id, "no native map function registered");
                SandboxOutcome::Err {
                    message: format!("no native map function registered for {map_function_source:?}"),
                    stack: None,
                }
            }
        }
    }
}
