//! The `Sandbox` collaborator: core never executes a lens map function
//! itself — it hands `(record_id, record_value, dependency_reader)` to
//! whatever sandbox implementation the embedder configures (see the
//! sibling sandbox crate's native and WASM-host implementations) and
//! treats the outcome as opaque data, never a fatal error.

use crate::error::Result;
use crate::value::StructuredValue;

/// One emitted `[outputID, outputValue]` pair from a map function run.
pub type SandboxEntry = (String, StructuredValue);

pub enum SandboxOutcome {
    Ok {
        entries: Vec<SandboxEntry>,
        logs: Vec<String>,
    },
    Err {
        message: String,
        stack: Option<String>,
    },
}

/// Lets a map function read another declared dependency dataset's records
/// by name, without giving it direct access to the dataset store.
pub trait DependencyReader: Send + Sync {
    fn read(&self, dependency_name: &str) -> Result<Option<StructuredValue>>;
}

pub trait Sandbox: Send + Sync {
    fn evaluate(
        &self,
        map_function_source: &str,
        record_id: &str,
        record_value: &StructuredValue,
        dependencies: &dyn DependencyReader,
    ) -> SandboxOutcome;
}
