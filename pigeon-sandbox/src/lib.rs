//! Sandboxed lens map-function execution for Pigeon Optics: a native
//! in-process implementation for tests/CLI embedding, plus an experimental
//! WASM host behind the `wasm_host` feature.

pub mod native;
#[cfg(feature = "wasm_host")]
pub mod wasm_host;

pub use native::NativeSandbox;
#[cfg(feature = "wasm_host")]
pub use wasm_host::WasmSandbox;
