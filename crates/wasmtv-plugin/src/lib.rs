//! wasmtv plugin host
//!
//! WASM plugin runtime built on wasmtime. Plugins are core wasm32 modules
//! exporting `on_load`, `on_file_found` and `on_unload`; they call back into
//! the host through four functions imported from the `wasmtv` namespace.
//! Every pointer a plugin passes is bounds-checked, file records live only
//! for the call that receives them, and buffers the host returns become the
//! plugin's property.

pub mod abi;
pub mod error;
mod host_functions;
pub mod http;
pub mod kv;
pub mod lease;
pub mod lifecycle;
pub mod memory;
pub mod registry;
pub mod sandbox;
pub mod services;
pub mod transfer;
pub mod validate;

pub use abi::{FileOutcome, FileRecord};
pub use error::PluginError;
pub use http::{HttpConfig, HttpFetcher};
pub use kv::{JsonFileKvStore, KvStore, MemoryKvStore};
pub use lifecycle::LifecycleState;
pub use registry::{DispatchOutcome, FileReport, PluginRegistry};
pub use sandbox::{PluginEngine, PluginInstance, SandboxConfig};
pub use services::{HostContext, HostServices};
pub use transfer::{BufferOrigin, ServiceBuffer, TransferLedger};
