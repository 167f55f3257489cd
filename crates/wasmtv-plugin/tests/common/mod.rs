// Shared test utilities for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use wasmtv_plugin::{
    HostServices, KvStore, MemoryKvStore, PluginEngine, PluginError, PluginInstance,
    SandboxConfig,
};

/// Host services that record every call instead of doing real work.
#[derive(Default)]
pub struct RecordingServices {
    pub traces: Mutex<Vec<(String, String)>>,
    pub http_responses: Mutex<HashMap<String, Vec<u8>>>,
    pub kv: MemoryKvStore,
    pub calls: Mutex<Vec<&'static str>>,
}

impl RecordingServices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: &[u8]) {
        self.http_responses
            .lock()
            .insert(url.to_string(), body.to_vec());
    }

    pub fn trace_messages(&self) -> Vec<String> {
        self.traces.lock().iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn stored(&self, key: &str) -> Option<Vec<u8>> {
        self.kv.get(key).unwrap()
    }

    /// The pointer half of a raw `(ptr, len)` slot pair stored under `key`.
    pub fn stored_ptr(&self, key: &str) -> u32 {
        let bytes = self.stored(key).expect("slots not stored");
        u32::from_le_bytes(bytes[..4].try_into().expect("slot is 4 bytes"))
    }
}

impl HostServices for RecordingServices {
    fn trace(&self, plugin: &str, message: &str) {
        self.calls.lock().push("trace");
        self.traces
            .lock()
            .push((plugin.to_string(), message.to_string()));
    }

    fn http_get(&self, _plugin: &str, url: &str) -> Result<Vec<u8>, PluginError> {
        self.calls.lock().push("http_get");
        self.http_responses
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| PluginError::Http(format!("{url} is unreachable")))
    }

    fn kv_set(&self, _plugin: &str, key: &str, value: &[u8]) -> Result<(), PluginError> {
        self.calls.lock().push("kv_set");
        self.kv.set(key, value)
    }

    fn kv_get(&self, _plugin: &str, key: &str) -> Result<Option<Vec<u8>>, PluginError> {
        self.calls.lock().push("kv_get");
        self.kv.get(key)
    }
}

/// Imports and memory shared by every guest fixture. Data below offset
/// 1024 is left to the fixture.
pub const GUEST_PRELUDE: &str = r#"
    (import "wasmtv" "trace" (func $trace (param i32)))
    (import "wasmtv" "http_get" (func $http_get (param i32 i32 i32)))
    (import "wasmtv" "kv_set" (func $kv_set (param i32 i32 i32)))
    (import "wasmtv" "kv_get" (func $kv_get (param i32 i32 i32)))
    (memory (export "memory") 1)
"#;

/// Entry points that do nothing and succeed.
pub const NOOP_ON_LOAD: &str = r#"(func (export "on_load") (result i32) i32.const 0)"#;
pub const NOOP_ON_UNLOAD: &str = r#"(func (export "on_unload"))"#;
pub const NOOP_ON_FILE_FOUND: &str =
    r#"(func (export "on_file_found") (param i32) (result i32) i32.const 0)"#;

/// Compile a guest module from the prelude plus `body`.
pub fn guest(body: &str) -> Vec<u8> {
    wat::parse_str(format!("(module {GUEST_PRELUDE} {body})")).expect("fixture must be valid WAT")
}

pub fn test_config() -> SandboxConfig {
    SandboxConfig {
        call_timeout: Duration::from_secs(5),
        unload_grace: Duration::from_secs(1),
        ..SandboxConfig::default()
    }
}

pub fn instantiate(
    body: &str,
    services: Arc<dyn HostServices>,
    config: SandboxConfig,
) -> PluginInstance {
    let engine = PluginEngine::new().unwrap();
    PluginInstance::instantiate(&engine, "fixture", &guest(body), services, config).unwrap()
}
