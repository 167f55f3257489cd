//! Plugin host error types.

use thiserror::Error;

use crate::lifecycle::LifecycleState;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("load error: {0}")]
    Load(String),

    #[error("plugin {plugin} failed to load: on_load returned {status}")]
    LoadFailed { plugin: String, status: i32 },

    #[error("cannot {operation} plugin {plugin} while {state}")]
    InvalidState {
        plugin: String,
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("boundary violation: {0}")]
    BoundaryViolation(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("host function error: {0}")]
    HostFunction(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("execution timeout: plugin {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("execution timeout: plugin {0} exceeded call deadline")]
    CallTimeout(String),

    #[error("unload timeout: plugin {0} did not return from on_unload within grace period")]
    UnloadTimeout(String),

    #[error("memory limit exceeded: plugin {0}")]
    MemoryExceeded(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("kv store error: {0}")]
    Kv(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// Whether this error leaves the instance unusable.
    ///
    /// Traps and boundary violations force-discard the instance; state and
    /// per-record errors are rejected before the plugin ever runs.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PluginError::BoundaryViolation(_)
                | PluginError::Sandbox(_)
                | PluginError::FuelExhausted(_)
                | PluginError::CallTimeout(_)
                | PluginError::UnloadTimeout(_)
                | PluginError::MemoryExceeded(_)
                | PluginError::LoadFailed { .. }
        )
    }
}
