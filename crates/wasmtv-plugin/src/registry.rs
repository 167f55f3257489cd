//! Plugin registry: loads plugins and delivers discovered files to them.
//!
//! The `PluginRegistry` owns every live [`PluginInstance`]. Each instance
//! sits behind its own mutex, so one plugin never sees two calls at once,
//! while different plugins run in parallel on blocking threads.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::abi::{FileOutcome, FileRecord};
use crate::error::PluginError;
use crate::sandbox::{PluginEngine, PluginInstance, SandboxConfig};
use crate::services::HostServices;
use crate::transfer::TransferLedger;

const PLUGIN_FILE_PREFIX: &str = "plugin_";
const PLUGIN_FILE_SUFFIX: &str = ".wasm";

type SharedInstance = Arc<parking_lot::Mutex<PluginInstance>>;

/// A registered instance. The id is kept outside the instance lock so
/// queries never wait on a running plugin.
#[derive(Clone)]
struct LoadedPlugin {
    id: Uuid,
    instance: SharedInstance,
}

/// Holds a name reserved for an in-flight load; releases it on drop.
struct PendingLoad<'a> {
    pending: &'a parking_lot::Mutex<HashSet<String>>,
    name: String,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.name);
    }
}

/// What happened when one plugin was handed one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// `on_file_found` returned 0.
    Processed,
    /// `on_file_found` returned a non-zero status. The plugin stays loaded.
    Failed(i32),
    /// The host refused the call before the plugin ran; the plugin stays
    /// loaded.
    Skipped(String),
    /// The plugin trapped and was removed from the registry.
    Discarded(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub plugin: String,
    pub outcome: DispatchOutcome,
}

/// Extract `<name>` from `plugin_<name>.wasm`.
pub fn plugin_name_from_file(file_name: &str) -> Option<&str> {
    let name = file_name
        .strip_prefix(PLUGIN_FILE_PREFIX)?
        .strip_suffix(PLUGIN_FILE_SUFFIX)?;
    validate_plugin_name(name).ok().map(|()| name)
}

/// Plugin names end up in file paths and log fields.
fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PluginError::Load(format!(
            "invalid plugin name {name:?}: use 1-64 ASCII letters, digits, '_' or '-'"
        )))
    }
}

/// Central plugin registry.
pub struct PluginRegistry {
    /// Loaded plugins indexed by name.
    plugins: RwLock<HashMap<String, LoadedPlugin>>,
    /// Names whose `on_load` is running and not yet registered.
    pending: parking_lot::Mutex<HashSet<String>>,
    engine: PluginEngine,
    services: Arc<dyn HostServices>,
    sandbox_config: SandboxConfig,
    /// Directory scanned for `plugin_<name>.wasm` files.
    plugin_dir: PathBuf,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugin_dir", &self.plugin_dir)
            .field("sandbox_config", &self.sandbox_config)
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    pub fn new(
        services: Arc<dyn HostServices>,
        sandbox_config: SandboxConfig,
        plugin_dir: impl Into<PathBuf>,
    ) -> Result<Self, PluginError> {
        Ok(Self {
            plugins: RwLock::new(HashMap::new()),
            pending: parking_lot::Mutex::new(HashSet::new()),
            engine: PluginEngine::new()?,
            services,
            sandbox_config,
            plugin_dir: plugin_dir.into(),
        })
    }

    /// Create a registry configured from environment variables
    /// (`PLUGIN_DIR` plus [`SandboxConfig::from_env`]). Does NOT load
    /// plugins; call [`load_all`](Self::load_all) after creation.
    pub fn from_env(services: Arc<dyn HostServices>) -> Result<Self, PluginError> {
        let plugin_dir = std::env::var("PLUGIN_DIR").unwrap_or_else(|_| "plugins".to_string());
        Self::new(services, SandboxConfig::from_env(), plugin_dir)
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn services(&self) -> &Arc<dyn HostServices> {
        &self.services
    }

    /// Load every `plugin_<name>.wasm` in the plugin directory, in name
    /// order. Failures are logged and skipped. Returns the names loaded.
    pub async fn load_all(&self) -> Vec<String> {
        let mut names = match self.scan_plugin_dir().await {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(dir = %self.plugin_dir.display(), "failed to scan plugin directory: {e}");
                return Vec::new();
            }
        };
        names.sort();

        let mut loaded = Vec::new();
        for name in names {
            match self.load_plugin(&name).await {
                Ok(()) => loaded.push(name),
                Err(e) => tracing::error!(plugin = %name, "failed to load plugin: {e}"),
            }
        }
        tracing::info!(count = loaded.len(), "plugins loaded");
        loaded
    }

    async fn scan_plugin_dir(&self) -> Result<Vec<String>, PluginError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.plugin_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            match file_name.to_str().and_then(plugin_name_from_file) {
                Some(name) => names.push(name.to_string()),
                None => tracing::trace!(file = ?file_name, "not a plugin file, ignoring"),
            }
        }
        Ok(names)
    }

    /// Load `<plugin_dir>/plugin_<name>.wasm`.
    pub async fn load_plugin(&self, name: &str) -> Result<(), PluginError> {
        validate_plugin_name(name)?;
        let path = self
            .plugin_dir
            .join(format!("{PLUGIN_FILE_PREFIX}{name}{PLUGIN_FILE_SUFFIX}"));
        let wasm_bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PluginError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        self.load_module(name, wasm_bytes).await
    }

    /// Instantiate a plugin from raw module bytes and run `on_load`.
    ///
    /// The plugin is registered only if `on_load` returned 0. The name is
    /// reserved for the whole load, so a concurrent load of the same name
    /// fails before its plugin runs.
    pub async fn load_module(&self, name: &str, wasm_bytes: Vec<u8>) -> Result<(), PluginError> {
        validate_plugin_name(name)?;
        let _reservation = self.reserve(name).await?;

        let engine = self.engine.clone();
        let services = self.services.clone();
        let config = self.sandbox_config.clone();
        let plugin_name = name.to_string();
        let instance = tokio::task::spawn_blocking(move || {
            let mut instance =
                PluginInstance::instantiate(&engine, &plugin_name, &wasm_bytes, services, config)?;
            instance.load()?;
            Ok::<_, PluginError>(instance)
        })
        .await
        .map_err(|e| PluginError::Sandbox(format!("load task failed: {e}")))??;

        let id = instance.id();
        self.plugins.write().await.insert(
            name.to_string(),
            LoadedPlugin {
                id,
                instance: Arc::new(parking_lot::Mutex::new(instance)),
            },
        );
        tracing::info!(plugin = %name, instance = %id, "plugin registered");
        Ok(())
    }

    /// Claim `name` for a load. Checked against registered and in-flight
    /// names under the registry write lock.
    async fn reserve(&self, name: &str) -> Result<PendingLoad<'_>, PluginError> {
        let plugins = self.plugins.write().await;
        let mut pending = self.pending.lock();
        if plugins.contains_key(name) || !pending.insert(name.to_string()) {
            return Err(PluginError::AlreadyExists(name.to_string()));
        }
        Ok(PendingLoad {
            pending: &self.pending,
            name: name.to_string(),
        })
    }

    /// Report one discovered file to every loaded plugin in parallel.
    ///
    /// Reports come back in plugin name order. Plugins that trap are
    /// removed; per-file failures are logged and the session goes on.
    pub async fn file_found(&self, library: &str, name: &str) -> Vec<FileReport> {
        let record = FileRecord::new(library, name);
        let mut targets: Vec<(String, SharedInstance)> = self
            .plugins
            .read()
            .await
            .iter()
            .map(|(name, loaded)| (name.clone(), loaded.instance.clone()))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        let handles: Vec<_> = targets
            .iter()
            .map(|(_, instance)| {
                let instance = instance.clone();
                let record = record.clone();
                tokio::task::spawn_blocking(move || {
                    let mut instance = instance.lock();
                    let result = instance.file_found(&record);
                    (result, instance.is_discarded())
                })
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        let mut discarded = Vec::new();
        for ((plugin, instance), handle) in targets.into_iter().zip(handles) {
            let outcome = match handle.await {
                Ok((Ok(FileOutcome::Processed), _)) => DispatchOutcome::Processed,
                Ok((Ok(FileOutcome::Failed(status)), _)) => {
                    tracing::warn!(
                        plugin = %plugin,
                        library = %library,
                        file = %name,
                        status,
                        "plugin failed to process file"
                    );
                    DispatchOutcome::Failed(status)
                }
                Ok((Err(e), is_discarded)) => {
                    if is_discarded {
                        discarded.push((plugin.clone(), instance));
                    }
                    // a discarded instance also rejects calls with InvalidState
                    // after a concurrent unload; only a trap is reported as one
                    if is_discarded && e.is_fatal() {
                        tracing::error!(plugin = %plugin, file = %name, "plugin discarded: {e}");
                        DispatchOutcome::Discarded(e.to_string())
                    } else {
                        tracing::warn!(plugin = %plugin, file = %name, "file not delivered: {e}");
                        DispatchOutcome::Skipped(e.to_string())
                    }
                }
                Err(e) => {
                    tracing::error!(plugin = %plugin, "dispatch task failed: {e}");
                    DispatchOutcome::Skipped(format!("dispatch task failed: {e}"))
                }
            };
            reports.push(FileReport { plugin, outcome });
        }

        if !discarded.is_empty() {
            let mut plugins = self.plugins.write().await;
            for (plugin, instance) in discarded {
                // only if it was not replaced in the meantime
                if plugins
                    .get(&plugin)
                    .is_some_and(|current| Arc::ptr_eq(&current.instance, &instance))
                {
                    plugins.remove(&plugin);
                }
            }
        }

        reports
    }

    /// Remove a plugin and run its `on_unload`.
    pub async fn unload_plugin(&self, name: &str) -> Result<TransferLedger, PluginError> {
        let instance = self
            .plugins
            .write()
            .await
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        Self::unload_instance(name, instance.instance).await
    }

    /// Unload every plugin in parallel. Returns each plugin's result in
    /// name order.
    pub async fn unload_all(&self) -> Vec<(String, Result<TransferLedger, PluginError>)> {
        let mut drained: Vec<(String, SharedInstance)> = self
            .plugins
            .write()
            .await
            .drain()
            .map(|(name, loaded)| (name, loaded.instance))
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        let handles: Vec<_> = drained
            .into_iter()
            .map(|(name, instance)| {
                tokio::spawn(async move {
                    let result = Self::unload_instance(&name, instance).await;
                    (name, result)
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("unload task failed: {e}"),
            }
        }
        results
    }

    async fn unload_instance(
        name: &str,
        instance: SharedInstance,
    ) -> Result<TransferLedger, PluginError> {
        let result = tokio::task::spawn_blocking(move || instance.lock().unload())
            .await
            .map_err(|e| PluginError::Sandbox(format!("unload task failed: {e}")))?;
        if let Err(e) = &result {
            tracing::error!(plugin = %name, "plugin did not unload cleanly: {e}");
        }
        result
    }

    // ── Query methods ────────────────────────────────────────────────

    /// Returns the number of currently loaded plugins.
    pub async fn loaded_count(&self) -> usize {
        self.plugins.read().await.len()
    }

    /// Check if a plugin is currently loaded.
    pub async fn is_loaded(&self, name: &str) -> bool {
        self.plugins.read().await.contains_key(name)
    }

    /// All loaded plugins as `(instance id, name)`, sorted by name.
    pub async fn loaded_plugins(&self) -> Vec<(Uuid, String)> {
        let plugins = self.plugins.read().await;
        let mut list: Vec<(Uuid, String)> = plugins
            .iter()
            .map(|(name, loaded)| (loaded.id, name.clone()))
            .collect();
        list.sort_by(|a, b| a.1.cmp(&b.1));
        list
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
