//! The services a host exposes to plugins.
//!
//! [`HostServices`] is the seam between the ABI marshaling layer and
//! whatever actually logs, fetches and stores. The marshaling layer owns
//! every pointer and buffer; implementations only ever see owned Rust
//! values, which is what lets tests drive real plugins against a mock.

use std::sync::Arc;

use crate::error::PluginError;
use crate::http::{HttpConfig, HttpFetcher};
use crate::kv::{JsonFileKvStore, KvStore, MemoryKvStore};

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Host side of the four plugin imports. `plugin` is the calling
/// instance's name.
///
/// Errors never reach the plugin: the marshaling layer logs them and
/// answers with a zero-length result.
pub trait HostServices: Send + Sync {
    fn trace(&self, plugin: &str, message: &str);

    fn http_get(&self, plugin: &str, url: &str) -> Result<Vec<u8>, PluginError>;

    fn kv_set(&self, plugin: &str, key: &str, value: &[u8]) -> Result<(), PluginError>;

    /// `Ok(None)` when the key is absent.
    fn kv_get(&self, plugin: &str, key: &str) -> Result<Option<Vec<u8>>, PluginError>;
}

/// Sanitize a log message from a plugin.
///
/// Strips control characters (except newline/tab), truncates to max length.
pub fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

/// Production services: tracing for `trace`, an [`HttpFetcher`] for
/// `http_get`, and one shared [`KvStore`].
#[derive(Clone)]
pub struct HostContext {
    http: Option<HttpFetcher>,
    kv: Arc<dyn KvStore>,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("http", &self.http.as_ref().map(HttpFetcher::config))
            .finish_non_exhaustive()
    }
}

impl HostContext {
    /// Services with the given store and HTTP disabled.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { http: None, kv }
    }

    /// In-memory store, HTTP disabled.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()))
    }

    pub fn with_http(mut self, fetcher: HttpFetcher) -> Self {
        self.http = Some(fetcher);
        self
    }

    /// Build from environment variables: `KV_FILE` (default `./kv.json`)
    /// plus [`HttpConfig::from_env`]. HTTP requests run on `runtime`.
    pub fn from_env(runtime: tokio::runtime::Handle) -> Result<Self, PluginError> {
        let kv_file = std::env::var("KV_FILE").unwrap_or_else(|_| "kv.json".to_string());
        let kv = JsonFileKvStore::open(kv_file)?;
        let fetcher = HttpFetcher::new(HttpConfig::from_env(), runtime);
        Ok(Self::new(Arc::new(kv)).with_http(fetcher))
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }
}

impl HostServices for HostContext {
    fn trace(&self, plugin: &str, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::info!(plugin = %plugin, "{msg}");
    }

    fn http_get(&self, plugin: &str, url: &str) -> Result<Vec<u8>, PluginError> {
        let fetcher = self.http.as_ref().ok_or_else(|| {
            PluginError::PermissionDenied(format!("HTTP is disabled for plugin '{plugin}'"))
        })?;
        let body = fetcher.get(url)?;
        tracing::debug!(plugin = %plugin, url = %url, bytes = body.len(), "plugin http_get");
        Ok(body)
    }

    fn kv_set(&self, plugin: &str, key: &str, value: &[u8]) -> Result<(), PluginError> {
        tracing::trace!(plugin = %plugin, key = %key, bytes = value.len(), "plugin kv_set");
        self.kv.set(key, value)
    }

    fn kv_get(&self, plugin: &str, key: &str) -> Result<Option<Vec<u8>>, PluginError> {
        tracing::trace!(plugin = %plugin, key = %key, "plugin kv_get");
        self.kv.get(key)
    }
}
