//! Key-value storage behind `kv_set` / `kv_get`.
//!
//! One store is shared by every plugin instance the host runs. Values are
//! opaque byte strings; the last write to a key wins.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::error::PluginError;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PluginError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), PluginError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PluginError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), PluginError> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Store persisted as a JSON object of `key → [byte, ...]`.
///
/// The whole file is rewritten on every `set` through a temp file in the
/// same directory, then renamed over the old one.
#[derive(Debug)]
pub struct JsonFileKvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl JsonFileKvStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PluginError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), keys = entries.len(), "kv store opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), PluginError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let json = serde_json::to_vec_pretty(entries)?;
        let write = || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&json)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&self.path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| {
            PluginError::Kv(format!("failed to persist {}: {e}", self.path.display()))
        })
    }
}

impl KvStore for JsonFileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PluginError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), PluginError> {
        // lock held across the write so the file matches the last setter;
        // memory only changes once the file does
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        next.insert(key.to_string(), value.to_vec());
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_last_write_wins() {
        let store = MemoryKvStore::new();
        store.set("k", b"v1").unwrap();
        store.set("k", b"v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"v2"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_missing_key() {
        let store = MemoryKvStore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_memory_binary_values() {
        let store = MemoryKvStore::new();
        let value = [0u8, 1, 0, 255, 0];
        store.set("bin", &value).unwrap();
        assert_eq!(store.get("bin").unwrap().unwrap(), value);
    }

    #[test]
    fn test_memory_concurrent_writers() {
        let store = Arc::new(MemoryKvStore::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.set("shared", &[i]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let value = store.get("shared").unwrap().unwrap();
        assert_eq!(value.len(), 1);
        assert!(value[0] < 8);
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileKvStore::open(dir.path().join("kv.json")).unwrap();
        assert_eq!(store.get("anything").unwrap(), None);
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");

        let store = JsonFileKvStore::open(&path).unwrap();
        store.set("show:1", &[1, 0, 2]).unwrap();
        store.set("show:1", b"latest").unwrap();
        store.set("other", b"").unwrap();
        drop(store);

        let reopened = JsonFileKvStore::open(&path).unwrap();
        assert_eq!(reopened.get("show:1").unwrap().unwrap(), b"latest");
        assert_eq!(reopened.get("other").unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_file_store_format_is_byte_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        let store = JsonFileKvStore::open(&path).unwrap();
        store.set("k", &[0, 7]).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({ "k": [0, 7] }));
    }

    #[test]
    fn test_file_store_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, r#"{ "greeting": [104, 105] }"#).unwrap();

        let store = JsonFileKvStore::open(&path).unwrap();
        assert_eq!(store.get("greeting").unwrap().unwrap(), b"hi");
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn test_file_store_empty_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, "\n").unwrap();
        let store = JsonFileKvStore::open(&path).unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_file_store_failed_write_keeps_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        let store = JsonFileKvStore::open(&path).unwrap();
        store.set("k", b"old").unwrap();

        std::fs::remove_dir_all(dir.path()).unwrap();
        let err = store.set("k", b"new").unwrap_err();
        assert!(matches!(err, PluginError::Kv(_)));
        assert!(err.to_string().contains("failed to persist"));
        let err = store.set("fresh", b"v").unwrap_err();
        assert!(matches!(err, PluginError::Kv(_)));

        assert_eq!(store.get("k").unwrap().unwrap(), b"old");
        assert_eq!(store.get("fresh").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, "not json").unwrap();
        let err = JsonFileKvStore::open(&path).unwrap_err();
        assert!(matches!(err, PluginError::Serialization(_)));
    }
}
