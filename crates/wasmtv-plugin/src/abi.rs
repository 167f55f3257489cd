//! Wire-level names and layouts shared by host and plugin.
//!
//! Plugins are wasm32 modules: every pointer crossing the boundary is a
//! 32-bit little-endian offset into the plugin's own linear memory.

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Import module name the host services are bound under.
pub const HOST_NAMESPACE: &str = "wasmtv";

pub const TRACE: &str = "trace";
pub const HTTP_GET: &str = "http_get";
pub const KV_SET: &str = "kv_set";
pub const KV_GET: &str = "kv_get";

/// Every function a plugin may import from [`HOST_NAMESPACE`].
pub const HOST_IMPORTS: &[&str] = &[TRACE, HTTP_GET, KV_SET, KV_GET];

pub const ON_LOAD: &str = "on_load";
pub const ON_UNLOAD: &str = "on_unload";
pub const ON_FILE_FOUND: &str = "on_file_found";

/// Exports a module must provide to be admitted.
pub const REQUIRED_EXPORTS: &[&str] = &[ON_LOAD, ON_UNLOAD, ON_FILE_FOUND];

/// The plugin's linear memory export.
pub const MEMORY_EXPORT: &str = "memory";

/// Optional allocator exports. When present the host places service
/// buffers with `malloc`, and the plugin releases them with its own `free`.
pub const MALLOC_EXPORT: &str = "malloc";
pub const FREE_EXPORT: &str = "free";

/// Entry-point status for success. Any other value is a failure.
pub const STATUS_OK: i32 = 0;

pub const WASM_PAGE_SIZE: u64 = 65_536;

/// Size of a guest pointer on wasm32.
pub const POINTER_SIZE: u32 = 4;

/// `struct FileInfo { char* name; char* library; }`
pub const FILE_RECORD_SIZE: u32 = 2 * POINTER_SIZE;
pub const FILE_RECORD_NAME_OFFSET: u32 = 0;
pub const FILE_RECORD_LIBRARY_OFFSET: u32 = POINTER_SIZE;

/// One discovered file, as the host knows it.
///
/// The host lays this out in plugin memory only for the duration of a
/// single `on_file_found` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub library: String,
}

impl FileRecord {
    pub fn new(library: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            name: name.into(),
        }
    }

    /// Both fields travel as C strings, so neither may contain NUL.
    pub fn validate(&self) -> Result<(), PluginError> {
        for (field, value) in [("name", &self.name), ("library", &self.library)] {
            if value.as_bytes().contains(&0) {
                return Err(PluginError::HostFunction(format!(
                    "file record {field} contains a NUL byte: {value:?}"
                )));
            }
        }
        Ok(())
    }

    /// Bytes needed in plugin memory: the record itself plus both strings
    /// with their terminators.
    pub fn encoded_len(&self) -> u64 {
        u64::from(FILE_RECORD_SIZE) + self.name.len() as u64 + 1 + self.library.len() as u64 + 1
    }
}

/// Result of delivering one file to one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOutcome {
    /// `on_file_found` returned 0.
    Processed,
    /// `on_file_found` returned this non-zero status. The session goes on.
    Failed(i32),
}

impl FileOutcome {
    pub fn from_status(status: i32) -> Self {
        if status == STATUS_OK {
            FileOutcome::Processed
        } else {
            FileOutcome::Failed(status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_exports() {
        assert_eq!(REQUIRED_EXPORTS, &["on_load", "on_unload", "on_file_found"]);
    }

    #[test]
    fn test_host_imports() {
        assert_eq!(HOST_IMPORTS.len(), 4);
        assert!(HOST_IMPORTS.contains(&"trace"));
        assert!(HOST_IMPORTS.contains(&"kv_get"));
        assert!(!HOST_IMPORTS.contains(&"is_promise_complete"));
    }

    #[test]
    fn test_file_record_layout() {
        assert_eq!(FILE_RECORD_SIZE, 8);
        assert_eq!(FILE_RECORD_NAME_OFFSET, 0);
        assert_eq!(FILE_RECORD_LIBRARY_OFFSET, 4);
    }

    #[test]
    fn test_file_record_encoded_len() {
        let record = FileRecord::new("movies", "somefile.mp4");
        assert_eq!(record.name, "somefile.mp4");
        assert_eq!(record.library, "movies");
        assert_eq!(record.encoded_len(), 8 + 13 + 7);
    }

    #[test]
    fn test_file_record_rejects_nul() {
        let record = FileRecord::new("movies", "bad\0name.mkv");
        let err = record.validate().unwrap_err();
        assert!(matches!(err, PluginError::HostFunction(_)));
        assert!(err.to_string().contains("name"));

        FileRecord::new("movies", "ok.mkv").validate().unwrap();
    }

    #[test]
    fn test_outcome_from_status() {
        assert_eq!(FileOutcome::from_status(0), FileOutcome::Processed);
        assert_eq!(FileOutcome::from_status(-1), FileOutcome::Failed(-1));
        assert_eq!(FileOutcome::from_status(7), FileOutcome::Failed(7));
    }

    #[test]
    fn test_file_record_serialization() {
        let record = FileRecord::new("tv", "show.s01e01.mkv");
        let json = serde_json::to_string(&record).unwrap();
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
