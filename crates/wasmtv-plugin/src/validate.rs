//! Admission checks run on a module's bytes before it is compiled.

use wasmparser::{ExternalKind, Parser, Payload, TypeRef};

use crate::abi::{
    FREE_EXPORT, HOST_IMPORTS, HOST_NAMESPACE, MALLOC_EXPORT, MEMORY_EXPORT, REQUIRED_EXPORTS,
};
use crate::error::PluginError;

/// What the host learned about an admitted module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInterface {
    /// Host services the module imports.
    pub imports: Vec<String>,
    /// The module exports `malloc`, so service buffers are placed with it.
    pub has_allocator: bool,
    /// The module exports `free`. The host never calls it; buffers belong
    /// to the plugin once transferred.
    pub has_free: bool,
}

/// Validate WASM imports and exports against the plugin contract.
///
/// Imports must be functions from the host namespace with known names.
/// The three entry points and the memory export are mandatory.
pub fn validate_module(wasm_bytes: &[u8]) -> Result<ModuleInterface, PluginError> {
    let mut interface = ModuleInterface::default();
    let mut func_exports: Vec<String> = Vec::new();
    let mut has_memory = false;

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| PluginError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        match payload {
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(|e| {
                        PluginError::WasmValidation(format!("failed to read import: {e}"))
                    })?;

                    if import.module != HOST_NAMESPACE {
                        return Err(PluginError::WasmValidation(format!(
                            "unauthorized import namespace: '{}' (import: '{}'); \
                             only '{HOST_NAMESPACE}' is provided",
                            import.module, import.name
                        )));
                    }
                    if !HOST_IMPORTS.contains(&import.name) {
                        return Err(PluginError::WasmValidation(format!(
                            "unknown host function '{}'; available: {HOST_IMPORTS:?}",
                            import.name
                        )));
                    }
                    if !matches!(import.ty, TypeRef::Func(_)) {
                        return Err(PluginError::WasmValidation(format!(
                            "host import '{}' must be a function",
                            import.name
                        )));
                    }
                    interface.imports.push(import.name.to_string());
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.map_err(|e| {
                        PluginError::WasmValidation(format!("failed to read export: {e}"))
                    })?;
                    match export.kind {
                        ExternalKind::Func => func_exports.push(export.name.to_string()),
                        ExternalKind::Memory if export.name == MEMORY_EXPORT => has_memory = true,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    for required in REQUIRED_EXPORTS {
        if !func_exports.iter().any(|e| e == required) {
            return Err(PluginError::WasmValidation(format!(
                "missing required export '{required}'"
            )));
        }
    }
    if !has_memory {
        return Err(PluginError::WasmValidation(format!(
            "missing '{MEMORY_EXPORT}' export"
        )));
    }

    interface.has_allocator = func_exports.iter().any(|e| e == MALLOC_EXPORT);
    interface.has_free = func_exports.iter().any(|e| e == FREE_EXPORT);
    Ok(interface)
}
