//! Host functions linked into every plugin under the `wasmtv` namespace.
//!
//! This is the only code that turns raw guest offsets into data. Each
//! function resolves its pointer arguments through [`GuestMemory`] and the
//! instance's [`LeaseArena`], hands owned values to [`HostServices`], and
//! returns results through [`ServiceBuffer::transfer`].
//!
//! Failure policy:
//! - a bad pointer, a pointer into a released file record or a negative
//!   length is a [`PluginError::BoundaryViolation`] and traps the plugin;
//! - a service that fails or is unavailable yields the `(0, 0)` result and
//!   a warning, and the plugin carries on.

use std::sync::Arc;

use wasmtime::{Caller, Extern, Linker, Memory, StoreLimits, TypedFunc};

use crate::abi::{
    HOST_NAMESPACE, HTTP_GET, KV_GET, KV_SET, MEMORY_EXPORT, POINTER_SIZE, TRACE, WASM_PAGE_SIZE,
};
use crate::error::PluginError;
use crate::lease::LeaseArena;
use crate::memory::{GuestMemory, GuestPtr, GuestSlice};
use crate::services::HostServices;
use crate::transfer::{BufferOrigin, HostHeap, ServiceBuffer, TransferLedger};

/// Per-instance data carried by the wasmtime store.
pub(crate) struct HostState {
    pub(crate) plugin: String,
    pub(crate) services: Arc<dyn HostServices>,
    /// Mirrors the lifecycle: services are served only while `Loaded`.
    pub(crate) services_open: bool,
    pub(crate) arena: LeaseArena,
    pub(crate) heap: HostHeap,
    /// The plugin's own allocator, resolved at instantiation.
    pub(crate) malloc: Option<TypedFunc<i32, i32>>,
    pub(crate) ledger: TransferLedger,
    pub(crate) limits: StoreLimits,
}

impl HostState {
    pub(crate) fn new(
        plugin: &str,
        services: Arc<dyn HostServices>,
        limits: StoreLimits,
    ) -> Self {
        Self {
            plugin: plugin.to_string(),
            services,
            services_open: false,
            arena: LeaseArena::new(GuestSlice::EMPTY),
            heap: HostHeap::new(),
            malloc: None,
            ledger: TransferLedger::default(),
            limits,
        }
    }
}

type HostCaller<'a> = Caller<'a, HostState>;

/// Register `trace`, `http_get`, `kv_set` and `kv_get`.
pub(crate) fn link(linker: &mut Linker<HostState>) -> Result<(), PluginError> {
    let wrap_err = |name: &str, e: wasmtime::Error| {
        PluginError::Sandbox(format!("failed to link host function '{name}': {e}"))
    };

    linker
        .func_wrap(
            HOST_NAMESPACE,
            TRACE,
            |mut caller: HostCaller<'_>, message: i32| host_trace(&mut caller, message),
        )
        .map_err(|e| wrap_err(TRACE, e))?;

    linker
        .func_wrap(
            HOST_NAMESPACE,
            HTTP_GET,
            |mut caller: HostCaller<'_>, url: i32, out_ptr: i32, out_len: i32| {
                host_http_get(&mut caller, url, out_ptr, out_len)
            },
        )
        .map_err(|e| wrap_err(HTTP_GET, e))?;

    linker
        .func_wrap(
            HOST_NAMESPACE,
            KV_SET,
            |mut caller: HostCaller<'_>, key: i32, value: i32, len: i32| {
                host_kv_set(&mut caller, key, value, len)
            },
        )
        .map_err(|e| wrap_err(KV_SET, e))?;

    linker
        .func_wrap(
            HOST_NAMESPACE,
            KV_GET,
            |mut caller: HostCaller<'_>, key: i32, out_ptr: i32, out_len: i32| {
                host_kv_get(&mut caller, key, out_ptr, out_len)
            },
        )
        .map_err(|e| wrap_err(KV_GET, e))?;

    Ok(())
}

// ─── Host functions ─────────────────────────────────────────────────────

fn host_trace(caller: &mut HostCaller<'_>, message: i32) -> wasmtime::Result<()> {
    let message = read_input_cstr(caller, message)?;
    let state = caller.data();
    if !state.services_open {
        tracing::warn!(plugin = %state.plugin, "trace called outside loaded state, dropped");
        return Ok(());
    }
    let message = String::from_utf8_lossy(&message);
    state.services.trace(&state.plugin, &message);
    Ok(())
}

fn host_http_get(
    caller: &mut HostCaller<'_>,
    url: i32,
    out_ptr: i32,
    out_len: i32,
) -> wasmtime::Result<()> {
    let (out_ptr, out_len) = check_output_slots(caller, out_ptr, out_len)?;
    let url = read_input_cstr(caller, url)?;

    let body = match service_gate(caller, HTTP_GET, &url) {
        Some((services, plugin, url)) => match services.http_get(&plugin, &url) {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!(plugin = %plugin, url = %url, "http_get failed: {e}");
                None
            }
        },
        None => None,
    };

    deliver(caller, body, out_ptr, out_len)
}

fn host_kv_set(caller: &mut HostCaller<'_>, key: i32, value: i32, len: i32) -> wasmtime::Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        PluginError::BoundaryViolation(format!("kv_set called with negative length {len}"))
    })?;
    let key = read_input_cstr(caller, key)?;
    let value = read_input_bytes(caller, GuestSlice::new(guest_ptr(value), len))?;

    if let Some((services, plugin, key)) = service_gate(caller, KV_SET, &key) {
        if let Err(e) = services.kv_set(&plugin, &key, &value) {
            tracing::warn!(plugin = %plugin, key = %key, "kv_set failed: {e}");
        }
    }
    Ok(())
}

fn host_kv_get(
    caller: &mut HostCaller<'_>,
    key: i32,
    out_ptr: i32,
    out_len: i32,
) -> wasmtime::Result<()> {
    let (out_ptr, out_len) = check_output_slots(caller, out_ptr, out_len)?;
    let key = read_input_cstr(caller, key)?;

    let value = match service_gate(caller, KV_GET, &key) {
        Some((services, plugin, key)) => match services.kv_get(&plugin, &key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(plugin = %plugin, key = %key, "kv_get failed: {e}");
                None
            }
        },
        None => None,
    };

    deliver(caller, value, out_ptr, out_len)
}

// ─── Marshaling helpers ─────────────────────────────────────────────────

/// Guest offsets arrive as `i32`; reinterpret the bits as an address.
fn guest_ptr(raw: i32) -> GuestPtr {
    GuestPtr::new(raw as u32)
}

fn guest_memory(caller: &mut HostCaller<'_>) -> Result<Memory, PluginError> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or_else(|| PluginError::Sandbox(format!("plugin has no '{MEMORY_EXPORT}' export")))
}

/// Decide whether a service call goes through. Returns what the service
/// needs, or `None` when the call must be answered empty.
fn service_gate(
    caller: &HostCaller<'_>,
    function: &'static str,
    argument: &[u8],
) -> Option<(Arc<dyn HostServices>, String, String)> {
    let state = caller.data();
    if !state.services_open {
        tracing::warn!(
            plugin = %state.plugin,
            function = %function,
            "host service called outside loaded state, answering empty"
        );
        return None;
    }
    match std::str::from_utf8(argument) {
        Ok(argument) => Some((
            state.services.clone(),
            state.plugin.clone(),
            argument.to_string(),
        )),
        Err(e) => {
            tracing::warn!(
                plugin = %state.plugin,
                function = %function,
                "argument is not valid UTF-8: {e}"
            );
            None
        }
    }
}

/// Copy a NUL-terminated string out of plugin memory.
fn read_input_cstr(caller: &mut HostCaller<'_>, ptr: i32) -> Result<Vec<u8>, PluginError> {
    let ptr = guest_ptr(ptr);
    let memory = guest_memory(caller)?;
    let (data, state) = memory.data_and_store_mut(&mut *caller);
    let mem = GuestMemory::new(data);

    let bytes = mem.read_cstr(ptr)?;
    state
        .arena
        .check_input(GuestSlice::new(ptr, bytes.len() as u32 + 1))?;
    Ok(bytes.to_vec())
}

/// Copy `len` bytes out of plugin memory. The host never keeps a view.
fn read_input_bytes(caller: &mut HostCaller<'_>, span: GuestSlice) -> Result<Vec<u8>, PluginError> {
    let memory = guest_memory(caller)?;
    let (data, state) = memory.data_and_store_mut(&mut *caller);
    let mem = GuestMemory::new(data);

    let bytes = mem.read_bytes(span)?;
    state.arena.check_input(span)?;
    Ok(bytes.to_vec())
}

/// Both output slots must be non-null, in bounds and outside the lease
/// arena before any service runs.
fn check_output_slots(
    caller: &mut HostCaller<'_>,
    out_ptr: i32,
    out_len: i32,
) -> Result<(GuestPtr, GuestPtr), PluginError> {
    let memory = guest_memory(caller)?;
    let (data, state) = memory.data_and_store_mut(&mut *caller);
    let mem = GuestMemory::new(data);

    let slots = (guest_ptr(out_ptr), guest_ptr(out_len));
    for slot in [slots.0, slots.1] {
        if slot.is_null() {
            return Err(PluginError::BoundaryViolation(
                "null output slot".to_string(),
            ));
        }
        let span = GuestSlice::new(slot, POINTER_SIZE);
        mem.check(span)?;
        state.arena.check_output(span)?;
    }
    Ok(slots)
}

/// Place `bytes` in plugin memory and transfer them through the slots.
/// `None`, empty input and allocation failure all transfer `(0, 0)`.
fn deliver(
    caller: &mut HostCaller<'_>,
    bytes: Option<Vec<u8>>,
    out_ptr: GuestPtr,
    out_len: GuestPtr,
) -> wasmtime::Result<()> {
    let buffer = match bytes {
        Some(bytes) if !bytes.is_empty() => place(caller, &bytes)?,
        _ => ServiceBuffer::empty(),
    };

    let memory = guest_memory(caller)?;
    let (data, state) = memory.data_and_store_mut(&mut *caller);
    let mut mem = GuestMemory::new(data);
    let origin = buffer.origin();
    let slice = buffer.transfer(&mut mem, out_ptr, out_len, &mut state.ledger)?;
    tracing::trace!(
        plugin = %state.plugin,
        ptr = %slice.ptr,
        len = slice.len,
        origin = ?origin,
        "buffer transferred"
    );
    Ok(())
}

fn place(caller: &mut HostCaller<'_>, bytes: &[u8]) -> wasmtime::Result<ServiceBuffer> {
    let Ok(len) = u32::try_from(bytes.len()) else {
        tracing::warn!(plugin = %caller.data().plugin, bytes = bytes.len(), "result too large for plugin memory");
        return Ok(ServiceBuffer::empty());
    };

    let malloc = caller.data().malloc.clone();
    let placed = match malloc {
        Some(malloc) => {
            guest_malloc(caller, &malloc, len)?.map(|ptr| (ptr, BufferOrigin::GuestAllocator))
        }
        None => host_heap_alloc(caller, len)?.map(|ptr| (ptr, BufferOrigin::HostHeap)),
    };
    let Some((ptr, origin)) = placed else {
        tracing::warn!(plugin = %caller.data().plugin, bytes = len, "could not allocate result buffer");
        return Ok(ServiceBuffer::empty());
    };

    let slice = GuestSlice::new(ptr, len);
    let memory = guest_memory(caller)?;
    let (data, state) = memory.data_and_store_mut(&mut *caller);
    state.arena.check_output(slice)?;
    GuestMemory::new(data).write_bytes(ptr, bytes)?;
    Ok(ServiceBuffer::placed(slice, origin))
}

/// Call the plugin's own `malloc`. A null return is an allocation failure.
fn guest_malloc(
    caller: &mut HostCaller<'_>,
    malloc: &TypedFunc<i32, i32>,
    len: u32,
) -> wasmtime::Result<Option<GuestPtr>> {
    let Ok(size) = i32::try_from(len) else {
        return Ok(None);
    };
    let ptr = guest_ptr(malloc.call(&mut *caller, size)?);
    Ok((!ptr.is_null()).then_some(ptr))
}

/// Bump-allocate from pages the host grows for the plugin.
fn host_heap_alloc(caller: &mut HostCaller<'_>, len: u32) -> wasmtime::Result<Option<GuestPtr>> {
    if let Some(ptr) = caller.data_mut().heap.take(len) {
        return Ok(Some(ptr));
    }

    let pages = u64::from(len).div_ceil(WASM_PAGE_SIZE).max(1);
    let memory = guest_memory(caller)?;
    let previous = match memory.grow(&mut *caller, pages) {
        Ok(previous) => previous,
        Err(e) => {
            tracing::warn!(plugin = %caller.data().plugin, pages, "could not grow plugin memory: {e}");
            return Ok(None);
        }
    };

    let (Ok(start), Ok(size)) = (
        u32::try_from(previous * WASM_PAGE_SIZE),
        u32::try_from(pages * WASM_PAGE_SIZE),
    ) else {
        return Ok(None);
    };
    let heap = &mut caller.data_mut().heap;
    heap.adopt(GuestSlice::new(GuestPtr::new(start), size));
    Ok(heap.take(len))
}
