//! WASM plugin sandbox using wasmtime.
//!
//! Each plugin runs in its own store with memory limits, a fuel budget and
//! an epoch deadline refreshed before every entry-point call. The host side
//! of the lifecycle lives here too: [`PluginInstance`] refuses out-of-order
//! calls and discards itself on any trap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use wasmtime::{Config, Engine, Linker, Memory, Module, Store, StoreLimitsBuilder, Trap, TypedFunc};

use crate::abi::{
    FileOutcome, FileRecord, FILE_RECORD_LIBRARY_OFFSET, FILE_RECORD_NAME_OFFSET,
    FILE_RECORD_SIZE, MALLOC_EXPORT, MEMORY_EXPORT, ON_FILE_FOUND, ON_LOAD, ON_UNLOAD, STATUS_OK,
    WASM_PAGE_SIZE,
};
use crate::error::PluginError;
use crate::host_functions::{self, HostState};
use crate::lease::LeaseArena;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::memory::{GuestMemory, GuestPtr, GuestSlice};
use crate::services::HostServices;
use crate::transfer::TransferLedger;
use crate::validate::validate_module;

// ─── Configuration ──────────────────────────────────────────────────────

/// Epoch tick interval for wall-clock deadlines.
pub const EPOCH_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Fuel (instructions) per entry-point call (default: 1_000_000_000).
    pub fuel_limit: u64,
    /// Wall-clock limit for `on_load` and `on_file_found` (default: 30 s).
    pub call_timeout: Duration,
    /// Wall-clock limit for `on_unload` (default: 5 s).
    pub unload_grace: Duration,
    /// Pages reserved for file records (default: 1).
    pub lease_pages: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000_000,
            call_timeout: Duration::from_secs(30),
            unload_grace: Duration::from_secs(5),
            lease_pages: 1,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("PLUGIN_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fuel_limit),
            call_timeout: std::env::var("PLUGIN_CALL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_timeout),
            unload_grace: std::env::var("PLUGIN_UNLOAD_GRACE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.unload_grace),
            lease_pages: std::env::var("PLUGIN_LEASE_PAGES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|pages| *pages > 0)
                .unwrap_or(defaults.lease_pages),
        }
    }
}

fn epoch_deadline_ticks(timeout: Duration) -> u64 {
    let interval_ms = EPOCH_TICK_INTERVAL.as_millis().max(1);
    let timeout_ms = timeout.as_millis().max(1);
    timeout_ms.div_ceil(interval_ms) as u64
}

// ─── Engine ─────────────────────────────────────────────────────────────

struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, interval: Duration) -> Result<Self, PluginError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::Builder::new()
            .name("plugin-epoch-ticker".to_string())
            .spawn(move || {
                while !stop_clone.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct EngineInner {
    engine: Engine,
    _ticker: EpochTicker,
}

/// Shared wasmtime engine with fuel metering and epoch interruption.
///
/// Cheap to clone. The epoch ticker thread stops when the last clone is
/// dropped.
#[derive(Clone)]
pub struct PluginEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for PluginEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEngine").finish_non_exhaustive()
    }
}

impl PluginEngine {
    pub fn new() -> Result<Self, PluginError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config)
            .map_err(|e| PluginError::Sandbox(format!("failed to create engine: {e}")))?;
        let ticker = EpochTicker::start(engine.clone(), EPOCH_TICK_INTERVAL)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                engine,
                _ticker: ticker,
            }),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }
}

// ─── Instance ───────────────────────────────────────────────────────────

/// Live wasmtime objects. Dropped as a unit when the instance is discarded.
struct Runtime {
    store: Store<HostState>,
    memory: Memory,
    on_load: TypedFunc<(), i32>,
    on_unload: TypedFunc<(), ()>,
    on_file_found: TypedFunc<i32, i32>,
}

/// One sandboxed plugin and the host's view of its lifecycle.
///
/// Calls into an instance are strictly sequential (`&mut self`).
pub struct PluginInstance {
    id: Uuid,
    name: String,
    config: SandboxConfig,
    lifecycle: Lifecycle,
    runtime: Option<Runtime>,
    /// Ledger snapshot taken when the store is dropped.
    final_ledger: TransferLedger,
    /// Keeps the epoch ticker alive for as long as the instance is.
    _engine: PluginEngine,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.lifecycle.state())
            .field("discarded", &self.lifecycle.is_discarded())
            .finish_non_exhaustive()
    }
}

impl PluginInstance {
    /// Validate, compile, link and instantiate a plugin module.
    ///
    /// Reserves the lease arena by growing the plugin's memory. The
    /// instance starts `Unloaded`; nothing in the plugin has run except its
    /// start function, if any.
    pub fn instantiate(
        engine: &PluginEngine,
        name: &str,
        wasm_bytes: &[u8],
        services: Arc<dyn HostServices>,
        config: SandboxConfig,
    ) -> Result<Self, PluginError> {
        let interface = validate_module(wasm_bytes)?;
        let plugin_engine = engine.clone();
        let engine = engine.engine();

        let module = Module::new(engine, wasm_bytes)
            .map_err(|e| PluginError::Load(format!("failed to compile plugin {name}: {e}")))?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(config.memory_limit)
            .instances(1)
            .build();
        let state = HostState::new(name, services, limits);
        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(config.fuel_limit)
            .map_err(|e| PluginError::Sandbox(format!("failed to set fuel budget: {e}")))?;
        store.set_epoch_deadline(epoch_deadline_ticks(config.call_timeout));

        let mut linker = Linker::new(engine);
        host_functions::link(&mut linker)?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| PluginError::Load(format!("failed to instantiate plugin {name}: {e}")))?;

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| PluginError::Load(format!("plugin {name} exports no memory")))?;
        let on_load = instance
            .get_typed_func::<(), i32>(&mut store, ON_LOAD)
            .map_err(|e| PluginError::Load(format!("{ON_LOAD} has the wrong signature: {e}")))?;
        let on_unload = instance
            .get_typed_func::<(), ()>(&mut store, ON_UNLOAD)
            .map_err(|e| PluginError::Load(format!("{ON_UNLOAD} has the wrong signature: {e}")))?;
        let on_file_found = instance
            .get_typed_func::<i32, i32>(&mut store, ON_FILE_FOUND)
            .map_err(|e| {
                PluginError::Load(format!("{ON_FILE_FOUND} has the wrong signature: {e}"))
            })?;
        if interface.has_allocator {
            let malloc = instance
                .get_typed_func::<i32, i32>(&mut store, MALLOC_EXPORT)
                .map_err(|e| {
                    PluginError::Load(format!("{MALLOC_EXPORT} has the wrong signature: {e}"))
                })?;
            store.data_mut().malloc = Some(malloc);
        }

        let pages = u64::from(config.lease_pages.max(1));
        let previous = memory
            .grow(&mut store, pages)
            .map_err(|_| PluginError::MemoryExceeded(name.to_string()))?;
        let (Ok(start), Ok(size)) = (
            u32::try_from(previous * WASM_PAGE_SIZE),
            u32::try_from(pages * WASM_PAGE_SIZE),
        ) else {
            return Err(PluginError::MemoryExceeded(name.to_string()));
        };
        store.data_mut().arena = LeaseArena::new(GuestSlice::new(GuestPtr::new(start), size));

        let id = Uuid::new_v4();
        tracing::info!(
            plugin = %name,
            instance = %id,
            allocator = interface.has_allocator,
            free = interface.has_free,
            imports = ?interface.imports,
            "plugin instantiated"
        );

        Ok(Self {
            id,
            name: name.to_string(),
            config,
            lifecycle: Lifecycle::new(name),
            runtime: Some(Runtime {
                store,
                memory,
                on_load,
                on_unload,
                on_file_found,
            }),
            final_ledger: TransferLedger::default(),
            _engine: plugin_engine,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// `on_load` returned 0 and the instance has not been unloaded.
    pub fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    pub fn is_discarded(&self) -> bool {
        self.lifecycle.is_discarded()
    }

    /// Buffers handed to the plugin so far.
    pub fn transferred(&self) -> TransferLedger {
        match &self.runtime {
            Some(rt) => rt.store.data().ledger,
            None => self.final_ledger,
        }
    }

    /// Run `on_load`. A non-zero status discards the instance for good.
    pub fn load(&mut self) -> Result<(), PluginError> {
        self.lifecycle.begin_load()?;
        self.sync_services_gate();

        let status = self.invoke(ON_LOAD, self.config.call_timeout, |rt| {
            rt.on_load.call(&mut rt.store, ())
        })?;

        if status != STATUS_OK {
            self.discard("on_load returned non-zero");
            return Err(PluginError::LoadFailed {
                plugin: self.name.clone(),
                status,
            });
        }

        self.lifecycle.complete_load()?;
        tracing::info!(plugin = %self.name, instance = %self.id, "plugin loaded");
        Ok(())
    }

    /// Deliver one discovered file.
    ///
    /// The record lives in a lease for exactly this call. A non-zero
    /// status is returned as [`FileOutcome::Failed`] and leaves the
    /// instance usable.
    pub fn file_found(&mut self, record: &FileRecord) -> Result<FileOutcome, PluginError> {
        self.lifecycle.ensure_ready()?;
        record.validate()?;
        self.sync_services_gate();

        let record_ptr = match self.write_record(record) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.release_leases()?;
                return Err(e);
            }
        };
        let result = self.invoke(ON_FILE_FOUND, self.config.call_timeout, |rt| {
            rt.on_file_found.call(&mut rt.store, record_ptr.offset() as i32)
        });
        self.release_leases()?;

        let status = result?;
        Ok(FileOutcome::from_status(status))
    }

    /// Run `on_unload` within the grace period, then discard the instance.
    ///
    /// Returns what the plugin was handed over its lifetime. The instance
    /// is gone afterwards whether or not the plugin returned in time.
    pub fn unload(&mut self) -> Result<TransferLedger, PluginError> {
        self.lifecycle.begin_unload()?;
        self.sync_services_gate();

        let result = self.invoke(ON_UNLOAD, self.config.unload_grace, |rt| {
            rt.on_unload.call(&mut rt.store, ())
        });
        if result.is_ok() {
            self.discard("unloaded");
        }
        result?;

        tracing::info!(
            plugin = %self.name,
            instance = %self.id,
            buffers = self.final_ledger.buffers,
            bytes = self.final_ledger.bytes,
            "plugin unloaded"
        );
        Ok(self.final_ledger)
    }

    fn sync_services_gate(&mut self) {
        let open = self.lifecycle.services_open();
        if let Some(rt) = &mut self.runtime {
            rt.store.data_mut().services_open = open;
        }
    }

    /// Lay the record and its strings out in a fresh lease.
    fn write_record(&mut self, record: &FileRecord) -> Result<GuestPtr, PluginError> {
        let rt = self.runtime_mut()?;
        let len = u32::try_from(record.encoded_len()).map_err(|_| {
            PluginError::HostFunction(format!("file record for {:?} is too large", record.name))
        })?;

        let (data, state) = rt.memory.data_and_store_mut(&mut rt.store);
        let lease = state.arena.lease(len)?;
        let mut mem = GuestMemory::new(data);

        let name = mem.write_cstr(lease.ptr.add(FILE_RECORD_SIZE)?, &record.name)?;
        let library = mem.write_cstr(name.ptr.add(name.len)?, &record.library)?;
        mem.write_ptr(lease.ptr.add(FILE_RECORD_NAME_OFFSET)?, name.ptr)?;
        mem.write_ptr(lease.ptr.add(FILE_RECORD_LIBRARY_OFFSET)?, library.ptr)?;
        Ok(lease.ptr)
    }

    /// Scrub and revoke this call's leases, if the instance survived it.
    fn release_leases(&mut self) -> Result<(), PluginError> {
        if let Some(rt) = &mut self.runtime {
            let (data, state) = rt.memory.data_and_store_mut(&mut rt.store);
            state.arena.release_all(&mut GuestMemory::new(data))?;
        }
        Ok(())
    }

    fn runtime_mut(&mut self) -> Result<&mut Runtime, PluginError> {
        let (name, state) = (&self.name, self.lifecycle.state());
        self.runtime.as_mut().ok_or_else(|| PluginError::InvalidState {
            plugin: name.clone(),
            operation: "call into",
            state,
        })
    }

    /// Call an entry point with a fresh fuel budget and deadline. Any
    /// error from the plugin side discards the instance.
    fn invoke<R>(
        &mut self,
        entry: &'static str,
        deadline: Duration,
        call: impl FnOnce(&mut Runtime) -> wasmtime::Result<R>,
    ) -> Result<R, PluginError> {
        let fuel = self.config.fuel_limit;
        let rt = self.runtime_mut()?;
        rt.store
            .set_fuel(fuel)
            .map_err(|e| PluginError::Sandbox(format!("failed to set fuel budget: {e}")))?;
        rt.store.set_epoch_deadline(epoch_deadline_ticks(deadline));

        let start = std::time::Instant::now();
        match call(rt) {
            Ok(value) => {
                tracing::debug!(
                    plugin = %self.name,
                    entry = %entry,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "entry point returned"
                );
                Ok(value)
            }
            Err(e) => {
                let err = self.classify(e, entry);
                tracing::error!(plugin = %self.name, entry = %entry, "plugin trapped: {err}");
                self.discard("trapped");
                Err(err)
            }
        }
    }

    fn classify(&self, err: wasmtime::Error, entry: &str) -> PluginError {
        let err = match err.downcast::<PluginError>() {
            Ok(host_err) => return host_err,
            Err(err) => err,
        };
        let name = self.name.clone();
        match err.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => PluginError::FuelExhausted(name),
            Some(Trap::Interrupt) if entry == ON_UNLOAD => PluginError::UnloadTimeout(name),
            Some(Trap::Interrupt) => PluginError::CallTimeout(name),
            Some(Trap::MemoryOutOfBounds) => PluginError::BoundaryViolation(format!(
                "plugin {name} accessed memory out of bounds in {entry}"
            )),
            _ => PluginError::Sandbox(format!("{entry} trapped: {err:#}")),
        }
    }

    /// Drop the store and its memory. Terminal.
    fn discard(&mut self, reason: &str) {
        if let Some(mut rt) = self.runtime.take() {
            rt.store.data_mut().arena.abandon();
            self.final_ledger = rt.store.data().ledger;
        }
        self.lifecycle.discard();
        tracing::debug!(plugin = %self.name, instance = %self.id, reason = %reason, "instance discarded");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
