//! Ownership transfer of host-produced bytes into plugin memory.
//!
//! `http_get` and `kv_get` hand the plugin a buffer it owns from then on.
//! On the host side that buffer is a [`ServiceBuffer`]: a move-only
//! capability that can be transferred exactly once. Transferring writes
//! the (address, length) pair into the caller's output slots and consumes
//! the handle, so the host keeps no way to touch the bytes afterwards.

use serde::Serialize;

use crate::error::PluginError;
use crate::memory::{GuestMemory, GuestPtr, GuestSlice};

const HEAP_ALIGN: u64 = 8;

/// Where a service buffer was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferOrigin {
    /// Returned by the plugin's exported `malloc`; the plugin frees it.
    GuestAllocator,
    /// Carved from pages the host grew on the plugin's behalf; the plugin
    /// may overwrite it but has no allocator to release it to.
    HostHeap,
    /// Nothing placed. Transfers as `(0, 0)`.
    Empty,
}

#[must_use = "a service buffer must be transferred to the plugin"]
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceBuffer {
    slice: GuestSlice,
    origin: BufferOrigin,
}

impl ServiceBuffer {
    /// Bytes were already copied to `slice`.
    pub(crate) fn placed(slice: GuestSlice, origin: BufferOrigin) -> Self {
        Self { slice, origin }
    }

    /// The zero-length, null-address result.
    pub fn empty() -> Self {
        Self {
            slice: GuestSlice::EMPTY,
            origin: BufferOrigin::Empty,
        }
    }

    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    /// Hand the buffer to the plugin through its output slots.
    pub fn transfer(
        self,
        mem: &mut GuestMemory<'_>,
        out_ptr: GuestPtr,
        out_len: GuestPtr,
        ledger: &mut TransferLedger,
    ) -> Result<GuestSlice, PluginError> {
        mem.write_ptr(out_ptr, self.slice.ptr)?;
        mem.set_u32(out_len, self.slice.len)?;
        if self.origin != BufferOrigin::Empty {
            ledger.record(self.slice.len);
        }
        Ok(self.slice)
    }
}

/// Running totals of what an instance has been handed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferLedger {
    pub buffers: u64,
    pub bytes: u64,
}

impl TransferLedger {
    fn record(&mut self, len: u32) {
        self.buffers += 1;
        self.bytes += u64::from(len);
    }
}

/// Bump allocator over memory the host grew for a plugin without its own
/// allocator. Space is never reclaimed; the instance's memory limit bounds
/// it.
#[derive(Debug, Clone, Default)]
pub struct HostHeap {
    next: u64,
    end: u64,
}

impl HostHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `len` bytes from the current region, if they fit.
    pub fn take(&mut self, len: u32) -> Option<GuestPtr> {
        let start = self.next.next_multiple_of(HEAP_ALIGN);
        let end = start.checked_add(u64::from(len))?;
        if start == 0 || end > self.end {
            return None;
        }
        let ptr = u32::try_from(start).ok()?;
        self.next = end;
        Some(GuestPtr::new(ptr))
    }

    /// Switch to a freshly grown region. Whatever was left of the previous
    /// region is abandoned.
    pub fn adopt(&mut self, region: GuestSlice) {
        self.next = u64::from(region.ptr.offset());
        self.end = region.end();
    }
}
