//! Call-scoped leases of host-reserved plugin memory.
//!
//! FileRecords are host-owned and valid only inside the `on_file_found`
//! call that received them. The host writes them into an arena it reserved
//! by growing the plugin's memory, so the plugin's own allocator never
//! hands those pages out. Leases advance through the arena between calls,
//! which keeps a pointer retained from an earlier call pointing at
//! released memory instead of at the current record. Released leases are
//! zeroed and remembered, and any host service handed a pointer into them
//! reports a boundary violation.
//!
//! Detection stops at the host boundary. A plugin that loads through a
//! retained record pointer itself is reading its own linear memory, which
//! the host cannot intercept; it sees the scrubbed zeros (or a later
//! record once the span is re-leased), never the released data.

use crate::error::PluginError;
use crate::memory::{GuestMemory, GuestSlice};

const LEASE_ALIGN: u32 = 8;

#[derive(Debug, Clone)]
pub struct LeaseArena {
    region: GuestSlice,
    /// Next free byte, relative to `region.ptr`.
    cursor: u32,
    live: Vec<GuestSlice>,
    /// Released spans not yet reused. Never overlaps `live`.
    revoked: Vec<GuestSlice>,
}

impl LeaseArena {
    pub fn new(region: GuestSlice) -> Self {
        Self {
            region,
            cursor: 0,
            live: Vec::new(),
            revoked: Vec::new(),
        }
    }

    /// Carve `len` bytes out of the arena, wrapping to the start when the
    /// tail is too short.
    pub fn lease(&mut self, len: u32) -> Result<GuestSlice, PluginError> {
        if len == 0 || len > self.region.len {
            return Err(PluginError::HostFunction(format!(
                "lease of {len} bytes does not fit arena of {} bytes",
                self.region.len
            )));
        }
        let mut start = self.cursor.next_multiple_of(LEASE_ALIGN);
        if u64::from(start) + u64::from(len) > u64::from(self.region.len) {
            start = 0;
        }
        // a wrapped lease must not land on one still live in this call
        let slice = GuestSlice::new(self.region.ptr.add(start)?, len);
        if self.live.iter().any(|l| l.overlaps(&slice)) {
            return Err(PluginError::HostFunction(format!(
                "lease arena of {} bytes exhausted",
                self.region.len
            )));
        }
        self.cursor = start + len;
        self.revoked.retain(|r| !r.overlaps(&slice));
        self.live.push(slice);
        Ok(slice)
    }

    /// End of call: zero every live lease and revoke it.
    pub fn release_all(&mut self, mem: &mut GuestMemory<'_>) -> Result<(), PluginError> {
        for slice in std::mem::take(&mut self.live) {
            self.revoked.push(slice);
            mem.fill(slice, 0)?;
        }
        Ok(())
    }

    /// Forget live leases without touching memory. Used when the memory is
    /// about to be dropped anyway.
    pub fn abandon(&mut self) {
        self.revoked.append(&mut self.live);
    }

    /// A plugin-supplied input span must not reach into released leases.
    pub fn check_input(&self, span: GuestSlice) -> Result<(), PluginError> {
        let probe = if span.is_empty() {
            GuestSlice::new(span.ptr, 1)
        } else {
            span
        };
        if self.revoked.iter().any(|r| r.overlaps(&probe)) {
            return Err(PluginError::BoundaryViolation(format!(
                "pointer {} refers to a file record released after its call returned",
                span.ptr
            )));
        }
        Ok(())
    }

    /// Output slots are written by the host, so they may never point into
    /// host-owned lease memory, live or not.
    pub fn check_output(&self, slot: GuestSlice) -> Result<(), PluginError> {
        if self.region.overlaps(&slot) {
            return Err(PluginError::BoundaryViolation(format!(
                "output slot {} lies inside host-owned file record memory",
                slot.ptr
            )));
        }
        Ok(())
    }
}
