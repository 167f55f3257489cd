//! Bounds-checked access to a plugin's linear memory.
//!
//! Nothing here trusts a guest-supplied offset or length. Every access is
//! resolved to a byte range with checked arithmetic first, and anything
//! that falls outside the memory is reported as a boundary violation
//! rather than a panic.

use std::fmt;
use std::ops::Range;

use crate::error::PluginError;

/// Longest C string the host will scan for a terminator.
pub const MAX_CSTR_LEN: usize = 64 * 1024;

/// An offset into plugin memory. Offset 0 doubles as the null pointer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestPtr(u32);

impl GuestPtr {
    pub const NULL: GuestPtr = GuestPtr(0);

    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    pub const fn offset(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `n` bytes further on, or a violation if that wraps.
    pub fn add(self, n: u32) -> Result<Self, PluginError> {
        self.0.checked_add(n).map(Self).ok_or_else(|| {
            PluginError::BoundaryViolation(format!("pointer {self} + {n} overflows"))
        })
    }
}

impl From<u32> for GuestPtr {
    fn from(offset: u32) -> Self {
        Self(offset)
    }
}

impl fmt::Display for GuestPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An (offset, length) pair describing bytes in plugin memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestSlice {
    pub ptr: GuestPtr,
    pub len: u32,
}

impl GuestSlice {
    /// The zero-length, null-address result.
    pub const EMPTY: GuestSlice = GuestSlice {
        ptr: GuestPtr::NULL,
        len: 0,
    };

    pub const fn new(ptr: GuestPtr, len: u32) -> Self {
        Self { ptr, len }
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte, widened so it cannot overflow.
    pub fn end(&self) -> u64 {
        u64::from(self.ptr.offset()) + u64::from(self.len)
    }

    pub fn overlaps(&self, other: &GuestSlice) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        u64::from(self.ptr.offset()) < other.end() && u64::from(other.ptr.offset()) < self.end()
    }
}

/// A view over the bytes of one plugin's memory.
///
/// Borrowed for the span of a single host operation; re-acquire it after
/// anything that may grow the memory.
pub struct GuestMemory<'a> {
    data: &'a mut [u8],
}

macro_rules! le_accessors {
    ($($get:ident, $set:ident, $ty:ty;)*) => {
        $(
            pub fn $get(&self, ptr: GuestPtr) -> Result<$ty, PluginError> {
                let range = self.range(ptr, std::mem::size_of::<$ty>())?;
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&self.data[range]);
                Ok(<$ty>::from_le_bytes(buf))
            }

            pub fn $set(&mut self, ptr: GuestPtr, value: $ty) -> Result<(), PluginError> {
                let range = self.range(ptr, std::mem::size_of::<$ty>())?;
                self.data[range].copy_from_slice(&value.to_le_bytes());
                Ok(())
            }
        )*
    };
}

impl<'a> GuestMemory<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn range(&self, ptr: GuestPtr, len: usize) -> Result<Range<usize>, PluginError> {
        let start = ptr.offset() as usize;
        let end = start.checked_add(len).ok_or_else(|| {
            PluginError::BoundaryViolation(format!("range {ptr}+{len} overflows"))
        })?;
        if end > self.data.len() {
            return Err(PluginError::BoundaryViolation(format!(
                "range {ptr}+{len} exceeds memory of {} bytes",
                self.data.len()
            )));
        }
        Ok(start..end)
    }

    /// Fail unless the whole slice lies inside memory.
    pub fn check(&self, slice: GuestSlice) -> Result<(), PluginError> {
        self.range(slice.ptr, slice.len as usize).map(|_| ())
    }

    pub fn read_bytes(&self, slice: GuestSlice) -> Result<&[u8], PluginError> {
        let range = self.range(slice.ptr, slice.len as usize)?;
        Ok(&self.data[range])
    }

    pub fn write_bytes(&mut self, ptr: GuestPtr, bytes: &[u8]) -> Result<(), PluginError> {
        let range = self.range(ptr, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn fill(&mut self, slice: GuestSlice, byte: u8) -> Result<(), PluginError> {
        let range = self.range(slice.ptr, slice.len as usize)?;
        self.data[range].fill(byte);
        Ok(())
    }

    /// Bytes of the NUL-terminated string at `ptr`, terminator excluded.
    pub fn read_cstr(&self, ptr: GuestPtr) -> Result<&[u8], PluginError> {
        if ptr.is_null() {
            return Err(PluginError::BoundaryViolation(
                "null string pointer".to_string(),
            ));
        }
        let start = ptr.offset() as usize;
        if start >= self.data.len() {
            return Err(PluginError::BoundaryViolation(format!(
                "string at {ptr} starts beyond memory of {} bytes",
                self.data.len()
            )));
        }
        let window_end = self.data.len().min(start.saturating_add(MAX_CSTR_LEN + 1));
        let window = &self.data[start..window_end];
        match window.iter().position(|b| *b == 0) {
            Some(len) => Ok(&window[..len]),
            None => Err(PluginError::BoundaryViolation(format!(
                "string at {ptr} is not NUL-terminated within {} bytes",
                window.len()
            ))),
        }
    }

    /// Write `value` followed by a NUL. Returns the span written,
    /// terminator included.
    pub fn write_cstr(&mut self, ptr: GuestPtr, value: &str) -> Result<GuestSlice, PluginError> {
        let len = value.len();
        let range = self.range(ptr, len + 1)?;
        let (body, nul) = self.data[range].split_at_mut(len);
        body.copy_from_slice(value.as_bytes());
        nul[0] = 0;
        let total = u32::try_from(len + 1).map_err(|_| {
            PluginError::BoundaryViolation(format!("string of {len} bytes does not fit"))
        })?;
        Ok(GuestSlice::new(ptr, total))
    }

    /// Read a pointer-sized slot.
    pub fn read_ptr(&self, ptr: GuestPtr) -> Result<GuestPtr, PluginError> {
        self.get_u32(ptr).map(GuestPtr::new)
    }

    pub fn write_ptr(&mut self, slot: GuestPtr, value: GuestPtr) -> Result<(), PluginError> {
        self.set_u32(slot, value.offset())
    }

    le_accessors! {
        get_i8, set_i8, i8;
        get_u8, set_u8, u8;
        get_i16, set_i16, i16;
        get_u16, set_u16, u16;
        get_i32, set_i32, i32;
        get_u32, set_u32, u32;
        get_i64, set_i64, i64;
        get_u64, set_u64, u64;
        get_f32, set_f32, f32;
        get_f64, set_f64, f64;
    }
}
