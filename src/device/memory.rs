//! Host and device memory for tensor data.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

/// Number of DDR banks exposed by the accelerator card.
pub const DDR_BANK_COUNT: u8 = 4;

/// Device memory bank a buffer is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBank {
    Ddr(u8),
}

impl Default for MemoryBank {
    fn default() -> Self {
        MemoryBank::Ddr(0)
    }
}

impl fmt::Display for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryBank::Ddr(index) => write!(f, "DDR[{index}]"),
        }
    }
}

/// Zero-initialised `f32` array whose start address honours a DMA alignment.
pub struct AlignedHostBuffer {
    ptr: NonNull<f32>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer owns its allocation exclusively, like a `Vec<f32>`, and
// only hands out slices through `&self`/`&mut self`.
unsafe impl Send for AlignedHostBuffer {}
// SAFETY: shared access is read-only through `as_slice`.
unsafe impl Sync for AlignedHostBuffer {}

impl AlignedHostBuffer {
    /// Allocates `len` zeroed floats aligned to `alignment` bytes.
    ///
    /// # Panics
    /// Panics on capacity overflow or if `alignment` is not a power of two,
    /// mirroring `Vec::with_capacity`. Aborts if the allocator fails.
    pub fn zeroed(len: usize, alignment: usize) -> Self {
        let bytes = len
            .checked_mul(std::mem::size_of::<f32>())
            .expect("capacity overflow");
        // Zero-sized allocations are not allowed; one byte keeps the pointer aligned and owned.
        let layout = Layout::from_size_align(bytes.max(1), alignment.max(std::mem::align_of::<f32>()))
            .expect("invalid host buffer layout");
        // SAFETY: `layout` has a non-zero size (at least one byte) and a
        // power-of-two alignment checked by `Layout::from_size_align`.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw as *mut f32) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Self { ptr, len, layout }
    }

    pub fn filled(len: usize, alignment: usize, value: f32) -> Self {
        let mut buffer = Self::zeroed(len, alignment);
        buffer.as_mut_slice().fill(value);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// True when the allocation can be mapped by a device requiring `required` byte alignment.
    pub fn satisfies_alignment(&self, required: usize) -> bool {
        required != 0
            && self.layout.align() % required == 0
            && (self.ptr.as_ptr() as usize) % required == 0
    }

    pub fn as_slice(&self) -> &[f32] {
        // SAFETY: `ptr` is owned, zero-initialised, aligned for `f32`, and the
        // allocation holds at least `len` floats.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        // SAFETY: as in `as_slice`; `&mut self` guarantees the slice is unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedHostBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_zeroed` with this exact `layout`
        // and is freed only here.
        unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, self.layout) };
    }
}

impl fmt::Debug for AlignedHostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedHostBuffer")
            .field("len", &self.len)
            .field("alignment", &self.layout.align())
            .finish()
    }
}

struct DeviceAllocation {
    id: u64,
    bank: MemoryBank,
    data: RwLock<Vec<f32>>,
}

/// Reference to a buffer resident in accelerator memory.
///
/// Clones refer to the same allocation; kernel arguments hold clones so the
/// memory outlives every command that was enqueued against it.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<DeviceAllocation>,
}

impl DeviceBuffer {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn bank(&self) -> MemoryBank {
        self.inner.bank
    }

    pub fn len(&self) -> usize {
        self.read(|data| data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the device contents out. Never held across another buffer's lock.
    pub fn snapshot(&self) -> Vec<f32> {
        self.read(|data| data.to_vec())
    }

    pub fn read<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        let guard = self.inner.data.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> R {
        let mut guard = self
            .inner
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.inner.id)
            .field("bank", &self.inner.bank)
            .finish()
    }
}

/// The accelerator as seen by the host: its identity, DMA requirement and memory.
#[derive(Debug)]
pub struct Device {
    name: String,
    required_alignment: usize,
    next_buffer_id: AtomicU64,
}

impl Device {
    pub fn new(name: impl Into<String>, required_alignment: usize) -> Self {
        Self {
            name: name.into(),
            required_alignment,
            next_buffer_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn required_alignment(&self) -> usize {
        self.required_alignment
    }

    /// Allocates a zeroed buffer of `len` floats in `bank`.
    pub fn allocate(&self, len: usize, bank: MemoryBank) -> PipelineResult<DeviceBuffer> {
        let MemoryBank::Ddr(index) = bank;
        if index >= DDR_BANK_COUNT {
            return Err(PipelineError::InvalidBank {
                bank: index,
                available: DDR_BANK_COUNT,
            });
        }
        let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        Ok(DeviceBuffer {
            inner: Arc::new(DeviceAllocation {
                id,
                bank,
                data: RwLock::new(vec![0.0; len]),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer_honours_alignment() {
        let buffer = AlignedHostBuffer::zeroed(10, 4096);
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.alignment(), 4096);
        assert!(buffer.satisfies_alignment(4096));
        assert!(buffer.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_small_alignment_does_not_satisfy_page_requirement() {
        let buffer = AlignedHostBuffer::zeroed(3, 64);
        assert!(buffer.satisfies_alignment(64));
        assert!(!buffer.satisfies_alignment(4096));
        assert_eq!(buffer.alignment(), 64);
    }

    #[test]
    fn test_empty_buffer_is_valid() {
        let buffer = AlignedHostBuffer::filled(0, 4096, 1.0);
        assert!(buffer.is_empty());
        assert!(buffer.as_slice().is_empty());
    }

    #[test]
    fn test_device_allocation_rejects_unknown_bank() {
        let device = Device::new("test", 4096);
        assert!(matches!(
            device.allocate(4, MemoryBank::Ddr(DDR_BANK_COUNT)),
            Err(PipelineError::InvalidBank { .. })
        ));
    }

    #[test]
    fn test_device_buffers_are_distinct_allocations() {
        let device = Device::new("test", 4096);
        let a = device.allocate(4, MemoryBank::Ddr(0)).expect("alloc");
        let b = device.allocate(4, MemoryBank::Ddr(1)).expect("alloc");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
        assert_eq!(b.bank(), MemoryBank::Ddr(1));
    }

    #[test]
    fn test_device_buffer_write_then_snapshot() {
        let device = Device::new("test", 4096);
        let buffer = device.allocate(3, MemoryBank::default()).expect("alloc");
        buffer.write(|data| data.copy_from_slice(&[1.0, 2.0, 3.0]));
        assert_eq!(buffer.snapshot(), vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.len(), 3);
    }
}
