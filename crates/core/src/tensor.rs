//! Opaque tensor handles, data types, and pinned host memory.
//!
//! The engine never computes on tensor contents. Framework adapters hand in
//! handles implementing [`Tensor`]; byte access happens inside backend
//! implementations ([`crate::collective::CopyEngine`], [`crate::ps::PsClient`])
//! which downcast through `as_any` to whatever concrete type they produced.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Device id used for tensors that live in host memory. Such slices skip the
/// GPU memcpy and collective calls but still traverse every queue.
pub const CPU_DEVICE_ID: i32 = -1;

/// Element types carried across the PS and collective surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Uint8,
    Int8,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
    Bfloat16,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Float16 | Self::Bfloat16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }

    /// Stable wire code packed into PS command words.
    pub(crate) fn code(self) -> i32 {
        match self {
            Self::Uint8 => 0,
            Self::Int8 => 1,
            Self::Int32 => 2,
            Self::Int64 => 3,
            Self::Float16 => 4,
            Self::Float32 => 5,
            Self::Float64 => 6,
            Self::Bfloat16 => 7,
        }
    }
}

/// Framework-owned tensor handle. `size` is the total byte length; slices
/// address sub-ranges of it by `(offset, len)`.
pub trait Tensor: Send + Sync {
    /// Total length in bytes.
    fn size(&self) -> usize;

    /// Element type.
    fn dtype(&self) -> DataType;

    /// Concrete-type escape hatch for backend implementations.
    fn as_any(&self) -> &dyn Any;
}

/// Upstream-compute fence supplied by the framework. The first stage that
/// touches device memory polls this before issuing its copy or collective.
pub trait ReadyEvent: Send + Sync {
    fn ready(&self) -> bool;
}

/// Pinned host staging memory shared by the copy, push, and pull stages.
///
/// Concurrent access is sound because partitions of one tensor are disjoint
/// byte ranges and at most one in-flight slice owns a given range (pipeline
/// invariant); `slice`/`write` assert bounds and the disjointness is the
/// caller's contract.
pub struct PinnedBuffer {
    data: Box<[UnsafeCell<u8>]>,
}

// Byte windows handed out by `slice`/`write` target disjoint ranges.
unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        let data = std::iter::repeat_with(|| UnsafeCell::new(0u8))
            .take(len)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset + len <= self.data.len(),
            "range {offset}+{len} out of bounds for pinned buffer of {}",
            self.data.len()
        );
        if len == 0 {
            return &[];
        }
        // Sound under the disjoint-range invariant documented on the type.
        unsafe { std::slice::from_raw_parts(self.data[offset].get(), len) }
    }

    /// Copy `src` into the buffer starting at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) {
        assert!(
            offset + src.len() <= self.data.len(),
            "range {offset}+{} out of bounds for pinned buffer of {}",
            src.len(),
            self.data.len()
        );
        if src.is_empty() {
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data[offset].get(), src.len());
        }
    }
}

impl fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Pinned-memory vendor. Real deployments back this with the GPU runtime's
/// host allocator; the default hands out plain heap memory.
pub trait PinnedAllocator: Send + Sync {
    fn alloc(&self, len: usize) -> Result<Arc<PinnedBuffer>>;
}

/// Heap-backed allocator used when no GPU runtime is wired in.
#[derive(Debug, Default)]
pub struct HeapPinnedAllocator;

impl PinnedAllocator for HeapPinnedAllocator {
    fn alloc(&self, len: usize) -> Result<Arc<PinnedBuffer>> {
        Ok(Arc::new(PinnedBuffer::zeroed(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_sizes() {
        assert_eq!(DataType::Float32.size_of(), 4);
        assert_eq!(DataType::Float16.size_of(), 2);
        assert_eq!(DataType::Int64.size_of(), 8);
        assert_eq!(DataType::Uint8.size_of(), 1);
    }

    #[test]
    fn pinned_buffer_round_trip() {
        let buf = PinnedBuffer::zeroed(16);
        assert_eq!(buf.len(), 16);
        buf.write(4, &[1, 2, 3, 4]);
        assert_eq!(buf.slice(4, 4), &[1, 2, 3, 4]);
        assert_eq!(buf.slice(0, 4), &[0, 0, 0, 0]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn pinned_buffer_rejects_overrun() {
        let buf = PinnedBuffer::zeroed(8);
        buf.slice(4, 8);
    }

    #[test]
    fn heap_allocator_zeroes() {
        let buf = HeapPinnedAllocator.alloc(32).unwrap();
        assert_eq!(buf.slice(0, 32), vec![0u8; 32].as_slice());
    }
}
