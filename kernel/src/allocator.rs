//! Heap allocator initialization
//!
//! This module initializes the kernel heap and sets up the global allocator.
//! It uses linked_list_allocator to support dynamic memory allocation, and
//! provides aligned DMA buffers on top of it by over-allocation.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use linked_list_allocator::LockedHeap;
use x86_64::{
    structures::paging::{
        mapper::MapToError, FrameAllocator, Mapper, Page, PageTableFlags, Size4KiB,
    },
    VirtAddr,
};

/// Heap start virtual address.
///
/// Located in the upper kernel space to avoid conflicts with other mappings.
pub const HEAP_START: usize = 0x_4444_4444_0000;

/// Heap size (16 MiB).
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Global heap allocator.
#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the heap.
///
/// Allocates and maps pages for the heap area, then initializes the global
/// allocator.
pub fn init_heap(
    mapper: &mut impl Mapper<Size4KiB>,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), MapToError<Size4KiB>> {
    let page_range = {
        let heap_start = VirtAddr::new(HEAP_START as u64);
        let heap_end = heap_start + HEAP_SIZE as u64 - 1u64;
        let heap_start_page = Page::containing_address(heap_start);
        let heap_end_page = Page::containing_address(heap_end);
        Page::range_inclusive(heap_start_page, heap_end_page)
    };

    for page in page_range {
        let frame = frame_allocator
            .allocate_frame()
            .ok_or(MapToError::FrameAllocationFailed)?;

        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        unsafe {
            mapper.map_to(page, frame, flags, frame_allocator)?.flush();
        }
    }

    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    }

    Ok(())
}

/// An owned, zeroed allocation aligned to a power-of-two boundary.
///
/// The heap only guarantees word alignment, so DMA consumers (NVMe queue
/// rings, PRP data buffers) go through this wrapper: it over-allocates by the
/// alignment, keeps the raw layout for deallocation, and exposes the aligned
/// window.
pub struct AlignedBuffer {
    raw: *mut u8,
    layout: Layout,
    aligned: *mut u8,
    size: usize,
}

// The buffer is plain owned memory.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `size` zeroed bytes aligned to `align` (a power of two).
    pub fn new(size: usize, align: usize) -> Option<Self> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }

        let layout = Layout::from_size_align(size + align, 1).ok()?;
        let raw = unsafe { alloc_zeroed(layout) };
        if raw.is_null() {
            return None;
        }

        let aligned = ((raw as usize + align - 1) & !(align - 1)) as *mut u8;

        Some(AlignedBuffer {
            raw,
            layout,
            aligned,
            size,
        })
    }

    /// Virtual address of the aligned window.
    pub fn addr(&self) -> u64 {
        self.aligned as u64
    }

    /// Size of the aligned window in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The aligned window as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.aligned, self.size) }
    }

    /// The aligned window as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.aligned, self.size) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.raw, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_buffer_is_aligned_and_zeroed() {
        let buffer = AlignedBuffer::new(8192, 4096).unwrap();
        assert_eq!(buffer.addr() % 4096, 0);
        assert_eq!(buffer.size(), 8192);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn aligned_buffer_rejects_bad_parameters() {
        assert!(AlignedBuffer::new(0, 4096).is_none());
        assert!(AlignedBuffer::new(512, 3000).is_none());
    }

    #[test]
    fn aligned_buffer_is_writable() {
        let mut buffer = AlignedBuffer::new(64, 64).unwrap();
        buffer.as_mut_slice()[0] = 0xAA;
        buffer.as_mut_slice()[63] = 0x55;
        assert_eq!(buffer.as_slice()[0], 0xAA);
        assert_eq!(buffer.as_slice()[63], 0x55);
    }
}
