//! Physical memory access and address translation.
//!
//! The bootloader maps all physical memory at a fixed offset; MMIO "mapping"
//! is therefore offset arithmetic, and linear-to-physical translation is a
//! page-table walk through the active tables. DMA engines (NVMe) depend on
//! the walk to validate physical contiguity of their buffers.

use core::sync::atomic::{AtomicU64, Ordering};

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use x86_64::{
    registers::control::Cr3,
    structures::paging::{
        FrameAllocator, OffsetPageTable, PageTable, PhysFrame, Size4KiB, Translate,
    },
    PhysAddr, VirtAddr,
};

/// Physical memory offset provided by the bootloader.
static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the physical memory offset. Must run before any MMIO access.
pub fn set_physical_memory_offset(offset: u64) {
    PHYS_MEM_OFFSET.store(offset, Ordering::SeqCst);
}

/// Get the physical memory offset.
pub fn physical_memory_offset() -> u64 {
    PHYS_MEM_OFFSET.load(Ordering::SeqCst)
}

/// Map a physical MMIO region and return its linear address.
///
/// With full physical memory mapped by the bootloader this is offset
/// arithmetic; the size argument documents the claimed window.
pub fn map_io(phys: u64, _size: u64) -> u64 {
    phys + physical_memory_offset()
}

/// Read a block of physical memory into a buffer.
///
/// Used during early ACPI discovery (EBDA and BIOS ROM scans).
pub fn read_physical(phys: u64, buffer: &mut [u8]) -> bool {
    let virt = map_io(phys, buffer.len() as u64) as *const u8;
    unsafe {
        core::ptr::copy_nonoverlapping(virt, buffer.as_mut_ptr(), buffer.len());
    }
    true
}

/// Initialize an offset page table over the active level-4 table.
///
/// # Safety
///
/// The physical memory offset must be correct and the full physical mapping
/// must be in place.
pub unsafe fn init(phys_mem_offset: u64) -> OffsetPageTable<'static> {
    set_physical_memory_offset(phys_mem_offset);
    let level_4_table = unsafe { active_level_4_table(phys_mem_offset) };
    unsafe { OffsetPageTable::new(level_4_table, VirtAddr::new(phys_mem_offset)) }
}

unsafe fn active_level_4_table(phys_mem_offset: u64) -> &'static mut PageTable {
    let (frame, _flags) = Cr3::read();
    let virt = VirtAddr::new(frame.start_address().as_u64() + phys_mem_offset);
    let ptr: *mut PageTable = virt.as_mut_ptr();
    unsafe { &mut *ptr }
}

/// Translate a linear address to its physical address.
///
/// Returns `None` when the address is unmapped.
pub fn linear_to_physical(linear: u64) -> Option<u64> {
    let offset = physical_memory_offset();
    let mapper = unsafe { init(offset) };
    mapper
        .translate_addr(VirtAddr::new(linear))
        .map(PhysAddr::as_u64)
}

/// Validate that `size` bytes at `linear` are physically contiguous.
///
/// Walks every 4 KiB boundary confirming `phys(linear + off) == phys(linear)
/// + off`. The translator is a parameter so callers (and tests) can supply
/// their own page walk.
pub fn is_physically_contiguous(
    linear: u64,
    size: u64,
    translate: &dyn Fn(u64) -> Option<u64>,
) -> bool {
    let base = match translate(linear) {
        Some(base) => base,
        None => return false,
    };

    let mut offset = 0u64;
    while offset < size {
        match translate(linear + offset) {
            Some(phys) if phys == base + offset => {}
            _ => return false,
        }
        offset += 4096;
    }

    true
}

/// A frame allocator fed by the bootloader memory map.
pub struct BootInfoFrameAllocator {
    memory_regions: &'static MemoryRegions,
    next: usize,
}

impl BootInfoFrameAllocator {
    /// Create an allocator over the usable regions of the memory map.
    ///
    /// # Safety
    ///
    /// The memory map must be accurate and the usable frames unreferenced.
    pub unsafe fn new(memory_regions: &'static MemoryRegions) -> Self {
        BootInfoFrameAllocator {
            memory_regions,
            next: 0,
        }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.memory_regions
            .iter()
            .filter(|region| region.kind == MemoryRegionKind::Usable)
            .map(|region| region.start..region.end)
            .flat_map(|range| range.step_by(4096))
            .map(|address| PhysFrame::containing_address(PhysAddr::new(address)))
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguity_check_accepts_identity_mapping() {
        let translate = |linear: u64| Some(linear);
        assert!(is_physically_contiguous(0x10000, 16384, &translate));
    }

    #[test]
    fn contiguity_check_rejects_broken_mapping() {
        // The second page maps somewhere else entirely.
        let translate = |linear: u64| {
            if linear >= 0x11000 && linear < 0x12000 {
                Some(linear + 0x100000)
            } else {
                Some(linear)
            }
        };
        assert!(!is_physically_contiguous(0x10000, 8192, &translate));
        // A single page before the discontinuity is fine.
        assert!(is_physically_contiguous(0x10000, 4096, &translate));
    }

    #[test]
    fn contiguity_check_rejects_unmapped_pages() {
        let translate = |linear: u64| if linear < 0x11000 { Some(linear) } else { None };
        assert!(!is_physically_contiguous(0x10000, 8192, &translate));
    }
}
