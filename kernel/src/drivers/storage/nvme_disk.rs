//! NVMe namespaces as storage units.
//!
//! Each active namespace becomes an [`NvmeDisk`] implementing the block
//! device contract. The read/write paths split requests into chunks that fit
//! the two-page PRP limit and bounce through an aligned buffer whenever the
//! caller's memory is not directly DMA-able.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use spin::Mutex;

use storage::driver::{BlockDevice, DiskAccess, DiskInfo};
use storage::StorageError;

use crate::allocator::AlignedBuffer;
use crate::memory;

use super::nvme::{NvmeController, MAX_TRANSFER_BYTES};

/// One NVMe namespace exposed as a disk.
pub struct NvmeDisk {
    /// Owning controller.
    controller: Arc<NvmeController>,
    /// Namespace identifier.
    namespace_id: u32,
    /// Namespace size in sectors.
    num_sectors: u64,
    /// Logical sector size in bytes.
    bytes_per_sector: u32,
    /// Access restriction flags.
    access: Mutex<DiskAccess>,
    /// Registry name, e.g. `nvme0n1`.
    name: String,
}

impl NvmeDisk {
    /// Create a disk over one identified namespace.
    pub fn new(
        controller: Arc<NvmeController>,
        controller_index: usize,
        namespace_id: u32,
        num_sectors: u64,
        bytes_per_sector: u32,
    ) -> Self {
        NvmeDisk {
            controller,
            namespace_id,
            num_sectors,
            bytes_per_sector,
            access: Mutex::new(DiskAccess::empty()),
            name: format!("nvme{}n{}", controller_index, namespace_id),
        }
    }

    /// Largest chunk transferable with PRP1/PRP2.
    fn max_sectors_per_chunk(&self) -> u32 {
        (MAX_TRANSFER_BYTES / self.bytes_per_sector as u64) as u32
    }

    fn check_request(&self, sector: u64, num_sectors: u32, buffer_len: usize) -> Result<u32, StorageError> {
        if num_sectors == 0 {
            return Err(StorageError::InvalidArgument);
        }
        let end = sector
            .checked_add(num_sectors as u64)
            .ok_or(StorageError::InvalidSector)?;
        if end > self.num_sectors {
            return Err(StorageError::InvalidSector);
        }

        let total_bytes = num_sectors as u64 * self.bytes_per_sector as u64;
        if (buffer_len as u64) < total_bytes {
            return Err(StorageError::BufferTooSmall);
        }

        let max_sectors = self.max_sectors_per_chunk();
        if max_sectors == 0 {
            return Err(StorageError::Unexpected);
        }
        Ok(max_sectors)
    }

    /// A chunk-sized buffer is DMA-able when 4 KiB aligned and physically
    /// contiguous.
    fn is_dma_able(buffer: &[u8]) -> bool {
        let linear = buffer.as_ptr() as u64;
        if linear % 4096 != 0 {
            return false;
        }
        let translate = |addr: u64| memory::linear_to_physical(addr);
        memory::is_physically_contiguous(linear, buffer.len() as u64, &translate)
    }

    fn read_chunk(&self, lba: u64, sectors: u32, out: &mut [u8]) -> Result<(), StorageError> {
        let chunk_bytes = sectors as usize * self.bytes_per_sector as usize;

        if Self::is_dma_able(&out[..chunk_bytes]) {
            return self
                .controller
                .read_sectors(self.namespace_id, lba, sectors, &mut out[..chunk_bytes])
                .map_err(|_| StorageError::IoError);
        }

        let mut bounce =
            AlignedBuffer::new(chunk_bytes, 4096).ok_or(StorageError::Unexpected)?;
        self.controller
            .read_sectors(self.namespace_id, lba, sectors, bounce.as_mut_slice())
            .map_err(|_| StorageError::IoError)?;
        out[..chunk_bytes].copy_from_slice(&bounce.as_slice()[..chunk_bytes]);
        Ok(())
    }

    fn write_chunk(&self, lba: u64, sectors: u32, data: &[u8]) -> Result<(), StorageError> {
        let chunk_bytes = sectors as usize * self.bytes_per_sector as usize;

        if Self::is_dma_able(&data[..chunk_bytes]) {
            return self
                .controller
                .write_sectors(self.namespace_id, lba, sectors, &data[..chunk_bytes])
                .map_err(|_| StorageError::IoError);
        }

        let mut bounce =
            AlignedBuffer::new(chunk_bytes, 4096).ok_or(StorageError::Unexpected)?;
        bounce.as_mut_slice()[..chunk_bytes].copy_from_slice(&data[..chunk_bytes]);
        self.controller
            .write_sectors(self.namespace_id, lba, sectors, bounce.as_slice())
            .map_err(|_| StorageError::IoError)
    }
}

impl BlockDevice for NvmeDisk {
    fn info(&self) -> DiskInfo {
        DiskInfo {
            name: self.name.clone(),
            bytes_per_sector: self.bytes_per_sector,
            num_sectors: self.num_sectors,
            removable: false,
            access: *self.access.lock(),
        }
    }

    fn read_sectors(
        &self,
        sector: u64,
        num_sectors: u32,
        buffer: &mut [u8],
    ) -> Result<(), StorageError> {
        let max_sectors = self.check_request(sector, num_sectors, buffer.len())?;

        let mut lba = sector;
        let mut remaining = num_sectors;
        let mut offset = 0usize;

        while remaining > 0 {
            let chunk = remaining.min(max_sectors);
            let chunk_bytes = chunk as usize * self.bytes_per_sector as usize;
            self.read_chunk(lba, chunk, &mut buffer[offset..offset + chunk_bytes])?;
            lba += chunk as u64;
            offset += chunk_bytes;
            remaining -= chunk;
        }

        Ok(())
    }

    fn write_sectors(
        &self,
        sector: u64,
        num_sectors: u32,
        buffer: &[u8],
    ) -> Result<(), StorageError> {
        if self.access.lock().contains(DiskAccess::READ_ONLY) {
            return Err(StorageError::PermissionDenied);
        }

        let max_sectors = self.check_request(sector, num_sectors, buffer.len())?;

        let mut lba = sector;
        let mut remaining = num_sectors;
        let mut offset = 0usize;

        while remaining > 0 {
            let chunk = remaining.min(max_sectors);
            let chunk_bytes = chunk as usize * self.bytes_per_sector as usize;
            self.write_chunk(lba, chunk, &buffer[offset..offset + chunk_bytes])?;
            lba += chunk as u64;
            offset += chunk_bytes;
            remaining -= chunk;
        }

        Ok(())
    }

    fn set_access(&self, access: DiskAccess) -> Result<(), StorageError> {
        *self.access.lock() = access;
        Ok(())
    }
}

/// Identify and register every namespace of a controller as a disk.
///
/// An unusable namespace list falls back to namespace 1. Returns the number
/// of disks registered.
pub fn register_namespaces(controller: &Arc<NvmeController>, controller_index: usize) -> usize {
    let namespace_ids = match controller.identify_namespace_list() {
        Ok(ids) if !ids.is_empty() => ids,
        _ => {
            log::warn!("nvme: namespace list unavailable, falling back to NSID 1");
            alloc::vec![1]
        }
    };

    let mut registered = 0;
    for namespace_id in namespace_ids {
        let (num_sectors, bytes_per_sector) = match controller.identify_namespace(namespace_id) {
            Ok(geometry) => geometry,
            Err(error) => {
                log::warn!("nvme: identify namespace {} failed: {}", namespace_id, error);
                continue;
            }
        };
        if bytes_per_sector == 0 || num_sectors == 0 {
            log::warn!("nvme: namespace {} has no usable geometry", namespace_id);
            continue;
        }

        // The controller caches a single logical-block size for its command
        // math; namespaces formatted differently cannot share it.
        if bytes_per_sector != controller.logical_block_size() {
            log::warn!(
                "nvme: namespace {} sector size {} differs from controller cache {}, skipping",
                namespace_id,
                bytes_per_sector,
                controller.logical_block_size()
            );
            continue;
        }

        let disk = Arc::new(NvmeDisk::new(
            controller.clone(),
            controller_index,
            namespace_id,
            num_sectors,
            bytes_per_sector,
        ));

        match super::register_disk(disk) {
            Ok(name) => {
                log::debug!("nvme: registered disk {}", name);
                registered += 1;
            }
            Err(error) => {
                log::warn!("nvme: disk registration failed: {:?}", error);
            }
        }
    }

    registered
}
