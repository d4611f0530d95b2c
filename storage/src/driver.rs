//! Block device dispatch contract.
//!
//! Every storage unit (NVMe namespace, partition view, ...) implements
//! [`BlockDevice`]. Filesystems consume the trait; they never talk to a
//! controller directly.

use alloc::string::String;
use alloc::sync::Arc;

use crate::StorageError;

/// Access restriction flags for a storage unit.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskAccess: u32 {
        /// Writes are rejected with `PermissionDenied`.
        const READ_ONLY = 0x0001;
    }
}

/// Geometry and identity of a storage unit.
#[derive(Debug, Clone)]
pub struct DiskInfo {
    /// Device name, e.g. `nvme0n1`.
    pub name: String,
    /// Logical sector size in bytes.
    pub bytes_per_sector: u32,
    /// Total number of sectors.
    pub num_sectors: u64,
    /// Device is removable.
    pub removable: bool,
    /// Current access restrictions.
    pub access: DiskAccess,
}

/// Block device trait.
///
/// Sector addressing is absolute within the device. Implementations must
/// validate ranges and buffer sizes and must not panic on bad parameters.
pub trait BlockDevice: Send + Sync {
    /// Get device geometry and identity.
    fn info(&self) -> DiskInfo;

    /// Read `num_sectors` sectors starting at `sector` into `buffer`.
    fn read_sectors(
        &self,
        sector: u64,
        num_sectors: u32,
        buffer: &mut [u8],
    ) -> Result<(), StorageError>;

    /// Write `num_sectors` sectors starting at `sector` from `buffer`.
    fn write_sectors(
        &self,
        sector: u64,
        num_sectors: u32,
        buffer: &[u8],
    ) -> Result<(), StorageError>;

    /// Reset the device. Default is a no-op.
    fn reset(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Update access restrictions.
    fn set_access(&self, access: DiskAccess) -> Result<(), StorageError>;
}

/// A view of a contiguous sector range of another device.
///
/// Used to expose one partition as a device in its own right; the NTFS mount
/// path still works on absolute partition-relative sectors, so this view is
/// what it receives.
pub struct PartitionDevice {
    parent: Arc<dyn BlockDevice>,
    name: String,
    start_sector: u64,
    num_sectors: u64,
}

impl PartitionDevice {
    /// Wrap a sector range of `parent`.
    pub fn new(parent: Arc<dyn BlockDevice>, name: String, start_sector: u64, num_sectors: u64) -> Self {
        PartitionDevice {
            parent,
            name,
            start_sector,
            num_sectors,
        }
    }

    fn check_range(&self, sector: u64, num_sectors: u32) -> Result<u64, StorageError> {
        let end = sector
            .checked_add(num_sectors as u64)
            .ok_or(StorageError::InvalidSector)?;
        if end > self.num_sectors {
            return Err(StorageError::InvalidSector);
        }
        Ok(self.start_sector + sector)
    }
}

impl BlockDevice for PartitionDevice {
    fn info(&self) -> DiskInfo {
        let parent = self.parent.info();
        DiskInfo {
            name: self.name.clone(),
            bytes_per_sector: parent.bytes_per_sector,
            num_sectors: self.num_sectors,
            removable: parent.removable,
            access: parent.access,
        }
    }

    fn read_sectors(
        &self,
        sector: u64,
        num_sectors: u32,
        buffer: &mut [u8],
    ) -> Result<(), StorageError> {
        let absolute = self.check_range(sector, num_sectors)?;
        self.parent.read_sectors(absolute, num_sectors, buffer)
    }

    fn write_sectors(
        &self,
        sector: u64,
        num_sectors: u32,
        buffer: &[u8],
    ) -> Result<(), StorageError> {
        let absolute = self.check_range(sector, num_sectors)?;
        self.parent.write_sectors(absolute, num_sectors, buffer)
    }

    fn set_access(&self, access: DiskAccess) -> Result<(), StorageError> {
        self.parent.set_access(access)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! An in-memory block device used by unit tests across this crate.

    use super::*;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// RAM-backed block device.
    pub struct MemDisk {
        pub bytes_per_sector: u32,
        pub data: Mutex<Vec<u8>>,
        pub access: Mutex<DiskAccess>,
    }

    impl MemDisk {
        pub fn new(bytes_per_sector: u32, num_sectors: u64) -> Self {
            MemDisk {
                bytes_per_sector,
                data: Mutex::new(alloc::vec![0u8; (bytes_per_sector as u64 * num_sectors) as usize]),
                access: Mutex::new(DiskAccess::empty()),
            }
        }

        pub fn from_image(bytes_per_sector: u32, image: Vec<u8>) -> Self {
            assert_eq!(image.len() % bytes_per_sector as usize, 0);
            MemDisk {
                bytes_per_sector,
                data: Mutex::new(image),
                access: Mutex::new(DiskAccess::empty()),
            }
        }
    }

    impl BlockDevice for MemDisk {
        fn info(&self) -> DiskInfo {
            DiskInfo {
                name: String::from("ram0"),
                bytes_per_sector: self.bytes_per_sector,
                num_sectors: self.data.lock().len() as u64 / self.bytes_per_sector as u64,
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
            let bps = self.bytes_per_sector as usize;
            let offset = sector as usize * bps;
            let length = num_sectors as usize * bps;
            let data = self.data.lock();
            if offset + length > data.len() {
                return Err(StorageError::InvalidSector);
            }
            if buffer.len() < length {
                return Err(StorageError::BufferTooSmall);
            }
            buffer[..length].copy_from_slice(&data[offset..offset + length]);
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
            let bps = self.bytes_per_sector as usize;
            let offset = sector as usize * bps;
            let length = num_sectors as usize * bps;
            let mut data = self.data.lock();
            if offset + length > data.len() {
                return Err(StorageError::InvalidSector);
            }
            if buffer.len() < length {
                return Err(StorageError::BufferTooSmall);
            }
            data[offset..offset + length].copy_from_slice(&buffer[..length]);
            Ok(())
        }

        fn set_access(&self, access: DiskAccess) -> Result<(), StorageError> {
            *self.access.lock() = access;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemDisk;
    use super::*;

    #[test]
    fn partition_view_offsets_sectors() {
        let disk = Arc::new(MemDisk::new(512, 64));
        // Mark sector 10 of the parent.
        let mut sector = [0u8; 512];
        sector[0] = 0xAB;
        disk.write_sectors(10, 1, &sector).unwrap();

        let part = PartitionDevice::new(disk.clone(), String::from("ram0p1"), 10, 8);
        let mut out = [0u8; 512];
        part.read_sectors(0, 1, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);

        assert_eq!(part.info().num_sectors, 8);
        assert_eq!(
            part.read_sectors(8, 1, &mut out),
            Err(StorageError::InvalidSector)
        );
    }

    #[test]
    fn read_only_access_blocks_writes() {
        let disk = MemDisk::new(512, 4);
        disk.set_access(DiskAccess::READ_ONLY).unwrap();
        let sector = [0u8; 512];
        assert_eq!(
            disk.write_sectors(0, 1, &sector),
            Err(StorageError::PermissionDenied)
        );
    }
}
