//! Filesystem implementations.
//!
//! This module provides filesystem implementations:
//! - NTFS (Windows NT filesystem, read-only)

pub mod ntfs;

use alloc::vec;

use crate::driver::BlockDevice;
use crate::StorageError;

/// Filesystem type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemType {
    /// NTFS filesystem (read-only).
    Ntfs,
    /// Unknown filesystem.
    Unknown,
}

impl FilesystemType {
    /// Get filesystem name.
    pub fn name(&self) -> &'static str {
        match self {
            FilesystemType::Ntfs => "ntfs",
            FilesystemType::Unknown => "unknown",
        }
    }
}

/// Probe a boot sector for a known filesystem signature.
pub fn probe_boot_sector(sector: &[u8]) -> FilesystemType {
    // NTFS has "NTFS    " at offset 3.
    if sector.len() >= 11 && &sector[3..11] == b"NTFS    " {
        return FilesystemType::Ntfs;
    }

    FilesystemType::Unknown
}

/// Detect the filesystem on a partition of a block device.
pub fn detect_filesystem(
    device: &dyn BlockDevice,
    partition_start: u64,
) -> Result<FilesystemType, StorageError> {
    let bps = device.info().bytes_per_sector as usize;
    let mut sector = vec![0u8; bps];
    device.read_sectors(partition_start, 1, &mut sector)?;
    Ok(probe_boot_sector(&sector))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_ntfs_signature() {
        let mut sector = [0u8; 512];
        sector[3..11].copy_from_slice(b"NTFS    ");
        assert_eq!(probe_boot_sector(&sector), FilesystemType::Ntfs);

        sector[3..11].copy_from_slice(b"MSDOS5.0");
        assert_eq!(probe_boot_sector(&sector), FilesystemType::Unknown);
    }
}
