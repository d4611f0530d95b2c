//! Virtual Filesystem (VFS) layer.
//!
//! This module provides a unified interface for all filesystem operations,
//! abstracting the differences between filesystem implementations. Mounted
//! volumes are registered here and addressed by volume name.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use crate::{FileHandle, FsStats, MountFlags, OpenFlags, StorageError};

/// Maximum number of mount points.
const MAX_MOUNTS: usize = 32;

/// Maximum path length accepted by the dispatch layer.
pub const MAX_PATH_LEN: usize = 4096;

/// Filesystem trait.
///
/// All filesystem implementations must implement this trait to be usable
/// through the VFS layer. Write-shaped operations exist on the trait so that
/// read-only filesystems can return their permission sentinel rather than a
/// generic "not implemented".
pub trait Filesystem: Send + Sync {
    /// Get filesystem type name.
    fn fs_type(&self) -> &str;

    /// Get the volume label, or an empty string when the volume has none.
    fn volume_label(&self) -> String;

    /// Get filesystem statistics.
    fn statfs(&self) -> Result<FsStats, StorageError>;

    /// Open a file, folder, or wildcard enumeration.
    fn open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle, StorageError>;

    /// Advance an enumeration handle to its next entry.
    fn open_next(&self, handle: &mut FileHandle) -> Result<(), StorageError>;

    /// Close a handle.
    fn close(&self, handle: FileHandle) -> Result<(), StorageError>;

    /// Read from a file at the handle's position, advancing it.
    fn read(&self, handle: &mut FileHandle, buffer: &mut [u8]) -> Result<usize, StorageError>;

    /// Write to a file at the handle's position.
    fn write(&self, handle: &mut FileHandle, data: &[u8]) -> Result<usize, StorageError>;

    /// Create a folder.
    fn create_folder(&self, path: &str) -> Result<(), StorageError>;

    /// Delete a file or folder.
    fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Rename a file or folder.
    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), StorageError>;
}

/// One mounted volume.
pub struct Mount {
    /// Volume name used for dispatch, e.g. `nvme0n1p1`.
    pub name: String,
    /// Filesystem type name.
    pub fs_type: String,
    /// Mount flags.
    pub flags: MountFlags,
    /// The filesystem driver instance.
    pub filesystem: Arc<dyn Filesystem>,
}

/// Global mount table.
static MOUNT_TABLE: RwLock<Vec<Mount>> = RwLock::new(Vec::new());

/// Register a mounted filesystem under a volume name.
///
/// Fails when the table is full or the name is already taken.
pub fn mount(
    name: &str,
    filesystem: Arc<dyn Filesystem>,
    flags: MountFlags,
) -> Result<(), StorageError> {
    let mut table = MOUNT_TABLE.write();

    if table.len() >= MAX_MOUNTS {
        return Err(StorageError::Unexpected);
    }
    if table.iter().any(|m| m.name == name) {
        return Err(StorageError::AlreadyExists);
    }

    let fs_type = String::from(filesystem.fs_type());
    log::debug!(
        "vfs: mounted {} as {} (label '{}')",
        name,
        fs_type,
        filesystem.volume_label()
    );

    table.push(Mount {
        name: String::from(name),
        fs_type,
        flags,
        filesystem,
    });

    Ok(())
}

/// Unmount a volume by name.
pub fn unmount(name: &str) -> Result<(), StorageError> {
    let mut table = MOUNT_TABLE.write();
    let index = table
        .iter()
        .position(|m| m.name == name)
        .ok_or(StorageError::DeviceNotFound)?;
    table.remove(index);
    Ok(())
}

/// Look up a mounted filesystem by volume name.
pub fn find(name: &str) -> Option<Arc<dyn Filesystem>> {
    MOUNT_TABLE
        .read()
        .iter()
        .find(|m| m.name == name)
        .map(|m| m.filesystem.clone())
}

/// List mounted volume names with their filesystem types.
pub fn list_mounts() -> Vec<(String, String)> {
    MOUNT_TABLE
        .read()
        .iter()
        .map(|m| (m.name.clone(), m.fs_type.clone()))
        .collect()
}

/// Split a `volume/path` string into the volume name and the in-volume path.
///
/// Accepts `/` and `\` separators; the first component names the volume.
pub fn split_volume_path(path: &str) -> Option<(&str, &str)> {
    if path.len() > MAX_PATH_LEN {
        return None;
    }

    let trimmed = path.trim_start_matches(['/', '\\']);
    if trimmed.is_empty() {
        return None;
    }

    match trimmed.find(['/', '\\']) {
        Some(position) => Some((&trimmed[..position], &trimmed[position + 1..])),
        None => Some((trimmed, "")),
    }
}

/// Open a file through the mount table.
pub fn open(path: &str, flags: OpenFlags) -> Result<(Arc<dyn Filesystem>, FileHandle), StorageError> {
    let (volume, rest) = split_volume_path(path).ok_or(StorageError::InvalidArgument)?;
    let filesystem = find(volume).ok_or(StorageError::DeviceNotFound)?;
    let handle = filesystem.open(rest, flags)?;
    Ok((filesystem, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_volume_and_path() {
        assert_eq!(
            split_volume_path("/nvme0n1p1/Windows/System32"),
            Some(("nvme0n1p1", "Windows/System32"))
        );
        assert_eq!(
            split_volume_path("\\vol\\dir\\file.txt"),
            Some(("vol", "dir\\file.txt"))
        );
        assert_eq!(split_volume_path("vol"), Some(("vol", "")));
        assert_eq!(split_volume_path("//"), None);
        assert_eq!(split_volume_path(""), None);
    }
}
