//! Storage subsystem for Helios.
//!
//! This crate provides the storage subsystem including:
//! - Block device dispatch contract
//! - MBR/GPT partition table parsing
//! - Virtual Filesystem (VFS) layer
//! - NTFS filesystem implementation (read-only)

#![no_std]

extern crate alloc;

pub mod driver;
pub mod fs;
pub mod limiter;
pub mod partition;
pub mod unicode;
pub mod vfs;

use alloc::string::String;
use alloc::vec::Vec;

/// Millisecond clock used for log rate limiting.
///
/// The kernel installs its tick source at boot. Before that, limiters see a
/// stuck clock and only spend their immediate budget.
static CLOCK_MS: spin::Once<fn() -> u64> = spin::Once::new();

/// Install the millisecond clock source. Later calls are ignored.
pub fn set_clock_ms(clock: fn() -> u64) {
    CLOCK_MS.call_once(|| clock);
}

/// Read the millisecond clock, or 0 when no source is installed.
pub fn clock_ms() -> u64 {
    CLOCK_MS.get().map(|clock| clock()).unwrap_or(0)
}

/// Storage subsystem error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Device not found.
    DeviceNotFound,
    /// Device I/O error.
    IoError,
    /// Device not ready.
    NotReady,
    /// Invalid sector number or range.
    InvalidSector,
    /// Buffer too small for the requested transfer.
    BufferTooSmall,
    /// Invalid argument.
    InvalidArgument,
    /// File not found.
    FileNotFound,
    /// Not a directory.
    NotADirectory,
    /// Not a file.
    NotAFile,
    /// Already exists.
    AlreadyExists,
    /// Permission denied (read-only mount or read-only disk).
    PermissionDenied,
    /// Invalid or unsupported filesystem metadata.
    InvalidFilesystem,
    /// Filesystem corruption detected.
    Corrupted,
    /// Unexpected internal condition.
    Unexpected,
    /// Not implemented by this driver.
    NotImplemented,
    /// Invalid file handle.
    InvalidHandle,
}

/// File attribute flags exposed on open file handles.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        /// File cannot be written through this mount.
        const READ_ONLY = 0x0001;
        /// Entry is a folder.
        const FOLDER = 0x0002;
        /// Entry is hidden.
        const HIDDEN = 0x0004;
        /// Entry belongs to the operating system.
        const SYSTEM = 0x0008;
    }
}

/// Open file flags.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 0x0001;
        /// Open for writing.
        const WRITE = 0x0002;
        /// Create, truncating any existing file.
        const CREATE_ALWAYS = 0x0004;
        /// Append mode.
        const APPEND = 0x0008;
        /// Truncate to zero length.
        const TRUNCATE = 0x0010;
    }
}

impl OpenFlags {
    /// Flags that require write access to the volume.
    pub fn requires_write(&self) -> bool {
        self.intersects(
            OpenFlags::WRITE | OpenFlags::CREATE_ALWAYS | OpenFlags::APPEND | OpenFlags::TRUNCATE,
        )
    }
}

/// Mount flags.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Mount read-only.
        const READ_ONLY = 0x0001;
    }
}

/// File timestamps in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTimes {
    /// Creation time.
    pub creation: u64,
    /// Last data modification time.
    pub modified: u64,
    /// Last metadata (record) modification time.
    pub record_modified: u64,
    /// Last access time.
    pub accessed: u64,
}

/// One entry produced by a folder enumeration.
#[derive(Debug, Clone)]
pub struct FolderEntry {
    /// Entry name (UTF-8).
    pub name: String,
    /// Filesystem-specific record index of the entry.
    pub record_index: u32,
    /// Entry is a folder.
    pub is_folder: bool,
    /// Entry timestamps.
    pub times: FileTimes,
}

/// An open file or folder-enumeration handle.
///
/// The handle owns its position and, for wildcard opens, a snapshot of the
/// matching folder entries. It stays valid for the lifetime of the mount it
/// was opened on.
#[derive(Debug)]
pub struct FileHandle {
    /// Entry name (last path component, or current enumeration entry).
    pub name: String,
    /// Attribute bits.
    pub attributes: FileAttributes,
    /// File size in bytes.
    pub size: u64,
    /// Current read position in bytes.
    pub position: u64,
    /// Entry timestamps.
    pub times: FileTimes,
    /// Flags the handle was opened with.
    pub open_flags: OpenFlags,
    /// Filesystem-specific record index.
    pub record_index: u32,
    /// Wildcard enumeration snapshot, if any.
    pub enumeration: Option<Enumeration>,
}

/// Owned snapshot of folder entries matched by a wildcard open.
#[derive(Debug)]
pub struct Enumeration {
    /// Matching entries, in traversal order.
    pub entries: Vec<FolderEntry>,
    /// Index of the entry currently reflected in the handle header.
    pub current: usize,
}

impl FileHandle {
    /// Create an empty handle bound to nothing.
    pub fn new(open_flags: OpenFlags) -> Self {
        FileHandle {
            name: String::new(),
            attributes: FileAttributes::READ_ONLY,
            size: 0,
            position: 0,
            times: FileTimes::default(),
            open_flags,
            record_index: 0,
            enumeration: None,
        }
    }

    /// Check whether this handle denotes a folder.
    pub fn is_folder(&self) -> bool {
        self.attributes.contains(FileAttributes::FOLDER)
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, Default)]
pub struct FsStats {
    /// Filesystem type tag.
    pub fs_type: u32,
    /// Bytes per allocation unit.
    pub block_size: u32,
    /// Total allocation units.
    pub total_blocks: u64,
    /// Volume serial number.
    pub fs_id: u64,
    /// Mount flags.
    pub flags: MountFlags,
}
