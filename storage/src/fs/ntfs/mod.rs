//! NTFS filesystem implementation (read-only).
//!
//! This module provides read-only support for the NTFS filesystem. The mount
//! path validates boot-sector geometry; reads go through the MFT with update
//! sequence validation on every record. All write-shaped operations return
//! `PermissionDenied`.

pub mod index;
pub mod path;
pub mod record;
pub mod runlist;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::driver::BlockDevice;
use crate::unicode::utf16le_bytes_to_utf8;
use crate::vfs::Filesystem;
use crate::{
    Enumeration, FileAttributes, FileHandle, FolderEntry, FsStats, MountFlags, OpenFlags,
    StorageError,
};

use path::PathLookupCache;
use record::{FileRecordInfo, ATTR_VOLUME_NAME};

/// Supported sector sizes.
const SUPPORTED_SECTOR_SIZES: [u32; 2] = [512, 4096];

/// File record size bounds.
const MIN_FILE_RECORD_SIZE: u32 = 512;
const MAX_FILE_RECORD_SIZE: u32 = 4096;

/// Root directory file-record index.
pub const ROOT_FILE_RECORD_INDEX: u32 = 5;

/// $Volume file-record index.
const VOLUME_FILE_RECORD_INDEX: u32 = 3;

/// Difference between the NTFS epoch (1601) and the Unix epoch (1970) in
/// 100 ns ticks.
const NTFS_EPOCH_DIFF: u64 = 116_444_736_000_000_000;

/// Convert an NTFS timestamp (100 ns ticks since 1601-01-01) to Unix
/// nanoseconds. Values before the Unix epoch clamp to 0.
pub fn ntfs_time_to_unix(ntfs_time: u64) -> u64 {
    if ntfs_time < NTFS_EPOCH_DIFF {
        0
    } else {
        (ntfs_time - NTFS_EPOCH_DIFF).saturating_mul(100)
    }
}

/// Parsed NTFS boot sector.
#[derive(Debug, Clone, Copy)]
pub struct NtfsBootSector {
    /// Bytes per sector.
    pub bytes_per_sector: u16,
    /// Sectors per cluster.
    pub sectors_per_cluster: u8,
    /// Total sectors in the volume.
    pub total_sectors: u64,
    /// First cluster of the $MFT.
    pub mft_start_cluster: u64,
    /// First cluster of the $MFT mirror.
    pub mft_mirror_cluster: u64,
    /// File record size encoding (positive = clusters, negative = 2^|v| bytes).
    pub file_record_size_raw: i8,
    /// Volume serial number.
    pub volume_serial: u64,
}

impl NtfsBootSector {
    /// NTFS OEM signature at offset 3.
    pub const OEM_ID: &'static [u8; 8] = b"NTFS    ";

    /// Parse and validate a boot sector.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < 512 {
            return Err(StorageError::InvalidArgument);
        }

        if data[510] != 0x55 || data[511] != 0xAA {
            log::warn!(
                "ntfs: invalid boot signature ({:#x}, {:#x})",
                data[510],
                data[511]
            );
            return Err(StorageError::InvalidFilesystem);
        }

        if &data[3..11] != Self::OEM_ID {
            return Err(StorageError::InvalidFilesystem);
        }

        Ok(NtfsBootSector {
            bytes_per_sector: u16::from_le_bytes([data[11], data[12]]),
            sectors_per_cluster: data[13],
            total_sectors: u64::from_le_bytes(data[40..48].try_into().unwrap()),
            mft_start_cluster: u64::from_le_bytes(data[48..56].try_into().unwrap()),
            mft_mirror_cluster: u64::from_le_bytes(data[56..64].try_into().unwrap()),
            file_record_size_raw: data[64] as i8,
            volume_serial: u64::from_le_bytes(data[72..80].try_into().unwrap()),
        })
    }

    /// Decode the file-record size in bytes.
    pub fn file_record_size(&self, bytes_per_cluster: u32) -> Result<u32, StorageError> {
        let raw = self.file_record_size_raw;
        if raw == 0 {
            return Err(StorageError::InvalidFilesystem);
        }

        let record_size = if raw > 0 {
            (raw as u32).checked_mul(bytes_per_cluster).ok_or(StorageError::InvalidFilesystem)?
        } else {
            let shift = (-(raw as i32)) as u32;
            if shift > 31 {
                return Err(StorageError::InvalidFilesystem);
            }
            1u32 << shift
        };

        if !(MIN_FILE_RECORD_SIZE..=MAX_FILE_RECORD_SIZE).contains(&record_size)
            || !record_size.is_power_of_two()
        {
            log::warn!("ntfs: unsupported file record size {}", record_size);
            return Err(StorageError::InvalidFilesystem);
        }

        Ok(record_size)
    }
}

/// A mounted NTFS filesystem.
pub struct NtfsFilesystem {
    /// Underlying disk.
    device: Arc<dyn BlockDevice>,
    /// Parsed boot sector.
    boot: NtfsBootSector,
    /// First absolute sector of the partition.
    pub(crate) partition_start: u64,
    /// Partition size in sectors.
    pub(crate) partition_size: u64,
    /// Bytes per sector.
    pub(crate) bytes_per_sector: u32,
    /// Sectors per cluster.
    pub(crate) sectors_per_cluster: u32,
    /// Bytes per cluster.
    pub(crate) bytes_per_cluster: u32,
    /// File record size in bytes.
    pub(crate) file_record_size: u32,
    /// Absolute sector of MFT record 0.
    pub(crate) mft_start_sector: u64,
    /// First cluster of the MFT.
    pub(crate) mft_start_cluster: u64,
    /// Volume label from $Volume, empty when absent.
    volume_label: String,
    /// Path-lookup cache ring.
    pub(crate) path_cache: Mutex<PathLookupCache>,
    /// Folder enumerations performed since mount.
    enumeration_count: AtomicU32,
}

impl NtfsFilesystem {
    /// Mount an NTFS partition.
    ///
    /// `partition_start` and `partition_size` are absolute sectors on
    /// `device`. The boot sector is validated before anything else is read.
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        partition_start: u64,
        partition_size: u64,
    ) -> Result<Arc<Self>, StorageError> {
        let disk_info = device.info();
        let disk_bps = disk_info.bytes_per_sector;
        if !SUPPORTED_SECTOR_SIZES.contains(&disk_bps) {
            log::warn!("ntfs: unsupported disk sector size {}", disk_bps);
            return Err(StorageError::InvalidFilesystem);
        }

        let mut sector = vec![0u8; disk_bps as usize];
        device.read_sectors(partition_start, 1, &mut sector)?;
        let boot = NtfsBootSector::from_bytes(&sector)?;

        let boot_bps = boot.bytes_per_sector as u32;
        if !SUPPORTED_SECTOR_SIZES.contains(&boot_bps) {
            log::warn!("ntfs: unsupported boot sector size {}", boot_bps);
            return Err(StorageError::InvalidFilesystem);
        }
        if boot_bps != disk_bps {
            log::warn!("ntfs: disk/boot sector size mismatch {}/{}", disk_bps, boot_bps);
            return Err(StorageError::InvalidFilesystem);
        }

        let sectors_per_cluster = boot.sectors_per_cluster as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            log::warn!("ntfs: invalid sectors per cluster {}", sectors_per_cluster);
            return Err(StorageError::InvalidFilesystem);
        }

        let bytes_per_cluster = boot_bps
            .checked_mul(sectors_per_cluster)
            .ok_or(StorageError::InvalidFilesystem)?;

        let file_record_size = boot.file_record_size(bytes_per_cluster)?;

        let mft_start_sector = boot
            .mft_start_cluster
            .checked_mul(sectors_per_cluster as u64)
            .and_then(|offset| partition_start.checked_add(offset))
            .ok_or(StorageError::InvalidFilesystem)?;

        let fs = Arc::new(NtfsFilesystem {
            device,
            boot,
            partition_start,
            partition_size,
            bytes_per_sector: boot_bps,
            sectors_per_cluster,
            bytes_per_cluster,
            file_record_size,
            mft_start_sector,
            mft_start_cluster: boot.mft_start_cluster,
            volume_label: String::new(),
            path_cache: Mutex::new(PathLookupCache::new()),
            enumeration_count: AtomicU32::new(0),
        });

        log::debug!(
            "ntfs: mounted bytes_per_sector={} sectors_per_cluster={} record_size={} mft_cluster={}",
            fs.bytes_per_sector,
            fs.sectors_per_cluster,
            fs.file_record_size,
            fs.mft_start_cluster
        );

        // Sanity check the MFT itself; a volume whose record 0 does not parse
        // is not usable.
        let mft_info = fs.read_file_record(0)?;
        if !mft_info.is_in_use() {
            log::warn!("ntfs: MFT record 0 is not in use");
            return Err(StorageError::Corrupted);
        }

        // Volume label, best effort.
        let label = fs.read_volume_label().unwrap_or_default();

        let mut fs = fs;
        if !label.is_empty() {
            // The Arc is still unique here; no clone has escaped.
            if let Some(inner) = Arc::get_mut(&mut fs) {
                inner.volume_label = label;
            }
        }

        Ok(fs)
    }

    /// Read sectors from the mounted partition by absolute disk sector.
    pub(crate) fn read_sectors(
        &self,
        sector: u64,
        num_sectors: u32,
        buffer: &mut [u8],
    ) -> Result<(), StorageError> {
        if num_sectors == 0 {
            return Err(StorageError::InvalidArgument);
        }
        if sector < self.partition_start {
            log::warn!("ntfs: sector underflow {}", sector);
            return Err(StorageError::InvalidSector);
        }

        let relative = sector - self.partition_start;
        if relative >= self.partition_size
            || num_sectors as u64 > self.partition_size - relative
        {
            log::warn!("ntfs: read beyond partition sector={} count={}", sector, num_sectors);
            return Err(StorageError::InvalidSector);
        }

        let byte_count = num_sectors as usize * self.bytes_per_sector as usize;
        if buffer.len() < byte_count {
            return Err(StorageError::BufferTooSmall);
        }

        self.device
            .read_sectors(sector, num_sectors, &mut buffer[..byte_count])
    }

    /// Count one folder enumeration (cache-effectiveness telemetry).
    pub(crate) fn note_enumeration(&self) {
        self.enumeration_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of folder enumerations performed since mount.
    pub fn enumeration_count(&self) -> u32 {
        self.enumeration_count.load(Ordering::Relaxed)
    }

    /// Read the volume label from $Volume's VOLUME_NAME attribute.
    fn read_volume_label(&self) -> Result<String, StorageError> {
        let (record_buffer, header) = self.load_file_record(VOLUME_FILE_RECORD_INDEX)?;
        let mut label = String::new();

        record::walk_attributes(
            &record_buffer,
            header.attributes_offset,
            header.used_size,
            |view| {
                if view.attr_type == ATTR_VOLUME_NAME && !view.non_resident && label.is_empty() {
                    label = utf16le_bytes_to_utf8(view.resident_value()?);
                }
                Ok(())
            },
        )?;

        Ok(label)
    }

    /// Fill a file handle header from parsed record metadata.
    fn fill_handle(&self, handle: &mut FileHandle, name: &str, info: &FileRecordInfo) {
        if !name.is_empty() {
            handle.name = String::from(name);
        } else if let Some(primary) = &info.primary_name {
            handle.name = primary.clone();
        } else {
            handle.name.clear();
        }

        handle.attributes = FileAttributes::READ_ONLY;
        if info.is_folder() {
            handle.attributes |= FileAttributes::FOLDER;
        }

        handle.size = if info.data.present { info.data.data_size } else { 0 };
        handle.times = info.times;
        handle.record_index = info.index;
    }

    /// Load the current enumeration entry into the handle header.
    ///
    /// Entries whose records no longer load are skipped.
    fn load_current_enumeration_entry(&self, handle: &mut FileHandle) -> Result<(), StorageError> {
        loop {
            let (record_index, name) = {
                let enumeration = handle.enumeration.as_ref().ok_or(StorageError::InvalidHandle)?;
                match enumeration.entries.get(enumeration.current) {
                    Some(entry) => (entry.record_index, entry.name.clone()),
                    None => return Err(StorageError::FileNotFound),
                }
            };

            match self.read_file_record(record_index) {
                Ok(info) => {
                    self.fill_handle(handle, &name, &info);
                    handle.position = 0;
                    return Ok(());
                }
                Err(_) => {
                    let enumeration = handle.enumeration.as_mut().unwrap();
                    enumeration.current += 1;
                }
            }
        }
    }

    fn open_wildcard(&self, path: &str, flags: OpenFlags) -> Result<FileHandle, StorageError> {
        let (folder_path, pattern) = path::split_wildcard_path(path);

        let (folder_index, is_folder) = path::resolve_path(self, folder_path)?;
        if !is_folder {
            return Err(StorageError::NotADirectory);
        }

        let matches = path::enumerate_matching(self, folder_index, pattern)?;
        if matches.is_empty() {
            return Err(StorageError::FileNotFound);
        }

        let mut handle = FileHandle::new(flags);
        handle.enumeration = Some(Enumeration {
            entries: matches,
            current: 0,
        });
        self.load_current_enumeration_entry(&mut handle)?;
        Ok(handle)
    }
}

impl Filesystem for NtfsFilesystem {
    fn fs_type(&self) -> &str {
        "ntfs"
    }

    fn volume_label(&self) -> String {
        self.volume_label.clone()
    }

    fn statfs(&self) -> Result<FsStats, StorageError> {
        Ok(FsStats {
            fs_type: 0x5346_544E, // "NTFS" little-endian
            block_size: self.bytes_per_cluster,
            total_blocks: self.boot.total_sectors / self.sectors_per_cluster as u64,
            fs_id: self.boot.volume_serial,
            flags: MountFlags::READ_ONLY,
        })
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle, StorageError> {
        if flags.requires_write() {
            return Err(StorageError::PermissionDenied);
        }

        if path::has_wildcard(path) {
            return self.open_wildcard(path, flags);
        }

        let (record_index, _is_folder) = path::resolve_path(self, path)?;
        let info = self.read_file_record(record_index)?;

        let base_name = path::path_components(path).last().unwrap_or("");
        let mut handle = FileHandle::new(flags);
        self.fill_handle(&mut handle, base_name, &info);
        handle.position = 0;
        Ok(handle)
    }

    fn open_next(&self, handle: &mut FileHandle) -> Result<(), StorageError> {
        let enumeration = handle.enumeration.as_mut().ok_or(StorageError::InvalidHandle)?;
        enumeration.current += 1;
        self.load_current_enumeration_entry(handle)
    }

    fn close(&self, handle: FileHandle) -> Result<(), StorageError> {
        // Handles own their enumeration snapshot; dropping releases it.
        drop(handle);
        Ok(())
    }

    fn read(&self, handle: &mut FileHandle, buffer: &mut [u8]) -> Result<usize, StorageError> {
        if handle.is_folder() && handle.enumeration.is_none() {
            return Err(StorageError::NotAFile);
        }

        if handle.position >= handle.size {
            return Ok(0);
        }

        let remaining = handle.size - handle.position;
        let count = (buffer.len() as u64).min(remaining) as usize;
        if count == 0 {
            return Ok(0);
        }

        let bytes_read =
            self.read_file_data_range(handle.record_index, handle.position, &mut buffer[..count])?;
        handle.position += bytes_read as u64;
        Ok(bytes_read)
    }

    fn write(&self, _handle: &mut FileHandle, _data: &[u8]) -> Result<usize, StorageError> {
        Err(StorageError::PermissionDenied)
    }

    fn create_folder(&self, _path: &str) -> Result<(), StorageError> {
        Err(StorageError::PermissionDenied)
    }

    fn remove(&self, _path: &str) -> Result<(), StorageError> {
        Err(StorageError::PermissionDenied)
    }

    fn rename(&self, _old_path: &str, _new_path: &str) -> Result<(), StorageError> {
        Err(StorageError::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::record::{
        RecordFlags, ATTR_DATA, ATTR_END_MARKER, ATTR_FILE_NAME, ATTR_INDEX_ROOT,
        ATTR_VOLUME_NAME, NAMESPACE_WIN32, NAMESPACE_WIN32_DOS,
    };
    use super::*;
    use crate::driver::test_support::MemDisk;

    const BPS: usize = 512;
    const SPC: usize = 8;
    const CLUSTER: usize = BPS * SPC;
    const RECORD_SIZE: usize = 1024;
    const MFT_CLUSTER: u64 = 4;
    const TOTAL_SECTORS: u64 = 1024;

    /// Builder for one MFT file record.
    struct RecordBuilder {
        data: Vec<u8>,
        flags: u16,
        sequence: u16,
    }

    impl RecordBuilder {
        fn new(flags: RecordFlags, sequence: u16) -> Self {
            RecordBuilder {
                // Attributes start at 0x38, after header + USA.
                data: vec![0u8; 0x38],
                flags: flags.bits(),
                sequence,
            }
        }

        fn push_resident(&mut self, attr_type: u32, name: Option<&str>, value: &[u8]) -> &mut Self {
            let name_units: Vec<u16> = name.unwrap_or("").encode_utf16().collect();
            let name_offset = 0x18usize;
            let value_offset = name_offset + name_units.len() * 2;
            let length = (value_offset + value.len() + 7) & !7;

            let base = self.data.len();
            self.data.resize(base + length, 0);
            let attr = &mut self.data[base..];
            attr[0..4].copy_from_slice(&attr_type.to_le_bytes());
            attr[4..8].copy_from_slice(&(length as u32).to_le_bytes());
            attr[8] = 0;
            attr[9] = name_units.len() as u8;
            attr[10..12].copy_from_slice(&(name_offset as u16).to_le_bytes());
            attr[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes());
            attr[20..22].copy_from_slice(&(value_offset as u16).to_le_bytes());
            for (i, unit) in name_units.iter().enumerate() {
                attr[name_offset + i * 2..name_offset + i * 2 + 2]
                    .copy_from_slice(&unit.to_le_bytes());
            }
            attr[value_offset..value_offset + value.len()].copy_from_slice(value);
            self
        }

        fn push_non_resident_data(&mut self, runlist: &[u8], data_size: u64, allocated: u64) -> &mut Self {
            let run_offset = 0x40usize;
            let length = (run_offset + runlist.len() + 7) & !7;

            let base = self.data.len();
            self.data.resize(base + length, 0);
            let attr = &mut self.data[base..];
            attr[0..4].copy_from_slice(&ATTR_DATA.to_le_bytes());
            attr[4..8].copy_from_slice(&(length as u32).to_le_bytes());
            attr[8] = 1; // non-resident
            attr[32..34].copy_from_slice(&(run_offset as u16).to_le_bytes());
            attr[40..48].copy_from_slice(&allocated.to_le_bytes());
            attr[48..56].copy_from_slice(&data_size.to_le_bytes());
            attr[56..64].copy_from_slice(&data_size.to_le_bytes());
            attr[run_offset..run_offset + runlist.len()].copy_from_slice(runlist);
            self
        }

        /// Finish the record: header, end marker, USA fixup.
        fn build(&self) -> Vec<u8> {
            let mut record = self.data.clone();
            record.extend_from_slice(&ATTR_END_MARKER.to_le_bytes());
            record.extend_from_slice(&[0u8; 4]);
            let used_size = record.len() as u32;
            record.resize(RECORD_SIZE, 0);

            record[0..4].copy_from_slice(b"FILE");
            record[4..6].copy_from_slice(&48u16.to_le_bytes()); // USA offset
            record[6..8].copy_from_slice(&3u16.to_le_bytes()); // USA size
            record[16..18].copy_from_slice(&self.sequence.to_le_bytes());
            record[20..22].copy_from_slice(&0x38u16.to_le_bytes());
            record[22..24].copy_from_slice(&self.flags.to_le_bytes());
            record[24..28].copy_from_slice(&used_size.to_le_bytes());
            record[28..32].copy_from_slice(&(RECORD_SIZE as u32).to_le_bytes());

            // Install the update sequence: USN 1, saving the real tails.
            let usn: u16 = 1;
            record[48..50].copy_from_slice(&usn.to_le_bytes());
            let tail1 = [record[510], record[511]];
            let tail2 = [record[1022], record[1023]];
            record[50..52].copy_from_slice(&tail1);
            record[52..54].copy_from_slice(&tail2);
            record[510..512].copy_from_slice(&usn.to_le_bytes());
            record[1022..1024].copy_from_slice(&usn.to_le_bytes());
            record
        }
    }

    fn file_name_value(name: &str, namespace: u8, parent: u32, directory: bool) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut value = vec![0u8; 66 + units.len() * 2];
        value[0..4].copy_from_slice(&parent.to_le_bytes());
        let flags: u32 = if directory { 0x1000_0000 } else { 0 };
        value[56..60].copy_from_slice(&flags.to_le_bytes());
        value[64] = units.len() as u8;
        value[65] = namespace;
        for (i, unit) in units.iter().enumerate() {
            value[66 + i * 2..68 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        value
    }

    /// Build a resident $I30 INDEX_ROOT payload from (record, name, folder).
    fn index_root_value(children: &[(u32, &str, bool)]) -> Vec<u8> {
        let mut entries = Vec::new();
        for (record_index, name, is_folder) in children {
            let key = file_name_value(name, NAMESPACE_WIN32, ROOT_FILE_RECORD_INDEX, *is_folder);
            let entry_len = (16 + key.len() + 7) & !7;
            let base = entries.len();
            entries.resize(base + entry_len, 0);
            let entry = &mut entries[base..];
            entry[0..4].copy_from_slice(&record_index.to_le_bytes());
            // Sequence in the reference: matches the builder default of 1.
            entry[6..8].copy_from_slice(&1u16.to_le_bytes());
            entry[8..10].copy_from_slice(&(entry_len as u16).to_le_bytes());
            entry[10..12].copy_from_slice(&(key.len() as u16).to_le_bytes());
            // flags = 0
            entry[16..16 + key.len()].copy_from_slice(&key);
        }
        // Terminating LAST_ENTRY.
        let base = entries.len();
        entries.resize(base + 16, 0);
        entries[base + 8..base + 10].copy_from_slice(&16u16.to_le_bytes());
        entries[base + 12..base + 14].copy_from_slice(&2u16.to_le_bytes());

        let mut value = vec![0u8; 32];
        value[0..4].copy_from_slice(&ATTR_FILE_NAME.to_le_bytes());
        value[8..12].copy_from_slice(&(CLUSTER as u32).to_le_bytes()); // index block size
        value[12] = 1; // clusters per block
        // Index node header at offset 16.
        let entry_size = 16 + entries.len() as u32;
        value[16..20].copy_from_slice(&16u32.to_le_bytes()); // entry offset
        value[20..24].copy_from_slice(&entry_size.to_le_bytes());
        value[24..28].copy_from_slice(&entry_size.to_le_bytes());
        value.extend_from_slice(&entries);
        value
    }

    /// Build a complete little NTFS volume image:
    ///
    /// ```text
    /// /            (record 5)
    ///   dir/       (record 6)
    ///     a.txt    (record 8, resident)
    ///     b.txt    (record 9, resident)
    ///   hello.txt  (record 7, resident)
    ///   big.bin    (record 10, non-resident, sparse middle cluster)
    /// ```
    fn build_volume() -> MemDisk {
        let disk = MemDisk::new(BPS as u32, TOTAL_SECTORS);
        let mut image = disk.data.lock();

        // Boot sector.
        image[3..11].copy_from_slice(b"NTFS    ");
        image[11..13].copy_from_slice(&(BPS as u16).to_le_bytes());
        image[13] = SPC as u8;
        image[40..48].copy_from_slice(&TOTAL_SECTORS.to_le_bytes());
        image[48..56].copy_from_slice(&MFT_CLUSTER.to_le_bytes());
        image[64] = (-10i8) as u8; // 2^10 = 1024-byte records
        image[72..80].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        image[510] = 0x55;
        image[511] = 0xAA;

        let mft_offset = MFT_CLUSTER as usize * CLUSTER;
        let mut put_record = |index: usize, record: Vec<u8>| {
            let start = mft_offset + index * RECORD_SIZE;
            image[start..start + RECORD_SIZE].copy_from_slice(&record);
        };

        // Record 0: $MFT with a non-resident DATA covering clusters 4..7.
        let mut mft = RecordBuilder::new(RecordFlags::IN_USE, 1);
        mft.push_resident(
            ATTR_FILE_NAME,
            None,
            &file_name_value("$MFT", NAMESPACE_WIN32_DOS, ROOT_FILE_RECORD_INDEX, false),
        );
        // Runlist: 3 clusters at LCN 4.
        mft.push_non_resident_data(
            &[0x11, 0x03, 0x04, 0x00],
            (3 * CLUSTER) as u64,
            (3 * CLUSTER) as u64,
        );
        put_record(0, mft.build());

        // Record 3: $Volume with a volume name.
        let mut volume = RecordBuilder::new(RecordFlags::IN_USE, 1);
        let label_units: Vec<u8> = "TESTVOL"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        volume.push_resident(ATTR_VOLUME_NAME, None, &label_units);
        put_record(3, volume.build());

        // Record 5: root folder.
        let mut root = RecordBuilder::new(RecordFlags::IN_USE | RecordFlags::FOLDER, 1);
        root.push_resident(
            ATTR_FILE_NAME,
            None,
            &file_name_value(".", NAMESPACE_WIN32_DOS, ROOT_FILE_RECORD_INDEX, true),
        );
        root.push_resident(
            ATTR_INDEX_ROOT,
            Some("$I30"),
            &index_root_value(&[
                (6, "dir", true),
                (7, "hello.txt", false),
                (10, "big.bin", false),
            ]),
        );
        put_record(5, root.build());

        // Record 6: "dir" folder with two children.
        let mut dir = RecordBuilder::new(RecordFlags::IN_USE | RecordFlags::FOLDER, 1);
        dir.push_resident(
            ATTR_FILE_NAME,
            None,
            &file_name_value("dir", NAMESPACE_WIN32, ROOT_FILE_RECORD_INDEX, true),
        );
        dir.push_resident(
            ATTR_INDEX_ROOT,
            Some("$I30"),
            &index_root_value(&[(8, "a.txt", false), (9, "b.txt", false)]),
        );
        put_record(6, dir.build());

        // Record 7: resident file.
        let mut hello = RecordBuilder::new(RecordFlags::IN_USE, 1);
        hello.push_resident(
            ATTR_FILE_NAME,
            None,
            &file_name_value("hello.txt", NAMESPACE_WIN32, ROOT_FILE_RECORD_INDEX, false),
        );
        hello.push_resident(ATTR_DATA, None, b"Hello, NTFS!");
        put_record(7, hello.build());

        // Records 8 and 9: files inside "dir".
        for (index, name, content) in [(8usize, "a.txt", b"AAAA".as_slice()), (9, "b.txt", b"BB")] {
            let mut file = RecordBuilder::new(RecordFlags::IN_USE, 1);
            file.push_resident(
                ATTR_FILE_NAME,
                None,
                &file_name_value(name, NAMESPACE_WIN32, 6, false),
            );
            file.push_resident(ATTR_DATA, None, content);
            put_record(index, file.build());
        }

        // Record 10: non-resident file with a sparse middle cluster.
        // Runs: 1 cluster at LCN 20, 1 sparse cluster, 1 cluster at LCN 21.
        let mut big = RecordBuilder::new(RecordFlags::IN_USE, 1);
        big.push_resident(
            ATTR_FILE_NAME,
            None,
            &file_name_value("big.bin", NAMESPACE_WIN32, ROOT_FILE_RECORD_INDEX, false),
        );
        big.push_non_resident_data(
            &[0x11, 0x01, 0x14, 0x01, 0x01, 0x11, 0x01, 0x01, 0x00],
            (3 * CLUSTER) as u64,
            (3 * CLUSTER) as u64,
        );
        put_record(10, big.build());

        // Content for big.bin: cluster 20 = 0x41, cluster 21 = 0x43.
        let c20 = 20 * CLUSTER;
        image[c20..c20 + CLUSTER].fill(0x41);
        let c21 = 21 * CLUSTER;
        image[c21..c21 + CLUSTER].fill(0x43);

        drop(image);
        disk
    }

    fn mount_volume() -> Arc<NtfsFilesystem> {
        NtfsFilesystem::mount(Arc::new(build_volume()), 0, TOTAL_SECTORS).unwrap()
    }

    #[test]
    fn mounts_and_reads_geometry() {
        let fs = mount_volume();
        assert_eq!(fs.bytes_per_sector, 512);
        assert_eq!(fs.sectors_per_cluster, 8);
        assert_eq!(fs.file_record_size, 1024);
        assert_eq!(fs.mft_start_sector, 32);
        assert_eq!(fs.volume_label(), "TESTVOL");
    }

    #[test]
    fn mft_bootstrap_record_zero() {
        let fs = mount_volume();
        let info = fs.read_file_record(0).unwrap();
        assert!(info.is_in_use());
        assert_eq!(info.primary_name.as_deref(), Some("$MFT"));
        assert!(info.data.present);
        assert!(!info.data.resident);
    }

    #[test]
    fn rejects_bad_boot_signature() {
        let disk = build_volume();
        disk.data.lock()[510] = 0;
        let result = NtfsFilesystem::mount(Arc::new(disk), 0, TOTAL_SECTORS);
        assert_eq!(result.err(), Some(StorageError::InvalidFilesystem));
    }

    #[test]
    fn resolves_paths_and_hits_cache() {
        let fs = mount_volume();

        let (index, is_folder) = path::resolve_path(&fs, "dir/a.txt").unwrap();
        assert_eq!(index, 8);
        assert!(!is_folder);
        let after_first = fs.enumeration_count();
        assert!(after_first > 0);

        // Second path under the same folder: "dir" itself is cached, only the
        // leaf lookup enumerates.
        let (index, _) = path::resolve_path(&fs, "dir/b.txt").unwrap();
        assert_eq!(index, 9);
        let after_second = fs.enumeration_count();
        assert_eq!(after_second, after_first + 1);

        // Fully cached path resolves with zero additional enumerations.
        let (index, _) = path::resolve_path(&fs, "dir/a.txt").unwrap();
        assert_eq!(index, 8);
        assert_eq!(fs.enumeration_count(), after_second);
    }

    #[test]
    fn path_lookup_is_case_insensitive() {
        let fs = mount_volume();
        let (index, _) = path::resolve_path(&fs, "DIR/A.TXT").unwrap();
        assert_eq!(index, 8);
    }

    #[test]
    fn missing_component_fails_cleanly() {
        let fs = mount_volume();
        assert_eq!(
            path::resolve_path(&fs, "dir/missing.txt").err(),
            Some(StorageError::FileNotFound)
        );
        // The volume stays usable.
        assert!(path::resolve_path(&fs, "hello.txt").is_ok());
    }

    #[test]
    fn reads_resident_file() {
        let fs = mount_volume();
        let mut handle = fs.open("hello.txt", OpenFlags::READ).unwrap();
        assert_eq!(handle.size, 12);

        let mut buffer = [0u8; 32];
        let count = fs.read(&mut handle, &mut buffer).unwrap();
        assert_eq!(&buffer[..count], b"Hello, NTFS!");

        // Position advanced to EOF; further reads transfer nothing.
        assert_eq!(fs.read(&mut handle, &mut buffer).unwrap(), 0);
    }

    #[test]
    fn reads_non_resident_file_with_sparse_run() {
        let fs = mount_volume();
        let mut handle = fs.open("big.bin", OpenFlags::READ).unwrap();
        assert_eq!(handle.size, (3 * CLUSTER) as u64);

        let mut content = vec![0xFFu8; 3 * CLUSTER];
        let count = fs.read(&mut handle, &mut content).unwrap();
        assert_eq!(count, 3 * CLUSTER);

        assert!(content[..CLUSTER].iter().all(|&b| b == 0x41));
        assert!(content[CLUSTER..2 * CLUSTER].iter().all(|&b| b == 0));
        assert!(content[2 * CLUSTER..].iter().all(|&b| b == 0x43));
    }

    #[test]
    fn partial_reads_advance_position() {
        let fs = mount_volume();
        let mut handle = fs.open("hello.txt", OpenFlags::READ).unwrap();

        let mut buffer = [0u8; 5];
        assert_eq!(fs.read(&mut handle, &mut buffer).unwrap(), 5);
        assert_eq!(&buffer, b"Hello");
        assert_eq!(fs.read(&mut handle, &mut buffer).unwrap(), 5);
        assert_eq!(&buffer, b", NTF");
        assert_eq!(fs.read(&mut handle, &mut buffer).unwrap(), 2);
        assert_eq!(&buffer[..2], b"S!");
    }

    #[test]
    fn wildcard_open_enumerates_matches() {
        let fs = mount_volume();
        let mut handle = fs.open("dir/*.txt", OpenFlags::READ).unwrap();

        let mut names = vec![handle.name.clone()];
        while fs.open_next(&mut handle).is_ok() {
            names.push(handle.name.clone());
        }
        names.sort();
        assert_eq!(names, ["a.txt", "b.txt"]);
    }

    #[test]
    fn write_paths_return_permission_denied() {
        let fs = mount_volume();
        assert_eq!(
            fs.open("hello.txt", OpenFlags::WRITE).err(),
            Some(StorageError::PermissionDenied)
        );
        assert_eq!(
            fs.open("new.txt", OpenFlags::CREATE_ALWAYS).err(),
            Some(StorageError::PermissionDenied)
        );
        assert_eq!(
            fs.create_folder("newdir").err(),
            Some(StorageError::PermissionDenied)
        );
        assert_eq!(
            fs.remove("hello.txt").err(),
            Some(StorageError::PermissionDenied)
        );
        assert_eq!(
            fs.rename("hello.txt", "bye.txt").err(),
            Some(StorageError::PermissionDenied)
        );

        let mut handle = fs.open("hello.txt", OpenFlags::READ).unwrap();
        assert_eq!(
            fs.write(&mut handle, b"nope").err(),
            Some(StorageError::PermissionDenied)
        );
    }

    #[test]
    fn open_folder_exposes_folder_attribute() {
        let fs = mount_volume();
        let handle = fs.open("dir", OpenFlags::READ).unwrap();
        assert!(handle.attributes.contains(FileAttributes::FOLDER));
        assert!(handle.attributes.contains(FileAttributes::READ_ONLY));
    }

    #[test]
    fn corrupted_record_fails_only_that_operation() {
        // Corrupt record 7's first-sector fixup tail on disk.
        let disk = build_volume();
        {
            let mut image = disk.data.lock();
            let record7 = MFT_CLUSTER as usize * CLUSTER + 7 * RECORD_SIZE;
            image[record7 + 510] ^= 0xFF;
        }
        let fs = NtfsFilesystem::mount(Arc::new(disk), 0, TOTAL_SECTORS).unwrap();

        // hello.txt (record 7) no longer resolves...
        assert!(fs.open("hello.txt", OpenFlags::READ).is_err());
        // ...but the rest of the volume still works.
        let (index, _) = path::resolve_path(&fs, "dir/a.txt").unwrap();
        assert_eq!(index, 8);
    }

    #[test]
    fn time_conversion_clamps_pre_epoch() {
        assert_eq!(ntfs_time_to_unix(0), 0);
        assert_eq!(ntfs_time_to_unix(NTFS_EPOCH_DIFF), 0);
        assert_eq!(ntfs_time_to_unix(NTFS_EPOCH_DIFF + 10_000_000), 1_000_000_000);
    }
}
