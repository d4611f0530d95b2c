//! Partition table parsing.
//!
//! This module provides support for parsing partition tables:
//! - MBR (Master Boot Record)
//! - GPT (GUID Partition Table)

use alloc::vec;
use alloc::vec::Vec;

use crate::driver::BlockDevice;
use crate::StorageError;

/// Partition type from the MBR type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// Empty/unused partition.
    Empty,
    /// NTFS or exFAT.
    Ntfs,
    /// FAT32 (LBA).
    Fat32Lba,
    /// Extended partition.
    Extended,
    /// EFI System Partition.
    EfiSystem,
    /// GPT protective MBR.
    GptProtective,
    /// Linux.
    Linux,
    /// Unknown type.
    Unknown(u8),
}

impl From<u8> for PartitionType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => PartitionType::Empty,
            0x05 | 0x0F => PartitionType::Extended,
            0x07 => PartitionType::Ntfs,
            0x0B | 0x0C => PartitionType::Fat32Lba,
            0x83 => PartitionType::Linux,
            0xEE => PartitionType::GptProtective,
            0xEF => PartitionType::EfiSystem,
            other => PartitionType::Unknown(other),
        }
    }
}

impl PartitionType {
    /// Check if this is a GPT protective MBR entry.
    pub fn is_gpt(&self) -> bool {
        matches!(self, PartitionType::GptProtective)
    }
}

/// MBR partition entry.
#[derive(Debug, Clone, Copy)]
pub struct MbrPartitionEntry {
    /// Boot indicator (0x80 = bootable).
    pub boot_indicator: u8,
    /// Partition type byte.
    pub partition_type: u8,
    /// Starting LBA.
    pub start_lba: u32,
    /// Number of sectors.
    pub num_sectors: u32,
}

impl MbrPartitionEntry {
    /// Entry size in bytes.
    pub const SIZE: usize = 16;

    /// Parse one entry from its 16 on-disk bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < Self::SIZE {
            return Err(StorageError::InvalidArgument);
        }

        Ok(MbrPartitionEntry {
            boot_indicator: data[0],
            partition_type: data[4],
            start_lba: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            num_sectors: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        })
    }

    /// Check if partition is bootable.
    pub fn is_bootable(&self) -> bool {
        self.boot_indicator == 0x80
    }

    /// Check if partition is valid (non-empty).
    pub fn is_valid(&self) -> bool {
        self.partition_type != 0 && self.num_sectors > 0
    }

    /// Get partition type.
    pub fn get_type(&self) -> PartitionType {
        PartitionType::from(self.partition_type)
    }
}

/// MBR (Master Boot Record).
#[derive(Debug, Clone)]
pub struct Mbr {
    /// The four primary partition entries.
    pub partitions: [MbrPartitionEntry; 4],
}

impl Mbr {
    /// MBR size in bytes.
    pub const SIZE: usize = 512;
    /// MBR boot signature.
    pub const SIGNATURE: u16 = 0xAA55;

    /// Parse an MBR from the first sector of a disk.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < Self::SIZE {
            return Err(StorageError::InvalidArgument);
        }

        let signature = u16::from_le_bytes([data[510], data[511]]);
        if signature != Self::SIGNATURE {
            return Err(StorageError::InvalidFilesystem);
        }

        let mut partitions = [MbrPartitionEntry {
            boot_indicator: 0,
            partition_type: 0,
            start_lba: 0,
            num_sectors: 0,
        }; 4];

        for (i, entry) in partitions.iter_mut().enumerate() {
            let offset = 446 + i * MbrPartitionEntry::SIZE;
            *entry = MbrPartitionEntry::from_bytes(&data[offset..offset + MbrPartitionEntry::SIZE])?;
        }

        Ok(Mbr { partitions })
    }

    /// Check if this is a GPT disk (protective MBR in slot 0).
    pub fn is_gpt(&self) -> bool {
        self.partitions[0].get_type().is_gpt()
    }
}

/// GPT header.
#[derive(Debug, Clone)]
pub struct GptHeader {
    /// First usable LBA.
    pub first_usable_lba: u64,
    /// Last usable LBA.
    pub last_usable_lba: u64,
    /// LBA of the partition entry array.
    pub partition_entry_lba: u64,
    /// Number of partition entries.
    pub num_partition_entries: u32,
    /// Size of one partition entry.
    pub partition_entry_size: u32,
}

impl GptHeader {
    /// GPT signature ("EFI PART").
    pub const SIGNATURE: &'static [u8; 8] = b"EFI PART";

    /// Parse a GPT header from LBA 1.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < 92 {
            return Err(StorageError::InvalidArgument);
        }

        if &data[0..8] != Self::SIGNATURE {
            return Err(StorageError::InvalidFilesystem);
        }

        Ok(GptHeader {
            first_usable_lba: u64::from_le_bytes(data[40..48].try_into().unwrap()),
            last_usable_lba: u64::from_le_bytes(data[48..56].try_into().unwrap()),
            partition_entry_lba: u64::from_le_bytes(data[72..80].try_into().unwrap()),
            num_partition_entries: u32::from_le_bytes(data[80..84].try_into().unwrap()),
            partition_entry_size: u32::from_le_bytes(data[84..88].try_into().unwrap()),
        })
    }
}

/// GPT partition entry.
#[derive(Debug, Clone)]
pub struct GptPartitionEntry {
    /// Partition type GUID.
    pub type_guid: [u8; 16],
    /// Starting LBA.
    pub start_lba: u64,
    /// Ending LBA (inclusive).
    pub end_lba: u64,
}

impl GptPartitionEntry {
    /// Minimum entry size in bytes.
    pub const SIZE: usize = 128;

    /// Empty type GUID.
    pub const TYPE_EMPTY: [u8; 16] = [0; 16];

    /// Microsoft Basic Data type GUID (NTFS lives here).
    pub const TYPE_MICROSOFT_BASIC: [u8; 16] = [
        0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44,
        0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
    ];

    /// Parse one GPT partition entry.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < Self::SIZE {
            return Err(StorageError::InvalidArgument);
        }

        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&data[0..16]);

        Ok(GptPartitionEntry {
            type_guid,
            start_lba: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            end_lba: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }

    /// Check if the entry is in use.
    pub fn is_valid(&self) -> bool {
        self.type_guid != Self::TYPE_EMPTY
    }

    /// Get partition size in sectors.
    pub fn size(&self) -> u64 {
        if self.end_lba >= self.start_lba {
            self.end_lba - self.start_lba + 1
        } else {
            0
        }
    }

    /// Check if this is a Microsoft Basic Data partition.
    pub fn is_microsoft_basic(&self) -> bool {
        self.type_guid == Self::TYPE_MICROSOFT_BASIC
    }
}

/// Discovered partition.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    /// Partition index on the disk (0-based, in table order).
    pub index: u8,
    /// Starting LBA.
    pub start_lba: u64,
    /// Number of sectors.
    pub num_sectors: u64,
    /// Partition type from the MBR, if the table is MBR.
    pub part_type: Option<PartitionType>,
    /// Type GUID, if the table is GPT.
    pub type_guid: Option<[u8; 16]>,
    /// Is bootable (MBR only).
    pub bootable: bool,
}

/// Partition table type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTableType {
    /// MBR partition table.
    Mbr,
    /// GPT partition table.
    Gpt,
    /// No partition table found.
    None,
}

/// Scan a block device for partitions.
///
/// Reads the MBR; if it carries a GPT protective entry and a valid GPT header
/// exists at LBA 1, the GPT entries win. Unused entries are skipped. A disk
/// with no table at all yields an empty list rather than an error.
pub fn scan_partitions(device: &dyn BlockDevice) -> Result<Vec<PartitionInfo>, StorageError> {
    let info = device.info();
    let bps = info.bytes_per_sector as usize;
    if bps < Mbr::SIZE {
        return Err(StorageError::InvalidArgument);
    }

    let mut sector0 = vec![0u8; bps];
    device.read_sectors(0, 1, &mut sector0)?;

    let mbr = match Mbr::from_bytes(&sector0) {
        Ok(mbr) => mbr,
        Err(_) => return Ok(Vec::new()),
    };

    if mbr.is_gpt() {
        let mut sector1 = vec![0u8; bps];
        device.read_sectors(1, 1, &mut sector1)?;
        if let Ok(header) = GptHeader::from_bytes(&sector1) {
            return scan_gpt_entries(device, &header, bps);
        }
    }

    let mut partitions = Vec::new();
    for (index, entry) in mbr.partitions.iter().enumerate() {
        if !entry.is_valid() || entry.get_type().is_gpt() {
            continue;
        }
        partitions.push(PartitionInfo {
            index: index as u8,
            start_lba: entry.start_lba as u64,
            num_sectors: entry.num_sectors as u64,
            part_type: Some(entry.get_type()),
            type_guid: None,
            bootable: entry.is_bootable(),
        });
    }

    Ok(partitions)
}

fn scan_gpt_entries(
    device: &dyn BlockDevice,
    header: &GptHeader,
    bps: usize,
) -> Result<Vec<PartitionInfo>, StorageError> {
    let entry_size = header.partition_entry_size as usize;
    if entry_size < GptPartitionEntry::SIZE || header.num_partition_entries > 1024 {
        return Err(StorageError::InvalidFilesystem);
    }

    let total_bytes = entry_size * header.num_partition_entries as usize;
    let num_sectors = total_bytes.div_ceil(bps);
    let mut table = vec![0u8; num_sectors * bps];
    device.read_sectors(header.partition_entry_lba, num_sectors as u32, &mut table)?;

    let mut partitions = Vec::new();
    for index in 0..header.num_partition_entries as usize {
        let offset = index * entry_size;
        let entry = GptPartitionEntry::from_bytes(&table[offset..offset + GptPartitionEntry::SIZE])?;
        if !entry.is_valid() {
            continue;
        }
        partitions.push(PartitionInfo {
            index: index as u8,
            start_lba: entry.start_lba,
            num_sectors: entry.size(),
            part_type: None,
            type_guid: Some(entry.type_guid),
            bootable: false,
        });
    }

    Ok(partitions)
}

/// Legacy CHS disk geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChsGeometry {
    /// Heads per cylinder.
    pub heads: u32,
    /// Sectors per track (1-based sector numbering).
    pub sectors_per_track: u32,
}

/// Convert a linear sector number to cylinder/head/sector.
///
/// Only meaningful for the legacy CHS fields of MBR entries; sectors are
/// 1-based on track boundaries.
pub fn sector_to_chs(sector: u64, geometry: ChsGeometry) -> Option<(u32, u32, u32)> {
    if geometry.heads == 0 || geometry.sectors_per_track == 0 {
        return None;
    }

    let track = sector / geometry.sectors_per_track as u64;
    let sector_in_track = (sector % geometry.sectors_per_track as u64) as u32 + 1;
    let head = (track % geometry.heads as u64) as u32;
    let cylinder = (track / geometry.heads as u64) as u32;
    Some((cylinder, head, sector_in_track))
}

/// Convert cylinder/head/sector back to a linear sector number.
pub fn chs_to_sector(cylinder: u32, head: u32, sector: u32, geometry: ChsGeometry) -> u64 {
    (cylinder as u64 * geometry.heads as u64 + head as u64) * geometry.sectors_per_track as u64
        + sector as u64
        - 1
}

/// Detect partition table type from the first two sectors.
pub fn detect_table_type(sector0: &[u8], sector1: &[u8]) -> PartitionTableType {
    if let Ok(mbr) = Mbr::from_bytes(sector0) {
        if mbr.is_gpt() && GptHeader::from_bytes(sector1).is_ok() {
            return PartitionTableType::Gpt;
        }
        return PartitionTableType::Mbr;
    }

    PartitionTableType::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::MemDisk;
    use crate::driver::BlockDevice;

    fn write_mbr_entry(sector: &mut [u8], slot: usize, ptype: u8, start: u32, count: u32) {
        let base = 446 + slot * 16;
        sector[base] = 0x80;
        sector[base + 4] = ptype;
        sector[base + 8..base + 12].copy_from_slice(&start.to_le_bytes());
        sector[base + 12..base + 16].copy_from_slice(&count.to_le_bytes());
    }

    #[test]
    fn scans_mbr_ntfs_partition() {
        let disk = MemDisk::new(512, 128);
        {
            let mut data = disk.data.lock();
            write_mbr_entry(&mut data[..512], 0, 0x07, 34, 64);
            data[510] = 0x55;
            data[511] = 0xAA;
        }

        let parts = scan_partitions(&disk).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start_lba, 34);
        assert_eq!(parts[0].num_sectors, 64);
        assert_eq!(parts[0].part_type, Some(PartitionType::Ntfs));
        assert!(parts[0].bootable);
    }

    #[test]
    fn empty_entries_are_skipped() {
        let disk = MemDisk::new(512, 128);
        {
            let mut data = disk.data.lock();
            data[510] = 0x55;
            data[511] = 0xAA;
        }

        let parts = scan_partitions(&disk).unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn missing_signature_yields_no_partitions() {
        let disk = MemDisk::new(512, 2);
        assert!(scan_partitions(&disk).unwrap().is_empty());
    }

    #[test]
    fn scans_gpt_basic_data_partition() {
        let disk = MemDisk::new(512, 256);
        {
            let mut data = disk.data.lock();
            // Protective MBR.
            write_mbr_entry(&mut data[..512], 0, 0xEE, 1, 255);
            data[510] = 0x55;
            data[511] = 0xAA;

            // GPT header at LBA 1.
            let header = &mut data[512..1024];
            header[0..8].copy_from_slice(b"EFI PART");
            header[40..48].copy_from_slice(&34u64.to_le_bytes()); // first usable
            header[48..56].copy_from_slice(&220u64.to_le_bytes()); // last usable
            header[72..80].copy_from_slice(&2u64.to_le_bytes()); // entry array LBA
            header[80..84].copy_from_slice(&4u32.to_le_bytes()); // entry count
            header[84..88].copy_from_slice(&128u32.to_le_bytes()); // entry size

            // One Microsoft Basic Data entry at LBA 2.
            let entry = &mut data[1024..1152];
            entry[0..16].copy_from_slice(&GptPartitionEntry::TYPE_MICROSOFT_BASIC);
            entry[32..40].copy_from_slice(&40u64.to_le_bytes());
            entry[40..48].copy_from_slice(&139u64.to_le_bytes());
        }

        let parts = scan_partitions(&disk).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start_lba, 40);
        assert_eq!(parts[0].num_sectors, 100);
        assert!(parts[0].type_guid.unwrap() == GptPartitionEntry::TYPE_MICROSOFT_BASIC);
    }

    #[test]
    fn chs_round_trip() {
        let geometry = ChsGeometry {
            heads: 16,
            sectors_per_track: 63,
        };
        for sector in [0u64, 1, 62, 63, 1007, 1008, 123_456] {
            let (cylinder, head, s) = sector_to_chs(sector, geometry).unwrap();
            assert_eq!(chs_to_sector(cylinder, head, s, geometry), sector);
        }

        assert!(sector_to_chs(10, ChsGeometry { heads: 0, sectors_per_track: 63 }).is_none());
    }

    #[test]
    fn detects_table_types() {
        let mut sector0 = [0u8; 512];
        let sector1 = [0u8; 512];
        assert_eq!(
            detect_table_type(&sector0, &sector1),
            PartitionTableType::None
        );

        sector0[510] = 0x55;
        sector0[511] = 0xAA;
        assert_eq!(
            detect_table_type(&sector0, &sector1),
            PartitionTableType::Mbr
        );
    }
}
