//! NTFS folder index ($I30) traversal.
//!
//! A folder's entries live in a B+tree: a resident INDEX_ROOT holds the root
//! node, large folders spill into INDEX_ALLOCATION blocks gated by a BITMAP
//! of live VCNs. Traversal is a bounded depth-first walk; malformed nodes are
//! recorded and skipped so one bad block cannot hide an entire folder.

use alloc::vec;
use alloc::vec::Vec;

use crate::unicode::{utf16le_bytes_to_utf8, utf16le_eq_ignore_ascii_case};
use crate::{FileTimes, FolderEntry, StorageError};

use super::record::{
    decode_file_reference, walk_attributes, AttributeView, FileRecordInfo, ATTR_ATTRIBUTE_LIST,
    ATTR_BITMAP, ATTR_HEADER_NON_RESIDENT_SIZE, ATTR_INDEX_ALLOCATION, ATTR_INDEX_ROOT,
    FILE_NAME_DIRECTORY_FLAG, FILE_NAME_MIN_SIZE,
};
use super::runlist::read_non_resident_all;
use super::{ntfs_time_to_unix, NtfsFilesystem};

/// Index block magic "INDX".
const INDEX_BLOCK_MAGIC: u32 = 0x58444E49;

/// Index entry flags.
const ENTRY_FLAG_HAS_SUBNODE: u16 = 0x0001;
const ENTRY_FLAG_LAST_ENTRY: u16 = 0x0002;

/// Upper bound for a loaded INDEX_ALLOCATION stream (16 MiB).
const MAX_INDEX_ALLOCATION_BYTES: u64 = 16 * 1024 * 1024;

/// Upper bound on external records referenced through one ATTRIBUTE_LIST.
const MAX_ATTRIBUTE_LIST_REFERENCES: usize = 256;

/// Minimum ATTRIBUTE_LIST entry size.
const ATTRIBUTE_LIST_ENTRY_MIN_SIZE: usize = 0x1A;

/// INDEX_ROOT payload header.
#[derive(Debug, Clone, Copy)]
pub struct IndexRootHeader {
    /// Indexed attribute type (FILE_NAME for $I30).
    pub attribute_type: u32,
    /// Collation rule.
    pub collation_rule: u32,
    /// Index block size in bytes.
    pub index_block_size: u32,
    /// Clusters per index block.
    pub clusters_per_block: u8,
}

impl IndexRootHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 16;

    /// Parse from the start of an INDEX_ROOT payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < Self::SIZE {
            return Err(StorageError::Corrupted);
        }
        Ok(IndexRootHeader {
            attribute_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            collation_rule: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            index_block_size: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            clusters_per_block: data[12],
        })
    }
}

/// Node header shared by INDEX_ROOT and INDEX_ALLOCATION blocks.
#[derive(Debug, Clone, Copy)]
pub struct IndexHeader {
    /// Offset of the first entry, relative to this header.
    pub entry_offset: u32,
    /// Total size of the entry region including this header.
    pub entry_size: u32,
    /// Allocated size of the entry region.
    pub allocated_size: u32,
    /// Node flags.
    pub flags: u8,
}

impl IndexHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 16;

    /// Parse a node header.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < Self::SIZE {
            return Err(StorageError::Corrupted);
        }
        Ok(IndexHeader {
            entry_offset: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            entry_size: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            allocated_size: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            flags: data[12],
        })
    }
}

/// Compact diagnostics for an index-traversal failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraverseDiagnostics {
    /// First error code observed (0 = none).
    pub error_code: u32,
    /// Stage: 1 = root node, 2 = allocation block.
    pub stage: u32,
    /// VCN of the failing block (stage 2).
    pub vcn: u32,
    /// Byte offset of the failing entry region.
    pub entry_offset: u32,
    /// Entry region size.
    pub entry_size: u32,
    /// Cursor inside the entry region.
    pub cursor: u32,
    /// Length field of the failing entry.
    pub entry_length: u32,
    /// Flags field of the failing entry.
    pub entry_flags: u32,
    /// Entries whose file reference failed to decode.
    pub invalid_reference_count: u32,
    /// Entries referencing out-of-range record indices.
    pub invalid_index_count: u32,
    /// Entries whose record failed to load.
    pub record_read_failure_count: u32,
    /// Entries dropped by sequence-number or in-use checks.
    pub stale_reference_count: u32,
}

/// Traversal error codes.
const TRAVERSE_ERROR_HEADER_TOO_SMALL: u32 = 0x1001;
const TRAVERSE_ERROR_ENTRY_OFFSET: u32 = 0x1002;
const TRAVERSE_ERROR_ENTRY_SIZE: u32 = 0x1003;
const TRAVERSE_ERROR_ENTRY_LENGTH: u32 = 0x1005;
const TRAVERSE_ERROR_SUBNODE_LENGTH: u32 = 0x1006;
const TRAVERSE_ERROR_MISSING_LAST_ENTRY: u32 = 0x1008;

struct EnumContext<'a> {
    fs: &'a NtfsFilesystem,
    entries: Vec<FolderEntry>,
    index_allocation: Option<Vec<u8>>,
    index_block_size: u32,
    bitmap: Option<Vec<u8>>,
    visited: Vec<u8>,
    diagnostics: TraverseDiagnostics,
}

impl EnumContext<'_> {
    fn set_error(
        &mut self,
        code: u32,
        stage: u32,
        vcn: u32,
        entry_offset: u32,
        entry_size: u32,
        cursor: u32,
        entry_length: u32,
        entry_flags: u32,
    ) {
        if self.diagnostics.error_code == 0 {
            self.diagnostics = TraverseDiagnostics {
                error_code: code,
                stage,
                vcn,
                entry_offset,
                entry_size,
                cursor,
                entry_length,
                entry_flags,
                ..self.diagnostics
            };
        }
    }

    /// Check whether a VCN is live according to the $I30 bitmap.
    ///
    /// Without a bitmap every VCN is considered live.
    fn is_vcn_used(&self, vcn: u32) -> bool {
        match &self.bitmap {
            Some(bitmap) => {
                let byte = (vcn / 8) as usize;
                byte < bitmap.len() && bitmap[byte] & (1 << (vcn % 8)) != 0
            }
            None => true,
        }
    }

    /// Mark a VCN visited; returns false when it was already visited.
    fn mark_visited(&mut self, vcn: u32) -> bool {
        let byte = (vcn / 8) as usize;
        if byte >= self.visited.len() {
            return false;
        }
        let mask = 1u8 << (vcn % 8);
        if self.visited[byte] & mask != 0 {
            return false;
        }
        self.visited[byte] |= mask;
        true
    }
}

/// Check whether an attribute's name is absent or "$I30".
fn is_i30_attribute(view: &AttributeView) -> bool {
    match view.name_units() {
        None => view.name_length == 0,
        Some(name_bytes) => {
            let mut units = [0u16; 4];
            if name_bytes.len() != 8 {
                return false;
            }
            for (i, pair) in name_bytes.chunks_exact(2).enumerate() {
                units[i] = u16::from_le_bytes([pair[0], pair[1]]);
            }
            let i30: [u16; 4] = [b'$' as u16, b'I' as u16, b'3' as u16, b'0' as u16];
            utf16le_eq_ignore_ascii_case(&units, &i30)
        }
    }
}

/// Read an attribute's full payload (resident copy or non-resident stream).
fn read_attribute_value(
    fs: &NtfsFilesystem,
    view: &AttributeView,
) -> Result<Vec<u8>, StorageError> {
    if !view.non_resident {
        return Ok(view.resident_value()?.to_vec());
    }

    if view.length < ATTR_HEADER_NON_RESIDENT_SIZE {
        return Err(StorageError::Corrupted);
    }
    let (_, data_size, _) = view.non_resident_sizes()?;
    read_non_resident_all(fs, view.bytes(), data_size, MAX_INDEX_ALLOCATION_BYTES)
}

/// The three $I30 streams of one folder.
#[derive(Default)]
struct FolderStreams {
    index_root: Option<Vec<u8>>,
    index_allocation: Option<Vec<u8>>,
    bitmap: Option<Vec<u8>>,
}

impl FolderStreams {
    fn complete(&self) -> bool {
        self.index_root.is_some() && self.index_allocation.is_some() && self.bitmap.is_some()
    }

    /// Collect any $I30 streams present in one record buffer.
    fn load_from_record(
        &mut self,
        fs: &NtfsFilesystem,
        record: &[u8],
        info: &FileRecordInfo,
    ) -> Result<(), StorageError> {
        walk_attributes(record, info.attributes_offset, info.used_size, |view| {
            match view.attr_type {
                ATTR_INDEX_ROOT => {
                    if self.index_root.is_none() && !view.non_resident && is_i30_attribute(&view) {
                        self.index_root = Some(read_attribute_value(fs, &view)?);
                    }
                }
                ATTR_INDEX_ALLOCATION => {
                    if self.index_allocation.is_none()
                        && view.non_resident
                        && is_i30_attribute(&view)
                    {
                        self.index_allocation = Some(read_attribute_value(fs, &view)?);
                    }
                }
                ATTR_BITMAP => {
                    if self.bitmap.is_none() && is_i30_attribute(&view) {
                        self.bitmap = Some(read_attribute_value(fs, &view)?);
                    }
                }
                _ => {}
            }
            Ok(())
        })
    }
}

/// Check whether an ATTRIBUTE_LIST entry names the "$I30" stream.
fn is_i30_attribute_list_entry(entry: &[u8]) -> bool {
    if entry.len() < ATTRIBUTE_LIST_ENTRY_MIN_SIZE {
        return false;
    }

    let name_length = entry[6] as usize;
    if name_length == 0 {
        return true;
    }

    let name_offset = entry[7] as usize;
    if name_offset > entry.len() || name_length * 2 > entry.len() - name_offset {
        return false;
    }

    if name_length != 4 {
        return false;
    }
    let mut units = [0u16; 4];
    for (i, pair) in entry[name_offset..name_offset + 8].chunks_exact(2).enumerate() {
        units[i] = u16::from_le_bytes([pair[0], pair[1]]);
    }
    let i30: [u16; 4] = [b'$' as u16, b'I' as u16, b'3' as u16, b'0' as u16];
    utf16le_eq_ignore_ascii_case(&units, &i30)
}

/// Load the complete $I30 streams of a folder, following ATTRIBUTE_LIST
/// indirection into extension records when the base record is not enough.
fn load_folder_streams(
    fs: &NtfsFilesystem,
    folder_index: u32,
) -> Result<FolderStreams, StorageError> {
    let (base_record, base_header) = fs.load_file_record(folder_index)?;

    let mut base_info = FileRecordInfo {
        index: folder_index,
        flags: base_header.flags,
        sequence_number: base_header.sequence_number,
        used_size: base_header.used_size,
        attributes_offset: base_header.attributes_offset,
        ..FileRecordInfo::default()
    };

    if !base_info.is_folder() {
        log::warn!("ntfs: record {} is not a folder", folder_index);
        return Err(StorageError::NotADirectory);
    }

    let mut streams = FolderStreams::default();
    streams.load_from_record(fs, &base_record, &base_info)?;
    if streams.complete() {
        return Ok(streams);
    }

    // Locate an ATTRIBUTE_LIST; without one there is nothing more to find.
    let mut attribute_list: Option<Vec<u8>> = None;
    walk_attributes(
        &base_record,
        base_info.attributes_offset,
        base_info.used_size,
        |view| {
            if view.attr_type == ATTR_ATTRIBUTE_LIST && attribute_list.is_none() {
                attribute_list = Some(read_attribute_value(fs, &view)?);
            }
            Ok(())
        },
    )?;

    let attribute_list = match attribute_list {
        Some(list) => list,
        None => return Ok(streams),
    };
    base_info.has_attribute_list = true;

    // Collect the external records contributing $I30 streams.
    let mut referenced: Vec<u32> = Vec::new();
    let mut offset = 0usize;
    while offset + ATTRIBUTE_LIST_ENTRY_MIN_SIZE <= attribute_list.len() {
        let entry = &attribute_list[offset..];
        let entry_type = u32::from_le_bytes(entry[0..4].try_into().unwrap());
        let entry_length = u16::from_le_bytes(entry[4..6].try_into().unwrap()) as usize;

        if entry_length < ATTRIBUTE_LIST_ENTRY_MIN_SIZE
            || entry_length > attribute_list.len() - offset
        {
            log::warn!(
                "ntfs: malformed ATTRIBUTE_LIST entry in folder {} (length={})",
                folder_index,
                entry_length
            );
            break;
        }

        if matches!(entry_type, ATTR_INDEX_ROOT | ATTR_INDEX_ALLOCATION | ATTR_BITMAP)
            && is_i30_attribute_list_entry(&entry[..entry_length])
        {
            if let Some((record_index, _sequence)) = decode_file_reference(&entry[16..24]) {
                if fs.is_valid_record_index(record_index)
                    && !referenced.contains(&record_index)
                    && referenced.len() < MAX_ATTRIBUTE_LIST_REFERENCES
                {
                    referenced.push(record_index);
                }
            }
        }

        offset += entry_length;
        if streams.complete() {
            break;
        }
    }

    for record_index in referenced {
        if record_index == folder_index {
            continue;
        }
        let (record, header) = match fs.load_file_record(record_index) {
            Ok(loaded) => loaded,
            Err(_) => {
                log::warn!(
                    "ntfs: unable to load extension record {} of folder {}",
                    record_index,
                    folder_index
                );
                continue;
            }
        };

        // Extension records must point back at the base record.
        if header.base_record != 0 {
            match decode_file_reference(&header.base_record.to_le_bytes()) {
                Some((base_index, _)) if base_index == folder_index => {}
                _ => {
                    log::warn!(
                        "ntfs: ignoring foreign extension record {} of folder {}",
                        record_index,
                        folder_index
                    );
                    continue;
                }
            }
        }

        let info = FileRecordInfo {
            index: record_index,
            flags: header.flags,
            sequence_number: header.sequence_number,
            used_size: header.used_size,
            attributes_offset: header.attributes_offset,
            ..FileRecordInfo::default()
        };

        if streams.load_from_record(fs, &record, &info).is_err() {
            log::warn!(
                "ntfs: unable to parse extension record {} of folder {}",
                record_index,
                folder_index
            );
            continue;
        }

        if streams.complete() {
            break;
        }
    }

    Ok(streams)
}

/// Decode a FILE_NAME index key into a folder entry.
fn decode_entry_file_name(key: &[u8]) -> Option<FolderEntry> {
    if (key.len() as u32) < FILE_NAME_MIN_SIZE {
        return None;
    }

    let name_length = key[64] as usize;
    let name_bytes = name_length * 2;
    if name_bytes > key.len() - FILE_NAME_MIN_SIZE as usize {
        return None;
    }

    let name = utf16le_bytes_to_utf8(&key[66..66 + name_bytes]);
    let attributes = u32::from_le_bytes(key[56..60].try_into().unwrap());

    Some(FolderEntry {
        name,
        record_index: 0,
        is_folder: attributes & FILE_NAME_DIRECTORY_FLAG != 0,
        times: FileTimes {
            creation: ntfs_time_to_unix(u64::from_le_bytes(key[8..16].try_into().unwrap())),
            modified: ntfs_time_to_unix(u64::from_le_bytes(key[16..24].try_into().unwrap())),
            record_modified: ntfs_time_to_unix(u64::from_le_bytes(key[24..32].try_into().unwrap())),
            accessed: ntfs_time_to_unix(u64::from_le_bytes(key[32..40].try_into().unwrap())),
        },
    })
}

/// Validate one index entry's file reference and emit the folder entry.
fn emit_entry(context: &mut EnumContext, entry: &[u8], key_length: usize) {
    if entry.len() < 16 || key_length > entry.len() - 16 {
        return;
    }
    if (key_length as u32) < FILE_NAME_MIN_SIZE {
        return;
    }

    let (record_index, reference_sequence) = match decode_file_reference(&entry[0..8]) {
        Some(decoded) => decoded,
        None => {
            context.diagnostics.invalid_reference_count += 1;
            return;
        }
    };

    if !context.fs.is_valid_record_index(record_index) {
        context.diagnostics.invalid_index_count += 1;
        return;
    }

    let record_info = match context.fs.read_file_record(record_index) {
        Ok(info) => info,
        Err(_) => {
            context.diagnostics.record_read_failure_count += 1;
            return;
        }
    };

    // Stale references keep the old sequence number; reject them, as well as
    // records no longer in use.
    if reference_sequence != 0 && record_info.sequence_number != reference_sequence {
        context.diagnostics.stale_reference_count += 1;
        return;
    }
    if !record_info.is_in_use() {
        context.diagnostics.stale_reference_count += 1;
        return;
    }

    let mut folder_entry = match decode_entry_file_name(&entry[16..16 + key_length]) {
        Some(entry) => entry,
        None => return,
    };

    if folder_entry.name == "." || folder_entry.name == ".." {
        return;
    }

    folder_entry.record_index = record_index;

    let duplicate = context
        .entries
        .iter()
        .any(|e| e.record_index == record_index && e.name == folder_entry.name);
    if !duplicate {
        context.entries.push(folder_entry);
    }
}

/// Walk one node's entry array, emitting entries and pushing sub-node VCNs.
fn traverse_node(
    context: &mut EnumContext,
    node: &[u8],
    stage: u32,
    vcn: u32,
    pending: &mut Vec<u32>,
) -> bool {
    let header = match IndexHeader::from_bytes(node) {
        Ok(header) => header,
        Err(_) => {
            context.set_error(TRAVERSE_ERROR_HEADER_TOO_SMALL, stage, vcn, 0, 0, 0, 0, 0);
            return false;
        }
    };

    let region_size = node.len() as u32;
    let entry_offset = header.entry_offset;
    let entry_size = header.entry_size.min(region_size);

    if entry_offset > region_size {
        context.set_error(
            TRAVERSE_ERROR_ENTRY_OFFSET,
            stage,
            vcn,
            entry_offset,
            entry_size,
            0,
            0,
            0,
        );
        return false;
    }
    if entry_size < entry_offset || entry_size - entry_offset < 16 {
        context.set_error(
            TRAVERSE_ERROR_ENTRY_SIZE,
            stage,
            vcn,
            entry_offset,
            entry_size,
            0,
            0,
            0,
        );
        return false;
    }

    let mut cursor = entry_offset;
    loop {
        if cursor + 16 > entry_size {
            context.set_error(
                TRAVERSE_ERROR_MISSING_LAST_ENTRY,
                stage,
                vcn,
                entry_offset,
                entry_size,
                cursor,
                0,
                0,
            );
            return false;
        }

        let entry = &node[cursor as usize..];
        let length = u16::from_le_bytes(entry[8..10].try_into().unwrap()) as u32;
        let key_length = u16::from_le_bytes(entry[10..12].try_into().unwrap()) as usize;
        let flags = u16::from_le_bytes(entry[12..14].try_into().unwrap());

        if length < 16 || length > entry_size - cursor {
            context.set_error(
                TRAVERSE_ERROR_ENTRY_LENGTH,
                stage,
                vcn,
                entry_offset,
                entry_size,
                cursor,
                length,
                flags as u32,
            );
            return false;
        }

        if flags & ENTRY_FLAG_LAST_ENTRY == 0 {
            emit_entry(context, &entry[..length as usize], key_length);
        }

        if flags & ENTRY_FLAG_HAS_SUBNODE != 0 {
            if length < 24 {
                context.set_error(
                    TRAVERSE_ERROR_SUBNODE_LENGTH,
                    stage,
                    vcn,
                    entry_offset,
                    entry_size,
                    cursor,
                    length,
                    flags as u32,
                );
                return false;
            }
            let sub_vcn =
                u64::from_le_bytes(entry[length as usize - 8..length as usize].try_into().unwrap());
            if sub_vcn <= u32::MAX as u64 {
                pending.push(sub_vcn as u32);
            }
        }

        cursor += length;
        if flags & ENTRY_FLAG_LAST_ENTRY != 0 {
            return true;
        }
    }
}

/// Apply fixup to every live INDX block of the loaded allocation stream.
fn prepare_index_blocks(context: &mut EnumContext) -> Result<(), StorageError> {
    let block_size = context.index_block_size;
    let allocation = match context.index_allocation.as_mut() {
        Some(allocation) => allocation,
        None => return Ok(()),
    };
    if block_size == 0 || allocation.is_empty() {
        return Ok(());
    }
    if allocation.len() % block_size as usize != 0 {
        return Err(StorageError::Corrupted);
    }

    let bitmap = context.bitmap.clone();
    let is_used = |vcn: u32| match &bitmap {
        Some(bitmap) => {
            let byte = (vcn / 8) as usize;
            byte < bitmap.len() && bitmap[byte] & (1 << (vcn % 8)) != 0
        }
        None => true,
    };

    let record_count = allocation.len() / block_size as usize;
    for vcn in 0..record_count as u32 {
        if !is_used(vcn) {
            continue;
        }

        let start = vcn as usize * block_size as usize;
        let block = &mut allocation[start..start + block_size as usize];

        let magic = u32::from_le_bytes(block[0..4].try_into().unwrap());
        if magic != INDEX_BLOCK_MAGIC {
            continue;
        }

        let usa_offset = u16::from_le_bytes(block[4..6].try_into().unwrap());
        let usa_size = u16::from_le_bytes(block[6..8].try_into().unwrap());
        super::record::apply_fixup(block, context.fs.bytes_per_sector, usa_offset, usa_size)
            .map_err(|e| {
                log::warn!("ntfs: index block fixup failed vcn={}", vcn);
                e
            })?;
    }

    Ok(())
}

/// Enumerate one NTFS folder by file-record index.
///
/// Returns the folder's entries in traversal order. The traversal succeeds
/// as long as the root node is valid; invalid allocation blocks are skipped
/// with a diagnostic.
pub fn enumerate_folder(
    fs: &NtfsFilesystem,
    folder_index: u32,
) -> Result<Vec<FolderEntry>, StorageError> {
    fs.note_enumeration();

    let streams = load_folder_streams(fs, folder_index)?;

    let index_root = streams.index_root.ok_or_else(|| {
        log::warn!("ntfs: folder {} has no INDEX_ROOT", folder_index);
        StorageError::Corrupted
    })?;

    if index_root.len() < IndexRootHeader::SIZE + IndexHeader::SIZE {
        log::warn!(
            "ntfs: folder {} INDEX_ROOT too small ({} bytes)",
            folder_index,
            index_root.len()
        );
        return Err(StorageError::Corrupted);
    }

    let root_header = IndexRootHeader::from_bytes(&index_root)?;
    if root_header.index_block_size == 0 || !root_header.index_block_size.is_power_of_two() {
        log::warn!(
            "ntfs: folder {} has invalid index block size {}",
            folder_index,
            root_header.index_block_size
        );
        return Err(StorageError::Corrupted);
    }

    let max_vcn_records = match &streams.index_allocation {
        Some(allocation) if !allocation.is_empty() => {
            if allocation.len() % root_header.index_block_size as usize != 0 {
                log::warn!(
                    "ntfs: folder {} INDEX_ALLOCATION misaligned (size={} block={})",
                    folder_index,
                    allocation.len(),
                    root_header.index_block_size
                );
                return Err(StorageError::Corrupted);
            }
            (allocation.len() / root_header.index_block_size as usize) as u32
        }
        _ => 0,
    };

    let mut context = EnumContext {
        fs,
        entries: Vec::new(),
        index_allocation: streams.index_allocation,
        index_block_size: root_header.index_block_size,
        bitmap: streams.bitmap,
        visited: vec![0u8; (max_vcn_records as usize + 7) / 8],
        diagnostics: TraverseDiagnostics::default(),
    };

    prepare_index_blocks(&mut context)?;

    let mut pending: Vec<u32> = Vec::with_capacity(max_vcn_records as usize);

    // Stage 1: the root node. A bad root fails the whole enumeration.
    let root_node = index_root[IndexRootHeader::SIZE..].to_vec();
    let root_ok = traverse_node(&mut context, &root_node, 1, 0, &mut pending);
    if !root_ok {
        let d = context.diagnostics;
        log::warn!(
            "ntfs: index traversal failed folder={} error={:#x} stage={} vcn={} offset={} size={} cursor={} len={} flags={:#x}",
            folder_index, d.error_code, d.stage, d.vcn, d.entry_offset, d.entry_size, d.cursor,
            d.entry_length, d.entry_flags
        );
        return Err(StorageError::Corrupted);
    }

    // Stage 2: allocation blocks, bounded by the VCN count and a visited map.
    let mut had_node_failure = false;
    while let Some(vcn) = pending.pop() {
        if vcn >= max_vcn_records {
            continue;
        }
        if !context.is_vcn_used(vcn) {
            continue;
        }
        if !context.mark_visited(vcn) {
            continue;
        }

        let block_size = context.index_block_size as usize;
        let block = {
            let allocation = context.index_allocation.as_ref().unwrap();
            let start = vcn as usize * block_size;
            allocation[start..start + block_size].to_vec()
        };

        let magic = u32::from_le_bytes(block[0..4].try_into().unwrap());
        if magic != INDEX_BLOCK_MAGIC {
            continue;
        }

        // The node header of an INDX block sits at offset 24.
        if block.len() <= 24 {
            continue;
        }
        if !traverse_node(&mut context, &block[24..], 2, vcn, &mut pending) {
            had_node_failure = true;
            context.diagnostics.error_code = 0;
        }
    }

    if had_node_failure {
        log::warn!(
            "ntfs: ignored one or more invalid index blocks in folder {}",
            folder_index
        );
    }

    Ok(context.entries)
}
