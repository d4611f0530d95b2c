//! NTFS runlist decoding and non-resident stream reads.
//!
//! Non-resident attributes map their virtual clusters to logical clusters
//! through a compressed runlist: each run header byte packs the byte widths
//! of the run length and of the signed LCN delta. An offset width of zero
//! marks a sparse run with no backing clusters.

use alloc::vec;
use alloc::vec::Vec;

use crate::StorageError;

use super::record::ATTR_HEADER_NON_RESIDENT_SIZE;
use super::NtfsFilesystem;

/// One decoded runlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunEntry {
    /// Run length in clusters.
    pub cluster_count: u64,
    /// Signed delta from the previous run's LCN. Zero for sparse runs.
    pub lcn_delta: i64,
    /// Run has no backing clusters; reads yield zeros.
    pub is_sparse: bool,
}

/// Load an unsigned little-endian integer of 1..=8 bytes.
fn load_unsigned(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as u64) << (i * 8);
    }
    Some(value)
}

/// Load a signed little-endian integer of 1..=8 bytes, sign extending.
fn load_signed(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as u64) << (i * 8);
    }
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        for i in bytes.len()..8 {
            value |= 0xFF << (i * 8);
        }
    }
    Some(value as i64)
}

/// Decode a complete runlist byte stream.
///
/// Stops at the terminating zero header. Returns the decoded entries; the
/// caller accumulates LCN deltas while walking them.
pub fn decode_runlist(data: &[u8]) -> Result<Vec<RunEntry>, StorageError> {
    let mut runs = Vec::new();
    let mut cursor = 0usize;

    while cursor < data.len() {
        let header = data[cursor];
        cursor += 1;
        if header == 0 {
            break;
        }

        let length_size = (header & 0x0F) as usize;
        let offset_size = ((header >> 4) & 0x0F) as usize;
        if length_size == 0 {
            return Err(StorageError::Corrupted);
        }
        if cursor + length_size + offset_size > data.len() {
            return Err(StorageError::Corrupted);
        }

        let cluster_count =
            load_unsigned(&data[cursor..cursor + length_size]).ok_or(StorageError::Corrupted)?;
        cursor += length_size;

        let is_sparse = offset_size == 0;
        let lcn_delta = if is_sparse {
            0
        } else {
            load_signed(&data[cursor..cursor + offset_size]).ok_or(StorageError::Corrupted)?
        };
        cursor += offset_size;

        if cluster_count == 0 {
            continue;
        }

        runs.push(RunEntry {
            cluster_count,
            lcn_delta,
            is_sparse,
        });
    }

    Ok(runs)
}

/// Extract the runlist bytes from a non-resident attribute.
fn runlist_bytes(attribute: &[u8]) -> Result<&[u8], StorageError> {
    if (attribute.len() as u32) < ATTR_HEADER_NON_RESIDENT_SIZE {
        return Err(StorageError::Corrupted);
    }
    let run_list_offset = u16::from_le_bytes(attribute[32..34].try_into().unwrap()) as usize;
    if run_list_offset >= attribute.len() {
        return Err(StorageError::Corrupted);
    }
    Ok(&attribute[run_list_offset..])
}

/// Read `[data_offset, data_offset + buffer.len())` from a non-resident
/// attribute's mapped stream.
///
/// Sparse runs fill the destination with zeros. The read is clipped to
/// `data_size`; the clipped byte count is returned. Reads entirely past the
/// logical end transfer zero bytes.
pub fn read_non_resident_range(
    fs: &NtfsFilesystem,
    attribute: &[u8],
    data_offset: u64,
    buffer: &mut [u8],
    data_size: u64,
) -> Result<usize, StorageError> {
    if data_offset >= data_size {
        return Ok(0);
    }

    let remaining_data = data_size - data_offset;
    let target_bytes = (buffer.len() as u64).min(remaining_data) as usize;
    if target_bytes == 0 {
        return Ok(0);
    }

    let runs = decode_runlist(runlist_bytes(attribute)?)?;

    let bytes_per_cluster = fs.bytes_per_cluster as u64;
    let bytes_per_sector = fs.bytes_per_sector as u64;

    let mut remaining_offset = data_offset;
    let mut bytes_written = 0usize;
    let mut current_lcn: i64 = 0;
    let mut sector_buffer = vec![0u8; fs.bytes_per_sector as usize];

    for run in &runs {
        if bytes_written >= target_bytes {
            break;
        }

        if !run.is_sparse {
            current_lcn += run.lcn_delta;
        }

        let run_bytes = run
            .cluster_count
            .checked_mul(bytes_per_cluster)
            .ok_or(StorageError::Corrupted)?;

        if remaining_offset >= run_bytes {
            remaining_offset -= run_bytes;
            continue;
        }

        let skip_in_run = remaining_offset;
        remaining_offset = 0;

        let copy_bytes = ((target_bytes - bytes_written) as u64).min(run_bytes - skip_in_run) as usize;
        if copy_bytes == 0 {
            continue;
        }

        if run.is_sparse {
            buffer[bytes_written..bytes_written + copy_bytes].fill(0);
            bytes_written += copy_bytes;
            continue;
        }

        if current_lcn < 0 {
            log::warn!("ntfs: runlist produced negative LCN");
            return Err(StorageError::Corrupted);
        }

        let run_start_sector = (current_lcn as u64)
            .checked_mul(fs.sectors_per_cluster as u64)
            .ok_or(StorageError::Corrupted)?;
        let mut sector = fs
            .partition_start
            .checked_add(run_start_sector)
            .and_then(|s| s.checked_add(skip_in_run / bytes_per_sector))
            .ok_or(StorageError::Corrupted)?;
        let mut offset_in_sector = (skip_in_run % bytes_per_sector) as usize;

        let mut remaining_copy = copy_bytes;
        while remaining_copy > 0 {
            let chunk = (sector_buffer.len() - offset_in_sector).min(remaining_copy);
            fs.read_sectors(sector, 1, &mut sector_buffer)?;
            buffer[bytes_written..bytes_written + chunk]
                .copy_from_slice(&sector_buffer[offset_in_sector..offset_in_sector + chunk]);

            bytes_written += chunk;
            remaining_copy -= chunk;
            sector += 1;
            offset_in_sector = 0;
        }
    }

    Ok(bytes_written)
}

/// Read an entire non-resident stream into an owned buffer.
///
/// `limit` bounds the allocation; streams larger than the limit are rejected.
pub fn read_non_resident_all(
    fs: &NtfsFilesystem,
    attribute: &[u8],
    data_size: u64,
    limit: u64,
) -> Result<Vec<u8>, StorageError> {
    if data_size > limit {
        log::warn!("ntfs: attribute stream too large ({} bytes)", data_size);
        return Err(StorageError::Corrupted);
    }

    let mut value = vec![0u8; data_size as usize];
    let bytes_read = read_non_resident_range(fs, attribute, 0, &mut value, data_size)?;
    // Anything the runlist did not cover stays zero.
    let _ = bytes_read;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sparse_runlist() {
        // run 0: 5 clusters at LCN 1; run 1: 3 clusters sparse;
        // run 2: 2 clusters at delta +3 (LCN 4).
        let data = [0x01, 0x05, 0x11, 0x03, 0x01, 0x21, 0x02, 0x03, 0x00, 0x00];
        let runs = decode_runlist(&data).unwrap();

        assert_eq!(runs.len(), 3);
        assert_eq!(
            runs[0],
            RunEntry {
                cluster_count: 5,
                lcn_delta: 1,
                is_sparse: false
            }
        );
        assert_eq!(
            runs[1],
            RunEntry {
                cluster_count: 3,
                lcn_delta: 0,
                is_sparse: true
            }
        );
        assert_eq!(
            runs[2],
            RunEntry {
                cluster_count: 2,
                lcn_delta: 3,
                is_sparse: false
            }
        );

        // Accumulated LCNs: 1, (sparse), 4.
        let mut lcn = 0i64;
        lcn += runs[0].lcn_delta;
        assert_eq!(lcn, 1);
        lcn += runs[2].lcn_delta;
        assert_eq!(lcn, 4);
    }

    #[test]
    fn decodes_negative_deltas() {
        // 8 clusters at LCN 100, then 4 clusters at delta -32 (LCN 68).
        let data = [0x11, 0x08, 100, 0x11, 0x04, 0xE0, 0x00];
        let runs = decode_runlist(&data).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].lcn_delta, 100);
        assert_eq!(runs[1].lcn_delta, -32);
    }

    #[test]
    fn total_clusters_match_allocated_size() {
        let data = [0x01, 0x05, 0x11, 0x03, 0x01, 0x21, 0x02, 0x03, 0x00];
        let runs = decode_runlist(&data).unwrap();
        let total: u64 = runs.iter().map(|r| r.cluster_count).sum();
        // 5 + 3 + 2 clusters; with 512-byte clusters that is 5120 bytes.
        assert_eq!(total * 512, 5120);
    }

    #[test]
    fn rejects_zero_length_size() {
        // Header 0x10: offset size 1, length size 0.
        let data = [0x10, 0x05, 0x00];
        assert_eq!(decode_runlist(&data), Err(StorageError::Corrupted));
    }

    #[test]
    fn rejects_truncated_runs() {
        let data = [0x21, 0x05];
        assert_eq!(decode_runlist(&data), Err(StorageError::Corrupted));
    }

    #[test]
    fn empty_and_terminated_lists_decode() {
        assert!(decode_runlist(&[0x00]).unwrap().is_empty());
        assert!(decode_runlist(&[]).unwrap().is_empty());
    }
}
