//! ACPI table loader.
//!
//! Discovers the RSDP, maps the RSDT/XSDT, and parses the MADT (APIC
//! topology and interrupt source overrides) and FADT (+ DSDT `_S5` sleep
//! package). Tables are copied out of physical memory once at boot and kept
//! for the lifetime of the kernel; nothing here is ever unmapped.

use alloc::vec;
use alloc::vec::Vec;

use spin::RwLock;

use crate::memory;

/// Maximum I/O APICs tracked.
pub const MAX_IO_APICS: usize = 8;
/// Maximum local APICs tracked.
pub const MAX_LOCAL_APICS: usize = 32;
/// Maximum interrupt source overrides tracked.
pub const MAX_INTERRUPT_OVERRIDES: usize = 24;

/// ACPI table header length.
pub const TABLE_HEADER_LEN: usize = 36;

/// MADT entry types.
const MADT_TYPE_LOCAL_APIC: u8 = 0;
const MADT_TYPE_IO_APIC: u8 = 1;
const MADT_TYPE_INTERRUPT_OVERRIDE: u8 = 2;
const MADT_TYPE_LOCAL_APIC_NMI: u8 = 4;

/// Platform configuration distilled from the ACPI tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcpiConfig {
    /// Tables were found and parsed.
    pub valid: bool,
    /// At least one local APIC was reported.
    pub use_local_apic: bool,
    /// At least one I/O APIC was reported.
    pub use_io_apic: bool,
    /// Local APIC physical base from the MADT.
    pub local_apic_address: u64,
    /// Number of local APIC entries.
    pub local_apic_count: u32,
    /// Number of I/O APIC entries.
    pub io_apic_count: u32,
    /// Number of interrupt source overrides.
    pub interrupt_override_count: u32,
    /// `_S5` sleep package was found.
    pub s5_available: bool,
    /// SLP_TYPa for S5. Poweroff falls back to 7 when unavailable.
    pub slp_typ_s5a: u8,
    /// SLP_TYPb for S5.
    pub slp_typ_s5b: u8,
}

/// One I/O APIC from the MADT.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoApicInfo {
    /// I/O APIC ID.
    pub id: u8,
    /// Physical register base.
    pub address: u64,
    /// First global system interrupt handled by this controller.
    pub gsi_base: u32,
    /// Highest redirection entry index; filled lazily from the VERSION
    /// register, 0 until then.
    pub max_redirection_entry: u8,
}

/// One local APIC (processor) from the MADT.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalApicInfo {
    /// ACPI processor ID.
    pub processor_id: u8,
    /// APIC ID.
    pub apic_id: u8,
    /// Entry flags (bit 0: enabled).
    pub flags: u32,
}

/// One interrupt source override from the MADT.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptOverride {
    /// Source bus (0 = ISA).
    pub bus: u8,
    /// Source IRQ.
    pub source: u8,
    /// Target global system interrupt.
    pub global_system_interrupt: u32,
    /// MPS INTI flags (polarity bits 0-1, trigger bits 2-3).
    pub flags: u16,
}

/// Everything parsed at init.
#[derive(Default)]
struct AcpiData {
    config: AcpiConfig,
    io_apics: [IoApicInfo; MAX_IO_APICS],
    local_apics: [LocalApicInfo; MAX_LOCAL_APICS],
    overrides: [InterruptOverride; MAX_INTERRUPT_OVERRIDES],
    /// Owned copies of the root tables for `find_table`.
    rsdt: Option<Vec<u8>>,
    xsdt: Option<Vec<u8>>,
    /// Entries silently dropped because a bounded array filled up.
    dropped_entries: u32,
}

impl AcpiData {
    const fn new() -> Self {
        AcpiData {
            config: AcpiConfig {
                valid: false,
                use_local_apic: false,
                use_io_apic: false,
                local_apic_address: 0,
                local_apic_count: 0,
                io_apic_count: 0,
                interrupt_override_count: 0,
                s5_available: false,
                slp_typ_s5a: 0,
                slp_typ_s5b: 0,
            },
            io_apics: [IoApicInfo {
                id: 0,
                address: 0,
                gsi_base: 0,
                max_redirection_entry: 0,
            }; MAX_IO_APICS],
            local_apics: [LocalApicInfo {
                processor_id: 0,
                apic_id: 0,
                flags: 0,
            }; MAX_LOCAL_APICS],
            overrides: [InterruptOverride {
                bus: 0,
                source: 0,
                global_system_interrupt: 0,
                flags: 0,
            }; MAX_INTERRUPT_OVERRIDES],
            rsdt: None,
            xsdt: None,
            dropped_entries: 0,
        }
    }
}

static ACPI: RwLock<AcpiData> = RwLock::new(AcpiData::new());

/// Sum all bytes of a region; valid ACPI structures sum to zero.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Parsed RSDP fields.
#[derive(Debug, Clone, Copy)]
pub struct Rsdp {
    /// Structure revision (0 = ACPI 1.0, 2+ = ACPI 2.0).
    pub revision: u8,
    /// Physical address of the RSDT.
    pub rsdt_address: u32,
    /// Physical address of the XSDT (revision 2+).
    pub xsdt_address: u64,
}

/// Validate and decode an RSDP candidate.
///
/// Revision 0 validates the 20-byte checksum; revision 2+ additionally
/// requires the extended checksum over the declared length.
pub fn parse_rsdp(data: &[u8]) -> Option<Rsdp> {
    if data.len() < 20 || &data[0..8] != b"RSD PTR " {
        return None;
    }
    if checksum(&data[0..20]) != 0 {
        return None;
    }

    let revision = data[15];
    let rsdt_address = u32::from_le_bytes(data[16..20].try_into().unwrap());

    if revision < 2 {
        return Some(Rsdp {
            revision,
            rsdt_address,
            xsdt_address: 0,
        });
    }

    if data.len() < 36 {
        return None;
    }
    let length = u32::from_le_bytes(data[20..24].try_into().unwrap()) as usize;
    if length < 36 || length > data.len() || checksum(&data[..length]) != 0 {
        return None;
    }

    Some(Rsdp {
        revision,
        rsdt_address,
        xsdt_address: u64::from_le_bytes(data[24..32].try_into().unwrap()),
    })
}

/// Scan a physical range on 16-byte boundaries for a valid RSDP.
fn search_rsdp_in_range(start: u64, length: u64) -> Option<Rsdp> {
    let mut candidate = [0u8; 36];
    let mut address = start;

    while address + 36 <= start + length {
        if memory::read_physical(address, &mut candidate) {
            if let Some(rsdp) = parse_rsdp(&candidate) {
                return Some(rsdp);
            }
        }
        address += 16;
    }

    None
}

/// Find the RSDP.
///
/// Prefers a bootloader-supplied physical address; otherwise scans the first
/// KiB of the EBDA, then the BIOS ROM window 0xE0000-0xFFFFF.
fn find_rsdp(bootloader_rsdp: Option<u64>) -> Option<Rsdp> {
    if let Some(phys) = bootloader_rsdp {
        let mut candidate = [0u8; 36];
        if memory::read_physical(phys, &mut candidate) {
            if let Some(rsdp) = parse_rsdp(&candidate) {
                return Some(rsdp);
            }
        }
        log::warn!("acpi: bootloader RSDP at {:#x} failed validation", phys);
    }

    // The EBDA segment pointer lives at physical 0x40E.
    let mut segment = [0u8; 2];
    if memory::read_physical(0x40E, &mut segment) {
        let ebda = (u16::from_le_bytes(segment) as u64) << 4;
        if ebda != 0 && ebda < 0x100000 {
            if let Some(rsdp) = search_rsdp_in_range(ebda, 1024) {
                return Some(rsdp);
            }
        }
    }

    search_rsdp_in_range(0xE0000, 0x20000)
}

/// Copy a whole ACPI table out of physical memory, validating its checksum.
fn copy_table(phys: u64) -> Option<Vec<u8>> {
    let mut header = [0u8; TABLE_HEADER_LEN];
    if !memory::read_physical(phys, &mut header) {
        return None;
    }

    let length = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if length < TABLE_HEADER_LEN {
        return None;
    }

    let mut table = vec![0u8; length];
    if !memory::read_physical(phys, &mut table) {
        return None;
    }

    if checksum(&table) != 0 {
        return None;
    }

    Some(table)
}

/// Iterate the table pointers of an RSDT (u32 entries) or XSDT (u64 entries).
fn table_entries(table: &[u8], entry_width: usize) -> impl Iterator<Item = u64> + '_ {
    table[TABLE_HEADER_LEN..]
        .chunks_exact(entry_width)
        .map(move |chunk| {
            if entry_width == 4 {
                u32::from_le_bytes(chunk.try_into().unwrap()) as u64
            } else {
                u64::from_le_bytes(chunk.try_into().unwrap())
            }
        })
}

/// Find a table by signature, preferring the XSDT.
///
/// Each candidate is mapped and checksum-validated; non-matching or invalid
/// candidates are skipped. Returns an owned copy of the table.
pub fn find_table(signature: &[u8; 4]) -> Option<Vec<u8>> {
    let acpi = ACPI.read();

    let roots: [(&Option<Vec<u8>>, usize); 2] = [(&acpi.xsdt, 8), (&acpi.rsdt, 4)];
    for (root, entry_width) in roots {
        let root = match root {
            Some(root) => root,
            None => continue,
        };

        for entry in table_entries(root, entry_width) {
            if entry == 0 {
                continue;
            }

            let mut header = [0u8; TABLE_HEADER_LEN];
            if !memory::read_physical(entry, &mut header) {
                continue;
            }
            if &header[0..4] != signature {
                continue;
            }

            if let Some(table) = copy_table(entry) {
                return Some(table);
            }
        }
    }

    None
}

/// Result of parsing a MADT byte image.
#[derive(Debug, Default)]
pub struct MadtInfo {
    /// Local APIC physical base.
    pub local_apic_address: u64,
    /// Local APIC entries.
    pub local_apics: Vec<LocalApicInfo>,
    /// I/O APIC entries.
    pub io_apics: Vec<IoApicInfo>,
    /// Interrupt source overrides.
    pub overrides: Vec<InterruptOverride>,
    /// Entries beyond the bounded-array limits.
    pub dropped_entries: u32,
}

/// Parse a MADT image, walking its variable-length entries.
///
/// Arrays are bounded; overflow is counted, not stored. Unknown entry types
/// (and LOCAL_APIC_NMI, which is informational) are skipped by length.
pub fn parse_madt(table: &[u8]) -> Option<MadtInfo> {
    if table.len() < TABLE_HEADER_LEN + 8 || &table[0..4] != b"APIC" {
        return None;
    }

    let mut info = MadtInfo {
        local_apic_address: u32::from_le_bytes(
            table[TABLE_HEADER_LEN..TABLE_HEADER_LEN + 4].try_into().unwrap(),
        ) as u64,
        ..MadtInfo::default()
    };

    let mut offset = TABLE_HEADER_LEN + 8;
    while offset + 2 <= table.len() {
        let entry_type = table[offset];
        let entry_length = table[offset + 1] as usize;
        if entry_length < 2 || offset + entry_length > table.len() {
            break;
        }
        let entry = &table[offset..offset + entry_length];

        match entry_type {
            MADT_TYPE_LOCAL_APIC if entry_length >= 8 => {
                if info.local_apics.len() < MAX_LOCAL_APICS {
                    info.local_apics.push(LocalApicInfo {
                        processor_id: entry[2],
                        apic_id: entry[3],
                        flags: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
                    });
                } else {
                    info.dropped_entries += 1;
                }
            }
            MADT_TYPE_IO_APIC if entry_length >= 12 => {
                if info.io_apics.len() < MAX_IO_APICS {
                    info.io_apics.push(IoApicInfo {
                        id: entry[2],
                        address: u32::from_le_bytes(entry[4..8].try_into().unwrap()) as u64,
                        gsi_base: u32::from_le_bytes(entry[8..12].try_into().unwrap()),
                        max_redirection_entry: 0,
                    });
                } else {
                    info.dropped_entries += 1;
                }
            }
            MADT_TYPE_INTERRUPT_OVERRIDE if entry_length >= 10 => {
                if info.overrides.len() < MAX_INTERRUPT_OVERRIDES {
                    info.overrides.push(InterruptOverride {
                        bus: entry[2],
                        source: entry[3],
                        global_system_interrupt: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
                        flags: u16::from_le_bytes(entry[8..10].try_into().unwrap()),
                    });
                } else {
                    info.dropped_entries += 1;
                }
            }
            MADT_TYPE_LOCAL_APIC_NMI => {
                // Informational only.
            }
            _ => {}
        }

        offset += entry_length;
    }

    Some(info)
}

/// Decode an AML package length at the start of `bytes`.
///
/// Returns `(length, prefix_byte_count)`.
pub fn decode_aml_package_length(bytes: &[u8]) -> Option<(u32, usize)> {
    let first = *bytes.first()?;
    let byte_count = ((first >> 6) & 0x03) as usize;

    if byte_count == 0 {
        return Some(((first & 0x3F) as u32, 1));
    }

    if byte_count >= 4 || bytes.len() <= byte_count {
        return None;
    }

    let mut length = (first & 0x0F) as u32;
    for i in 0..byte_count {
        length |= (bytes[1 + i] as u32) << (8 * i + 4);
    }

    Some((length, 1 + byte_count))
}

/// Scan DSDT AML for the `_S5` package and decode SLP_TYPa/SLP_TYPb.
///
/// Looks for `NameOp '_S5_'` followed by a PackageOp; the first two package
/// elements are read as ByteConst/WordConst values.
pub fn find_s5_package(aml: &[u8]) -> Option<(u8, u8)> {
    if aml.len() < 5 {
        return None;
    }

    for i in 0..aml.len() - 4 {
        // NameOp ('_S5_') pattern: 0x08 '_' 'S' '5' '_'
        if aml[i] != 0x08 || &aml[i + 1..i + 5] != b"_S5_" {
            continue;
        }

        let mut cursor = i + 5;
        if cursor >= aml.len() || aml[cursor] != 0x12 {
            continue;
        }
        cursor += 1;

        let (_package_length, prefix) = decode_aml_package_length(&aml[cursor..])?;
        cursor += prefix;
        if cursor >= aml.len() {
            return None;
        }

        let element_count = aml[cursor];
        cursor += 1;
        if element_count < 2 {
            continue;
        }

        let mut values = [0u8; 2];
        for value in values.iter_mut() {
            if cursor >= aml.len() {
                return None;
            }
            match aml[cursor] {
                0x0A => {
                    // ByteConst
                    *value = *aml.get(cursor + 1)?;
                    cursor += 2;
                }
                0x0B => {
                    // WordConst, low byte carries the sleep type
                    *value = *aml.get(cursor + 1)?;
                    cursor += 3;
                }
                other => {
                    *value = other;
                    cursor += 1;
                }
            }
        }

        return Some((values[0], values[1]));
    }

    None
}

/// Initialize the ACPI subsystem.
///
/// Idempotent: a second call on a valid configuration is a no-op. Returns
/// `false` when no RSDP or no root table can be found; downstream consumers
/// treat that as "no ACPI" and stay on legacy paths.
pub fn initialize(bootloader_rsdp: Option<u64>) -> bool {
    {
        let acpi = ACPI.read();
        if acpi.config.valid {
            return true;
        }
    }

    let rsdp = match find_rsdp(bootloader_rsdp) {
        Some(rsdp) => rsdp,
        None => {
            log::warn!("acpi: RSDP not found");
            return false;
        }
    };

    let mut data = AcpiData::new();

    if rsdp.rsdt_address != 0 {
        match copy_table(rsdp.rsdt_address as u64) {
            Some(table) if &table[0..4] == b"RSDT" => data.rsdt = Some(table),
            _ => log::warn!("acpi: RSDT invalid or missing"),
        }
    }

    if rsdp.revision >= 2 && rsdp.xsdt_address != 0 {
        match copy_table(rsdp.xsdt_address) {
            Some(table) if &table[0..4] == b"XSDT" => data.xsdt = Some(table),
            _ => log::warn!("acpi: XSDT invalid or missing"),
        }
    }

    if data.rsdt.is_none() && data.xsdt.is_none() {
        log::warn!("acpi: no usable root table");
        return false;
    }

    // Publish the root tables so find_table works during the MADT/FADT pass.
    {
        let mut acpi = ACPI.write();
        acpi.rsdt = data.rsdt.take();
        acpi.xsdt = data.xsdt.take();
    }

    let madt = match find_table(b"APIC").and_then(|table| parse_madt(&table)) {
        Some(madt) => madt,
        None => {
            log::warn!("acpi: MADT not found");
            return false;
        }
    };

    let mut acpi = ACPI.write();

    acpi.config.local_apic_address = madt.local_apic_address;
    acpi.config.local_apic_count = madt.local_apics.len() as u32;
    acpi.config.io_apic_count = madt.io_apics.len() as u32;
    acpi.config.interrupt_override_count = madt.overrides.len() as u32;
    acpi.config.use_local_apic = !madt.local_apics.is_empty();
    acpi.config.use_io_apic = !madt.io_apics.is_empty();
    acpi.dropped_entries = madt.dropped_entries;

    for (slot, info) in acpi.local_apics.iter_mut().zip(madt.local_apics.iter()) {
        *slot = *info;
    }
    for (slot, info) in acpi.io_apics.iter_mut().zip(madt.io_apics.iter()) {
        *slot = *info;
    }
    for (slot, info) in acpi.overrides.iter_mut().zip(madt.overrides.iter()) {
        *slot = *info;
    }

    drop(acpi);

    // FADT and the DSDT _S5 package: optional, best effort.
    if let Some(fadt) = find_table(b"FACP") {
        if fadt.len() >= 44 {
            let dsdt_address = u32::from_le_bytes(fadt[40..44].try_into().unwrap()) as u64;
            if dsdt_address != 0 {
                if let Some(dsdt) = copy_table(dsdt_address) {
                    if let Some((a, b)) = find_s5_package(&dsdt) {
                        let mut acpi = ACPI.write();
                        acpi.config.s5_available = true;
                        acpi.config.slp_typ_s5a = a;
                        acpi.config.slp_typ_s5b = b;
                    }
                }
            }
        }
    }

    let mut acpi = ACPI.write();
    acpi.config.valid = true;

    log::debug!(
        "acpi: {} local APIC(s), {} I/O APIC(s), {} override(s), S5 {}",
        acpi.config.local_apic_count,
        acpi.config.io_apic_count,
        acpi.config.interrupt_override_count,
        if acpi.config.s5_available { "available" } else { "absent" },
    );

    true
}

/// Get a copy of the ACPI configuration.
pub fn config() -> AcpiConfig {
    ACPI.read().config
}

/// Get one I/O APIC entry.
pub fn io_apic_info(index: usize) -> Option<IoApicInfo> {
    let acpi = ACPI.read();
    if index < acpi.config.io_apic_count as usize {
        Some(acpi.io_apics[index])
    } else {
        None
    }
}

/// Get one local APIC entry.
pub fn local_apic_info(index: usize) -> Option<LocalApicInfo> {
    let acpi = ACPI.read();
    if index < acpi.config.local_apic_count as usize {
        Some(acpi.local_apics[index])
    } else {
        None
    }
}

/// Get one interrupt source override.
pub fn interrupt_override(index: usize) -> Option<InterruptOverride> {
    let acpi = ACPI.read();
    if index < acpi.config.interrupt_override_count as usize {
        Some(acpi.overrides[index])
    } else {
        None
    }
}

/// Map an IRQ through the override table.
///
/// Only ISA (bus 0) overrides for sources below 16 apply; everything else
/// passes through identity.
pub fn map_interrupt(irq: u8) -> u32 {
    let acpi = ACPI.read();
    for i in 0..acpi.config.interrupt_override_count as usize {
        let entry = &acpi.overrides[i];
        if entry.bus == 0 && entry.source == irq && entry.source < 16 {
            return entry.global_system_interrupt;
        }
    }
    irq as u32
}

/// The S5 sleep type values, with the fallback of 7/7 when `_S5` is absent.
pub fn s5_sleep_type() -> (u8, u8) {
    let config = ACPI.read().config;
    if config.s5_available {
        (config.slp_typ_s5a, config.slp_typ_s5b)
    } else {
        (7, 7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rsdp_v0() -> [u8; 36] {
        let mut rsdp = [0u8; 36];
        rsdp[0..8].copy_from_slice(b"RSD PTR ");
        rsdp[15] = 0;
        rsdp[16..20].copy_from_slice(&0x7FE0_0000u32.to_le_bytes());
        let sum = checksum(&rsdp[0..20]);
        rsdp[8] = rsdp[8].wrapping_sub(sum);
        rsdp
    }

    #[test]
    fn parses_v0_rsdp() {
        let rsdp = make_rsdp_v0();
        let parsed = parse_rsdp(&rsdp).unwrap();
        assert_eq!(parsed.revision, 0);
        assert_eq!(parsed.rsdt_address, 0x7FE0_0000);
        assert_eq!(parsed.xsdt_address, 0);
    }

    #[test]
    fn rejects_bad_rsdp_checksum() {
        let mut rsdp = make_rsdp_v0();
        rsdp[16] ^= 0xFF;
        assert!(parse_rsdp(&rsdp).is_none());
    }

    #[test]
    fn parses_v2_rsdp_with_extended_checksum() {
        let mut rsdp = [0u8; 36];
        rsdp[0..8].copy_from_slice(b"RSD PTR ");
        rsdp[15] = 2;
        rsdp[16..20].copy_from_slice(&0x7FE0_0000u32.to_le_bytes());
        rsdp[20..24].copy_from_slice(&36u32.to_le_bytes());
        rsdp[24..32].copy_from_slice(&0x1_0000_0000u64.to_le_bytes());
        let sum = checksum(&rsdp[0..20]);
        rsdp[8] = rsdp[8].wrapping_sub(sum);
        let sum = checksum(&rsdp);
        rsdp[32] = rsdp[32].wrapping_sub(sum);

        let parsed = parse_rsdp(&rsdp).unwrap();
        assert_eq!(parsed.revision, 2);
        assert_eq!(parsed.xsdt_address, 0x1_0000_0000);

        // Break only the extended checksum; v2 must then fail.
        let mut broken = rsdp;
        broken[33] ^= 0x01;
        assert!(parse_rsdp(&broken).is_none());
    }

    fn make_madt() -> Vec<u8> {
        let mut table = vec![0u8; TABLE_HEADER_LEN + 8];
        table[0..4].copy_from_slice(b"APIC");
        table[TABLE_HEADER_LEN..TABLE_HEADER_LEN + 4]
            .copy_from_slice(&0xFEE0_0000u32.to_le_bytes());

        // Local APIC: processor 0, apic 0, enabled.
        table.extend_from_slice(&[0, 8, 0, 0, 1, 0, 0, 0]);
        // I/O APIC: id 1 at 0xFEC00000, GSI base 0.
        let mut io = vec![1u8, 12, 1, 0];
        io.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        io.extend_from_slice(&0u32.to_le_bytes());
        table.extend_from_slice(&io);
        // Override: bus 0, IRQ 0 -> GSI 2, flags 0.
        let mut ov = vec![2u8, 10, 0, 0];
        ov.extend_from_slice(&2u32.to_le_bytes());
        ov.extend_from_slice(&0u16.to_le_bytes());
        table.extend_from_slice(&ov);
        // Local APIC NMI (type 4): informational, must be skipped cleanly.
        table.extend_from_slice(&[4, 6, 0, 5, 1, 0]);

        let length = table.len() as u32;
        table[4..8].copy_from_slice(&length.to_le_bytes());
        table
    }

    #[test]
    fn parses_madt_entries() {
        let info = parse_madt(&make_madt()).unwrap();
        assert_eq!(info.local_apic_address, 0xFEE0_0000);
        assert_eq!(info.local_apics.len(), 1);
        assert_eq!(info.io_apics.len(), 1);
        assert_eq!(info.io_apics[0].address, 0xFEC0_0000);
        assert_eq!(info.overrides.len(), 1);
        assert_eq!(info.overrides[0].source, 0);
        assert_eq!(info.overrides[0].global_system_interrupt, 2);
        assert_eq!(info.dropped_entries, 0);
    }

    #[test]
    fn madt_bounds_overflowing_entries() {
        let mut table = vec![0u8; TABLE_HEADER_LEN + 8];
        table[0..4].copy_from_slice(b"APIC");
        for i in 0..(MAX_INTERRUPT_OVERRIDES + 3) as u8 {
            let mut ov = vec![2u8, 10, 0, i];
            ov.extend_from_slice(&(i as u32).to_le_bytes());
            ov.extend_from_slice(&0u16.to_le_bytes());
            table.extend_from_slice(&ov);
        }
        let length = table.len() as u32;
        table[4..8].copy_from_slice(&length.to_le_bytes());

        let info = parse_madt(&table).unwrap();
        assert_eq!(info.overrides.len(), MAX_INTERRUPT_OVERRIDES);
        assert_eq!(info.dropped_entries, 3);
    }

    #[test]
    fn madt_stops_on_zero_length_entry() {
        let mut table = make_madt();
        // A zero-length entry must not loop forever.
        table.extend_from_slice(&[0, 0]);
        let length = table.len() as u32;
        table[4..8].copy_from_slice(&length.to_le_bytes());
        assert!(parse_madt(&table).is_some());
    }

    #[test]
    fn decodes_aml_package_lengths() {
        // Single-byte encoding: length in the low 6 bits.
        assert_eq!(decode_aml_package_length(&[0x0A]), Some((10, 1)));
        // Two-byte encoding: low nibble + next byte << 4.
        assert_eq!(decode_aml_package_length(&[0x42, 0x01]), Some((0x12, 2)));
        // Truncated multi-byte encoding.
        assert_eq!(decode_aml_package_length(&[0x42]), None);
    }

    #[test]
    fn finds_s5_package() {
        // NameOp _S5_ Package(4) { 0x05, 0x06, 0, 0 } with byte consts.
        let aml = [
            0x10, 0x20, // unrelated bytes
            0x08, b'_', b'S', b'5', b'_', 0x12, 0x0A, 0x04, 0x0A, 0x05, 0x0A, 0x06, 0x00, 0x00,
        ];
        assert_eq!(find_s5_package(&aml), Some((5, 6)));
    }

    #[test]
    fn s5_with_word_consts() {
        let aml = [
            0x08, b'_', b'S', b'5', b'_', 0x12, 0x08, 0x02, 0x0B, 0x07, 0x00, 0x0B, 0x02, 0x00,
        ];
        assert_eq!(find_s5_package(&aml), Some((7, 2)));
    }

    #[test]
    fn s5_absent_returns_none() {
        let aml = [0x08, b'_', b'S', b'4', b'_', 0x12, 0x04, 0x02, 0x0A, 0x05];
        assert_eq!(find_s5_package(&aml), None);
    }
}
