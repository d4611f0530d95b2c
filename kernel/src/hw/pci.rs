//! PCI configuration space access.
//!
//! Configuration mechanism #1: an address written to port 0xCF8 selects
//! bus/device/function/register, data moves through port 0xCFC.

use x86_64::instructions::port::Port;

/// PCI configuration address port.
const CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI configuration data port.
const CONFIG_DATA: u16 = 0xCFC;

/// Offset of the command register.
pub const CFG_COMMAND: u16 = 0x04;
/// Offset of the status register.
pub const CFG_STATUS: u16 = 0x06;
/// Offset of BAR0.
pub const CFG_BAR0: u16 = 0x10;
/// Offset of BAR1.
pub const CFG_BAR1: u16 = 0x14;
/// Offset of the capabilities pointer.
pub const CFG_CAPABILITIES_PTR: u16 = 0x34;

/// Command register: bus master enable.
pub const COMMAND_BUS_MASTER: u16 = 0x0004;
/// Status register: capabilities list present.
pub const STATUS_CAPABILITIES: u16 = 0x0010;

/// MSI-X capability ID.
pub const CAP_ID_MSIX: u8 = 0x11;

/// A PCI function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    /// Bus number.
    pub bus: u8,
    /// Device number (0-31).
    pub device: u8,
    /// Function number (0-7).
    pub function: u8,
}

impl PciAddress {
    /// Encode the CONFIG_ADDRESS value for a register offset.
    fn config_address(&self, offset: u16) -> u32 {
        0x8000_0000
            | ((self.bus as u32) << 16)
            | ((self.device as u32 & 0x1F) << 11)
            | ((self.function as u32 & 0x07) << 8)
            | (offset as u32 & 0xFC)
    }
}

fn config_read_u32(address: PciAddress, offset: u16) -> u32 {
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(address.config_address(offset));
        Port::<u32>::new(CONFIG_DATA).read()
    }
}

fn config_write_u32(address: PciAddress, offset: u16, value: u32) {
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(address.config_address(offset));
        Port::<u32>::new(CONFIG_DATA).write(value);
    }
}

/// Read a 32-bit configuration register.
pub fn read_u32(address: PciAddress, offset: u16) -> u32 {
    config_read_u32(address, offset)
}

/// Read a 16-bit configuration register.
pub fn read_u16(address: PciAddress, offset: u16) -> u16 {
    let dword = config_read_u32(address, offset);
    ((dword >> ((offset & 2) * 8)) & 0xFFFF) as u16
}

/// Read an 8-bit configuration register.
pub fn read_u8(address: PciAddress, offset: u16) -> u8 {
    let dword = config_read_u32(address, offset);
    ((dword >> ((offset & 3) * 8)) & 0xFF) as u8
}

/// Write a 32-bit configuration register.
pub fn write_u32(address: PciAddress, offset: u16, value: u32) {
    config_write_u32(address, offset, value);
}

/// Write a 16-bit configuration register (read-modify-write of the dword).
pub fn write_u16(address: PciAddress, offset: u16, value: u16) {
    let shift = (offset & 2) * 8;
    let mut dword = config_read_u32(address, offset);
    dword &= !(0xFFFFu32 << shift);
    dword |= (value as u32) << shift;
    config_write_u32(address, offset, dword);
}

/// Identity of a discovered PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceInfo {
    /// Function address.
    pub address: PciAddress,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Class code.
    pub class: u8,
    /// Subclass code.
    pub subclass: u8,
    /// Programming interface.
    pub prog_if: u8,
}

/// Scan all buses for functions matching class/subclass/prog-if.
pub fn find_devices(class: u8, subclass: u8, prog_if: u8) -> alloc::vec::Vec<PciDeviceInfo> {
    let mut found = alloc::vec::Vec::new();

    for bus in 0..=255u8 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                let address = PciAddress { bus, device, function };
                let id = read_u32(address, 0x00);
                if id == 0xFFFF_FFFF {
                    if function == 0 {
                        break;
                    }
                    continue;
                }

                let class_reg = read_u32(address, 0x08);
                let dev_class = (class_reg >> 24) as u8;
                let dev_subclass = (class_reg >> 16) as u8;
                let dev_prog_if = (class_reg >> 8) as u8;

                if dev_class == class && dev_subclass == subclass && dev_prog_if == prog_if {
                    found.push(PciDeviceInfo {
                        address,
                        vendor_id: (id & 0xFFFF) as u16,
                        device_id: (id >> 16) as u16,
                        class: dev_class,
                        subclass: dev_subclass,
                        prog_if: dev_prog_if,
                    });
                }

                // Single-function device: skip functions 1-7.
                if function == 0 {
                    let header_type = read_u8(address, 0x0E);
                    if header_type & 0x80 == 0 {
                        break;
                    }
                }
            }
        }
    }

    found
}

/// Enable bus mastering for a function.
pub fn enable_bus_master(address: PciAddress) {
    let command = read_u16(address, CFG_COMMAND);
    write_u16(address, CFG_COMMAND, command | COMMAND_BUS_MASTER);
}

/// Walk the capability list for a capability ID.
///
/// Returns the configuration-space offset of the capability, or 0.
pub fn find_capability(address: PciAddress, capability_id: u8) -> u8 {
    let status = read_u16(address, CFG_STATUS);
    if status & STATUS_CAPABILITIES == 0 {
        return 0;
    }

    let mut pointer = read_u8(address, CFG_CAPABILITIES_PTR) & 0xFC;
    let mut guard = 0;
    while pointer != 0 && guard < 48 {
        let id = read_u8(address, pointer as u16);
        if id == capability_id {
            return pointer;
        }
        pointer = read_u8(address, pointer as u16 + 1) & 0xFC;
        guard += 1;
    }

    0
}

/// Decode a memory BAR into its physical base, reading the high half for
/// 64-bit BARs. Returns `None` for I/O BARs.
pub fn read_memory_bar(address: PciAddress, bar_offset: u16) -> Option<u64> {
    let raw = read_u32(address, bar_offset);
    if raw & 0x1 != 0 {
        return None;
    }

    let low = (raw & 0xFFFF_FFF0) as u64;
    let bar_type = (raw >> 1) & 0x3;
    if bar_type == 0x2 {
        let high = read_u32(address, bar_offset + 4) as u64;
        Some((high << 32) | low)
    } else {
        Some(low)
    }
}

/// Measure the size of a BAR by writing all-ones and decoding the mask.
pub fn bar_size(address: PciAddress, bar_offset: u16) -> u64 {
    let original = read_u32(address, bar_offset);
    write_u32(address, bar_offset, 0xFFFF_FFFF);
    let mask = read_u32(address, bar_offset);
    write_u32(address, bar_offset, original);

    if mask == 0 {
        return 0;
    }

    let size_mask = if original & 0x1 != 0 {
        (mask & 0xFFFF_FFFC) as u64
    } else {
        (mask & 0xFFFF_FFF0) as u64
    };

    (!size_mask).wrapping_add(1) & 0xFFFF_FFFF
}
