//! I/O APIC driver.
//!
//! The I/O APIC routes external interrupts to local APICs. Registers are
//! reached indirectly: the register index goes to IOREGSEL (offset 0x00),
//! data moves through IOWIN (offset 0x10), 32-bit accesses only. Each
//! redirection table entry is 64 bits split over two registers; the high
//! dword is written first because the low dword carries the vector and mask
//! bits that arm the interrupt.

use core::ptr::{read_volatile, write_volatile};
use spin::Mutex;

use crate::hw::acpi;
use crate::memory;

/// Maximum number of I/O APIC controllers supported.
pub const MAX_CONTROLLERS: usize = 8;

/// IOREGSEL offset.
const IOREGSEL: u64 = 0x00;
/// IOWIN offset.
const IOWIN: u64 = 0x10;

/// Register indices.
pub mod regs {
    /// I/O APIC ID.
    pub const ID: u8 = 0x00;
    /// I/O APIC version / max redirection entry.
    pub const VERSION: u8 = 0x01;
    /// Redirection table base (two registers per entry).
    pub const REDTBL_BASE: u8 = 0x10;
}

/// Delivery mode field values (bits 8-10 of the low dword).
pub const DELIVERY_FIXED: u32 = 0b000;
pub const DELIVERY_LOWEST_PRIORITY: u32 = 0b001;
pub const DELIVERY_NMI: u32 = 0b100;
pub const DELIVERY_EXTINT: u32 = 0b111;

/// A 64-bit redirection table entry as its two hardware dwords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedirectionEntry {
    /// Low dword: vector, delivery mode, polarity, trigger, mask.
    pub low: u32,
    /// High dword: destination APIC ID in bits 24-31.
    pub high: u32,
}

impl RedirectionEntry {
    /// Build an entry from routing fields.
    pub fn new(
        vector: u8,
        delivery_mode: u32,
        trigger_level: bool,
        polarity_low: bool,
        masked: bool,
        destination: u8,
    ) -> Self {
        let mut low = vector as u32;
        low |= (delivery_mode & 0x7) << 8;
        if polarity_low {
            low |= 1 << 13;
        }
        if trigger_level {
            low |= 1 << 15;
        }
        if masked {
            low |= 1 << 16;
        }

        RedirectionEntry {
            low,
            high: (destination as u32) << 24,
        }
    }

    /// The programmed vector.
    pub fn vector(&self) -> u8 {
        (self.low & 0xFF) as u8
    }

    /// The mask bit.
    pub fn is_masked(&self) -> bool {
        self.low & (1 << 16) != 0
    }

    /// Set or clear the mask bit.
    pub fn set_masked(&mut self, masked: bool) {
        if masked {
            self.low |= 1 << 16;
        } else {
            self.low &= !(1 << 16);
        }
    }

    /// Destination APIC ID.
    pub fn destination(&self) -> u8 {
        (self.high >> 24) as u8
    }
}

/// One mapped I/O APIC controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Controller {
    /// I/O APIC ID from ACPI.
    pub id: u8,
    /// Physical register base.
    pub physical_address: u64,
    /// Mapped (virtual) register base.
    pub mapped_address: u64,
    /// First GSI handled by this controller.
    pub gsi_base: u32,
    /// Highest valid redirection entry index.
    pub max_redirection_entry: u8,
    /// Controller is mapped and answering.
    pub present: bool,
}

impl Controller {
    /// Check whether this controller handles a GSI.
    pub fn handles_gsi(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi <= self.gsi_base + self.max_redirection_entry as u32
    }
}

/// I/O APIC subsystem state.
#[derive(Default)]
struct IoApicState {
    controllers: [Controller; MAX_CONTROLLERS],
    controller_count: usize,
    /// Next vector handed to `allocate_vector`.
    next_free_vector: u8,
    initialized: bool,
}

static STATE: Mutex<IoApicState> = Mutex::new(IoApicState {
    controllers: [Controller {
        id: 0,
        physical_address: 0,
        mapped_address: 0,
        gsi_base: 0,
        max_redirection_entry: 0,
        present: false,
    }; MAX_CONTROLLERS],
    controller_count: 0,
    next_free_vector: 0,
    initialized: false,
});

fn register_read(mapped: u64, register: u8) -> u32 {
    unsafe {
        write_volatile((mapped + IOREGSEL) as *mut u32, register as u32);
        read_volatile((mapped + IOWIN) as *const u32)
    }
}

fn register_write(mapped: u64, register: u8, value: u32) {
    unsafe {
        write_volatile((mapped + IOREGSEL) as *mut u32, register as u32);
        write_volatile((mapped + IOWIN) as *mut u32, value);
    }
}

/// Initialize the I/O APIC subsystem from ACPI.
///
/// Maps every controller the MADT reported, reads its version register for
/// the max-redirection-entry count, and masks all its entries.
pub fn init() -> bool {
    let acpi_config = acpi::config();
    if !acpi_config.valid || !acpi_config.use_io_apic || acpi_config.io_apic_count == 0 {
        log::debug!("ioapic: no I/O APIC in ACPI tables");
        return false;
    }

    let mut state = STATE.lock();
    if state.initialized {
        return true;
    }

    let mut count = 0usize;
    for index in 0..acpi_config.io_apic_count as usize {
        if count >= MAX_CONTROLLERS {
            break;
        }
        let info = match acpi::io_apic_info(index) {
            Some(info) => info,
            None => continue,
        };

        let mapped = memory::map_io(info.address, 4096);
        if mapped == 0 {
            log::warn!("ioapic: failed to map controller {} at {:#x}", index, info.address);
            continue;
        }

        let version = register_read(mapped, regs::VERSION);
        let max_redirection_entry = ((version >> 16) & 0xFF) as u8;

        state.controllers[count] = Controller {
            id: info.id,
            physical_address: info.address,
            mapped_address: mapped,
            gsi_base: info.gsi_base,
            max_redirection_entry,
            present: true,
        };

        log::debug!(
            "ioapic: controller {} id={} gsi_base={} entries={}",
            count,
            info.id,
            info.gsi_base,
            max_redirection_entry as u32 + 1
        );

        count += 1;
        state.controller_count = count;
        drop(state);
        mask_all(count - 1);
        state = STATE.lock();
    }

    if count == 0 {
        return false;
    }

    state.controller_count = count;
    state.next_free_vector = super::vectors::DEVICE_BASE;
    state.initialized = true;
    true
}

/// Shut the subsystem down: mask everything and forget the mappings.
pub fn shutdown() {
    let mut state = STATE.lock();
    if !state.initialized {
        return;
    }
    let count = state.controller_count;
    drop(state);

    for index in 0..count {
        mask_all(index);
    }

    let mut state = STATE.lock();
    *state = IoApicState::default();
}

/// Number of mapped controllers.
pub fn controller_count() -> usize {
    STATE.lock().controller_count
}

/// Get a copy of one controller descriptor.
pub fn controller(index: usize) -> Option<Controller> {
    let state = STATE.lock();
    if index < state.controller_count && state.controllers[index].present {
        Some(state.controllers[index])
    } else {
        None
    }
}

/// Read an I/O APIC register of one controller.
pub fn read_register(index: usize, register: u8) -> u32 {
    match controller(index) {
        Some(c) => register_read(c.mapped_address, register),
        None => 0,
    }
}

/// Map a GSI to `(controller index, entry index)`.
///
/// A GSI belongs to the controller whose `[gsi_base, gsi_base + max_entry]`
/// range contains it.
pub fn map_gsi(gsi: u32) -> Option<(usize, u8)> {
    let state = STATE.lock();
    for index in 0..state.controller_count {
        let c = &state.controllers[index];
        if c.present && c.handles_gsi(gsi) {
            return Some((index, (gsi - c.gsi_base) as u8));
        }
    }
    None
}

/// Read a redirection entry.
pub fn read_redirection_entry(index: usize, entry: u8) -> Option<RedirectionEntry> {
    let c = controller(index)?;
    if entry > c.max_redirection_entry {
        return None;
    }

    let reg = regs::REDTBL_BASE + entry * 2;
    Some(RedirectionEntry {
        low: register_read(c.mapped_address, reg),
        high: register_read(c.mapped_address, reg + 1),
    })
}

/// Write a redirection entry, high dword first.
pub fn write_redirection_entry(index: usize, entry: u8, value: RedirectionEntry) -> bool {
    let c = match controller(index) {
        Some(c) => c,
        None => return false,
    };
    if entry > c.max_redirection_entry {
        return false;
    }

    let reg = regs::REDTBL_BASE + entry * 2;
    // High first: the low dword arms the interrupt.
    register_write(c.mapped_address, reg + 1, value.high);
    register_write(c.mapped_address, reg, value.low);
    true
}

/// Mask every redirection entry of one controller.
pub fn mask_all(index: usize) {
    let c = match controller(index) {
        Some(c) => c,
        None => return,
    };

    for entry in 0..=c.max_redirection_entry {
        if let Some(mut redirection) = read_redirection_entry(index, entry) {
            redirection.set_masked(true);
            write_redirection_entry(index, entry, redirection);
        }
    }
}

/// Allocate the next free device vector, or 0 when exhausted.
pub fn allocate_vector() -> u8 {
    let mut state = STATE.lock();
    if state.next_free_vector == 0 || state.next_free_vector > 0xFE {
        return 0;
    }
    let vector = state.next_free_vector;
    state.next_free_vector += 1;
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirection_entry_encodes_fields() {
        let entry = RedirectionEntry::new(0x22, DELIVERY_FIXED, true, true, false, 3);
        assert_eq!(entry.vector(), 0x22);
        assert_eq!(entry.low & (1 << 15), 1 << 15); // level trigger
        assert_eq!(entry.low & (1 << 13), 1 << 13); // active low
        assert!(!entry.is_masked());
        assert_eq!(entry.destination(), 3);
        assert_eq!(entry.high, 3 << 24);
    }

    #[test]
    fn redirection_entry_mask_round_trip() {
        let mut entry = RedirectionEntry::new(0x20, DELIVERY_FIXED, false, false, true, 0);
        assert!(entry.is_masked());
        entry.set_masked(false);
        assert!(!entry.is_masked());
        assert_eq!(entry.vector(), 0x20);
    }

    #[test]
    fn controller_gsi_ranges() {
        let c = Controller {
            gsi_base: 24,
            max_redirection_entry: 23,
            present: true,
            ..Controller::default()
        };
        assert!(!c.handles_gsi(23));
        assert!(c.handles_gsi(24));
        assert!(c.handles_gsi(47));
        assert!(!c.handles_gsi(48));
    }
}
