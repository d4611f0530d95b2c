//! Local APIC driver.
//!
//! Maps the LAPIC register page, enables the APIC through the
//! `IA32_APIC_BASE` MSR, and provides spurious-vector, LVT, and EOI access.
//!
//! # References
//!
//! - Intel SDM Volume 3, Chapter 10: Advanced Programmable Interrupt Controller

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::model_specific::Msr;

use crate::hw::acpi;
use crate::memory;

/// IA32_APIC_BASE MSR index.
const IA32_APIC_BASE_MSR: u32 = 0x1B;
/// APIC global enable bit in IA32_APIC_BASE.
const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;
/// Physical base mask in IA32_APIC_BASE.
const IA32_APIC_BASE_ADDR_MASK: u64 = 0xF_FFFF_F000;

/// Default Local APIC base when neither ACPI nor the MSR supplies one.
const LAPIC_BASE_DEFAULT: u64 = 0xFEE0_0000;

/// Local APIC register offsets.
pub mod regs {
    /// Local APIC ID Register.
    pub const ID: u64 = 0x020;
    /// Local APIC Version Register.
    pub const VERSION: u64 = 0x030;
    /// Task Priority Register.
    pub const TPR: u64 = 0x080;
    /// End of Interrupt Register (write-only).
    pub const EOI: u64 = 0x0B0;
    /// Spurious Interrupt Vector Register.
    pub const SVR: u64 = 0x0F0;
    /// LVT LINT0 Register.
    pub const LVT_LINT0: u64 = 0x350;
    /// LVT LINT1 Register.
    pub const LVT_LINT1: u64 = 0x360;
}

/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;

/// LVT mask bit.
const LVT_MASK: u32 = 1 << 16;

/// LVT delivery modes (bits 8-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LvtDeliveryMode {
    /// Fixed delivery of the programmed vector.
    Fixed = 0b000 << 8,
    /// Non-maskable interrupt.
    Nmi = 0b100 << 8,
    /// External interrupt: the line is wired to an 8259.
    ExtInt = 0b111 << 8,
}

/// Mapped LAPIC base (virtual). Zero until `init` succeeds.
static LAPIC_VIRT_BASE: AtomicU64 = AtomicU64::new(0);

fn read(reg: u64) -> u32 {
    let base = LAPIC_VIRT_BASE.load(Ordering::SeqCst);
    if base == 0 {
        return 0;
    }
    unsafe { read_volatile((base + reg) as *const u32) }
}

fn write(reg: u64, value: u32) {
    let base = LAPIC_VIRT_BASE.load(Ordering::SeqCst);
    if base == 0 {
        return;
    }
    unsafe { write_volatile((base + reg) as *mut u32, value) }
}

/// Check whether the LAPIC register page is mapped.
pub fn is_present() -> bool {
    LAPIC_VIRT_BASE.load(Ordering::SeqCst) != 0
}

/// Map the LAPIC register page.
///
/// The ACPI MADT address wins; the MSR is the fallback, then the
/// architectural default.
pub fn init() -> bool {
    let acpi_config = acpi::config();
    let phys = if acpi_config.valid && acpi_config.use_local_apic {
        acpi_config.local_apic_address
    } else {
        let msr_value = unsafe { Msr::new(IA32_APIC_BASE_MSR).read() };
        let base = msr_value & IA32_APIC_BASE_ADDR_MASK;
        if base != 0 { base } else { LAPIC_BASE_DEFAULT }
    };

    let virt = memory::map_io(phys, 4096);
    if virt == 0 {
        log::error!("apic: failed to map LAPIC registers at {:#x}", phys);
        return false;
    }

    LAPIC_VIRT_BASE.store(virt, Ordering::SeqCst);
    log::debug!("apic: LAPIC mapped at {:#x} (phys {:#x})", virt, phys);
    true
}

/// Enable the Local APIC via the IA32_APIC_BASE MSR (global enable bit).
pub fn enable() -> bool {
    if !is_present() {
        return false;
    }

    let mut msr = Msr::new(IA32_APIC_BASE_MSR);
    let value = unsafe { msr.read() };
    unsafe { msr.write(value | IA32_APIC_BASE_ENABLE) };
    true
}

/// Program the spurious interrupt vector and software-enable the APIC.
pub fn set_spurious_vector(vector: u8) -> bool {
    if !is_present() || vector < 0x20 {
        return false;
    }

    write(regs::SVR, SVR_ENABLE | vector as u32);
    // Accept all interrupt priorities.
    write(regs::TPR, 0);
    true
}

/// Configure an LVT entry with a vector, delivery mode, and mask state.
pub fn configure_lvt(reg: u64, vector: u8, delivery: LvtDeliveryMode, masked: bool) -> bool {
    if !is_present() {
        return false;
    }

    let mut value = vector as u32 | delivery as u32;
    if masked {
        value |= LVT_MASK;
    }
    write(reg, value);
    true
}

/// Get the Local APIC ID of the current processor.
pub fn id() -> u8 {
    ((read(regs::ID) >> 24) & 0xFF) as u8
}

/// Get the Local APIC version register.
pub fn version() -> u32 {
    read(regs::VERSION)
}

/// Signal end of interrupt.
#[inline]
pub fn end_of_interrupt() {
    write(regs::EOI, 0);
}
