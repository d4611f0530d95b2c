//! Programmable Interrupt Controller (8259 PIC) driver.
//!
//! The chained 8259 pair handles legacy IRQs until the transition to the
//! I/O APIC. IRQs are remapped to vectors 0x20/0x28 to stay clear of CPU
//! exceptions.

use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// PIC1 command port.
const PIC1_COMMAND: u16 = 0x20;
/// PIC1 data (mask) port.
const PIC1_DATA: u16 = 0x21;
/// PIC2 command port.
const PIC2_COMMAND: u16 = 0xA0;
/// PIC2 data (mask) port.
const PIC2_DATA: u16 = 0xA1;

/// End-of-interrupt command.
const PIC_EOI: u8 = 0x20;

/// PIC1 vector offset (IRQ 0-7 -> 0x20-0x27).
pub const PIC1_OFFSET: u8 = 0x20;
/// PIC2 vector offset (IRQ 8-15 -> 0x28-0x2F).
pub const PIC2_OFFSET: u8 = 0x28;

/// The chained PICs (master and slave).
static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC1_OFFSET, PIC2_OFFSET) });

/// Read a PIC mask register (1 or 2).
pub fn read_mask(pic: u8) -> u8 {
    let port = if pic == 1 { PIC1_DATA } else { PIC2_DATA };
    unsafe { Port::<u8>::new(port).read() }
}

/// Write a PIC mask register (1 or 2).
pub fn write_mask(pic: u8, mask: u8) {
    let port = if pic == 1 { PIC1_DATA } else { PIC2_DATA };
    unsafe { Port::<u8>::new(port).write(mask) }
}

/// Initialize the 8259 pair.
///
/// Runs the ICW1-ICW4 sequence (init, vector offsets, cascade on IRQ2,
/// 8086 mode), then masks every line; callers unmask what they need.
pub fn init() {
    unsafe {
        PICS.lock().initialize();
    }
    write_mask(1, 0xFF);
    write_mask(2, 0xFF);
}

/// Mask both PICs completely and drain any pending interrupt state.
pub fn shutdown() {
    write_mask(1, 0xFF);
    write_mask(2, 0xFF);

    unsafe {
        Port::<u8>::new(PIC1_COMMAND).write(PIC_EOI);
        Port::<u8>::new(PIC2_COMMAND).write(PIC_EOI);
        // POST I/O delay to let the commands settle.
        let mut delay = Port::<u8>::new(0x80);
        let _ = delay.read();
        let _ = delay.read();
    }
}

/// Enable a specific IRQ line.
///
/// Enabling a slave line also unmasks the cascade (IRQ 2) on the master.
pub fn enable_irq(irq: u8) -> bool {
    if irq < 8 {
        write_mask(1, read_mask(1) & !(1 << irq));
        true
    } else if irq < 16 {
        write_mask(2, read_mask(2) & !(1 << (irq - 8)));
        write_mask(1, read_mask(1) & !(1 << 2));
        true
    } else {
        false
    }
}

/// Disable a specific IRQ line.
pub fn disable_irq(irq: u8) -> bool {
    if irq < 8 {
        write_mask(1, read_mask(1) | (1 << irq));
        true
    } else if irq < 16 {
        write_mask(2, read_mask(2) | (1 << (irq - 8)));
        true
    } else {
        false
    }
}

/// Send end-of-interrupt to PIC1.
pub fn end_of_interrupt() {
    unsafe {
        Port::<u8>::new(PIC1_COMMAND).write(PIC_EOI);
    }
}

/// Send end-of-interrupt for a specific vector through the chained pair.
pub fn end_of_interrupt_for(vector: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
