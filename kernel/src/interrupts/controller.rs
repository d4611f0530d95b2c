//! Interrupt controller abstraction.
//!
//! Owns the choice between the legacy 8259 PIC and the IOAPIC/LAPIC pair,
//! including the one-way live transition between them. State is a boot-time
//! singleton: written during `initialize` and `transition_to_ioapic`, read
//! everywhere else.

use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::hw::acpi;
use crate::interrupts::{apic, ioapic, pic, vectors};

/// Requested controller mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Prefer the I/O APIC, fall back to the PIC.
    Auto,
    /// Stay on the 8259 PIC.
    ForcePic,
    /// Require the I/O APIC; fail when unavailable.
    ForceIoApic,
}

/// Active controller type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerType {
    /// Not initialized.
    None,
    /// Legacy 8259 pair.
    Pic,
    /// IOAPIC/LAPIC.
    IoApic,
}

/// Routing of one legacy IRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqMapping {
    /// The legacy IRQ number.
    pub legacy_irq: u8,
    /// The IOAPIC pin (GSI) the IRQ is actually wired to.
    pub actual_pin: u8,
    /// Level triggered (false = edge).
    pub trigger_level: bool,
    /// Active low (false = active high).
    pub polarity_low: bool,
    /// Mapping came from an ACPI override.
    pub from_override: bool,
}

impl IrqMapping {
    /// Identity mapping, edge triggered, active high.
    pub const fn identity(irq: u8) -> Self {
        IrqMapping {
            legacy_irq: irq,
            actual_pin: irq,
            trigger_level: false,
            polarity_low: false,
            from_override: false,
        }
    }
}

/// Controller singleton state.
struct ControllerState {
    requested_mode: Mode,
    active_type: ControllerType,
    imcr_present: bool,
    /// Saved PIC1 mask for restore on shutdown.
    pic_saved_mask: u8,
    /// Legacy IRQ routing table.
    irq_mappings: [IrqMapping; 16],
    transition_active: bool,
}

const fn identity_mappings() -> [IrqMapping; 16] {
    let mut mappings = [IrqMapping::identity(0); 16];
    let mut irq = 0;
    while irq < 16 {
        mappings[irq] = IrqMapping::identity(irq as u8);
        irq += 1;
    }
    mappings
}

static STATE: Mutex<ControllerState> = Mutex::new(ControllerState {
    requested_mode: Mode::Auto,
    active_type: ControllerType::None,
    imcr_present: false,
    pic_saved_mask: 0xFF,
    irq_mappings: identity_mappings(),
    transition_active: false,
});

/// Decode MPS INTI flags into `(trigger_level, polarity_low)`.
///
/// Trigger lives in bits 2-3 (`01` edge, `11` level), polarity in bits 0-1
/// (`01` active high, `11` active low); everything else takes the ISA
/// defaults of edge/high.
pub fn decode_mps_inti_flags(flags: u16) -> (bool, bool) {
    let trigger = (flags >> 2) & 0x3;
    let polarity = flags & 0x3;

    let trigger_level = trigger == 0x3;
    let polarity_low = polarity == 0x3;
    (trigger_level, polarity_low)
}

/// Apply ACPI interrupt source overrides to an IRQ mapping table.
///
/// Only ISA (bus 0) overrides with a source below 16 apply; all other IRQs
/// keep their identity mapping.
pub fn apply_overrides(
    mappings: &mut [IrqMapping; 16],
    overrides: impl Iterator<Item = acpi::InterruptOverride>,
) {
    for entry in overrides {
        if entry.bus != 0 || entry.source >= 16 {
            continue;
        }

        let (trigger_level, polarity_low) = decode_mps_inti_flags(entry.flags);
        let mapping = &mut mappings[entry.source as usize];
        mapping.actual_pin = entry.global_system_interrupt as u8;
        mapping.trigger_level = trigger_level;
        mapping.polarity_low = polarity_low;
        mapping.from_override = true;
    }
}

/// Probe for the IMCR register.
///
/// Selects register 0x70 through port 0x22, toggles bit 0 of the value at
/// port 0x23, and checks that the toggle reads back before restoring the
/// original value.
fn detect_imcr() -> bool {
    unsafe {
        let mut select = Port::<u8>::new(0x22);
        let mut data = Port::<u8>::new(0x23);

        select.write(0x70u8);
        let value = data.read();

        let toggled = value ^ 0x01;
        data.write(toggled);

        select.write(0x70u8);
        let read_back = data.read();

        data.write(value);
        select.write(0x70u8);
        let final_read = data.read();

        read_back == toggled && final_read == value
    }
}

/// Route legacy interrupts to the LAPIC through the IMCR (bit 0 set), or via
/// LINT0 virtual wire when no IMCR exists.
fn route_pic_to_lapic(imcr_present: bool) {
    if !imcr_present {
        // Virtual wire: LINT0 delivers ExtINT, unmasked, until the IOAPIC
        // takes over.
        if !apic::configure_lvt(apic::regs::LVT_LINT0, vectors::IRQ_BASE, apic::LvtDeliveryMode::ExtInt, false) {
            log::warn!("intctrl: failed to configure LINT0 virtual wire");
        }
        return;
    }

    unsafe {
        let mut select = Port::<u8>::new(0x22);
        let mut data = Port::<u8>::new(0x23);
        select.write(0x70u8);
        let value = data.read();
        data.write(value | 0x01);
    }
}

/// Route legacy interrupts to the PIC through the IMCR (bit 0 clear).
fn route_pic_to_pic(imcr_present: bool) {
    if !imcr_present {
        return;
    }

    unsafe {
        let mut select = Port::<u8>::new(0x22);
        let mut data = Port::<u8>::new(0x23);
        select.write(0x70u8);
        let value = data.read();
        data.write(value & 0xFE);
    }
}

/// Probe I/O APIC functionality before dismantling the PIC.
///
/// At least one controller must answer with a sane VERSION register
/// (not all-zeros, not all-ones, >= 15 redirection entries) and an ID
/// register that is not floating.
fn test_ioapic_functionality() -> bool {
    let count = ioapic::controller_count();
    if count == 0 {
        return false;
    }

    let mut found_functional = false;
    for index in 0..count {
        let version = ioapic::read_register(index, ioapic::regs::VERSION);
        if version == 0x0000_0000 || version == 0xFFFF_FFFF {
            log::debug!("intctrl: controller {} version register invalid", index);
            continue;
        }

        let max_redirection = ((version >> 16) & 0xFF) as u8;
        if max_redirection < 15 {
            log::debug!(
                "intctrl: controller {} has too few redirection entries ({})",
                index,
                max_redirection
            );
            continue;
        }

        let id = ioapic::read_register(index, ioapic::regs::ID);
        if id == 0xFFFF_FFFF {
            log::debug!("intctrl: controller {} not responding", index);
            continue;
        }

        found_functional = true;
    }

    found_functional
}

/// Standard PC IRQs programmed on transition.
const STANDARD_IRQS: [u8; 9] = [0, 1, 3, 4, 7, 8, 12, 14, 15];

/// Program one legacy IRQ's redirection entry from the mapping table.
fn program_irq(mapping: &IrqMapping, vector: u8, destination: u8, masked: bool) -> bool {
    let gsi = mapping.actual_pin as u32;
    let (controller_index, entry_index) = match ioapic::map_gsi(gsi) {
        Some(location) => location,
        None => {
            log::warn!("intctrl: no IOAPIC handles GSI {}", gsi);
            return false;
        }
    };

    let entry = ioapic::RedirectionEntry::new(
        vector,
        ioapic::DELIVERY_FIXED,
        mapping.trigger_level,
        mapping.polarity_low,
        masked,
        destination,
    );
    ioapic::write_redirection_entry(controller_index, entry_index, entry)
}

/// Transition from the live 8259 PIC to the I/O APIC.
///
/// On failure the active type is left unchanged; the caller remains on its
/// pre-transition controller.
pub fn transition_to_ioapic() -> bool {
    let imcr_present;
    {
        let mut state = STATE.lock();
        state.transition_active = true;
        imcr_present = state.imcr_present;

        // Step 1: populate the IRQ mapping table from ACPI overrides.
        let mut mappings = identity_mappings();
        let acpi_config = acpi::config();
        if acpi_config.valid {
            apply_overrides(
                &mut mappings,
                (0..acpi_config.interrupt_override_count as usize)
                    .filter_map(acpi::interrupt_override),
            );
        }
        state.irq_mappings = mappings;
    }

    // Step 2: prove the IOAPIC works before touching the PIC.
    if !test_ioapic_functionality() {
        log::error!("intctrl: I/O APIC functionality test failed");
        STATE.lock().transition_active = false;
        return false;
    }

    // Step 3: bring the LAPIC up.
    if !apic::enable() {
        log::error!("intctrl: failed to enable local APIC");
        STATE.lock().transition_active = false;
        return false;
    }
    if !apic::set_spurious_vector(vectors::SPURIOUS) {
        log::error!("intctrl: failed to set spurious vector");
        STATE.lock().transition_active = false;
        return false;
    }

    // Step 4: route legacy delivery to the LAPIC while the PIC still lives,
    // then mask LINT0 -- the IOAPIC owns delivery from here.
    route_pic_to_lapic(imcr_present);
    if !apic::configure_lvt(
        apic::regs::LVT_LINT0,
        vectors::IRQ_BASE,
        apic::LvtDeliveryMode::ExtInt,
        true,
    ) {
        log::warn!("intctrl: failed to mask LINT0");
    }

    // Step 5: dismantle the 8259.
    {
        let mut state = STATE.lock();
        state.pic_saved_mask = pic::read_mask(1);
    }
    pic::shutdown();

    // Step 6: program the standard PC IRQs.
    let destination = apic::id();
    let state = STATE.lock();
    for irq in STANDARD_IRQS {
        let mapping = state.irq_mappings[irq as usize];
        if !program_irq(&mapping, vectors::IRQ_BASE + irq, destination, false) {
            log::warn!("intctrl: failed to program IRQ {}", irq);
        }
    }
    drop(state);

    let mut state = STATE.lock();
    state.active_type = ControllerType::IoApic;
    state.transition_active = false;
    log::debug!("intctrl: transitioned to I/O APIC mode");
    true
}

/// Initialize the interrupt controller in the requested mode.
///
/// After a successful return the active type is never `None`.
pub fn initialize(mode: Mode) -> bool {
    {
        let mut state = STATE.lock();
        state.requested_mode = mode;
        state.active_type = ControllerType::None;
        state.irq_mappings = identity_mappings();
        state.imcr_present = detect_imcr();
        if state.imcr_present {
            log::debug!("intctrl: IMCR present");
        }
    }

    let ioapic_available = ioapic::init() && apic::init();

    let use_pic = |state: &mut ControllerState| {
        pic::init();
        state.pic_saved_mask = pic::read_mask(1);
        route_pic_to_pic(state.imcr_present);
        state.active_type = ControllerType::Pic;
    };

    match mode {
        Mode::ForcePic => {
            let mut state = STATE.lock();
            use_pic(&mut state);
            log::debug!("intctrl: forced PIC mode");
        }
        Mode::ForceIoApic => {
            if !ioapic_available || !transition_to_ioapic() {
                log::error!("intctrl: I/O APIC forced but unavailable");
                return false;
            }
        }
        Mode::Auto => {
            // Bring the PIC to a known state first; the transition masks it.
            {
                let mut state = STATE.lock();
                pic::init();
                state.pic_saved_mask = pic::read_mask(1);
            }

            if ioapic_available && transition_to_ioapic() {
                log::debug!("intctrl: auto-selected I/O APIC mode");
            } else {
                let mut state = STATE.lock();
                use_pic(&mut state);
                log::debug!("intctrl: auto-selected PIC mode");
            }
        }
    }

    active_type() != ControllerType::None
}

/// Shut down: mask the IOAPIC, restore the saved PIC mask, reset state.
pub fn shutdown() {
    let (active, saved_mask) = {
        let state = STATE.lock();
        (state.active_type, state.pic_saved_mask)
    };

    if active == ControllerType::IoApic {
        ioapic::shutdown();
    }

    pic::write_mask(1, saved_mask);
    pic::write_mask(2, 0xFF);

    let mut state = STATE.lock();
    state.active_type = ControllerType::None;
    state.irq_mappings = identity_mappings();
    state.transition_active = false;
}

/// The active controller type.
pub fn active_type() -> ControllerType {
    STATE.lock().active_type
}

/// Get the mapping of a legacy IRQ.
pub fn irq_mapping(irq: u8) -> Option<IrqMapping> {
    if irq >= 16 {
        return None;
    }
    Some(STATE.lock().irq_mappings[irq as usize])
}

/// Enable (unmask) a legacy IRQ on the active controller.
///
/// Idempotent: enabling an already-enabled IRQ leaves a single unmasked
/// redirection entry.
pub fn enable_irq(irq: u8) -> bool {
    match active_type() {
        ControllerType::IoApic => {
            let mapping = match irq_mapping(irq) {
                Some(mapping) => mapping,
                None => return false,
            };
            let gsi = mapping.actual_pin as u32;
            match ioapic::map_gsi(gsi) {
                Some((controller_index, entry_index)) => {
                    match ioapic::read_redirection_entry(controller_index, entry_index) {
                        Some(mut entry) => {
                            entry.set_masked(false);
                            ioapic::write_redirection_entry(controller_index, entry_index, entry)
                        }
                        None => false,
                    }
                }
                None => false,
            }
        }
        ControllerType::Pic => pic::enable_irq(irq),
        ControllerType::None => false,
    }
}

/// Disable (mask) a legacy IRQ on the active controller.
pub fn disable_irq(irq: u8) -> bool {
    match active_type() {
        ControllerType::IoApic => {
            let mapping = match irq_mapping(irq) {
                Some(mapping) => mapping,
                None => return false,
            };
            match ioapic::map_gsi(mapping.actual_pin as u32) {
                Some((controller_index, entry_index)) => {
                    match ioapic::read_redirection_entry(controller_index, entry_index) {
                        Some(mut entry) => {
                            entry.set_masked(true);
                            ioapic::write_redirection_entry(controller_index, entry_index, entry)
                        }
                        None => false,
                    }
                }
                None => false,
            }
        }
        ControllerType::Pic => pic::disable_irq(irq),
        ControllerType::None => false,
    }
}

/// Route a device IRQ to a vector on a destination CPU.
///
/// A destination of 0 targets the bootstrap processor.
pub fn configure_device_irq(irq: u8, vector: u8, dest_cpu: u8) -> bool {
    match active_type() {
        ControllerType::IoApic => {
            let mapping = match irq_mapping(irq) {
                Some(mapping) => mapping,
                None => return false,
            };
            let destination = if dest_cpu == 0 { apic::id() } else { dest_cpu };
            program_irq(&mapping, vector, destination, false)
        }
        ControllerType::Pic => pic::enable_irq(irq),
        ControllerType::None => false,
    }
}

/// Signal end of interrupt on the active controller.
pub fn send_eoi() {
    match active_type() {
        ControllerType::IoApic => apic::end_of_interrupt(),
        ControllerType::Pic => pic::end_of_interrupt(),
        ControllerType::None => {}
    }
}

/// Mask every interrupt source on the active controller.
pub fn mask_all() {
    match active_type() {
        ControllerType::IoApic => {
            for index in 0..ioapic::controller_count() {
                ioapic::mask_all(index);
            }
        }
        ControllerType::Pic => {
            pic::write_mask(1, 0xFF);
            pic::write_mask(2, 0xFF);
        }
        ControllerType::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::acpi::InterruptOverride;

    #[test]
    fn decodes_mps_inti_flags() {
        // 0b0000: bus defaults -> edge, high.
        assert_eq!(decode_mps_inti_flags(0x0000), (false, false));
        // trigger=01 edge, polarity=01 high.
        assert_eq!(decode_mps_inti_flags(0x0005), (false, false));
        // trigger=11 level, polarity=11 low.
        assert_eq!(decode_mps_inti_flags(0x000F), (true, true));
        // level trigger, default polarity.
        assert_eq!(decode_mps_inti_flags(0x000C), (true, false));
    }

    #[test]
    fn overrides_patch_only_isa_sources() {
        let mut mappings = identity_mappings();

        let overrides = [
            // Classic timer override: IRQ 0 -> GSI 2.
            InterruptOverride {
                bus: 0,
                source: 0,
                global_system_interrupt: 2,
                flags: 0x0000,
            },
            // Non-ISA bus: must be ignored.
            InterruptOverride {
                bus: 1,
                source: 3,
                global_system_interrupt: 9,
                flags: 0x000F,
            },
            // Source out of range: must be ignored.
            InterruptOverride {
                bus: 0,
                source: 20,
                global_system_interrupt: 30,
                flags: 0,
            },
            // SCI-style override: IRQ 9 level/low.
            InterruptOverride {
                bus: 0,
                source: 9,
                global_system_interrupt: 9,
                flags: 0x000F,
            },
        ];

        apply_overrides(&mut mappings, overrides.into_iter());

        assert_eq!(mappings[0].actual_pin, 2);
        assert!(mappings[0].from_override);
        assert!(!mappings[0].trigger_level);

        assert_eq!(mappings[3].actual_pin, 3);
        assert!(!mappings[3].from_override);

        assert_eq!(mappings[9].actual_pin, 9);
        assert!(mappings[9].trigger_level);
        assert!(mappings[9].polarity_low);

        // All other entries stay identity.
        for irq in [1u8, 2, 4, 5, 6, 7, 8, 10, 11, 12, 13, 14, 15] {
            assert_eq!(mappings[irq as usize], IrqMapping::identity(irq));
        }
    }

    #[test]
    fn identity_table_is_identity() {
        let mappings = identity_mappings();
        for (irq, mapping) in mappings.iter().enumerate() {
            assert_eq!(mapping.legacy_irq, irq as u8);
            assert_eq!(mapping.actual_pin, irq as u8);
            assert!(!mapping.trigger_level);
            assert!(!mapping.polarity_low);
            assert!(!mapping.from_override);
        }
    }
}
