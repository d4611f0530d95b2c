//! NVMe host controller driver.
//!
//! Covers controller bring-up over BAR0 MMIO: admin queue configuration,
//! identify, I/O queue creation, and sector I/O with PRP1/PRP2 data
//! pointers. Completion is polled: the submitting thread spins on the
//! completion queue phase tag under the controller mutex, bounded by a
//! wall-clock/spin-count timeout.
//!
//! # References
//!
//! - NVM Express Base Specification 1.4

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use storage::limiter::Cooldown;

use crate::allocator::AlignedBuffer;
use crate::hw::pci::{self, PciAddress};
use crate::interrupts::{apic, ioapic};
use crate::memory;
use crate::time;

/// PCI class/subclass/prog-if of an NVMe controller.
pub const PCI_CLASS: u8 = 0x01;
pub const PCI_SUBCLASS: u8 = 0x08;
pub const PCI_PROG_IF: u8 = 0x02;

/// Controller register offsets (BAR0).
pub mod regs {
    /// Controller Capabilities (64-bit).
    pub const CAP: u64 = 0x00;
    /// Version.
    pub const VS: u64 = 0x08;
    /// Interrupt Mask Set.
    pub const INTMS: u64 = 0x0C;
    /// Interrupt Mask Clear.
    pub const INTMC: u64 = 0x10;
    /// Controller Configuration.
    pub const CC: u64 = 0x14;
    /// Controller Status.
    pub const CSTS: u64 = 0x1C;
    /// Admin Queue Attributes.
    pub const AQA: u64 = 0x24;
    /// Admin Submission Queue Base Address (64-bit).
    pub const ASQ: u64 = 0x28;
    /// Admin Completion Queue Base Address (64-bit).
    pub const ACQ: u64 = 0x30;
    /// Doorbell array base.
    pub const DOORBELL_BASE: u64 = 0x1000;
}

/// CC register fields.
mod cc {
    /// Enable.
    pub const EN: u32 = 1 << 0;
    /// I/O command set selected (CSS), bits 4-6.
    pub const CSS_SHIFT: u32 = 4;
    /// Memory page size, bits 7-10 (0 = 4 KiB).
    pub const MPS_SHIFT: u32 = 7;
    /// Arbitration mechanism, bits 11-13.
    pub const AMS_SHIFT: u32 = 11;
    /// Shutdown notification, bits 14-15.
    pub const SHN_SHIFT: u32 = 14;
    /// I/O submission queue entry size (2^n), bits 16-19.
    pub const IOSQES_SHIFT: u32 = 16;
    /// I/O completion queue entry size (2^n), bits 20-23.
    pub const IOCQES_SHIFT: u32 = 20;
}

/// CSTS register fields.
mod csts {
    /// Ready.
    pub const RDY: u32 = 1 << 0;
}

/// Admin command opcodes.
pub mod admin_op {
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const CREATE_IO_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
    pub const SET_FEATURES: u8 = 0x09;
}

/// I/O command opcodes.
pub mod io_op {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
}

/// Identify CNS values.
pub mod cns {
    /// Identify namespace.
    pub const NAMESPACE: u32 = 0;
    /// Identify controller.
    pub const CONTROLLER: u32 = 1;
    /// Active namespace ID list.
    pub const NAMESPACE_LIST: u32 = 2;
}

/// SET_FEATURES: number of queues.
const FEATURE_NUMBER_OF_QUEUES: u32 = 0x07;

/// Queue geometry.
pub const ADMIN_QUEUE_ENTRIES: u16 = 64;
pub const IO_QUEUE_ENTRIES: u16 = 16;
pub const SQ_ENTRY_SIZE: usize = 64;
pub const CQ_ENTRY_SIZE: usize = 16;
const QUEUE_ALIGNMENT: usize = 4096;

/// Command timeout: 200 ms wall clock OR 2^28 spins, whichever first.
const COMMAND_TIMEOUT_MS: u64 = 200;
const COMMAND_TIMEOUT_LOOPS: u64 = 0x1000_0000;
/// Ready-bit poll bound.
const READY_TIMEOUT_LOOPS: u64 = 1_000_000;

/// Page size assumed by PRP construction.
const PAGE_SIZE: u64 = 4096;
/// Largest transfer expressible with PRP1/PRP2 and no PRP list.
pub const MAX_TRANSFER_BYTES: u64 = 2 * PAGE_SIZE;

/// Queue-creation flags.
const CQ_FLAG_PC: u32 = 1 << 0;
const CQ_FLAG_IEN: u32 = 1 << 1;
const SQ_FLAG_PC: u32 = 1 << 0;

/// Decoded controller capabilities (CAP register).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Maximum queue entries supported (0-based).
    pub mqes: u16,
    /// Contiguous queues required.
    pub cqr: bool,
    /// Doorbell stride exponent.
    pub dstrd: u8,
    /// Timeout in 500 ms units.
    pub timeout: u8,
    /// Memory page size minimum exponent.
    pub mpsmin: u8,
}

impl Capabilities {
    /// Decode the raw 64-bit CAP value.
    pub fn from_raw(value: u64) -> Self {
        Capabilities {
            mqes: (value & 0xFFFF) as u16,
            cqr: (value >> 16) & 1 != 0,
            timeout: ((value >> 24) & 0xFF) as u8,
            dstrd: ((value >> 32) & 0xF) as u8,
            mpsmin: ((value >> 48) & 0xF) as u8,
        }
    }

    /// Maximum queue size (1-based).
    pub fn max_queue_entries(&self) -> u32 {
        self.mqes as u32 + 1
    }

    /// Doorbell stride in bytes.
    pub fn doorbell_stride(&self) -> u32 {
        4 << self.dstrd
    }
}

/// Byte offset of a queue doorbell from the doorbell array base.
///
/// Queue i's SQ tail doorbell sits at `(2i) * stride`, its CQ head doorbell
/// at `(2i + 1) * stride`.
pub fn doorbell_offset(qid: u16, completion: bool, stride: u32) -> u64 {
    let index = (qid as u64) * 2 + if completion { 1 } else { 0 };
    index * stride as u64
}

/// NVMe submission queue entry (64 bytes).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct NvmeCommand {
    /// Command dword 0: opcode, fuse, command identifier.
    pub cdw0: u32,
    /// Namespace identifier.
    pub nsid: u32,
    /// Reserved.
    pub cdw2: u32,
    pub cdw3: u32,
    /// Metadata pointer.
    pub mptr: u64,
    /// PRP entry 1.
    pub prp1: u64,
    /// PRP entry 2.
    pub prp2: u64,
    /// Command dwords 10-15.
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCommand {
    /// Create a command with an opcode.
    pub fn new(opcode: u8) -> Self {
        NvmeCommand {
            cdw0: opcode as u32,
            ..NvmeCommand::default()
        }
    }

    /// Set the command identifier (cdw0 bits 16-31).
    pub fn set_cid(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0xFFFF) | ((cid as u32) << 16);
    }

    /// Get the command identifier.
    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    /// Get the opcode.
    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xFF) as u8
    }
}

/// NVMe completion queue entry (16 bytes).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct NvmeCompletion {
    /// Command-specific result.
    pub result: u32,
    /// Reserved.
    pub reserved: u32,
    /// Submission queue head pointer.
    pub sq_head: u16,
    /// Submission queue identifier.
    pub sq_id: u16,
    /// Command identifier.
    pub cid: u16,
    /// Phase tag and status field.
    pub status: u16,
}

impl NvmeCompletion {
    /// The phase tag bit.
    pub fn phase(&self) -> u8 {
        (self.status & 1) as u8
    }

    /// Status code (bits 1-8).
    pub fn status_code(&self) -> u8 {
        ((self.status >> 1) & 0xFF) as u8
    }

    /// Status code type (bits 9-11).
    pub fn status_code_type(&self) -> u8 {
        ((self.status >> 9) & 0x7) as u8
    }

    /// Do-not-retry bit.
    pub fn dnr(&self) -> bool {
        self.status & (1 << 15) != 0
    }

    /// Command completed successfully.
    pub fn success(&self) -> bool {
        self.status_code() == 0 && self.status_code_type() == 0
    }
}

/// Build PRP1/PRP2 for a transfer.
///
/// PRP1 is the first page; PRP2 names the second page for transfers above
/// one page. Transfers above two pages need a PRP list and are rejected.
pub fn build_prps(phys_base: u64, transfer_bytes: u64) -> Result<(u64, u64), &'static str> {
    if transfer_bytes == 0 {
        return Err("empty transfer");
    }
    if phys_base % PAGE_SIZE != 0 {
        return Err("buffer not page aligned");
    }
    if transfer_bytes > MAX_TRANSFER_BYTES {
        return Err("transfer needs a PRP list");
    }

    let prp2 = if transfer_bytes > PAGE_SIZE {
        phys_base + PAGE_SIZE
    } else {
        0
    };

    Ok((phys_base, prp2))
}

/// Trim trailing spaces from an identify string field.
pub fn trim_identify_string(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    bytes[..end]
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

/// Identify-controller strings.
#[derive(Debug, Clone, Default)]
pub struct ControllerIdentity {
    /// Serial number (20 bytes on the wire, trimmed).
    pub serial: String,
    /// Model number (40 bytes on the wire, trimmed).
    pub model: String,
    /// Firmware revision (8 bytes on the wire, trimmed).
    pub firmware: String,
}

/// Parse the identify-controller data page.
pub fn parse_identify_controller(data: &[u8]) -> Option<ControllerIdentity> {
    if data.len() < 72 {
        return None;
    }
    Some(ControllerIdentity {
        serial: trim_identify_string(&data[4..24]),
        model: trim_identify_string(&data[24..64]),
        firmware: trim_identify_string(&data[64..72]),
    })
}

/// Parse an identify-namespace data page into `(nsze, bytes_per_sector)`.
///
/// The active LBA format index comes from FLBAS; its descriptor's LBADS
/// exponent must be in 9..=16.
pub fn parse_identify_namespace(data: &[u8]) -> Result<(u64, u32), &'static str> {
    if data.len() < 192 {
        return Err("identify namespace page too short");
    }

    let nsze = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let flbas = data[26];
    let format_index = (flbas & 0x0F) as usize;

    let descriptor_offset = 128 + format_index * 4;
    if descriptor_offset + 4 > data.len() {
        return Err("LBA format descriptor out of range");
    }
    let descriptor = u32::from_le_bytes(
        data[descriptor_offset..descriptor_offset + 4].try_into().unwrap(),
    );
    let lbads = ((descriptor >> 16) & 0xFF) as u8;

    if !(9..=16).contains(&lbads) {
        return Err("unsupported LBADS");
    }

    Ok((nsze, 1u32 << lbads))
}

/// Parse an active-namespace-list page (up to 1024 IDs, zero terminated).
pub fn parse_namespace_list(data: &[u8]) -> Vec<u32> {
    let mut ids = Vec::new();
    for chunk in data.chunks_exact(4).take(1024) {
        let nsid = u32::from_le_bytes(chunk.try_into().unwrap());
        if nsid == 0 {
            break;
        }
        ids.push(nsid);
    }
    ids
}

/// One submission/completion queue pair backed by DMA-able rings.
struct QueuePair {
    /// Queue identifier (0 = admin).
    qid: u16,
    /// Submission ring.
    sq: AlignedBuffer,
    /// Completion ring.
    cq: AlignedBuffer,
    /// Physical base of the submission ring.
    sq_phys: u64,
    /// Physical base of the completion ring.
    cq_phys: u64,
    /// Entry counts.
    sq_entries: u16,
    cq_entries: u16,
    /// Submission tail index.
    sq_tail: u16,
    /// Completion head index.
    cq_head: u16,
    /// Expected phase tag; starts at 1 and toggles on CQ wrap.
    phase: u8,
    /// Next command identifier (skips 0).
    next_cid: u16,
}

impl QueuePair {
    /// Allocate and validate the rings of one queue pair.
    ///
    /// Each ring is 4 KiB aligned and checked for physical contiguity across
    /// every page boundary.
    fn allocate(qid: u16, sq_entries: u16, cq_entries: u16) -> Result<Self, &'static str> {
        let sq_size = sq_entries as usize * SQ_ENTRY_SIZE;
        let cq_size = cq_entries as usize * CQ_ENTRY_SIZE;

        let sq = AlignedBuffer::new(sq_size, QUEUE_ALIGNMENT).ok_or("SQ allocation failed")?;
        let cq = AlignedBuffer::new(cq_size, QUEUE_ALIGNMENT).ok_or("CQ allocation failed")?;

        let translate = |linear: u64| memory::linear_to_physical(linear);

        let sq_phys = translate(sq.addr()).ok_or("SQ not mapped")?;
        if !memory::is_physically_contiguous(sq.addr(), sq_size as u64, &translate) {
            return Err("SQ not physically contiguous");
        }

        let cq_phys = translate(cq.addr()).ok_or("CQ not mapped")?;
        if !memory::is_physically_contiguous(cq.addr(), cq_size as u64, &translate) {
            return Err("CQ not physically contiguous");
        }

        Ok(QueuePair {
            qid,
            sq,
            cq,
            sq_phys,
            cq_phys,
            sq_entries,
            cq_entries,
            sq_tail: 0,
            cq_head: 0,
            phase: 1,
            next_cid: 1,
        })
    }

    /// Take the next command identifier, skipping 0.
    fn take_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        if self.next_cid == 0 {
            self.next_cid = 1;
        }
        cid
    }

    /// Copy a command into the submission ring at the tail.
    fn push_command(&mut self, command: &NvmeCommand) {
        let slot = self.sq_tail as usize;
        unsafe {
            let ring = self.sq.addr() as *mut NvmeCommand;
            write_volatile(ring.add(slot), *command);
        }
        self.sq_tail = (self.sq_tail + 1) % self.sq_entries;
    }

    /// Read the completion entry at the head.
    fn peek_completion(&self) -> NvmeCompletion {
        unsafe {
            let ring = self.cq.addr() as *const NvmeCompletion;
            read_volatile(ring.add(self.cq_head as usize))
        }
    }

    /// Advance the completion head, toggling the phase on wrap.
    fn advance_head(&mut self) {
        self.cq_head += 1;
        if self.cq_head >= self.cq_entries {
            self.cq_head = 0;
            self.phase ^= 1;
        }
    }
}

/// Serialized controller state: the queues and their warning limiters.
struct ControllerInner {
    admin: QueuePair,
    io: Option<QueuePair>,
    mismatch_warning: Cooldown,
    timeout_warning: Cooldown,
}

/// An attached NVMe controller.
pub struct NvmeController {
    /// PCI function the controller lives on.
    pub pci_address: PciAddress,
    /// Mapped BAR0 base.
    mmio_base: u64,
    /// BAR0 size in bytes.
    mmio_size: u64,
    /// Doorbell stride in bytes (`4 << CAP.DSTRD`).
    doorbell_stride: u32,
    /// Decoded capabilities.
    pub caps: Capabilities,
    /// Identify-controller strings.
    pub identity: ControllerIdentity,
    /// Logical block size of namespace 1 (cache for the common case).
    logical_block_size: AtomicU32,
    /// MSI-X vector, when interrupts are configured.
    msix_vector: Option<u8>,
    /// Queues and per-controller serialization.
    inner: Mutex<ControllerInner>,
}

impl NvmeController {
    fn read_reg32(&self, offset: u64) -> u32 {
        unsafe { read_volatile((self.mmio_base + offset) as *const u32) }
    }

    fn write_reg32(&self, offset: u64, value: u32) {
        unsafe { write_volatile((self.mmio_base + offset) as *mut u32, value) }
    }

    fn read_reg64(&self, offset: u64) -> u64 {
        let low = self.read_reg32(offset) as u64;
        let high = self.read_reg32(offset + 4) as u64;
        (high << 32) | low
    }

    fn write_reg64(&self, offset: u64, value: u64) {
        self.write_reg32(offset, value as u32);
        self.write_reg32(offset + 4, (value >> 32) as u32);
    }

    fn write_doorbell(&self, qid: u16, completion: bool, value: u32) {
        let offset =
            regs::DOORBELL_BASE + doorbell_offset(qid, completion, self.doorbell_stride);
        unsafe { write_volatile((self.mmio_base + offset) as *mut u32, value) }
    }

    /// Poll CSTS.RDY for the requested state.
    fn wait_ready(&self, ready: bool) -> bool {
        for _ in 0..READY_TIMEOUT_LOOPS {
            let is_ready = self.read_reg32(regs::CSTS) & csts::RDY != 0;
            if is_ready == ready {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }

    /// The cached logical block size.
    pub fn logical_block_size(&self) -> u32 {
        self.logical_block_size.load(Ordering::Relaxed)
    }

    /// Submit a command on one queue and poll its completion.
    ///
    /// Holds the controller mutex for the duration: at most one command per
    /// controller is in flight. Completions whose command id does not match
    /// emit a rate-limited warning and polling resumes for the right one.
    fn submit_on_queue(
        inner: &mut ControllerInner,
        use_io_queue: bool,
        controller: &NvmeController,
        command: &NvmeCommand,
    ) -> Result<NvmeCompletion, &'static str> {
        let queue = if use_io_queue {
            inner.io.as_mut().ok_or("I/O queue not created")?
        } else {
            &mut inner.admin
        };

        let mut command = *command;
        let cid = queue.take_cid();
        command.set_cid(cid);

        queue.push_command(&command);
        let qid = queue.qid;
        let sq_tail = queue.sq_tail as u32;

        // The ring write must be visible before the doorbell.
        core::sync::atomic::fence(Ordering::SeqCst);
        controller.write_doorbell(qid, false, sq_tail);

        let start = time::system_time_ms();
        let mut loops: u64 = 0;

        loop {
            if time::has_operation_timed_out(start, loops, COMMAND_TIMEOUT_LOOPS, COMMAND_TIMEOUT_MS)
            {
                break;
            }
            loops += 1;

            let entry = queue.peek_completion();
            if entry.phase() != queue.phase {
                core::hint::spin_loop();
                continue;
            }

            queue.advance_head();
            controller.write_doorbell(qid, true, queue.cq_head as u32);

            if entry.sq_id != qid
                && inner_warn(&mut inner.mismatch_warning)
            {
                log::warn!(
                    "nvme: completion for SQID {} on queue {}",
                    { entry.sq_id },
                    qid
                );
            }

            if entry.cid != cid {
                if inner_warn(&mut inner.mismatch_warning) {
                    log::warn!(
                        "nvme: completion cid {:#x} (expected {:#x}), repolling",
                        { entry.cid },
                        cid
                    );
                }
                continue;
            }

            if entry.sq_head >= queue.sq_entries && inner_warn(&mut inner.mismatch_warning) {
                log::warn!("nvme: completion reports invalid SQ head {}", { entry.sq_head });
            }

            return Ok(entry);
        }

        if inner_warn(&mut inner.timeout_warning) {
            log::warn!(
                "nvme: command timeout opcode={:#x} cid={:#x} qid={}",
                command.opcode(),
                cid,
                qid
            );
        }
        // The slot is lost; recovery would need an abort or controller reset.
        Err("command timeout")
    }

    /// Submit an admin command and wait for its completion.
    pub fn submit_admin_command(
        &self,
        command: &NvmeCommand,
    ) -> Result<NvmeCompletion, &'static str> {
        let mut inner = self.inner.lock();
        Self::submit_on_queue(&mut inner, false, self, command)
    }

    /// Submit an I/O command and wait for its completion.
    pub fn submit_io_command(&self, command: &NvmeCommand) -> Result<NvmeCompletion, &'static str> {
        let mut inner = self.inner.lock();
        Self::submit_on_queue(&mut inner, true, self, command)
    }

    /// Issue an IDENTIFY admin command into a caller-provided 4 KiB buffer.
    fn identify(&self, cns_value: u32, nsid: u32, buffer: &AlignedBuffer) -> Result<(), &'static str> {
        let phys = memory::linear_to_physical(buffer.addr()).ok_or("identify buffer unmapped")?;
        if phys % PAGE_SIZE != 0 {
            return Err("identify buffer misaligned");
        }

        let mut command = NvmeCommand::new(admin_op::IDENTIFY);
        command.nsid = nsid;
        command.prp1 = phys;
        command.cdw10 = cns_value;

        let completion = self.submit_admin_command(&command)?;
        if !completion.success() {
            log::warn!(
                "nvme: identify cns={} failed SCT={:#x} SC={:#x}",
                cns_value,
                completion.status_code_type(),
                completion.status_code()
            );
            return Err("identify failed");
        }
        Ok(())
    }

    /// Identify the controller and cache its serial/model/firmware strings.
    pub fn identify_controller(&mut self) -> Result<(), &'static str> {
        let buffer = AlignedBuffer::new(PAGE_SIZE as usize, QUEUE_ALIGNMENT)
            .ok_or("identify buffer allocation failed")?;
        self.identify(cns::CONTROLLER, 0, &buffer)?;

        self.identity =
            parse_identify_controller(buffer.as_slice()).ok_or("identify page too short")?;
        log::debug!(
            "nvme: serial='{}' model='{}' firmware='{}'",
            self.identity.serial,
            self.identity.model,
            self.identity.firmware
        );
        Ok(())
    }

    /// Identify one namespace: `(num_sectors, bytes_per_sector)`.
    pub fn identify_namespace(&self, nsid: u32) -> Result<(u64, u32), &'static str> {
        if nsid == 0 {
            return Err("invalid namespace id");
        }

        let buffer = AlignedBuffer::new(PAGE_SIZE as usize, QUEUE_ALIGNMENT)
            .ok_or("identify buffer allocation failed")?;
        self.identify(cns::NAMESPACE, nsid, &buffer)?;

        let (nsze, bytes_per_sector) = parse_identify_namespace(buffer.as_slice())
            .map_err(|e| {
                log::warn!("nvme: identify namespace {}: {}", nsid, e);
                e
            })?;

        log::debug!(
            "nvme: namespace {} sectors={} bytes_per_sector={}",
            nsid,
            nsze,
            bytes_per_sector
        );
        Ok((nsze, bytes_per_sector))
    }

    /// Identify the active namespace list.
    pub fn identify_namespace_list(&self) -> Result<Vec<u32>, &'static str> {
        let buffer = AlignedBuffer::new(PAGE_SIZE as usize, QUEUE_ALIGNMENT)
            .ok_or("identify buffer allocation failed")?;
        self.identify(cns::NAMESPACE_LIST, 0, &buffer)?;
        Ok(parse_namespace_list(buffer.as_slice()))
    }

    /// Negotiate the number of I/O queues (SET_FEATURES 0x07).
    pub fn set_number_of_queues(&self, queue_count: u16) -> Result<(), &'static str> {
        if queue_count == 0 {
            return Err("invalid queue count");
        }

        let requested = (queue_count - 1) as u32;
        let mut command = NvmeCommand::new(admin_op::SET_FEATURES);
        command.cdw10 = FEATURE_NUMBER_OF_QUEUES;
        command.cdw11 = (requested << 16) | requested;

        let completion = self.submit_admin_command(&command)?;
        if !completion.success() {
            log::warn!(
                "nvme: set number of queues failed SCT={:#x} SC={:#x} DNR={}",
                completion.status_code_type(),
                completion.status_code(),
                completion.dnr()
            );
            return Err("set features failed");
        }

        log::debug!(
            "nvme: queues granted SQ={} CQ={}",
            (completion.result & 0xFFFF) + 1,
            (completion.result >> 16) + 1
        );
        Ok(())
    }

    /// Create the I/O queue pair (qid 1): completion queue first, then the
    /// submission queue bound to it.
    pub fn create_io_queues(&self) -> Result<(), &'static str> {
        let cap_entries = self.caps.max_queue_entries();
        let mut entries = IO_QUEUE_ENTRIES as u32;
        if cap_entries != 0 && entries > cap_entries {
            entries = cap_entries;
        }
        if entries < 2 {
            return Err("controller queue limit too small");
        }

        let queue = QueuePair::allocate(1, entries as u16, entries as u16)?;
        let cq_phys = queue.cq_phys;
        let sq_phys = queue.sq_phys;
        let qid = queue.qid as u32;

        let mut cq_flags = CQ_FLAG_PC;
        let mut interrupt_vector = 0u32;
        if self.msix_vector.is_some() {
            cq_flags |= CQ_FLAG_IEN;
            interrupt_vector = 0;
        }

        let mut command = NvmeCommand::new(admin_op::CREATE_IO_CQ);
        command.prp1 = cq_phys;
        command.cdw10 = qid | ((entries - 1) << 16);
        command.cdw11 = (interrupt_vector & 0xFFFF) | cq_flags;

        let completion = self.submit_admin_command(&command)?;
        if !completion.success() {
            log::warn!(
                "nvme: create CQ failed SCT={:#x} SC={:#x}",
                completion.status_code_type(),
                completion.status_code()
            );
            return Err("create I/O completion queue failed");
        }

        let mut command = NvmeCommand::new(admin_op::CREATE_IO_SQ);
        command.prp1 = sq_phys;
        command.cdw10 = qid | ((entries - 1) << 16);
        command.cdw11 = (qid << 16) | SQ_FLAG_PC;

        let completion = self.submit_admin_command(&command)?;
        if !completion.success() {
            log::warn!(
                "nvme: create SQ failed SCT={:#x} SC={:#x}",
                completion.status_code_type(),
                completion.status_code()
            );
            return Err("create I/O submission queue failed");
        }

        self.inner.lock().io = Some(queue);
        log::debug!("nvme: I/O queue pair ready qid=1 entries={}", entries);
        Ok(())
    }

    /// Submit an I/O flush as a queue sanity check.
    pub fn submit_io_flush(&self, nsid: u32) -> Result<(), &'static str> {
        let mut command = NvmeCommand::new(io_op::FLUSH);
        command.nsid = nsid;
        let completion = self.submit_io_command(&command)?;
        if !completion.success() {
            return Err("flush failed");
        }
        Ok(())
    }

    /// Validate a data buffer for DMA: 4 KiB aligned and physically
    /// contiguous. Returns its physical base.
    fn validate_dma_buffer(linear: u64, transfer_bytes: u64) -> Result<u64, &'static str> {
        if linear % PAGE_SIZE != 0 {
            return Err("buffer not 4 KiB aligned");
        }
        let translate = |addr: u64| memory::linear_to_physical(addr);
        let phys = translate(linear).ok_or("buffer unmapped")?;
        if !memory::is_physically_contiguous(linear, transfer_bytes, &translate) {
            return Err("buffer not physically contiguous");
        }
        Ok(phys)
    }

    /// Build and submit a READ or WRITE for up to two pages of sectors.
    fn transfer_sectors(
        &self,
        opcode: u8,
        nsid: u32,
        lba: u64,
        sector_count: u32,
        buffer_linear: u64,
        buffer_bytes: u64,
    ) -> Result<(), &'static str> {
        if sector_count == 0 || sector_count > 0x1_0000 {
            return Err("invalid sector count");
        }

        let bytes_per_sector = self.logical_block_size() as u64;
        let transfer_bytes = sector_count as u64 * bytes_per_sector;
        if transfer_bytes > buffer_bytes {
            return Err("buffer too small");
        }
        if transfer_bytes > MAX_TRANSFER_BYTES {
            return Err("transfer too large for PRP1/PRP2");
        }

        let phys = Self::validate_dma_buffer(buffer_linear, transfer_bytes)?;
        let (prp1, prp2) = build_prps(phys, transfer_bytes)?;

        let mut command = NvmeCommand::new(opcode);
        command.nsid = nsid;
        command.prp1 = prp1;
        command.prp2 = prp2;
        command.cdw10 = lba as u32;
        command.cdw11 = (lba >> 32) as u32;
        command.cdw12 = (sector_count - 1) & 0xFFFF;

        let completion = self.submit_io_command(&command)?;
        if !completion.success() {
            log::warn!(
                "nvme: {} failed LBA={:#x} SCT={:#x} SC={:#x} DNR={}",
                if opcode == io_op::READ { "read" } else { "write" },
                lba,
                completion.status_code_type(),
                completion.status_code(),
                completion.dnr()
            );
            return Err("I/O command failed");
        }
        Ok(())
    }

    /// Read sectors into a 4 KiB-aligned, physically contiguous buffer.
    pub fn read_sectors(
        &self,
        nsid: u32,
        lba: u64,
        sector_count: u32,
        buffer: &mut [u8],
    ) -> Result<(), &'static str> {
        self.transfer_sectors(
            io_op::READ,
            nsid,
            lba,
            sector_count,
            buffer.as_ptr() as u64,
            buffer.len() as u64,
        )
    }

    /// Write sectors from a 4 KiB-aligned, physically contiguous buffer.
    pub fn write_sectors(
        &self,
        nsid: u32,
        lba: u64,
        sector_count: u32,
        buffer: &[u8],
    ) -> Result<(), &'static str> {
        self.transfer_sectors(
            io_op::WRITE,
            nsid,
            lba,
            sector_count,
            buffer.as_ptr() as u64,
            buffer.len() as u64,
        )
    }

    /// Read LBA 0 once to prove the data path before registering disks.
    pub fn read_test(&self) -> Result<(), &'static str> {
        let bytes_per_sector = self.logical_block_size() as usize;
        let mut buffer = AlignedBuffer::new(bytes_per_sector.max(512), QUEUE_ALIGNMENT)
            .ok_or("read test buffer allocation failed")?;

        let slice_len = buffer.size();
        let slice = &mut buffer.as_mut_slice()[..slice_len];
        self.read_sectors(1, 0, 1, slice)?;

        log::debug!(
            "nvme: read test OK, boot signature {:02x} {:02x}",
            slice[510.min(slice_len - 2)],
            slice[511.min(slice_len - 1)]
        );
        Ok(())
    }

    /// Program MSI-X vector 0 toward the BSP and unmask controller
    /// interrupts.
    ///
    /// The handler is a top half only: completions are polled by the
    /// submitting thread, so the vector simply acknowledges.
    pub fn setup_interrupts(&mut self) -> Result<(), &'static str> {
        let cap_offset = pci::find_capability(self.pci_address, pci::CAP_ID_MSIX);
        if cap_offset == 0 {
            return Err("MSI-X capability not found");
        }

        let control = pci::read_u16(self.pci_address, cap_offset as u16 + 2);
        let table_size = (control & 0x07FF) + 1;
        let table_info = pci::read_u32(self.pci_address, cap_offset as u16 + 4);
        let table_bir = (table_info & 0x7) as u8;
        let table_offset = (table_info & !0x7) as u64;

        if table_bir != 0 {
            log::warn!("nvme: unsupported MSI-X table BIR {}", table_bir);
            return Err("MSI-X table not in BAR0");
        }

        let table_bytes = table_size as u64 * 16;
        if table_offset + table_bytes > self.mmio_size {
            return Err("MSI-X table exceeds BAR0");
        }

        let vector = ioapic::allocate_vector();
        if vector == 0 {
            return Err("no free interrupt vectors");
        }

        let apic_id = apic::id() as u32;
        let message_address = 0xFEE0_0000u32 | (apic_id << 12);

        let entry = (self.mmio_base + table_offset) as *mut u32;
        unsafe {
            write_volatile(entry, message_address);
            write_volatile(entry.add(1), 0);
            write_volatile(entry.add(2), vector as u32);
            write_volatile(entry.add(3), 0);
        }

        // Enable MSI-X (bit 15), clear function mask (bit 14).
        let control = (control & !0x4000) | 0x8000;
        pci::write_u16(self.pci_address, cap_offset as u16 + 2, control);

        // Unmask interrupt vector 0 at the controller.
        self.write_reg32(regs::INTMC, 1);

        self.msix_vector = Some(vector);
        log::debug!("nvme: MSI-X vector {:#x} armed", vector);
        Ok(())
    }
}

fn inner_warn(cooldown: &mut Cooldown) -> bool {
    cooldown.try_arm(time::system_time_ms())
}

/// Attach an NVMe controller found on PCI.
///
/// Runs the admin bring-up sequence: map BAR0, disable, program AQA/ASQ/ACQ,
/// configure CC, enable, identify, negotiate queues, and create the I/O
/// queue pair. Returns the ready controller.
pub fn attach(address: PciAddress) -> Result<Arc<NvmeController>, &'static str> {
    let bar0 = pci::read_memory_bar(address, pci::CFG_BAR0).ok_or("BAR0 is not memory")?;
    let bar_size = pci::bar_size(address, pci::CFG_BAR0);
    if bar0 == 0 || bar_size == 0 {
        return Err("invalid BAR0");
    }

    let mmio_base = memory::map_io(bar0, bar_size);
    if mmio_base == 0 {
        return Err("failed to map BAR0");
    }

    pci::enable_bus_master(address);

    let mut controller = NvmeController {
        pci_address: address,
        mmio_base,
        mmio_size: bar_size,
        doorbell_stride: 4,
        caps: Capabilities::default(),
        identity: ControllerIdentity::default(),
        logical_block_size: AtomicU32::new(512),
        msix_vector: None,
        inner: Mutex::new(ControllerInner {
            admin: QueuePair::allocate(0, ADMIN_QUEUE_ENTRIES, ADMIN_QUEUE_ENTRIES)?,
            io: None,
            mismatch_warning: Cooldown::new(200),
            timeout_warning: Cooldown::new(200),
        }),
    };

    controller.caps = Capabilities::from_raw(controller.read_reg64(regs::CAP));
    controller.doorbell_stride = controller.caps.doorbell_stride();

    let version = controller.read_reg32(regs::VS);
    log::debug!(
        "nvme: controller at {:02x}:{:02x}.{} version {}.{} MQES={} DSTRD={}",
        address.bus,
        address.device,
        address.function,
        version >> 16,
        (version >> 8) & 0xFF,
        controller.caps.mqes,
        controller.caps.dstrd
    );

    // Disable the controller before reprogramming the admin queues.
    let cc_value = controller.read_reg32(regs::CC);
    if cc_value & cc::EN != 0 {
        controller.write_reg32(regs::CC, cc_value & !cc::EN);
        if !controller.wait_ready(false) {
            return Err("controller did not stop");
        }
    }

    // Program the admin queue attributes and ring bases.
    {
        let inner = controller.inner.lock();
        let aqa = ((inner.admin.cq_entries as u32 - 1) << 16) | (inner.admin.sq_entries as u32 - 1);
        controller.write_reg32(regs::AQA, aqa);
        controller.write_reg64(regs::ASQ, inner.admin.sq_phys);
        controller.write_reg64(regs::ACQ, inner.admin.cq_phys);
    }

    // CSS=0 (NVM), MPS=0 (4 KiB), AMS=0, IOSQES=6 (64 B), IOCQES=4 (16 B).
    let cc_value = (0 << cc::CSS_SHIFT)
        | (0 << cc::MPS_SHIFT)
        | (0 << cc::AMS_SHIFT)
        | (0 << cc::SHN_SHIFT)
        | (6 << cc::IOSQES_SHIFT)
        | (4 << cc::IOCQES_SHIFT);
    controller.write_reg32(regs::CC, cc_value);
    controller.write_reg32(regs::CC, cc_value | cc::EN);

    if !controller.wait_ready(true) {
        return Err("controller did not become ready");
    }

    if let Err(error) = controller.identify_controller() {
        log::warn!("nvme: identify controller failed: {}", error);
    }
    if let Ok((_sectors, bytes_per_sector)) = controller.identify_namespace(1) {
        controller
            .logical_block_size
            .store(bytes_per_sector, Ordering::Relaxed);
    }
    if let Err(error) = controller.set_number_of_queues(1) {
        log::warn!("nvme: queue negotiation failed: {}", error);
    }

    if !cfg!(feature = "nvme-polling-only") {
        if let Err(error) = controller.setup_interrupts() {
            log::warn!("nvme: MSI-X setup failed: {}", error);
        }
    }

    controller.create_io_queues()?;

    if let Err(error) = controller.submit_io_flush(1) {
        log::warn!("nvme: I/O sanity flush failed: {}", error);
    }
    if let Err(error) = controller.read_test() {
        log::warn!("nvme: read test failed: {}", error);
    }

    Ok(Arc::new(controller))
}

/// MSI-X top-half for NVMe.
///
/// Completions are polled by the submitting thread; the handler only
/// acknowledges and requests no deferred work.
pub fn interrupt_handler() {
    apic::end_of_interrupt();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_capabilities() {
        // MQES=63, CQR, TO=30, DSTRD=0, MPSMIN=0.
        let raw: u64 = 63 | (1 << 16) | (30 << 24);
        let caps = Capabilities::from_raw(raw);
        assert_eq!(caps.mqes, 63);
        assert!(caps.cqr);
        assert_eq!(caps.timeout, 30);
        assert_eq!(caps.max_queue_entries(), 64);
        assert_eq!(caps.doorbell_stride(), 4);

        let caps = Capabilities::from_raw(2u64 << 32);
        assert_eq!(caps.doorbell_stride(), 16);
    }

    #[test]
    fn doorbell_layout_matches_stride() {
        // Admin SQ tail at 0, admin CQ head at stride.
        assert_eq!(doorbell_offset(0, false, 4), 0);
        assert_eq!(doorbell_offset(0, true, 4), 4);
        // Queue 1 with stride 4: SQ at 8, CQ at 12.
        assert_eq!(doorbell_offset(1, false, 4), 8);
        assert_eq!(doorbell_offset(1, true, 4), 12);
        // Wider stride scales everything.
        assert_eq!(doorbell_offset(1, false, 16), 32);
        assert_eq!(doorbell_offset(1, true, 16), 48);
    }

    #[test]
    fn command_cid_round_trip() {
        let mut command = NvmeCommand::new(admin_op::IDENTIFY);
        command.set_cid(0xBEEF);
        assert_eq!(command.cid(), 0xBEEF);
        assert_eq!(command.opcode(), admin_op::IDENTIFY);

        command.set_cid(0x0001);
        assert_eq!(command.cid(), 0x0001);
        assert_eq!(command.opcode(), admin_op::IDENTIFY);
    }

    #[test]
    fn completion_status_decoding() {
        // Phase 1, SC=0, SCT=0: success.
        let completion = NvmeCompletion {
            status: 0x0001,
            ..NvmeCompletion::default()
        };
        assert_eq!(completion.phase(), 1);
        assert!(completion.success());

        // SC=2 (invalid field), SCT=0, DNR set.
        let completion = NvmeCompletion {
            status: (2 << 1) | (1 << 15),
            ..NvmeCompletion::default()
        };
        assert_eq!(completion.status_code(), 2);
        assert_eq!(completion.status_code_type(), 0);
        assert!(completion.dnr());
        assert!(!completion.success());

        // SCT=1 (command specific).
        let completion = NvmeCompletion {
            status: 1 << 9,
            ..NvmeCompletion::default()
        };
        assert_eq!(completion.status_code_type(), 1);
        assert!(!completion.success());
    }

    #[test]
    fn prp_construction() {
        // One page: PRP2 stays clear.
        assert_eq!(build_prps(0x10000, 4096), Ok((0x10000, 0)));
        assert_eq!(build_prps(0x10000, 512), Ok((0x10000, 0)));
        // Two pages: PRP2 names the second page.
        assert_eq!(build_prps(0x10000, 8192), Ok((0x10000, 0x11000)));
        assert_eq!(build_prps(0x10000, 4097), Ok((0x10000, 0x11000)));
        // Larger transfers need a PRP list.
        assert!(build_prps(0x10000, 8193).is_err());
        // Misaligned base.
        assert!(build_prps(0x10200, 4096).is_err());
    }

    #[test]
    fn identify_string_trimming() {
        assert_eq!(trim_identify_string(b"QEMU NVMe Ctrl                          "), "QEMU NVMe Ctrl");
        assert_eq!(trim_identify_string(b"        "), "");
        assert_eq!(trim_identify_string(b"abc"), "abc");
    }

    #[test]
    fn parses_identify_controller_page() {
        let mut page = [0u8; 4096];
        page[4..24].copy_from_slice(b"SN123               ");
        page[24..64].copy_from_slice(b"Some NVMe Model                         ");
        page[64..72].copy_from_slice(b"1.0     ");

        let identity = parse_identify_controller(&page).unwrap();
        assert_eq!(identity.serial, "SN123");
        assert_eq!(identity.model, "Some NVMe Model");
        assert_eq!(identity.firmware, "1.0");
    }

    #[test]
    fn parses_identify_namespace_page() {
        let mut page = [0u8; 4096];
        page[0..8].copy_from_slice(&0x100000u64.to_le_bytes());
        page[26] = 0; // FLBAS: format 0
        // LBA format 0: LBADS = 9 (512-byte sectors).
        page[128..132].copy_from_slice(&(9u32 << 16).to_le_bytes());

        assert_eq!(parse_identify_namespace(&page), Ok((0x100000, 512)));

        // Format 1 selected, LBADS = 12 (4 KiB).
        page[26] = 1;
        page[132..136].copy_from_slice(&(12u32 << 16).to_le_bytes());
        assert_eq!(parse_identify_namespace(&page), Ok((0x100000, 4096)));

        // LBADS out of range is rejected.
        page[132..136].copy_from_slice(&(17u32 << 16).to_le_bytes());
        assert!(parse_identify_namespace(&page).is_err());
    }

    #[test]
    fn parses_namespace_list() {
        let mut page = [0u8; 4096];
        page[0..4].copy_from_slice(&1u32.to_le_bytes());
        page[4..8].copy_from_slice(&2u32.to_le_bytes());
        page[8..12].copy_from_slice(&5u32.to_le_bytes());
        // Zero terminator, then garbage that must be ignored.
        page[16..20].copy_from_slice(&9u32.to_le_bytes());

        assert_eq!(parse_namespace_list(&page), alloc::vec![1, 2, 5]);
    }

    #[test]
    fn cc_register_layout() {
        let value = (6u32 << cc::IOSQES_SHIFT) | (4u32 << cc::IOCQES_SHIFT) | cc::EN;
        assert_eq!(value & 1, 1);
        assert_eq!((value >> 16) & 0xF, 6);
        assert_eq!((value >> 20) & 0xF, 4);
    }
}
