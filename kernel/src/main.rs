//! Helios kernel entry point.

#![no_std]
#![no_main]

extern crate alloc;

use bootloader_api::config::Mapping;
use bootloader_api::{entry_point, BootInfo, BootloaderConfig};

use helios_kernel::interrupts::controller::{self, Mode};
use helios_kernel::{allocator, drivers, hw, interrupts, logger, memory, serial, serial_println, time};

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    if cfg!(feature = "serial-console") {
        serial::init();
    }
    serial_println!("helios: booting");

    logger::init(log::LevelFilter::Debug);

    let phys_mem_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("physical memory offset not provided");
    let rsdp = boot_info.rsdp_addr.into_option();
    let memory_regions = &boot_info.memory_regions;

    let mut mapper = unsafe { memory::init(phys_mem_offset) };
    let mut frame_allocator = unsafe { memory::BootInfoFrameAllocator::new(memory_regions) };
    allocator::init_heap(&mut mapper, &mut frame_allocator).expect("heap initialization failed");

    // Rate limiters everywhere key off the kernel tick.
    storage::set_clock_ms(time::system_time_ms);

    // Platform tables first; the interrupt controller needs the MADT.
    if !hw::acpi::initialize(rsdp) {
        log::warn!("helios: ACPI unavailable, staying on legacy interrupt routing");
    }

    let mode = if cfg!(feature = "force-pic") {
        Mode::ForcePic
    } else {
        Mode::Auto
    };
    if !controller::initialize(mode) {
        panic!("interrupt controller initialization failed");
    }

    // Storage: NVMe controllers, namespaces, partitions, filesystems.
    drivers::storage::init();

    for (volume, fs_type) in storage::vfs::list_mounts() {
        log::info!("helios: mounted {} ({})", volume, fs_type);
    }

    interrupts::enable();
    log::info!("helios: boot complete");

    interrupts::hlt_loop();
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("KERNEL PANIC: {}", info);
    interrupts::hlt_loop();
}
