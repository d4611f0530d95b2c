//! Storage device drivers and the disk registry.
//!
//! Disks register here by name; the mount flow scans each new disk for
//! partitions and hands NTFS partitions to the VFS.

pub mod nvme;
pub mod nvme_disk;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use lazy_static::lazy_static;
use spin::RwLock;

use storage::driver::{BlockDevice, PartitionDevice};
use storage::fs::ntfs::NtfsFilesystem;
use storage::fs::FilesystemType;
use storage::{MountFlags, StorageError};

lazy_static! {
    /// Global disk registry, keyed by device name.
    static ref DISKS: RwLock<HashMap<String, Arc<dyn BlockDevice>>> = RwLock::new(HashMap::new());
}

/// Register a disk under the name its driver chose.
///
/// Duplicate names are rejected. Returns the registered name.
pub fn register_disk(disk: Arc<dyn BlockDevice>) -> Result<String, StorageError> {
    let name = disk.info().name;

    let mut disks = DISKS.write();
    if disks.contains_key(&name) {
        return Err(StorageError::AlreadyExists);
    }
    disks.insert(name.clone(), disk);
    Ok(name)
}

/// Look up a disk by name.
pub fn find_disk(name: &str) -> Option<Arc<dyn BlockDevice>> {
    DISKS.read().get(name).cloned()
}

/// List registered disk names.
pub fn list_disks() -> Vec<String> {
    DISKS.read().keys().cloned().collect()
}

/// Probe PCI for NVMe controllers and bring each one up.
pub fn probe_nvme() -> usize {
    let devices = crate::hw::pci::find_devices(nvme::PCI_CLASS, nvme::PCI_SUBCLASS, nvme::PCI_PROG_IF);
    log::debug!("storage: found {} NVMe controller(s)", devices.len());

    let mut attached = 0;
    for (index, device) in devices.iter().enumerate() {
        match nvme::attach(device.address) {
            Ok(controller) => {
                let registered = nvme_disk::register_namespaces(&controller, index);
                if registered > 0 {
                    attached += 1;
                }
            }
            Err(error) => {
                log::warn!(
                    "storage: NVMe attach failed at {:02x}:{:02x}.{}: {}",
                    device.address.bus,
                    device.address.device,
                    device.address.function,
                    error
                );
            }
        }
    }

    attached
}

/// Scan a disk for partitions and mount every NTFS filesystem found.
///
/// Mounted volumes are named `<disk>p<index>`. Returns the number of mounts.
pub fn mount_disk_partitions(name: &str) -> Result<usize, StorageError> {
    let disk = find_disk(name).ok_or(StorageError::DeviceNotFound)?;

    let partitions = storage::partition::scan_partitions(disk.as_ref())?;
    log::debug!("storage: {} has {} partition(s)", name, partitions.len());

    let mut mounted = 0;
    for partition in &partitions {
        let fs_type = match storage::fs::detect_filesystem(disk.as_ref(), partition.start_lba) {
            Ok(fs_type) => fs_type,
            Err(_) => continue,
        };
        if fs_type != FilesystemType::Ntfs {
            continue;
        }

        let volume_name = alloc::format!("{}p{}", name, partition.index + 1);

        // Expose the partition as a storage unit of its own alongside the
        // filesystem mount.
        let view = Arc::new(PartitionDevice::new(
            disk.clone(),
            volume_name.clone(),
            partition.start_lba,
            partition.num_sectors,
        ));
        let _ = register_disk(view);

        match NtfsFilesystem::mount(disk.clone(), partition.start_lba, partition.num_sectors) {
            Ok(filesystem) => {
                if let Err(error) =
                    storage::vfs::mount(&volume_name, filesystem, MountFlags::READ_ONLY)
                {
                    log::warn!("storage: mount of {} failed: {:?}", volume_name, error);
                    continue;
                }
                mounted += 1;
            }
            Err(error) => {
                log::warn!("storage: NTFS mount of {} failed: {:?}", volume_name, error);
            }
        }
    }

    Ok(mounted)
}

/// Probe controllers, register disks, and mount their partitions.
pub fn init() {
    probe_nvme();

    for name in list_disks() {
        if let Err(error) = mount_disk_partitions(&name) {
            log::warn!("storage: partition scan of {} failed: {:?}", name, error);
        }
    }
}
