// SPDX-License-Identifier: GPL-3.0-only

//! Collaborator contracts
//!
//! Layouts reach every device through these traits. [`crate::host::System`]
//! implements them on the real machine; tests substitute an in-memory host.

use std::path::Path;

use storage_sys::Result;
use storage_sys::tools::LvSize;
use storage_types::{BcacheRole, DiskKind, PartitionSpec, PartitionTableType};

pub trait DiskProbe {
    fn disk_kind(&self, disk: &str) -> Result<DiskKind>;

    fn is_fixed_disk(&self, disk: &str) -> Result<bool>;

    fn fixed_disks(&self) -> Result<Vec<String>>;

    /// Partitions of `disk` in partition-number order.
    fn partitions(&self, disk: &str) -> Result<Vec<String>>;

    fn size_bytes(&self, device: &str) -> Result<u64>;

    /// Filesystem type, empty when unrecognised.
    fn filesystem_type(&self, device: &str) -> Result<String>;

    fn filesystem_uuid(&self, device: &str) -> Result<Option<String>>;

    fn partition_table_type(&self, disk: &str) -> Result<Option<PartitionTableType>>;

    fn is_esp_partition(&self, partition: &str) -> Result<bool>;

    /// `(vg, lv)` when `device` is a logical volume.
    fn lvm_info(&self, device: &str) -> Result<Option<(String, String)>>;

    /// Slaves of a composed bcache device, backing device last.
    fn bcache_slaves(&self, bcache_dev: &str) -> Result<Vec<String>>;

    fn find_bcache_by_backing(&self, partition: &str) -> Result<Option<String>>;

    fn is_bcache_device(&self, partition: &str, role: BcacheRole) -> Result<bool>;
}

pub trait Partitioner {
    /// Replace the table of `disk` and return the new partition paths in order.
    fn initialize_disk(
        &self,
        disk: &str,
        table: PartitionTableType,
        specs: &[PartitionSpec],
    ) -> Result<Vec<String>>;
}

pub trait BcacheOps {
    /// Format and register a backing device. Returns the composed `/dev/bcacheN`.
    fn make_and_register_backing(&self, partition: &str) -> Result<String>;

    fn make_and_register_cache(&self, partition: &str) -> Result<()>;

    fn attach_cache_device(&self, bcache_devs: &[String], cache_partition: &str) -> Result<()>;

    fn unregister_cache_device(&self, cache_partition: &str) -> Result<()>;

    fn stop_backing_device(&self, bcache_dev: &str) -> Result<()>;

    fn scan_and_register_all(&self, candidates: &[String]) -> Result<()>;
}

pub trait BcachefsOps {
    fn create_bcachefs(
        &self,
        cache_devices: &[String],
        backing_devices: &[String],
        metadata_replicas: u32,
        data_replicas: u32,
    ) -> Result<()>;

    fn bcachefs_add_device(&self, partition: &str, mountpoint: &Path, label: &str) -> Result<()>;

    fn bcachefs_remove_device(&self, partition: &str) -> Result<()>;

    /// Set a runtime option of the mounted filesystem `member` belongs to.
    fn bcachefs_set_option(&self, member: &str, option: &str, value: &str) -> Result<()>;

    /// Labels of every member of the mounted filesystem `member` belongs to.
    fn bcachefs_labels(&self, member: &str) -> Result<Vec<String>>;
}

pub trait VolumeManager {
    fn add_pv_to_vg(&self, device: &str, vg: &str, may_create: bool) -> Result<()>;

    fn create_lv(&self, vg: &str, lv: &str, size: LvSize) -> Result<()>;

    fn activate_all(&self) -> Result<()>;

    fn deactivate_vg(&self, vg: &str) -> Result<()>;

    /// Returns false when there was nothing to grow into.
    fn auto_extend_lv(&self, lv_path: &str) -> Result<bool>;

    /// Raw `(status, output)` of the evacuation.
    fn evacuate_pv(&self, device: &str) -> Result<(i32, String)>;

    fn remove_pv_from_vg(&self, vg: &str, device: &str) -> Result<()>;

    fn vg_pv_list(&self, vg: &str) -> Result<Vec<String>>;
}

pub trait MountOps {
    fn mount(
        &self,
        source: &str,
        dir: &Path,
        fs_type: Option<&str>,
        options: Option<&str>,
    ) -> Result<()>;

    fn umount(&self, dir: &Path) -> Result<()>;

    fn remount(&self, dir: &Path, options: &str) -> Result<()>;

    fn is_writable(&self, dir: &Path) -> Result<bool>;
}

pub trait SystemOps {
    fn swap_in_use(&self, device: &str) -> Result<bool>;

    fn physical_memory_gib(&self) -> Result<u64>;

    fn make_filesystem(&self, device: &str, fs_type: &str) -> Result<()>;

    fn resize_filesystem(&self, device: &str) -> Result<()>;

    fn sync_esp(&self, source: &str, dest: &str) -> Result<()>;
}

/// Everything a layout needs from the machine.
pub trait Host:
    DiskProbe + Partitioner + BcacheOps + BcachefsOps + VolumeManager + MountOps + SystemOps
{
}

impl<T> Host for T where
    T: DiskProbe + Partitioner + BcacheOps + BcachefsOps + VolumeManager + MountOps + SystemOps
{
}
