// SPDX-License-Identifier: GPL-3.0-only

//! The real machine behind the collaborator contracts

use std::path::Path;
use std::time::Duration;

use storage_sys::codec::{gpt, is_bcache_device};
use storage_sys::tools::{BcacheControl, BcacheFormat, BcachefsControl, LvSize, bcachefs, lvm};
use storage_sys::{DeviceProbe, Result, SysError, esp, exec, mount, planner, swap};
use storage_types::{
    BcacheRole, DiskKind, FS_TYPE_EXT4, PartitionSpec, PartitionTableType, disk_to_partition,
};

use crate::config::LayoutConfig;
use crate::contracts::{
    BcacheOps, BcachefsOps, DiskProbe, MountOps, Partitioner, SystemOps, VolumeManager,
};

/// How long the kernel gets to compose `/dev/bcacheN` after registration.
const BCACHE_COMPOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct System {
    probe: DeviceProbe,
    bcache: BcacheControl,
    bcachefs: BcachefsControl,
    format: BcacheFormat,
    settle: Duration,
}

impl System {
    pub fn new(config: &LayoutConfig) -> Self {
        exec::set_signal_grace(config.signal_grace());
        Self {
            probe: DeviceProbe::default(),
            bcache: BcacheControl::default(),
            bcachefs: BcachefsControl::default(),
            format: config.bcache_format(),
            settle: config.settle_delay(),
        }
    }

    fn bcachefs_uuid(&self, member: &str) -> Result<String> {
        self.probe
            .filesystem_uuid(member)?
            .ok_or_else(|| SysError::Precondition(format!("{member} carries no bcachefs uuid")))
    }
}

impl DiskProbe for System {
    fn disk_kind(&self, disk: &str) -> Result<DiskKind> {
        self.probe.disk_kind(disk)
    }

    fn is_fixed_disk(&self, disk: &str) -> Result<bool> {
        self.probe.is_fixed_disk(disk)
    }

    fn fixed_disks(&self) -> Result<Vec<String>> {
        self.probe.fixed_disks()
    }

    fn partitions(&self, disk: &str) -> Result<Vec<String>> {
        self.probe.partitions(disk)
    }

    fn size_bytes(&self, device: &str) -> Result<u64> {
        self.probe.size_bytes(device)
    }

    fn filesystem_type(&self, device: &str) -> Result<String> {
        self.probe.filesystem_type(device)
    }

    fn filesystem_uuid(&self, device: &str) -> Result<Option<String>> {
        self.probe.filesystem_uuid(device)
    }

    fn partition_table_type(&self, disk: &str) -> Result<Option<PartitionTableType>> {
        self.probe.partition_table_type(disk)
    }

    fn is_esp_partition(&self, partition: &str) -> Result<bool> {
        gpt::is_esp_partition(partition)
    }

    fn lvm_info(&self, device: &str) -> Result<Option<(String, String)>> {
        self.probe.lvm_info(device)
    }

    fn bcache_slaves(&self, bcache_dev: &str) -> Result<Vec<String>> {
        self.probe.bcache_slaves(bcache_dev)
    }

    fn find_bcache_by_backing(&self, partition: &str) -> Result<Option<String>> {
        self.probe.find_bcache_by_backing(partition)
    }

    fn is_bcache_device(&self, partition: &str, role: BcacheRole) -> Result<bool> {
        is_bcache_device(Path::new(partition), role)
    }
}

impl Partitioner for System {
    fn initialize_disk(
        &self,
        disk: &str,
        table: PartitionTableType,
        specs: &[PartitionSpec],
    ) -> Result<Vec<String>> {
        let plan = planner::initialize_disk(Path::new(disk), table, specs, self.settle)?;
        plan.partitions
            .iter()
            .map(|part| disk_to_partition(disk, part.number).map_err(SysError::from))
            .collect()
    }
}

impl BcacheOps for System {
    fn make_and_register_backing(&self, partition: &str) -> Result<String> {
        self.bcache.make_and_register_backing(partition, self.format)?;
        self.bcache.wait_for_bcache(partition, BCACHE_COMPOSE_TIMEOUT)
    }

    fn make_and_register_cache(&self, partition: &str) -> Result<()> {
        self.bcache.make_and_register_cache(partition, self.format)?;
        Ok(())
    }

    fn attach_cache_device(&self, bcache_devs: &[String], cache_partition: &str) -> Result<()> {
        self.bcache.attach_cache_device(bcache_devs, cache_partition)
    }

    fn unregister_cache_device(&self, cache_partition: &str) -> Result<()> {
        self.bcache.unregister_cache_device(cache_partition)
    }

    fn stop_backing_device(&self, bcache_dev: &str) -> Result<()> {
        self.bcache.stop_backing_device(bcache_dev)
    }

    fn scan_and_register_all(&self, candidates: &[String]) -> Result<()> {
        self.bcache.scan_and_register_all(candidates)?;
        Ok(())
    }
}

impl BcachefsOps for System {
    fn create_bcachefs(
        &self,
        cache_devices: &[String],
        backing_devices: &[String],
        metadata_replicas: u32,
        data_replicas: u32,
    ) -> Result<()> {
        bcachefs::create_filesystem(cache_devices, backing_devices, metadata_replicas, data_replicas)
    }

    fn bcachefs_add_device(&self, partition: &str, mountpoint: &Path, label: &str) -> Result<()> {
        bcachefs::add_device(partition, &mountpoint.to_string_lossy(), label)
    }

    fn bcachefs_remove_device(&self, partition: &str) -> Result<()> {
        bcachefs::remove_device(partition)
    }

    fn bcachefs_set_option(&self, member: &str, option: &str, value: &str) -> Result<()> {
        self.bcachefs.set_option(&self.bcachefs_uuid(member)?, option, value)
    }

    fn bcachefs_labels(&self, member: &str) -> Result<Vec<String>> {
        self.bcachefs.member_labels(&self.bcachefs_uuid(member)?)
    }
}

impl VolumeManager for System {
    fn add_pv_to_vg(&self, device: &str, vg: &str, may_create: bool) -> Result<()> {
        lvm::add_pv_to_vg(device, vg, may_create)
    }

    fn create_lv(&self, vg: &str, lv: &str, size: LvSize) -> Result<()> {
        lvm::create_lv(vg, lv, size)
    }

    fn activate_all(&self) -> Result<()> {
        lvm::activate_all()
    }

    fn deactivate_vg(&self, vg: &str) -> Result<()> {
        lvm::deactivate_vg(vg)
    }

    fn auto_extend_lv(&self, lv_path: &str) -> Result<bool> {
        lvm::auto_extend_lv(lv_path)
    }

    fn evacuate_pv(&self, device: &str) -> Result<(i32, String)> {
        lvm::evacuate_pv(device)
    }

    fn remove_pv_from_vg(&self, vg: &str, device: &str) -> Result<()> {
        lvm::remove_pv_from_vg(vg, device)
    }

    fn vg_pv_list(&self, vg: &str) -> Result<Vec<String>> {
        lvm::vg_pv_list(vg)
    }
}

impl MountOps for System {
    fn mount(
        &self,
        source: &str,
        dir: &Path,
        fs_type: Option<&str>,
        options: Option<&str>,
    ) -> Result<()> {
        mount::mount(source, dir, fs_type, options)
    }

    fn umount(&self, dir: &Path) -> Result<()> {
        mount::umount(dir)
    }

    fn remount(&self, dir: &Path, options: &str) -> Result<()> {
        mount::remount(dir, options)
    }

    fn is_writable(&self, dir: &Path) -> Result<bool> {
        mount::is_writable(dir)
    }
}

impl SystemOps for System {
    fn swap_in_use(&self, device: &str) -> Result<bool> {
        swap::swap_in_use(device)
    }

    fn physical_memory_gib(&self) -> Result<u64> {
        swap::physical_memory_gib()
    }

    fn make_filesystem(&self, device: &str, fs_type: &str) -> Result<()> {
        if fs_type != FS_TYPE_EXT4 {
            return Err(SysError::Precondition(format!(
                "unsupported root filesystem {fs_type}"
            )));
        }
        tracing::info!("formatting {device} as {fs_type}");
        exec::run("mkfs.ext4", &["-F", device])?;
        Ok(())
    }

    fn resize_filesystem(&self, device: &str) -> Result<()> {
        exec::run("resize2fs", &[device])?;
        Ok(())
    }

    fn sync_esp(&self, source: &str, dest: &str) -> Result<()> {
        esp::sync_esp(Path::new(source), Path::new(dest))?;
        Ok(())
    }
}
