// SPDX-License-Identifier: GPL-3.0-only

//! In-memory host for layout tests
//!
//! Devices are plain strings. Every mutating call appends a line to the
//! ledger so tests can assert on ordering.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use storage_sys::tools::LvSize;
use storage_sys::{Result, SysError};
use storage_types::{
    BcacheRole, DiskKind, FS_TYPE_BCACHEFS, FS_TYPE_SWAP, FS_TYPE_VFAT, GIB, PartitionRole,
    PartitionSize, PartitionSpec, PartitionTableType, disk_to_partition,
};

use crate::contracts::{
    BcacheOps, BcachefsOps, DiskProbe, MountOps, Partitioner, SystemOps, VolumeManager,
};

pub const FS_UUID: &str = "5d4c0f6e-37a1-4c32-9a57-2f0b8c1d9e44";

#[derive(Debug, Default)]
pub struct State {
    pub kinds: HashMap<String, DiskKind>,
    pub fixed: Vec<String>,
    pub partitions: HashMap<String, Vec<String>>,
    pub sizes: HashMap<String, u64>,
    pub fs_types: HashMap<String, String>,
    pub fs_uuids: HashMap<String, String>,
    pub esps: HashSet<String>,
    pub fs_labels: HashMap<String, String>,
    pub fs_options: HashMap<String, String>,
    pub mbr_disks: HashSet<String>,
    pub lvs: HashMap<String, (String, String)>,
    /// Composed devices the kernel currently holds.
    pub slaves: HashMap<String, Vec<String>>,
    /// Stopped devices whose superblocks stay on disk until rescanned.
    pub dormant: HashMap<String, Vec<String>>,
    pub vg_pvs: HashMap<String, Vec<String>>,
    pub active_swaps: HashSet<String>,
    pub failing_mounts: HashSet<String>,
    pub writable: HashSet<String>,
    pub next_bcache: usize,
    pub memory_gib: u64,
    pub pvmove_status: i32,
    pub ledger: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeHost {
    pub state: RefCell<State>,
}

impl FakeHost {
    pub fn new() -> Self {
        let host = Self::default();
        {
            let mut state = host.state.borrow_mut();
            state.memory_gib = 2;
            state.pvmove_status = 5;
        }
        host
    }

    /// Add raw fixed disks, SSDs first.
    pub fn with_disks(ssds: &[&str], hdds: &[&str]) -> Self {
        let host = Self::new();
        {
            let mut state = host.state.borrow_mut();
            for (disk, kind) in ssds
                .iter()
                .map(|d| (d, DiskKind::Ssd))
                .chain(hdds.iter().map(|d| (d, DiskKind::Hdd)))
            {
                state.kinds.insert(disk.to_string(), kind);
                state.fixed.push(disk.to_string());
            }
        }
        host
    }

    pub fn ledger(&self) -> Vec<String> {
        self.state.borrow().ledger.clone()
    }

    pub fn clear_ledger(&self) {
        self.state.borrow_mut().ledger.clear();
    }

    /// Ledger lines starting with any of `prefixes`, in call order.
    pub fn calls(&self, prefixes: &[&str]) -> Vec<String> {
        self.ledger()
            .into_iter()
            .filter(|line| prefixes.iter().any(|p| line.starts_with(p)))
            .collect()
    }

    fn record(&self, line: String) {
        self.state.borrow_mut().ledger.push(line);
    }
}

impl DiskProbe for FakeHost {
    fn disk_kind(&self, disk: &str) -> Result<DiskKind> {
        self.state
            .borrow()
            .kinds
            .get(disk)
            .copied()
            .ok_or_else(|| SysError::DeviceNotFound(disk.to_string()))
    }

    fn is_fixed_disk(&self, disk: &str) -> Result<bool> {
        Ok(self.state.borrow().fixed.iter().any(|d| d == disk))
    }

    fn fixed_disks(&self) -> Result<Vec<String>> {
        Ok(self.state.borrow().fixed.clone())
    }

    fn partitions(&self, disk: &str) -> Result<Vec<String>> {
        Ok(self.state.borrow().partitions.get(disk).cloned().unwrap_or_default())
    }

    fn size_bytes(&self, device: &str) -> Result<u64> {
        self.state
            .borrow()
            .sizes
            .get(device)
            .copied()
            .ok_or_else(|| SysError::DeviceNotFound(device.to_string()))
    }

    fn filesystem_type(&self, device: &str) -> Result<String> {
        Ok(self.state.borrow().fs_types.get(device).cloned().unwrap_or_default())
    }

    fn filesystem_uuid(&self, device: &str) -> Result<Option<String>> {
        Ok(self.state.borrow().fs_uuids.get(device).cloned())
    }

    fn partition_table_type(&self, disk: &str) -> Result<Option<PartitionTableType>> {
        let state = self.state.borrow();
        if state.mbr_disks.contains(disk) {
            return Ok(Some(PartitionTableType::Mbr));
        }
        Ok(state.partitions.contains_key(disk).then_some(PartitionTableType::Gpt))
    }

    fn is_esp_partition(&self, partition: &str) -> Result<bool> {
        Ok(self.state.borrow().esps.contains(partition))
    }

    fn lvm_info(&self, device: &str) -> Result<Option<(String, String)>> {
        Ok(self.state.borrow().lvs.get(device).cloned())
    }

    fn bcache_slaves(&self, bcache_dev: &str) -> Result<Vec<String>> {
        self.state
            .borrow()
            .slaves
            .get(bcache_dev)
            .cloned()
            .ok_or_else(|| SysError::DeviceNotFound(bcache_dev.to_string()))
    }

    fn find_bcache_by_backing(&self, partition: &str) -> Result<Option<String>> {
        let state = self.state.borrow();
        Ok(state
            .slaves
            .iter()
            .find(|(_, slaves)| slaves.last().is_some_and(|backing| backing == partition))
            .map(|(dev, _)| dev.clone()))
    }

    fn is_bcache_device(&self, partition: &str, role: BcacheRole) -> Result<bool> {
        let state = self.state.borrow();
        Ok(state.slaves.values().chain(state.dormant.values()).any(|slaves| match role {
            BcacheRole::Backing => slaves.last().is_some_and(|p| p == partition),
            BcacheRole::Cache => slaves.len() > 1 && slaves[0] == partition,
        }))
    }
}

impl Partitioner for FakeHost {
    fn initialize_disk(
        &self,
        disk: &str,
        table: PartitionTableType,
        specs: &[PartitionSpec],
    ) -> Result<Vec<String>> {
        self.record(format!("initialize {disk} {table:?} {}", specs.len()));
        let mut state = self.state.borrow_mut();
        let mut partitions = Vec::new();
        for (i, spec) in specs.iter().enumerate() {
            let partition = disk_to_partition(disk, i as u32 + 1)?;
            let size = match spec.size {
                PartitionSize::Fixed(bytes) => bytes,
                PartitionSize::Remaining => 100 * GIB,
            };
            state.sizes.insert(partition.clone(), size);
            state.fs_types.remove(&partition);
            state.fs_uuids.remove(&partition);
            state.fs_labels.remove(&partition);
            match spec.role {
                PartitionRole::Esp => {
                    state.esps.insert(partition.clone());
                    state.fs_types.insert(partition.clone(), FS_TYPE_VFAT.to_string());
                }
                PartitionRole::Swap => {
                    state.fs_types.insert(partition.clone(), FS_TYPE_SWAP.to_string());
                }
                _ => {}
            }
            partitions.push(partition);
        }
        state
            .dormant
            .retain(|_, slaves| !slaves.iter().any(|p| partitions.contains(p)));
        state.partitions.insert(disk.to_string(), partitions.clone());
        Ok(partitions)
    }
}

impl BcacheOps for FakeHost {
    fn make_and_register_backing(&self, partition: &str) -> Result<String> {
        self.record(format!("make-backing {partition}"));
        let mut state = self.state.borrow_mut();
        let dev = format!("/dev/bcache{}", state.next_bcache);
        state.next_bcache += 1;
        state.slaves.insert(dev.clone(), vec![partition.to_string()]);
        Ok(dev)
    }

    fn make_and_register_cache(&self, partition: &str) -> Result<()> {
        self.record(format!("make-cache {partition}"));
        Ok(())
    }

    fn attach_cache_device(&self, bcache_devs: &[String], cache_partition: &str) -> Result<()> {
        self.record(format!("attach {cache_partition} {}", bcache_devs.join(",")));
        let mut state = self.state.borrow_mut();
        for dev in bcache_devs {
            let slaves = state
                .slaves
                .get_mut(dev)
                .ok_or_else(|| SysError::DeviceNotFound(dev.clone()))?;
            slaves.insert(0, cache_partition.to_string());
        }
        Ok(())
    }

    fn unregister_cache_device(&self, cache_partition: &str) -> Result<()> {
        self.record(format!("unregister-cache {cache_partition}"));
        for slaves in self.state.borrow_mut().slaves.values_mut() {
            slaves.retain(|p| p != cache_partition);
        }
        Ok(())
    }

    fn stop_backing_device(&self, bcache_dev: &str) -> Result<()> {
        self.record(format!("stop {bcache_dev}"));
        let mut state = self.state.borrow_mut();
        if let Some(slaves) = state.slaves.remove(bcache_dev) {
            state.dormant.insert(bcache_dev.to_string(), slaves);
        }
        Ok(())
    }

    fn scan_and_register_all(&self, candidates: &[String]) -> Result<()> {
        self.record(format!("register-all {}", candidates.len()));
        let mut state = self.state.borrow_mut();
        let composed: Vec<String> = state
            .dormant
            .iter()
            .filter(|(_, slaves)| slaves.last().is_some_and(|backing| candidates.contains(backing)))
            .map(|(dev, _)| dev.clone())
            .collect();
        for dev in composed {
            if let Some(slaves) = state.dormant.remove(&dev) {
                state.slaves.insert(dev, slaves);
            }
        }
        Ok(())
    }
}

impl BcachefsOps for FakeHost {
    fn create_bcachefs(
        &self,
        cache_devices: &[String],
        backing_devices: &[String],
        metadata_replicas: u32,
        data_replicas: u32,
    ) -> Result<()> {
        self.record(format!(
            "bcachefs-format {}|{} {metadata_replicas}/{data_replicas}",
            cache_devices.join(","),
            backing_devices.join(",")
        ));
        let mut state = self.state.borrow_mut();
        let labelled = cache_devices
            .iter()
            .enumerate()
            .map(|(i, dev)| (dev, format!("ssd.{}", i + 1)))
            .chain(backing_devices.iter().enumerate().map(|(i, dev)| (dev, format!("hdd.{}", i + 1))));
        for (dev, label) in labelled {
            state.fs_types.insert(dev.clone(), FS_TYPE_BCACHEFS.to_string());
            state.fs_uuids.insert(dev.clone(), FS_UUID.to_string());
            state.fs_labels.insert(dev.clone(), label);
        }
        if !cache_devices.is_empty() {
            state.fs_options.insert("foreground_target".to_string(), "ssd".to_string());
            state.fs_options.insert("promote_target".to_string(), "ssd".to_string());
        }
        Ok(())
    }

    fn bcachefs_add_device(&self, partition: &str, mountpoint: &Path, label: &str) -> Result<()> {
        self.record(format!("bcachefs-add {partition} {} {label}", mountpoint.display()));
        let mut state = self.state.borrow_mut();
        state.fs_types.insert(partition.to_string(), FS_TYPE_BCACHEFS.to_string());
        state.fs_uuids.insert(partition.to_string(), FS_UUID.to_string());
        state.fs_labels.insert(partition.to_string(), label.to_string());
        Ok(())
    }

    fn bcachefs_remove_device(&self, partition: &str) -> Result<()> {
        self.record(format!("bcachefs-remove {partition}"));
        let mut state = self.state.borrow_mut();
        state.fs_types.remove(partition);
        state.fs_uuids.remove(partition);
        state.fs_labels.remove(partition);
        Ok(())
    }

    fn bcachefs_set_option(&self, member: &str, option: &str, value: &str) -> Result<()> {
        self.record(format!("bcachefs-set {member} {option}={value}"));
        let mut state = self.state.borrow_mut();
        if !state.fs_labels.contains_key(member) {
            return Err(SysError::DeviceNotFound(member.to_string()));
        }
        state.fs_options.insert(option.to_string(), value.to_string());
        Ok(())
    }

    fn bcachefs_labels(&self, member: &str) -> Result<Vec<String>> {
        let state = self.state.borrow();
        if !state.fs_labels.contains_key(member) {
            return Err(SysError::DeviceNotFound(member.to_string()));
        }
        let mut labels: Vec<String> = state.fs_labels.values().cloned().collect();
        labels.sort();
        Ok(labels)
    }
}

impl VolumeManager for FakeHost {
    fn add_pv_to_vg(&self, device: &str, vg: &str, may_create: bool) -> Result<()> {
        self.record(format!("pv-add {device} {vg}"));
        let mut state = self.state.borrow_mut();
        if !may_create && !state.vg_pvs.contains_key(vg) {
            return Err(SysError::DeviceNotFound(vg.to_string()));
        }
        state.vg_pvs.entry(vg.to_string()).or_default().push(device.to_string());
        Ok(())
    }

    fn create_lv(&self, vg: &str, lv: &str, _size: LvSize) -> Result<()> {
        self.record(format!("lvcreate {vg}/{lv}"));
        self.state
            .borrow_mut()
            .lvs
            .insert(format!("/dev/mapper/{vg}-{lv}"), (vg.to_string(), lv.to_string()));
        Ok(())
    }

    fn activate_all(&self) -> Result<()> {
        self.record("activate-all".to_string());
        Ok(())
    }

    fn deactivate_vg(&self, vg: &str) -> Result<()> {
        self.record(format!("deactivate {vg}"));
        Ok(())
    }

    fn auto_extend_lv(&self, lv_path: &str) -> Result<bool> {
        self.record(format!("lvextend {lv_path}"));
        Ok(true)
    }

    fn evacuate_pv(&self, device: &str) -> Result<(i32, String)> {
        self.record(format!("pvmove {device}"));
        let status = self.state.borrow().pvmove_status;
        Ok((status, format!("pvmove exited with {status}")))
    }

    fn remove_pv_from_vg(&self, vg: &str, device: &str) -> Result<()> {
        self.record(format!("vgreduce {vg} {device}"));
        if let Some(pvs) = self.state.borrow_mut().vg_pvs.get_mut(vg) {
            pvs.retain(|pv| pv != device);
        }
        Ok(())
    }

    fn vg_pv_list(&self, vg: &str) -> Result<Vec<String>> {
        Ok(self.state.borrow().vg_pvs.get(vg).cloned().unwrap_or_default())
    }
}

impl MountOps for FakeHost {
    fn mount(
        &self,
        source: &str,
        dir: &Path,
        fs_type: Option<&str>,
        options: Option<&str>,
    ) -> Result<()> {
        self.record(format!(
            "mount {source} {} {} {}",
            dir.display(),
            fs_type.unwrap_or("-"),
            options.unwrap_or("-")
        ));
        let dir = dir.display().to_string();
        if self.state.borrow().failing_mounts.contains(&dir) {
            return Err(SysError::OperationFailed(format!("mount on {dir} refused")));
        }
        Ok(())
    }

    fn umount(&self, dir: &Path) -> Result<()> {
        self.record(format!("umount {}", dir.display()));
        Ok(())
    }

    fn remount(&self, dir: &Path, options: &str) -> Result<()> {
        self.record(format!("remount {} {options}", dir.display()));
        let dir = dir.display().to_string();
        let mut state = self.state.borrow_mut();
        if options.split(',').any(|o| o == "rw") {
            state.writable.insert(dir);
        } else if options.split(',').any(|o| o == "ro") {
            state.writable.remove(&dir);
        }
        Ok(())
    }

    fn is_writable(&self, dir: &Path) -> Result<bool> {
        Ok(self.state.borrow().writable.contains(&dir.display().to_string()))
    }
}

impl SystemOps for FakeHost {
    fn swap_in_use(&self, device: &str) -> Result<bool> {
        self.record(format!("swap-check {device}"));
        Ok(self.state.borrow().active_swaps.contains(device))
    }

    fn physical_memory_gib(&self) -> Result<u64> {
        Ok(self.state.borrow().memory_gib)
    }

    fn make_filesystem(&self, device: &str, fs_type: &str) -> Result<()> {
        self.record(format!("mkfs {device} {fs_type}"));
        self.state
            .borrow_mut()
            .fs_types
            .insert(device.to_string(), fs_type.to_string());
        Ok(())
    }

    fn resize_filesystem(&self, device: &str) -> Result<()> {
        self.record(format!("resize {device}"));
        Ok(())
    }

    fn sync_esp(&self, source: &str, dest: &str) -> Result<()> {
        self.record(format!("sync-esp {source} {dest}"));
        Ok(())
    }
}
