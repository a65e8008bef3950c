// SPDX-License-Identifier: GPL-3.0-only

//! EFI + bcache + LVM + ext4
//!
//! ```text
//! /dev/sda                 SSD, GPT (optional cache disk)
//!     /dev/sda1            ESP
//!     /dev/sda2            swap (optional)
//!     /dev/sda3            bcache cache device
//! /dev/sdb                 HDD, GPT
//!     /dev/sdb1            reserved ESP
//!     /dev/sdb2            bcache backing device
//! /dev/bcache0             on /dev/sdb2, physical volume of VG "hdd"
//! /dev/mapper/hdd-root     root logical volume, ext4
//! ```
//!
//! Extra logical volumes and extra unrelated disks are tolerated.

use std::path::Path;
use std::sync::Arc;

use storage_sys::SysError;
use storage_sys::tools::{LvSize, PVMOVE_NOTHING_TO_MOVE, bcache_dev_from_dev_path};
use storage_types::{
    BcacheRole, DiskKind, FS_TYPE_EXT4, PartitionRole, ROOT_LV_DEV_PATH, ROOT_LV_NAME, VG_NAME,
    partition_to_disk,
};

use super::StorageLayout;
use crate::cache_group::{EfiCacheGroup, prepare_hdd, prepare_ssd};
use crate::checks;
use crate::config::LayoutConfig;
use crate::contracts::Host;
use crate::error::{LayoutError, RemoveDiskReason, Result};
use crate::mount_efi::MountEfi;

pub const NAME: &str = "efi-bcache-lvm-ext4";

pub struct EfiBcacheLvmExt4 {
    host: Arc<dyn Host>,
    config: LayoutConfig,
    cg: EfiCacheGroup,
    mnt: MountEfi,
}

impl std::fmt::Debug for EfiBcacheLvmExt4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EfiBcacheLvmExt4")
            .field("cg", &self.cg)
            .field("mnt", &self.mnt)
            .finish()
    }
}

fn required_bcache(host: &dyn Host, backing: &str) -> Result<String> {
    host.find_bcache_by_backing(backing)?.ok_or_else(|| {
        SysError::DeviceNotFound(format!("no bcache device on {backing}")).into()
    })
}

/// Physical volumes of the root volume group, all of which must be bcache devices.
fn bcache_pvs(host: &dyn Host) -> Result<Vec<String>> {
    let pvs = host.vg_pv_list(VG_NAME)?;
    if pvs.is_empty() {
        return Err(LayoutError::parse(NAME, format!("volume group \"{VG_NAME}\" not found")));
    }
    pvs.into_iter()
        .map(|pv| {
            bcache_dev_from_dev_path(&pv).ok_or_else(|| {
                LayoutError::parse(
                    NAME,
                    format!("volume group \"{VG_NAME}\" has non-bcache physical volume {pv}"),
                )
            })
        })
        .collect()
}

/// Derive the SSD and HDDs from the slaves of the composed devices. Either
/// every composed device shares the one cache, or none has a cache.
fn disks_from_bcache_devs(host: &dyn Host, bcache_devs: &[String]) -> Result<(Option<String>, Vec<String>)> {
    let mut ssd: Option<String> = None;
    let mut uncached = 0usize;
    let mut hdds = Vec::new();

    for bcache_dev in bcache_devs {
        let mut slaves = host.bcache_slaves(bcache_dev)?;
        let backing = slaves.pop().ok_or_else(|| {
            LayoutError::parse(NAME, format!("{bcache_dev} has no backing device"))
        })?;
        if !host.is_bcache_device(&backing, BcacheRole::Backing)? {
            return Err(LayoutError::parse(
                NAME,
                format!("{backing} carries no bcache backing superblock"),
            ));
        }
        hdds.push(partition_to_disk(&backing).map_err(SysError::from)?);

        match slaves.as_slice() {
            [] => uncached += 1,
            [cache] => {
                if !host.is_bcache_device(cache, BcacheRole::Cache)? {
                    return Err(LayoutError::parse(
                        NAME,
                        format!("{cache} carries no bcache cache superblock"),
                    ));
                }
                let disk = partition_to_disk(cache).map_err(SysError::from)?;
                if ssd.as_ref().is_some_and(|existing| *existing != disk) {
                    return Err(LayoutError::parse(NAME, "multiple cache disks found"));
                }
                ssd = Some(disk);
            }
            _ => {
                return Err(LayoutError::parse(
                    NAME,
                    format!("{bcache_dev} has more than one cache device"),
                ));
            }
        }
    }

    if ssd.is_some() && uncached > 0 {
        return Err(LayoutError::parse(
            NAME,
            "some backing devices are not attached to the cache",
        ));
    }
    Ok((ssd, hdds))
}

/// The root LV must exist in the root VG and carry ext4.
fn check_root_lv(host: &dyn Host) -> Result<()> {
    let expected = (VG_NAME.to_string(), ROOT_LV_NAME.to_string());
    if host.lvm_info(ROOT_LV_DEV_PATH)?.as_ref() != Some(&expected) {
        return Err(LayoutError::parse(
            NAME,
            format!("logical volume {VG_NAME}/{ROOT_LV_NAME} not found"),
        ));
    }
    checks::check_root_filesystem(host, NAME, ROOT_LV_DEV_PATH, FS_TYPE_EXT4)
}

impl EfiBcacheLvmExt4 {
    pub fn parse(
        host: Arc<dyn Host>,
        config: &LayoutConfig,
        boot_dev: &str,
        root_dev: &str,
    ) -> Result<Self> {
        if root_dev != ROOT_LV_DEV_PATH {
            return Err(LayoutError::parse(NAME, format!("root device must be {ROOT_LV_DEV_PATH}")));
        }
        check_root_lv(host.as_ref())?;

        let bcache_devs = bcache_pvs(host.as_ref())?;
        let (ssd, hdds) = disks_from_bcache_devs(host.as_ref(), &bcache_devs)?;
        let mut cg = EfiCacheGroup::from_probed(host.as_ref(), NAME, ssd.as_deref(), &hdds)?;
        if let Some(boot_hdd) = checks::boot_hdd_from_boot_dev(host.as_ref(), NAME, boot_dev, &cg)? {
            cg.set_boot_hdd(&boot_hdd);
        }

        let mnt = MountEfi::attach(Arc::clone(&host), Path::new("/"));
        Ok(Self {
            host,
            config: config.clone(),
            cg,
            mnt,
        })
    }

    pub fn detect_and_mount(
        host: Arc<dyn Host>,
        config: &LayoutConfig,
        disks: &[String],
        mount_dir: &Path,
    ) -> Result<Self> {
        // Undeclared members must be registered too, or the volume group
        // comes up partial instead of reporting the extra disk.
        let mut scanned = host.fixed_disks()?;
        for disk in disks {
            if !scanned.contains(disk) {
                scanned.push(disk.clone());
            }
        }
        let mut candidates = Vec::new();
        for disk in &scanned {
            candidates.extend(host.partitions(disk)?);
        }
        host.scan_and_register_all(&candidates)?;
        host.activate_all()?;

        let bcache_devs = bcache_pvs(host.as_ref())?;
        let (ssd, hdds) = disks_from_bcache_devs(host.as_ref(), &bcache_devs)?;
        checks::check_extra_disks(NAME, ssd.as_deref(), &hdds, disks)?;
        let mut cg = EfiCacheGroup::from_probed(host.as_ref(), NAME, ssd.as_deref(), &hdds)?;
        let (boot_hdd, boot_dev) = checks::detect_boot(host.as_ref(), NAME, &cg)?;
        if let Some(boot_hdd) = boot_hdd {
            cg.set_boot_hdd(&boot_hdd);
        }
        check_root_lv(host.as_ref())?;

        let mnt = MountEfi::mount(Arc::clone(&host), ROOT_LV_DEV_PATH, &boot_dev, mount_dir)?;
        Ok(Self {
            host,
            config: config.clone(),
            cg,
            mnt,
        })
    }

    pub fn create_and_mount(
        host: Arc<dyn Host>,
        config: &LayoutConfig,
        disks: &[String],
        mount_dir: &Path,
    ) -> Result<Self> {
        let (ssd, hdds) = checks::split_disks_for_create(host.as_ref(), disks)?;

        // SSD first, so the boot disk is settled before the HDDs join
        let mut cg = EfiCacheGroup::new();
        if let Some(ssd) = &ssd {
            let parts = prepare_ssd(host.as_ref(), config, ssd, PartitionRole::Bcache)?;
            cg.add_ssd(ssd, parts);
        }
        for hdd in &hdds {
            let parts = prepare_hdd(host.as_ref(), config, hdd, PartitionRole::Bcache)?;
            cg.add_hdd(hdd, parts);
        }

        let mut bcache_devs = Vec::new();
        for data in cg.hdd_data_partitions() {
            bcache_devs.push(host.make_and_register_backing(&data)?);
        }
        if let Some(cache) = cg.get_ssd_cache_partition() {
            host.make_and_register_cache(cache)?;
            host.attach_cache_device(&bcache_devs, cache)?;
        }

        for bcache_dev in &bcache_devs {
            host.add_pv_to_vg(bcache_dev, VG_NAME, true)?;
        }
        host.create_lv(VG_NAME, ROOT_LV_NAME, LvSize::AllFree)?;
        host.make_filesystem(ROOT_LV_DEV_PATH, FS_TYPE_EXT4)?;

        let boot_dev = cg
            .dev_boot()
            .ok_or_else(|| SysError::Precondition("cache group has no boot ESP".to_string()))?
            .to_string();
        let mnt = MountEfi::mount(Arc::clone(&host), ROOT_LV_DEV_PATH, &boot_dev, mount_dir)?;
        tracing::info!("created {NAME} on {}", cg.get_disk_list().join(", "));

        Ok(Self {
            host,
            config: config.clone(),
            cg,
            mnt,
        })
    }

    fn add_ssd(&mut self, disk: &str) -> Result<()> {
        let host = self.host.as_ref();

        // Composed devices are looked up before the cache partition exists;
        // the list only depends on the HDDs.
        let bcache_devs = self
            .cg
            .hdd_data_partitions()
            .iter()
            .map(|data| required_bcache(host, data))
            .collect::<Result<Vec<_>>>()?;

        let parts = prepare_ssd(host, &self.config, disk, PartitionRole::Bcache)?;
        host.make_and_register_cache(&parts.cache)?;
        host.attach_cache_device(&bcache_devs, &parts.cache)?;
        self.cg.add_ssd(disk, parts);
        Ok(())
    }

    fn add_hdd(&mut self, disk: &str) -> Result<()> {
        let host = self.host.as_ref();
        let parts = prepare_hdd(host, &self.config, disk, PartitionRole::Bcache)?;
        let bcache_dev = host.make_and_register_backing(&parts.data)?;
        if let Some(cache) = self.cg.get_ssd_cache_partition() {
            host.attach_cache_device(std::slice::from_ref(&bcache_dev), cache)?;
        }
        host.add_pv_to_vg(&bcache_dev, VG_NAME, false)?;
        self.cg.add_hdd(disk, parts);
        Ok(())
    }

    fn remove_ssd(&mut self, disk: &str) -> Result<()> {
        let host = self.host.as_ref();
        if let Some(swap) = self.cg.get_ssd_swap_partition()
            && host.swap_in_use(swap)?
        {
            return Err(LayoutError::remove_disk(disk, RemoveDiskReason::SwapInUse));
        }
        if let Some(cache) = self.cg.get_ssd_cache_partition() {
            host.unregister_cache_device(cache)?;
        }
        self.cg.remove_ssd();
        Ok(())
    }

    fn remove_hdd(&mut self, disk: &str) -> Result<()> {
        let host = self.host.as_ref();
        let Some(data) = self.cg.get_hdd_data_partition(disk) else {
            return Err(LayoutError::remove_disk(disk, RemoveDiskReason::NotMember));
        };
        if self.cg.get_hdd_list().len() <= 1 {
            return Err(LayoutError::remove_disk(disk, RemoveDiskReason::LastHdd));
        }

        let bcache_dev = required_bcache(host, data)?;
        // TODO: confirm which pvmove statuses mean an empty volume; only the
        // "nothing to move" status is accepted for now.
        let (status, output) = host.evacuate_pv(&bcache_dev)?;
        if status != PVMOVE_NOTHING_TO_MOVE {
            return Err(LayoutError::remove_disk(
                disk,
                RemoveDiskReason::EvacuationFailed { status, output },
            ));
        }
        host.remove_pv_from_vg(VG_NAME, &bcache_dev)?;
        host.stop_backing_device(&bcache_dev)?;
        self.cg.remove_hdd(disk)?;
        Ok(())
    }
}

impl StorageLayout for EfiBcacheLvmExt4 {
    fn name(&self) -> &'static str {
        NAME
    }

    fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    fn cache_group(&self) -> &EfiCacheGroup {
        &self.cg
    }

    fn mount_controller(&self) -> &MountEfi {
        &self.mnt
    }

    fn dev_rootfs(&self) -> String {
        ROOT_LV_DEV_PATH.to_string()
    }

    fn check(&self) -> Result<Vec<String>> {
        checks::swap_size_issues(self.host.as_ref(), &self.cg)
    }

    fn optimize_rootdev(&self) -> Result<()> {
        if self.host.auto_extend_lv(ROOT_LV_DEV_PATH)? {
            self.host.resize_filesystem(ROOT_LV_DEV_PATH)?;
        }
        Ok(())
    }

    fn add_disk(&mut self, disk: &str) -> Result<bool> {
        let kind = checks::check_disk_addable(self.host.as_ref(), &self.cg, disk)?;
        let last_boot = self.cg.boot_disk().map(str::to_string);
        match kind {
            DiskKind::Ssd => self.add_ssd(disk)?,
            DiskKind::Hdd => self.add_hdd(disk)?,
        }
        Ok(last_boot.as_deref() != self.cg.boot_disk())
    }

    fn remove_disk(&mut self, disk: &str) -> Result<bool> {
        let last_boot = self.cg.boot_disk().map(str::to_string);
        if self.cg.get_ssd() == Some(disk) {
            self.remove_ssd(disk)?;
        } else {
            self.remove_hdd(disk)?;
        }
        Ok(last_boot.as_deref() != self.cg.boot_disk())
    }

    fn umount_and_dispose(&mut self) -> Result<()> {
        self.mnt.umount()?;
        if !self.mnt.is_owned() {
            return Ok(());
        }

        let host = self.host.as_ref();
        host.deactivate_vg(VG_NAME)?;
        for data in self.cg.hdd_data_partitions() {
            if let Some(bcache_dev) = host.find_bcache_by_backing(&data)? {
                host.stop_backing_device(&bcache_dev)?;
            }
        }
        if let Some(cache) = self.cg.get_ssd_cache_partition() {
            host.unregister_cache_device(cache)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHost;

    fn disks(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn config() -> LayoutConfig {
        LayoutConfig {
            swap_size_gib: Some(2),
            ..LayoutConfig::default()
        }
    }

    fn create(fake: &Arc<FakeHost>, paths: &[&str]) -> EfiBcacheLvmExt4 {
        let host: Arc<dyn Host> = fake.clone();
        EfiBcacheLvmExt4::create_and_mount(host, &config(), &disks(paths), Path::new("/mnt")).unwrap()
    }

    #[test]
    fn create_builds_cached_volume_group() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb", "/dev/sdc"]));
        let layout = create(&fake, &["/dev/sda", "/dev/sdb", "/dev/sdc"]);

        let state = fake.state.borrow();
        assert_eq!(state.partitions["/dev/sda"], disks(&["/dev/sda1", "/dev/sda2", "/dev/sda3"]));
        assert_eq!(state.partitions["/dev/sdb"], disks(&["/dev/sdb1", "/dev/sdb2"]));
        assert_eq!(state.partitions["/dev/sdc"], disks(&["/dev/sdc1", "/dev/sdc2"]));
        assert_eq!(state.slaves["/dev/bcache0"], disks(&["/dev/sda3", "/dev/sdb2"]));
        assert_eq!(state.slaves["/dev/bcache1"], disks(&["/dev/sda3", "/dev/sdc2"]));
        assert_eq!(state.vg_pvs[VG_NAME], disks(&["/dev/bcache0", "/dev/bcache1"]));
        assert_eq!(state.fs_types[ROOT_LV_DEV_PATH], FS_TYPE_EXT4);
        drop(state);

        assert_eq!(layout.dev_rootfs(), ROOT_LV_DEV_PATH);
        assert_eq!(layout.boot_disk(), None);
        assert_eq!(layout.dev_boot(), Some("/dev/sda1"));
        assert_eq!(layout.dev_swap(), Some("/dev/sda2"));
        assert_eq!(layout.get_pending_esp_list(), disks(&["/dev/sdb1", "/dev/sdc1"]));
        assert_eq!(
            fake.calls(&["mount"]),
            vec![
                "mount /dev/mapper/hdd-root /mnt - -".to_string(),
                "mount /dev/sda1 /mnt/boot vfat ro".to_string(),
            ]
        );
    }

    #[test]
    fn create_attaches_cache_after_backing() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb"]));
        create(&fake, &["/dev/sda", "/dev/sdb"]);
        assert_eq!(
            fake.calls(&["make-", "attach", "pv-add", "lvcreate", "mkfs"]),
            vec![
                "make-backing /dev/sdb2",
                "make-cache /dev/sda3",
                "attach /dev/sda3 /dev/bcache0",
                "pv-add /dev/bcache0 hdd",
                "lvcreate hdd/root",
                "mkfs /dev/mapper/hdd-root ext4",
            ]
        );
    }

    #[test]
    fn create_rejects_bad_disk_sets() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda", "/dev/sdd"], &["/dev/sdb"]));
        let host: Arc<dyn Host> = fake.clone();

        let err = EfiBcacheLvmExt4::create_and_mount(
            Arc::clone(&host),
            &config(),
            &disks(&["/dev/sda", "/dev/sdd", "/dev/sdb"]),
            Path::new("/mnt"),
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::Create(crate::error::CreateReason::MultipleSsd)));

        let err = EfiBcacheLvmExt4::create_and_mount(host, &config(), &[], Path::new("/mnt"))
            .unwrap_err();
        assert!(matches!(err, LayoutError::Create(crate::error::CreateReason::NoDisk)));
        assert!(fake.calls(&["initialize"]).is_empty());
    }

    #[test]
    fn remove_hdd_evacuates_before_teardown() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb", "/dev/sdc"]));
        let mut layout = create(&fake, &["/dev/sda", "/dev/sdb", "/dev/sdc"]);
        fake.clear_ledger();

        assert!(!layout.remove_disk("/dev/sdc").unwrap());
        assert_eq!(
            fake.ledger(),
            vec![
                "pvmove /dev/bcache1",
                "vgreduce hdd /dev/bcache1",
                "stop /dev/bcache1",
            ]
        );
        assert_eq!(layout.cache_group().get_hdd_list(), disks(&["/dev/sdb"]));
    }

    #[test]
    fn failed_evacuation_changes_nothing() {
        let fake = Arc::new(FakeHost::with_disks(&[], &["/dev/sdb", "/dev/sdc"]));
        let mut layout = create(&fake, &["/dev/sdb", "/dev/sdc"]);
        fake.clear_ledger();
        fake.state.borrow_mut().pvmove_status = 0;

        let err = layout.remove_disk("/dev/sdb").unwrap_err();
        assert!(matches!(
            err,
            LayoutError::RemoveDisk {
                reason: RemoveDiskReason::EvacuationFailed { status: 0, .. },
                ..
            }
        ));
        assert_eq!(fake.ledger(), vec!["pvmove /dev/bcache0"]);
        assert_eq!(layout.cache_group().get_hdd_list(), disks(&["/dev/sdb", "/dev/sdc"]));
        assert_eq!(layout.boot_disk(), Some("/dev/sdb"));
    }

    #[test]
    fn last_hdd_cannot_be_removed() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb"]));
        let mut layout = create(&fake, &["/dev/sda", "/dev/sdb"]);
        fake.clear_ledger();

        let err = layout.remove_disk("/dev/sdb").unwrap_err();
        assert!(matches!(
            err,
            LayoutError::RemoveDisk { reason: RemoveDiskReason::LastHdd, .. }
        ));
        assert!(fake.ledger().is_empty());
    }

    #[test]
    fn ssd_with_active_swap_stays() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb"]));
        let mut layout = create(&fake, &["/dev/sda", "/dev/sdb"]);
        fake.state.borrow_mut().active_swaps.insert("/dev/sda2".to_string());
        fake.clear_ledger();

        let err = layout.remove_disk("/dev/sda").unwrap_err();
        assert!(matches!(
            err,
            LayoutError::RemoveDisk { reason: RemoveDiskReason::SwapInUse, .. }
        ));
        assert_eq!(fake.ledger(), vec!["swap-check /dev/sda2"]);
        assert_eq!(layout.cache_group().get_ssd(), Some("/dev/sda"));
    }

    #[test]
    fn removing_ssd_moves_boot_to_first_hdd() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb", "/dev/sdc"]));
        let mut layout = create(&fake, &["/dev/sda", "/dev/sdb", "/dev/sdc"]);
        fake.clear_ledger();

        assert!(layout.remove_disk("/dev/sda").unwrap());
        assert_eq!(
            fake.ledger(),
            vec!["swap-check /dev/sda2", "unregister-cache /dev/sda3"]
        );
        assert_eq!(layout.boot_disk(), Some("/dev/sdb"));
        assert_eq!(layout.dev_boot(), Some("/dev/sdb1"));
        assert_eq!(layout.dev_swap(), None);
    }

    #[test]
    fn adding_ssd_caches_every_backing_device() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb", "/dev/sdc"]));
        let mut layout = create(&fake, &["/dev/sdb", "/dev/sdc"]);
        assert_eq!(layout.boot_disk(), Some("/dev/sdb"));
        fake.clear_ledger();

        assert!(layout.add_disk("/dev/sda").unwrap());
        assert_eq!(
            fake.calls(&["make-", "attach"]),
            vec![
                "make-cache /dev/sda3",
                "attach /dev/sda3 /dev/bcache0,/dev/bcache1",
            ]
        );
        assert_eq!(layout.boot_disk(), None);
        assert_eq!(layout.dev_boot(), Some("/dev/sda1"));

        let err = layout.add_disk("/dev/sdb").unwrap_err();
        assert!(matches!(
            err,
            LayoutError::AddDisk { reason: crate::error::AddDiskReason::AlreadyMember, .. }
        ));
    }

    #[test]
    fn adding_hdd_joins_volume_group_last() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb", "/dev/sdc"]));
        let mut layout = create(&fake, &["/dev/sda", "/dev/sdb"]);
        fake.clear_ledger();

        assert!(!layout.add_disk("/dev/sdc").unwrap());
        assert_eq!(
            fake.calls(&["make-", "attach", "pv-add"]),
            vec![
                "make-backing /dev/sdc2",
                "attach /dev/sda3 /dev/bcache1",
                "pv-add /dev/bcache1 hdd",
            ]
        );
        assert_eq!(layout.get_disk_list(), disks(&["/dev/sda", "/dev/sdb", "/dev/sdc"]));
    }

    #[test]
    fn missing_composed_device_blocks_cache_and_volume_changes() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb", "/dev/sdc"]));
        let mut layout = create(&fake, &["/dev/sdb", "/dev/sdc"]);
        fake.state.borrow_mut().slaves.remove("/dev/bcache1");
        fake.clear_ledger();

        let err = layout.add_disk("/dev/sda").unwrap_err();
        assert!(matches!(err, LayoutError::Sys(SysError::DeviceNotFound(_))));
        let err = layout.remove_disk("/dev/sdc").unwrap_err();
        assert!(matches!(err, LayoutError::Sys(SysError::DeviceNotFound(_))));

        assert!(
            fake.calls(&["initialize", "make-", "attach", "pvmove", "vgreduce", "stop"])
                .is_empty()
        );
        assert_eq!(layout.get_disk_list(), disks(&["/dev/sdb", "/dev/sdc"]));
        assert_eq!(layout.cache_group().get_ssd(), None);
    }

    #[test]
    fn parse_recovers_created_layout() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb", "/dev/sdc"]));
        let created = create(&fake, &["/dev/sda", "/dev/sdb", "/dev/sdc"]);
        let host: Arc<dyn Host> = fake.clone();

        let parsed =
            EfiBcacheLvmExt4::parse(Arc::clone(&host), &config(), "/dev/sda1", ROOT_LV_DEV_PATH)
                .unwrap();
        assert_eq!(parsed.summary(), created.summary());
        assert!(!parsed.mount_controller().is_owned());

        let err = EfiBcacheLvmExt4::parse(Arc::clone(&host), &config(), "/dev/sdb1", ROOT_LV_DEV_PATH)
            .unwrap_err();
        assert!(err.to_string().contains("boot device must be /dev/sda1"));

        let err = EfiBcacheLvmExt4::parse(host, &config(), "/dev/sda1", "/dev/sdb2").unwrap_err();
        assert!(matches!(err, LayoutError::Parse { .. }));
    }

    #[test]
    fn parse_rejects_partially_cached_group() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb", "/dev/sdc"]));
        create(&fake, &["/dev/sda", "/dev/sdb", "/dev/sdc"]);
        fake.state
            .borrow_mut()
            .slaves
            .insert("/dev/bcache1".to_string(), disks(&["/dev/sdc2"]));
        let host: Arc<dyn Host> = fake.clone();

        let err = EfiBcacheLvmExt4::parse(host, &config(), "/dev/sda1", ROOT_LV_DEV_PATH)
            .unwrap_err();
        assert!(err.to_string().contains("not attached"));
    }

    #[test]
    fn detect_reports_undeclared_member() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb", "/dev/sdc"]));
        let mut created = create(&fake, &["/dev/sda", "/dev/sdb", "/dev/sdc"]);
        created.umount_and_dispose().unwrap();
        assert!(fake.state.borrow().slaves.is_empty());
        fake.clear_ledger();
        let host: Arc<dyn Host> = fake.clone();

        let err = EfiBcacheLvmExt4::detect_and_mount(
            Arc::clone(&host),
            &config(),
            &disks(&["/dev/sda", "/dev/sdb"]),
            Path::new("/mnt"),
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::ExtraDisk { ref disk, .. } if disk == "/dev/sdc"));
        assert_eq!(fake.calls(&["register-all"]), vec!["register-all 7"]);
        assert!(fake.calls(&["mount"]).is_empty());
        fake.clear_ledger();

        let detected = EfiBcacheLvmExt4::detect_and_mount(
            host,
            &config(),
            &disks(&["/dev/sda", "/dev/sdb", "/dev/sdc"]),
            Path::new("/mnt"),
        )
        .unwrap();
        assert_eq!(detected.dev_boot(), Some("/dev/sda1"));
        assert_eq!(fake.calls(&["register-all", "activate-all"]), vec!["register-all 7", "activate-all"]);
    }

    #[test]
    fn detect_needs_registered_backing_devices() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb"]));
        let mut created = create(&fake, &["/dev/sda", "/dev/sdb"]);
        created.umount_and_dispose().unwrap();
        // the member disk is gone from the fixed disk list
        fake.state.borrow_mut().fixed.retain(|disk| disk != "/dev/sdb");
        let host: Arc<dyn Host> = fake.clone();

        let err = EfiBcacheLvmExt4::detect_and_mount(
            host,
            &config(),
            &disks(&["/dev/sda"]),
            Path::new("/mnt"),
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::Sys(SysError::DeviceNotFound(_))));
        assert!(fake.calls(&["mount"]).is_empty());
    }

    #[test]
    fn dispose_releases_cache_layer_after_unmount() {
        let fake = Arc::new(FakeHost::with_disks(&["/dev/sda"], &["/dev/sdb"]));
        let mut layout = create(&fake, &["/dev/sda", "/dev/sdb"]);
        fake.clear_ledger();

        layout.umount_and_dispose().unwrap();
        assert_eq!(
            fake.ledger(),
            vec![
                "umount /mnt/boot",
                "umount /mnt",
                "deactivate hdd",
                "stop /dev/bcache0",
                "unregister-cache /dev/sda3",
            ]
        );
    }

    #[test]
    fn optimize_grows_root_filesystem() {
        let fake = Arc::new(FakeHost::with_disks(&[], &["/dev/sdb"]));
        let layout = create(&fake, &["/dev/sdb"]);
        fake.clear_ledger();

        layout.optimize_rootdev().unwrap();
        assert_eq!(
            fake.ledger(),
            vec!["lvextend /dev/mapper/hdd-root", "resize /dev/mapper/hdd-root"]
        );
        assert_eq!(layout.check().unwrap(), vec!["no swap partition".to_string()]);
    }
}
