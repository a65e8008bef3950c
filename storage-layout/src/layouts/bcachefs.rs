// SPDX-License-Identifier: GPL-3.0-only

//! EFI + bcachefs
//!
//! ```text
//! /dev/sda                         SSD, GPT (optional cache disk)
//!     /dev/sda1                    ESP
//!     /dev/sda2                    swap (optional)
//!     /dev/sda3                    bcachefs cache member
//! /dev/sdb, /dev/sdc               HDD, GPT
//!     /dev/sd{b,c}1                reserved ESP
//!     /dev/sd{b,c}2                bcachefs backing member
//! /dev/sda3:/dev/sdb2:/dev/sdc2    root device
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use storage_sys::tools::bcachefs::{
    HDD_LABEL, NO_TARGET, SSD_LABEL, SSD_TARGET_OPTIONS, join_root_spec, next_label,
    split_root_spec,
};
use storage_types::{DiskKind, FS_TYPE_BCACHEFS, PartitionRole};

use super::StorageLayout;
use crate::cache_group::{EfiCacheGroup, prepare_hdd, prepare_ssd};
use crate::checks;
use crate::config::LayoutConfig;
use crate::contracts::Host;
use crate::error::{LayoutError, RemoveDiskReason, Result};
use crate::mount_efi::MountEfi;

pub const NAME: &str = "efi-bcachefs";

pub struct EfiBcachefs {
    host: Arc<dyn Host>,
    config: LayoutConfig,
    cg: EfiCacheGroup,
    mnt: MountEfi,
}

impl std::fmt::Debug for EfiBcachefs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EfiBcachefs")
            .field("cg", &self.cg)
            .field("mnt", &self.mnt)
            .finish()
    }
}

/// Member partitions in root spec order: the cache first, then the HDD data
/// partitions.
fn members_of(cg: &EfiCacheGroup) -> Vec<String> {
    cg.get_ssd_cache_partition()
        .map(str::to_string)
        .into_iter()
        .chain(cg.hdd_data_partitions())
        .collect()
}

fn check_members(host: &dyn Host, members: &[String]) -> Result<()> {
    if members.is_empty() {
        return Err(LayoutError::parse(NAME, "root device names no member"));
    }
    members
        .iter()
        .try_for_each(|member| checks::check_root_filesystem(host, NAME, member, FS_TYPE_BCACHEFS))
}

/// bcachefs members found on `disks`, keyed by filesystem UUID.
fn find_members(host: &dyn Host, disks: &[String]) -> Result<Vec<(String, String)>> {
    let mut found = Vec::new();
    for disk in disks {
        for partition in host.partitions(disk)? {
            if host.filesystem_type(&partition)? != FS_TYPE_BCACHEFS {
                continue;
            }
            if let Some(uuid) = host.filesystem_uuid(&partition)? {
                found.push((uuid, partition));
            }
        }
    }
    Ok(found)
}

impl EfiBcachefs {
    fn dev_rootfs_of(&self) -> String {
        join_root_spec(&members_of(&self.cg))
    }

    fn member_labels(&self) -> Result<Vec<String>> {
        match members_of(&self.cg).first() {
            Some(member) => Ok(self.host.bcachefs_labels(member)?),
            None => Ok(Vec::new()),
        }
    }

    fn set_ssd_targets(&self, member: &str, value: &str) -> Result<()> {
        for option in SSD_TARGET_OPTIONS {
            self.host.bcachefs_set_option(member, option, value)?;
        }
        Ok(())
    }

    pub fn parse(
        host: Arc<dyn Host>,
        config: &LayoutConfig,
        boot_dev: &str,
        root_dev: &str,
    ) -> Result<Self> {
        let members = split_root_spec(root_dev);
        check_members(host.as_ref(), &members)?;

        let (ssd, hdds) = checks::split_member_disks(host.as_ref(), NAME, &members)?;
        let mut cg = EfiCacheGroup::from_probed(host.as_ref(), NAME, ssd.as_deref(), &hdds)?;
        let expected = join_root_spec(&members_of(&cg));
        if expected != root_dev {
            return Err(LayoutError::parse(NAME, format!("root device must be {expected}")));
        }
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
        let declared = find_members(host.as_ref(), disks)?;
        let mut uuids = declared
            .iter()
            .map(|(uuid, _)| uuid.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter();
        let uuid = match (uuids.next(), uuids.next()) {
            (None, _) => return Err(LayoutError::parse(NAME, "no bcachefs member found")),
            (Some(uuid), None) => uuid.to_string(),
            (Some(_), Some(_)) => {
                return Err(LayoutError::parse(NAME, "multiple bcachefs filesystems found"));
            }
        };

        // Members may also sit on disks that were not declared.
        let members: Vec<String> = find_members(host.as_ref(), &host.fixed_disks()?)?
            .into_iter()
            .filter(|(found, _)| *found == uuid)
            .map(|(_, partition)| partition)
            .collect();
        let (ssd, hdds) = checks::split_member_disks(host.as_ref(), NAME, &members)?;
        checks::check_extra_disks(NAME, ssd.as_deref(), &hdds, disks)?;

        let mut cg = EfiCacheGroup::from_probed(host.as_ref(), NAME, ssd.as_deref(), &hdds)?;
        let (boot_hdd, boot_dev) = checks::detect_boot(host.as_ref(), NAME, &cg)?;
        if let Some(boot_hdd) = boot_hdd {
            cg.set_boot_hdd(&boot_hdd);
        }

        let root_spec = join_root_spec(&members_of(&cg));
        let mnt = MountEfi::mount(Arc::clone(&host), &root_spec, &boot_dev, mount_dir)?;
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

        let mut cg = EfiCacheGroup::new();
        if let Some(ssd) = &ssd {
            let parts = prepare_ssd(host.as_ref(), config, ssd, PartitionRole::Bcache)?;
            cg.add_ssd(ssd, parts);
        }
        for hdd in &hdds {
            let parts = prepare_hdd(host.as_ref(), config, hdd, PartitionRole::Bcache)?;
            cg.add_hdd(hdd, parts);
        }

        let caches: Vec<String> = cg.get_ssd_cache_partition().map(str::to_string).into_iter().collect();
        host.create_bcachefs(
            &caches,
            &cg.hdd_data_partitions(),
            config.bcachefs_metadata_replicas,
            config.bcachefs_data_replicas,
        )?;

        let boot_dev = cg
            .dev_boot()
            .ok_or_else(|| storage_sys::SysError::Precondition("cache group has no boot ESP".to_string()))?
            .to_string();
        let root_spec = join_root_spec(&members_of(&cg));
        let mnt = MountEfi::mount(Arc::clone(&host), &root_spec, &boot_dev, mount_dir)?;
        tracing::info!("created {NAME} on {}", cg.get_disk_list().join(", "));

        Ok(Self {
            host,
            config: config.clone(),
            cg,
            mnt,
        })
    }
}

impl StorageLayout for EfiBcachefs {
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
        self.dev_rootfs_of()
    }

    fn check(&self) -> Result<Vec<String>> {
        checks::swap_size_issues(self.host.as_ref(), &self.cg)
    }

    fn optimize_rootdev(&self) -> Result<()> {
        Ok(())
    }

    fn add_disk(&mut self, disk: &str) -> Result<bool> {
        let kind = checks::check_disk_addable(self.host.as_ref(), &self.cg, disk)?;
        let last_boot = self.cg.boot_disk().map(str::to_string);
        let labels = self.member_labels()?;
        let host = self.host.as_ref();
        let mountpoint = self.mnt.mount_dir();

        match kind {
            DiskKind::Ssd => {
                let parts = prepare_ssd(host, &self.config, disk, PartitionRole::Bcache)?;
                host.bcachefs_add_device(&parts.cache, mountpoint, &next_label(SSD_LABEL, &labels))?;
                // a filesystem formatted without an SSD has no targets yet
                self.set_ssd_targets(&parts.cache, SSD_LABEL)?;
                self.cg.add_ssd(disk, parts);
            }
            DiskKind::Hdd => {
                let parts = prepare_hdd(host, &self.config, disk, PartitionRole::Bcache)?;
                host.bcachefs_add_device(&parts.data, mountpoint, &next_label(HDD_LABEL, &labels))?;
                self.cg.add_hdd(disk, parts);
            }
        }
        Ok(last_boot.as_deref() != self.cg.boot_disk())
    }

    fn remove_disk(&mut self, disk: &str) -> Result<bool> {
        let last_boot = self.cg.boot_disk().map(str::to_string);
        let host = self.host.as_ref();

        if self.cg.get_ssd() == Some(disk) {
            if let Some(swap) = self.cg.get_ssd_swap_partition()
                && host.swap_in_use(swap)?
            {
                return Err(LayoutError::remove_disk(disk, RemoveDiskReason::SwapInUse));
            }
            if let Some(cache) = self.cg.get_ssd_cache_partition() {
                self.set_ssd_targets(cache, NO_TARGET)?;
                host.bcachefs_remove_device(cache)?;
            }
            self.cg.remove_ssd();
        } else {
            let Some(data) = self.cg.get_hdd_data_partition(disk) else {
                return Err(LayoutError::remove_disk(disk, RemoveDiskReason::NotMember));
            };
            if self.cg.get_hdd_list().len() <= 1 {
                return Err(LayoutError::remove_disk(disk, RemoveDiskReason::LastHdd));
            }
            host.bcachefs_remove_device(data)?;
            self.cg.remove_hdd(disk)?;
        }
        Ok(last_boot.as_deref() != self.cg.boot_disk())
    }

    fn umount_and_dispose(&mut self) -> Result<()> {
        self.mnt.umount()
    }
}
