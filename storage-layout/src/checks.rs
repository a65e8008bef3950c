// SPDX-License-Identifier: GPL-3.0-only

//! Probing checks shared by the layouts

use storage_types::{DiskKind, FS_TYPE_VFAT, GIB, partition_to_disk};

use crate::cache_group::EfiCacheGroup;
use crate::contracts::Host;
use crate::error::{AddDiskReason, CreateReason, LayoutError, Result};

/// Split the disks given to a create call into the SSD and the HDDs.
pub fn split_disks_for_create(
    host: &dyn Host,
    disks: &[String],
) -> Result<(Option<String>, Vec<String>)> {
    if disks.is_empty() {
        return Err(LayoutError::Create(CreateReason::NoDisk));
    }
    let mut ssds = Vec::new();
    let mut hdds = Vec::new();
    for disk in disks {
        match host.disk_kind(disk)? {
            DiskKind::Ssd => ssds.push(disk.clone()),
            DiskKind::Hdd => hdds.push(disk.clone()),
        }
    }
    if ssds.len() > 1 {
        return Err(LayoutError::Create(CreateReason::MultipleSsd));
    }
    if hdds.is_empty() {
        return Err(LayoutError::Create(CreateReason::NoDisk));
    }
    Ok((ssds.pop(), hdds))
}

/// Split member partitions into the disks holding them, SSD and HDDs.
pub fn split_member_disks(
    host: &dyn Host,
    layout: &str,
    members: &[String],
) -> Result<(Option<String>, Vec<String>)> {
    let mut ssd: Option<String> = None;
    let mut hdds: Vec<String> = Vec::new();
    for member in members {
        let disk = partition_to_disk(member).map_err(storage_sys::SysError::from)?;
        match host.disk_kind(&disk)? {
            DiskKind::Ssd => match &ssd {
                Some(existing) if *existing != disk => {
                    return Err(LayoutError::parse(
                        layout,
                        format!("multiple SSDs found: {existing} and {disk}"),
                    ));
                }
                _ => ssd = Some(disk),
            },
            DiskKind::Hdd => {
                if !hdds.contains(&disk) {
                    hdds.push(disk);
                }
            }
        }
    }
    Ok((ssd, hdds))
}

/// Every disk of the layout must have been declared.
pub fn check_extra_disks(
    layout: &str,
    ssd: Option<&str>,
    hdds: &[String],
    declared: &[String],
) -> Result<()> {
    let extra = ssd
        .into_iter()
        .chain(hdds.iter().map(String::as_str))
        .find(|disk| !declared.iter().any(|d| d == disk));
    match extra {
        Some(disk) => Err(LayoutError::ExtraDisk {
            layout: layout.to_string(),
            disk: disk.to_string(),
        }),
        None => Ok(()),
    }
}

/// Check `boot_dev` against the group and return the boot HDD it implies.
pub fn boot_hdd_from_boot_dev(
    host: &dyn Host,
    layout: &str,
    boot_dev: &str,
    group: &EfiCacheGroup,
) -> Result<Option<String>> {
    if !host.is_esp_partition(boot_dev)? {
        return Err(LayoutError::parse(layout, format!("boot device {boot_dev} is not an ESP")));
    }
    if let Some(esp) = group.get_ssd_esp_partition() {
        if esp != boot_dev {
            return Err(LayoutError::parse(layout, format!("boot device must be {esp}")));
        }
        return Ok(None);
    }

    let disk = partition_to_disk(boot_dev).map_err(storage_sys::SysError::from)?;
    if group.get_hdd_esp_partition(&disk) != Some(boot_dev) {
        return Err(LayoutError::parse(
            layout,
            format!("boot device {boot_dev} is not the ESP of a member hard disk"),
        ));
    }
    Ok(Some(disk))
}

/// Find the boot ESP of a group found on disk: the SSD's, otherwise that of
/// the first HDD carrying a FAT filesystem.
pub fn detect_boot(
    host: &dyn Host,
    layout: &str,
    group: &EfiCacheGroup,
) -> Result<(Option<String>, String)> {
    if let Some(esp) = group.get_ssd_esp_partition() {
        return Ok((None, esp.to_string()));
    }
    for hdd in group.get_hdd_list() {
        if let Some(esp) = group.get_hdd_esp_partition(&hdd)
            && host.filesystem_type(esp)? == FS_TYPE_VFAT
        {
            return Ok((Some(hdd.clone()), esp.to_string()));
        }
    }
    Err(LayoutError::parse(layout, "no boot device found"))
}

pub fn check_root_filesystem(
    host: &dyn Host,
    layout: &str,
    device: &str,
    expected: &str,
) -> Result<()> {
    let found = host.filesystem_type(device)?;
    if found != expected {
        return Err(LayoutError::parse(
            layout,
            format!("root filesystem on {device} must be {expected}, found {found:?}"),
        ));
    }
    Ok(())
}

/// Preconditions of an online add. Returns how the new disk classifies.
pub fn check_disk_addable(host: &dyn Host, group: &EfiCacheGroup, disk: &str) -> Result<DiskKind> {
    if !host.is_fixed_disk(disk)? {
        return Err(LayoutError::add_disk(disk, AddDiskReason::NotFixedDisk));
    }
    if group.is_member(disk) {
        return Err(LayoutError::add_disk(disk, AddDiskReason::AlreadyMember));
    }
    let kind = host.disk_kind(disk)?;
    if kind == DiskKind::Ssd && group.get_ssd().is_some() {
        return Err(LayoutError::add_disk(disk, AddDiskReason::SsdAlreadyPresent));
    }
    Ok(kind)
}

/// Advice about the swap partition; empty when it is adequate.
pub fn swap_size_issues(host: &dyn Host, group: &EfiCacheGroup) -> Result<Vec<String>> {
    let Some(swap) = group.dev_swap() else {
        return Ok(vec!["no swap partition".to_string()]);
    };
    let memory = host.physical_memory_gib()?;
    let size = host.size_bytes(swap)?;
    if size < memory * GIB {
        return Ok(vec![format!(
            "swap partition {swap} is smaller than the installed memory ({memory} GiB)"
        )]);
    }
    Ok(Vec::new())
}
