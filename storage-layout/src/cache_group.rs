// SPDX-License-Identifier: GPL-3.0-only

//! EFI cache group
//!
//! One optional SSD (ESP, optional swap, cache) in front of one or more HDDs
//! (reserved ESP, data). The group is an index over device paths; the
//! layouts apply the physical change and then record it here.
//!
//! While the group holds at least one disk:
//! - there is at most one SSD
//! - the boot HDD is set exactly when there is no SSD, and is a member
//! - at least one HDD remains

use storage_types::{
    FS_TYPE_SWAP, PartitionRole, PartitionSize, PartitionSpec, PartitionTableType,
};

use crate::config::LayoutConfig;
use crate::contracts::Host;
use crate::error::{LayoutError, RemoveDiskReason, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdPartitions {
    pub esp: String,
    pub swap: Option<String>,
    pub cache: String,
}

impl SsdPartitions {
    /// Interpret the partitions of an SSD: `[esp, cache]` or `[esp, swap, cache]`.
    pub fn from_list(mut partitions: Vec<String>, has_swap: bool) -> Option<Self> {
        match (partitions.len(), has_swap) {
            (3, true) => {
                let cache = partitions.pop()?;
                let swap = partitions.pop();
                let esp = partitions.pop()?;
                Some(Self { esp, swap, cache })
            }
            (2, false) => {
                let cache = partitions.pop()?;
                let esp = partitions.pop()?;
                Some(Self {
                    esp,
                    swap: None,
                    cache,
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HddPartitions {
    pub esp: String,
    pub data: String,
}

impl HddPartitions {
    pub fn from_list(partitions: Vec<String>) -> Option<Self> {
        let [esp, data]: [String; 2] = partitions.try_into().ok()?;
        Some(Self { esp, data })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EfiCacheGroup {
    ssd: Option<(String, SsdPartitions)>,
    hdds: Vec<(String, HddPartitions)>,
    boot_hdd: Option<String>,
}

impl EfiCacheGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ssd.is_none() && self.hdds.is_empty()
    }

    pub fn is_member(&self, disk: &str) -> bool {
        self.get_ssd() == Some(disk) || self.hdds.iter().any(|(hdd, _)| hdd == disk)
    }

    /// Record the SSD. Callers check that no SSD is present.
    pub fn add_ssd(&mut self, disk: &str, partitions: SsdPartitions) {
        assert!(self.ssd.is_none(), "cache group already has an SSD");
        assert!(!self.is_member(disk), "{disk} is already in the cache group");
        self.ssd = Some((disk.to_string(), partitions));
        self.boot_hdd = None;
    }

    pub fn add_hdd(&mut self, disk: &str, partitions: HddPartitions) {
        assert!(!self.is_member(disk), "{disk} is already in the cache group");
        self.hdds.push((disk.to_string(), partitions));
        if self.ssd.is_none() && self.boot_hdd.is_none() {
            self.boot_hdd = Some(disk.to_string());
        }
    }

    /// Drop the SSD; the first HDD becomes the boot disk.
    pub fn remove_ssd(&mut self) -> SsdPartitions {
        let Some((_, partitions)) = self.ssd.take() else {
            panic!("cache group has no SSD");
        };
        self.boot_hdd = self.hdds.first().map(|(hdd, _)| hdd.clone());
        partitions
    }

    /// Drop an HDD. The last HDD cannot be removed.
    pub fn remove_hdd(&mut self, disk: &str) -> Result<HddPartitions> {
        let position = self
            .hdds
            .iter()
            .position(|(hdd, _)| hdd == disk)
            .ok_or_else(|| LayoutError::remove_disk(disk, RemoveDiskReason::NotMember))?;
        if self.hdds.len() <= 1 {
            return Err(LayoutError::remove_disk(disk, RemoveDiskReason::LastHdd));
        }

        let (_, partitions) = self.hdds.remove(position);
        if self.boot_hdd.as_deref() == Some(disk) {
            self.boot_hdd = self.hdds.first().map(|(hdd, _)| hdd.clone());
        }
        Ok(partitions)
    }

    /// Select the HDD whose ESP boots the system.
    pub fn set_boot_hdd(&mut self, disk: &str) {
        assert!(self.ssd.is_none(), "the SSD supplies the ESP");
        assert!(
            self.hdds.iter().any(|(hdd, _)| hdd == disk),
            "{disk} is not an HDD of the cache group"
        );
        self.boot_hdd = Some(disk.to_string());
    }

    pub fn get_ssd(&self) -> Option<&str> {
        self.ssd.as_ref().map(|(disk, _)| disk.as_str())
    }

    pub fn get_ssd_esp_partition(&self) -> Option<&str> {
        self.ssd.as_ref().map(|(_, p)| p.esp.as_str())
    }

    pub fn get_ssd_swap_partition(&self) -> Option<&str> {
        self.ssd.as_ref().and_then(|(_, p)| p.swap.as_deref())
    }

    pub fn get_ssd_cache_partition(&self) -> Option<&str> {
        self.ssd.as_ref().map(|(_, p)| p.cache.as_str())
    }

    pub fn get_hdd_list(&self) -> Vec<String> {
        self.hdds.iter().map(|(hdd, _)| hdd.clone()).collect()
    }

    fn hdd(&self, disk: &str) -> Option<&HddPartitions> {
        self.hdds
            .iter()
            .find(|(hdd, _)| hdd == disk)
            .map(|(_, partitions)| partitions)
    }

    pub fn get_hdd_esp_partition(&self, disk: &str) -> Option<&str> {
        self.hdd(disk).map(|p| p.esp.as_str())
    }

    pub fn get_hdd_data_partition(&self, disk: &str) -> Option<&str> {
        self.hdd(disk).map(|p| p.data.as_str())
    }

    /// Data partitions of every HDD, in add order.
    pub fn hdd_data_partitions(&self) -> Vec<String> {
        self.hdds.iter().map(|(_, p)| p.data.clone()).collect()
    }

    /// HDD supplying the ESP, `None` when the SSD does.
    pub fn boot_disk(&self) -> Option<&str> {
        self.boot_hdd.as_deref()
    }

    pub fn dev_boot(&self) -> Option<&str> {
        match (&self.ssd, &self.boot_hdd) {
            (Some((_, p)), _) => Some(p.esp.as_str()),
            (None, Some(hdd)) => self.get_hdd_esp_partition(hdd),
            (None, None) => None,
        }
    }

    pub fn dev_swap(&self) -> Option<&str> {
        self.get_ssd_swap_partition()
    }

    /// SSD first, then HDDs in add order.
    pub fn get_disk_list(&self) -> Vec<String> {
        self.get_ssd()
            .map(str::to_string)
            .into_iter()
            .chain(self.get_hdd_list())
            .collect()
    }

    pub fn get_esp(&self) -> Vec<String> {
        self.get_ssd_esp_partition()
            .map(str::to_string)
            .into_iter()
            .chain(self.hdds.iter().map(|(_, p)| p.esp.clone()))
            .collect()
    }

    /// ESPs other than [`Self::dev_boot`], which must mirror it.
    pub fn get_pending_esp_list(&self) -> Vec<String> {
        let boot = self.dev_boot();
        self.get_esp()
            .into_iter()
            .filter(|esp| Some(esp.as_str()) != boot)
            .collect()
    }

    /// Describe the first broken invariant, if any.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.is_empty() {
            return Ok(());
        }
        if self.hdds.is_empty() {
            return Err("the cache group has no hard disk".to_string());
        }
        match (&self.ssd, &self.boot_hdd) {
            (Some(_), Some(hdd)) => Err(format!("boot disk {hdd} set although an SSD is present")),
            (None, None) => Err("no boot disk selected".to_string()),
            (None, Some(hdd)) if self.hdd(hdd).is_none() => {
                Err(format!("boot disk {hdd} is not a member"))
            }
            _ => Ok(()),
        }
    }

    /// Rebuild a group from an existing SSD and HDDs, checking their
    /// partitions against the fixed layout. The first HDD boots when there is
    /// no SSD; see [`Self::set_boot_hdd`].
    pub fn from_probed(
        host: &dyn Host,
        layout: &str,
        ssd: Option<&str>,
        hdds: &[String],
    ) -> Result<Self> {
        if hdds.is_empty() {
            return Err(LayoutError::parse(layout, "no hard disk found"));
        }

        for disk in ssd.into_iter().chain(hdds.iter().map(String::as_str)) {
            if host.partition_table_type(disk)? != Some(PartitionTableType::Gpt) {
                return Err(LayoutError::parse(
                    layout,
                    format!("{disk} has no GPT partition table"),
                ));
            }
        }

        let mut group = Self::new();
        let mut esp_size = None;
        let mut check_esp = |partition: &str| -> Result<()> {
            if !host.is_esp_partition(partition)? {
                return Err(LayoutError::parse(layout, format!("{partition} is not an ESP")));
            }
            let size = host.size_bytes(partition)?;
            match esp_size {
                None => esp_size = Some(size),
                Some(expected) if expected != size => {
                    return Err(LayoutError::parse(
                        layout,
                        format!("{partition} differs in size from the other ESPs"),
                    ));
                }
                Some(_) => {}
            }
            Ok(())
        };

        if let Some(ssd) = ssd {
            let partitions = host.partitions(ssd)?;
            let has_swap = partitions.len() == 3;
            if has_swap && host.filesystem_type(&partitions[1])? != FS_TYPE_SWAP {
                return Err(LayoutError::parse(
                    layout,
                    format!("{} must be a swap partition", partitions[1]),
                ));
            }
            let parts = SsdPartitions::from_list(partitions, has_swap).ok_or_else(|| {
                LayoutError::parse(layout, format!("SSD {ssd} must have 2 or 3 partitions"))
            })?;
            check_esp(&parts.esp)?;
            group.ssd = Some((ssd.to_string(), parts));
        }

        for hdd in hdds {
            let parts = HddPartitions::from_list(host.partitions(hdd)?).ok_or_else(|| {
                LayoutError::parse(layout, format!("hard disk {hdd} must have exactly 2 partitions"))
            })?;
            check_esp(&parts.esp)?;
            if group.is_member(hdd) {
                return Err(LayoutError::parse(layout, format!("{hdd} listed twice")));
            }
            group.hdds.push((hdd.clone(), parts));
        }
        if group.ssd.is_none() {
            group.boot_hdd = Some(hdds[0].clone());
        }

        group
            .check_invariants()
            .map_err(|reason| LayoutError::parse(layout, reason))?;
        Ok(group)
    }
}

/// `[(esp, esp), (swap, swap)?, (*, cache)]`
pub fn ssd_partition_specs(
    config: &LayoutConfig,
    swap_gib: u64,
    cache_role: PartitionRole,
) -> Vec<PartitionSpec> {
    let mut specs = vec![PartitionSpec::new(
        PartitionSize::mib(config.esp_size_mib),
        PartitionRole::Esp,
    )];
    if swap_gib > 0 {
        specs.push(PartitionSpec::new(PartitionSize::gib(swap_gib), PartitionRole::Swap));
    }
    specs.push(PartitionSpec::new(PartitionSize::Remaining, cache_role));
    specs
}

/// `[(esp, esp), (*, data)]`
pub fn hdd_partition_specs(config: &LayoutConfig, data_role: PartitionRole) -> Vec<PartitionSpec> {
    vec![
        PartitionSpec::new(PartitionSize::mib(config.esp_size_mib), PartitionRole::Esp),
        PartitionSpec::new(PartitionSize::Remaining, data_role),
    ]
}

fn swap_size_gib(host: &dyn Host, config: &LayoutConfig) -> Result<u64> {
    match config.swap_size_gib {
        Some(size) => Ok(size),
        None => Ok(host.physical_memory_gib()?),
    }
}

/// Partition a raw SSD for the group.
pub fn prepare_ssd(
    host: &dyn Host,
    config: &LayoutConfig,
    disk: &str,
    cache_role: PartitionRole,
) -> Result<SsdPartitions> {
    let swap_gib = swap_size_gib(host, config)?;
    let specs = ssd_partition_specs(config, swap_gib, cache_role);
    let partitions = host.initialize_disk(disk, PartitionTableType::Gpt, &specs)?;
    SsdPartitions::from_list(partitions, swap_gib > 0).ok_or_else(|| {
        LayoutError::Sys(storage_sys::SysError::Parse(format!(
            "unexpected partition count on {disk}"
        )))
    })
}

/// Partition a raw HDD for the group.
pub fn prepare_hdd(
    host: &dyn Host,
    config: &LayoutConfig,
    disk: &str,
    data_role: PartitionRole,
) -> Result<HddPartitions> {
    let specs = hdd_partition_specs(config, data_role);
    let partitions = host.initialize_disk(disk, PartitionTableType::Gpt, &specs)?;
    HddPartitions::from_list(partitions).ok_or_else(|| {
        LayoutError::Sys(storage_sys::SysError::Parse(format!(
            "unexpected partition count on {disk}"
        )))
    })
}
