// SPDX-License-Identifier: GPL-3.0-only

//! Supported layouts
//!
//! Each layout combines an [`EfiCacheGroup`] with a [`MountEfi`] and adds
//! its own cache and volume layers on top.

pub mod bcache_lvm_ext4;
pub mod bcachefs;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use storage_types::{BootMode, LayoutSummary};

use crate::cache_group::EfiCacheGroup;
use crate::config::LayoutConfig;
use crate::contracts::Host;
use crate::error::{LayoutError, Result};
use crate::mount_efi::{BootDirRwController, MountEfi};

pub use bcache_lvm_ext4::EfiBcacheLvmExt4;
pub use bcachefs::EfiBcachefs;

pub trait StorageLayout {
    fn name(&self) -> &'static str;

    fn host(&self) -> &dyn Host;

    fn cache_group(&self) -> &EfiCacheGroup;

    fn mount_controller(&self) -> &MountEfi;

    fn dev_rootfs(&self) -> String;

    /// Advice about the layout; empty when nothing needs attention.
    fn check(&self) -> Result<Vec<String>>;

    /// Grow the root filesystem over any new space.
    fn optimize_rootdev(&self) -> Result<()>;

    /// Add a disk online. Returns whether the boot disk changed.
    fn add_disk(&mut self, disk: &str) -> Result<bool>;

    /// Remove a disk online. Returns whether the boot disk changed.
    fn remove_disk(&mut self, disk: &str) -> Result<bool>;

    /// Unmount what this layout mounted and release its cache layer.
    fn umount_and_dispose(&mut self) -> Result<()>;

    fn boot_mode(&self) -> BootMode {
        BootMode::Efi
    }

    fn dev_boot(&self) -> Option<&str> {
        self.cache_group().dev_boot()
    }

    fn dev_swap(&self) -> Option<&str> {
        self.cache_group().dev_swap()
    }

    fn boot_disk(&self) -> Option<&str> {
        self.cache_group().boot_disk()
    }

    fn get_disk_list(&self) -> Vec<String> {
        self.cache_group().get_disk_list()
    }

    fn get_esp(&self) -> Vec<String> {
        self.cache_group().get_esp()
    }

    fn get_pending_esp_list(&self) -> Vec<String> {
        self.cache_group().get_pending_esp_list()
    }

    /// Copy the boot ESP onto the pending ESP `dst`.
    fn sync_esp(&self, dst: &str) -> Result<()> {
        if !self.get_pending_esp_list().iter().any(|esp| esp == dst) {
            return Err(storage_sys::SysError::Precondition(format!(
                "{dst} is not a pending ESP of this layout"
            ))
            .into());
        }
        let src = self.dev_boot().ok_or_else(|| {
            storage_sys::SysError::Precondition("layout has no boot ESP".to_string())
        })?;
        self.host().sync_esp(src, dst)?;
        Ok(())
    }

    fn remount_rootfs(&self, options: &str) -> Result<()> {
        self.mount_controller().remount_rootfs(options)
    }

    fn get_bootdir_rw_controller(&self) -> BootDirRwController {
        self.mount_controller().get_bootdir_rw_controller()
    }

    fn summary(&self) -> LayoutSummary {
        let group = self.cache_group();
        LayoutSummary {
            name: self.name().to_string(),
            boot_mode: self.boot_mode(),
            dev_rootfs: self.dev_rootfs(),
            dev_boot: self.dev_boot().unwrap_or_default().to_string(),
            dev_swap: self.dev_swap().map(str::to_string),
            boot_disk: self.boot_disk().map(str::to_string),
            ssd: group.get_ssd().map(str::to_string),
            hdds: group.get_hdd_list(),
            pending_esps: self.get_pending_esp_list(),
        }
    }
}

impl fmt::Debug for dyn StorageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLayout")
            .field("name", &self.name())
            .field("dev_rootfs", &self.dev_rootfs())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    BcacheLvmExt4,
    Bcachefs,
}

impl LayoutKind {
    pub const ALL: [Self; 2] = [Self::BcacheLvmExt4, Self::Bcachefs];

    pub fn name(self) -> &'static str {
        match self {
            Self::BcacheLvmExt4 => bcache_lvm_ext4::NAME,
            Self::Bcachefs => bcachefs::NAME,
        }
    }

    /// Recognise an existing layout from its boot and root devices. Nothing
    /// is mounted or changed.
    pub fn parse(
        self,
        host: Arc<dyn Host>,
        config: &LayoutConfig,
        boot_dev: &str,
        root_dev: &str,
    ) -> Result<Box<dyn StorageLayout>> {
        Ok(match self {
            Self::BcacheLvmExt4 => Box::new(EfiBcacheLvmExt4::parse(host, config, boot_dev, root_dev)?),
            Self::Bcachefs => Box::new(EfiBcachefs::parse(host, config, boot_dev, root_dev)?),
        })
    }

    /// Bring an existing layout on `disks` online and mount it on `mount_dir`.
    pub fn detect_and_mount(
        self,
        host: Arc<dyn Host>,
        config: &LayoutConfig,
        disks: &[String],
        mount_dir: &Path,
    ) -> Result<Box<dyn StorageLayout>> {
        Ok(match self {
            Self::BcacheLvmExt4 => Box::new(EfiBcacheLvmExt4::detect_and_mount(
                host, config, disks, mount_dir,
            )?),
            Self::Bcachefs => Box::new(EfiBcachefs::detect_and_mount(host, config, disks, mount_dir)?),
        })
    }

    /// Build a fresh layout on raw `disks` and mount it on `mount_dir`.
    pub fn create_and_mount(
        self,
        host: Arc<dyn Host>,
        config: &LayoutConfig,
        disks: &[String],
        mount_dir: &Path,
    ) -> Result<Box<dyn StorageLayout>> {
        Ok(match self {
            Self::BcacheLvmExt4 => Box::new(EfiBcacheLvmExt4::create_and_mount(
                host, config, disks, mount_dir,
            )?),
            Self::Bcachefs => Box::new(EfiBcachefs::create_and_mount(host, config, disks, mount_dir)?),
        })
    }
}

/// Try every layout in turn; the first that recognises the devices wins.
pub fn parse_any(
    host: Arc<dyn Host>,
    config: &LayoutConfig,
    boot_dev: &str,
    root_dev: &str,
) -> Result<Box<dyn StorageLayout>> {
    let mut reasons = Vec::new();
    for kind in LayoutKind::ALL {
        match kind.parse(Arc::clone(&host), config, boot_dev, root_dev) {
            Ok(layout) => return Ok(layout),
            Err(LayoutError::Parse { reason, .. }) => reasons.push(format!("{kind}: {reason}")),
            Err(e) => return Err(e),
        }
    }
    Err(LayoutError::parse("any", reasons.join("; ")))
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LayoutKind {
    type Err = LayoutError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == value)
            .ok_or_else(|| LayoutError::Config(format!("unknown layout {value:?}")))
    }
}
