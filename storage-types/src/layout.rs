// SPDX-License-Identifier: GPL-3.0-only

//! Canonical layout names and the layout summary

use serde::{Deserialize, Serialize};

use crate::disk::BootMode;

/// Volume group holding the bcache physical volumes
pub const VG_NAME: &str = "hdd";

/// Root logical volume inside [`VG_NAME`]
pub const ROOT_LV_NAME: &str = "root";

/// Device-mapper path of the root logical volume
pub const ROOT_LV_DEV_PATH: &str = "/dev/mapper/hdd-root";

pub const FS_TYPE_EXT4: &str = "ext4";
pub const FS_TYPE_VFAT: &str = "vfat";
pub const FS_TYPE_SWAP: &str = "swap";
pub const FS_TYPE_BCACHEFS: &str = "bcachefs";

/// Snapshot of a recognised layout, for display and scripting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSummary {
    /// Layout name (e.g., "efi-bcache-lvm-ext4")
    pub name: String,

    pub boot_mode: BootMode,

    /// Root device or device spec
    pub dev_rootfs: String,

    /// ESP currently used for booting
    pub dev_boot: String,

    pub dev_swap: Option<String>,

    /// HDD supplying the ESP; `None` when the SSD does
    pub boot_disk: Option<String>,

    pub ssd: Option<String>,

    pub hdds: Vec<String>,

    /// ESPs that must be kept in sync with `dev_boot`
    pub pending_esps: Vec<String>,
}
