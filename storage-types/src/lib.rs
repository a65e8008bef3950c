// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for strict storage layouts
//!
//! This crate holds the vocabulary shared by the system layer
//! (`storage-sys`) and the layout layer (`storage-layout`):
//!
//! - **devpath**: the block device path grammar (disks and their partitions)
//! - **disk**: disk classification and boot mode
//! - **partition**: partition table types, partition roles and size specs
//! - **layout**: canonical names (volume group, root volume) and the
//!   serializable layout summary
//!
//! Nothing in here touches a device.

pub mod common;
pub mod devpath;
pub mod disk;
pub mod layout;
pub mod partition;

pub use common::{GIB, MIB, SECTOR_SIZE, TIB, bytes_to_pretty};
pub use devpath::{DevPathError, disk_to_partition, is_disk_path, partition_to_disk, partition_to_disk_and_index};
pub use disk::{BcacheRole, BootMode, DiskKind};
pub use layout::{
    FS_TYPE_BCACHEFS, FS_TYPE_EXT4, FS_TYPE_SWAP, FS_TYPE_VFAT, LayoutSummary, ROOT_LV_DEV_PATH,
    ROOT_LV_NAME, VG_NAME,
};
pub use partition::{PartitionRole, PartitionSize, PartitionSpec, PartitionTableType, SizeParseError};
