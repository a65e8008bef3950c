// SPDX-License-Identifier: GPL-3.0-only

//! Strict storage layouts
//!
//! A layout is a fixed arrangement of one optional SSD and one or more HDDs
//! that boots over EFI:
//!
//! - **efi-bcache-lvm-ext4**: bcache in front of every HDD, the composed
//!   devices pooled in LVM, ext4 on the root volume
//! - **efi-bcachefs**: one multi-device bcachefs across the SSD cache
//!   partition and the HDD data partitions
//!
//! Layouts reach the machine only through the traits in [`contracts`];
//! [`host::System`] is the implementation backed by `storage-sys`.

pub mod cache_group;
pub mod checks;
pub mod config;
pub mod contracts;
pub mod error;
pub mod host;
pub mod layouts;
pub mod mount_efi;

#[cfg(test)]
pub(crate) mod fake;

pub use cache_group::{EfiCacheGroup, HddPartitions, SsdPartitions};
pub use config::LayoutConfig;
pub use contracts::Host;
pub use error::{AddDiskReason, CreateReason, LayoutError, RemoveDiskReason, Result};
pub use host::System;
pub use layouts::{EfiBcacheLvmExt4, EfiBcachefs, LayoutKind, StorageLayout, parse_any};
pub use mount_efi::{BootDirRwController, MountEfi};
