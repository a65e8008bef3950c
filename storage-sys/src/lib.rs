// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for strict disk layouts
//!
//! This crate holds every physical operation the layouts rely on:
//! - on-disk codecs for bcache superblocks and GPT/MBR tables
//! - sysfs and `blkid` probing
//! - partition planning and table writing
//! - LVM, bcache and bcachefs tooling
//! - mounts, swap queries and raw ESP copies
//!
//! These operations require elevated privileges.

pub mod codec;
pub mod error;
pub mod esp;
pub mod exec;
pub mod mount;
pub mod planner;
pub mod probe;
pub mod swap;
pub mod tools;

pub use error::{Result, SysError};
pub use planner::{DiskGeometry, PartitionPlan, PlannedPartition, initialize_disk};
pub use probe::{BlockGeometry, DeviceProbe, block_geometry};
