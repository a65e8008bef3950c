// SPDX-License-Identifier: GPL-3.0-only

//! Wrappers around the LVM, bcache and bcachefs tooling

pub mod bcache;
pub mod bcachefs;
pub mod lvm;

pub use bcache::{BcacheControl, BcacheFormat, bcache_dev_from_dev_path};
pub use bcachefs::BcachefsControl;
pub use lvm::{LvSize, PVMOVE_NOTHING_TO_MOVE};
