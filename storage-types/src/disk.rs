// SPDX-License-Identifier: GPL-3.0-only

//! Disk classification models

use serde::{Deserialize, Serialize};

/// Rotational classification of a whole disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    Ssd,
    Hdd,
}

impl DiskKind {
    /// Map the kernel's `queue/rotational` flag.
    pub fn from_rotational(rotational: bool) -> Self {
        if rotational { Self::Hdd } else { Self::Ssd }
    }
}

/// Role of a device inside a bcache stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BcacheRole {
    Backing,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Efi,
}
