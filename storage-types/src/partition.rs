// SPDX-License-Identifier: GPL-3.0-only

//! Partition table and partition layout models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{GIB, MIB, TIB};

/// Partition table type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableType {
    Mbr,
    Gpt,
}

impl PartitionTableType {
    /// Parse the `PTTYPE` value reported by blkid ("dos" is MBR).
    pub fn from_blkid(value: &str) -> Option<Self> {
        match value {
            "dos" | "mbr" => Some(Self::Mbr),
            "gpt" => Some(Self::Gpt),
            _ => None,
        }
    }
}

impl fmt::Display for PartitionTableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mbr => write!(f, "mbr"),
            Self::Gpt => write!(f, "gpt"),
        }
    }
}

/// What a planned partition is for
///
/// The role decides the partition type id, the flags and the filesystem the
/// planner formats it with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    /// No type hint and no filesystem
    Plain,
    /// EFI system partition, fat32 (GPT only)
    Esp,
    /// bcache or bcachefs member, no filesystem (GPT only)
    Bcache,
    Swap,
    /// LVM physical volume, no filesystem
    Lvm,
    Vfat,
    Ext2,
    Ext4,
    Xfs,
}

impl PartitionRole {
    /// Whether the role can be laid out in a table of the given type.
    pub fn supported_by(self, table: PartitionTableType) -> bool {
        match self {
            Self::Esp | Self::Bcache => table == PartitionTableType::Gpt,
            _ => true,
        }
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Plain => "plain",
            Self::Esp => "esp",
            Self::Bcache => "bcache",
            Self::Swap => "swap",
            Self::Lvm => "lvm",
            Self::Vfat => "vfat",
            Self::Ext2 => "ext2",
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizeParseError {
    #[error("invalid partition size '{0}': expected <n>MiB, <n>GiB, <n>TiB or '*'")]
    Invalid(String),
}

/// Size of a planned partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionSize {
    /// Exact size in bytes
    Fixed(u64),
    /// Whatever free space is left, written as `*`
    Remaining,
}

impl PartitionSize {
    pub fn mib(value: u64) -> Self {
        Self::Fixed(value * MIB)
    }

    pub fn gib(value: u64) -> Self {
        Self::Fixed(value * GIB)
    }
}

impl FromStr for PartitionSize {
    type Err = SizeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "*" {
            return Ok(Self::Remaining);
        }

        let invalid = || SizeParseError::Invalid(value.to_string());
        let digits = value.bytes().take_while(u8::is_ascii_digit).count();
        let (number, unit) = value.split_at(digits);
        let number: u64 = number.parse().map_err(|_| invalid())?;
        let unit = match unit {
            "MiB" => MIB,
            "GiB" => GIB,
            "TiB" => TIB,
            _ => return Err(invalid()),
        };

        number
            .checked_mul(unit)
            .filter(|bytes| *bytes > 0)
            .map(Self::Fixed)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for PartitionSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remaining => f.write_str("*"),
            Self::Fixed(bytes) if bytes % GIB == 0 => write!(f, "{}GiB", bytes / GIB),
            Self::Fixed(bytes) if bytes % MIB == 0 => write!(f, "{}MiB", bytes / MIB),
            Self::Fixed(bytes) => write!(f, "{bytes}B"),
        }
    }
}

/// One entry of an ordered partition layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub size: PartitionSize,
    pub role: PartitionRole,
}

impl PartitionSpec {
    pub fn new(size: PartitionSize, role: PartitionRole) -> Self {
        Self { size, role }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partition_sizes() {
        assert_eq!("*".parse::<PartitionSize>(), Ok(PartitionSize::Remaining));
        assert_eq!("512MiB".parse::<PartitionSize>(), Ok(PartitionSize::Fixed(512 * MIB)));
        assert_eq!("2GiB".parse::<PartitionSize>(), Ok(PartitionSize::Fixed(2 * GIB)));
        assert_eq!("1TiB".parse::<PartitionSize>(), Ok(PartitionSize::Fixed(TIB)));
        assert!("0MiB".parse::<PartitionSize>().is_err());
        assert!("12MB".parse::<PartitionSize>().is_err());
        assert!("MiB".parse::<PartitionSize>().is_err());
    }

    #[test]
    fn displays_sizes_in_largest_exact_unit() {
        assert_eq!(PartitionSize::mib(100).to_string(), "100MiB");
        assert_eq!(PartitionSize::mib(2048).to_string(), "2GiB");
        assert_eq!(PartitionSize::Remaining.to_string(), "*");
    }

    #[test]
    fn esp_requires_gpt() {
        assert!(PartitionRole::Esp.supported_by(PartitionTableType::Gpt));
        assert!(!PartitionRole::Esp.supported_by(PartitionTableType::Mbr));
        assert!(PartitionRole::Swap.supported_by(PartitionTableType::Mbr));
        assert_eq!(PartitionTableType::from_blkid("dos"), Some(PartitionTableType::Mbr));
        assert_eq!(PartitionTableType::from_blkid(""), None);
    }
}
