// SPDX-License-Identifier: GPL-3.0-only

//! Block device path grammar
//!
//! Only the device families a fixed installation target can show up as are
//! recognised: SCSI/SATA (`/dev/sda`, `/dev/sda1`), Xen (`/dev/xvda`,
//! `/dev/xvda1`), virtio (`/dev/vda`, `/dev/vda1`) and NVMe
//! (`/dev/nvme0n1`, `/dev/nvme0n1p1`).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DevPathError {
    #[error("unrecognized block device path: {0}")]
    Unrecognized(String),

    #[error("{0} is a partition, not a whole disk")]
    NotDisk(String),

    #[error("{0} is a whole disk, not a partition")]
    NotPartition(String),
}

const LETTER_FAMILIES: &[&str] = &["sd", "xvd", "vd"];

/// `(disk, partition index)`; the index is `None` for a whole disk.
fn parse(path: &str) -> Option<(String, Option<u32>)> {
    let name = path.strip_prefix("/dev/")?;

    for family in LETTER_FAMILIES {
        let Some(rest) = name.strip_prefix(family) else {
            continue;
        };
        let letters = rest.bytes().take_while(u8::is_ascii_lowercase).count();
        if letters == 0 {
            continue;
        }
        let (unit, tail) = rest.split_at(letters);
        let disk = format!("/dev/{family}{unit}");
        return match tail {
            "" => Some((disk, None)),
            digits => parse_index(digits).map(|index| (disk, Some(index))),
        };
    }

    let rest = name.strip_prefix("nvme")?;
    let controller = rest.bytes().take_while(u8::is_ascii_digit).count();
    if controller == 0 {
        return None;
    }
    let rest = rest[controller..].strip_prefix('n')?;
    let namespace = rest.bytes().take_while(u8::is_ascii_digit).count();
    if namespace == 0 {
        return None;
    }
    let disk_len = "/dev/nvme".len() + controller + 1 + namespace;
    let disk = path[..disk_len].to_string();
    match &rest[namespace..] {
        "" => Some((disk, None)),
        tail => {
            let index = parse_index(tail.strip_prefix('p')?)?;
            Some((disk, Some(index)))
        }
    }
}

fn parse_index(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|index| *index > 0)
}

/// Returns `true` for a whole disk and `false` for one of its partitions.
pub fn is_disk_path(path: &str) -> Result<bool, DevPathError> {
    parse(path)
        .map(|(_, index)| index.is_none())
        .ok_or_else(|| DevPathError::Unrecognized(path.to_string()))
}

pub fn partition_to_disk_and_index(path: &str) -> Result<(String, u32), DevPathError> {
    match parse(path) {
        Some((disk, Some(index))) => Ok((disk, index)),
        Some((_, None)) => Err(DevPathError::NotPartition(path.to_string())),
        None => Err(DevPathError::Unrecognized(path.to_string())),
    }
}

pub fn partition_to_disk(path: &str) -> Result<String, DevPathError> {
    partition_to_disk_and_index(path).map(|(disk, _)| disk)
}

/// Build the device path of partition `index` (1-based) on `disk`.
pub fn disk_to_partition(disk: &str, index: u32) -> Result<String, DevPathError> {
    match parse(disk) {
        Some((_, None)) if disk.starts_with("/dev/nvme") => Ok(format!("{disk}p{index}")),
        Some((_, None)) => Ok(format!("{disk}{index}")),
        Some((_, Some(_))) => Err(DevPathError::NotDisk(disk.to_string())),
        None => Err(DevPathError::Unrecognized(disk.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_disks_and_partitions() {
        assert_eq!(is_disk_path("/dev/sda"), Ok(true));
        assert_eq!(is_disk_path("/dev/sdb12"), Ok(false));
        assert_eq!(is_disk_path("/dev/xvdc"), Ok(true));
        assert_eq!(is_disk_path("/dev/vda3"), Ok(false));
        assert_eq!(is_disk_path("/dev/nvme0n1"), Ok(true));
        assert_eq!(is_disk_path("/dev/nvme0n1p2"), Ok(false));
        assert!(is_disk_path("/dev/loop0").is_err());
        assert!(is_disk_path("/dev/sd").is_err());
        assert!(is_disk_path("sda").is_err());
    }

    #[test]
    fn splits_partition_paths() {
        assert_eq!(
            partition_to_disk_and_index("/dev/sdc2"),
            Ok(("/dev/sdc".to_string(), 2))
        );
        assert_eq!(
            partition_to_disk_and_index("/dev/nvme10n2p15"),
            Ok(("/dev/nvme10n2".to_string(), 15))
        );
        assert_eq!(
            partition_to_disk("/dev/sda"),
            Err(DevPathError::NotPartition("/dev/sda".to_string()))
        );
        assert!(partition_to_disk("/dev/sda0").is_err());
    }

    #[test]
    fn builds_partition_paths() {
        assert_eq!(disk_to_partition("/dev/sda", 1).as_deref(), Ok("/dev/sda1"));
        assert_eq!(disk_to_partition("/dev/nvme0n1", 3).as_deref(), Ok("/dev/nvme0n1p3"));
        assert!(disk_to_partition("/dev/sda1", 1).is_err());
    }
}
