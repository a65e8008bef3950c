// SPDX-License-Identifier: GPL-3.0-only

//! Swap usage queries

use std::fs;

use procfs::{Current, Meminfo};
use storage_types::GIB;

use crate::exec;
use crate::{Result, SysError};

const PROC_SWAPS: &str = "/proc/swaps";

/// Device column of `/proc/swaps`, header skipped.
pub fn parse_proc_swaps(input: &str) -> Vec<String> {
    input
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// systemd unit name of a swap device: `/dev/sda2` -> `dev-sda2.swap`.
pub fn swap_unit_name(device: &str) -> String {
    let trimmed = device.trim_matches('/');
    let mut unit = String::with_capacity(trimmed.len() + 5);
    for (i, byte) in trimmed.bytes().enumerate() {
        match byte {
            b'/' => unit.push('-'),
            b'.' if i == 0 => unit.push_str("\\x2e"),
            b if b.is_ascii_alphanumeric() || matches!(b, b':' | b'_' | b'.') => {
                unit.push(b as char)
            }
            b => unit.push_str(&format!("\\x{b:02x}")),
        }
    }
    unit.push_str(".swap");
    unit
}

fn unit_is_active(unit: &str) -> Result<bool> {
    match exec::run_with_status("systemctl", &["is-active", "--quiet", unit]) {
        Ok((status, _)) => Ok(status == 0),
        Err(SysError::ToolNotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether `device` is an active swap area, either through its systemd
/// swap unit or directly in `/proc/swaps`.
pub fn swap_in_use(device: &str) -> Result<bool> {
    if unit_is_active(&swap_unit_name(device))? {
        return Ok(true);
    }
    let swaps = fs::read_to_string(PROC_SWAPS)?;
    let canonical = fs::canonicalize(device).ok();
    Ok(parse_proc_swaps(&swaps).iter().any(|active| {
        active == device || canonical.as_deref() == Some(std::path::Path::new(active))
    }))
}

/// Installed memory in GiB, rounded up.
pub fn physical_memory_gib() -> Result<u64> {
    let meminfo =
        Meminfo::current().map_err(|e| SysError::OperationFailed(format!("meminfo: {e}")))?;
    Ok(meminfo.mem_total.div_ceil(GIB))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_swap_unit_names() {
        assert_eq!(swap_unit_name("/dev/sda2"), "dev-sda2.swap");
        assert_eq!(swap_unit_name("/dev/nvme0n1p2"), "dev-nvme0n1p2.swap");
        assert_eq!(swap_unit_name("/dev/mapper/hdd-swap"), "dev-mapper-hdd\\x2dswap.swap");
    }

    #[test]
    fn parses_proc_swaps() {
        let sample = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n\
                      /dev/sda2                               partition\t8388604\t\t0\t\t-2\n";
        assert_eq!(parse_proc_swaps(sample), vec!["/dev/sda2"]);
        assert!(parse_proc_swaps("Filename Type Size Used Priority\n").is_empty());
    }
}
