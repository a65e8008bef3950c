// SPDX-License-Identifier: GPL-3.0-only

//! LVM command wrappers
//!
//! Reports are requested with `--noheadings --separator \t` and parsed row by
//! row; rows that do not have the requested columns are skipped.

use crate::exec;
use crate::{Result, SysError};

/// `pvmove` exit status when the physical volume holds no extents.
pub const PVMOVE_NOTHING_TO_MOVE: i32 = 5;

/// `lvextend` exit status when the requested size matches the current one.
const LVEXTEND_UNCHANGED: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvRow {
    pub pv_name: String,
    pub vg_name: Option<String>,
    pub size: u64,
    pub free: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvRow {
    pub vg_name: String,
    pub lv_name: String,
    pub lv_path: String,
    pub size: u64,
    pub active: bool,
}

/// Size policy for a new logical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvSize {
    /// All free extents of the group
    AllFree,
    Bytes(u64),
}

fn parse_tabbed_line(line: &str) -> Vec<String> {
    line.split('\t')
        .map(|part| part.trim().to_string())
        .collect()
}

fn parse_pvs(output: &str) -> Vec<PvRow> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cols = parse_tabbed_line(line);
            if cols.len() < 4 {
                return None;
            }
            let vg_name = if cols[1].is_empty() {
                None
            } else {
                Some(cols[1].clone())
            };

            Some(PvRow {
                pv_name: cols[0].clone(),
                vg_name,
                size: cols[2].parse().ok()?,
                free: cols[3].parse().ok()?,
            })
        })
        .collect()
}

fn parse_lvs(output: &str) -> Vec<LvRow> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cols = parse_tabbed_line(line);
            if cols.len() < 5 {
                return None;
            }

            Some(LvRow {
                vg_name: cols[0].clone(),
                lv_name: cols[1].clone(),
                lv_path: cols[2].clone(),
                size: cols[3].parse().ok()?,
                active: cols[4].eq_ignore_ascii_case("active") || cols[4] == "y",
            })
        })
        .collect()
}

pub fn list_pvs() -> Result<Vec<PvRow>> {
    let output = exec::run(
        "pvs",
        &[
            "--noheadings",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            "pv_name,vg_name,pv_size,pv_free",
            "--separator",
            "\t",
        ],
    )?;
    Ok(parse_pvs(&output))
}

pub fn list_lvs() -> Result<Vec<LvRow>> {
    let output = exec::run(
        "lvs",
        &[
            "--noheadings",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            "vg_name,lv_name,lv_path,lv_size,lv_active",
            "--separator",
            "\t",
        ],
    )?;
    Ok(parse_lvs(&output))
}

fn members_of(rows: &[PvRow], vg: &str) -> Vec<String> {
    rows.iter()
        .filter(|pv| pv.vg_name.as_deref() == Some(vg))
        .map(|pv| pv.pv_name.clone())
        .collect()
}

/// Physical volumes of `vg`, in `pvs` order.
pub fn vg_pv_list(vg: &str) -> Result<Vec<String>> {
    Ok(members_of(&list_pvs()?, vg))
}

pub fn vg_exists(vg: &str) -> Result<bool> {
    let (status, _) = exec::run_with_status("vgs", &["--noheadings", vg])?;
    Ok(status == 0)
}

pub fn lv_exists(vg: &str, lv: &str) -> Result<bool> {
    Ok(list_lvs()?
        .iter()
        .any(|row| row.vg_name == vg && row.lv_name == lv))
}

/// Initialise `device` as a physical volume and add it to `vg`.
///
/// The group is created when missing only if `may_create` is set.
pub fn add_pv_to_vg(device: &str, vg: &str, may_create: bool) -> Result<()> {
    exec::run("pvcreate", &["-ff", "-y", device])?;
    if vg_exists(vg)? {
        tracing::info!("extending volume group {vg} with {device}");
        exec::run("vgextend", &[vg, device])?;
    } else if may_create {
        tracing::info!("creating volume group {vg} on {device}");
        exec::run("vgcreate", &[vg, device])?;
    } else {
        return Err(SysError::Precondition(format!(
            "volume group {vg} does not exist"
        )));
    }
    Ok(())
}

pub fn create_lv(vg: &str, lv: &str, size: LvSize) -> Result<()> {
    if lv_exists(vg, lv)? {
        return Err(SysError::Precondition(format!(
            "logical volume {vg}/{lv} already exists"
        )));
    }
    let bytes;
    let size_args: [&str; 2] = match size {
        LvSize::AllFree => ["-l", "100%FREE"],
        LvSize::Bytes(n) => {
            bytes = format!("{n}b");
            ["-L", &bytes]
        }
    };
    tracing::info!("creating logical volume {vg}/{lv}");
    exec::run(
        "lvcreate",
        &["-y", "-W", "y", size_args[0], size_args[1], "-n", lv, vg],
    )?;
    Ok(())
}

pub fn activate_all() -> Result<()> {
    exec::run("vgchange", &["-ay"])?;
    Ok(())
}

pub fn deactivate_vg(vg: &str) -> Result<()> {
    exec::run("vgchange", &["-an", vg])?;
    Ok(())
}

/// Grow `lv_path` over all free extents. Returns false when there were none.
pub fn auto_extend_lv(lv_path: &str) -> Result<bool> {
    let args = ["-l", "+100%FREE", lv_path];
    let (status, output) = exec::run_with_status("lvextend", &args)?;
    match status {
        0 => Ok(true),
        LVEXTEND_UNCHANGED => {
            tracing::debug!("{lv_path} already spans all free extents");
            Ok(false)
        }
        _ => Err(SysError::CommandFailed {
            command: exec::render("lvextend", &args),
            status,
            output,
        }),
    }
}

/// Move all extents off `device`. The raw status is returned for the caller
/// to judge.
pub fn evacuate_pv(device: &str) -> Result<(i32, String)> {
    tracing::info!("evacuating physical volume {device}");
    exec::run_with_status("pvmove", &[device])
}

pub fn remove_pv_from_vg(vg: &str, device: &str) -> Result<()> {
    tracing::info!("removing {device} from volume group {vg}");
    exec::run("vgreduce", &[vg, device])?;
    exec::run("pvremove", &["-y", device])?;
    Ok(())
}
