// SPDX-License-Identifier: GPL-3.0-only

//! Mount and unmount, plus `/proc/self/mountinfo` queries

use std::fs;
use std::path::{Path, PathBuf};

use crate::exec;
use crate::{Result, SysError};

const MOUNTINFO: &str = "/proc/self/mountinfo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_writable(&self) -> bool {
        self.options.iter().any(|opt| opt == "rw")
    }
}

pub fn parse_mountinfo(input: &str) -> Result<Vec<MountEntry>> {
    let invalid = |line: &str| SysError::Parse(format!("invalid mountinfo line: {line}"));
    let mut entries = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let (left, right) = line.split_once(" - ").ok_or_else(|| invalid(line))?;

        let left_fields: Vec<&str> = left.split_whitespace().collect();
        if left_fields.len() < 6 {
            return Err(invalid(line));
        }
        let mut right_fields = right.split_whitespace();
        let fs_type = right_fields.next().ok_or_else(|| invalid(line))?;
        let source = right_fields.next().unwrap_or("none");

        entries.push(MountEntry {
            source: unescape_mount_field(source),
            mount_point: PathBuf::from(unescape_mount_field(left_fields[4])),
            fs_type: fs_type.to_string(),
            options: left_fields[5].split(',').map(str::to_string).collect(),
        });
    }

    Ok(entries)
}

fn unescape_mount_field(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..index + 4].iter().all(u8::is_ascii_digit)
        {
            if let Ok(num) = u8::from_str_radix(&value[index + 1..index + 4], 8) {
                output.push(num as char);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index] as char);
        index += 1;
    }

    output
}

pub fn current_mounts() -> Result<Vec<MountEntry>> {
    parse_mountinfo(&fs::read_to_string(MOUNTINFO)?)
}

/// Topmost mount at exactly `dir`.
pub fn find_mount(dir: &Path) -> Result<Option<MountEntry>> {
    Ok(current_mounts()?
        .into_iter()
        .rev()
        .find(|entry| entry.mount_point == dir))
}

pub fn is_writable(dir: &Path) -> Result<bool> {
    find_mount(dir)?
        .map(|entry| entry.is_writable())
        .ok_or_else(|| SysError::DeviceNotFound(format!("nothing mounted at {}", dir.display())))
}

/// Mount `source` on `dir`, creating `dir` when missing.
pub fn mount(source: &str, dir: &Path, fs_type: Option<&str>, options: Option<&str>) -> Result<()> {
    fs::create_dir_all(dir)?;
    let dir_str = dir.to_string_lossy();
    let mut args: Vec<&str> = Vec::new();
    if let Some(fs_type) = fs_type {
        args.extend(["-t", fs_type]);
    }
    if let Some(options) = options {
        args.extend(["-o", options]);
    }
    args.push(source);
    args.push(&dir_str);
    tracing::info!("mounting {source} on {}", dir.display());
    exec::run("mount", &args)?;
    Ok(())
}

pub fn umount(dir: &Path) -> Result<()> {
    tracing::info!("unmounting {}", dir.display());
    exec::run("umount", &[&dir.to_string_lossy()])?;
    Ok(())
}

pub fn remount(dir: &Path, options: &str) -> Result<()> {
    let options = format!("remount,{options}");
    exec::run("mount", &["-o", &options, &dir.to_string_lossy()])?;
    Ok(())
}
