// SPDX-License-Identifier: GPL-3.0-only

//! bcachefs command wrappers
//!
//! A multi-device bcachefs root is named by its members joined with `:`.
//! Cache members are labelled `ssd.N` and target foreground writes and
//! promotion; backing members are labelled `hdd.N` and take background writes.

use std::fs;
use std::path::PathBuf;

use crate::exec;
use crate::{Result, SysError};

pub const SSD_LABEL: &str = "ssd";
pub const HDD_LABEL: &str = "hdd";

/// Options that point at the cache group while an SSD is a member.
pub const SSD_TARGET_OPTIONS: [&str; 2] = ["foreground_target", "promote_target"];

/// Join member devices into a mountable device spec.
pub fn join_root_spec(devices: &[String]) -> String {
    devices.join(":")
}

/// Split a colon-joined spec back into member devices.
pub fn split_root_spec(spec: &str) -> Vec<String> {
    spec.split(':')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn labels(prefix: &str, devices: &[String], first: usize) -> Vec<(String, String)> {
    devices
        .iter()
        .enumerate()
        .map(|(i, dev)| (format!("{prefix}.{}", first + i + 1), dev.clone()))
        .collect()
}

/// Build the `bcachefs format` argument list.
fn format_args(
    cache_devices: &[String],
    backing_devices: &[String],
    metadata_replicas: u32,
    data_replicas: u32,
) -> Vec<String> {
    let mut args = vec![
        "format".to_string(),
        "-f".to_string(),
        format!("--metadata_replicas={metadata_replicas}"),
        format!("--data_replicas={data_replicas}"),
    ];
    for (label, dev) in labels(SSD_LABEL, cache_devices, 0)
        .into_iter()
        .chain(labels(HDD_LABEL, backing_devices, 0))
    {
        args.push(format!("--label={label}"));
        args.push(dev);
    }
    if !cache_devices.is_empty() {
        for option in SSD_TARGET_OPTIONS {
            args.push(format!("--{option}={SSD_LABEL}"));
        }
    }
    if !backing_devices.is_empty() {
        args.push(format!("--background_target={HDD_LABEL}"));
    }
    args
}

pub fn create_filesystem(
    cache_devices: &[String],
    backing_devices: &[String],
    metadata_replicas: u32,
    data_replicas: u32,
) -> Result<()> {
    if cache_devices.is_empty() && backing_devices.is_empty() {
        return Err(SysError::Precondition(
            "bcachefs needs at least one device".to_string(),
        ));
    }
    tracing::info!(
        "creating bcachefs on {} cache and {} backing devices",
        cache_devices.len(),
        backing_devices.len()
    );
    let args = format_args(cache_devices, backing_devices, metadata_replicas, data_replicas);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    exec::run("bcachefs", &args)?;
    Ok(())
}

/// Add `device` to the filesystem mounted at `mountpoint` under `label`.
pub fn add_device(device: &str, mountpoint: &str, label: &str) -> Result<()> {
    tracing::info!("adding {device} to bcachefs at {mountpoint} as {label}");
    let label = format!("--label={label}");
    exec::run("bcachefs", &["device", "add", &label, mountpoint, device])?;
    Ok(())
}

/// Migrate all data off `device`, then drop it from its filesystem.
pub fn remove_device(device: &str) -> Result<()> {
    tracing::info!("evacuating bcachefs member {device}");
    exec::run("bcachefs", &["device", "evacuate", device])?;
    exec::run("bcachefs", &["device", "remove", device])?;
    Ok(())
}

/// Label for the next member of group `prefix`, one past the highest index
/// among `existing` labels. Indices of removed members are not reused.
pub fn next_label(prefix: &str, existing: &[String]) -> String {
    let highest = existing
        .iter()
        .filter_map(|label| label.strip_prefix(prefix)?.strip_prefix('.')?.parse::<usize>().ok())
        .max()
        .unwrap_or(0);
    format!("{prefix}.{}", highest + 1)
}

/// Target value that clears a target option.
pub const NO_TARGET: &str = "none";

/// Runtime options and member metadata of mounted filesystems, through
/// `/sys/fs/bcachefs/<uuid>`.
#[derive(Debug, Clone)]
pub struct BcachefsControl {
    sys_root: PathBuf,
}

impl Default for BcachefsControl {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl BcachefsControl {
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
        }
    }

    fn fs_dir(&self, fs_uuid: &str) -> PathBuf {
        self.sys_root.join("fs/bcachefs").join(fs_uuid)
    }

    /// Change a filesystem option while mounted.
    pub fn set_option(&self, fs_uuid: &str, option: &str, value: &str) -> Result<()> {
        let path = self.fs_dir(fs_uuid).join("options").join(option);
        tracing::info!("bcachefs {fs_uuid}: {option} <- {value}");
        if !path.exists() {
            return Err(SysError::DeviceNotFound(path.display().to_string()));
        }
        fs::write(&path, value)?;
        Ok(())
    }

    /// Labels of every member, sorted. Unlabelled members are skipped.
    pub fn member_labels(&self, fs_uuid: &str) -> Result<Vec<String>> {
        let dir = self.fs_dir(fs_uuid);
        if !dir.is_dir() {
            return Err(SysError::DeviceNotFound(format!("bcachefs {fs_uuid} is not mounted")));
        }
        let mut labels = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with("dev-") {
                continue;
            }
            let label = match fs::read_to_string(entry.path().join("label")) {
                Ok(label) => label.trim().to_string(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !label.is_empty() && label != "(none)" {
                labels.push(label);
            }
        }
        labels.sort();
        Ok(labels)
    }
}
