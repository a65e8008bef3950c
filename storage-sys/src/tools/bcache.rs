// SPDX-License-Identifier: GPL-3.0-only

//! bcache control through sysfs
//!
//! Superblocks are written by [`crate::codec::bcache`]; registration,
//! attachment and teardown go through the kernel's sysfs files.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use storage_types::BcacheRole;
use uuid::Uuid;

use crate::codec::bcache::{is_bcache_device, make_device, read_set_uuid};
use crate::probe::{DeviceProbe, device_name};
use crate::{Result, SysError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Superblock geometry for new devices, in 512-byte sectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BcacheFormat {
    pub block_size: Option<u16>,
    pub bucket_size: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct BcacheControl {
    sys_root: PathBuf,
}

impl Default for BcacheControl {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl BcacheControl {
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
        }
    }

    fn write_sysfs(&self, path: &Path, value: &str) -> Result<()> {
        tracing::debug!("sysfs: {} <- {value}", path.display());
        let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SysError::DeviceNotFound(path.display().to_string())
            } else {
                SysError::Io(e)
            }
        })?;
        file.write_all(value.as_bytes())?;
        Ok(())
    }

    fn bcache_attr(&self, bcache_dev: &str, attr: &str) -> PathBuf {
        self.sys_root
            .join("block")
            .join(device_name(bcache_dev))
            .join("bcache")
            .join(attr)
    }

    /// Hand a formatted device to the kernel.
    pub fn register(&self, device: &str) -> Result<()> {
        tracing::info!("registering bcache device {device}");
        self.write_sysfs(&self.sys_root.join("fs/bcache/register"), device)
    }

    /// Format and register `partition` as a backing device. Returns its uuid.
    pub fn make_and_register_backing(&self, partition: &str, format: BcacheFormat) -> Result<Uuid> {
        let (uuid, _) = make_device(
            Path::new(partition),
            BcacheRole::Backing,
            format.block_size,
            format.bucket_size,
            None,
        )?;
        self.register(partition)?;
        Ok(uuid)
    }

    /// Format and register `partition` as a cache device. Returns the cache set uuid.
    pub fn make_and_register_cache(&self, partition: &str, format: BcacheFormat) -> Result<Uuid> {
        let (_, set_uuid) = make_device(
            Path::new(partition),
            BcacheRole::Cache,
            format.block_size,
            format.bucket_size,
            None,
        )?;
        self.register(partition)?;
        Ok(set_uuid)
    }

    /// Attach every composed device in `bcache_devs` to the cache set on
    /// `cache_partition`.
    pub fn attach_cache_device(&self, bcache_devs: &[String], cache_partition: &str) -> Result<()> {
        let set_uuid = read_set_uuid(Path::new(cache_partition))?;
        for bcache_dev in bcache_devs {
            tracing::info!("attaching {bcache_dev} to cache set {set_uuid}");
            self.write_sysfs(&self.bcache_attr(bcache_dev, "attach"), &set_uuid.to_string())?;
        }
        Ok(())
    }

    /// Unregister the cache set whose cache device is `cache_partition`.
    pub fn unregister_cache_device(&self, cache_partition: &str) -> Result<()> {
        let set_uuid = read_set_uuid(Path::new(cache_partition))?;
        tracing::info!("unregistering cache set {set_uuid}");
        let path = self
            .sys_root
            .join("fs/bcache")
            .join(set_uuid.to_string())
            .join("unregister");
        self.write_sysfs(&path, "1")
    }

    /// Stop a composed device, releasing its backing device.
    pub fn stop_backing_device(&self, bcache_dev: &str) -> Result<()> {
        tracing::info!("stopping {bcache_dev}");
        self.write_sysfs(&self.bcache_attr(bcache_dev, "stop"), "1")
    }

    /// Register every device in `candidates` carrying a bcache superblock.
    ///
    /// A device the kernel already holds is skipped; any other registration
    /// failure is returned.
    pub fn scan_and_register_all(&self, candidates: &[String]) -> Result<Vec<String>> {
        let mut registered = Vec::new();
        for device in candidates {
            let path = Path::new(device);
            if !is_bcache_device(path, BcacheRole::Backing)? && !is_bcache_device(path, BcacheRole::Cache)? {
                continue;
            }
            match self.register(device) {
                Ok(()) => registered.push(device.clone()),
                Err(e) if is_already_registered(&e) => {
                    tracing::debug!("{device} is already registered");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(registered)
    }

    /// Wait until the kernel composed a `/dev/bcacheN` on `backing`.
    pub fn wait_for_bcache(&self, backing: &str, timeout: Duration) -> Result<String> {
        let probe = DeviceProbe::new(self.sys_root.clone());
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(dev) = probe.find_bcache_by_backing(backing)? {
                return Ok(dev);
            }
            if Instant::now() >= deadline {
                return Err(SysError::DeviceNotFound(format!(
                    "no bcache device composed on {backing}"
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn is_already_registered(err: &SysError) -> bool {
    match err {
        SysError::Io(e) => e
            .raw_os_error()
            .is_some_and(|code| code == Errno::EBUSY as i32 || code == Errno::EEXIST as i32),
        _ => false,
    }
}

/// `/dev/bcacheN` if `device` is a composed bcache device.
pub fn bcache_dev_from_dev_path(device: &str) -> Option<String> {
    let name = device_name(device);
    let number = name.strip_prefix("bcache")?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("/dev/{name}"))
}
