// SPDX-License-Identifier: GPL-3.0-only

//! Device probing
//!
//! Classification and topology queries read sysfs below a configurable root
//! so they can run against a fabricated tree. Filesystem and partition table
//! identification goes through `blkid`, LVM identity through `dmsetup`.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use storage_types::{DiskKind, PartitionTableType, is_disk_path, partition_to_disk};

use crate::exec;
use crate::{Result, SysError};

const DEFAULT_SYS_ROOT: &str = "/sys";
const IGNORED_DISK_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "bcache", "md", "sr"];

/// `blkid` exit status when the requested token is not present.
const BLKID_NOT_FOUND: i32 = 2;

/// Size and logical sector size of a block device or image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub size_bytes: u64,
    pub logical_sector_size: u64,
}

/// Read the geometry of a block device through `blockdev`, or of a regular
/// file from its metadata (512-byte sectors).
pub fn block_geometry(path: &Path) -> Result<BlockGeometry> {
    let metadata = fs::metadata(path)?;
    if !metadata.file_type().is_block_device() {
        return Ok(BlockGeometry {
            size_bytes: metadata.len(),
            logical_sector_size: 512,
        });
    }

    let device = path.to_string_lossy();
    let size = exec::run("blockdev", &["--getsize64", &device])?;
    let sector = exec::run("blockdev", &["--getss", &device])?;
    Ok(BlockGeometry {
        size_bytes: parse_number(&size)?,
        logical_sector_size: parse_number(&sector)?,
    })
}

fn parse_number(text: &str) -> Result<u64> {
    text.trim()
        .parse()
        .map_err(|_| SysError::Parse(format!("expected a number, got {text:?}")))
}

/// Kernel name of a device path: `/dev/sda1` -> `sda1`.
pub fn device_name(device: &str) -> &str {
    device.strip_prefix("/dev/").unwrap_or(device)
}

/// Split a device-mapper name into `(vg, lv)`.
///
/// Dashes inside either name are doubled: `my--vg-root` is `my-vg`/`root`.
pub fn parse_dm_name(name: &str) -> Option<(String, String)> {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'-' {
            if bytes.get(i + 1) == Some(&b'-') {
                i += 2;
                continue;
            }
            let vg = name[..i].replace("--", "-");
            let lv = name[i + 1..].replace("--", "-");
            if vg.is_empty() || lv.is_empty() {
                return None;
            }
            return Some((vg, lv));
        }
        i += 1;
    }
    None
}

#[derive(Debug, Clone)]
pub struct DeviceProbe {
    sys_root: PathBuf,
}

impl Default for DeviceProbe {
    fn default() -> Self {
        Self::new(DEFAULT_SYS_ROOT)
    }
}

impl DeviceProbe {
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
        }
    }

    pub fn sys_root(&self) -> &Path {
        &self.sys_root
    }

    fn block_dir(&self, name: &str) -> PathBuf {
        self.sys_root.join("block").join(name)
    }

    /// sysfs directory of a disk or partition.
    fn device_dir(&self, device: &str) -> Result<PathBuf> {
        if is_disk_path(device)? {
            return Ok(self.block_dir(device_name(device)));
        }
        let disk = partition_to_disk(device)?;
        Ok(self
            .block_dir(device_name(&disk))
            .join(device_name(device)))
    }

    fn read_attr(&self, path: &Path) -> Result<String> {
        match fs::read_to_string(path) {
            Ok(value) => Ok(value.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SysError::DeviceNotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// SSD or HDD, from `queue/rotational` of the device's disk.
    pub fn disk_kind(&self, device: &str) -> Result<DiskKind> {
        let disk = if is_disk_path(device)? {
            device.to_string()
        } else {
            partition_to_disk(device)?
        };
        let path = self.block_dir(device_name(&disk)).join("queue/rotational");
        match self.read_attr(&path)?.as_str() {
            flag @ ("0" | "1") => Ok(DiskKind::from_rotational(flag == "1")),
            other => Err(SysError::Parse(format!(
                "{}: unexpected rotational flag {other:?}",
                path.display()
            ))),
        }
    }

    /// Size in bytes, from the sysfs `size` attribute (512-byte units).
    pub fn size_bytes(&self, device: &str) -> Result<u64> {
        let path = self.device_dir(device)?.join("size");
        Ok(parse_number(&self.read_attr(&path)?)? * 512)
    }

    /// Partitions of `disk`, ordered by partition number.
    pub fn partitions(&self, disk: &str) -> Result<Vec<String>> {
        if !is_disk_path(disk)? {
            return Err(SysError::Precondition(format!("{disk} is not a disk")));
        }
        let dir = self.block_dir(device_name(disk));
        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let number_file = entry.path().join("partition");
            if !number_file.is_file() {
                continue;
            }
            let number = parse_number(&self.read_attr(&number_file)?)?;
            found.push((number, format!("/dev/{}", entry.file_name().to_string_lossy())));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    fn is_usb(&self, name: &str) -> bool {
        fs::read_link(self.block_dir(name))
            .map(|target| {
                target
                    .components()
                    .any(|c| c.as_os_str().to_string_lossy().starts_with("usb"))
            })
            .unwrap_or(false)
    }

    fn is_candidate_name(&self, name: &str) -> bool {
        !IGNORED_DISK_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
            && is_disk_path(&format!("/dev/{name}")).unwrap_or(false)
            && !self.is_usb(name)
    }

    /// Whether `device` is a local (non-USB) whole disk.
    pub fn is_fixed_disk(&self, device: &str) -> Result<bool> {
        let name = device_name(device);
        Ok(self.block_dir(name).exists() && self.is_candidate_name(name))
    }

    /// Every fixed disk in the system, sorted by path.
    pub fn fixed_disks(&self) -> Result<Vec<String>> {
        let mut disks = Vec::new();
        for entry in fs::read_dir(self.sys_root.join("block"))? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if self.is_candidate_name(&name) {
                disks.push(format!("/dev/{name}"));
            }
        }
        disks.sort();
        Ok(disks)
    }

    /// Name of the device that owns the `bcache` directory of a composed device.
    fn backing_name_of(&self, bcache_name: &str) -> Option<String> {
        let target = fs::read_link(self.block_dir(bcache_name).join("bcache")).ok()?;
        target
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_string())
    }

    /// Slave devices of a composed bcache device: cache devices first, the
    /// backing device last.
    pub fn bcache_slaves(&self, bcache_dev: &str) -> Result<Vec<String>> {
        let name = device_name(bcache_dev);
        let slaves_dir = self.block_dir(name).join("slaves");
        let mut slaves = Vec::new();
        for entry in fs::read_dir(&slaves_dir)? {
            slaves.push(entry?.file_name().to_string_lossy().to_string());
        }
        slaves.sort();

        let backing = self.backing_name_of(name).ok_or_else(|| {
            SysError::Parse(format!("{bcache_dev} has no backing device link"))
        })?;
        let position = slaves
            .iter()
            .position(|slave| *slave == backing)
            .ok_or_else(|| {
                SysError::Parse(format!("{backing} is not a slave of {bcache_dev}"))
            })?;
        let backing = slaves.remove(position);
        slaves.push(backing);

        Ok(slaves.into_iter().map(|s| format!("/dev/{s}")).collect())
    }

    /// The composed `/dev/bcacheN` whose backing device is `backing`.
    pub fn find_bcache_by_backing(&self, backing: &str) -> Result<Option<String>> {
        let wanted = device_name(backing);
        let block = self.sys_root.join("block");
        let mut names = Vec::new();
        for entry in fs::read_dir(&block)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if name.starts_with("bcache") {
                names.push(name);
            }
        }
        names.sort();

        Ok(names
            .into_iter()
            .find(|name| self.backing_name_of(name).as_deref() == Some(wanted))
            .map(|name| format!("/dev/{name}")))
    }

    fn blkid_value(&self, device: &str, tag: &str) -> Result<String> {
        let (status, output) =
            exec::run_with_status("blkid", &["-p", "-o", "value", "-s", tag, device])?;
        match status {
            0 => Ok(output.trim().to_string()),
            BLKID_NOT_FOUND => Ok(String::new()),
            _ => Err(SysError::CommandFailed {
                command: exec::render("blkid", &["-p", "-o", "value", "-s", tag, device]),
                status,
                output,
            }),
        }
    }

    /// Filesystem type as reported by `blkid`, empty when unrecognised.
    pub fn filesystem_type(&self, device: &str) -> Result<String> {
        self.blkid_value(device, "TYPE")
    }

    pub fn filesystem_uuid(&self, device: &str) -> Result<Option<String>> {
        let uuid = self.blkid_value(device, "UUID")?;
        Ok((!uuid.is_empty()).then_some(uuid))
    }

    pub fn partition_table_type(&self, device: &str) -> Result<Option<PartitionTableType>> {
        let value = self.blkid_value(device, "PTTYPE")?;
        Ok(PartitionTableType::from_blkid(&value))
    }

    /// `(vg, lv)` of a device-mapper device, `None` for anything else.
    pub fn lvm_info(&self, device: &str) -> Result<Option<(String, String)>> {
        let (status, output) = exec::run_with_status(
            "dmsetup",
            &["info", "-c", "--noheadings", "-o", "name,subsystem", device],
        )?;
        if status != 0 {
            return Ok(None);
        }
        Ok(parse_dm_info(&output))
    }
}

/// Parse `dmsetup info -c -o name,subsystem` output.
fn parse_dm_info(output: &str) -> Option<(String, String)> {
    let line = output.lines().find(|line| !line.trim().is_empty())?;
    let mut cols = line.trim().split(':');
    let name = cols.next()?;
    let subsystem = cols.next().unwrap_or("LVM");
    if subsystem != "LVM" {
        return None;
    }
    parse_dm_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn write(path: &Path, value: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, value).unwrap();
    }

    /// sda (ssd, 2 partitions), sdb (hdd via usb), sdc (hdd), loop0 and a
    /// composed bcache0 on sdc2 with sda2 as cache.
    fn fake_sysfs() -> TempDir {
        let root = TempDir::new().unwrap();
        let sys = root.path();
        let devices = sys.join("devices");

        for (name, rotational, bus) in [
            ("sda", "0", "pci0000:00/ata1"),
            ("sdb", "1", "pci0000:00/usb1/1-1"),
            ("sdc", "1", "pci0000:00/ata2"),
            ("loop0", "0", "virtual"),
        ] {
            let dir = devices.join(bus).join(name);
            write(&dir.join("queue/rotational"), rotational);
            write(&dir.join("size"), "2097152");
            fs::create_dir_all(sys.join("block")).unwrap();
            symlink(&dir, sys.join("block").join(name)).unwrap();
        }
        for (disk, bus) in [("sda", "pci0000:00/ata1"), ("sdc", "pci0000:00/ata2")] {
            for number in [2, 1] {
                let part = devices.join(bus).join(disk).join(format!("{disk}{number}"));
                write(&part.join("partition"), &number.to_string());
                write(&part.join("size"), "1024");
            }
        }

        let bcache = devices.join("virtual/bcache0");
        fs::create_dir_all(bcache.join("slaves")).unwrap();
        for slave in ["sdc2", "sda2"] {
            fs::create_dir_all(bcache.join("slaves").join(slave)).unwrap();
        }
        let backing_dir = devices.join("pci0000:00/ata2/sdc/sdc2/bcache");
        fs::create_dir_all(&backing_dir).unwrap();
        symlink(&backing_dir, bcache.join("bcache")).unwrap();
        symlink(&bcache, sys.join("block/bcache0")).unwrap();

        root
    }

    #[test]
    fn classifies_rotational_flag() {
        let sys = fake_sysfs();
        let probe = DeviceProbe::new(sys.path());
        assert_eq!(probe.disk_kind("/dev/sda").unwrap(), DiskKind::Ssd);
        assert_eq!(probe.disk_kind("/dev/sdc1").unwrap(), DiskKind::Hdd);
        assert!(matches!(
            probe.disk_kind("/dev/sdz"),
            Err(SysError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn lists_partitions_and_sizes() {
        let sys = fake_sysfs();
        let probe = DeviceProbe::new(sys.path());
        assert_eq!(probe.partitions("/dev/sda").unwrap(), vec!["/dev/sda1", "/dev/sda2"]);
        assert_eq!(probe.size_bytes("/dev/sda").unwrap(), 1 << 30);
        assert_eq!(probe.size_bytes("/dev/sda2").unwrap(), 1024 * 512);
        assert!(probe.partitions("/dev/sda1").is_err());
    }

    #[test]
    fn fixed_disks_skip_usb_and_virtual_devices() {
        let sys = fake_sysfs();
        let probe = DeviceProbe::new(sys.path());
        assert_eq!(probe.fixed_disks().unwrap(), vec!["/dev/sda", "/dev/sdc"]);
        assert!(probe.is_fixed_disk("/dev/sdc").unwrap());
        assert!(!probe.is_fixed_disk("/dev/sdb").unwrap());
        assert!(!probe.is_fixed_disk("/dev/sdq").unwrap());
    }

    #[test]
    fn bcache_slaves_put_backing_last() {
        let sys = fake_sysfs();
        let probe = DeviceProbe::new(sys.path());
        assert_eq!(
            probe.bcache_slaves("/dev/bcache0").unwrap(),
            vec!["/dev/sda2", "/dev/sdc2"]
        );
        assert_eq!(
            probe.find_bcache_by_backing("/dev/sdc2").unwrap().as_deref(),
            Some("/dev/bcache0")
        );
        assert_eq!(probe.find_bcache_by_backing("/dev/sda2").unwrap(), None);
    }

    #[test]
    fn parses_device_mapper_names() {
        assert_eq!(parse_dm_name("hdd-root"), Some(("hdd".into(), "root".into())));
        assert_eq!(parse_dm_name("my--vg-lv--1"), Some(("my-vg".into(), "lv-1".into())));
        assert_eq!(parse_dm_name("luks"), None);
        assert_eq!(parse_dm_info("hdd-root:LVM\n"), Some(("hdd".into(), "root".into())));
        assert_eq!(parse_dm_info("luks-1234:CRYPT\n"), None);
    }

    #[test]
    fn image_geometry_comes_from_metadata() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(1 << 20).unwrap();
        let geometry = block_geometry(file.path()).unwrap();
        assert_eq!(geometry.size_bytes, 1 << 20);
        assert_eq!(geometry.logical_sector_size, 512);
    }
}
