// SPDX-License-Identifier: GPL-3.0-only

//! Root plus ESP mount controller
//!
//! The root filesystem is mounted on the target directory and the boot ESP
//! read-only on `<dir>/boot`. A controller attached to an already running
//! system never unmounts anything.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use storage_types::{FS_TYPE_BCACHEFS, FS_TYPE_VFAT};

use crate::contracts::Host;
use crate::error::Result;

const BOOT_SUBDIR: &str = "boot";

pub struct MountEfi {
    host: Arc<dyn Host>,
    dir: PathBuf,
    owned: bool,
    mounted: bool,
}

impl std::fmt::Debug for MountEfi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountEfi")
            .field("dir", &self.dir)
            .field("owned", &self.owned)
            .field("mounted", &self.mounted)
            .finish()
    }
}

impl MountEfi {
    /// Mount `root_spec` on `dir` and `boot_partition` on `<dir>/boot`.
    ///
    /// A colon-joined spec is a multi-device bcachefs.
    pub fn mount(
        host: Arc<dyn Host>,
        root_spec: &str,
        boot_partition: &str,
        dir: &Path,
    ) -> Result<Self> {
        let fs_type = root_spec.contains(':').then_some(FS_TYPE_BCACHEFS);
        host.mount(root_spec, dir, fs_type, None)?;

        let boot = dir.join(BOOT_SUBDIR);
        if let Err(e) = host.mount(boot_partition, &boot, Some(FS_TYPE_VFAT), Some("ro")) {
            if let Err(undo) = host.umount(dir) {
                tracing::warn!("could not unmount {} after failure: {undo}", dir.display());
            }
            return Err(e.into());
        }

        Ok(Self {
            host,
            dir: dir.to_path_buf(),
            owned: true,
            mounted: true,
        })
    }

    /// Wrap a system that is already mounted at `dir`.
    pub fn attach(host: Arc<dyn Host>, dir: &Path) -> Self {
        Self {
            host,
            dir: dir.to_path_buf(),
            owned: false,
            mounted: true,
        }
    }

    pub fn mount_dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn boot_dir(&self) -> PathBuf {
        self.dir.join(BOOT_SUBDIR)
    }

    /// Unmount the ESP, then the root. Does nothing for attached systems.
    pub fn umount(&mut self) -> Result<()> {
        if !self.owned || !self.mounted {
            return Ok(());
        }
        self.host.umount(&self.boot_dir())?;
        self.host.umount(&self.dir)?;
        self.mounted = false;
        Ok(())
    }

    pub fn remount_rootfs(&self, options: &str) -> Result<()> {
        self.host.remount(&self.dir, options)?;
        Ok(())
    }

    pub fn get_bootdir_rw_controller(&self) -> BootDirRwController {
        BootDirRwController {
            host: Arc::clone(&self.host),
            dir: self.boot_dir(),
        }
    }
}

/// Switches the mounted ESP between read-only and read-write.
pub struct BootDirRwController {
    host: Arc<dyn Host>,
    dir: PathBuf,
}

impl BootDirRwController {
    pub fn is_writable(&self) -> Result<bool> {
        Ok(self.host.is_writable(&self.dir)?)
    }

    pub fn to_read_write(&self) -> Result<()> {
        if !self.is_writable()? {
            self.host.remount(&self.dir, "rw")?;
        }
        Ok(())
    }

    pub fn to_read_only(&self) -> Result<()> {
        if self.is_writable()? {
            self.host.remount(&self.dir, "ro")?;
        }
        Ok(())
    }
}
