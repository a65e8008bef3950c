// SPDX-License-Identifier: GPL-3.0-only

//! Layout configuration
//!
//! Read from TOML. Every field is optional; missing ones take the defaults
//! below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use storage_sys::tools::BcacheFormat;

use crate::error::{LayoutError, Result};

/// Environment variable naming a configuration file
pub const CONFIG_ENV: &str = "STRICT_STORAGE_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/strict-storage.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Size of every ESP, SSD and HDD alike
    pub esp_size_mib: u64,

    /// SSD swap partition size; `None` follows installed memory, `0` disables swap
    pub swap_size_gib: Option<u64>,

    /// bcache block size in 512-byte sectors
    pub bcache_block_size: Option<u16>,

    /// bcache bucket size in 512-byte sectors
    pub bcache_bucket_size: Option<u16>,

    pub bcachefs_metadata_replicas: u32,
    pub bcachefs_data_replicas: u32,

    /// Wait after a partition table change before touching partitions
    pub settle_delay_ms: u64,

    /// Wait after a tool was killed by a signal
    pub signal_grace_ms: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            esp_size_mib: 512,
            swap_size_gib: None,
            bcache_block_size: None,
            bcache_bucket_size: None,
            bcachefs_metadata_replicas: 1,
            bcachefs_data_replicas: 1,
            settle_delay_ms: 3000,
            signal_grace_ms: 1000,
        }
    }
}

impl LayoutConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| LayoutError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `explicit`, then `$STRICT_STORAGE_CONFIG`, then the default
    /// path. Only a missing default file falls back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let chosen = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let (path, required) = match chosen {
            Some(path) => (path, true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        match fs::read_to_string(&path) {
            Ok(raw) => {
                tracing::debug!("loading configuration from {}", path.display());
                Self::from_toml_str(&raw)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(e) => Err(LayoutError::Config(format!("{}: {e}", path.display()))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.esp_size_mib == 0 {
            return Err(LayoutError::Config("esp_size_mib must be positive".to_string()));
        }
        if self.bcachefs_metadata_replicas == 0 || self.bcachefs_data_replicas == 0 {
            return Err(LayoutError::Config(
                "bcachefs replica counts must be positive".to_string(),
            ));
        }
        if let (Some(block), Some(bucket)) = (self.bcache_block_size, self.bcache_bucket_size)
            && bucket < block
        {
            return Err(LayoutError::Config(format!(
                "bcache_bucket_size ({bucket}) is smaller than bcache_block_size ({block})"
            )));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn signal_grace(&self) -> Duration {
        Duration::from_millis(self.signal_grace_ms)
    }

    pub fn bcache_format(&self) -> BcacheFormat {
        BcacheFormat {
            block_size: self.bcache_block_size,
            bucket_size: self.bcache_bucket_size,
        }
    }
}
