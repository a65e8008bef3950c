// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use storage_sys::SysError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateReason {
    NoDisk,
    MultipleSsd,
}

impl fmt::Display for CreateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDisk => write!(f, "no hard disk given"),
            Self::MultipleSsd => write!(f, "multiple SSDs given, at most one is allowed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddDiskReason {
    NotFixedDisk,
    SsdAlreadyPresent,
    AlreadyMember,
}

impl fmt::Display for AddDiskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFixedDisk => write!(f, "not a fixed disk"),
            Self::SsdAlreadyPresent => write!(f, "the layout already has an SSD"),
            Self::AlreadyMember => write!(f, "already part of the layout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveDiskReason {
    SwapInUse,
    LastHdd,
    EvacuationFailed { status: i32, output: String },
    NotMember,
}

impl fmt::Display for RemoveDiskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SwapInUse => write!(f, "its swap partition is in use"),
            Self::LastHdd => write!(f, "it is the last hard disk"),
            Self::EvacuationFailed { status, output } => {
                write!(f, "evacuation failed with status {status}: {output}")
            }
            Self::NotMember => write!(f, "not part of the layout"),
        }
    }
}

/// Error types for layout operations
#[derive(Error, Debug)]
pub enum LayoutError {
    /// Existing on-disk state does not match the layout
    #[error("not a valid {layout} layout: {reason}")]
    Parse { layout: String, reason: String },

    #[error("{layout}: disk {disk} belongs to the layout but was not given")]
    ExtraDisk { layout: String, disk: String },

    #[error("cannot create layout: {0}")]
    Create(CreateReason),

    #[error("cannot add disk {disk}: {reason}")]
    AddDisk { disk: String, reason: AddDiskReason },

    #[error("cannot remove disk {disk}: {reason}")]
    RemoveDisk {
        disk: String,
        reason: RemoveDiskReason,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Sys(#[from] SysError),
}

impl LayoutError {
    pub fn parse(layout: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            layout: layout.to_string(),
            reason: reason.into(),
        }
    }

    pub fn add_disk(disk: &str, reason: AddDiskReason) -> Self {
        Self::AddDisk {
            disk: disk.to_string(),
            reason,
        }
    }

    pub fn remove_disk(disk: &str, reason: RemoveDiskReason) -> Self {
        Self::RemoveDisk {
            disk: disk.to_string(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, LayoutError>;
