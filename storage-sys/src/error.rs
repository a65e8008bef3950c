// SPDX-License-Identifier: GPL-3.0-only

use storage_types::DevPathError;
use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Command failed with status {status}: {command}\n{output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    /// Invalid on-disk format parameters
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Operation invoked on a device or role it does not support
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Insufficient space: {needed} bytes needed, {available} bytes available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error(transparent)]
    DevPath(#[from] DevPathError),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unexpected output: {0}")]
    Parse(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
