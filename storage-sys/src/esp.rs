// SPDX-License-Identifier: GPL-3.0-only

//! Raw ESP synchronisation
//!
//! Every disk of a group carries an ESP of the same size; the pending ones
//! are kept bootable by copying the active ESP over them byte for byte.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::probe::block_geometry;
use crate::{Result, SysError};

const COPY_BUFFER: usize = 1024 * 1024;

/// Copy `source` onto `dest`. Both must be the same size.
///
/// Returns the number of bytes copied.
pub fn sync_esp(source: &Path, dest: &Path) -> Result<u64> {
    let source_size = block_geometry(source)?.size_bytes;
    let dest_size = block_geometry(dest)?.size_bytes;
    if source_size != dest_size {
        return Err(SysError::Precondition(format!(
            "ESP sizes differ: {} is {source_size} bytes, {} is {dest_size} bytes",
            source.display(),
            dest.display()
        )));
    }

    tracing::info!("syncing ESP {} -> {}", source.display(), dest.display());
    let mut input = File::open(source)?;
    let mut output = OpenOptions::new().write(true).open(dest)?;

    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut total_copied: u64 = 0;
    loop {
        let bytes_read = input.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        output.write_all(&buffer[..bytes_read])?;
        total_copied += bytes_read as u64;
    }
    output.sync_all()?;

    Ok(total_copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_equal_sized_partitions() {
        let mut source = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..3 * COPY_BUFFER / 2).map(|i| (i % 251) as u8).collect();
        source.write_all(&data).unwrap();
        let dest = tempfile::NamedTempFile::new().unwrap();
        dest.as_file().set_len(data.len() as u64).unwrap();

        assert_eq!(sync_esp(source.path(), dest.path()).unwrap(), data.len() as u64);
        assert_eq!(std::fs::read(dest.path()).unwrap(), data);
    }

    #[test]
    fn refuses_different_sizes() {
        let source = tempfile::NamedTempFile::new().unwrap();
        source.as_file().set_len(4096).unwrap();
        let dest = tempfile::NamedTempFile::new().unwrap();
        dest.as_file().set_len(8192).unwrap();
        assert!(matches!(
            sync_esp(source.path(), dest.path()),
            Err(SysError::Precondition(_))
        ));
    }
}
