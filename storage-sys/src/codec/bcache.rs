// SPDX-License-Identifier: GPL-3.0-only

//! bcache superblock (`struct cache_sb`, bcache-tools 1.0.8)
//!
//! ```text
//! offset  size  field
//!      0     8  csum
//!      8     8  offset             sector the superblock was written at
//!     16     8  version
//!     24    16  magic
//!     40    16  uuid
//!     56    16  set_uuid
//!     72    32  label
//!    104     8  flags
//!    112     8  seq
//!    120    64  pad[8]
//!    184     8  nbuckets (cache) | data_offset (backing)
//!    192     2  block_size         sectors
//!    194     2  bucket_size        sectors
//!    196     2  nr_in_set
//!    198     2  nr_this_dev
//!    200     4  last_mount
//!    204     2  first_bucket
//!    206     2  njournal_buckets | keys
//!    208        d[SB_JOURNAL_BUCKETS]
//! ```
//!
//! All integers are little-endian. The checksum is CRC-64/WE over bytes
//! 8..208.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use storage_types::{BcacheRole, SECTOR_SIZE};
use uuid::Uuid;

use super::crc::crc64_we;
use crate::probe::block_geometry;
use crate::{Result, SysError};

pub const SB_SECTOR: u64 = 8;
pub const SB_OFFSET: u64 = SB_SECTOR * SECTOR_SIZE;
pub const SB_SIZE: usize = 208;
const SB_JOURNAL_BUCKETS: usize = 256;

pub const BCACHE_MAGIC: [u8; 16] = [
    0xc6, 0x85, 0x73, 0xf6, 0x4e, 0x1a, 0x45, 0xca, 0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d, 0x81,
];

pub const VERSION_CDEV: u64 = 0;
pub const VERSION_BDEV: u64 = 1;
pub const VERSION_CDEV_WITH_UUID: u64 = 3;
pub const VERSION_BDEV_WITH_OFFSET: u64 = 4;

const CACHE_MODE_WRITEBACK: u64 = 0x01;
const DEFAULT_BUCKET_SIZE: u16 = 1024;
const MIN_BUCKETS: u64 = 0x80;

const OFF_CSUM: usize = 0;
const OFF_OFFSET: usize = 8;
const OFF_VERSION: usize = 16;
const OFF_MAGIC: usize = 24;
const OFF_UUID: usize = 40;
const OFF_SET_UUID: usize = 56;
const OFF_LABEL: usize = 72;
const OFF_FLAGS: usize = 104;
const OFF_SEQ: usize = 112;
const OFF_ROLE_U64: usize = 184;
const OFF_BLOCK_SIZE: usize = 192;
const OFF_BUCKET_SIZE: usize = 194;
const OFF_NR_IN_SET: usize = 196;
const OFF_NR_THIS_DEV: usize = 198;
const OFF_LAST_MOUNT: usize = 200;
const OFF_FIRST_BUCKET: usize = 204;
const OFF_NJOURNAL_BUCKETS: usize = 206;

/// Version numbers accepted for each role.
pub fn accepted_versions(role: BcacheRole) -> &'static [u64] {
    match role {
        BcacheRole::Backing => &[VERSION_BDEV, VERSION_BDEV_WITH_OFFSET],
        BcacheRole::Cache => &[VERSION_CDEV, VERSION_CDEV_WITH_UUID],
    }
}

/// Decoded `struct cache_sb`, without the journal bucket array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BcacheSuperblock {
    pub csum: u64,
    pub offset: u64,
    pub version: u64,
    pub magic: [u8; 16],
    pub uuid: Uuid,
    pub set_uuid: Uuid,
    pub label: [u8; 32],
    pub flags: u64,
    pub seq: u64,
    /// `nbuckets` for cache devices, `data_offset` for backing devices
    pub role_u64: u64,
    pub block_size: u16,
    pub bucket_size: u16,
    pub nr_in_set: u16,
    pub nr_this_dev: u16,
    pub last_mount: u32,
    pub first_bucket: u16,
    pub njournal_buckets: u16,
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn get_array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&buf[at..at + N]);
    bytes
}

impl BcacheSuperblock {
    fn blank(version: u64, block_size: u16, bucket_size: u16) -> Self {
        Self {
            csum: 0,
            offset: SB_SECTOR,
            version,
            magic: BCACHE_MAGIC,
            uuid: Uuid::new_v4(),
            set_uuid: Uuid::new_v4(),
            label: [0; 32],
            flags: 0,
            seq: 0,
            role_u64: 0,
            block_size,
            bucket_size,
            nr_in_set: 0,
            nr_this_dev: 0,
            last_mount: 0,
            first_bucket: 23 / bucket_size.max(1) + 1,
            njournal_buckets: 0,
        }
    }

    /// Superblock for a backing device in writeback mode.
    pub fn new_backing(block_size: u16, bucket_size: u16, data_offset: Option<u64>) -> Self {
        let version = if data_offset.is_some() {
            VERSION_BDEV_WITH_OFFSET
        } else {
            VERSION_BDEV
        };
        let mut sb = Self::blank(version, block_size, bucket_size);
        sb.flags = CACHE_MODE_WRITEBACK;
        sb.role_u64 = data_offset.unwrap_or(0);
        sb
    }

    pub fn new_cache(block_size: u16, bucket_size: u16, nbuckets: u64) -> Self {
        let mut sb = Self::blank(VERSION_CDEV, block_size, bucket_size);
        sb.role_u64 = nbuckets;
        sb.nr_in_set = 1;
        sb
    }

    pub fn role(&self) -> Option<BcacheRole> {
        [BcacheRole::Backing, BcacheRole::Cache]
            .into_iter()
            .find(|role| accepted_versions(*role).contains(&self.version))
    }

    /// Encode the record, filling in the checksum.
    pub fn encode(&self) -> [u8; SB_SIZE] {
        let mut buf = [0u8; SB_SIZE];
        put_u64(&mut buf, OFF_OFFSET, self.offset);
        put_u64(&mut buf, OFF_VERSION, self.version);
        buf[OFF_MAGIC..OFF_MAGIC + 16].copy_from_slice(&self.magic);
        buf[OFF_UUID..OFF_UUID + 16].copy_from_slice(self.uuid.as_bytes());
        buf[OFF_SET_UUID..OFF_SET_UUID + 16].copy_from_slice(self.set_uuid.as_bytes());
        buf[OFF_LABEL..OFF_LABEL + 32].copy_from_slice(&self.label);
        put_u64(&mut buf, OFF_FLAGS, self.flags);
        put_u64(&mut buf, OFF_SEQ, self.seq);
        put_u64(&mut buf, OFF_ROLE_U64, self.role_u64);
        put_u16(&mut buf, OFF_BLOCK_SIZE, self.block_size);
        put_u16(&mut buf, OFF_BUCKET_SIZE, self.bucket_size);
        put_u16(&mut buf, OFF_NR_IN_SET, self.nr_in_set);
        put_u16(&mut buf, OFF_NR_THIS_DEV, self.nr_this_dev);
        put_u32(&mut buf, OFF_LAST_MOUNT, self.last_mount);
        put_u16(&mut buf, OFF_FIRST_BUCKET, self.first_bucket);
        put_u16(&mut buf, OFF_NJOURNAL_BUCKETS, self.njournal_buckets);

        let csum = crc64_we(&buf[OFF_OFFSET..]);
        put_u64(&mut buf, OFF_CSUM, csum);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SB_SIZE {
            return Err(SysError::Parse(format!(
                "bcache superblock needs {SB_SIZE} bytes, got {}",
                buf.len()
            )));
        }

        Ok(Self {
            csum: get_u64(buf, OFF_CSUM),
            offset: get_u64(buf, OFF_OFFSET),
            version: get_u64(buf, OFF_VERSION),
            magic: get_array(buf, OFF_MAGIC),
            uuid: Uuid::from_bytes(get_array(buf, OFF_UUID)),
            set_uuid: Uuid::from_bytes(get_array(buf, OFF_SET_UUID)),
            label: get_array(buf, OFF_LABEL),
            flags: get_u64(buf, OFF_FLAGS),
            seq: get_u64(buf, OFF_SEQ),
            role_u64: get_u64(buf, OFF_ROLE_U64),
            block_size: get_u16(buf, OFF_BLOCK_SIZE),
            bucket_size: get_u16(buf, OFF_BUCKET_SIZE),
            nr_in_set: get_u16(buf, OFF_NR_IN_SET),
            nr_this_dev: get_u16(buf, OFF_NR_THIS_DEV),
            last_mount: get_u32(buf, OFF_LAST_MOUNT),
            first_bucket: get_u16(buf, OFF_FIRST_BUCKET),
            njournal_buckets: get_u16(buf, OFF_NJOURNAL_BUCKETS),
        })
    }

    /// Whether the stored checksum matches the record contents.
    pub fn checksum_valid(&self) -> bool {
        let encoded = self.encode();
        get_u64(&encoded, OFF_CSUM) == self.csum
    }
}

/// Write a fresh bcache superblock onto `path`.
///
/// `block_size` defaults to the device's logical sector size and
/// `bucket_size` to 1024 sectors. Returns `(device uuid, set uuid)`.
pub fn make_device(
    path: &Path,
    role: BcacheRole,
    block_size: Option<u16>,
    bucket_size: Option<u16>,
    data_offset: Option<u64>,
) -> Result<(Uuid, Uuid)> {
    let geometry = block_geometry(path)?;

    let block_size = match block_size {
        Some(0) => return Err(SysError::Config("block size must be positive".to_string())),
        Some(size) => size,
        None => u16::try_from(geometry.logical_sector_size / SECTOR_SIZE)
            .map_err(|_| SysError::Config("device sector size out of range".to_string()))?
            .max(1),
    };
    let bucket_size = bucket_size.unwrap_or(DEFAULT_BUCKET_SIZE);
    if bucket_size < block_size {
        return Err(SysError::Config(format!(
            "bucket size ({bucket_size}) cannot be smaller than block size ({block_size})"
        )));
    }

    let sb = match role {
        BcacheRole::Backing => BcacheSuperblock::new_backing(block_size, bucket_size, data_offset),
        BcacheRole::Cache => {
            let nbuckets = geometry.size_bytes / SECTOR_SIZE / u64::from(bucket_size);
            if nbuckets < MIN_BUCKETS {
                return Err(SysError::Config(format!(
                    "not enough buckets: {nbuckets}, need {MIN_BUCKETS}"
                )));
            }
            BcacheSuperblock::new_cache(block_size, bucket_size, nbuckets)
        }
    };

    tracing::info!(
        "writing bcache {role:?} superblock to {} (uuid {}, set {})",
        path.display(),
        sb.uuid,
        sb.set_uuid
    );

    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&[0u8; SB_OFFSET as usize])?;
    file.write_all(&sb.encode())?;
    file.write_all(&[0u8; SB_JOURNAL_BUCKETS * 8])?;
    file.sync_all()?;

    Ok((sb.uuid, sb.set_uuid))
}

/// Read the superblock record, `None` when the device is too short to hold one.
pub fn read_superblock(path: &Path) -> Result<Option<BcacheSuperblock>> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    file.seek(SeekFrom::Start(SB_OFFSET))?;
    let mut buf = [0u8; SB_SIZE];
    match file.read_exact(&mut buf) {
        Ok(()) => BcacheSuperblock::decode(&buf).map(Some),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether `path` carries a bcache superblock for `role`.
pub fn is_bcache_device(path: &Path, role: BcacheRole) -> Result<bool> {
    Ok(read_superblock(path)?.is_some_and(|sb| {
        sb.magic == BCACHE_MAGIC && accepted_versions(role).contains(&sb.version)
    }))
}

/// Cache set UUID of a cache device.
pub fn read_set_uuid(path: &Path) -> Result<Uuid> {
    match read_superblock(path)? {
        Some(sb) if sb.magic == BCACHE_MAGIC && sb.role() == Some(BcacheRole::Cache) => {
            Ok(sb.set_uuid)
        }
        _ => Err(SysError::Precondition(format!(
            "{} is not a bcache cache device",
            path.display()
        ))),
    }
}
