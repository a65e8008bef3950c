// SPDX-License-Identifier: GPL-3.0-only

//! Partition planning and table writing
//!
//! [`plan`] is pure sector arithmetic and rejects a layout before anything
//! touches the disk. [`write_table`] encodes the plan as a protective MBR
//! plus primary and backup GPT, or as a plain MBR. [`initialize_disk`] runs
//! the whole sequence and formats the new partitions by role.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::time::Duration;

use storage_types::{
    MIB, PartitionRole, PartitionSize, PartitionSpec, PartitionTableType, bytes_to_pretty,
    disk_to_partition,
};
use uuid::Uuid;

use crate::codec::gpt::{
    BASIC_DATA_TYPE_GUID, ESP_TYPE_GUID, GPT_ENTRY_COUNT, GPT_ENTRY_SIZE, GPT_HEADER_SIZE,
    GPT_REVISION, GPT_SIGNATURE, GptEntry, GptHeader, LINUX_DATA_TYPE_GUID, LINUX_LVM_TYPE_GUID,
    MbrHeader, MbrPartitionRecord, encode_entry_array,
};
use crate::exec;
use crate::probe::block_geometry;
use crate::{Result, SysError};

const MBR_MAX_PARTITIONS: usize = 4;
/// Stale signatures are cleared from this many sectors at each partition start.
const ZERO_PREFIX_SECTORS: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub total_sectors: u64,
    pub sector_size: u64,
}

impl DiskGeometry {
    pub fn new(size_bytes: u64, sector_size: u64) -> Self {
        let sector_size = sector_size.max(512);
        Self {
            total_sectors: size_bytes / sector_size,
            sector_size,
        }
    }

    pub fn of(path: &Path) -> Result<Self> {
        let geometry = block_geometry(path)?;
        Ok(Self::new(geometry.size_bytes, geometry.logical_sector_size))
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors * self.sector_size
    }

    fn alignment(&self) -> u64 {
        (MIB / self.sector_size).max(1)
    }

    fn gpt_array_sectors(&self) -> u64 {
        (GPT_ENTRY_COUNT as u64 * GPT_ENTRY_SIZE as u64).div_ceil(self.sector_size)
    }

    /// Half-open range of sectors partitions may occupy.
    fn usable(&self, table: PartitionTableType) -> (u64, u64) {
        let end = match table {
            PartitionTableType::Gpt => self
                .total_sectors
                .saturating_sub(1 + self.gpt_array_sectors()),
            PartitionTableType::Mbr => self.total_sectors,
        };
        (self.alignment(), end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    /// 1-based partition number
    pub number: u32,
    pub start: u64,
    pub sectors: u64,
    pub role: PartitionRole,
}

impl PlannedPartition {
    /// Last sector, inclusive.
    pub fn end(&self) -> u64 {
        self.start + self.sectors - 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub table: PartitionTableType,
    pub geometry: DiskGeometry,
    pub partitions: Vec<PlannedPartition>,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn align_down(value: u64, alignment: u64) -> u64 {
    value / alignment * alignment
}

/// Lay out `specs` on a disk of `geometry`.
///
/// Entries are numbered in the given order. Fixed-size entries after the
/// single `*` entry are reserved at the tail so the `*` entry takes the
/// whole free region between them.
pub fn plan(
    geometry: DiskGeometry,
    table: PartitionTableType,
    specs: &[PartitionSpec],
) -> Result<PartitionPlan> {
    if specs.is_empty() {
        return Err(SysError::Precondition("no partitions requested".to_string()));
    }
    if table == PartitionTableType::Mbr && specs.len() > MBR_MAX_PARTITIONS {
        return Err(SysError::Precondition(format!(
            "an MBR table holds at most {MBR_MAX_PARTITIONS} primary partitions"
        )));
    }
    if let Some(spec) = specs.iter().find(|spec| !spec.role.supported_by(table)) {
        return Err(SysError::Precondition(format!(
            "partition role {} requires a GPT table",
            spec.role
        )));
    }
    let stars: Vec<usize> = specs
        .iter()
        .enumerate()
        .filter(|(_, spec)| spec.size == PartitionSize::Remaining)
        .map(|(i, _)| i)
        .collect();
    if stars.len() > 1 {
        return Err(SysError::Precondition(
            "only one partition may take the remaining space".to_string(),
        ));
    }

    let alignment = geometry.alignment();
    let (first, end) = geometry.usable(table);
    let sectors_of = |bytes: u64| bytes.div_ceil(geometry.sector_size);

    let fixed_bytes: u64 = specs
        .iter()
        .filter_map(|spec| match spec.size {
            PartitionSize::Fixed(bytes) => Some(bytes),
            PartitionSize::Remaining => None,
        })
        .sum();
    let insufficient = || SysError::InsufficientSpace {
        needed: fixed_bytes,
        available: end.saturating_sub(first) * geometry.sector_size,
    };

    let star = stars.first().copied();
    let tail_sectors: u64 = match star {
        Some(index) => specs[index + 1..]
            .iter()
            .map(|spec| match spec.size {
                PartitionSize::Fixed(bytes) => align_up(sectors_of(bytes), alignment),
                PartitionSize::Remaining => 0,
            })
            .sum(),
        None => 0,
    };

    let mut partitions = Vec::with_capacity(specs.len());
    let mut cursor = first;
    for (i, spec) in specs.iter().enumerate() {
        let start = align_up(cursor, alignment);
        let sectors = match spec.size {
            PartitionSize::Fixed(bytes) => sectors_of(bytes),
            PartitionSize::Remaining => {
                let limit = if tail_sectors == 0 {
                    end
                } else {
                    align_down(end.saturating_sub(tail_sectors), alignment)
                };
                limit.checked_sub(start).filter(|sectors| *sectors > 0).ok_or_else(insufficient)?
            }
        };
        if sectors == 0 || start + sectors > end {
            return Err(insufficient());
        }
        partitions.push(PlannedPartition {
            number: i as u32 + 1,
            start,
            sectors,
            role: spec.role,
        });
        cursor = start + sectors;
    }

    if table == PartitionTableType::Mbr && cursor > u64::from(u32::MAX) {
        return Err(SysError::Precondition(
            "disk too large for an MBR table".to_string(),
        ));
    }

    Ok(PartitionPlan {
        table,
        geometry,
        partitions,
    })
}

fn gpt_type(role: PartitionRole) -> Uuid {
    match role {
        PartitionRole::Esp => ESP_TYPE_GUID,
        PartitionRole::Lvm => LINUX_LVM_TYPE_GUID,
        PartitionRole::Vfat => BASIC_DATA_TYPE_GUID,
        _ => LINUX_DATA_TYPE_GUID,
    }
}

fn mbr_type(role: PartitionRole) -> u8 {
    match role {
        PartitionRole::Lvm => 0x8e,
        PartitionRole::Swap => 0x82,
        PartitionRole::Vfat => 0x0c,
        _ => 0x83,
    }
}

fn write_at(file: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

fn zero_range(file: &mut File, offset: u64, len: u64) -> Result<()> {
    let chunk = vec![0u8; MIB as usize];
    file.seek(SeekFrom::Start(offset))?;
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(chunk.len() as u64) as usize;
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Zero the first and last MiB of the disk, clearing both GPT copies.
pub fn wipe_table(path: &Path, geometry: DiskGeometry) -> Result<()> {
    let size = geometry.size_bytes();
    let span = MIB.min(size);
    let mut file = OpenOptions::new().write(true).open(path)?;
    zero_range(&mut file, 0, span)?;
    zero_range(&mut file, size - span, span)?;
    file.sync_all()?;
    Ok(())
}

/// Write `plan` to the start (and for GPT, the end) of the device.
pub fn write_table(path: &Path, plan: &PartitionPlan) -> Result<()> {
    let geometry = plan.geometry;
    let sector = geometry.sector_size;
    let mut file = OpenOptions::new().write(true).open(path)?;

    match plan.table {
        PartitionTableType::Gpt => {
            let entries: Vec<GptEntry> = plan
                .partitions
                .iter()
                .map(|part| {
                    let mut entry = GptEntry {
                        type_guid: gpt_type(part.role),
                        partition_guid: Uuid::new_v4(),
                        lba_start: part.start,
                        lba_end: part.end(),
                        ..GptEntry::default()
                    };
                    entry.set_name(&part.role.to_string());
                    entry
                })
                .collect();
            let (array, array_crc) = encode_entry_array(&entries);
            let array_sectors = geometry.gpt_array_sectors();
            let last_lba = geometry.total_sectors - 1;
            let primary = GptHeader {
                signature: GPT_SIGNATURE,
                revision: GPT_REVISION,
                size: GPT_HEADER_SIZE,
                crc32: 0,
                reserved1: 0,
                my_lba: 1,
                alternative_lba: last_lba,
                first_usable_lba: 2 + array_sectors,
                last_usable_lba: last_lba - 1 - array_sectors,
                disk_guid: Uuid::new_v4(),
                partition_entry_lba: 2,
                npartition_entries: GPT_ENTRY_COUNT,
                sizeof_partition_entry: GPT_ENTRY_SIZE as u32,
                partition_entry_array_crc32: array_crc,
            };
            let backup = GptHeader {
                my_lba: last_lba,
                alternative_lba: 1,
                partition_entry_lba: last_lba - array_sectors,
                ..primary.clone()
            };

            write_at(&mut file, 0, &MbrHeader::protective(geometry.total_sectors).encode())?;
            write_at(&mut file, sector, &primary.encode(sector as usize))?;
            write_at(&mut file, 2 * sector, &array)?;
            write_at(&mut file, backup.partition_entry_lba * sector, &array)?;
            write_at(&mut file, last_lba * sector, &backup.encode(sector as usize))?;
        }
        PartitionTableType::Mbr => {
            let mut header = MbrHeader::default();
            let id = Uuid::new_v4();
            header.unique_mbr_signature = u32::from_le_bytes([
                id.as_bytes()[0],
                id.as_bytes()[1],
                id.as_bytes()[2],
                id.as_bytes()[3],
            ]);
            for (record, part) in header.partition_records.iter_mut().zip(&plan.partitions) {
                *record = MbrPartitionRecord {
                    boot_indicator: 0,
                    start_chs: [0xFE, 0xFF, 0xFF],
                    os_type: mbr_type(part.role),
                    end_chs: [0xFE, 0xFF, 0xFF],
                    starting_lba: part.start as u32,
                    size_in_lba: part.sectors as u32,
                };
            }
            write_at(&mut file, 0, &header.encode())?;
        }
    }

    file.sync_all()?;
    Ok(())
}

fn zero_partition_prefixes(path: &Path, plan: &PartitionPlan) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    for part in &plan.partitions {
        let sectors = part.sectors.min(ZERO_PREFIX_SECTORS);
        zero_range(
            &mut file,
            part.start * plan.geometry.sector_size,
            sectors * plan.geometry.sector_size,
        )?;
    }
    file.sync_all()?;
    Ok(())
}

fn format_partition(partition: &str, role: PartitionRole) -> Result<()> {
    let (tool, args): (&str, &[&str]) = match role {
        PartitionRole::Esp | PartitionRole::Vfat => ("mkfs.vfat", &["-F", "32"]),
        PartitionRole::Swap => ("mkswap", &[]),
        PartitionRole::Ext2 => ("mkfs.ext2", &["-F"]),
        PartitionRole::Ext4 => ("mkfs.ext4", &["-F"]),
        PartitionRole::Xfs => ("mkfs.xfs", &["-f"]),
        PartitionRole::Plain | PartitionRole::Bcache | PartitionRole::Lvm => return Ok(()),
    };
    let mut full: Vec<&str> = args.to_vec();
    full.push(partition);
    tracing::info!("formatting {partition} as {role}");
    exec::run(tool, &full)?;
    Ok(())
}

/// Replace the partition table of `device` with `specs`.
///
/// The plan is checked first; an impossible layout leaves the device
/// untouched. Partition device nodes are only usable after the kernel has
/// re-read the table, which is waited for with `settle`. Image files are
/// partitioned but not formatted.
pub fn initialize_disk(
    device: &Path,
    table: PartitionTableType,
    specs: &[PartitionSpec],
    settle: Duration,
) -> Result<PartitionPlan> {
    let geometry = DiskGeometry::of(device)?;
    let plan = plan(geometry, table, specs)?;
    let is_block = std::fs::metadata(device)?.file_type().is_block_device();

    tracing::info!(
        "initializing {} ({}) with a {} table of {} partitions",
        device.display(),
        bytes_to_pretty(geometry.size_bytes()),
        table,
        plan.partitions.len()
    );
    wipe_table(device, geometry)?;
    write_table(device, &plan)?;
    zero_partition_prefixes(device, &plan)?;

    if !is_block {
        tracing::debug!("{} is not a block device, skipping formatting", device.display());
        return Ok(plan);
    }

    let device_str = device.to_string_lossy();
    exec::run("blockdev", &["--rereadpt", &device_str])?;
    std::thread::sleep(settle);

    for part in &plan.partitions {
        let partition = disk_to_partition(&device_str, part.number)?;
        format_partition(&partition, part.role)?;
    }

    Ok(plan)
}
