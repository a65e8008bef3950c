// SPDX-License-Identifier: GPL-3.0-only

//! MBR, protective MBR and GPT records (UEFI 2.x, chapter 5)
//!
//! GUIDs are stored mixed-endian: the first three fields little-endian, the
//! last eight bytes as written.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use storage_types::partition_to_disk_and_index;
use uuid::Uuid;

use super::crc::crc32;
use crate::probe::block_geometry;
use crate::{Result, SysError};

pub const ESP_TYPE_GUID: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
pub const LINUX_DATA_TYPE_GUID: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);
pub const LINUX_LVM_TYPE_GUID: Uuid = Uuid::from_u128(0xE6D6D379_F507_44C2_A23C_238F2A3DF928);
pub const BASIC_DATA_TYPE_GUID: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);

pub const MBR_SIGNATURE: u16 = 0xAA55;
pub const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;
pub const GPT_SIGNATURE: u64 = 0x5452_4150_2049_4645; // "EFI PART"
pub const GPT_REVISION: u32 = 0x0001_0000;
pub const GPT_HEADER_SIZE: u32 = 92;
pub const GPT_ENTRY_SIZE: usize = 128;
pub const GPT_ENTRY_COUNT: u32 = 128;
pub const GPT_NAME_LEN: usize = 36;

pub const MBR_RECORD_SIZE: usize = 16;
pub const MBR_SIZE: usize = 512;

/// Pack a GUID the way it is stored on disk.
pub fn guid_to_disk(guid: &Uuid) -> [u8; 16] {
    guid.to_bytes_le()
}

pub fn guid_from_disk(bytes: [u8; 16]) -> Uuid {
    Uuid::from_bytes_le(bytes)
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn bytes16(buf: &[u8], at: usize) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[at..at + 16]);
    bytes
}

/// `struct mbr_partition_record`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbrPartitionRecord {
    pub boot_indicator: u8,
    pub start_chs: [u8; 3],
    pub os_type: u8,
    pub end_chs: [u8; 3],
    pub starting_lba: u32,
    pub size_in_lba: u32,
}

impl MbrPartitionRecord {
    pub fn encode(&self) -> [u8; MBR_RECORD_SIZE] {
        let mut buf = [0u8; MBR_RECORD_SIZE];
        buf[0] = self.boot_indicator;
        buf[1..4].copy_from_slice(&self.start_chs);
        buf[4] = self.os_type;
        buf[5..8].copy_from_slice(&self.end_chs);
        buf[8..12].copy_from_slice(&self.starting_lba.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size_in_lba.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            boot_indicator: buf[0],
            start_chs: [buf[1], buf[2], buf[3]],
            os_type: buf[4],
            end_chs: [buf[5], buf[6], buf[7]],
            starting_lba: le_u32(buf, 8),
            size_in_lba: le_u32(buf, 12),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.os_type == 0 && self.size_in_lba == 0
    }
}

/// `struct mbr_header`: boot code, disk signature, four records, 0xAA55
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbrHeader {
    pub boot_code: [u8; 440],
    pub unique_mbr_signature: u32,
    pub unknown: u16,
    pub partition_records: [MbrPartitionRecord; 4],
    pub signature: u16,
}

impl Default for MbrHeader {
    fn default() -> Self {
        Self {
            boot_code: [0; 440],
            unique_mbr_signature: 0,
            unknown: 0,
            partition_records: [MbrPartitionRecord::default(); 4],
            signature: MBR_SIGNATURE,
        }
    }
}

impl MbrHeader {
    /// Protective MBR covering a GPT disk of `total_sectors`.
    pub fn protective(total_sectors: u64) -> Self {
        let mut header = Self::default();
        header.partition_records[0] = MbrPartitionRecord {
            boot_indicator: 0,
            start_chs: [0x00, 0x02, 0x00],
            os_type: MBR_TYPE_GPT_PROTECTIVE,
            end_chs: [0xFF, 0xFF, 0xFF],
            starting_lba: 1,
            size_in_lba: u32::try_from(total_sectors.saturating_sub(1)).unwrap_or(u32::MAX),
        };
        header
    }

    pub fn encode(&self) -> [u8; MBR_SIZE] {
        let mut buf = [0u8; MBR_SIZE];
        buf[..440].copy_from_slice(&self.boot_code);
        buf[440..444].copy_from_slice(&self.unique_mbr_signature.to_le_bytes());
        buf[444..446].copy_from_slice(&self.unknown.to_le_bytes());
        for (i, record) in self.partition_records.iter().enumerate() {
            let at = 446 + i * MBR_RECORD_SIZE;
            buf[at..at + MBR_RECORD_SIZE].copy_from_slice(&record.encode());
        }
        buf[510..512].copy_from_slice(&self.signature.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MBR_SIZE {
            return Err(SysError::Parse("MBR needs 512 bytes".to_string()));
        }
        let mut boot_code = [0u8; 440];
        boot_code.copy_from_slice(&buf[..440]);
        let mut partition_records = [MbrPartitionRecord::default(); 4];
        for (i, record) in partition_records.iter_mut().enumerate() {
            let at = 446 + i * MBR_RECORD_SIZE;
            *record = MbrPartitionRecord::decode(&buf[at..at + MBR_RECORD_SIZE]);
        }
        Ok(Self {
            boot_code,
            unique_mbr_signature: le_u32(buf, 440),
            unknown: u16::from_le_bytes([buf[444], buf[445]]),
            partition_records,
            signature: u16::from_le_bytes([buf[510], buf[511]]),
        })
    }

    pub fn is_protective(&self) -> bool {
        self.signature == MBR_SIGNATURE
            && self
                .partition_records
                .iter()
                .any(|record| record.os_type == MBR_TYPE_GPT_PROTECTIVE)
    }
}

/// `struct gpt_entry`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub partition_guid: Uuid,
    pub lba_start: u64,
    pub lba_end: u64,
    pub attrs: u64,
    pub name: [u16; GPT_NAME_LEN],
}

impl Default for GptEntry {
    fn default() -> Self {
        Self {
            type_guid: Uuid::nil(),
            partition_guid: Uuid::nil(),
            lba_start: 0,
            lba_end: 0,
            attrs: 0,
            name: [0; GPT_NAME_LEN],
        }
    }
}

impl GptEntry {
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; GPT_NAME_LEN];
        for (slot, unit) in self.name.iter_mut().zip(name.encode_utf16()) {
            *slot = unit;
        }
    }

    pub fn name(&self) -> String {
        let len = self.name.iter().position(|unit| *unit == 0).unwrap_or(GPT_NAME_LEN);
        String::from_utf16_lossy(&self.name[..len])
    }

    pub fn is_unused(&self) -> bool {
        self.type_guid.is_nil()
    }

    pub fn encode(&self) -> [u8; GPT_ENTRY_SIZE] {
        let mut buf = [0u8; GPT_ENTRY_SIZE];
        buf[0..16].copy_from_slice(&guid_to_disk(&self.type_guid));
        buf[16..32].copy_from_slice(&guid_to_disk(&self.partition_guid));
        buf[32..40].copy_from_slice(&self.lba_start.to_le_bytes());
        buf[40..48].copy_from_slice(&self.lba_end.to_le_bytes());
        buf[48..56].copy_from_slice(&self.attrs.to_le_bytes());
        for (i, unit) in self.name.iter().enumerate() {
            buf[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < GPT_ENTRY_SIZE {
            return Err(SysError::Parse("GPT entry needs 128 bytes".to_string()));
        }
        let mut name = [0u16; GPT_NAME_LEN];
        for (i, unit) in name.iter_mut().enumerate() {
            *unit = u16::from_le_bytes([buf[56 + i * 2], buf[57 + i * 2]]);
        }
        Ok(Self {
            type_guid: guid_from_disk(bytes16(buf, 0)),
            partition_guid: guid_from_disk(bytes16(buf, 16)),
            lba_start: le_u64(buf, 32),
            lba_end: le_u64(buf, 40),
            attrs: le_u64(buf, 48),
            name,
        })
    }
}

/// `struct gpt_header`, 92 bytes padded to one sector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: u64,
    pub revision: u32,
    pub size: u32,
    pub crc32: u32,
    pub reserved1: u32,
    pub my_lba: u64,
    pub alternative_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub partition_entry_lba: u64,
    pub npartition_entries: u32,
    pub sizeof_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
}

impl GptHeader {
    /// Encode into a sector of `sector_size` bytes, computing the header CRC.
    pub fn encode(&self, sector_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; sector_size.max(512)];
        buf[0..8].copy_from_slice(&self.signature.to_le_bytes());
        buf[8..12].copy_from_slice(&self.revision.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.reserved1.to_le_bytes());
        buf[24..32].copy_from_slice(&self.my_lba.to_le_bytes());
        buf[32..40].copy_from_slice(&self.alternative_lba.to_le_bytes());
        buf[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        buf[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        buf[56..72].copy_from_slice(&guid_to_disk(&self.disk_guid));
        buf[72..80].copy_from_slice(&self.partition_entry_lba.to_le_bytes());
        buf[80..84].copy_from_slice(&self.npartition_entries.to_le_bytes());
        buf[84..88].copy_from_slice(&self.sizeof_partition_entry.to_le_bytes());
        buf[88..92].copy_from_slice(&self.partition_entry_array_crc32.to_le_bytes());

        let header_len = (self.size as usize).clamp(GPT_HEADER_SIZE as usize, buf.len());
        let crc = crc32(&buf[..header_len]);
        buf[16..20].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < GPT_HEADER_SIZE as usize {
            return Err(SysError::Parse("GPT header needs 92 bytes".to_string()));
        }
        Ok(Self {
            signature: le_u64(buf, 0),
            revision: le_u32(buf, 8),
            size: le_u32(buf, 12),
            crc32: le_u32(buf, 16),
            reserved1: le_u32(buf, 20),
            my_lba: le_u64(buf, 24),
            alternative_lba: le_u64(buf, 32),
            first_usable_lba: le_u64(buf, 40),
            last_usable_lba: le_u64(buf, 48),
            disk_guid: guid_from_disk(bytes16(buf, 56)),
            partition_entry_lba: le_u64(buf, 72),
            npartition_entries: le_u32(buf, 80),
            sizeof_partition_entry: le_u32(buf, 84),
            partition_entry_array_crc32: le_u32(buf, 88),
        })
    }
}

/// Encode an entry array of [`GPT_ENTRY_COUNT`] slots, returning it with its CRC.
pub fn encode_entry_array(entries: &[GptEntry]) -> (Vec<u8>, u32) {
    let mut buf = vec![0u8; GPT_ENTRY_COUNT as usize * GPT_ENTRY_SIZE];
    for (i, entry) in entries.iter().take(GPT_ENTRY_COUNT as usize).enumerate() {
        buf[i * GPT_ENTRY_SIZE..(i + 1) * GPT_ENTRY_SIZE].copy_from_slice(&entry.encode());
    }
    let crc = crc32(&buf);
    (buf, crc)
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<bool> {
    file.seek(SeekFrom::Start(offset))?;
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether GPT entry `index` (1-based) on `disk` has the ESP type GUID.
///
/// The disk must carry a protective MBR (0xAA55 signature and at least one
/// 0xEE record).
pub fn is_esp_entry(disk: &Path, index: u32, sector_size: u64) -> Result<bool> {
    if index == 0 {
        return Err(SysError::Precondition("partition index is 1-based".to_string()));
    }

    let mut file = File::open(disk)?;

    let mut mbr = [0u8; MBR_SIZE];
    if !read_at(&mut file, 0, &mut mbr)? {
        return Ok(false);
    }
    if !MbrHeader::decode(&mbr)?.is_protective() {
        return Ok(false);
    }

    let mut header = [0u8; 512];
    if !read_at(&mut file, sector_size, &mut header)? {
        return Ok(false);
    }
    let header = GptHeader::decode(&header)?;
    if header.signature != GPT_SIGNATURE || index > header.npartition_entries {
        return Ok(false);
    }

    let entry_size = u64::from(header.sizeof_partition_entry.max(GPT_ENTRY_SIZE as u32));
    let offset = header
        .partition_entry_lba
        .checked_mul(sector_size)
        .and_then(|start| start.checked_add(entry_size * u64::from(index - 1)));
    let Some(offset) = offset else {
        tracing::warn!(
            "{}: GPT entry array at LBA {} is out of range",
            disk.display(),
            header.partition_entry_lba
        );
        return Ok(false);
    };
    let mut entry = [0u8; GPT_ENTRY_SIZE];
    if !read_at(&mut file, offset, &mut entry)? {
        return Ok(false);
    }

    Ok(GptEntry::decode(&entry)?.type_guid == ESP_TYPE_GUID)
}

/// Whether `partition` (e.g. `/dev/sda1`) is an EFI system partition.
pub fn is_esp_partition(partition: &str) -> Result<bool> {
    let (disk, index) = partition_to_disk_and_index(partition)?;
    let sector_size = block_geometry(Path::new(&disk))?.logical_sector_size.max(512);
    is_esp_entry(Path::new(&disk), index, sector_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn esp_guid_uses_mixed_endian_packing() {
        assert_eq!(
            guid_to_disk(&ESP_TYPE_GUID),
            [
                0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E,
                0xC9, 0x3B
            ]
        );
        assert_eq!(guid_from_disk(guid_to_disk(&ESP_TYPE_GUID)), ESP_TYPE_GUID);
    }

    #[test]
    fn record_layouts_have_fixed_sizes() {
        assert_eq!(MbrHeader::protective(1000).encode().len(), 512);
        assert_eq!(GptEntry::default().encode().len(), 128);
        let mbr = MbrHeader::protective(1000).encode();
        assert_eq!(&mbr[510..], &[0x55, 0xAA]);
        assert_eq!(mbr[446 + 4], 0xEE);
        assert_eq!(le_u32(&mbr, 446 + 12), 999);
    }

    #[test]
    fn header_crc_covers_the_first_92_bytes() {
        let header = GptHeader {
            signature: GPT_SIGNATURE,
            revision: GPT_REVISION,
            size: GPT_HEADER_SIZE,
            crc32: 0,
            reserved1: 0,
            my_lba: 1,
            alternative_lba: 2047,
            first_usable_lba: 34,
            last_usable_lba: 2014,
            disk_guid: Uuid::from_u128(7),
            partition_entry_lba: 2,
            npartition_entries: GPT_ENTRY_COUNT,
            sizeof_partition_entry: GPT_ENTRY_SIZE as u32,
            partition_entry_array_crc32: 0,
        };
        let mut buf = header.encode(512);
        let stored = le_u32(&buf, 16);
        buf[16..20].copy_from_slice(&[0; 4]);
        assert_eq!(stored, crc32(&buf[..92]));
        assert_eq!(GptHeader::decode(&buf).unwrap().disk_guid, Uuid::from_u128(7));
    }

    #[test]
    fn entry_names_are_utf16() {
        let mut entry = GptEntry::default();
        entry.set_name("esp");
        let decoded = GptEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded.name(), "esp");
    }

    fn write_disk(mbr: &MbrHeader, entry_type: Uuid) -> tempfile::NamedTempFile {
        write_disk_with_entry_lba(mbr, entry_type, 2)
    }

    fn write_disk_with_entry_lba(
        mbr: &MbrHeader,
        entry_type: Uuid,
        partition_entry_lba: u64,
    ) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let entry = GptEntry {
            type_guid: entry_type,
            partition_guid: Uuid::from_u128(1),
            lba_start: 2048,
            lba_end: 4095,
            ..GptEntry::default()
        };
        let (array, array_crc) = encode_entry_array(&[entry]);
        let header = GptHeader {
            signature: GPT_SIGNATURE,
            revision: GPT_REVISION,
            size: GPT_HEADER_SIZE,
            crc32: 0,
            reserved1: 0,
            my_lba: 1,
            alternative_lba: 8191,
            first_usable_lba: 34,
            last_usable_lba: 8158,
            disk_guid: Uuid::from_u128(2),
            partition_entry_lba,
            npartition_entries: GPT_ENTRY_COUNT,
            sizeof_partition_entry: GPT_ENTRY_SIZE as u32,
            partition_entry_array_crc32: array_crc,
        };
        file.write_all(&mbr.encode()).unwrap();
        file.write_all(&header.encode(512)).unwrap();
        file.write_all(&array).unwrap();
        file.as_file().set_len(8192 * 512).unwrap();
        file
    }

    #[test]
    fn detects_esp_entries() {
        let disk = write_disk(&MbrHeader::protective(8192), ESP_TYPE_GUID);
        assert!(is_esp_entry(disk.path(), 1, 512).unwrap());
        assert!(!is_esp_entry(disk.path(), 2, 512).unwrap());
    }

    #[test]
    fn rejects_broken_markers() {
        let mut bad_signature = MbrHeader::protective(8192);
        bad_signature.signature = 0x55AA;
        let disk = write_disk(&bad_signature, ESP_TYPE_GUID);
        assert!(!is_esp_entry(disk.path(), 1, 512).unwrap());

        let mut not_protective = MbrHeader::protective(8192);
        not_protective.partition_records[0].os_type = 0x83;
        let disk = write_disk(&not_protective, ESP_TYPE_GUID);
        assert!(!is_esp_entry(disk.path(), 1, 512).unwrap());

        let disk = write_disk(&MbrHeader::protective(8192), LINUX_DATA_TYPE_GUID);
        assert!(!is_esp_entry(disk.path(), 1, 512).unwrap());
    }

    #[test]
    fn entry_array_beyond_addressable_range_is_not_an_esp() {
        let disk =
            write_disk_with_entry_lba(&MbrHeader::protective(8192), ESP_TYPE_GUID, u64::MAX / 4);
        assert!(!is_esp_entry(disk.path(), 1, 512).unwrap());
        assert!(!is_esp_entry(disk.path(), GPT_ENTRY_COUNT, 512).unwrap());
    }
}
