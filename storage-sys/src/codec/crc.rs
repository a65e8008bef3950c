// SPDX-License-Identifier: GPL-3.0-only

//! Table driven checksums used by on-disk records
//!
//! - CRC-64/WE (bcache superblocks): poly 0x42F0E1EBA9EA3693, MSB first,
//!   init and final xor all ones
//! - CRC-32/ISO-HDLC (GPT headers and entry arrays): reflected 0xEDB88320

const CRC64_WE_POLY: u64 = 0x42F0_E1EB_A9EA_3693;
const CRC32_POLY_REFLECTED: u32 = 0xEDB8_8320;

const fn generate_crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u64) << 56;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & (1 << 63) != 0 {
                (crc << 1) ^ CRC64_WE_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC64_TABLE: [u64; 256] = generate_crc64_table();
static CRC32_TABLE: [u32; 256] = generate_crc32_table();

pub fn crc64_we(data: &[u8]) -> u64 {
    let mut crc = !0u64;
    for byte in data {
        let index = ((crc >> 56) as u8 ^ byte) as usize;
        crc = CRC64_TABLE[index] ^ (crc << 8);
    }
    !crc
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for byte in data {
        let index = ((crc as u8) ^ byte) as usize;
        crc = CRC32_TABLE[index] ^ (crc >> 8);
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_catalogued_check_values() {
        assert_eq!(crc64_we(b"123456789"), 0x62EC_59E3_F1A4_F00A);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn empty_input() {
        assert_eq!(crc64_we(&[]), 0);
        assert_eq!(crc32(&[]), 0);
    }
}
