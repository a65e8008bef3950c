// SPDX-License-Identifier: GPL-3.0-only

//! On-disk record codecs
//!
//! Explicit fixed-offset encoders and decoders for the records needed to
//! recognise and build the supported layouts:
//! - bcache superblocks
//! - MBR, protective MBR and GPT headers and entries
//! - the checksums both formats use

pub mod bcache;
pub mod crc;
pub mod gpt;

pub use bcache::{BcacheSuperblock, is_bcache_device, make_device, read_set_uuid};
pub use gpt::{GptEntry, GptHeader, MbrHeader, MbrPartitionRecord, is_esp_partition};
