//! Size units shared across models

/// Logical sector unit used by sysfs sizes and on-disk offsets
pub const SECTOR_SIZE: u64 = 512;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Convert bytes to human-readable binary units (e.g., "1.50 GiB")
pub fn bytes_to_pretty(bytes: u64) -> String {
    let mut steps = 0;
    let mut val: f64 = bytes as f64;

    while val >= 1024. && steps < 6 {
        val /= 1024.;
        steps += 1;
    }

    let unit = match steps {
        0 => "B",
        1 => "KiB",
        2 => "MiB",
        3 => "GiB",
        4 => "TiB",
        5 => "PiB",
        _ => "EiB",
    };

    format!("{:.2} {}", val, unit)
}
