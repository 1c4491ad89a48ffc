//! Human-readable byte sizes with binary suffixes.

use std::fmt;

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Formats a (possibly negative) byte count as e.g. `1.50 MiB`.
///
/// Implements `Display` directly so it can be written into any formatter
/// without an intermediate `String`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadableSize(pub i64);

impl fmt::Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut size = self.0 as f64;
        let mut unit_idx = 0;

        while size.abs() >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        write!(f, "{:.2} {}", size, UNITS[unit_idx])
    }
}

pub fn format_bytes(bytes: i64) -> String {
    ReadableSize(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1000), "1000.00 B");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes(1536 * 1024), "1.50 MiB");
        assert_eq!(format_bytes(-2048), "-2.00 KiB");
        assert_eq!(format_bytes(i64::MAX), "8.00 EiB");
    }
}
