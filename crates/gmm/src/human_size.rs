//! Human-readable byte counts for log output.

use core::fmt;

/// Formats a byte count with binary prefixes (KiB, MiB, GiB), up to two decimals.
///
/// ```
/// use gmm::HumanSize;
///
/// assert_eq!(HumanSize(4096).to_string(), "4KiB");
/// assert_eq!(HumanSize(1536).to_string(), "1.5KiB");
/// assert_eq!(HumanSize(1 << 32).to_string(), "4GiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

        if self.0 < 1024 {
            return write!(f, "{}B", self.0);
        }

        let mut size = self.0 as f64;
        let mut unit = 0;
        while size >= 1024.0 && unit < UNITS.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }

        let hundredths = (size * 100.0).round() as u64;
        match (hundredths / 100, hundredths % 100) {
            (whole, 0) => write!(f, "{}{}", whole, UNITS[unit]),
            (whole, frac) if frac % 10 == 0 => write!(f, "{}.{}{}", whole, frac / 10, UNITS[unit]),
            (whole, frac) => write!(f, "{}.{:02}{}", whole, frac, UNITS[unit]),
        }
    }
}
