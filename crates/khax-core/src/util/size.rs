use serde::Serialize;
use std::str::FromStr;

use super::PAGE_SIZE;

/// Memory size with a binary unit.
///
/// ```
/// use khax_core::util::Size;
///
/// assert_eq!(Size::MB(4).bytes(), 4 << 20);
/// assert_eq!(Size::KB(8).pages(), 2);
/// assert_eq!("4M".parse::<Size>().unwrap().bytes(), 4 << 20);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Size {
    /// Size in bytes
    B(usize),
    /// Size in kilobytes (1 KB = 1024 bytes)
    KB(usize),
    /// Size in megabytes (1 MB = 1024 KB)
    MB(usize),
}

impl Size {
    /// Converts this size to bytes.
    pub const fn bytes(&self) -> usize {
        match self {
            Size::B(bytes) => *bytes,
            Size::KB(kb) => *kb << 10,
            Size::MB(mb) => *mb << 20,
        }
    }

    /// Number of whole pages needed to hold this size.
    pub const fn pages(&self) -> usize {
        self.bytes().div_ceil(PAGE_SIZE)
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Size::B(bytes) => write!(f, "{} B", bytes),
            Size::KB(kb) => write!(f, "{} KB", kb),
            Size::MB(mb) => write!(f, "{} MB", mb),
        }
    }
}

/// Error returned when parsing a [`Size`] fails.
#[derive(Debug, thiserror::Error)]
#[error("invalid size {0:?}, expected e.g. 512, 64K or 4M")]
pub struct ParseSizeError(String);

impl FromStr for Size {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, ""),
        };
        let value = digits
            .parse::<usize>()
            .map_err(|_| ParseSizeError(s.to_string()))?;
        match unit.to_ascii_uppercase().as_str() {
            "" | "B" => Ok(Size::B(value)),
            "K" | "KB" => Ok(Size::KB(value)),
            "M" | "MB" => Ok(Size::MB(value)),
            _ => Err(ParseSizeError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::util::Size;

    #[test]
    fn size_conversions() {
        assert_eq!(Size::B(12).bytes(), 12);
        assert_eq!(Size::MB(12).bytes(), 12 * (1 << 20));
        assert_eq!(Size::B(4097).pages(), 2);
    }

    #[test]
    fn size_parsing() {
        assert_eq!("64k".parse::<Size>().unwrap(), Size::KB(64));
        assert_eq!("100".parse::<Size>().unwrap(), Size::B(100));
        assert!("4G".parse::<Size>().is_err());
        assert!("M".parse::<Size>().is_err());
    }
}
