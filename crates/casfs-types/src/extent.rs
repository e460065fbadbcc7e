use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::geometry::MAX_EXTENT_LENGTH;

/// Maximum representable start block (48 bits).
const MAX_START: u64 = (1 << 48) - 1;

/// A contiguous run of allocated data blocks.
///
/// Block numbers are relative to the start of the data region. On disk an
/// extent packs into a single `u64`: the low 48 bits hold the start block,
/// the high 16 bits the length. A length of zero is not a valid extent; the
/// all-zero word is the "empty slot" marker in node records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    start: u64,
    length: u16,
}

impl Extent {
    /// Create an extent covering `length` blocks starting at `start`.
    pub fn new(start: u64, length: u64) -> Result<Self, TypeError> {
        if length == 0 {
            return Err(TypeError::EmptyExtent);
        }
        if start > MAX_START || length > MAX_EXTENT_LENGTH {
            return Err(TypeError::ExtentOutOfRange { start, length });
        }
        Ok(Self {
            start,
            length: length as u16,
        })
    }

    /// First block of the run.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Number of blocks in the run.
    pub fn length(&self) -> u64 {
        u64::from(self.length)
    }

    /// One past the last block of the run.
    pub fn end(&self) -> u64 {
        self.start + self.length()
    }

    /// Whether `block` falls inside this extent.
    pub fn contains(&self, block: u64) -> bool {
        block >= self.start && block < self.end()
    }

    /// Pack into the on-disk `u64` form.
    pub fn to_raw(&self) -> u64 {
        self.start | (u64::from(self.length) << 48)
    }

    /// Unpack from the on-disk `u64` form. Returns `None` for the empty
    /// slot marker (length zero).
    pub fn from_raw(raw: u64) -> Option<Self> {
        let length = (raw >> 48) as u16;
        if length == 0 {
            return None;
        }
        Some(Self {
            start: raw & MAX_START,
            length,
        })
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extent({}+{})", self.start, self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip() {
        let e = Extent::new(12345, 77).unwrap();
        let back = Extent::from_raw(e.to_raw()).unwrap();
        assert_eq!(e, back);
        assert_eq!(back.start(), 12345);
        assert_eq!(back.length(), 77);
    }

    #[test]
    fn zero_raw_is_empty_slot() {
        assert!(Extent::from_raw(0).is_none());
    }

    #[test]
    fn rejects_zero_length() {
        assert!(matches!(Extent::new(0, 0), Err(TypeError::EmptyExtent)));
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(Extent::new(1 << 48, 1).is_err());
        assert!(Extent::new(0, MAX_EXTENT_LENGTH + 1).is_err());
    }

    #[test]
    fn max_values_roundtrip() {
        let e = Extent::new((1 << 48) - 1, MAX_EXTENT_LENGTH).unwrap();
        let back = Extent::from_raw(e.to_raw()).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn contains_and_end() {
        let e = Extent::new(10, 4).unwrap();
        assert_eq!(e.end(), 14);
        assert!(e.contains(10));
        assert!(e.contains(13));
        assert!(!e.contains(14));
        assert!(!e.contains(9));
    }
}
