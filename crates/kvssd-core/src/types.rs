//! Value types shared by every layer of the simulator.
//!
//! Tables and blocks refer to each other only through these plain ids and
//! addresses; they are resolved through the block arena on demand.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an SSTable. Assigned in creation order.
pub type TableId = u64;

/// Index of a block inside its zone's arena.
pub type BlockId = u32;

/// A key/value entry as stored in memtables and data pages.
pub type KvPair = (String, String);

/// Byte footprint of an entry: UTF-8 length of key plus value.
pub fn entry_footprint(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// One of the two independent block arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Zone {
    /// Blocks holding data pages
    Data,
    /// Blocks holding SSTable directory pages
    Metadata,
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Data => write!(f, "data"),
            Zone::Metadata => write!(f, "metadata"),
        }
    }
}

/// Physical page address: owning block plus slot offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageAddress {
    /// Owning block
    pub block: BlockId,
    /// Slot within the block
    pub offset: u32,
}

impl PageAddress {
    /// Create a new address
    pub fn new(block: BlockId, offset: u32) -> Self {
        Self { block, offset }
    }
}

impl fmt::Display for PageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.block, self.offset)
    }
}

/// Inclusive key range `[min, max]` under byte-lexicographic ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Smallest key
    pub min: String,
    /// Largest key
    pub max: String,
}

impl KeyRange {
    /// Create a range. `min` must not be greater than `max`.
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Range covering exactly one key
    pub fn point(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            min: key.clone(),
            max: key,
        }
    }

    /// Range spanned by a set of keys, or `None` when the set is empty.
    pub fn spanning<'a, I>(keys: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut iter = keys.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), k| {
            (if k < lo { k } else { lo }, if k > hi { k } else { hi })
        });
        Some(Self::new(min, max))
    }

    /// Check whether `key` falls inside the range
    pub fn contains(&self, key: &str) -> bool {
        key >= self.min.as_str() && key <= self.max.as_str()
    }

    /// Two ranges `[a,b]` and `[c,d]` overlap unless `b < c` or `d < a`.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !(self.max < other.min || other.max < self.min)
    }

    /// Grow this range to cover `other`
    pub fn extend(&mut self, other: &KeyRange) {
        if other.min < self.min {
            self.min = other.min.clone();
        }
        if other.max > self.max {
            self.max = other.max.clone();
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_rules() {
        let a = KeyRange::new("b", "d");
        assert!(a.overlaps(&KeyRange::new("d", "f")));
        assert!(a.overlaps(&KeyRange::new("a", "b")));
        assert!(a.overlaps(&KeyRange::new("c", "c")));
        assert!(!a.overlaps(&KeyRange::new("e", "f")));
        assert!(!a.overlaps(&KeyRange::new("a", "az")));
    }

    #[test]
    fn test_byte_lexicographic_contains() {
        let r = KeyRange::new("key_1", "key_2");
        assert!(r.contains("key_1"));
        assert!(r.contains("key_10"));
        assert!(r.contains("key_199"));
        assert!(!r.contains("key_3"));
        assert!(!r.contains("key_0"));
    }

    #[test]
    fn test_spanning_and_extend() {
        let r = KeyRange::spanning(["m", "c", "x", "k"]).unwrap();
        assert_eq!(r, KeyRange::new("c", "x"));
        assert!(KeyRange::spanning(std::iter::empty()).is_none());

        let mut r = KeyRange::new("c", "f");
        r.extend(&KeyRange::new("a", "d"));
        assert_eq!(r, KeyRange::new("a", "f"));
    }

    #[test]
    fn test_page_address_text_form() {
        let addr = PageAddress::new(12, 3);
        assert_eq!(addr.to_string(), "12_3");
    }

    #[test]
    fn test_entry_footprint_counts_utf8_bytes() {
        assert_eq!(entry_footprint("key", "value"), 8);
        assert_eq!(entry_footprint("é", ""), 2);
    }

    #[test]
    fn test_key_range_bincode_roundtrip() {
        let r = KeyRange::new("alpha", "omega");
        let bytes = bincode::serialize(&r).unwrap();
        let back: KeyRange = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, r);
    }
}
