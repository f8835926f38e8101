//! SSTable - Sorted tables built from flash pages
//!
//! An SSTable owns no bytes of its own. It is a directory page in the
//! metadata zone listing the data pages (and their key ranges) that make up
//! the table:
//!
//! ```text
//! SSTable 42, level 1, [apple, kiwi]
//!   meta page 3_0 ──► ┌──────────────────────────────┐
//!                     │ 17_0  [apple, cherry]  seq 9 │
//!                     │ 17_1  [date,  fig]     seq 10│
//!                     │ 21_4  [grape, kiwi]    seq 31│
//!                     └──────────────────────────────┘
//! ```

use kvssd_core::{entry_footprint, KeyRange, KvPair, PageAddress, TableId};
use serde::{Deserialize, Serialize};

/// SSTable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SSTable {
    /// Table id, increasing in creation order
    pub id: TableId,
    /// Level in the LSM tree
    pub level: u32,
    /// Keys served by this table
    pub key_range: KeyRange,
    /// Directory page in the metadata zone
    pub meta_address: PageAddress,
    /// Number of entries inside `key_range`
    pub kv_pair_count: u64,
    /// Number of data pages listed in the directory
    pub data_page_count: u32,
}

impl SSTable {
    /// Check if `key` falls inside this table's range
    pub fn might_contain(&self, key: &str) -> bool {
        self.key_range.contains(key)
    }
}

/// Greedily pack sorted entries into pages of at most `page_size` bytes.
///
/// A page is closed as soon as the next entry would overflow it.
pub fn pack_pages(sorted: Vec<KvPair>, page_size: u64) -> Vec<Vec<KvPair>> {
    let mut pages = Vec::new();
    let mut current: Vec<KvPair> = Vec::new();
    let mut used = 0u64;
    for (key, value) in sorted {
        let footprint = entry_footprint(&key, &value);
        if !current.is_empty() && used + footprint > page_size {
            pages.push(std::mem::take(&mut current));
            used = 0;
        }
        used += footprint;
        current.push((key, value));
    }
    if !current.is_empty() {
        pages.push(current);
    }
    pages
}
