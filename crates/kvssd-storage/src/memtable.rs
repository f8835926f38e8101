//! Memtable - In-memory write buffer
//!
//! The live memtable keeps entries in arrival order with at most one entry
//! per key: a rewrite removes the earlier entry and appends the new one. A
//! full memtable is frozen and queued until it is written out as a level-0
//! SSTable, at which point its entries are sorted.

use kvssd_core::{entry_footprint, KvPair};

/// Memtable - the mutable write buffer
#[derive(Debug, Default, Clone)]
pub struct Memtable {
    /// Entries in insertion order, one per key
    entries: Vec<KvPair>,
    /// Sum of key and value byte lengths
    size_bytes: u64,
}

impl Memtable {
    /// Creates a new empty Memtable
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a memtable from a persisted snapshot. Later duplicates win.
    pub fn from_entries(entries: Vec<KvPair>) -> Self {
        let mut memtable = Self::new();
        for (key, value) in entries {
            memtable.put(key, value);
        }
        memtable
    }

    /// Inserts or replaces a key-value pair (last write wins)
    pub fn put(&mut self, key: String, value: String) {
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
            let (old_key, old_value) = self.entries.remove(pos);
            self.size_bytes -= entry_footprint(&old_key, &old_value);
        }
        self.size_bytes += entry_footprint(&key, &value);
        self.entries.push((key, value));
    }

    /// Retrieves a value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the byte footprint of the memtable
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Returns the number of entries in the memtable
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the memtable is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[KvPair] {
        &self.entries
    }

    /// Moves the current contents into a frozen buffer, leaving this one empty
    pub fn freeze(&mut self) -> FrozenMemtable {
        let size_bytes = self.size_bytes;
        let entries = std::mem::take(&mut self.entries);
        self.size_bytes = 0;
        FrozenMemtable {
            entries,
            size_bytes,
        }
    }
}

/// An immutable memtable waiting to be flushed
#[derive(Debug, Clone)]
pub struct FrozenMemtable {
    entries: Vec<KvPair>,
    size_bytes: u64,
}

impl FrozenMemtable {
    /// Retrieves a value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[KvPair] {
        &self.entries
    }

    /// Entries sorted by key, ready to be packed into pages
    pub fn sorted_entries(&self) -> Vec<KvPair> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        sorted
    }

    /// Byte footprint at freeze time
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there is nothing to flush
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
