//! Level index - live SSTables per LSM level
//!
//! Each level keeps its tables ordered by minimum key. Levels with no live
//! tables are removed from the map.

use crate::sstable::SSTable;
use kvssd_core::TableId;
use std::collections::BTreeMap;

/// Mapping from level number to the live tables at that level
#[derive(Debug, Clone, Default)]
pub struct LevelIndex {
    levels: BTreeMap<u32, Vec<SSTable>>,
}

impl LevelIndex {
    /// An empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table at its level, keeping the level sorted by min key
    pub fn insert(&mut self, table: SSTable) {
        let tables = self.levels.entry(table.level).or_default();
        let pos = tables.partition_point(|t| {
            (t.key_range.min.as_str(), t.id) < (table.key_range.min.as_str(), table.id)
        });
        tables.insert(pos, table);
    }

    /// Remove a table, dropping the level entry if it becomes empty
    pub fn remove(&mut self, level: u32, id: TableId) -> Option<SSTable> {
        let tables = self.levels.get_mut(&level)?;
        let pos = tables.iter().position(|t| t.id == id)?;
        let removed = tables.remove(pos);
        if tables.is_empty() {
            self.levels.remove(&level);
        }
        Some(removed)
    }

    /// Swap in a complete new table list for `level`
    pub fn replace_level(&mut self, level: u32, mut tables: Vec<SSTable>) {
        if tables.is_empty() {
            self.levels.remove(&level);
            return;
        }
        tables.sort_by(|a, b| {
            a.key_range
                .min
                .cmp(&b.key_range.min)
                .then(a.id.cmp(&b.id))
        });
        self.levels.insert(level, tables);
    }

    /// Tables at `level`, in min-key order
    pub fn level(&self, level: u32) -> &[SSTable] {
        self.levels.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of live tables at `level`
    pub fn count(&self, level: u32) -> usize {
        self.level(level).len()
    }

    /// Non-empty levels in ascending order
    pub fn levels(&self) -> impl Iterator<Item = (u32, &[SSTable])> {
        self.levels.iter().map(|(level, tables)| (*level, tables.as_slice()))
    }

    /// Every live table
    pub fn tables(&self) -> impl Iterator<Item = &SSTable> {
        self.levels.values().flatten()
    }

    /// Look up a live table by id
    pub fn table(&self, id: TableId) -> Option<&SSTable> {
        self.tables().find(|t| t.id == id)
    }

    pub(crate) fn tables_mut(&mut self) -> impl Iterator<Item = &mut SSTable> {
        self.levels.values_mut().flatten()
    }

    /// Total number of live tables
    pub fn total(&self) -> usize {
        self.levels.values().map(Vec::len).sum()
    }

    /// Table count per level, from level 0 up to the deepest non-empty level
    pub fn level_counts(&self) -> Vec<usize> {
        let deepest = match self.levels.keys().next_back() {
            Some(level) => *level as usize,
            None => return Vec::new(),
        };
        let mut counts = vec![0; deepest + 1];
        for (level, tables) in &self.levels {
            counts[*level as usize] = tables.len();
        }
        counts
    }

    /// Table ids per level, the persisted form of the index
    pub fn to_ids(&self) -> Vec<(u32, Vec<TableId>)> {
        self.levels
            .iter()
            .map(|(level, tables)| (*level, tables.iter().map(|t| t.id).collect()))
            .collect()
    }
}
