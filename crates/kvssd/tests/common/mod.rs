// Common test utilities for KVSSD integration tests

#![allow(dead_code)]

use kvssd::{KvSsd, StorageConfig};
use std::path::Path;
use tempfile::TempDir;

/// Test fixture that owns a temporary store directory
pub struct StoreFixture {
    pub temp_dir: TempDir,
    pub config: StorageConfig,
}

impl StoreFixture {
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    pub fn with_config(config: StorageConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self { temp_dir, config }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Open (or reopen) the store in the fixture directory
    pub fn open(&self) -> KvSsd {
        KvSsd::open_with_config(self.path(), self.config.clone()).expect("Failed to open store")
    }
}

impl Default for StoreFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// 256-byte pages, 4 pages per block, 64 data blocks
pub fn small_config() -> StorageConfig {
    StorageConfig::default()
        .with_geometry(256, 1024)
        .with_capacity(64 * 1024)
        .with_memtable_size(512)
        .with_meta_zone_blocks(64)
        .with_level_limits(vec![1, 2, 4])
}

pub fn key(i: usize) -> String {
    format!("key_{:04}", i)
}

pub fn value(i: usize, round: usize) -> String {
    format!("value_{:04}_{:06}", i, round)
}

/// Every pair of live tables at each level >= 1 has disjoint ranges
pub fn assert_levels_disjoint(db: &KvSsd) {
    let depth = db.stats().level_counts.len() as u32;
    for level in 1..depth {
        let tables = db.level_tables(level).expect("Failed to read level");
        for (i, a) in tables.iter().enumerate() {
            for b in &tables[i + 1..] {
                assert!(
                    !a.key_range.overlaps(&b.key_range),
                    "level {}: table {} {} overlaps table {} {}",
                    level,
                    a.id,
                    a.key_range,
                    b.id,
                    b.key_range
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_opens_store() {
        let fixture = StoreFixture::new();
        let db = fixture.open();
        db.put("k", "v").unwrap();
        assert!(fixture.path().join("data_blocks").is_dir());
    }
}
