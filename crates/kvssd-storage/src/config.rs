//! Engine configuration.
//!
//! All geometry is fixed when the engine is constructed. Values can be taken
//! from the defaults, set through the `with_*` builders, or overlaid from
//! `KVSSD_*` environment variables.

use kvssd_core::{Error, Result};
use std::path::{Path, PathBuf};

/// Default page size (32KB)
pub const DEFAULT_PAGE_SIZE: u64 = 32 * 1024;
/// Default erase block size (8 pages)
pub const DEFAULT_BLOCK_SIZE: u64 = 8 * DEFAULT_PAGE_SIZE;
/// Default memtable flush threshold (one block minus one page)
pub const DEFAULT_MEMTABLE_SIZE: u64 = DEFAULT_BLOCK_SIZE - DEFAULT_PAGE_SIZE;
/// Default data zone capacity (1GB)
pub const DEFAULT_CAPACITY: u64 = 1024 * 1024 * 1024;
/// Default invalid-page ratio at which a block becomes a GC victim
pub const DEFAULT_GC_THRESHOLD: f64 = 0.7;
/// Default number of metadata zone blocks
pub const DEFAULT_META_ZONE_BLOCKS: u32 = 1000;
/// Default level fan-out
pub const DEFAULT_LEVEL_RATIO: u64 = 10;
/// Default per-level live SSTable limits
pub const DEFAULT_LEVEL_LIMITS: [usize; 6] = [1, 10, 100, 1000, 10_000, 100_000];

/// Compaction configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionConfig {
    /// Fan-out between consecutive levels
    pub level_ratio: u64,
    /// Maximum live SSTable count per level; `count > limit` triggers compaction
    pub level_limits: Vec<usize>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            level_ratio: DEFAULT_LEVEL_RATIO,
            level_limits: DEFAULT_LEVEL_LIMITS.to_vec(),
        }
    }
}

impl CompactionConfig {
    /// Live SSTable limit for `level`.
    ///
    /// Levels past the configured list grow by `level_ratio` per level.
    pub fn level_limit(&self, level: u32) -> usize {
        let level = level as usize;
        if let Some(limit) = self.level_limits.get(level) {
            return *limit;
        }
        let last = self.level_limits.last().copied().unwrap_or(1);
        let extra = (level + 1 - self.level_limits.len()) as u32;
        let growth = self.level_ratio.saturating_pow(extra);
        (last as u64).saturating_mul(growth).min(usize::MAX as u64) as usize
    }
}

/// Storage engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Total data zone capacity in bytes
    pub capacity: u64,
    /// Flash page size in bytes
    pub page_size: u64,
    /// Erase block size in bytes
    pub block_size: u64,
    /// Memtable byte footprint that triggers a flush
    pub memtable_size: u64,
    /// Compaction configuration
    pub compaction: CompactionConfig,
    /// Invalid-page ratio that makes a block a GC victim
    pub gc_threshold: f64,
    /// Number of blocks in the metadata zone
    pub meta_zone_blocks: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            memtable_size: DEFAULT_MEMTABLE_SIZE,
            compaction: CompactionConfig::default(),
            gc_threshold: DEFAULT_GC_THRESHOLD,
            meta_zone_blocks: DEFAULT_META_ZONE_BLOCKS,
        }
    }
}

impl StorageConfig {
    /// Defaults overlaid with any `KVSSD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("KVSSD_CAPACITY") {
            config.capacity = parse_var("KVSSD_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("KVSSD_PAGE_SIZE") {
            config.page_size = parse_var("KVSSD_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("KVSSD_BLOCK_SIZE") {
            config.block_size = parse_var("KVSSD_BLOCK_SIZE", &v)?;
        }
        if let Some(v) = lookup("KVSSD_MEMTABLE_SIZE") {
            config.memtable_size = parse_var("KVSSD_MEMTABLE_SIZE", &v)?;
        }
        if let Some(v) = lookup("KVSSD_LEVEL_RATIO") {
            config.compaction.level_ratio = parse_var("KVSSD_LEVEL_RATIO", &v)?;
        }
        if let Some(v) = lookup("KVSSD_LEVEL_LIMITS") {
            config.compaction.level_limits = v
                .split(',')
                .map(|part| parse_var("KVSSD_LEVEL_LIMITS", part.trim()))
                .collect::<Result<Vec<usize>>>()?;
        }
        if let Some(v) = lookup("KVSSD_GC_THRESHOLD") {
            config.gc_threshold = parse_var("KVSSD_GC_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("KVSSD_META_ZONE_BLOCKS") {
            config.meta_zone_blocks = parse_var("KVSSD_META_ZONE_BLOCKS", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set the data zone capacity in bytes
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set page and block geometry
    pub fn with_geometry(mut self, page_size: u64, block_size: u64) -> Self {
        self.page_size = page_size;
        self.block_size = block_size;
        self
    }

    /// Set the memtable flush threshold
    pub fn with_memtable_size(mut self, memtable_size: u64) -> Self {
        self.memtable_size = memtable_size;
        self
    }

    /// Set per-level live SSTable limits
    pub fn with_level_limits(mut self, limits: Vec<usize>) -> Self {
        self.compaction.level_limits = limits;
        self
    }

    /// Set the GC invalid-page ratio threshold
    pub fn with_gc_threshold(mut self, threshold: f64) -> Self {
        self.gc_threshold = threshold;
        self
    }

    /// Set the metadata zone block count
    pub fn with_meta_zone_blocks(mut self, blocks: u32) -> Self {
        self.meta_zone_blocks = blocks;
        self
    }

    /// Pages per erase block
    pub fn pages_per_block(&self) -> usize {
        (self.block_size / self.page_size.max(1)) as usize
    }

    /// Number of blocks in the data zone
    pub fn data_block_count(&self) -> u32 {
        (self.capacity / self.block_size.max(1)).min(u32::MAX as u64) as u32
    }

    /// Live SSTable limit for `level`
    pub fn level_limit(&self, level: u32) -> usize {
        self.compaction.level_limit(level)
    }

    /// Reject geometry the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::InvalidConfig("page size must be positive".into()));
        }
        if self.block_size < self.page_size || self.block_size % self.page_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "block size {} is not a positive multiple of page size {}",
                self.block_size, self.page_size
            )));
        }
        if self.capacity < self.block_size {
            return Err(Error::InvalidConfig(format!(
                "capacity {} is smaller than one block ({})",
                self.capacity, self.block_size
            )));
        }
        if self.memtable_size == 0 {
            return Err(Error::InvalidConfig("memtable size must be positive".into()));
        }
        if self.compaction.level_limits.is_empty()
            || self.compaction.level_limits.iter().any(|l| *l == 0)
        {
            return Err(Error::InvalidConfig(
                "level limits must be a non-empty list of positive counts".into(),
            ));
        }
        if self.compaction.level_ratio < 2 {
            return Err(Error::InvalidConfig("level ratio must be at least 2".into()));
        }
        if !(self.gc_threshold > 0.0 && self.gc_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "gc threshold {} is outside (0, 1]",
                self.gc_threshold
            )));
        }
        if self.meta_zone_blocks == 0 {
            return Err(Error::InvalidConfig(
                "metadata zone needs at least one block".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}: cannot parse {:?}", name, value)))
}

/// Directory layout of an engine instance
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Layout rooted at `root`
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Engine root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of data zone block records
    pub fn data_blocks(&self) -> PathBuf {
        self.root.join("data_blocks")
    }

    /// Directory of metadata zone block records
    pub fn meta_blocks(&self) -> PathBuf {
        self.root.join("meta_blocks")
    }

    /// Directory of SSTable records
    pub fn tables(&self) -> PathBuf {
        self.root.join("tables")
    }

    /// Level index record
    pub fn levels(&self) -> PathBuf {
        self.root.join("LEVELS")
    }

    /// Memtable snapshot record
    pub fn memtable(&self) -> PathBuf {
        self.root.join("MEMTABLE")
    }
}
