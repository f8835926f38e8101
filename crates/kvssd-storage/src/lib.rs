//! # KVSSD Storage Engine
//!
//! LSM-tree engine running on a simulated flash device.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of KVSSD.**
//!
//! Users should depend on the main `kvssd` crate instead, which provides the
//! stable public API. This crate's API may change without notice between
//! minor versions.
//!
//! ---
//!
//! The device is split into two zones of erase blocks: a data zone holding
//! sorted key/value pages and a metadata zone holding SSTable directory
//! pages. Pages are programmed once and reclaimed only by erasing their
//! whole block.
//!
//! - **Memtable**: in-memory write buffer, frozen and flushed when full
//! - **SSTable**: a directory page listing data pages by key range
//! - **Compaction**: re-references pages into the next level, no copying
//! - **GC**: erases blocks dominated by invalid pages, moving the rest
//!
//! ## Architecture
//!
//! ```text
//! put → Memtable ─freeze→ Frozen queue ─flush→ L0 SSTables
//!                                                 │ count > limit
//!                                                 ▼
//!                                            L1 .. Ln SSTables
//!
//! get → Memtable → Frozen (newest first) → L0 (all) → L1 → … → Ln
//! ```

use kvssd_core::{entry_footprint, Error, Result, Zone};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub mod block;
pub mod compaction;
pub mod config;
pub mod flash;
pub mod gc;
pub mod levels;
pub mod lookup;
pub mod memtable;
pub mod persist;
pub mod sstable;
pub mod stats;

pub use block::{BlockZone, DirectoryEntry, PagePayload, PhysicalBlock, PhysicalPage};
pub use compaction::{partition_entries, PartitionGroup};
pub use config::{CompactionConfig, StorageConfig, StoragePaths};
pub use flash::FlashState;
pub use levels::LevelIndex;
pub use lookup::Lookup;
pub use memtable::{FrozenMemtable, Memtable};
pub use persist::{DiskStore, FlashStore, MemoryStore};
pub use sstable::SSTable;
pub use stats::{EngineStats, StatsSnapshot, READ_HISTOGRAM_BUCKETS};

/// Storage engine
///
/// Writes go to the memtable. A full memtable is frozen and queued, then
/// flushed to a level-0 SSTable; a frozen buffer stays readable until its
/// table is registered.
pub struct StorageEngine {
    /// Configuration
    config: StorageConfig,
    /// Active memtable
    memtable: Mutex<Memtable>,
    /// Frozen memtables waiting for flush, oldest first
    frozen: Mutex<VecDeque<Arc<FrozenMemtable>>>,
    /// Zones and levels
    flash: RwLock<FlashState>,
    /// Record persistence
    store: Arc<dyn FlashStore>,
    /// Counters
    stats: Arc<EngineStats>,
}

impl StorageEngine {
    /// Open or create an engine at the given path with default configuration
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StorageConfig::default())
    }

    /// Open or create an engine at the given path
    pub fn open_with_config(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let store = DiskStore::open(path)?;
        Self::with_store(config, Arc::new(store))
    }

    /// Engine whose records live only in memory
    pub fn in_memory(config: StorageConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Engine over an explicit record store, restoring whatever it holds
    pub fn with_store(config: StorageConfig, store: Arc<dyn FlashStore>) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(EngineStats::new());
        let flash = FlashState::load(&config, Arc::clone(&store), Arc::clone(&stats));

        let memtable = match store.load_memtable() {
            Ok(Some(entries)) => {
                info!(entries = entries.len(), "restored memtable snapshot");
                Memtable::from_entries(entries)
            }
            Ok(None) => Memtable::new(),
            Err(e) => {
                warn!(error = %e, "memtable snapshot unreadable, starting empty");
                Memtable::new()
            }
        };

        Ok(Self {
            config,
            memtable: Mutex::new(memtable),
            frozen: Mutex::new(VecDeque::new()),
            flash: RwLock::new(flash),
            store,
            stats,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Insert or overwrite a key.
    ///
    /// Buffers left over from a failed flush are written out before the new
    /// entry is accepted; if that still fails the entry is not applied. A
    /// flush that fails after the entry was buffered keeps it readable and
    /// is retried by the next write.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let footprint = entry_footprint(key, value);
        let limit = self.config.page_size.min(self.config.memtable_size);
        if footprint > limit {
            return Err(Error::InvalidOperation(format!(
                "entry of {} bytes exceeds the {} byte limit",
                footprint, limit
            )));
        }

        let mut memtable = self.memtable.lock().map_err(|_| Error::LockPoisoned)?;
        let backlog = !self.frozen.lock().map_err(|_| Error::LockPoisoned)?.is_empty();
        if backlog || memtable.size_bytes() + footprint > self.config.memtable_size {
            self.flush_locked(&mut memtable)?;
        }
        memtable.put(key.to_string(), value.to_string());
        self.stats.record_write(footprint);

        if memtable.size_bytes() >= self.config.memtable_size {
            if let Err(e) = self.flush_locked(&mut memtable) {
                warn!(key, error = %e, "flush after write failed, entry kept in memory");
            }
        }
        Ok(())
    }

    /// Retrieve the latest value of a key
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        {
            let memtable = self.memtable.lock().map_err(|_| Error::LockPoisoned)?;
            if let Some(value) = memtable.get(key) {
                self.stats.record_read(0);
                return Ok(Some(value.to_string()));
            }
        }

        {
            let frozen = self.frozen.lock().map_err(|_| Error::LockPoisoned)?;
            for buffer in frozen.iter().rev() {
                if let Some(value) = buffer.get(key) {
                    self.stats.record_read(0);
                    return Ok(Some(value.to_string()));
                }
            }
        }

        let flash = self.flash.read().map_err(|_| Error::LockPoisoned)?;
        let lookup = flash.lookup(key);
        self.stats.record_read(lookup.flash_accesses);
        Ok(lookup.value)
    }

    /// Flush the memtable and any queued buffers to level 0
    pub fn flush(&self) -> Result<()> {
        let mut memtable = self.memtable.lock().map_err(|_| Error::LockPoisoned)?;
        self.flush_locked(&mut memtable)
    }

    fn flush_locked(&self, memtable: &mut Memtable) -> Result<()> {
        if !memtable.is_empty() {
            let buffer = Arc::new(memtable.freeze());
            debug!(
                entries = buffer.len(),
                bytes = buffer.size_bytes(),
                "memtable frozen"
            );
            self.frozen
                .lock()
                .map_err(|_| Error::LockPoisoned)?
                .push_back(buffer);
            if let Err(e) = self.store.clear_memtable() {
                warn!(error = %e, "failed to clear memtable snapshot");
            }
        }
        self.drain_frozen()
    }

    /// Flush queued buffers oldest first. A buffer that fails to flush stays
    /// queued and readable.
    fn drain_frozen(&self) -> Result<()> {
        loop {
            let next = self
                .frozen
                .lock()
                .map_err(|_| Error::LockPoisoned)?
                .front()
                .cloned();
            let Some(buffer) = next else {
                return Ok(());
            };

            let mut flash = self.flash.write().map_err(|_| Error::LockPoisoned)?;
            if let Err(e) = flash.flush_buffer(&buffer, 0) {
                warn!(error = %e, entries = buffer.len(), "flush failed, buffer kept in memory");
                return Err(e);
            }
            self.frozen
                .lock()
                .map_err(|_| Error::LockPoisoned)?
                .pop_front();
            flash.check_compaction(0)?;
        }
    }

    /// Flush what can be flushed and persist all engine state.
    ///
    /// Entries that cannot reach flash are saved as a memtable snapshot and
    /// restored on the next open.
    pub fn cleanup(&self) -> Result<()> {
        let mut memtable = self.memtable.lock().map_err(|_| Error::LockPoisoned)?;
        if let Err(e) = self.flush_locked(&mut memtable) {
            warn!(error = %e, "final flush failed, saving unflushed entries");
            let frozen = self.frozen.lock().map_err(|_| Error::LockPoisoned)?;
            let mut pending = Memtable::new();
            for (key, value) in frozen.iter().flat_map(|b| b.entries()) {
                pending.put(key.clone(), value.clone());
            }
            for (key, value) in memtable.entries() {
                pending.put(key.clone(), value.clone());
            }
            if let Err(e) = self.store.save_memtable(pending.entries()) {
                warn!(error = %e, "failed to save memtable snapshot");
            }
        }

        let flash = self.flash.read().map_err(|_| Error::LockPoisoned)?;
        flash.persist_all();
        info!(tables = flash.levels().total(), "engine state persisted");
        Ok(())
    }

    /// Run a forced garbage collection pass over both zones. Returns the
    /// number of blocks reclaimed.
    pub fn force_gc(&self) -> Result<usize> {
        let mut flash = self.flash.write().map_err(|_| Error::LockPoisoned)?;
        let reclaimed =
            flash.collect_garbage(Zone::Data, true) + flash.collect_garbage(Zone::Metadata, true);
        Ok(reclaimed)
    }

    /// Live tables at `level`, in min-key order
    pub fn level_tables(&self, level: u32) -> Result<Vec<SSTable>> {
        let flash = self.flash.read().map_err(|_| Error::LockPoisoned)?;
        Ok(flash.levels().level(level).to_vec())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        let counters = self.stats.snapshot();
        let (memtable_size, memtable_entries) = match self.memtable.lock() {
            Ok(m) => (m.size_bytes(), m.len()),
            Err(_) => (0, 0),
        };
        let frozen_memtables = self.frozen.lock().map(|f| f.len()).unwrap_or(0);
        let (sstable_count, level_counts, free_data_blocks, free_meta_blocks) =
            match self.flash.read() {
                Ok(flash) => (
                    flash.levels().total(),
                    flash.levels().level_counts(),
                    flash.zone(Zone::Data).free_count(),
                    flash.zone(Zone::Metadata).free_count(),
                ),
                Err(_) => (0, Vec::new(), 0, 0),
            };

        StorageStats {
            write_count: counters.write_count,
            read_count: counters.read_count,
            gc_count: counters.gc_count,
            compaction_count: counters.compaction_count,
            erase_count: counters.erase_count,
            write_amplification: counters.write_amplification,
            logical_bytes_written: counters.logical_bytes_written,
            flash_bytes_written: counters.flash_bytes_written,
            flash_page_reads: counters.flash_page_reads,
            read_histogram: counters.read_histogram,
            memtable_size,
            memtable_entries,
            frozen_memtables,
            sstable_count,
            level_counts,
            free_data_blocks,
            free_meta_blocks,
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Number of `put` calls accepted
    pub write_count: u64,
    /// Number of `get` calls served
    pub read_count: u64,
    /// Number of GC invocations
    pub gc_count: u64,
    /// Number of level compactions
    pub compaction_count: u64,
    /// Number of block erasures
    pub erase_count: u64,
    /// Estimated write amplification
    pub write_amplification: f64,
    /// Bytes accepted from callers
    pub logical_bytes_written: u64,
    /// Bytes programmed to flash
    pub flash_bytes_written: u64,
    /// Pages read while serving lookups
    pub flash_page_reads: u64,
    /// Reads by number of flash accesses; last bucket is 9+
    pub read_histogram: [u64; READ_HISTOGRAM_BUCKETS],
    /// Current memtable size in bytes
    pub memtable_size: u64,
    /// Number of entries in memtable
    pub memtable_entries: usize,
    /// Frozen memtables not yet on flash
    pub frozen_memtables: usize,
    /// Total number of live SSTables
    pub sstable_count: usize,
    /// Number of SSTables at each level
    pub level_counts: Vec<usize>,
    /// Free blocks in the data zone
    pub free_data_blocks: usize,
    /// Free blocks in the metadata zone
    pub free_meta_blocks: usize,
}
