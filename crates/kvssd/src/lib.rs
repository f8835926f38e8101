//! # KVSSD
//!
//! A key-value store running on a simulated SSD. Writes are buffered in a
//! memtable, flushed into an LSM tree of SSTables laid out on flash pages,
//! and space is reclaimed by erasing whole blocks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kvssd::KvSsd;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = KvSsd::open("./kvssd_data")?;
//!
//!     db.put("user:1:name", "Alice")?;
//!     db.put("user:1:name", "Alicia")?;
//!
//!     assert_eq!(db.get("user:1:name")?.as_deref(), Some("Alicia"));
//!
//!     // Flush everything and persist the device state before exit
//!     db.cleanup()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Storage Modes
//!
//! ```rust,no_run
//! use kvssd::{KvSsd, StorageConfig};
//!
//! // Device state in a directory, restored on the next open
//! let persistent = KvSsd::open("./data")?;
//!
//! // Device state in memory only, with a small device
//! let config = StorageConfig::default().with_capacity(64 * 1024 * 1024);
//! let scratch = KvSsd::in_memory_with_config(config)?;
//! # Ok::<(), kvssd::Error>(())
//! ```
//!
//! ## Simulation statistics
//!
//! [`KvSsd::stats`] reports write amplification, GC and compaction counts,
//! and how many flash pages each read needed.

use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub mod logging;

// Re-export core types
pub use kvssd_core::{BlockId, Error, KeyRange, PageAddress, Result, TableId, Zone};

// Storage components
pub use kvssd_storage::{
    CompactionConfig, DiskStore, FlashStore, MemoryStore, SSTable, StorageConfig, StorageEngine,
    StorageStats, READ_HISTOGRAM_BUCKETS,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The main store handle.
///
/// Thread-safe and cheap to clone; clones share one engine.
///
/// # Examples
///
/// ```rust,no_run
/// use kvssd::KvSsd;
///
/// let db = KvSsd::open("./my_data")?;
/// db.put("key", "value")?;
/// db.cleanup()?;
///
/// drop(db);
/// let db = KvSsd::open("./my_data")?;
/// assert_eq!(db.get("key")?, Some("value".to_string()));
/// # Ok::<(), kvssd::Error>(())
/// ```
#[derive(Clone)]
pub struct KvSsd {
    inner: Arc<StorageEngine>,
}

impl KvSsd {
    /// Opens a store at the specified path with default geometry.
    ///
    /// Creates the directory if it doesn't exist and restores any device
    /// state saved there.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, StorageConfig::default())
    }

    /// Opens a store with custom configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where device records are stored
    /// * `config` - Device geometry and engine tuning
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: StorageConfig) -> Result<Self> {
        info!(path = %path.as_ref().display(), "opening kvssd store");
        let engine = StorageEngine::open_with_config(path, config)?;
        Ok(Self::from_engine(engine))
    }

    /// Opens a store configured from `KVSSD_*` environment variables.
    pub fn open_from_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, StorageConfig::from_env()?)
    }

    /// Creates a store with default geometry whose device state lives in
    /// memory only.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kvssd::KvSsd;
    ///
    /// let db = KvSsd::in_memory()?;
    /// db.put("temp", "data")?;
    /// # Ok::<(), kvssd::Error>(())
    /// ```
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_config(StorageConfig::default())
    }

    /// Creates an in-memory store with custom configuration.
    pub fn in_memory_with_config(config: StorageConfig) -> Result<Self> {
        Ok(Self::from_engine(StorageEngine::in_memory(config)?))
    }

    /// Creates a store over an explicit record store.
    ///
    /// Sharing one `MemoryStore` between two handles opened one after the
    /// other simulates a restart without touching the filesystem.
    pub fn with_store(config: StorageConfig, store: Arc<dyn FlashStore>) -> Result<Self> {
        Ok(Self::from_engine(StorageEngine::with_store(config, store)?))
    }

    fn from_engine(engine: StorageEngine) -> Self {
        Self {
            inner: Arc::new(engine),
        }
    }

    /// Inserts or overwrites a key.
    ///
    /// May flush the memtable, compact levels and collect garbage before
    /// returning. Fails with [`Error::CapacityExhausted`] when buffered
    /// writes cannot reach flash even after a forced garbage collection;
    /// the write is then not applied, but everything accepted before stays
    /// readable. `Ok` means the write is applied, possibly still buffered
    /// in memory.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kvssd::KvSsd;
    ///
    /// let db = KvSsd::in_memory()?;
    /// db.put("name", "Alice")?;
    /// db.put("name", "Bob")?; // Updates the value
    /// # Ok::<(), kvssd::Error>(())
    /// ```
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.inner.put(key, value)
    }

    /// Retrieves the latest value of a key.
    ///
    /// Returns `None` if the key was never written.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    /// Flushes buffered writes to level-0 SSTables.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Flushes everything and persists the device state.
    ///
    /// Call once before exit. Writes that cannot reach flash are kept in a
    /// memtable snapshot and restored on the next open.
    pub fn cleanup(&self) -> Result<()> {
        self.inner.cleanup()
    }

    /// Counters and structure of the simulated device
    pub fn stats(&self) -> StorageStats {
        self.inner.stats()
    }

    /// Live SSTables at `level`, in min-key order
    pub fn level_tables(&self, level: u32) -> Result<Vec<SSTable>> {
        self.inner.level_tables(level)
    }

    /// Runs a forced garbage collection on both zones. Returns the number of
    /// blocks reclaimed.
    pub fn force_gc(&self) -> Result<usize> {
        self.inner.force_gc()
    }

    /// Engine configuration
    pub fn config(&self) -> &StorageConfig {
        self.inner.config()
    }
}
