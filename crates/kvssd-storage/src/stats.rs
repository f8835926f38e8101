//! Engine counters
//!
//! Counters are plain atomics so the read path can record flash accesses
//! while holding only a shared lock on the flash state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram buckets: reads needing 0..=8 flash accesses, plus one for 9+
pub const READ_HISTOGRAM_BUCKETS: usize = 10;

/// Live counters shared by the engine components
#[derive(Debug, Default)]
pub struct EngineStats {
    write_count: AtomicU64,
    read_count: AtomicU64,
    gc_count: AtomicU64,
    compaction_count: AtomicU64,
    erase_count: AtomicU64,
    logical_bytes_written: AtomicU64,
    flash_bytes_written: AtomicU64,
    flash_page_reads: AtomicU64,
    read_histogram: [AtomicU64; READ_HISTOGRAM_BUCKETS],
}

impl EngineStats {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    /// One logical `put` of `footprint` bytes
    pub fn record_write(&self, footprint: u64) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.logical_bytes_written
            .fetch_add(footprint, Ordering::Relaxed);
    }

    /// One `get` that needed `flash_accesses` page reads
    pub fn record_read(&self, flash_accesses: u32) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        let bucket = (flash_accesses as usize).min(READ_HISTOGRAM_BUCKETS - 1);
        self.read_histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// One page programmed
    pub fn record_page_write(&self, page_size: u64) {
        self.flash_bytes_written
            .fetch_add(page_size, Ordering::Relaxed);
    }

    /// One page read on the lookup path
    pub fn record_page_read(&self) {
        self.flash_page_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// One garbage collection invocation
    pub fn record_gc(&self) {
        self.gc_count.fetch_add(1, Ordering::Relaxed);
    }

    /// One compaction of a level
    pub fn record_compaction(&self) {
        self.compaction_count.fetch_add(1, Ordering::Relaxed);
    }

    /// One block erased
    pub fn record_erase(&self) {
        self.erase_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut read_histogram = [0u64; READ_HISTOGRAM_BUCKETS];
        for (slot, counter) in read_histogram.iter_mut().zip(self.read_histogram.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        let write_count = self.write_count.load(Ordering::Relaxed);
        let logical_bytes_written = self.logical_bytes_written.load(Ordering::Relaxed);
        let flash_bytes_written = self.flash_bytes_written.load(Ordering::Relaxed);
        StatsSnapshot {
            write_count,
            read_count: self.read_count.load(Ordering::Relaxed),
            gc_count: self.gc_count.load(Ordering::Relaxed),
            compaction_count: self.compaction_count.load(Ordering::Relaxed),
            erase_count: self.erase_count.load(Ordering::Relaxed),
            write_amplification: write_amplification(
                flash_bytes_written,
                write_count,
                logical_bytes_written,
            ),
            logical_bytes_written,
            flash_bytes_written,
            flash_page_reads: self.flash_page_reads.load(Ordering::Relaxed),
            read_histogram,
        }
    }
}

/// Estimated write amplification:
/// `flash bytes / (write count × average entry size)`.
///
/// This is an estimate over the whole run, not a per-byte measurement.
pub fn write_amplification(flash_bytes: u64, write_count: u64, logical_bytes: u64) -> f64 {
    if write_count == 0 || logical_bytes == 0 {
        return 0.0;
    }
    let average_entry = logical_bytes as f64 / write_count as f64;
    flash_bytes as f64 / (write_count as f64 * average_entry)
}

/// Point-in-time counter values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
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
    /// Bytes programmed to flash (one page size per page)
    pub flash_bytes_written: u64,
    /// Pages read while serving lookups
    pub flash_page_reads: u64,
    /// Reads by number of flash accesses; last bucket is 9+
    pub read_histogram: [u64; READ_HISTOGRAM_BUCKETS],
}
