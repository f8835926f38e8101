//! Flash state - both block zones plus the level index
//!
//! `FlashState` is the part of the engine that lives "on the device": the
//! data zone, the metadata zone and the live SSTables indexed by level. The
//! flush path, compaction, garbage collection and lookups are all methods
//! on it; this module holds startup restore, block allocation, flushing a
//! frozen memtable into a level-0 table and table invalidation.

use crate::block::{BlockZone, DirectoryEntry, PhysicalBlock, PhysicalPage};
use crate::config::StorageConfig;
use crate::levels::LevelIndex;
use crate::memtable::FrozenMemtable;
use crate::persist::FlashStore;
use crate::sstable::{pack_pages, SSTable};
use crate::stats::EngineStats;
use kvssd_core::{BlockId, Error, KeyRange, PageAddress, Result, TableId, Zone};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Free-block fraction under which allocation collects garbage first
pub const PROACTIVE_GC_FREE_RATIO: f64 = 0.10;

/// Device-side state of the engine
pub struct FlashState {
    pub(crate) config: StorageConfig,
    pub(crate) data: BlockZone,
    pub(crate) meta: BlockZone,
    pub(crate) levels: LevelIndex,
    next_table_id: TableId,
    next_seq: u64,
    pub(crate) store: Arc<dyn FlashStore>,
    pub(crate) stats: Arc<EngineStats>,
}

impl FlashState {
    /// Restore state from `store`: blocks first, then the level index.
    ///
    /// Records that are missing or fail to decode are logged and treated
    /// as absent.
    pub fn load(
        config: &StorageConfig,
        store: Arc<dyn FlashStore>,
        stats: Arc<EngineStats>,
    ) -> Self {
        let pages_per_block = config.pages_per_block();
        let data = load_zone(
            store.as_ref(),
            Zone::Data,
            config.data_block_count(),
            pages_per_block,
        );
        let meta = load_zone(
            store.as_ref(),
            Zone::Metadata,
            config.meta_zone_blocks,
            pages_per_block,
        );
        let levels = load_levels(store.as_ref(), &meta);

        let max_table_id = levels
            .tables()
            .map(|t| t.id)
            .chain(
                data.blocks()
                    .iter()
                    .chain(meta.blocks())
                    .flat_map(|b| b.tables.iter().copied()),
            )
            .max();
        let next_seq = data.max_seq().max(meta.max_seq()).map_or(0, |s| s + 1);

        info!(
            data_blocks = data.len(),
            meta_blocks = meta.len(),
            free_data_blocks = data.free_count(),
            tables = levels.total(),
            "flash state restored"
        );

        Self {
            config: config.clone(),
            data,
            meta,
            levels,
            next_table_id: max_table_id.map_or(1, |id| id + 1),
            next_seq,
            store,
            stats,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Live tables by level
    pub fn levels(&self) -> &LevelIndex {
        &self.levels
    }

    /// One of the two block zones
    pub fn zone(&self, zone: Zone) -> &BlockZone {
        match zone {
            Zone::Data => &self.data,
            Zone::Metadata => &self.meta,
        }
    }

    pub(crate) fn zone_mut(&mut self, zone: Zone) -> &mut BlockZone {
        match zone {
            Zone::Data => &mut self.data,
            Zone::Metadata => &mut self.meta,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub(crate) fn bump_table_id(&mut self) -> TableId {
        let id = self.next_table_id;
        self.next_table_id += 1;
        id
    }

    /// Hand out a block of `zone` for `level`.
    ///
    /// Collects garbage first when free blocks are scarce; when the free
    /// list is empty runs one normal and then one forced collection before
    /// giving up with `CapacityExhausted`.
    pub(crate) fn allocate(&mut self, zone: Zone, level: u32) -> Result<BlockId> {
        let mut collected = false;
        if self.zone(zone).free_ratio() < PROACTIVE_GC_FREE_RATIO {
            debug!(
                %zone,
                free = self.zone(zone).free_count(),
                "free blocks scarce, collecting garbage before allocation"
            );
            self.collect_garbage(zone, false);
            collected = true;
        }
        if let Some(id) = self.take_block(zone, level) {
            return Ok(id);
        }
        if !collected {
            self.collect_garbage(zone, false);
            if let Some(id) = self.take_block(zone, level) {
                return Ok(id);
            }
        }
        warn!(%zone, level, "no free block after garbage collection, forcing a collection");
        self.collect_garbage(zone, true);
        if let Some(id) = self.take_block(zone, level) {
            return Ok(id);
        }
        warn!(%zone, level, "capacity exhausted");
        Err(Error::CapacityExhausted { zone, level })
    }

    fn take_block(&mut self, zone: Zone, level: u32) -> Option<BlockId> {
        let id = self.zone_mut(zone).take_free(level)?;
        self.persist_block(zone, id);
        Some(id)
    }

    /// Return reserved blocks that will not be written after all
    pub(crate) fn release_reservation(&mut self, zone: Zone, ids: &[BlockId]) {
        for id in ids {
            self.zone_mut(zone).close(*id);
            self.persist_block(zone, *id);
        }
    }

    fn reserve_data_blocks(&mut self, level: u32, pages: usize) -> Result<Vec<BlockId>> {
        let mut reserved = Vec::new();
        let mut slots = 0;
        while slots < pages {
            match self.allocate(Zone::Data, level) {
                Ok(id) => {
                    slots += self.data.block(id).map_or(0, PhysicalBlock::free_slots);
                    reserved.push(id);
                }
                Err(e) => {
                    self.release_reservation(Zone::Data, &reserved);
                    return Err(e);
                }
            }
        }
        Ok(reserved)
    }

    /// Write a frozen memtable out as a new SSTable at `level`.
    ///
    /// All blocks are reserved before the first page is programmed, so an
    /// allocation failure leaves no partial table behind.
    pub fn flush_buffer(&mut self, buffer: &FrozenMemtable, level: u32) -> Result<SSTable> {
        let sorted = buffer.sorted_entries();
        let kv_pair_count = sorted.len() as u64;
        let pages = pack_pages(sorted, self.config.page_size);
        if pages.is_empty() {
            return Err(Error::InvalidOperation("cannot flush an empty buffer".into()));
        }

        let data_blocks = self.reserve_data_blocks(level, pages.len())?;
        let meta_block = match self.allocate(Zone::Metadata, level) {
            Ok(id) => id,
            Err(e) => {
                self.release_reservation(Zone::Data, &data_blocks);
                return Err(e);
            }
        };

        let page_size = self.config.page_size;
        let mut directory = Vec::with_capacity(pages.len());
        let mut key_range: Option<KeyRange> = None;
        let mut cursor = 0;
        for entries in pages {
            let addr = next_slot(&mut self.data, &data_blocks, &mut cursor).ok_or_else(|| {
                Error::InvalidOperation("reserved data blocks ran out of pages".into())
            })?;
            let seq = self.bump_seq();
            let page = PhysicalPage::data(addr, seq, entries);
            let range = page.key_range.clone();
            if let Some(block) = self.data.block_mut(addr.block) {
                block.program(page)?;
            }
            self.stats.record_page_write(page_size);
            match key_range.as_mut() {
                Some(r) => r.extend(&range),
                None => key_range = Some(range.clone()),
            }
            directory.push(DirectoryEntry {
                address: addr,
                range,
                seq,
            });
        }
        for id in &data_blocks {
            self.data.close(*id);
        }

        let key_range = key_range.unwrap_or_else(|| KeyRange::point(""));
        let id = self.bump_table_id();
        let table =
            self.program_directory(meta_block, id, level, directory, key_range, kv_pair_count)?;
        self.levels.insert(table.clone());
        self.persist_levels();

        info!(
            table = table.id,
            level,
            pages = table.data_page_count,
            entries = table.kv_pair_count,
            range = %table.key_range,
            "flushed memtable to sstable"
        );
        Ok(table)
    }

    /// Program the directory page of a new table into a reserved metadata
    /// block and persist the table record.
    ///
    /// The caller owns the data-page references listed in `directory`.
    pub(crate) fn program_directory(
        &mut self,
        meta_block: BlockId,
        id: TableId,
        level: u32,
        directory: Vec<DirectoryEntry>,
        key_range: KeyRange,
        kv_pair_count: u64,
    ) -> Result<SSTable> {
        let data_page_count = directory.len() as u32;
        let data_blocks: BTreeSet<BlockId> = directory.iter().map(|e| e.address.block).collect();

        let addr = self
            .meta
            .block_mut(meta_block)
            .and_then(PhysicalBlock::next_address)
            .ok_or_else(|| {
                Error::InvalidOperation(format!("metadata block {} has no free page", meta_block))
            })?;
        let seq = self.bump_seq();
        let page = PhysicalPage::directory(addr, seq, key_range.clone(), directory);
        if let Some(block) = self.meta.block_mut(meta_block) {
            block.program(page)?;
            block.tables.insert(id);
        }
        self.stats.record_page_write(self.config.page_size);
        self.meta.close(meta_block);
        self.persist_block(Zone::Metadata, meta_block);

        for block_id in data_blocks {
            if let Some(block) = self.data.block_mut(block_id) {
                block.tables.insert(id);
            }
            self.persist_block(Zone::Data, block_id);
        }

        let table = SSTable {
            id,
            level,
            key_range,
            meta_address: addr,
            kv_pair_count,
            data_page_count,
        };
        self.persist_table(&table);
        Ok(table)
    }

    /// Directory entries of a live table
    pub(crate) fn directory(&self, table: &SSTable) -> Vec<DirectoryEntry> {
        match self.meta.readable_page(table.meta_address) {
            Some(page) => page.directory_entries().to_vec(),
            None => {
                warn!(
                    table = table.id,
                    meta = %table.meta_address,
                    "directory page unreadable, table treated as empty"
                );
                Vec::new()
            }
        }
    }

    /// Logically delete a table: drop it from its level, release its page
    /// references and delete its record.
    pub(crate) fn invalidate_table(&mut self, table: &SSTable) {
        self.levels.remove(table.level, table.id);

        let directory: Vec<DirectoryEntry> = self
            .meta
            .page(table.meta_address)
            .map(|p| p.directory_entries().to_vec())
            .unwrap_or_default();
        let mut touched = BTreeSet::new();
        let mut invalidated = 0usize;
        for entry in &directory {
            if self.data.release(entry.address) {
                invalidated += 1;
            }
            touched.insert(entry.address.block);
        }
        self.meta.release(table.meta_address);

        for block_id in touched {
            if let Some(block) = self.data.block_mut(block_id) {
                block.tables.remove(&table.id);
            }
            self.persist_block(Zone::Data, block_id);
        }
        if let Some(block) = self.meta.block_mut(table.meta_address.block) {
            block.tables.remove(&table.id);
        }
        self.persist_block(Zone::Metadata, table.meta_address.block);

        if let Err(e) = self.store.delete_table(table.id) {
            warn!(table = table.id, error = %e, "failed to delete table record");
        }
        self.persist_levels();
        debug!(
            table = table.id,
            level = table.level,
            invalidated_pages = invalidated,
            "sstable invalidated"
        );
    }

    pub(crate) fn persist_block(&self, zone: Zone, id: BlockId) {
        let Some(block) = self.zone(zone).block(id) else {
            return;
        };
        if let Err(e) = self.store.save_block(zone, block) {
            warn!(%zone, block = id, error = %e, "failed to persist block");
        }
    }

    pub(crate) fn persist_table(&self, table: &SSTable) {
        if let Err(e) = self.store.save_table(table) {
            warn!(table = table.id, error = %e, "failed to persist table");
        }
    }

    pub(crate) fn persist_levels(&self) {
        if let Err(e) = self.store.save_levels(&self.levels.to_ids()) {
            warn!(error = %e, "failed to persist level index");
        }
    }

    /// Persist the level index, every live table and every block in use
    pub fn persist_all(&self) {
        self.persist_levels();
        for table in self.levels.tables() {
            self.persist_table(table);
        }
        for zone in [Zone::Data, Zone::Metadata] {
            for block in self.zone(zone).blocks() {
                if block.allocated || block.level.is_some() || block.populated() > 0 {
                    self.persist_block(zone, block.id);
                }
            }
        }
    }
}

/// Next programmable address across `blocks`, starting at `blocks[*cursor]`
pub(crate) fn next_slot(
    zone: &mut BlockZone,
    blocks: &[BlockId],
    cursor: &mut usize,
) -> Option<PageAddress> {
    while let Some(id) = blocks.get(*cursor) {
        if let Some(addr) = zone.block_mut(*id).and_then(PhysicalBlock::next_address) {
            return Some(addr);
        }
        *cursor += 1;
    }
    None
}

fn load_zone(store: &dyn FlashStore, zone: Zone, count: u32, pages_per_block: usize) -> BlockZone {
    let blocks = (0..count)
        .map(|id| match store.load_block(zone, id) {
            Ok(Some(block)) if block.id == id && block.pages.len() == pages_per_block => block,
            Ok(Some(_)) => {
                warn!(%zone, block = id, "block record does not match geometry, treating as erased");
                PhysicalBlock::new(id, pages_per_block)
            }
            Ok(None) => PhysicalBlock::new(id, pages_per_block),
            Err(e) => {
                warn!(%zone, block = id, error = %e, "block record unreadable, treating as erased");
                PhysicalBlock::new(id, pages_per_block)
            }
        })
        .collect();
    BlockZone::from_blocks(zone, blocks, pages_per_block)
}

fn load_levels(store: &dyn FlashStore, meta: &BlockZone) -> LevelIndex {
    let mut index = LevelIndex::new();
    let record = match store.load_levels() {
        Ok(Some(record)) => record,
        Ok(None) => return index,
        Err(e) => {
            warn!(error = %e, "level index unreadable, starting with empty levels");
            return index;
        }
    };
    for (level, ids) in record {
        for id in ids {
            match store.load_table(id) {
                Ok(Some(mut table)) => {
                    if meta.readable_page(table.meta_address).is_none() {
                        warn!(
                            table = id,
                            meta = %table.meta_address,
                            "directory page missing, skipping table"
                        );
                        continue;
                    }
                    table.level = level;
                    index.insert(table);
                }
                Ok(None) => warn!(table = id, "table record missing, skipping"),
                Err(e) => warn!(table = id, error = %e, "table record unreadable, skipping"),
            }
        }
    }
    index
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memtable::Memtable;
    use crate::persist::MemoryStore;

    /// 4 pages of 64 bytes per block, 8 data blocks, 8 metadata blocks
    pub(crate) fn small_config() -> StorageConfig {
        StorageConfig::default()
            .with_geometry(64, 256)
            .with_capacity(8 * 256)
            .with_memtable_size(192)
            .with_meta_zone_blocks(8)
            .with_level_limits(vec![1, 2, 4])
    }

    pub(crate) fn flash_with(config: &StorageConfig) -> (FlashState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state = FlashState::load(config, store.clone(), Arc::new(EngineStats::new()));
        (state, store)
    }

    pub(crate) fn frozen(pairs: &[(&str, &str)]) -> FrozenMemtable {
        let mut memtable = Memtable::new();
        for (k, v) in pairs {
            memtable.put(k.to_string(), v.to_string());
        }
        memtable.freeze()
    }

    #[test]
    fn test_flush_buffer_registers_level0_table() {
        let config = small_config();
        let (mut flash, store) = flash_with(&config);
        // 16-byte entries: 4 per 64-byte page
        let pairs: Vec<(String, String)> = (0..6)
            .map(|i| (format!("key{}", i), format!("value-{:06}", i)))
            .collect();
        let refs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let table = flash.flush_buffer(&frozen(&refs), 0).unwrap();

        assert_eq!(table.level, 0);
        assert_eq!(table.kv_pair_count, 6);
        assert_eq!(table.data_page_count, 2);
        assert_eq!(table.key_range, KeyRange::new("key0", "key5"));
        assert_eq!(flash.levels.count(0), 1);

        let dir = flash.directory(&table);
        assert_eq!(dir.len(), 2);
        assert_eq!(dir[0].range, KeyRange::new("key0", "key3"));
        assert!(dir[0].seq < dir[1].seq);
        for entry in &dir {
            let page = flash.data.readable_page(entry.address).unwrap();
            assert_eq!(page.ref_count, 1);
            assert!(flash.data.block(entry.address.block).unwrap().tables.contains(&table.id));
        }
        // 2 data pages + 1 directory page
        assert_eq!(flash.stats.snapshot().flash_bytes_written, 3 * 64);
        assert!(store.load_table(table.id).unwrap().is_some());
        assert_eq!(store.load_levels().unwrap(), Some(vec![(0, vec![table.id])]));
    }

    #[test]
    fn test_partial_blocks_are_reused_by_same_level() {
        let config = small_config();
        let (mut flash, _) = flash_with(&config);
        let first = flash.flush_buffer(&frozen(&[("a", "1")]), 0).unwrap();
        let second = flash.flush_buffer(&frozen(&[("b", "2")]), 0).unwrap();
        let a = flash.directory(&first)[0].address;
        let b = flash.directory(&second)[0].address;
        assert_eq!(a.block, b.block);
        assert_ne!(a.offset, b.offset);
    }

    #[test]
    fn test_flush_capacity_exhausted_registers_nothing() {
        let config = small_config().with_capacity(256);
        let (mut flash, _) = flash_with(&config);
        let big = "v".repeat(60);
        // 5 pages needed, one block holds 4
        let pairs: Vec<(String, String)> = (0..5).map(|i| (format!("k{}", i), big.clone())).collect();
        let refs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let err = flash.flush_buffer(&frozen(&refs), 0).unwrap_err();
        assert!(err.is_capacity_exhausted());
        assert_eq!(flash.levels.total(), 0);
        assert_eq!(flash.data.free_count(), 1);
        assert_eq!(flash.data.block(0).unwrap().populated(), 0);
    }

    #[test]
    fn test_invalidate_releases_pages() {
        let config = small_config();
        let (mut flash, store) = flash_with(&config);
        let table = flash.flush_buffer(&frozen(&[("a", "1"), ("b", "2")]), 0).unwrap();
        let dir = flash.directory(&table);

        flash.invalidate_table(&table);
        assert_eq!(flash.levels.total(), 0);
        assert!(flash.data.readable_page(dir[0].address).is_none());
        assert!(flash.meta.readable_page(table.meta_address).is_none());
        assert!(flash.data.block(dir[0].address.block).unwrap().tables.is_empty());
        assert!(store.load_table(table.id).unwrap().is_none());
    }

    #[test]
    fn test_load_restores_ids_and_sequence() {
        let config = small_config();
        let (mut flash, store) = flash_with(&config);
        let first = flash.flush_buffer(&frozen(&[("a", "1")]), 0).unwrap();
        flash.persist_all();

        let mut reopened = FlashState::load(&config, store, Arc::new(EngineStats::new()));
        assert_eq!(reopened.levels.total(), 1);
        let second = reopened.flush_buffer(&frozen(&[("b", "2")]), 0).unwrap();
        assert!(second.id > first.id);
        let seqs: Vec<u64> = reopened
            .levels
            .tables()
            .flat_map(|t| reopened.directory(t))
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs.len(), 2);
        assert_ne!(seqs[0], seqs[1]);
    }
}
