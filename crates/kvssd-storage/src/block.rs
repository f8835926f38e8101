//! Physical allocator - simulated flash pages, erase blocks and zones
//!
//! A zone is an arena of fixed-size erase blocks indexed by [`BlockId`].
//! Each block holds `pages_per_block` page slots that are programmed once
//! and only become writable again after the whole block is erased.
//!
//! ```text
//! Block 7 (affinity L1)
//! ┌────────┬────────┬────────┬────────┐
//! │ 7_0 ✓  │ 7_1 ✗  │ 7_2 ✓  │ empty  │   ✓ valid  ✗ invalid
//! └────────┴────────┴────────┴────────┘
//!   refcount 2  0       1
//! ```
//!
//! Page reference counts change only through [`BlockZone::retain`],
//! [`BlockZone::release`] and garbage-collection migration.

use kvssd_core::{BlockId, Error, KeyRange, KvPair, PageAddress, Result, TableId, Zone};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Directory entry stored in an SSTable's metadata page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Address of the data page
    pub address: PageAddress,
    /// Key range of the data page
    pub range: KeyRange,
    /// Write sequence number of the data page
    pub seq: u64,
}

/// Contents of a programmed page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PagePayload {
    /// Sorted key/value entries
    Data(Vec<KvPair>),
    /// SSTable directory
    Directory(Vec<DirectoryEntry>),
}

/// A programmed flash page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalPage {
    /// Where the page lives
    pub address: PageAddress,
    /// False once the last reference is gone
    pub valid: bool,
    /// Number of SSTables referencing the page
    pub ref_count: u32,
    /// Min/max key held by the page
    pub key_range: KeyRange,
    /// Write sequence number, preserved across migration
    pub seq: u64,
    /// Page contents
    pub payload: PagePayload,
}

impl PhysicalPage {
    /// A data page over entries already sorted by key.
    pub fn data(address: PageAddress, seq: u64, entries: Vec<KvPair>) -> Self {
        let key_range = KeyRange::spanning(entries.iter().map(|(k, _)| k.as_str()))
            .unwrap_or_else(|| KeyRange::point(""));
        Self {
            address,
            valid: true,
            ref_count: 1,
            key_range,
            seq,
            payload: PagePayload::Data(entries),
        }
    }

    /// A directory page covering `range`.
    pub fn directory(
        address: PageAddress,
        seq: u64,
        range: KeyRange,
        entries: Vec<DirectoryEntry>,
    ) -> Self {
        Self {
            address,
            valid: true,
            ref_count: 1,
            key_range: range,
            seq,
            payload: PagePayload::Directory(entries),
        }
    }

    /// Key/value entries (empty for directory pages)
    pub fn entries(&self) -> &[KvPair] {
        match &self.payload {
            PagePayload::Data(entries) => entries,
            PagePayload::Directory(_) => &[],
        }
    }

    /// Directory entries (empty for data pages)
    pub fn directory_entries(&self) -> &[DirectoryEntry] {
        match &self.payload {
            PagePayload::Directory(entries) => entries,
            PagePayload::Data(_) => &[],
        }
    }

    /// Mutable directory entries, used when GC relocates data pages
    pub(crate) fn directory_entries_mut(&mut self) -> Option<&mut Vec<DirectoryEntry>> {
        match &mut self.payload {
            PagePayload::Directory(entries) => Some(entries),
            PagePayload::Data(_) => None,
        }
    }

    /// Exact-match lookup within a data page
    pub fn find(&self, key: &str) -> Option<&str> {
        let entries = self.entries();
        entries
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|idx| entries[idx].1.as_str())
    }

    /// Keys inside `range`, in key order
    pub fn keys_in<'a>(&'a self, range: &'a KeyRange) -> impl Iterator<Item = &'a str> + 'a {
        self.entries()
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(move |k| range.contains(k))
    }

    /// Number of keys inside `range`
    pub fn count_in(&self, range: &KeyRange) -> usize {
        self.entries()
            .iter()
            .filter(|(k, _)| range.contains(k))
            .count()
    }
}

/// An erase block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalBlock {
    /// Index within the zone
    pub id: BlockId,
    /// Level the block is currently serving, `None` when neutral
    pub level: Option<u32>,
    /// Out of the free list
    pub allocated: bool,
    /// Page slots
    pub pages: Vec<Option<PhysicalPage>>,
    /// SSTables referencing pages in this block
    pub tables: BTreeSet<TableId>,
    cursor: u32,
    #[serde(skip)]
    open: bool,
}

impl PhysicalBlock {
    /// A freshly erased block
    pub fn new(id: BlockId, pages_per_block: usize) -> Self {
        Self {
            id,
            level: None,
            allocated: false,
            pages: vec![None; pages_per_block],
            tables: BTreeSet::new(),
            cursor: 0,
            open: false,
        }
    }

    /// Every slot holds a page
    pub fn is_full(&self) -> bool {
        self.pages.iter().all(Option::is_some)
    }

    /// Number of programmed slots
    pub fn populated(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    /// Number of empty slots
    pub fn free_slots(&self) -> usize {
        self.pages.len() - self.populated()
    }

    /// Number of programmed but invalid pages
    pub fn invalid_count(&self) -> usize {
        self.pages.iter().flatten().filter(|p| !p.valid).count()
    }

    /// Fraction of invalid pages among populated slots
    pub fn invalid_ratio(&self) -> f64 {
        let populated = self.populated();
        if populated == 0 {
            return 0.0;
        }
        self.invalid_count() as f64 / populated as f64
    }

    /// Held by a writer that has not closed it yet
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Next programmable address, scanning forward from the write cursor
    /// and wrapping around the block.
    pub fn next_address(&mut self) -> Option<PageAddress> {
        let slots = self.pages.len();
        let start = self.cursor as usize;
        let offset = (0..slots)
            .map(|i| (start + i) % slots)
            .find(|&slot| self.pages[slot].is_none())?;
        self.cursor = ((offset + 1) % slots) as u32;
        Some(PageAddress::new(self.id, offset as u32))
    }

    /// Program a page into its (empty) slot
    pub fn program(&mut self, page: PhysicalPage) -> Result<()> {
        let addr = page.address;
        if addr.block != self.id {
            return Err(Error::InvalidOperation(format!(
                "page {} does not belong to block {}",
                addr, self.id
            )));
        }
        let slot = self.pages.get_mut(addr.offset as usize).ok_or_else(|| {
            Error::InvalidOperation(format!("page {} is outside the block", addr))
        })?;
        if slot.is_some() {
            return Err(Error::InvalidOperation(format!(
                "page {} is already programmed",
                addr
            )));
        }
        *slot = Some(page);
        Ok(())
    }

    /// Page at `offset`, valid or not
    pub fn page(&self, offset: u32) -> Option<&PhysicalPage> {
        self.pages.get(offset as usize).and_then(Option::as_ref)
    }

    fn page_mut(&mut self, offset: u32) -> Option<&mut PhysicalPage> {
        self.pages.get_mut(offset as usize).and_then(Option::as_mut)
    }

    /// Reset every slot and drop level affinity and table associations
    pub fn erase(&mut self) {
        for slot in self.pages.iter_mut() {
            *slot = None;
        }
        self.level = None;
        self.allocated = false;
        self.tables.clear();
        self.cursor = 0;
        self.open = false;
    }
}

/// An arena of erase blocks with its own free list
#[derive(Debug, Clone)]
pub struct BlockZone {
    zone: Zone,
    blocks: Vec<PhysicalBlock>,
    free: VecDeque<BlockId>,
    pages_per_block: usize,
}

impl BlockZone {
    /// A zone of `count` erased blocks
    pub fn new(zone: Zone, count: u32, pages_per_block: usize) -> Self {
        let blocks = (0..count)
            .map(|id| PhysicalBlock::new(id, pages_per_block))
            .collect();
        Self::from_blocks(zone, blocks, pages_per_block)
    }

    /// Rebuild a zone from restored blocks. Writers do not survive a
    /// restart, so every block with an empty slot goes back on the free list.
    pub fn from_blocks(zone: Zone, mut blocks: Vec<PhysicalBlock>, pages_per_block: usize) -> Self {
        for block in blocks.iter_mut() {
            block.open = false;
            block.allocated = block.is_full();
        }
        let free = blocks
            .iter()
            .filter(|b| !b.allocated)
            .map(|b| b.id)
            .collect();
        Self {
            zone,
            blocks,
            free,
            pages_per_block,
        }
    }

    /// Which zone this is
    pub fn zone(&self) -> Zone {
        self.zone
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when the zone has no blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Slots per block
    pub fn pages_per_block(&self) -> usize {
        self.pages_per_block
    }

    /// Number of blocks on the free list
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Fraction of blocks on the free list
    pub fn free_ratio(&self) -> f64 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        self.free.len() as f64 / self.blocks.len() as f64
    }

    /// All blocks
    pub fn blocks(&self) -> &[PhysicalBlock] {
        &self.blocks
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut [PhysicalBlock] {
        &mut self.blocks
    }

    /// Block by id
    pub fn block(&self, id: BlockId) -> Option<&PhysicalBlock> {
        self.blocks.get(id as usize)
    }

    /// Mutable block by id
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut PhysicalBlock> {
        self.blocks.get_mut(id as usize)
    }

    /// Page at `addr`, valid or not
    pub fn page(&self, addr: PageAddress) -> Option<&PhysicalPage> {
        self.block(addr.block).and_then(|b| b.page(addr.offset))
    }

    /// Page at `addr` if it is still readable
    pub fn readable_page(&self, addr: PageAddress) -> Option<&PhysicalPage> {
        self.page(addr).filter(|p| p.valid)
    }

    pub(crate) fn page_mut(&mut self, addr: PageAddress) -> Option<&mut PhysicalPage> {
        self.block_mut(addr.block).and_then(|b| b.page_mut(addr.offset))
    }

    /// Hand a free block to a writer for `level`.
    ///
    /// Prefers a non-full block already serving `level`, then a neutral
    /// block, then any free block. The block stays open until [`close`].
    ///
    /// [`close`]: BlockZone::close
    pub fn take_free(&mut self, level: u32) -> Option<BlockId> {
        let pos = self
            .position_free(|b| b.level == Some(level))
            .or_else(|| self.position_free(|b| b.level.is_none()))
            .or_else(|| self.position_free(|_| true))?;
        let id = self.free.remove(pos)?;
        let block = &mut self.blocks[id as usize];
        block.level = Some(level);
        block.allocated = true;
        block.open = true;
        Some(id)
    }

    /// Borrow a free block for GC migration: same affinity first, then neutral.
    pub fn borrow_free(&mut self, level: Option<u32>) -> Option<BlockId> {
        let pos = self
            .position_free(|b| level.is_some() && b.level == level)
            .or_else(|| self.position_free(|b| b.level.is_none()))?;
        let id = self.free.remove(pos)?;
        let block = &mut self.blocks[id as usize];
        if block.level.is_none() {
            block.level = level;
        }
        block.allocated = true;
        block.open = true;
        Some(id)
    }

    fn position_free<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&PhysicalBlock) -> bool,
    {
        self.free.iter().position(|id| {
            let block = &self.blocks[*id as usize];
            !block.is_full() && pred(block)
        })
    }

    /// Writer is done with the block. A full block stays allocated; any other
    /// block returns to the free list with its level affinity.
    pub fn close(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(id as usize) else {
            return;
        };
        block.open = false;
        if block.is_full() {
            block.allocated = true;
        } else {
            block.allocated = false;
            if !self.free.contains(&id) {
                self.free.push_back(id);
            }
        }
    }

    /// Take a block off the free list and hold it open for GC
    pub(crate) fn pin(&mut self, id: BlockId) {
        self.free.retain(|f| *f != id);
        if let Some(block) = self.blocks.get_mut(id as usize) {
            block.allocated = true;
            block.open = true;
        }
    }

    /// Erase the block and put it back on the free list
    pub fn erase(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.get_mut(id as usize) {
            block.erase();
            if !self.free.contains(&id) {
                self.free.push_back(id);
            }
        }
    }

    /// Take one more reference on a valid page
    pub fn retain(&mut self, addr: PageAddress) -> Result<()> {
        let zone = self.zone;
        match self.page_mut(addr) {
            Some(page) if page.valid => {
                page.ref_count += 1;
                Ok(())
            }
            _ => Err(Error::InvalidOperation(format!(
                "cannot reference unreadable {} page {}",
                zone, addr
            ))),
        }
    }

    /// Drop one reference. Returns true if the page just became invalid.
    pub fn release(&mut self, addr: PageAddress) -> bool {
        match self.page_mut(addr) {
            Some(page) if page.valid => {
                page.ref_count = page.ref_count.saturating_sub(1);
                if page.ref_count == 0 {
                    page.valid = false;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Up to `max` GC victims: populated blocks not held by a writer whose
    /// invalid ratio reaches `threshold` (or that hold any invalid page when
    /// `forced`), worst first.
    pub fn gc_candidates(&self, threshold: f64, forced: bool, max: usize) -> Vec<BlockId> {
        let mut candidates: Vec<(f64, BlockId)> = self
            .blocks
            .iter()
            .filter(|b| !b.open && b.invalid_count() > 0)
            .filter(|b| forced || b.invalid_ratio() >= threshold)
            .map(|b| (b.invalid_ratio(), b.id))
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().take(max).map(|(_, id)| id).collect()
    }

    /// Highest page sequence number in the zone
    pub fn max_seq(&self) -> Option<u64> {
        self.blocks
            .iter()
            .flat_map(|b| b.pages.iter().flatten())
            .map(|p| p.seq)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(k: &str, v: &str) -> KvPair {
        (k.to_string(), v.to_string())
    }

    #[test]
    fn test_next_address_cycles_over_empty_slots() {
        let mut block = PhysicalBlock::new(3, 4);
        let a = block.next_address().unwrap();
        block.program(PhysicalPage::data(a, 1, vec![kv("a", "1")])).unwrap();
        let b = block.next_address().unwrap();
        assert_eq!(a, PageAddress::new(3, 0));
        assert_eq!(b, PageAddress::new(3, 1));
        block.program(PhysicalPage::data(b, 2, vec![kv("b", "1")])).unwrap();
        block.program(PhysicalPage::data(PageAddress::new(3, 3), 3, vec![kv("c", "1")])).unwrap();

        assert_eq!(block.next_address(), Some(PageAddress::new(3, 2)));
        block.program(PhysicalPage::data(PageAddress::new(3, 2), 4, vec![kv("d", "1")])).unwrap();
        assert!(block.is_full());
        assert_eq!(block.next_address(), None);
    }

    #[test]
    fn test_program_rejects_occupied_slot() {
        let mut block = PhysicalBlock::new(0, 2);
        let addr = PageAddress::new(0, 0);
        block.program(PhysicalPage::data(addr, 1, vec![kv("a", "1")])).unwrap();
        assert!(block.program(PhysicalPage::data(addr, 2, vec![kv("a", "2")])).is_err());
        assert!(block
            .program(PhysicalPage::data(PageAddress::new(1, 0), 3, vec![]))
            .is_err());
    }

    #[test]
    fn test_page_search_helpers() {
        let page = PhysicalPage::data(
            PageAddress::new(0, 0),
            1,
            vec![kv("b", "1"), kv("d", "2"), kv("f", "3")],
        );
        assert_eq!(page.key_range, KeyRange::new("b", "f"));
        assert_eq!(page.find("d"), Some("2"));
        assert_eq!(page.find("c"), None);
        let range = KeyRange::new("c", "f");
        assert_eq!(page.keys_in(&range).collect::<Vec<_>>(), vec!["d", "f"]);
        assert_eq!(page.count_in(&KeyRange::new("c", "z")), 2);
    }

    #[test]
    fn test_take_free_prefers_same_level_then_neutral() {
        let mut zone = BlockZone::new(Zone::Data, 3, 2);
        let first = zone.take_free(1).unwrap();
        let addr = zone.block_mut(first).unwrap().next_address().unwrap();
        zone.block_mut(first)
            .unwrap()
            .program(PhysicalPage::data(addr, 1, vec![kv("a", "1")]))
            .unwrap();
        zone.close(first);
        assert_eq!(zone.free_count(), 3);

        // Non-full block keeps its affinity and is handed back for level 1
        assert_eq!(zone.take_free(1), Some(first));
        // Level 2 gets a neutral block instead
        let other = zone.take_free(2).unwrap();
        assert_ne!(other, first);
        assert_eq!(zone.block(other).unwrap().level, Some(2));
    }

    #[test]
    fn test_full_block_stays_allocated_on_close() {
        let mut zone = BlockZone::new(Zone::Metadata, 1, 1);
        let id = zone.take_free(0).unwrap();
        let addr = zone.block_mut(id).unwrap().next_address().unwrap();
        zone.block_mut(id)
            .unwrap()
            .program(PhysicalPage::data(addr, 1, vec![kv("a", "1")]))
            .unwrap();
        zone.close(id);
        assert_eq!(zone.free_count(), 0);
        assert!(zone.block(id).unwrap().allocated);
        assert_eq!(zone.take_free(0), None);
    }

    #[test]
    fn test_retain_release_invalidate() {
        let mut zone = BlockZone::new(Zone::Data, 1, 2);
        let id = zone.take_free(0).unwrap();
        let addr = zone.block_mut(id).unwrap().next_address().unwrap();
        zone.block_mut(id)
            .unwrap()
            .program(PhysicalPage::data(addr, 1, vec![kv("a", "1")]))
            .unwrap();

        zone.retain(addr).unwrap();
        assert!(!zone.release(addr));
        assert!(zone.readable_page(addr).is_some());
        assert!(zone.release(addr));
        assert!(zone.readable_page(addr).is_none());
        assert!(zone.retain(addr).is_err());
        assert!(!zone.release(addr));
    }

    #[test]
    fn test_gc_candidates_respect_threshold_and_open_blocks() {
        let mut zone = BlockZone::new(Zone::Data, 2, 4);
        for (seq, id) in [(1u64, 0u32), (5, 1)] {
            zone.pin(id);
            for i in 0..4u64 {
                let addr = zone.block_mut(id).unwrap().next_address().unwrap();
                zone.block_mut(id)
                    .unwrap()
                    .program(PhysicalPage::data(addr, seq + i, vec![kv("k", "v")]))
                    .unwrap();
            }
        }
        // Block 0: 3 of 4 invalid, block 1: 1 of 4 invalid
        for offset in 0..3 {
            zone.release(PageAddress::new(0, offset));
        }
        zone.release(PageAddress::new(1, 0));

        assert!(zone.gc_candidates(0.7, false, 2).is_empty());
        zone.close(0);
        zone.close(1);
        assert_eq!(zone.gc_candidates(0.7, false, 2), vec![0]);
        assert_eq!(zone.gc_candidates(0.7, true, 2), vec![0, 1]);
        assert_eq!(zone.max_seq(), Some(8));
    }

    #[test]
    fn test_erase_returns_block_to_free_list() {
        let mut zone = BlockZone::new(Zone::Data, 1, 1);
        let id = zone.take_free(4).unwrap();
        let addr = zone.block_mut(id).unwrap().next_address().unwrap();
        zone.block_mut(id)
            .unwrap()
            .program(PhysicalPage::data(addr, 1, vec![kv("a", "1")]))
            .unwrap();
        zone.block_mut(id).unwrap().tables.insert(9);
        zone.close(id);
        assert_eq!(zone.free_count(), 0);

        zone.erase(id);
        let block = zone.block(id).unwrap();
        assert_eq!(block.level, None);
        assert!(!block.allocated);
        assert!(block.tables.is_empty());
        assert_eq!(block.populated(), 0);
        assert_eq!(zone.free_count(), 1);
    }
}
