//! Garbage collection - reclaiming blocks dominated by invalid pages
//!
//! A victim block's valid pages are saved, the block is erased, and the
//! pages are programmed back: into the erased victim first, then into at
//! most two borrowed free blocks of the same affinity. Every reference to a
//! moved page is rewritten before the pass returns, so no table ever points
//! at an erased slot.
//!
//! ```text
//! victim 4: [✓ 4_0][✗ 4_1][✗ 4_2][✓ 4_3]
//!   erase → [  -  ][  -  ][  -  ][  -  ]
//!   home  → [✓ 4_0][✓ 4_1][  -  ][  -  ]   4_3 now lives at 4_1
//! ```

use crate::block::PhysicalPage;
use crate::flash::{next_slot, FlashState};
use kvssd_core::{BlockId, PageAddress, TableId, Zone};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, info, warn};

/// Victim blocks per GC pass
pub const MAX_GC_VICTIMS: usize = 2;
/// Free blocks a single victim may borrow for its valid pages
pub const MAX_BORROWED_BLOCKS: usize = 2;

impl FlashState {
    /// Run one GC pass over `zone`.
    ///
    /// A normal pass takes blocks whose invalid ratio reaches the configured
    /// threshold; a forced pass takes any block holding an invalid page.
    /// Returns the number of blocks reclaimed.
    pub fn collect_garbage(&mut self, zone: Zone, forced: bool) -> usize {
        self.stats.record_gc();
        let victims =
            self.zone(zone)
                .gc_candidates(self.config.gc_threshold, forced, MAX_GC_VICTIMS);
        if victims.is_empty() {
            debug!(%zone, forced, "no block qualifies for garbage collection");
            return 0;
        }

        let mut touched = BTreeSet::new();
        let mut reclaimed = 0;
        let mut moved = 0;
        for victim in victims {
            if let Some(count) = self.reclaim_block(zone, victim, &mut touched) {
                reclaimed += 1;
                moved += count;
            }
        }
        for id in touched {
            self.persist_block(zone, id);
        }
        for table in self.levels.tables() {
            self.persist_table(table);
        }

        info!(
            %zone,
            forced,
            reclaimed,
            moved_pages = moved,
            free_blocks = self.zone(zone).free_count(),
            "garbage collection pass complete"
        );
        reclaimed
    }

    /// Erase `id` and re-home its valid pages. Returns the number of pages
    /// moved, or `None` when there was no room to move them.
    fn reclaim_block(
        &mut self,
        zone: Zone,
        id: BlockId,
        touched: &mut BTreeSet<BlockId>,
    ) -> Option<usize> {
        let (level, valid, reclaimable) = {
            let block = self.zone(zone).block(id)?;
            let valid: Vec<PhysicalPage> = block
                .pages
                .iter()
                .flatten()
                .filter(|p| p.valid)
                .cloned()
                .collect();
            let reclaimable = block.pages.len() - valid.len();
            (block.level, valid, reclaimable)
        };
        let in_place = valid.len().min(reclaimable);
        let remainder = valid.len() - in_place;

        let mut borrowed = Vec::new();
        let mut room = 0;
        while room < remainder && borrowed.len() < MAX_BORROWED_BLOCKS {
            let Some(spare) = self.zone_mut(zone).borrow_free(level) else {
                break;
            };
            room += self.zone(zone).block(spare).map_or(0, |b| b.free_slots());
            borrowed.push(spare);
        }
        if room < remainder {
            warn!(
                %zone,
                block = id,
                valid = valid.len(),
                room,
                "not enough free pages to migrate, skipping block"
            );
            for spare in borrowed {
                self.zone_mut(zone).close(spare);
                touched.insert(spare);
            }
            return None;
        }

        let page_size = self.config.page_size;
        let area = self.zone_mut(zone);
        area.pin(id);
        if let Some(block) = area.block_mut(id) {
            block.erase();
        }
        self.stats.record_erase();

        let mut moves: Vec<(PageAddress, PageAddress)> = Vec::with_capacity(valid.len());
        let mut cursor = 0;
        for (i, mut page) in valid.into_iter().enumerate() {
            let area = self.zone_mut(zone);
            let dest = if i < in_place {
                area.block_mut(id).and_then(|b| b.next_address())
            } else {
                next_slot(area, &borrowed, &mut cursor)
            };
            let Some(dest) = dest else {
                error!(%zone, block = id, page = %page.address, "no slot for migrated page");
                continue;
            };
            let from = page.address;
            page.address = dest;
            let programmed = area
                .block_mut(dest.block)
                .map(|b| b.program(page))
                .unwrap_or(Ok(()));
            if let Err(e) = programmed {
                error!(%zone, page = %from, error = %e, "failed to program migrated page");
                continue;
            }
            self.stats.record_page_write(page_size);
            moves.push((from, dest));
        }

        let area = self.zone_mut(zone);
        let rehomed = area.block(id).map_or(0, |b| b.populated());
        if rehomed > 0 {
            if let Some(block) = area.block_mut(id) {
                block.level = level;
            }
            area.close(id);
        } else {
            area.erase(id);
        }
        for spare in &borrowed {
            area.close(*spare);
        }
        touched.insert(id);
        touched.extend(borrowed);

        self.relocate(zone, &moves);
        debug!(%zone, block = id, moved = moves.len(), in_place = rehomed, "block reclaimed");
        Some(moves.len())
    }

    /// Point every reference at the new address of each moved page.
    fn relocate(&mut self, zone: Zone, moves: &[(PageAddress, PageAddress)]) {
        if moves.is_empty() {
            return;
        }
        let moved: HashMap<PageAddress, PageAddress> = moves.iter().copied().collect();
        let mut owners: Vec<(BlockId, TableId)> = Vec::new();

        match zone {
            Zone::Data => {
                let tables: HashMap<PageAddress, TableId> =
                    self.levels.tables().map(|t| (t.meta_address, t.id)).collect();
                let mut rewritten = BTreeSet::new();
                for block in self.meta.blocks_mut() {
                    let block_id = block.id;
                    for page in block.pages.iter_mut().flatten() {
                        if !page.valid {
                            continue;
                        }
                        let owner = tables.get(&page.address).copied();
                        let Some(entries) = page.directory_entries_mut() else {
                            continue;
                        };
                        for entry in entries.iter_mut() {
                            if let Some(dest) = moved.get(&entry.address) {
                                entry.address = *dest;
                                rewritten.insert(block_id);
                                if let Some(table) = owner {
                                    owners.push((dest.block, table));
                                }
                            }
                        }
                    }
                }
                for (block_id, table) in owners {
                    if let Some(block) = self.data.block_mut(block_id) {
                        block.tables.insert(table);
                    }
                }
                for block_id in rewritten {
                    self.persist_block(Zone::Metadata, block_id);
                }
            }
            Zone::Metadata => {
                for table in self.levels.tables_mut() {
                    if let Some(dest) = moved.get(&table.meta_address) {
                        table.meta_address = *dest;
                        owners.push((dest.block, table.id));
                    }
                }
                for (block_id, table) in owners {
                    if let Some(block) = self.meta.block_mut(block_id) {
                        block.tables.insert(table);
                    }
                }
            }
        }
    }
}
