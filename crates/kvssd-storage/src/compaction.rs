//! Compaction - merging an over-full level into the next one
//!
//! Compaction never rewrites data pages. Output tables at level L+1 are new
//! directory pages that reference the existing data pages of the inputs,
//! each referenced page gaining one reference per output that lists it:
//!
//! ```text
//! L0   [a ........ m]  [c ... h]            victims (oldest first)
//! L1       [b .. e]          [k .. p]  [x .. z]
//!           └───── overlapping ─────┘   fence
//!
//! L1'  [a .. d] [e .. j] [k .. p]       [x .. z]
//! ```
//!
//! Output ranges are cut on page boundaries. A page straddling a cut is
//! listed by both neighbours. Every directory entry is narrowed to the keys
//! its table serves, so a page never brings back keys that a neighbour
//! already handed further down.

use crate::block::{DirectoryEntry, PhysicalPage};
use crate::flash::FlashState;
use crate::sstable::SSTable;
use kvssd_core::{KeyRange, Result, TableId, Zone};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// One output table in the making
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionGroup {
    /// Data pages listed by the output
    pub entries: Vec<DirectoryEntry>,
    /// Smallest key the output serves
    pub lower: String,
    /// Exclusive cut at which the next group starts, if the group was cut
    pub upper: Option<String>,
}

/// Split directory entries (sorted by min key) into output groups of about
/// `capacity` pages.
///
/// A group is cut at the next entry's min key once `capacity` pages were
/// added to it; entries reaching past the cut are carried into the next
/// group without counting against its capacity. A group is also closed
/// whenever one of the `fences` (ranges of tables that stay at the target
/// level) fits between its keys and the next entry.
pub fn partition_entries(
    entries: &[DirectoryEntry],
    capacity: usize,
    fences: &[KeyRange],
) -> Vec<PartitionGroup> {
    let capacity = capacity.max(1);
    let mut groups = Vec::new();
    let Some(first) = entries.first() else {
        return groups;
    };
    let mut members: Vec<DirectoryEntry> = Vec::new();
    let mut added = 0usize;
    let mut lower = first.range.min.clone();

    for (i, entry) in entries.iter().enumerate() {
        let fenced = members
            .iter()
            .map(|m| m.range.max.as_str())
            .max()
            .map_or(false, |group_max| fence_between(fences, group_max, &entry.range.min));
        if fenced {
            groups.push(PartitionGroup {
                entries: std::mem::take(&mut members),
                lower: std::mem::replace(&mut lower, entry.range.min.clone()),
                upper: None,
            });
            added = 0;
        }
        members.push(entry.clone());
        added += 1;

        let Some(next) = entries.get(i + 1) else {
            break;
        };
        if added >= capacity && next.range.min > lower {
            let cut = next.range.min.clone();
            let carried: Vec<DirectoryEntry> = members
                .iter()
                .filter(|m| m.range.max >= cut)
                .cloned()
                .collect();
            groups.push(PartitionGroup {
                entries: std::mem::replace(&mut members, carried),
                lower: std::mem::replace(&mut lower, cut.clone()),
                upper: Some(cut),
            });
            added = 0;
        }
    }
    if !members.is_empty() {
        groups.push(PartitionGroup {
            entries: members,
            lower,
            upper: None,
        });
    }
    groups
}

/// True if some fence lies strictly between `after` and `before`.
/// `fences` must be disjoint and sorted by min key.
fn fence_between(fences: &[KeyRange], after: &str, before: &str) -> bool {
    let idx = fences.partition_point(|f| f.min.as_str() <= after);
    fences
        .get(idx)
        .map_or(false, |f| f.max.as_str() < before)
}

impl FlashState {
    /// Compact `level` while it holds more tables than its limit, cascading
    /// into each next level that overflows in turn.
    pub fn check_compaction(&mut self, level: u32) -> Result<()> {
        let mut level = level;
        while self.levels.count(level) > self.config.level_limit(level) {
            self.compact_level(level)?;
            level += 1;
        }
        Ok(())
    }

    /// Merge the oldest excess tables of `level` into `level + 1`.
    pub(crate) fn compact_level(&mut self, level: u32) -> Result<()> {
        let limit = self.config.level_limit(level);
        let count = self.levels.count(level);
        if count <= limit {
            return Ok(());
        }
        let excess = count - limit;
        let target = level + 1;

        let mut victims: Vec<SSTable> = self.levels.level(level).to_vec();
        victims.sort_by_key(|t| t.id);
        victims.truncate(excess);

        // Entries never reach past their table's range, so the victims'
        // ranges decide which target-level tables join the merge.
        let (overlapping, remaining): (Vec<SSTable>, Vec<SSTable>) = self
            .levels
            .level(target)
            .iter()
            .cloned()
            .partition(|t| victims.iter().any(|v| v.key_range.overlaps(&t.key_range)));
        let mut candidates = victims;
        candidates.extend(overlapping);
        let candidate_ids: HashSet<TableId> = candidates.iter().map(|t| t.id).collect();

        let entries = self.serving_entries(&candidates);
        let mut entries = self.drop_obsolete(entries);
        entries.sort_by(|a, b| {
            a.range
                .min
                .cmp(&b.range.min)
                .then_with(|| a.range.max.cmp(&b.range.max))
        });

        let fences: Vec<KeyRange> = remaining.iter().map(|t| t.key_range.clone()).collect();
        let groups = partition_entries(&entries, self.config.pages_per_block(), &fences);

        let mut meta_blocks = Vec::with_capacity(groups.len());
        for _ in &groups {
            match self.allocate(Zone::Metadata, target) {
                Ok(id) => meta_blocks.push(id),
                Err(e) => {
                    self.release_reservation(Zone::Metadata, &meta_blocks);
                    return Err(e);
                }
            }
        }
        // Metadata GC during reservation may have moved directory pages
        let candidates: Vec<SSTable> = candidates
            .iter()
            .filter_map(|t| self.levels.table(t.id).cloned())
            .collect();

        let mut outputs = Vec::with_capacity(groups.len());
        for (group, meta_block) in groups.into_iter().zip(meta_blocks) {
            let key_range = self.group_range(&group);
            let directory: Vec<DirectoryEntry> = group
                .entries
                .iter()
                .filter_map(|e| self.clip_entry(e, &key_range))
                .collect();
            if directory.is_empty() {
                self.release_reservation(Zone::Metadata, &[meta_block]);
                continue;
            }
            let kv_pair_count = directory
                .iter()
                .filter_map(|e| self.data.page(e.address).map(|p| p.count_in(&e.range) as u64))
                .sum();
            for entry in &directory {
                self.data.retain(entry.address)?;
            }
            let id = self.bump_table_id();
            let table =
                self.program_directory(meta_block, id, target, directory, key_range, kv_pair_count)?;
            debug!(table = table.id, level = target, range = %table.key_range, "compaction output");
            outputs.push(table);
        }

        let mut next_level: Vec<SSTable> = self
            .levels
            .level(target)
            .iter()
            .filter(|t| !candidate_ids.contains(&t.id))
            .cloned()
            .collect();
        next_level.extend(outputs.iter().cloned());
        self.levels.replace_level(target, next_level);

        for table in &candidates {
            self.invalidate_table(table);
        }
        self.persist_levels();
        self.stats.record_compaction();

        info!(
            level,
            victims = excess,
            inputs = candidates.len(),
            outputs = outputs.len(),
            "compacted level"
        );
        Ok(())
    }

    /// Directory entries of `tables`, each narrowed to the keys its own
    /// table serves. Pieces of one page with no page key between them are
    /// merged back into a single entry.
    fn serving_entries(&self, tables: &[SSTable]) -> Vec<DirectoryEntry> {
        let mut pieces: Vec<DirectoryEntry> = Vec::new();
        for table in tables {
            for entry in self.directory(table) {
                pieces.extend(self.clip_entry(&entry, &table.key_range));
            }
        }
        pieces.sort_by(|a, b| {
            a.address
                .cmp(&b.address)
                .then_with(|| a.range.min.cmp(&b.range.min))
        });

        let mut merged: Vec<DirectoryEntry> = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if let Some(last) = merged.last_mut() {
                if last.address == piece.address && self.contiguous(last, &piece) {
                    if piece.range.max > last.range.max {
                        last.range.max = piece.range.max;
                    }
                    continue;
                }
            }
            merged.push(piece);
        }
        merged
    }

    /// Narrow `entry` to the keys of its page that also fall inside `range`
    fn clip_entry(&self, entry: &DirectoryEntry, range: &KeyRange) -> Option<DirectoryEntry> {
        let page = self.data.page(entry.address)?;
        let clipped = KeyRange::spanning(page.keys_in(&entry.range).filter(|k| range.contains(k)))?;
        Some(DirectoryEntry {
            address: entry.address,
            range: clipped,
            seq: entry.seq,
        })
    }

    /// Two pieces of the same page (`left.min <= right.min`) cover an
    /// unbroken run of its keys
    fn contiguous(&self, left: &DirectoryEntry, right: &DirectoryEntry) -> bool {
        if right.range.min <= left.range.max {
            return true;
        }
        self.data.page(left.address).map_or(false, |page| {
            !page.entries().iter().any(|(k, _)| {
                k.as_str() > left.range.max.as_str() && k.as_str() < right.range.min.as_str()
            })
        })
    }

    /// Keep readable entries that still hold the newest copy of at least
    /// one of the keys they serve.
    fn drop_obsolete(&self, entries: Vec<DirectoryEntry>) -> Vec<DirectoryEntry> {
        let readable: Vec<(DirectoryEntry, &PhysicalPage)> = entries
            .into_iter()
            .filter_map(|e| {
                let page = self.data.readable_page(e.address)?;
                Some((e, page))
            })
            .collect();

        let mut newest: HashMap<&str, u64> = HashMap::new();
        for (entry, page) in &readable {
            for key in page.keys_in(&entry.range) {
                let seq = newest.entry(key).or_insert(page.seq);
                if page.seq > *seq {
                    *seq = page.seq;
                }
            }
        }

        let before = readable.len();
        let kept: Vec<DirectoryEntry> = readable
            .iter()
            .filter(|(entry, page)| {
                page.keys_in(&entry.range)
                    .any(|key| newest.get(key).map_or(true, |s| *s <= page.seq))
            })
            .map(|(e, _)| e.clone())
            .collect();
        if kept.len() < before {
            debug!(dropped = before - kept.len(), "obsolete pages left out of compaction");
        }
        kept
    }

    /// Range served by an output group: clipped below the cut when the group
    /// was cut, otherwise up to the largest key its entries serve.
    fn group_range(&self, group: &PartitionGroup) -> KeyRange {
        let max = match &group.upper {
            Some(cut) => group
                .entries
                .iter()
                .filter_map(|e| {
                    let page = self.data.page(e.address)?;
                    page.keys_in(&e.range).filter(|k| *k < cut.as_str()).max()
                })
                .max()
                .map(str::to_string),
            None => group
                .entries
                .iter()
                .map(|e| e.range.max.as_str())
                .max()
                .map(str::to_string),
        };
        let max = max.unwrap_or_else(|| group.lower.clone());
        KeyRange::new(group.lower.clone(), max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::tests::{flash_with, frozen, small_config};
    use kvssd_core::PageAddress;

    fn entry(block: u32, min: &str, max: &str) -> DirectoryEntry {
        DirectoryEntry {
            address: PageAddress::new(block, 0),
            range: KeyRange::new(min, max),
            seq: block as u64,
        }
    }

    fn blocks(group: &PartitionGroup) -> Vec<u32> {
        group.entries.iter().map(|e| e.address.block).collect()
    }

    /// Register a table at `level` listing `directory`, bypassing compaction
    fn install(
        flash: &mut FlashState,
        level: u32,
        directory: Vec<DirectoryEntry>,
        key_range: KeyRange,
    ) -> SSTable {
        let meta = flash.allocate(Zone::Metadata, level).unwrap();
        for entry in &directory {
            flash.data.retain(entry.address).unwrap();
        }
        let id = flash.bump_table_id();
        let table = flash
            .program_directory(meta, id, level, directory, key_range, 1)
            .unwrap();
        flash.levels.insert(table.clone());
        table
    }

    #[test]
    fn test_partition_disjoint_pages() {
        let entries = vec![
            entry(0, "a", "b"),
            entry(1, "c", "d"),
            entry(2, "e", "f"),
            entry(3, "g", "h"),
            entry(4, "i", "j"),
        ];
        let groups = partition_entries(&entries, 2, &[]);
        assert_eq!(groups.len(), 3);
        assert_eq!(blocks(&groups[0]), vec![0, 1]);
        assert_eq!(groups[0].lower, "a");
        assert_eq!(groups[0].upper.as_deref(), Some("e"));
        assert_eq!(blocks(&groups[1]), vec![2, 3]);
        assert_eq!(groups[1].lower, "e");
        assert_eq!(groups[1].upper.as_deref(), Some("i"));
        assert_eq!(blocks(&groups[2]), vec![4]);
        assert_eq!(groups[2].upper, None);
    }

    #[test]
    fn test_partition_carries_straddling_page() {
        let entries = vec![entry(0, "a", "c"), entry(1, "b", "z"), entry(2, "d", "e")];
        let groups = partition_entries(&entries, 2, &[]);
        assert_eq!(groups.len(), 2);
        assert_eq!(blocks(&groups[0]), vec![0, 1]);
        assert_eq!(groups[0].upper.as_deref(), Some("d"));
        // Page 1 reaches past the cut and is listed again
        assert_eq!(blocks(&groups[1]), vec![1, 2]);
        assert_eq!(groups[1].lower, "d");
    }

    #[test]
    fn test_partition_carried_pages_do_not_fill_groups() {
        let entries = vec![
            entry(0, "a", "z"),
            entry(1, "b", "c"),
            entry(2, "d", "e"),
            entry(3, "f", "g"),
            entry(4, "h", "i"),
        ];
        let groups = partition_entries(&entries, 2, &[]);
        assert_eq!(groups.len(), 3);
        assert_eq!(blocks(&groups[0]), vec![0, 1]);
        assert_eq!(blocks(&groups[1]), vec![0, 2, 3]);
        assert_eq!(groups[1].lower, "d");
        assert_eq!(groups[1].upper.as_deref(), Some("h"));
        assert_eq!(blocks(&groups[2]), vec![0, 4]);
    }

    #[test]
    fn test_partition_closes_at_fence() {
        let entries = vec![entry(0, "a", "b"), entry(1, "x", "y")];
        let fences = vec![KeyRange::new("m", "n")];
        let groups = partition_entries(&entries, 8, &fences);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].upper, None);
        assert_eq!(groups[1].lower, "x");

        assert_eq!(partition_entries(&entries, 8, &[]).len(), 1);
        // A fence overlapping the next page does not sit in the gap
        let touching = vec![KeyRange::new("m", "x")];
        assert_eq!(partition_entries(&entries, 8, &touching).len(), 1);
    }

    #[test]
    fn test_partition_never_cuts_equal_min_keys() {
        let entries = vec![entry(0, "m", "m"), entry(1, "m", "p"), entry(2, "m", "q")];
        let groups = partition_entries(&entries, 1, &[]);
        assert_eq!(groups.len(), 1);
        assert_eq!(blocks(&groups[0]), vec![0, 1, 2]);
    }

    #[test]
    fn test_partition_groups_are_ordered() {
        let entries = vec![
            entry(0, "a", "k"),
            entry(1, "b", "c"),
            entry(2, "d", "e"),
            entry(3, "f", "t"),
            entry(4, "g", "h"),
            entry(5, "u", "v"),
            entry(6, "w", "x"),
        ];
        let groups = partition_entries(&entries, 2, &[]);
        for pair in groups.windows(2) {
            assert!(pair[0].lower < pair[1].lower);
            if let Some(cut) = &pair[0].upper {
                assert_eq!(&pair[1].lower, cut);
            }
        }
        for e in &entries {
            assert!(groups.iter().any(|g| g.entries.contains(e)));
        }
    }

    #[test]
    fn test_compaction_moves_level0_into_level1() {
        let config = small_config();
        let (mut flash, _) = flash_with(&config);
        flash.flush_buffer(&frozen(&[("a", "1"), ("c", "1")]), 0).unwrap();
        flash.flush_buffer(&frozen(&[("b", "2"), ("c", "2")]), 0).unwrap();
        assert_eq!(flash.levels.count(0), 2);

        flash.check_compaction(0).unwrap();
        assert_eq!(flash.levels.count(0), 1);
        assert_eq!(flash.levels.count(1), 1);
        assert_eq!(flash.stats.snapshot().compaction_count, 1);

        let output = flash.levels.level(1)[0].clone();
        let dir = flash.directory(&output);
        assert_eq!(dir.len(), 1);
        // Compaction adds a reference, the victim's was released
        let page = flash.data.readable_page(dir[0].address).unwrap();
        assert_eq!(page.ref_count, 1);
        assert_eq!(output.key_range, KeyRange::new("a", "c"));
    }

    #[test]
    fn test_compaction_skips_shadowed_pages() {
        let config = small_config().with_level_limits(vec![1, 4]);
        let (mut flash, _) = flash_with(&config);
        let old = flash.flush_buffer(&frozen(&[("k", "old")]), 0).unwrap();
        let old_page = flash.directory(&old)[0].address;
        flash.flush_buffer(&frozen(&[("k", "mid")]), 0).unwrap();
        flash.check_compaction(0).unwrap();
        flash.flush_buffer(&frozen(&[("k", "new")]), 0).unwrap();
        flash.check_compaction(0).unwrap();

        // The level-1 table and the "mid" victim both held k; the older page
        // is not listed by the new output and lost its last reference
        let level1 = flash.levels.level(1).to_vec();
        assert_eq!(level1.len(), 1);
        let dir = flash.directory(&level1[0]);
        assert_eq!(dir.len(), 1);
        assert_ne!(dir[0].address, old_page);
        assert!(flash.data.readable_page(old_page).is_none());
        assert_eq!(flash.lookup("k").value.as_deref(), Some("new"));
    }

    #[test]
    fn test_compaction_ignores_straddler_keys_outside_victim_range() {
        let config = small_config().with_level_limits(vec![8, 1, 1, 8]);
        let (mut flash, _) = flash_with(&config);
        let old = flash
            .flush_buffer(&frozen(&[("a", "old"), ("b", "old"), ("c", "old")]), 0)
            .unwrap();
        let newer = flash.flush_buffer(&frozen(&[("b", "new")]), 0).unwrap();
        let other = flash.flush_buffer(&frozen(&[("x", "1")]), 0).unwrap();

        // Level 1 serves only "a" from the shared page; "b" already lives at
        // level 3 and "c" is served nowhere
        let shared = flash.directory(&old);
        assert_eq!(shared[0].range, KeyRange::new("a", "c"));
        let narrow = install(&mut flash, 1, shared, KeyRange::new("a", "a"));
        let dir = flash.directory(&other);
        install(&mut flash, 1, dir, KeyRange::new("x", "x"));
        let dir = flash.directory(&newer);
        install(&mut flash, 3, dir, KeyRange::new("b", "b"));
        for table in [&old, &newer, &other] {
            flash.invalidate_table(table);
        }
        assert_eq!(flash.lookup("b").value.as_deref(), Some("new"));

        flash.compact_level(1).unwrap();
        assert!(flash.levels.table(narrow.id).is_none());
        let level2 = flash.levels.level(2).to_vec();
        assert_eq!(level2.len(), 1);
        assert_eq!(level2[0].key_range, KeyRange::new("a", "a"));
        let dir = flash.directory(&level2[0]);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir[0].range, KeyRange::new("a", "a"));

        assert_eq!(flash.lookup("a").value.as_deref(), Some("old"));
        assert_eq!(flash.lookup("b").value.as_deref(), Some("new"));
        assert_eq!(flash.lookup("c").value, None);
    }

    #[test]
    fn test_compaction_output_ranges_disjoint() {
        let config = small_config().with_capacity(32 * 256).with_level_limits(vec![1, 8]);
        let (mut flash, _) = flash_with(&config);
        let batches: [&[(&str, &str)]; 4] = [
            &[("a", "1"), ("m", "1")],
            &[("c", "1"), ("d", "1")],
            &[("x", "1"), ("y", "1")],
            &[("b", "1"), ("z", "1")],
        ];
        for batch in batches {
            flash.flush_buffer(&frozen(batch), 0).unwrap();
            flash.check_compaction(0).unwrap();
        }
        let level1 = flash.levels.level(1);
        assert!(!level1.is_empty());
        for (i, a) in level1.iter().enumerate() {
            for b in &level1[i + 1..] {
                assert!(!a.key_range.overlaps(&b.key_range), "{} overlaps {}", a.key_range, b.key_range);
            }
        }
        for key in ["a", "b", "c", "d", "m", "x", "y", "z"] {
            assert_eq!(flash.lookup(key).value.as_deref(), Some("1"), "key {}", key);
        }
    }
}
