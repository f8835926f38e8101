//! Point lookups over the flash levels
//!
//! Every page read on this path counts as one flash access: the directory
//! page of each table whose range covers the key, then candidate data pages
//! newest first until the key is found.

use crate::block::DirectoryEntry;
use crate::flash::FlashState;
use tracing::trace;

/// Result of a flash lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    /// Value found, if any
    pub value: Option<String>,
    /// Pages read to answer
    pub flash_accesses: u32,
}

impl FlashState {
    /// Find the newest value of `key` stored on flash.
    ///
    /// Level 0 tables may overlap, so every one covering the key is
    /// consulted. Deeper levels hold disjoint ranges and stop at the first
    /// covering table.
    pub fn lookup(&self, key: &str) -> Lookup {
        let mut flash_accesses = 0u32;

        for (level, tables) in self.levels.levels() {
            let mut candidates: Vec<DirectoryEntry> = Vec::new();
            for table in tables {
                if table.key_range.min.as_str() > key {
                    if level == 0 {
                        continue;
                    }
                    break;
                }
                if !table.might_contain(key) {
                    continue;
                }
                let Some(directory) = self.meta.readable_page(table.meta_address) else {
                    continue;
                };
                flash_accesses += 1;
                self.stats.record_page_read();
                candidates.extend(
                    directory
                        .directory_entries()
                        .iter()
                        .filter(|e| e.range.contains(key))
                        .cloned(),
                );
                if level > 0 {
                    break;
                }
            }

            candidates.sort_by(|a, b| b.seq.cmp(&a.seq));
            for entry in candidates {
                let Some(page) = self.data.readable_page(entry.address) else {
                    continue;
                };
                flash_accesses += 1;
                self.stats.record_page_read();
                if let Some(value) = page.find(key) {
                    trace!(key, level, page = %entry.address, flash_accesses, "flash hit");
                    return Lookup {
                        value: Some(value.to_string()),
                        flash_accesses,
                    };
                }
            }
        }

        Lookup {
            value: None,
            flash_accesses,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::flash::tests::{flash_with, frozen, small_config};

    #[test]
    fn test_lookup_prefers_newest_level0_page() {
        let config = small_config().with_level_limits(vec![4]);
        let (mut flash, _) = flash_with(&config);
        flash.flush_buffer(&frozen(&[("a", "1"), ("k", "old")]), 0).unwrap();
        flash.flush_buffer(&frozen(&[("k", "new"), ("z", "1")]), 0).unwrap();

        let hit = flash.lookup("k");
        assert_eq!(hit.value.as_deref(), Some("new"));
        // Two directory pages, then the newest data page
        assert_eq!(hit.flash_accesses, 3);
    }

    #[test]
    fn test_lookup_miss_counts_accesses() {
        let config = small_config();
        let (mut flash, _) = flash_with(&config);
        flash.flush_buffer(&frozen(&[("a", "1"), ("c", "1")]), 0).unwrap();

        let inside = flash.lookup("b");
        assert_eq!(inside.value, None);
        assert_eq!(inside.flash_accesses, 2);

        let outside = flash.lookup("x");
        assert_eq!(outside.value, None);
        assert_eq!(outside.flash_accesses, 0);
    }

    #[test]
    fn test_lookup_falls_through_to_deeper_level() {
        let config = small_config();
        let (mut flash, _) = flash_with(&config);
        flash.flush_buffer(&frozen(&[("a", "deep"), ("m", "deep")]), 0).unwrap();
        flash.flush_buffer(&frozen(&[("b", "shallow")]), 0).unwrap();
        flash.check_compaction(0).unwrap();
        assert_eq!(flash.levels.count(1), 1);

        assert_eq!(flash.lookup("a").value.as_deref(), Some("deep"));
        assert_eq!(flash.lookup("b").value.as_deref(), Some("shallow"));
        assert_eq!(flash.stats.snapshot().flash_page_reads, 4);
    }
}
