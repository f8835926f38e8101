//! Writes a batch of keys through a small simulated device and prints what
//! the flash layer did with them.
//!
//! Run with: cargo run -p kvssd --example workload_demo

use kvssd::{KvSsd, StorageConfig};
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = "./kvssd_demo";
    if Path::new(path).exists() {
        std::fs::remove_dir_all(path)?;
    }

    // 4KB pages, 4 pages per block, 2MB of data blocks
    let config = StorageConfig::default()
        .with_geometry(4096, 4 * 4096)
        .with_capacity(2 * 1024 * 1024)
        .with_memtable_size(3 * 4096)
        .with_meta_zone_blocks(128);

    println!("=== KVSSD Workload Demo ===\n");
    {
        let db = KvSsd::open_with_config(path, config.clone())?;
        let value = "v".repeat(200);
        for round in 0..5 {
            for i in 0..1_000 {
                db.put(&format!("key_{:04}", i), &format!("{}{}", value, round))?;
            }
        }
        for i in (0..1_000).step_by(97) {
            db.get(&format!("key_{:04}", i))?;
        }
        db.cleanup()?;

        let stats = db.stats();
        println!("writes:              {}", stats.write_count);
        println!("reads:               {}", stats.read_count);
        println!("sstables per level:  {:?}", stats.level_counts);
        println!("compactions:         {}", stats.compaction_count);
        println!("gc passes:           {}", stats.gc_count);
        println!("block erases:        {}", stats.erase_count);
        println!("write amplification: {:.2}", stats.write_amplification);
        println!("read histogram:      {:?}", stats.read_histogram);
    }

    println!("\nReopening...");
    let db = KvSsd::open_with_config(path, config)?;
    let sample = db.get("key_0500")?;
    println!("key_0500 ends with {:?}", sample.as_deref().map(|v| &v[v.len() - 1..]));

    std::fs::remove_dir_all(path)?;
    Ok(())
}
