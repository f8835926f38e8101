use kvssd::logging::{LogConfig, LogFormat};
use kvssd::{KvSsd, StorageConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Engine at info, compaction detail at debug
    let _guard = LogConfig::info()
        .with_target("kvssd_storage::compaction", "debug")
        .with_format(LogFormat::Compact)
        .init();

    println!("=== KVSSD Logging Demo ===\n");

    let config = StorageConfig::default()
        .with_geometry(256, 1024)
        .with_capacity(48 * 1024)
        .with_memtable_size(512)
        .with_meta_zone_blocks(32)
        .with_level_limits(vec![1, 2, 4]);
    let db = KvSsd::in_memory_with_config(config)?;

    println!("1. Overwriting 40 keys...");
    for round in 0..50 {
        for i in 0..40 {
            db.put(&format!("key_{:02}", i), &format!("{:016}", round))?;
        }
    }

    println!("\n2. Reading back...");
    if let Some(value) = db.get("key_07")? {
        println!("key_07 = {}", value);
    }

    println!("\n3. Forcing garbage collection...");
    let reclaimed = db.force_gc()?;
    println!("reclaimed {} blocks", reclaimed);

    println!("\n=== Demo Complete ===");
    Ok(())
}
