#![no_main]

use arbitrary::Arbitrary;
use kvssd::{KvSsd, StorageConfig};
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;

#[derive(Arbitrary, Debug)]
enum EngineOp {
    Put { key: u8, value: String },
    Get { key: u8 },
    Flush,
    ForceGc,
}

fuzz_target!(|ops: Vec<EngineOp>| {
    let config = StorageConfig::default()
        .with_geometry(256, 1024)
        .with_capacity(64 * 1024)
        .with_memtable_size(512)
        .with_meta_zone_blocks(64)
        .with_level_limits(vec![1, 2, 4]);
    let Ok(db) = KvSsd::in_memory_with_config(config) else {
        return;
    };
    let mut model: HashMap<String, String> = HashMap::new();

    for op in ops.iter().take(500) {
        match op {
            EngineOp::Put { key, value } => {
                let key = format!("k{:03}", key);
                if value.len() > 200 {
                    continue;
                }
                // A write that fails after buffering may or may not be
                // visible, so the model stops being exact
                if db.put(&key, value).is_err() {
                    break;
                }
                model.insert(key, value.clone());
            }
            EngineOp::Get { key } => {
                let key = format!("k{:03}", key);
                if let Ok(found) = db.get(&key) {
                    if let Some(expected) = model.get(&key) {
                        assert_eq!(found.as_ref(), Some(expected));
                    }
                }
            }
            EngineOp::Flush => {
                let _ = db.flush();
            }
            EngineOp::ForceGc => {
                let _ = db.force_gc();
            }
        }
    }
});
