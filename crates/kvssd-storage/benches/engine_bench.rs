use criterion::{criterion_group, criterion_main, Criterion};
use kvssd_storage::{StorageConfig, StorageEngine};

fn bench_config() -> StorageConfig {
    StorageConfig::default()
        .with_geometry(4096, 8 * 4096)
        .with_memtable_size(7 * 4096)
        .with_capacity(16 * 1024 * 1024)
        .with_meta_zone_blocks(256)
}

fn bench_put_overwrite(c: &mut Criterion) {
    c.bench_function("put_overwrite_1k_keys", |b| {
        let engine = StorageEngine::in_memory(bench_config()).unwrap();
        let value = "v".repeat(100);
        let mut i = 0u64;
        b.iter(|| {
            engine.put(&format!("key_{:04}", i % 1000), &value).unwrap();
            i += 1;
        });
    });
}

fn bench_get_flash(c: &mut Criterion) {
    let engine = StorageEngine::in_memory(bench_config()).unwrap();
    let value = "v".repeat(100);
    for i in 0..5_000 {
        engine.put(&format!("key_{:05}", i), &value).unwrap();
    }
    engine.flush().unwrap();

    c.bench_function("get_from_flash", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let _ = engine.get(&format!("key_{:05}", i % 5_000)).unwrap();
            i += 7;
        });
    });
}

criterion_group!(benches, bench_put_overwrite, bench_get_flash);
criterion_main!(benches);
