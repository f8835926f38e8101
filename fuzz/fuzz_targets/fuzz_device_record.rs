#![no_main]

use kvssd_storage::persist::{decode_block, decode_table};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Limit input size to prevent timeout
    if data.len() > 1_000_000 {
        return;
    }

    // Decoding arbitrary bytes must fail cleanly, never panic
    let _ = decode_block(data);
    let _ = decode_table(data);
});
