//! End-to-end: install the allocator as the Rust global allocator and let
//! the standard library hammer it (collections, strings, threads -- and
//! the test harness itself).

use std::collections::HashMap;

use shardalloc_core::ShardAlloc;

#[global_allocator]
static ALLOC: ShardAlloc = ShardAlloc;

#[test]
fn test_collections_round_trip() {
    let mut v: Vec<u64> = Vec::new();
    for i in 0..100_000u64 {
        v.push(i * 3);
    }
    assert_eq!(v.len(), 100_000);
    assert_eq!(v[77_777], 77_777 * 3);

    let mut m: HashMap<String, usize> = HashMap::new();
    for i in 0..10_000 {
        m.insert(format!("key-{}", i), i);
    }
    assert_eq!(m["key-4242"], 4242);
    m.clear();
    m.shrink_to_fit();
}

#[test]
fn test_string_growth_and_shrink() {
    let mut s = String::new();
    for i in 0..10_000 {
        s.push_str("shard");
        if i % 100 == 0 {
            s.shrink_to_fit();
        }
    }
    assert_eq!(s.len(), 50_000);
    assert!(s.starts_with("shardshard"));
}

#[test]
fn test_threaded_collections() {
    let handles: Vec<_> = (0..8)
        .map(|t| {
            std::thread::spawn(move || {
                let mut boxes: Vec<Box<[u8; 256]>> = Vec::new();
                for i in 0..1000 {
                    let mut b = Box::new([0u8; 256]);
                    b[0] = (t + i) as u8;
                    boxes.push(b);
                }
                // Hand half of them to another vector that outlives the
                // loop, drop the rest here.
                let keep: Vec<_> = boxes.drain(..500).collect();
                keep.iter().map(|b| b[0] as usize).sum::<usize>()
            })
        })
        .collect();
    let mut total = 0;
    for h in handles {
        total += h.join().unwrap();
    }
    assert!(total > 0);
}

#[test]
fn test_large_vec_reallocation() {
    // Vec growth goes through GlobalAlloc::realloc across many size
    // classes, ending in the huge range.
    let mut v: Vec<u8> = Vec::with_capacity(16);
    for i in 0..(8 << 20) {
        v.push((i % 251) as u8);
    }
    for i in (0..v.len()).step_by(1 << 16) {
        assert_eq!(v[i], (i % 251) as u8);
    }
}
