//! Abandoned-segment reclamation: a thread that exits with live blocks
//! leaves its segments abandoned; other threads adopt them instead of
//! growing the OS footprint.

use std::sync::Mutex;

use shardalloc_core::{abandoned_count, arena_stats, collect, free, malloc};

const COUNT: usize = 10_000;
const SIZE: usize = 48;

/// The two scenarios watch the global abandoned counter; run them one at
/// a time.
static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn test_exited_thread_segments_are_adopted() {
    let _serial = SERIAL.lock().unwrap();
    let before_abandoned = abandoned_count();

    // Thread A allocates and exits without freeing.
    let ptrs = std::thread::spawn(|| {
        let mut ptrs = Vec::with_capacity(COUNT);
        for i in 0..COUNT {
            let p = malloc(SIZE);
            assert!(!p.is_null());
            // SAFETY: fresh allocation; stamp for later verification.
            unsafe { (p as *mut u32).write(i as u32) };
            ptrs.push(p as usize);
        }
        ptrs
    })
    .join()
    .unwrap();

    assert!(
        abandoned_count() > before_abandoned,
        "thread exit must abandon segments with live blocks"
    );
    let peak = arena_stats();

    // Thread B allocates the same class: it must adopt A's segments
    // rather than carve new ones, and the stamps must survive untouched.
    let b_ptrs = std::thread::spawn(move || {
        let mut mine = Vec::with_capacity(COUNT);
        for _ in 0..COUNT {
            let p = malloc(SIZE);
            assert!(!p.is_null());
            mine.push(p as usize);
        }
        // A's blocks must be intact: adoption moves metadata, not data.
        for (i, &p) in ptrs.iter().enumerate() {
            // SAFETY: A's blocks are still live (never freed).
            unsafe {
                assert_eq!((p as *mut u32).read(), i as u32, "block {} clobbered", i);
            }
        }
        // B now owns the adopted segments; free everything.
        for &p in ptrs.iter().chain(mine.iter()) {
            // SAFETY: each block freed exactly once.
            unsafe { free(p as *mut u8) };
        }
        collect(true);
    });
    b_ptrs.join().unwrap();

    collect(true);
    assert_eq!(
        abandoned_count(),
        before_abandoned,
        "all abandoned segments must be reclaimed"
    );
    let after = arena_stats();
    assert!(
        after.inuse_blocks <= peak.inuse_blocks,
        "B's wave must fit in A's abandoned segments ({} > {})",
        after.inuse_blocks,
        peak.inuse_blocks
    );
    assert_eq!(after.abandoned_blocks, 0);
}

#[test]
fn test_free_into_abandoned_segment_reclaims_it() {
    let _serial = SERIAL.lock().unwrap();
    let ptr = std::thread::spawn(|| {
        let p = malloc(256);
        assert!(!p.is_null());
        p as usize
    })
    .join()
    .unwrap();

    let abandoned = abandoned_count();
    assert!(abandoned >= 1);

    // Freeing into the abandoned segment adopts it immediately (the
    // default `AbandonedReclaimOnFree`), bringing the count back down.
    // SAFETY: the block is live and freed exactly once.
    unsafe { free(ptr as *mut u8) };
    collect(true);
    assert!(
        abandoned_count() < abandoned,
        "free into an abandoned segment must reclaim it"
    );
}
