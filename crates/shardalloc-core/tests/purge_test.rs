//! Delayed decommit: freed arena ranges stay committed until the purge
//! deadline passes, then a collect decommits them.

use std::sync::Mutex;
use std::time::Duration;

use shardalloc_core::{arena_stats, collect, free, malloc, option_set, ShardOption};

const BIG: usize = 64 << 20; // 64 MiB: a healthy run of arena blocks

/// Both scenarios flip global purge options; run them one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn test_purge_waits_for_its_deadline() {
    let _serial = SERIAL.lock().unwrap();
    // 100 ms effective delay at the arena level.
    option_set(ShardOption::PurgeDelay, 100);
    option_set(ShardOption::ArenaPurgeMult, 1);
    option_set(ShardOption::PurgeDecommits, 1);

    let p = malloc(BIG);
    assert!(!p.is_null());
    // SAFETY: live allocation; touch it so the pages are really backed.
    unsafe {
        for off in (0..BIG).step_by(1 << 20) {
            p.add(off).write(1);
        }
    }
    let committed_live = arena_stats().committed_blocks;
    assert!(committed_live > 0);

    // SAFETY: freed exactly once.
    unsafe { free(p) };

    // Before the deadline: the range stays committed (and is marked for
    // purge instead of being decommitted eagerly).
    collect(false);
    let s = arena_stats();
    assert!(
        s.committed_blocks >= committed_live.saturating_sub(1),
        "no decommit may happen before the purge deadline"
    );
    assert!(s.purge_blocks > 0, "the freed range must be scheduled");
    assert!(
        s.inuse_blocks + s.purge_blocks <= s.total_blocks,
        "a block may be in use or scheduled for purge, never both"
    );

    // Let the deadline pass across some allocation activity.
    std::thread::sleep(Duration::from_millis(300));
    let q = malloc(64);
    // SAFETY: freed exactly once.
    unsafe { free(q) };
    collect(false);

    let after = arena_stats();
    assert!(
        after.committed_blocks < committed_live,
        "expired purge must decommit the freed range ({} -> {})",
        committed_live,
        after.committed_blocks
    );
    assert_eq!(after.purge_blocks, 0, "purge bitmap must be drained");
}

#[test]
fn test_negative_delay_disables_purging() {
    let _serial = SERIAL.lock().unwrap();
    option_set(ShardOption::PurgeDelay, -1);

    let p = malloc(BIG);
    assert!(!p.is_null());
    let committed = arena_stats().committed_blocks;
    // SAFETY: freed exactly once.
    unsafe { free(p) };
    collect(true);

    let after = arena_stats();
    assert!(
        after.committed_blocks >= committed.saturating_sub(1),
        "purging disabled: the range must stay committed"
    );
    assert_eq!(after.purge_blocks, 0);

    option_set(ShardOption::PurgeDelay, 10);
}
