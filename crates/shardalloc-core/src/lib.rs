//! # shardalloc-core
//!
//! A general-purpose memory allocator built on three cooperating layers:
//!
//! - **Arenas** own large OS reservations, carved into segment-sized
//!   blocks by atomic bitmaps, with delayed decommit of freed ranges.
//! - **Segments** are segment-aligned chunks holding a header and pages;
//!   any pointer recovers its metadata with a mask and a shift.
//! - **Pages** track the blocks of one size class in three sharded free
//!   lists (`free` / `local_free` / `thread_free`) so the per-thread
//!   **heap** can allocate and free without atomics on the hot path.
//!
//! The crate exposes the allocation entry points directly
//! ([`malloc`]/[`free`]/[`realloc`]/...), the [`ShardAlloc`] type for use
//! as a `#[global_allocator]`, and the arena management surface
//! (reserving OS memory, huge-page arenas, diagnostics counters). The C
//! symbol layer lives in the companion `shardalloc-abi` crate.

pub mod arena;
pub mod bitmap;
pub mod diag;
pub mod heap;
pub mod options;
pub mod os;
pub mod page;
pub mod rng;
pub mod segment;
pub mod size_class;

pub use arena::{
    abandoned_count, manage_os_memory, reserve_huge_os_pages_at,
    reserve_huge_os_pages_interleave, reserve_os_memory, stats as arena_stats, ArenaId,
    ArenaStats,
};
pub use diag::{set_error_hook, AllocError, ErrorHook};
pub use heap::{
    collect, free, heartbeat, malloc, malloc_aligned, realloc, register_deferred_free,
    usable_size, zalloc, DeferredFreeFn, MAX_ALIGN,
};
pub use options::{get as option_get, is_enabled as option_is_enabled, set as option_set, ShardOption};

use core::alloc::{GlobalAlloc, Layout};

/// Adapter installing the allocator as a Rust global allocator:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: shardalloc_core::ShardAlloc = shardalloc_core::ShardAlloc;
/// ```
pub struct ShardAlloc;

// SAFETY: the engine returns blocks at least `layout.size()` long aligned
// to `layout.align()`, never hands the same live block out twice, and
// `dealloc` accepts exactly the pointers `alloc` produced.
unsafe impl GlobalAlloc for ShardAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= size_class::WORD_SIZE {
            malloc(layout.size())
        } else {
            malloc_aligned(layout.size(), layout.align())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: caller contract of GlobalAlloc.
        unsafe { free(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= size_class::WORD_SIZE {
            zalloc(layout.size())
        } else {
            let p = malloc_aligned(layout.size(), layout.align());
            if !p.is_null() {
                // SAFETY: successful aligned allocation of layout.size().
                unsafe { core::ptr::write_bytes(p, 0, layout.size()) };
            }
            p
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= size_class::WORD_SIZE {
            // SAFETY: caller contract of GlobalAlloc.
            unsafe { realloc(ptr, new_size) }
        } else {
            // Aligned blocks may be interior pointers; a move through the
            // aligned path keeps the alignment guarantee.
            let fresh = malloc_aligned(new_size, layout.align());
            if fresh.is_null() {
                return core::ptr::null_mut();
            }
            let copy = usable_size(ptr).min(layout.size()).min(new_size);
            // SAFETY: both regions live and at least `copy` bytes long.
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, fresh, copy);
                free(ptr);
            }
            fresh
        }
    }
}

#[cfg(test)]
pub(crate) mod test_sync {
    use parking_lot::Mutex;

    /// Serializes unit tests that abandon segments with the ones that run
    /// the generic routine (which adopts abandoned segments).
    pub static RECLAIM_LOCK: Mutex<()> = Mutex::new(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_alloc_contract() {
        let _serial = test_sync::RECLAIM_LOCK.lock();
        let alloc = ShardAlloc;
        let layout = Layout::from_size_align(200, 8).unwrap();
        // SAFETY: standard GlobalAlloc usage.
        unsafe {
            let p = alloc.alloc(layout);
            assert!(!p.is_null());
            core::ptr::write_bytes(p, 0x7E, 200);
            let q = alloc.realloc(p, layout, 5000);
            assert!(!q.is_null());
            assert_eq!(q.read(), 0x7E);
            assert_eq!(q.add(199).read(), 0x7E);
            alloc.dealloc(q, Layout::from_size_align(5000, 8).unwrap());
        }
    }

    #[test]
    fn test_global_alloc_zeroed_and_aligned() {
        let _serial = test_sync::RECLAIM_LOCK.lock();
        let alloc = ShardAlloc;
        let layout = Layout::from_size_align(4096, 64).unwrap();
        // SAFETY: standard GlobalAlloc usage.
        unsafe {
            let p = alloc.alloc_zeroed(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0);
            for i in (0..4096).step_by(512) {
                assert_eq!(p.add(i).read(), 0);
            }
            alloc.dealloc(p, layout);
        }
    }
}
