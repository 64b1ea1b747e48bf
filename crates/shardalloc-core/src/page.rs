//! Pages and the three-list free-block sharding.
//!
//! A page is a contiguous run inside a segment whose blocks all share one
//! size class. Its free blocks are sharded over three singly-linked LIFO
//! lists with distinct ownership rules:
//!
//! - `free`: the fast-path pool. Only the owning thread touches it, so a
//!   pop is two plain loads and a store.
//! - `local_free`: same-thread frees land here instead of `free`, keeping
//!   the fast path from immediately recycling a just-freed block.
//! - `thread_free`: the cross-thread inbox, a CAS-push atomic list with a
//!   matching `thread_freed` counter incremented after each push.
//!
//! The struct makes the ownership split explicit: [`OwnerHalf`] may only be
//! touched by the thread whose segment owns the page, [`SharedHalf`] by
//! anyone. The `Sync` impl is sound only under that protocol.

use std::cell::Cell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::diag::{self, AllocError};
use crate::heap::Heap;

/// A free block is a list node written into the block's own bytes; an
/// allocated block is opaque user memory.
#[repr(C)]
pub struct Block {
    pub next: *mut Block,
}

/// Fields only the owning thread reads or writes. No atomics.
pub(crate) struct OwnerHalf {
    /// Fast-path pool; `pop` serves allocations from here.
    pub free: Cell<*mut Block>,
    /// Deferred same-thread frees, folded into `free` on collect.
    pub local_free: Cell<*mut Block>,
    /// Blocks handed out, *including* blocks sitting un-collected in
    /// `thread_free` (their frees are accounted in `thread_freed`).
    pub used: Cell<u32>,
    /// Total blocks carved out of the page area.
    pub capacity: Cell<u32>,
    pub block_size: Cell<usize>,
    pub bin: Cell<u32>,
    /// Page sits in the heap's full queue.
    pub in_full: Cell<bool>,
    /// Page is claimed from its segment.
    pub in_use: Cell<bool>,
    /// Queue links (owned by the heap's page queues).
    pub prev: Cell<*mut Page>,
    pub next: Cell<*mut Page>,
    /// Owning heap; null while the segment is abandoned.
    pub heap: Cell<*mut Heap>,
}

/// Fields any thread may touch.
pub(crate) struct SharedHalf {
    /// Cross-thread free inbox (LIFO, CAS push).
    pub thread_free: AtomicPtr<Block>,
    /// Count of pushes onto `thread_free`, incremented after the push,
    /// decremented by the owner when it drains the inbox.
    pub thread_freed: AtomicU32,
}

#[repr(C)]
pub struct Page {
    pub(crate) own: OwnerHalf,
    pub(crate) shared: SharedHalf,
    /// Index of this descriptor in the segment's page table.
    pub(crate) segment_idx: Cell<u8>,
}

// SAFETY: cross-thread access is restricted by protocol to `shared` (and
// the read-only `segment_idx`); the owner half is confined to the segment's
// owning thread.
unsafe impl Sync for Page {}

static EMPTY_PAGE: Page = Page::empty();

impl Page {
    pub const fn empty() -> Page {
        Page {
            own: OwnerHalf {
                free: Cell::new(null_mut()),
                local_free: Cell::new(null_mut()),
                used: Cell::new(0),
                capacity: Cell::new(0),
                block_size: Cell::new(0),
                bin: Cell::new(0),
                in_full: Cell::new(false),
                in_use: Cell::new(false),
                prev: Cell::new(null_mut()),
                next: Cell::new(null_mut()),
                heap: Cell::new(null_mut()),
            },
            shared: SharedHalf {
                thread_free: AtomicPtr::new(null_mut()),
                thread_freed: AtomicU32::new(0),
            },
            segment_idx: Cell::new(0),
        }
    }

    /// The empty-page sentinel: its `free` list is permanently null, so a
    /// `pages_direct` slot pointing here forces every allocation into the
    /// generic routine.
    pub const EMPTY_PTR: *mut Page = &raw const EMPTY_PAGE as *mut Page;

    #[inline]
    pub fn block_size(&self) -> usize {
        self.own.block_size.get()
    }

    #[inline]
    pub fn bin(&self) -> usize {
        self.own.bin.get() as usize
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.own.capacity.get()
    }

    #[inline]
    pub fn used(&self) -> u32 {
        self.own.used.get()
    }

    #[inline]
    pub fn has_free(&self) -> bool {
        !self.own.free.get().is_null()
    }

    /// Live blocks net of not-yet-collected cross-thread frees. Read
    /// without a barrier: a stale answer only delays reclamation until the
    /// next generic pass.
    #[inline]
    pub fn is_all_free(&self) -> bool {
        self.own
            .used
            .get()
            .wrapping_sub(self.shared.thread_freed.load(Ordering::Relaxed))
            == 0
    }

    /// Carve the page area into `block_size` blocks and build the initial
    /// `free` list.
    ///
    /// # Safety
    ///
    /// `area` must point to `area_size` writable bytes reserved for this
    /// page, and the caller must own the page.
    pub unsafe fn init(&self, bin: usize, block_size: usize, area: *mut u8, area_size: usize) {
        debug_assert!(block_size >= size_of::<Block>());
        let capacity = (area_size / block_size) as u32;
        debug_assert!(capacity >= 1);

        self.own.bin.set(bin as u32);
        self.own.block_size.set(block_size);
        self.own.capacity.set(capacity);
        self.own.used.set(0);
        self.own.in_full.set(false);
        self.own.in_use.set(true);
        self.own.local_free.set(null_mut());
        self.shared.thread_free.store(null_mut(), Ordering::Relaxed);
        self.shared.thread_freed.store(0, Ordering::Relaxed);

        // Chain every block in address order; the last points nowhere.
        let mut head: *mut Block = null_mut();
        let mut i = capacity as usize;
        while i > 0 {
            i -= 1;
            // SAFETY: i * block_size + size_of::<Block> <= area_size.
            let block = unsafe { area.add(i * block_size) } as *mut Block;
            // SAFETY: block points into the owned page area.
            unsafe { (*block).next = head };
            head = block;
        }
        self.own.free.set(head);
    }

    /// Return the page to its never-used state (segment keeps the
    /// descriptor).
    pub fn reset(&self) {
        self.own.free.set(null_mut());
        self.own.local_free.set(null_mut());
        self.own.used.set(0);
        self.own.capacity.set(0);
        self.own.block_size.set(0);
        self.own.bin.set(0);
        self.own.in_full.set(false);
        self.own.in_use.set(false);
        self.own.prev.set(null_mut());
        self.own.next.set(null_mut());
        self.own.heap.set(null_mut());
        self.shared.thread_free.store(null_mut(), Ordering::Relaxed);
        self.shared.thread_freed.store(0, Ordering::Relaxed);
    }

    /// Fast-path pop. Owner thread only.
    #[inline]
    pub fn pop(&self) -> *mut Block {
        let block = self.own.free.get();
        if !block.is_null() {
            // SAFETY: blocks on `free` are valid nodes inside our page
            // area, and only the owner walks this list.
            self.own.free.set(unsafe { (*block).next });
            self.own.used.set(self.own.used.get() + 1);
        }
        block
    }

    /// Owner-thread free: defer onto `local_free`.
    ///
    /// # Safety
    ///
    /// `block` must be an allocated block of this page, freed exactly once,
    /// and the caller must be the owning thread.
    #[inline]
    pub unsafe fn push_local(&self, block: *mut Block) {
        // SAFETY: caller contract; the block becomes a list node now.
        unsafe { (*block).next = self.own.local_free.get() };
        self.own.local_free.set(block);
        self.own.used.set(self.own.used.get().wrapping_sub(1));
    }

    /// Cross-thread free: CAS-push onto the shared inbox, then bump the
    /// counter (in that order; the owner tolerates a momentarily larger
    /// list than counter).
    ///
    /// # Safety
    ///
    /// `block` must be an allocated block of this page, freed exactly once.
    pub unsafe fn push_thread_free(&self, block: *mut Block) {
        let mut head = self.shared.thread_free.load(Ordering::Relaxed);
        loop {
            // SAFETY: caller contract; the block is ours to link.
            unsafe { (*block).next = head };
            match self.shared.thread_free.compare_exchange_weak(
                head,
                block,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.shared.thread_freed.fetch_add(1, Ordering::Release);
    }

    /// Fold `local_free` and a swapped-out `thread_free` back into `free`.
    /// Owner thread only; this is the "collect" step of the generic
    /// routine.
    pub fn collect(&self) {
        let local = self.own.local_free.replace(null_mut());
        if !local.is_null() {
            // SAFETY: owner-only list of valid nodes.
            unsafe {
                let mut tail = local;
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = self.own.free.get();
            }
            self.own.free.set(local);
        }

        let captured = self.shared.thread_free.swap(null_mut(), Ordering::Acquire);
        if captured.is_null() {
            return;
        }
        // Walk for the length; cap at capacity so a corrupted (cyclic)
        // inbox cannot hang the allocator.
        let max = self.own.capacity.get();
        let mut count: u32 = 1;
        let mut tail = captured;
        // SAFETY: pushed nodes are valid blocks of this page; the walk is
        // bounded by `max`.
        unsafe {
            while !(*tail).next.is_null() {
                if count > max {
                    diag::report(AllocError::InvalidPointer {
                        ptr: captured as usize,
                    });
                    return; // drop the corrupted list
                }
                count += 1;
                tail = (*tail).next;
            }
            (*tail).next = self.own.free.get();
        }
        self.own.free.set(captured);
        self.own.used.set(self.own.used.get().wrapping_sub(count));
        self.shared.thread_freed.fetch_sub(count, Ordering::Relaxed);
    }
}

/// Length of a block list (diagnostics and tests).
pub(crate) fn list_len(mut block: *mut Block) -> usize {
    let mut n = 0;
    while !block.is_null() {
        n += 1;
        // SAFETY: callers pass well-formed lists.
        block = unsafe { (*block).next };
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake page area big enough for the tests.
    fn area(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    fn page_over(buf: &mut [u64], block_size: usize) -> Page {
        let page = Page::empty();
        let bytes = buf.len() * 8;
        // SAFETY: buf is writable and outlives the page in these tests.
        unsafe { page.init(1, block_size, buf.as_mut_ptr().cast(), bytes) };
        page
    }

    fn invariant_holds(page: &Page) -> bool {
        let free = list_len(page.own.free.get());
        let local = list_len(page.own.local_free.get());
        let thread = list_len(page.shared.thread_free.load(Ordering::Relaxed));
        let used = page.used() as usize;
        let freed = page.shared.thread_freed.load(Ordering::Relaxed) as usize;
        free + local + thread + used - freed == page.capacity() as usize
    }

    #[test]
    fn test_init_builds_full_free_list() {
        let mut buf = area(64);
        let page = page_over(&mut buf, 32);
        assert_eq!(page.capacity(), 16);
        assert_eq!(list_len(page.own.free.get()), 16);
        assert_eq!(page.used(), 0);
        assert!(invariant_holds(&page));
    }

    #[test]
    fn test_pop_hands_out_distinct_blocks() {
        let mut buf = area(64);
        let page = page_over(&mut buf, 64);
        let mut seen = Vec::new();
        loop {
            let b = page.pop();
            if b.is_null() {
                break;
            }
            assert!(!seen.contains(&(b as usize)));
            seen.push(b as usize);
        }
        assert_eq!(seen.len() as u32, page.capacity());
        assert_eq!(page.used(), page.capacity());
        assert!(!page.has_free());
    }

    #[test]
    fn test_local_free_defers_reuse() {
        let mut buf = area(32);
        let page = page_over(&mut buf, 64);
        let a = page.pop();
        assert!(!a.is_null());
        // SAFETY: a was just popped from this page.
        unsafe { page.push_local(a) };
        // The fast path must not see the block until a collect.
        let b = page.pop();
        assert_ne!(a, b, "freed block must not be immediately reused");
        assert!(invariant_holds(&page));
        page.collect();
        // Now the freed block is back in the pool.
        let mut found = false;
        loop {
            let c = page.pop();
            if c.is_null() {
                break;
            }
            if c == a {
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_used_counts_outstanding_blocks() {
        let mut buf = area(64);
        let page = page_over(&mut buf, 32);
        let x = page.pop();
        let y = page.pop();
        assert_eq!(page.used(), 2);
        // SAFETY: both were popped from this page.
        unsafe {
            page.push_local(x);
            page.push_local(y);
        }
        assert_eq!(page.used(), 0);
        assert!(page.is_all_free());
        assert!(invariant_holds(&page));
    }

    #[test]
    fn test_cross_thread_free_lands_in_inbox() {
        let mut buf = area(128);
        let page = page_over(&mut buf, 32);
        let blocks: Vec<usize> = (0..8).map(|_| page.pop() as usize).collect();
        std::thread::scope(|scope| {
            let page = &page;
            for chunk in blocks.chunks(2) {
                let chunk = chunk.to_vec();
                scope.spawn(move || {
                    for b in chunk {
                        // SAFETY: each block is freed exactly once.
                        unsafe { page.push_thread_free(b as *mut Block) };
                    }
                });
            }
        });
        assert_eq!(
            page.shared.thread_freed.load(Ordering::Relaxed),
            8,
            "every cross-thread free must be counted"
        );
        assert_eq!(
            list_len(page.shared.thread_free.load(Ordering::Relaxed)),
            8
        );
        assert!(page.used() >= 8); // not yet collected
        page.collect();
        assert_eq!(page.used(), 0);
        assert_eq!(page.shared.thread_freed.load(Ordering::Relaxed), 0);
        assert!(page.is_all_free());
        assert!(invariant_holds(&page));
    }

    #[test]
    fn test_collect_preserves_block_population() {
        let mut buf = area(256);
        let page = page_over(&mut buf, 64);
        let cap = page.capacity() as usize;
        let mut held = Vec::new();
        for _ in 0..cap {
            held.push(page.pop());
        }
        // Free one third locally, one third remotely, keep the rest.
        let third = cap / 3;
        for &b in &held[..third] {
            // SAFETY: freed exactly once.
            unsafe { page.push_local(b) };
        }
        for &b in &held[third..2 * third] {
            // SAFETY: freed exactly once.
            unsafe { page.push_thread_free(b) };
        }
        page.collect();
        assert_eq!(list_len(page.own.free.get()), 2 * third);
        assert_eq!(page.used() as usize, cap - 2 * third);
        assert!(invariant_holds(&page));
    }

    #[test]
    fn test_empty_sentinel_never_serves() {
        // SAFETY: the sentinel is a valid static Page.
        let sentinel = unsafe { &*Page::EMPTY_PTR };
        assert!(sentinel.pop().is_null());
        assert!(!sentinel.has_free());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut buf = area(32);
        let page = page_over(&mut buf, 32);
        page.pop();
        page.reset();
        assert_eq!(page.capacity(), 0);
        assert_eq!(page.used(), 0);
        assert!(!page.own.in_use.get());
        assert!(page.own.free.get().is_null());
    }
}
