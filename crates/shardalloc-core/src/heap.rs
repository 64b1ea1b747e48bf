//! Per-thread heaps and the allocation paths.
//!
//! Each thread owns a heap holding, per size class, a queue of pages with
//! free capacity plus one shared `full` queue, and a `pages_direct` table
//! that maps every 8-byte-granular small size straight to its current
//! page. The malloc fast path is: index `pages_direct`, pop the page's
//! `free` list -- no atomics, no locks, one branch. Whenever a page cannot
//! serve (or any housekeeping is due), the slot points at the empty-page
//! sentinel, which funnels the call into [`Heap::malloc_generic`].
//!
//! The generic routine amortizes all maintenance: the deferred-free
//! callback, the thread-delayed-free drain, a bounded sweep of the full
//! queue, the expired-arena purge, page collection and retirement, and --
//! when a queue runs dry -- reclamation of abandoned segments before a
//! fresh segment is carved from an arena.
//!
//! Thread exit abandons every segment that still holds live blocks; the
//! heap itself lives in TLS and is reset for the thread that comes next.

use std::cell::{Cell, UnsafeCell};
use std::ffi::c_void;
use std::ptr::{self, null_mut};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::arena::{self, AbandonedCursor};
use crate::diag::{self, AllocError};
use crate::options::{self, ShardOption};
use crate::os;
use crate::page::{Block, Page};
use crate::rng::Rng;
use crate::segment::{self, Segment};
use crate::size_class::{
    align_up, bin_index, bin_size, direct_index, PageKind, BIN_FULL, BIN_HUGE, MEDIUM_OBJ_MAX,
    PAGES_DIRECT_COUNT, QUEUE_COUNT, SEGMENT_MASK, SMALL_OBJ_MAX, WORD_SIZE,
};

/// Largest bin served from small pages (and thus from `pages_direct`).
const BIN_SMALL_MAX: usize = bin_index(SMALL_OBJ_MAX);

/// Pages of the full queue revisited per generic pass.
const FULL_SWEEP_BUDGET: usize = 8;

/// Abandoned segments adopted per generic pass.
const RECLAIM_BUDGET: usize = 4;

// ---------------------------------------------------------------------------
// Thread ids
// ---------------------------------------------------------------------------

/// Dense nonzero thread ids; 0 is reserved for "abandoned".
fn next_thread_id() -> usize {
    static COUNTER: AtomicUsize = AtomicUsize::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Page queues
// ---------------------------------------------------------------------------

/// Doubly-linked intrusive queue of pages (links live in the pages).
pub(crate) struct PageQueue {
    first: Cell<*mut Page>,
    last: Cell<*mut Page>,
}

impl PageQueue {
    const fn new() -> PageQueue {
        PageQueue {
            first: Cell::new(null_mut()),
            last: Cell::new(null_mut()),
        }
    }

    #[inline]
    fn first(&self) -> *mut Page {
        self.first.get()
    }

    #[inline]
    fn only_entry(&self, page: *mut Page) -> bool {
        self.first.get() == page && self.last.get() == page
    }

    fn push_front(&self, page: &Page) {
        let page_ptr = page as *const Page as *mut Page;
        page.own.prev.set(null_mut());
        page.own.next.set(self.first.get());
        let old_first = self.first.get();
        if old_first.is_null() {
            self.last.set(page_ptr);
        } else {
            // SAFETY: queue members are live pages of segments this heap
            // owns.
            unsafe { (*old_first).own.prev.set(page_ptr) };
        }
        self.first.set(page_ptr);
    }

    fn remove(&self, page: &Page) {
        let page_ptr = page as *const Page as *mut Page;
        let prev = page.own.prev.get();
        let next = page.own.next.get();
        if prev.is_null() {
            debug_assert_eq!(self.first.get(), page_ptr);
            self.first.set(next);
        } else {
            // SAFETY: as in push_front.
            unsafe { (*prev).own.next.set(next) };
        }
        if next.is_null() {
            debug_assert_eq!(self.last.get(), page_ptr);
            self.last.set(prev);
        } else {
            // SAFETY: as in push_front.
            unsafe { (*next).own.prev.set(prev) };
        }
        page.own.prev.set(null_mut());
        page.own.next.set(null_mut());
    }
}

// ---------------------------------------------------------------------------
// The heap
// ---------------------------------------------------------------------------

pub struct Heap {
    /// Small-size fast table: one slot per 8-byte step, pointing at the
    /// page currently serving that size (or the empty sentinel).
    pages_direct: [Cell<*mut Page>; PAGES_DIRECT_COUNT],
    /// Per-bin page queues, plus the huge anchor and the full queue.
    queues: [PageQueue; QUEUE_COUNT],
    /// Owned small/medium segments with at least one free page slot.
    small_segments: Cell<*mut Segment>,
    medium_segments: Cell<*mut Segment>,
    /// Owner-batched frees drained by the generic routine.
    delayed_free: Cell<*mut Block>,
    thread_id: Cell<usize>,
    rng: Rng,
    /// Generic-routine invocations, passed to the deferred-free callback.
    heartbeat: Cell<u64>,
    /// Recursion guard for the deferred-free callback.
    in_callback: Cell<bool>,
    initialized: Cell<bool>,
}

impl Heap {
    pub const fn new() -> Heap {
        Heap {
            pages_direct: [const { Cell::new(Page::EMPTY_PTR) }; PAGES_DIRECT_COUNT],
            queues: [const { PageQueue::new() }; QUEUE_COUNT],
            small_segments: Cell::new(null_mut()),
            medium_segments: Cell::new(null_mut()),
            delayed_free: Cell::new(null_mut()),
            thread_id: Cell::new(0),
            rng: Rng::zeroed(),
            heartbeat: Cell::new(0),
            in_callback: Cell::new(false),
            initialized: Cell::new(false),
        }
    }

    fn init(&self) {
        let tid = next_thread_id();
        self.thread_id.set(tid);
        let mut seed = [0u8; 8];
        os::random_buf(&mut seed);
        self.rng.seed(u64::from_le_bytes(seed) ^ tid as u64);
        self.initialized.set(true);
        process_init();
    }

    #[inline]
    pub fn thread_id(&self) -> usize {
        self.thread_id.get()
    }

    // -- fast path ----------------------------------------------------------

    /// Allocate a small block (`size <= SMALL_OBJ_MAX`).
    #[inline]
    fn malloc_small(&self, size: usize) -> *mut u8 {
        debug_assert!(size <= SMALL_OBJ_MAX);
        // SAFETY: slots always hold a live page or the static sentinel.
        let page = unsafe { &*self.pages_direct[direct_index(size)].get() };
        let block = page.pop();
        if !block.is_null() {
            return block.cast();
        }
        self.malloc_generic(size)
    }

    // -- generic (slow) path -------------------------------------------------

    /// The generic allocation routine: all deferred housekeeping, then a
    /// page with free blocks for `size`, then the actual block.
    fn malloc_generic(&self, size: usize) -> *mut u8 {
        self.call_deferred(false);
        self.drain_delayed_free();
        self.sweep_full_queue(FULL_SWEEP_BUDGET);
        arena::try_purge_all(false);
        self.heartbeat.set(self.heartbeat.get() + 1);

        if size > MEDIUM_OBJ_MAX {
            return self.alloc_big(size);
        }

        let bin = bin_index(size);
        let Some(page) = self.find_free_page(bin) else {
            diag::report(AllocError::OutOfMemory { size });
            return null_mut();
        };
        debug_assert!(page.has_free());
        page.pop().cast()
    }

    /// Walk the bin queue collecting deferred frees; retire pages that
    /// came up empty, park exhausted pages in the full queue, and fall
    /// back to reclaiming abandoned segments or carving a fresh page.
    fn find_free_page(&self, bin: usize) -> Option<&Page> {
        let queue = &self.queues[bin];
        let mut cursor = queue.first();
        while !cursor.is_null() {
            // SAFETY: queue members are live owned pages.
            let page = unsafe { &*cursor };
            let next = page.own.next.get();
            page.collect();
            if page.used() == 0 && !queue.only_entry(cursor) {
                // Fully free and not the hot page: give it back.
                queue.remove(page);
                self.free_page_to_segment(page);
            } else if page.has_free() {
                self.update_direct_for_bin(bin);
                return Some(page);
            } else {
                // Exhausted: park it so long-lived full pages stop being
                // revisited on every miss.
                queue.remove(page);
                page.own.in_full.set(true);
                self.queues[BIN_FULL].push_front(page);
            }
            cursor = next;
        }

        // Nothing served. Adopt abandoned segments first: another thread's
        // exit may have left pages of exactly this class behind.
        if arena::abandoned_count() > 0 && self.reclaim_abandoned() {
            let first = queue.first();
            if !first.is_null() {
                // SAFETY: just linked by adopt_segment.
                let page = unsafe { &*first };
                page.collect();
                if page.has_free() {
                    self.update_direct_for_bin(bin);
                    return Some(page);
                }
            }
        }

        let Some(page) = self.fresh_page(bin) else {
            // Pages may have been retired above; the direct table must not
            // keep pointing into them.
            self.update_direct_for_bin(bin);
            return None;
        };
        self.update_direct_for_bin(bin);
        Some(page)
    }

    /// Claim a page from an owned segment with spare capacity, allocating
    /// a new segment when none has room.
    fn fresh_page(&self, bin: usize) -> Option<&Page> {
        let kind = if bin <= BIN_SMALL_MAX {
            PageKind::Small
        } else {
            PageKind::Medium
        };
        let list = self.segment_list(kind);
        let mut seg_ptr = list.get();
        while !seg_ptr.is_null() {
            // SAFETY: list members are live owned segments.
            let seg = unsafe { &*seg_ptr };
            if seg.has_free_slot() {
                break;
            }
            seg_ptr = seg.next.get();
        }
        if seg_ptr.is_null() {
            seg_ptr = Segment::alloc(kind, 0, self.thread_id.get())?.as_ptr();
            self.segment_list_push(kind, seg_ptr);
        }
        // SAFETY: found or freshly allocated, owned by us.
        let seg = unsafe { &*seg_ptr };
        let page = seg.claim_page(bin, bin_size(bin))?;
        if !seg.has_free_slot() {
            self.segment_list_remove(kind, seg_ptr);
        }
        page.own
            .heap
            .set(self as *const Heap as *mut Heap);
        self.queues[bin].push_front(page);
        Some(page)
    }

    /// Large and huge blocks: one page filling its own segment.
    fn alloc_big(&self, size: usize) -> *mut u8 {
        let kind = PageKind::of_size(size);
        debug_assert!(matches!(kind, PageKind::Large | PageKind::Huge));
        let Some(seg) = Segment::alloc(kind, size, self.thread_id.get()) else {
            diag::report(AllocError::OutOfMemory { size });
            return null_mut();
        };
        // SAFETY: freshly allocated, owned by us.
        let seg = unsafe { &*seg.as_ptr() };
        let Some(page) = seg.claim_page(BIN_HUGE, 0) else {
            // A fresh segment always has its single slot free.
            debug_assert!(false);
            return null_mut();
        };
        page.own
            .heap
            .set(self as *const Heap as *mut Heap);
        self.queues[BIN_HUGE].push_front(page);
        page.pop().cast()
    }

    // -- housekeeping --------------------------------------------------------

    /// Revisit a bounded slice of the full queue: pages whose blocks were
    /// freed (locally or cross-thread) move back to their bin queue or all
    /// the way back to their segment.
    fn sweep_full_queue(&self, mut budget: usize) {
        let queue = &self.queues[BIN_FULL];
        let mut cursor = queue.first();
        while !cursor.is_null() && budget > 0 {
            // SAFETY: queue members are live owned pages.
            let page = unsafe { &*cursor };
            let next = page.own.next.get();
            page.collect();
            if page.used() == 0 {
                queue.remove(page);
                page.own.in_full.set(false);
                self.free_page_to_segment(page);
            } else if page.has_free() {
                let bin = page.bin();
                queue.remove(page);
                page.own.in_full.set(false);
                self.queues[bin].push_front(page);
                self.update_direct_for_bin(bin);
            }
            cursor = next;
            budget -= 1;
        }
    }

    /// Drain the owner-batched delayed-free list, routing each block to
    /// its page through the regular owner free path.
    fn drain_delayed_free(&self) {
        let mut block = self.delayed_free.replace(null_mut());
        while !block.is_null() {
            // SAFETY: delayed blocks are valid owner-freed blocks.
            let next = unsafe { (*block).next };
            self.free_owned_block(block.cast());
            block = next;
        }
    }

    /// Point every `pages_direct` slot of `bin` at the queue's first page
    /// (or the sentinel when the queue is empty).
    fn update_direct_for_bin(&self, bin: usize) {
        if bin > BIN_SMALL_MAX {
            return;
        }
        let first = self.queues[bin].first();
        let target = if first.is_null() {
            Page::EMPTY_PTR
        } else {
            first
        };
        let lo = if bin == 1 {
            0
        } else {
            bin_size(bin - 1) / WORD_SIZE + 1
        };
        let hi = bin_size(bin) / WORD_SIZE;
        for slot in lo..=hi {
            self.pages_direct[slot].set(target);
        }
    }

    /// Return a (collected, empty) page to its segment; free the segment
    /// when its last page goes.
    fn free_page_to_segment(&self, page: &Page) {
        debug_assert_eq!(page.used(), 0);
        let seg = segment_of_page(page);
        // SAFETY: the segment header of a page we own is live.
        let seg = unsafe { &*seg };
        let kind = seg.kind();
        page.own.heap.set(null_mut());
        let was_full = !seg.has_free_slot();
        let now_empty = seg.release_page(page);
        match kind {
            PageKind::Small | PageKind::Medium => {
                if now_empty {
                    self.segment_list_remove(kind, seg as *const Segment as *mut Segment);
                    // SAFETY: no page of the segment is in use anymore.
                    unsafe { Segment::free(seg as *const Segment as *mut Segment) };
                } else if was_full && !seg.in_heap_list.get() {
                    self.segment_list_push(kind, seg as *const Segment as *mut Segment);
                }
            }
            PageKind::Large | PageKind::Huge => {
                debug_assert!(now_empty);
                // SAFETY: single-page segment, now empty.
                unsafe { Segment::free(seg as *const Segment as *mut Segment) };
            }
        }
    }

    // -- segment lists -------------------------------------------------------

    fn segment_list(&self, kind: PageKind) -> &Cell<*mut Segment> {
        match kind {
            PageKind::Small => &self.small_segments,
            PageKind::Medium => &self.medium_segments,
            PageKind::Large | PageKind::Huge => unreachable!("single-page segments are not listed"),
        }
    }

    fn segment_list_push(&self, kind: PageKind, seg: *mut Segment) {
        let list = self.segment_list(kind);
        // SAFETY: seg is a live owned segment; list links are owner-only.
        unsafe {
            (*seg).prev.set(null_mut());
            (*seg).next.set(list.get());
            if !list.get().is_null() {
                (*list.get()).prev.set(seg);
            }
            (*seg).in_heap_list.set(true);
        }
        list.set(seg);
    }

    fn segment_list_remove(&self, kind: PageKind, seg: *mut Segment) {
        let list = self.segment_list(kind);
        // SAFETY: as in push.
        unsafe {
            if !(*seg).in_heap_list.get() {
                return;
            }
            let prev = (*seg).prev.get();
            let next = (*seg).next.get();
            if prev.is_null() {
                list.set(next);
            } else {
                (*prev).next.set(next);
            }
            if !next.is_null() {
                (*next).prev.set(prev);
            }
            (*seg).prev.set(null_mut());
            (*seg).next.set(null_mut());
            (*seg).in_heap_list.set(false);
        }
    }

    // -- abandoned reclamation ----------------------------------------------

    /// Adopt up to [`RECLAIM_BUDGET`] abandoned segments into this heap.
    fn reclaim_abandoned(&self) -> bool {
        let tid = self.thread_id.get();
        let mut adopted = 0;
        let mut cursor = AbandonedCursor::new(&self.rng);
        while adopted < RECLAIM_BUDGET {
            let seg = match cursor.next() {
                Some(seg) => {
                    // SAFETY: the cursor's cleared bit is our exclusive
                    // claim; adoption cannot be contested.
                    let seg_ref = unsafe { &*seg.as_ptr() };
                    let ok = seg_ref.try_adopt(tid);
                    debug_assert!(ok);
                    seg.as_ptr()
                }
                None => match segment::os_registry_try_claim(tid) {
                    Some(seg) => seg.as_ptr(),
                    None => break,
                },
            };
            // SAFETY: adopted above.
            self.adopt_segment(unsafe { &*seg });
            adopted += 1;
        }
        adopted > 0
    }

    /// Fold an adopted segment's pages into this heap's queues.
    fn adopt_segment(&self, seg: &Segment) {
        debug_assert_eq!(seg.owner(), self.thread_id.get());
        seg.abandoned.set(0);
        let heap_ptr = self as *const Heap as *mut Heap;
        for idx in seg.first_slot()..seg.page_count() {
            let page = seg.page(idx);
            if !page.own.in_use.get() {
                continue;
            }
            page.own.heap.set(heap_ptr);
            page.own.in_full.set(false);
            page.collect();
            if page.used() == 0 {
                page.own.heap.set(null_mut());
                seg.release_page(page);
            } else {
                let bin = page.bin();
                self.queues[bin].push_front(page);
                self.update_direct_for_bin(bin);
            }
        }
        if seg.used.get() == 0 {
            // SAFETY: every page was released above.
            unsafe { Segment::free(seg as *const Segment as *mut Segment) };
            return;
        }
        if matches!(seg.kind(), PageKind::Small | PageKind::Medium) && seg.has_free_slot() {
            self.segment_list_push(seg.kind(), seg as *const Segment as *mut Segment);
        }
    }

    // -- free paths ----------------------------------------------------------

    /// Owner-thread free of a block known to belong to `page`.
    fn free_owned_block(&self, block: *mut Block) {
        let seg = ((block as usize) & !SEGMENT_MASK) as *mut Segment;
        // SAFETY: owner path; the segment header is ours and live.
        let seg = unsafe { &*seg };
        let page = seg.page_of(block.cast());
        // SAFETY: the block was allocated from this page and is freed
        // exactly once (caller contract of `free`).
        unsafe { page.push_local(block) };
        if page.is_all_free() {
            self.retire_page_if_idle(page);
        }
    }

    /// A page observed all-free by the owner free path: give it back to
    /// its segment unless it is the queue's only (hot) page.
    fn retire_page_if_idle(&self, page: &Page) {
        let page_ptr = page as *const Page as *mut Page;
        if page.own.in_full.get() {
            page.collect();
            if page.used() == 0 {
                self.queues[BIN_FULL].remove(page);
                page.own.in_full.set(false);
                self.free_page_to_segment(page);
            }
            return;
        }
        let bin = page.bin();
        let queue = &self.queues[bin];
        // Small/medium pages stay around while they are the queue's only
        // (hot) page; single-page segments always go back promptly.
        if bin != BIN_HUGE && queue.only_entry(page_ptr) {
            return;
        }
        page.collect();
        if page.used() == 0 {
            queue.remove(page);
            self.update_direct_for_bin(bin);
            self.free_page_to_segment(page);
        }
    }

    /// Owner-batched deferred free (realloc and teardown paths): the block
    /// is parked on the heap's delayed list and actually freed by the next
    /// generic pass.
    fn free_delayed(&self, block: *mut Block) {
        // SAFETY: the block is ours (owner path) and freed exactly once;
        // parking it only writes its own bytes.
        unsafe { (*block).next = self.delayed_free.get() };
        self.delayed_free.set(block);
    }

    // -- deferred-free callback ----------------------------------------------

    fn call_deferred(&self, force: bool) {
        if self.in_callback.get() {
            return;
        }
        let raw = DEFERRED_FREE_FN.load(Ordering::Acquire);
        if raw == 0 {
            return;
        }
        // SAFETY: the only writer stores a valid callback (or 0).
        let hook: DeferredFreeFn = unsafe { std::mem::transmute(raw) };
        let arg = DEFERRED_FREE_ARG.load(Ordering::Acquire);
        self.in_callback.set(true);
        hook(force, self.heartbeat.get(), arg);
        self.in_callback.set(false);
    }

    // -- teardown ------------------------------------------------------------

    /// Thread exit: drain what can be drained, return empty pages, abandon
    /// every segment that still holds live blocks, and reset the heap for
    /// reuse by a future thread in this slot.
    fn teardown(&self) {
        if !self.initialized.get() {
            return;
        }
        self.call_deferred(true);
        self.drain_delayed_free();

        // Pass 1: collect everything and return empty pages.
        for bin in 1..QUEUE_COUNT {
            let queue = &self.queues[bin];
            let mut cursor = queue.first();
            while !cursor.is_null() {
                // SAFETY: queue members are live owned pages.
                let page = unsafe { &*cursor };
                let next = page.own.next.get();
                page.collect();
                if page.used() == 0 {
                    queue.remove(page);
                    page.own.in_full.set(false);
                    self.free_page_to_segment(page);
                }
                cursor = next;
            }
        }

        // Pass 2: everything still queued has live blocks; abandon its
        // segment (once -- the first page marks it, later pages see the
        // owner already cleared).
        let tid = self.thread_id.get();
        for bin in 1..QUEUE_COUNT {
            let queue = &self.queues[bin];
            let mut cursor = queue.first();
            while !cursor.is_null() {
                // SAFETY: as above.
                let page = unsafe { &*cursor };
                let next = page.own.next.get();
                queue.remove(page);
                page.own.heap.set(null_mut());
                let seg = segment_of_page(page);
                // SAFETY: the segment header is live.
                unsafe {
                    if (*seg).owner() == tid {
                        (*seg).mark_abandoned();
                    }
                }
                cursor = next;
            }
        }

        for slot in self.pages_direct.iter() {
            slot.set(Page::EMPTY_PTR);
        }
        self.small_segments.set(null_mut());
        self.medium_segments.set(null_mut());
        self.thread_id.set(0);
        self.heartbeat.set(0);
        self.initialized.set(false);
    }

    /// Collect this heap: drain deferred work and give back every page
    /// that is no longer in use.
    fn collect(&self, force: bool) {
        self.call_deferred(force);
        self.drain_delayed_free();
        self.sweep_full_queue(if force { usize::MAX } else { FULL_SWEEP_BUDGET });
        for bin in 1..QUEUE_COUNT {
            let queue = &self.queues[bin];
            let mut cursor = queue.first();
            while !cursor.is_null() {
                // SAFETY: queue members are live owned pages.
                let page = unsafe { &*cursor };
                let next = page.own.next.get();
                page.collect();
                if page.used() == 0 && (force || !queue.only_entry(cursor)) {
                    queue.remove(page);
                    page.own.in_full.set(false);
                    self.free_page_to_segment(page);
                    if bin <= BIN_SMALL_MAX {
                        self.update_direct_for_bin(bin);
                    }
                }
                cursor = next;
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

// ---------------------------------------------------------------------------
// TLS plumbing
// ---------------------------------------------------------------------------

struct HeapHandle(UnsafeCell<Heap>);

impl Drop for HeapHandle {
    fn drop(&mut self) {
        // SAFETY: TLS destruction is single-threaded for this thread.
        unsafe { (*self.0.get()).teardown() };
    }
}

thread_local! {
    static HEAP: HeapHandle = const { HeapHandle(UnsafeCell::new(Heap::new())) };
}

/// Run `f` against this thread's heap, initializing it on first use.
/// Returns `None` when the TLS slot is already destroyed (late in thread
/// exit).
fn try_with_heap<R>(f: impl FnOnce(&Heap) -> R) -> Option<R> {
    HEAP.try_with(|handle| {
        // SAFETY: the heap is only referenced from its own thread; the
        // shared-half protocol covers everything cross-thread.
        let heap = unsafe { &*handle.0.get() };
        if !heap.initialized.get() {
            heap.init();
        }
        f(heap)
    })
    .ok()
}

/// One-time process setup: optional huge-page reservation.
fn process_init() {
    static DONE: AtomicBool = AtomicBool::new(false);
    if DONE.swap(true, Ordering::AcqRel) {
        return;
    }
    let pages = options::get(ShardOption::ReserveHugeOsPages);
    if pages > 0 {
        let pages = pages as usize;
        arena::reserve_huge_os_pages_interleave(pages, 0, pages * 500);
    }
}

// ---------------------------------------------------------------------------
// Deferred-free callback registry
// ---------------------------------------------------------------------------

/// Called from the generic routine; gets `force`, a heartbeat counter, and
/// the registered argument. Must not call back into the allocator (a
/// recursion guard drops nested invocations).
pub type DeferredFreeFn = extern "C" fn(force: bool, heartbeat: u64, arg: *mut c_void);

static DEFERRED_FREE_FN: AtomicUsize = AtomicUsize::new(0);
static DEFERRED_FREE_ARG: AtomicPtr<c_void> = AtomicPtr::new(null_mut());

pub fn register_deferred_free(hook: Option<DeferredFreeFn>, arg: *mut c_void) {
    DEFERRED_FREE_ARG.store(arg, Ordering::Release);
    DEFERRED_FREE_FN.store(hook.map_or(0, |f| f as usize), Ordering::Release);
}

// ---------------------------------------------------------------------------
// Public allocation surface
// ---------------------------------------------------------------------------

/// Allocate `size` bytes (a unique pointer even for `size == 0`). Returns
/// null on exhaustion.
pub fn malloc(size: usize) -> *mut u8 {
    if size <= SMALL_OBJ_MAX {
        try_with_heap(|heap| heap.malloc_small(size)).unwrap_or(null_mut())
    } else {
        try_with_heap(|heap| heap.malloc_generic(size)).unwrap_or(null_mut())
    }
}

/// Allocate zeroed memory.
pub fn zalloc(size: usize) -> *mut u8 {
    let p = malloc(size);
    if !p.is_null() {
        // SAFETY: a successful malloc covers at least `size` writable
        // bytes.
        unsafe { ptr::write_bytes(p, 0, size) };
    }
    p
}

/// Largest supported explicit alignment. Aligned pointers must stay
/// inside the first segment-aligned chunk of their segment or the mask
/// recovery on `free` would land past the header.
pub const MAX_ALIGN: usize = crate::size_class::SEGMENT_SIZE / 2;

/// Allocate with an explicit power-of-two alignment (up to [`MAX_ALIGN`]).
/// Alignments up to the word size are free; larger ones over-allocate and
/// return an aligned interior pointer (`free` recovers the owning block by
/// offset math).
pub fn malloc_aligned(size: usize, align: usize) -> *mut u8 {
    if align == 0 || !align.is_power_of_two() || align > MAX_ALIGN {
        diag::report(AllocError::BadAlignment { align });
        return null_mut();
    }
    if align <= WORD_SIZE {
        return malloc(size);
    }
    let Some(padded) = size.checked_add(align - 1) else {
        diag::report(AllocError::OutOfMemory { size });
        return null_mut();
    };
    let p = malloc(padded.max(1));
    if p.is_null() {
        return null_mut();
    }
    align_up(p as usize, align) as *mut u8
}

/// Free a pointer from `malloc`/`zalloc`/`malloc_aligned`/`realloc`.
/// `free(null)` is a no-op; unknown pointers are reported and dropped.
///
/// # Safety
///
/// `ptr` must be null or a pointer obtained from this allocator that has
/// not been freed since.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let Some(seg) = Segment::of_ptr(ptr) else {
        diag::report(AllocError::InvalidPointer { ptr: ptr as usize });
        return;
    };
    // SAFETY: of_ptr only returns live segments of ours.
    let seg = unsafe { &*seg.as_ptr() };
    let page = seg.page_of(ptr);
    let block = block_start_of(seg, page, ptr);

    let tid = try_with_heap(|heap| heap.thread_id()).unwrap_or(0);
    if tid != 0 && seg.owner() == tid {
        let _ = try_with_heap(|heap| heap.free_owned_block(block));
        return;
    }

    // Cross-thread (or ownerless) free: the shared inbox.
    // SAFETY: caller contract (valid block, freed once).
    unsafe { page.push_thread_free(block) };

    if seg.is_abandoned()
        && tid != 0
        && options::is_enabled(ShardOption::AbandonedReclaimOnFree)
    {
        // Freeing into an abandoned segment: adopt it so its memory flows
        // back into circulation instead of waiting for a cursor scan.
        let _ = try_with_heap(|heap| {
            if seg.try_reclaim_abandoned(heap.thread_id()) {
                heap.adopt_segment(seg);
            }
        });
    }
}

/// Usable bytes of an allocation (>= the requested size).
pub fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let Some(seg) = Segment::of_ptr(ptr) else {
        return 0;
    };
    // SAFETY: of_ptr only returns live segments of ours.
    let seg = unsafe { &*seg.as_ptr() };
    let page = seg.page_of(ptr);
    let block = block_start_of(seg, page, ptr) as usize;
    page.block_size() - (ptr as usize - block)
}

/// Resize an allocation, preserving contents up to the smaller size.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator; after a
/// non-null return the old pointer is invalid (unless returned unchanged).
pub unsafe fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return malloc(new_size);
    }
    if new_size == 0 {
        // Contract: a minimum-size allocation, never null on success.
        let fresh = malloc(1);
        // SAFETY: caller contract.
        unsafe { free(ptr) };
        return fresh;
    }
    let old_usable = usable_size(ptr);
    if old_usable == 0 {
        // Unknown pointer: report and serve a fresh allocation.
        diag::report(AllocError::InvalidPointer { ptr: ptr as usize });
        return malloc(new_size);
    }
    // Same size class: keep the block.
    if new_size <= old_usable && bin_index(new_size) == bin_index(old_usable) {
        return ptr;
    }
    let fresh = malloc(new_size);
    if fresh.is_null() {
        return null_mut();
    }
    // SAFETY: both regions are live and at least `copy` bytes long.
    unsafe {
        ptr::copy_nonoverlapping(ptr, fresh, old_usable.min(new_size));
    }
    // Batch the old block onto the delayed list when we own it; a direct
    // free otherwise.
    let freed_delayed = try_with_heap(|heap| {
        let seg = ((ptr as usize) & !SEGMENT_MASK) as *mut Segment;
        // SAFETY: usable_size succeeded, so ptr is ours and the header is
        // live.
        let seg = unsafe { &*seg };
        if seg.owner() == heap.thread_id() && matches!(seg.kind(), PageKind::Small | PageKind::Medium) {
            let page = seg.page_of(ptr);
            heap.free_delayed(block_start_of(seg, page, ptr));
            true
        } else {
            false
        }
    })
    .unwrap_or(false);
    if !freed_delayed {
        // SAFETY: caller contract.
        unsafe { free(ptr) };
    }
    fresh
}

/// Drain deferred work and release unused memory; `force` also purges
/// arenas regardless of deadlines.
pub fn collect(force: bool) {
    let _ = try_with_heap(|heap| heap.collect(force));
    arena::try_purge_all(force);
}

/// The current thread's heartbeat (generic-routine invocations), exposed
/// for diagnostics.
pub fn heartbeat() -> u64 {
    try_with_heap(|heap| heap.heartbeat.get()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Segment of a page descriptor (the descriptor lives inside the header).
fn segment_of_page(page: &Page) -> *mut Segment {
    ((page as *const Page as usize) & !SEGMENT_MASK) as *mut Segment
}

/// Normalize an interior pointer to its block start (aligned allocations
/// return interior pointers; blocks sit at block-size multiples from the
/// page area start).
fn block_start_of(seg: &Segment, page: &Page, ptr: *mut u8) -> *mut Block {
    let (area, _) = seg.page_area(page.segment_idx.get() as usize);
    match seg.kind() {
        PageKind::Small | PageKind::Medium => {
            let offset = ptr as usize - area as usize;
            let bsize = page.block_size();
            (area as usize + (offset / bsize) * bsize) as *mut Block
        }
        PageKind::Large | PageKind::Huge => area as *mut Block,
    }
}
