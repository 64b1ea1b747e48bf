//! Segments: the chunk between arenas and pages.
//!
//! A segment is one segment-aligned region holding a header plus an array
//! of page descriptors. Because the header sits at an address aligned to
//! the segment size, any interior pointer recovers its segment with a mask
//! and its page with a shift -- the O(1) reverse lookup `free` relies on.
//!
//! Small and medium segments are a fixed 4 MiB and reserve their first
//! page slot for the header and guard padding. Large and huge segments
//! hold a single page whose data area starts just past the header (huge
//! segments are sized to the request but stay segment-aligned, so masking
//! still works for every pointer the allocator hands out: user blocks
//! start within the first aligned chunk).
//!
//! A segment is owned by one thread at a time (`thread_id`); on thread
//! exit it is abandoned (`thread_id == 0`) and becomes claimable through
//! the arena's abandoned bitmap, or through a registry for segments that
//! bypassed the arenas.

use std::cell::Cell;
use std::ptr::{self, null_mut, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::arena;
use crate::os::{self, MemId, MemKind};
use crate::page::Page;
use crate::size_class::{
    align_up, PageKind, SEGMENT_MASK, SEGMENT_SIZE, SMALL_PAGES_PER_SEGMENT,
};

/// Address-derived header tag, checked before trusting a masked pointer.
#[inline]
fn cookie_of(seg: *const Segment) -> usize {
    (seg as usize) ^ 0xb10c_a110_c8ed_c0de
}

#[repr(C)]
pub struct Segment {
    cookie: usize,
    /// Owning thread, 0 when abandoned. Written with release on abandon
    /// and claimed with a strong CAS on adoption.
    pub(crate) thread_id: AtomicUsize,
    pub(crate) memid: MemId,
    /// Total bytes, a multiple of `SEGMENT_SIZE`.
    pub(crate) segment_size: usize,
    page_shift: usize,
    pub(crate) page_kind: PageKind,
    /// Page slots in this segment (including the reserved slot 0 of
    /// small/medium segments).
    page_count: usize,
    /// First claimable slot: 1 when slot 0 is the header page.
    first_slot: usize,
    /// Claimed page slots.
    pub(crate) used: Cell<usize>,
    /// Pages that still held live blocks when the segment was abandoned.
    pub(crate) abandoned: Cell<usize>,
    /// Links for the owning heap's not-full segment list.
    pub(crate) prev: Cell<*mut Segment>,
    pub(crate) next: Cell<*mut Segment>,
    pub(crate) in_heap_list: Cell<bool>,
    /// Link for the abandoned registry of non-arena segments.
    registry_next: Cell<*mut Segment>,
    /// Links for the live registry of non-arena segments (pointer lookup).
    os_prev: Cell<*mut Segment>,
    os_next: Cell<*mut Segment>,
    pages: [Page; SMALL_PAGES_PER_SEGMENT],
}

// SAFETY: cross-thread access is limited to `thread_id`, the pages' shared
// halves, and the immutable geometry fields; everything else is owner-only
// by protocol.
unsafe impl Sync for Segment {}

const _: () = assert!(size_of::<Segment>() <= crate::size_class::SMALL_PAGE_SIZE);

impl Segment {
    /// Allocate and initialize a segment for `kind`, owned by `thread_id`.
    /// `huge_size` is the requested block size and only matters for
    /// `PageKind::Huge`.
    pub fn alloc(kind: PageKind, huge_size: usize, thread_id: usize) -> Option<NonNull<Segment>> {
        let segment_size = match kind {
            PageKind::Huge => {
                let needed = size_of::<Segment>().checked_add(huge_size)?;
                needed.checked_add(SEGMENT_SIZE - 1)? & !(SEGMENT_SIZE - 1)
            }
            _ => SEGMENT_SIZE,
        };

        let (ptr, mut memid) = arena::alloc_aligned(
            segment_size,
            crate::size_class::SEGMENT_ALIGN,
            true,
            None,
        )?;
        if !memid.initially_committed {
            // The claim succeeded but the commit did not; try once more
            // before giving the range back.
            if os::commit(ptr.as_ptr(), segment_size).is_err() {
                // SAFETY: freeing the freshly claimed range.
                unsafe { arena::free(ptr.as_ptr(), segment_size, 0, memid) };
                return None;
            }
            memid.initially_committed = true;
        }

        let seg = ptr.as_ptr() as *mut Segment;
        debug_assert_eq!(seg as usize & SEGMENT_MASK, 0);
        let (page_shift, page_count, first_slot) = match kind {
            PageKind::Small | PageKind::Medium => (kind.page_shift(), kind.pages_per_segment(), 1),
            PageKind::Large | PageKind::Huge => (kind.page_shift(), 1, 0),
        };

        // SAFETY: seg points at `segment_size` committed bytes we own; the
        // header (including the page table) fits in the reserved area.
        unsafe {
            ptr::write(
                seg,
                Segment {
                    cookie: cookie_of(seg),
                    thread_id: AtomicUsize::new(thread_id),
                    memid,
                    segment_size,
                    page_shift,
                    page_kind: kind,
                    page_count,
                    first_slot,
                    used: Cell::new(0),
                    abandoned: Cell::new(0),
                    prev: Cell::new(null_mut()),
                    next: Cell::new(null_mut()),
                    in_heap_list: Cell::new(false),
                    registry_next: Cell::new(null_mut()),
                    os_prev: Cell::new(null_mut()),
                    os_next: Cell::new(null_mut()),
                    pages: [const { Page::empty() }; SMALL_PAGES_PER_SEGMENT],
                },
            );
            for (i, page) in (*seg).pages.iter().enumerate() {
                page.segment_idx.set(i as u8);
            }
            if !matches!(memid.kind, MemKind::Arena { .. }) {
                os_segments_register(seg);
            }
            Some(NonNull::new_unchecked(seg))
        }
    }

    /// Release the segment's memory back to its arena (or the OS).
    ///
    /// # Safety
    ///
    /// No page of the segment may be in use and no other thread may hold a
    /// reference into it.
    pub unsafe fn free(seg: *mut Segment) {
        // SAFETY: caller contract; the header stays readable until the
        // arena reclaims the range.
        unsafe {
            let size = (*seg).segment_size;
            let memid = (*seg).memid;
            if !matches!(memid.kind, MemKind::Arena { .. }) {
                os_segments_unregister(seg);
                os_abandoned_remove(seg);
            }
            (*seg).cookie = 0;
            arena::free(seg.cast(), size, size, memid);
        }
    }

    /// Recover the segment of an interior pointer.
    ///
    /// Pointers inside an arena recover their header with a single mask
    /// (the fast path); pointers outside every arena are looked up in the
    /// direct-OS segment registry, so a foreign pointer is rejected
    /// without ever dereferencing through it.
    #[inline]
    pub fn of_ptr(ptr: *mut u8) -> Option<NonNull<Segment>> {
        if ptr.is_null() {
            return None;
        }
        if arena::contains(ptr) {
            let seg = ((ptr as usize) & !SEGMENT_MASK) as *mut Segment;
            // SAFETY: arena ranges are ours; the masked address is the
            // committed header of the segment the pointer lives in.
            debug_assert_eq!(unsafe { (*seg).cookie }, cookie_of(seg));
            // SAFETY: non-null by construction inside an arena.
            return Some(unsafe { NonNull::new_unchecked(seg) });
        }
        os_segments_lookup(ptr)
    }

    /// The page covering an interior pointer.
    #[inline]
    pub fn page_of(&self, ptr: *mut u8) -> &Page {
        let offset = ptr as usize - self as *const Segment as usize;
        let idx = (offset >> self.page_shift).min(self.page_count - 1);
        &self.pages[idx]
    }

    #[inline]
    pub fn page(&self, idx: usize) -> &Page {
        &self.pages[idx]
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[inline]
    pub fn first_slot(&self) -> usize {
        self.first_slot
    }

    #[inline]
    pub fn kind(&self) -> PageKind {
        self.page_kind
    }

    #[inline]
    pub fn owner(&self) -> usize {
        self.thread_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.owner() == 0
    }

    /// Data area of page slot `idx`.
    pub fn page_area(&self, idx: usize) -> (*mut u8, usize) {
        let base = self as *const Segment as usize;
        match self.page_kind {
            PageKind::Small | PageKind::Medium => {
                debug_assert!(idx >= self.first_slot && idx < self.page_count);
                let page_size = 1 << self.page_shift;
                ((base + (idx << self.page_shift)) as *mut u8, page_size)
            }
            PageKind::Large | PageKind::Huge => {
                let offset = align_up(size_of::<Segment>(), 64);
                ((base + offset) as *mut u8, self.segment_size - offset)
            }
        }
    }

    /// Whether any page slot is free to claim.
    #[inline]
    pub fn has_free_slot(&self) -> bool {
        self.used.get() < self.page_count - self.first_slot
    }

    /// Claim a free page slot and initialize it for `bin`/`block_size`.
    /// Owner thread only. Large and huge pages always span their whole
    /// data area, so `block_size` is ignored for them.
    pub fn claim_page(&self, bin: usize, block_size: usize) -> Option<&Page> {
        for idx in self.first_slot..self.page_count {
            let page = &self.pages[idx];
            if !page.own.in_use.get() {
                let (area, area_size) = self.page_area(idx);
                let bsize = match self.page_kind {
                    PageKind::Small | PageKind::Medium => block_size,
                    PageKind::Large | PageKind::Huge => area_size,
                };
                // SAFETY: the area belongs to this slot and the caller owns
                // the segment.
                unsafe { page.init(bin, bsize, area, area_size) };
                self.used.set(self.used.get() + 1);
                return Some(page);
            }
        }
        None
    }

    /// Return a page slot. Reports whether the segment became empty (the
    /// caller then frees it).
    pub fn release_page(&self, page: &Page) -> bool {
        debug_assert!(page.own.in_use.get());
        page.reset();
        self.used.set(self.used.get() - 1);
        self.used.get() == 0
    }

    /// Abandon this segment: publish it for adoption by any thread.
    /// Called on thread teardown for segments that still hold live blocks.
    pub fn mark_abandoned(&self) {
        self.abandoned.set(self.used.get());
        self.in_heap_list.set(false);
        self.thread_id.store(0, Ordering::Release);
        match self.memid.kind {
            MemKind::Arena { .. } => arena::segment_mark_abandoned(self.memid),
            _ => {
                // Not bitmap-tracked: park it in the registry.
                os_registry_push(self as *const Segment as *mut Segment);
                arena::abandoned_count_inc();
            }
        }
    }

    /// Try to take ownership of an abandoned segment.
    pub fn try_adopt(&self, thread_id: usize) -> bool {
        debug_assert!(thread_id != 0);
        self.thread_id
            .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim a specific abandoned segment (the free-path reclaim): win the
    /// abandoned bit (or the `thread_id` CAS for non-arena segments), then
    /// own it.
    pub(crate) fn try_reclaim_abandoned(&self, thread_id: usize) -> bool {
        match self.memid.kind {
            MemKind::Arena { .. } => {
                if !arena::segment_clear_abandoned(self.memid) {
                    return false;
                }
                let adopted = self.try_adopt(thread_id);
                debug_assert!(adopted, "abandoned-bit winner must own the segment");
                adopted
            }
            _ => {
                if self.try_adopt(thread_id) {
                    arena::abandoned_count_dec();
                    true
                } else {
                    false
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registries for non-arena segments
// ---------------------------------------------------------------------------

/// Intrusive list head guarded by a mutex. Arena-backed segments are
/// tracked in the arena bitmaps instead; these registries only see the
/// rare direct-OS segments (huge allocations, `disallow_arena_alloc`).
struct SegmentList {
    head: *mut Segment,
}

// SAFETY: the pointer list is only traversed under the mutex.
unsafe impl Send for SegmentList {}

/// All live non-arena segments, for pointer classification on `free`.
static OS_SEGMENTS: Mutex<SegmentList> = Mutex::new(SegmentList { head: null_mut() });
/// Abandoned non-arena segments awaiting adoption.
static OS_ABANDONED: Mutex<SegmentList> = Mutex::new(SegmentList { head: null_mut() });

fn os_segments_register(seg: *mut Segment) {
    let mut reg = OS_SEGMENTS.lock();
    // SAFETY: seg is live and exclusively ours until published.
    unsafe {
        (*seg).os_prev.set(null_mut());
        (*seg).os_next.set(reg.head);
        if !reg.head.is_null() {
            (*reg.head).os_prev.set(seg);
        }
    }
    reg.head = seg;
}

fn os_segments_unregister(seg: *mut Segment) {
    let mut reg = OS_SEGMENTS.lock();
    // SAFETY: seg was registered and its links are only mutated under the
    // lock.
    unsafe {
        let prev = (*seg).os_prev.get();
        let next = (*seg).os_next.get();
        if prev.is_null() {
            reg.head = next;
        } else {
            (*prev).os_next.set(next);
        }
        if !next.is_null() {
            (*next).os_prev.set(prev);
        }
        (*seg).os_prev.set(null_mut());
        (*seg).os_next.set(null_mut());
    }
}

/// Find the live non-arena segment containing `ptr`, if any.
fn os_segments_lookup(ptr: *mut u8) -> Option<NonNull<Segment>> {
    let reg = OS_SEGMENTS.lock();
    let mut seg = reg.head;
    while !seg.is_null() {
        // SAFETY: registered segments are live; links mutate only under
        // the lock we hold.
        unsafe {
            let base = seg as usize;
            if (ptr as usize) >= base && (ptr as usize) < base + (*seg).segment_size {
                return Some(NonNull::new_unchecked(seg));
            }
            seg = (*seg).os_next.get();
        }
    }
    None
}

/// Drop a stale abandoned-registry entry (the segment was adopted through
/// a direct `thread_id` CAS, or is being freed).
fn os_abandoned_remove(seg: *mut Segment) {
    let mut reg = OS_ABANDONED.lock();
    let mut cur = reg.head;
    let mut prev: *mut Segment = null_mut();
    while !cur.is_null() {
        // SAFETY: parked entries are live; links mutate only under the
        // lock we hold.
        unsafe {
            let next = (*cur).registry_next.get();
            if cur == seg {
                if prev.is_null() {
                    reg.head = next;
                } else {
                    (*prev).registry_next.set(next);
                }
                (*seg).registry_next.set(null_mut());
                return;
            }
            prev = cur;
            cur = next;
        }
    }
}

fn os_registry_push(seg: *mut Segment) {
    let mut reg = OS_ABANDONED.lock();
    // SAFETY: seg is a live abandoned segment; the registry owns its
    // `registry_next` link while parked here.
    unsafe { (*seg).registry_next.set(reg.head) };
    reg.head = seg;
}

/// Claim an abandoned non-arena segment for `thread_id`.
pub(crate) fn os_registry_try_claim(thread_id: usize) -> Option<NonNull<Segment>> {
    let mut reg = OS_ABANDONED.lock();
    let seg = reg.head;
    if seg.is_null() {
        return None;
    }
    // SAFETY: parked segments stay alive until claimed here.
    unsafe {
        reg.head = (*seg).registry_next.get();
        (*seg).registry_next.set(null_mut());
        if (*seg).try_adopt(thread_id) {
            arena::abandoned_count_dec();
            Some(NonNull::new_unchecked(seg))
        } else {
            // A free-path reclaim won the thread_id CAS and already
            // adjusted the count; just drop the stale entry.
            None
        }
    }
}
