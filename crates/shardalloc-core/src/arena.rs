//! Arenas: shared OS reservations carved into segment-sized blocks.
//!
//! An arena is a large contiguous reservation (1 GiB by default, or backed
//! by huge OS pages) partitioned into blocks of `ARENA_BLOCK_SIZE`. Unlike
//! the rest of the allocator, arenas are shared between threads, so every
//! block state lives in atomic bitmaps:
//!
//! - `inuse`: claimed blocks,
//! - `dirty`: blocks whose memory may be non-zero,
//! - `abandoned`: blocks starting an abandoned segment,
//! - `committed`/`purge`: physical backing state and pending decommits
//!   (absent for pinned huge-page arenas, which can never be decommitted).
//!
//! Freed ranges are not returned to the OS synchronously; they are marked
//! in `purge` with an expiration time, and a single-threaded collector
//! decommits expired runs after re-claiming their `inuse` bits so no
//! concurrent allocation can race the decommit.

use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicUsize, Ordering};

use crate::bitmap::{self, BitIndex, BitmapField, FIELD_BITS};
use crate::diag::{self, AllocError};
use crate::options::{self, ShardOption};
use crate::os::{self, MemId, MemKind};
use crate::rng::Rng;
use crate::segment::Segment;
use crate::size_class::{align_up, SEGMENT_ALIGN, SEGMENT_SIZE};

/// Arena blocks are segment sized so one claimed bit is one segment.
pub const ARENA_BLOCK_SIZE: usize = SEGMENT_SIZE;
/// Hard cap on the arenas table.
pub const MAX_ARENAS: usize = 112;

/// Arena handle: index + 1 so 0 reads as "no arena".
pub type ArenaId = usize;

pub struct Arena {
    id: ArenaId,
    /// Provenance of the backing region itself.
    memid: MemId,
    start: *mut u8,
    block_count: usize,
    field_count: usize,
    meta_size: usize,
    meta_memid: MemId,
    numa_node: i32,
    /// Only serves requests that name this arena.
    exclusive: bool,
    /// Backed by large/huge OS pages (always committed, never purged).
    is_large: bool,
    /// Field hint where the last successful claim landed.
    search_idx: AtomicUsize,
    /// Deadline for the delayed decommit of scheduled purge bits.
    purge_expire: AtomicI64,
    /// Bitmap storage trails the struct in the same metadata allocation.
    inuse: *const BitmapField,
    dirty: *const BitmapField,
    abandoned: *const BitmapField,
    committed: *const BitmapField, // null when pinned
    purge: *const BitmapField,     // null when pinned
}

// SAFETY: all mutable state is atomic; the raw pointers are immutable
// after construction and point into the arena's own metadata block.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    #[inline]
    fn bitmap(&self, ptr: *const BitmapField) -> &[BitmapField] {
        // SAFETY: every bitmap is `field_count` fields inside our metadata
        // allocation, alive for the arena's lifetime.
        unsafe { std::slice::from_raw_parts(ptr, self.field_count) }
    }

    #[inline]
    fn inuse(&self) -> &[BitmapField] {
        self.bitmap(self.inuse)
    }

    #[inline]
    fn dirty(&self) -> &[BitmapField] {
        self.bitmap(self.dirty)
    }

    #[inline]
    fn abandoned(&self) -> &[BitmapField] {
        self.bitmap(self.abandoned)
    }

    #[inline]
    fn committed(&self) -> Option<&[BitmapField]> {
        if self.committed.is_null() {
            None
        } else {
            Some(self.bitmap(self.committed))
        }
    }

    #[inline]
    fn purge(&self) -> Option<&[BitmapField]> {
        if self.purge.is_null() {
            None
        } else {
            Some(self.bitmap(self.purge))
        }
    }

    #[inline]
    fn block_start(&self, idx: BitIndex) -> *mut u8 {
        self.start.wrapping_add(idx.index() * ARENA_BLOCK_SIZE)
    }

    #[inline]
    fn total_size(&self) -> usize {
        self.block_count * ARENA_BLOCK_SIZE
    }

    #[inline]
    pub fn numa_node(&self) -> i32 {
        self.numa_node
    }
}

// The available arenas.
static ARENAS: [AtomicPtr<Arena>; MAX_ARENAS] =
    [const { AtomicPtr::new(null_mut()) }; MAX_ARENAS];
static ARENA_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Abandoned segments across all arenas plus the non-arena registry.
static ABANDONED_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Only one thread purges at a time.
static PURGE_GUARD: AtomicBool = AtomicBool::new(false);

#[inline]
fn arena_at(index: usize) -> Option<&'static Arena> {
    if index >= MAX_ARENAS {
        return None;
    }
    // SAFETY: published arenas are never torn down while the process runs.
    unsafe { ARENAS[index].load(Ordering::Acquire).as_ref() }
}

#[inline]
fn arena_index_of(id: ArenaId) -> usize {
    id.wrapping_sub(1)
}

fn blocks_of_size(size: usize) -> usize {
    size.div_ceil(ARENA_BLOCK_SIZE)
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Claim `blocks` in `arena`, cancel any scheduled purge over the range,
/// track dirty/commit state, and commit on demand.
fn try_alloc_at(
    arena: &'static Arena,
    arena_index: usize,
    blocks: usize,
    commit: bool,
) -> Option<(NonNull<u8>, MemId)> {
    let hint = arena.search_idx.load(Ordering::Relaxed);
    let idx = bitmap::try_find_from_claim_across(arena.inuse(), hint, blocks)?;
    arena.search_idx.store(idx.field(), Ordering::Relaxed);

    let p = arena.block_start(idx);
    let mut memid = MemId {
        kind: MemKind::Arena {
            arena_index,
            block_index: idx.index(),
            exclusive: arena.exclusive,
        },
        initially_committed: false,
        initially_zero: false,
        is_pinned: arena.memid.is_pinned,
    };

    // None of the claimed blocks may stay scheduled for a decommit; the
    // purge collector only touches ranges whose `inuse` bits it can claim,
    // so clearing here is race free.
    if let Some(purge) = arena.purge() {
        bitmap::unclaim_across(purge, blocks, idx);
    }

    // Dirty tracking: the range is still zero only if the arena started
    // zeroed and none of its blocks were handed out before.
    if arena.memid.initially_zero {
        memid.initially_zero = bitmap::claim_across(arena.dirty(), blocks, idx).all_were_unset;
    }

    match arena.committed() {
        None => {
            // Pinned memory is always committed.
            memid.initially_committed = true;
        }
        Some(committed) => {
            if commit {
                memid.initially_committed = true;
                let outcome = bitmap::claim_across(committed, blocks, idx);
                if outcome.any_was_unset {
                    match os::commit(p, blocks * ARENA_BLOCK_SIZE) {
                        Ok(commit_zero) => {
                            if commit_zero {
                                memid.initially_zero = true;
                            }
                        }
                        Err(_) => {
                            // The claim stands; the caller sees an
                            // uncommitted range and may retry the commit.
                            diag::report(AllocError::CommitFailed {
                                size: blocks * ARENA_BLOCK_SIZE,
                            });
                            memid.initially_committed = false;
                        }
                    }
                }
            } else {
                memid.initially_committed = bitmap::is_claimed_across(committed, blocks, idx);
            }
        }
    }

    // SAFETY: block_start of a claimed in-range index is non-null.
    Some((unsafe { NonNull::new_unchecked(p) }, memid))
}

/// Suitability gate for one arena, then the claim itself.
#[allow(clippy::too_many_arguments)]
fn try_alloc_in(
    index: usize,
    match_numa: bool,
    numa_node: i32,
    blocks: usize,
    commit: bool,
    allow_large: bool,
    req_arena: Option<ArenaId>,
) -> Option<(NonNull<u8>, MemId)> {
    let arena = arena_at(index)?;
    if !allow_large && arena.is_large {
        return None;
    }
    match req_arena {
        Some(id) => {
            if arena.id != id {
                return None;
            }
        }
        None => {
            if arena.exclusive {
                return None;
            }
            let numa_suitable =
                numa_node < 0 || arena.numa_node < 0 || arena.numa_node == numa_node;
            if match_numa != numa_suitable {
                return None;
            }
        }
    }
    if blocks > arena.block_count {
        return None;
    }
    try_alloc_at(arena, index, blocks, commit)
}

/// Walk the arenas table, NUMA-local first, then any node.
fn try_alloc(
    numa_node: i32,
    blocks: usize,
    commit: bool,
    allow_large: bool,
    req_arena: Option<ArenaId>,
) -> Option<(NonNull<u8>, MemId)> {
    let max_arena = ARENA_COUNT.load(Ordering::Relaxed).min(MAX_ARENAS);
    if max_arena == 0 {
        return None;
    }
    if let Some(id) = req_arena {
        let index = arena_index_of(id);
        if index < max_arena {
            return try_alloc_in(index, true, numa_node, blocks, commit, allow_large, req_arena);
        }
        return None;
    }
    for i in 0..max_arena {
        if let Some(r) = try_alloc_in(i, true, numa_node, blocks, commit, allow_large, None) {
            return Some(r);
        }
    }
    if numa_node >= 0 {
        for i in 0..max_arena {
            if let Some(r) = try_alloc_in(i, false, numa_node, blocks, commit, allow_large, None) {
                return Some(r);
            }
        }
    }
    None
}

/// Lazily reserve a fresh arena sized from `ArenaReserve`, scaled up
/// exponentially as arenas accumulate (doubling every 8 between 8 and 128).
fn try_reserve_for(size: usize, allow_large: bool) -> Option<ArenaId> {
    let arena_count = ARENA_COUNT.load(Ordering::Acquire);
    if arena_count > MAX_ARENAS - 4 {
        return None;
    }
    let reserve = options::get(ShardOption::ArenaReserve);
    if reserve <= 0 {
        return None;
    }
    let mut reserve = align_up(reserve as usize, ARENA_BLOCK_SIZE);
    if (8..=128).contains(&arena_count) {
        reserve = reserve.checked_shl((arena_count / 8) as u32)?;
    }
    if reserve < size {
        return None;
    }
    let commit = match options::get(ShardOption::ArenaEagerCommit) {
        2 => os::has_overcommit(),
        1 => true,
        _ => false,
    };
    reserve_os_memory(reserve, commit, allow_large, false)
}

/// Allocate an aligned region for the segment layer: arenas first (NUMA
/// local, then any), then a freshly reserved arena, then the OS, honoring
/// the `DisallowArenaAlloc`/`DisallowOsAlloc` overrides.
pub fn alloc_aligned(
    size: usize,
    align: usize,
    commit: bool,
    req_arena: Option<ArenaId>,
) -> Option<(NonNull<u8>, MemId)> {
    debug_assert!(size > 0);
    debug_assert!(align <= SEGMENT_ALIGN);
    let allow_large = options::is_enabled(ShardOption::AllowLargeOsPages);

    if !options::is_enabled(ShardOption::DisallowArenaAlloc) || req_arena.is_some() {
        let numa_node = os::numa_node();
        let blocks = blocks_of_size(size);
        if let Some(r) = try_alloc(numa_node, blocks, commit, allow_large, req_arena) {
            return Some(r);
        }
        if req_arena.is_none() {
            if let Some(id) = try_reserve_for(size, allow_large) {
                let index = arena_index_of(id);
                if let Some(r) =
                    try_alloc_in(index, true, numa_node, blocks, commit, allow_large, Some(id))
                {
                    return Some(r);
                }
            }
        }
    }

    if options::is_enabled(ShardOption::DisallowOsAlloc) || req_arena.is_some() {
        diag::report(AllocError::OutOfMemory { size });
        return None;
    }
    match os::alloc_aligned(size, align, commit, allow_large) {
        Ok(r) => Some(r),
        Err(_) => {
            diag::report(AllocError::OutOfMemory { size });
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Free and delayed purge
// ---------------------------------------------------------------------------

fn purge_delay() -> i64 {
    options::get(ShardOption::PurgeDelay) * options::get(ShardOption::ArenaPurgeMult)
}

/// Decommit or reset a range we own (its `inuse` bits are claimed by the
/// caller) and update the committed/purge bitmaps.
fn purge_now(arena: &Arena, idx: BitIndex, blocks: usize) {
    debug_assert!(!arena.memid.is_pinned);
    let Some(committed) = arena.committed() else {
        return;
    };
    let Some(purge) = arena.purge() else {
        return;
    };
    let p = arena.block_start(idx);
    let size = blocks * ARENA_BLOCK_SIZE;

    let needs_recommit = if bitmap::is_claimed_across(committed, blocks, idx) {
        if options::is_enabled(ShardOption::PurgeDecommits) {
            os::decommit(p, size)
        } else {
            os::purge_reset(p, size)
        }
    } else {
        // Part of the range is already uncommitted (a partially committed
        // free); a reset could touch unbacked pages, so decommit only.
        os::decommit(p, size)
    };

    bitmap::unclaim_across(purge, blocks, idx);
    if needs_recommit {
        bitmap::unclaim_across(committed, blocks, idx);
    }
}

/// Schedule a freed range for delayed decommit (or purge it immediately
/// when the delay is zero).
fn schedule_purge(arena: &Arena, idx: BitIndex, blocks: usize) {
    let Some(purge) = arena.purge() else {
        return;
    };
    let delay = purge_delay();
    if delay < 0 {
        return; // purging disabled
    }
    if delay == 0 {
        purge_now(arena, idx, blocks);
        return;
    }
    let expire = arena.purge_expire.load(Ordering::Relaxed);
    if expire != 0 {
        // Already scheduled: nudge the deadline a little further out.
        arena
            .purge_expire
            .fetch_add(delay / 10, Ordering::AcqRel);
    } else {
        arena
            .purge_expire
            .store(os::clock_now() + delay, Ordering::Release);
    }
    bitmap::claim_across(purge, blocks, idx);
}

/// Purge the marked runs inside one field word. Returns whether the whole
/// `[start_bit, start_bit + len)` span was purged.
fn purge_range(arena: &Arena, field: usize, start_bit: usize, len: usize, purge_word: usize) -> bool {
    let end = start_bit + len;
    let mut bit = start_bit;
    let mut all_purged = false;
    while bit < end {
        let mut run = 0;
        while bit + run < end && (purge_word >> (bit + run)) & 1 != 0 {
            run += 1;
        }
        if run > 0 {
            purge_now(arena, BitIndex::new(field, bit), run);
            if run == len {
                all_purged = true;
            }
        }
        bit += run + 1;
    }
    all_purged
}

/// Purge an arena whose deadline has passed. Returns whether anything was
/// purged. Partially purged work is rescheduled.
fn try_purge_arena(arena: &Arena, now: i64, force: bool) -> bool {
    if arena.memid.is_pinned || arena.purge.is_null() {
        return false;
    }
    let expire = arena.purge_expire.load(Ordering::Relaxed);
    if expire == 0 {
        return false;
    }
    if !force && expire > now {
        return false;
    }
    // Reset the deadline (unless another thread moved it concurrently).
    let _ = arena
        .purge_expire
        .compare_exchange(expire, 0, Ordering::AcqRel, Ordering::Relaxed);

    let purge_fields = arena.purge().unwrap();
    let mut any_purged = false;
    let mut full_purge = true;
    for field in 0..arena.field_count {
        let word = purge_fields[field].load(Ordering::Relaxed);
        if word == 0 {
            continue;
        }
        let mut bit = 0;
        while bit < FIELD_BITS {
            let mut len = 0;
            while bit + len < FIELD_BITS && (word >> (bit + len)) & 1 != 0 {
                len += 1;
            }
            if len > 0 {
                // Pin the corresponding `inuse` bits so no allocation can
                // claim the range mid-decommit; shrink until it claims.
                let idx = BitIndex::new(field, bit);
                let mut claimed = len;
                while claimed > 0 && !bitmap::try_claim_across(arena.inuse(), claimed, idx) {
                    claimed -= 1;
                }
                if claimed > 0 {
                    let word_now = purge_fields[field].load(Ordering::Acquire);
                    if !purge_range(arena, field, bit, claimed, word_now) {
                        full_purge = false;
                    }
                    any_purged = true;
                    bitmap::unclaim_across(arena.inuse(), claimed, idx);
                    if claimed < len {
                        full_purge = false;
                    }
                } else {
                    full_purge = false;
                }
            }
            bit += len + 1;
        }
    }
    if !full_purge {
        let delay = purge_delay();
        let _ = arena.purge_expire.compare_exchange(
            0,
            os::clock_now() + delay,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
    any_purged
}

/// Walk arenas whose purge deadline expired. Invoked from the generic
/// routine and from `free`; `force` purges everything regardless of
/// deadlines and visits every arena.
pub fn try_purge_all(force: bool) {
    if purge_delay() <= 0 {
        return;
    }
    let max_arena = ARENA_COUNT.load(Ordering::Acquire).min(MAX_ARENAS);
    if max_arena == 0 {
        return;
    }
    // Single purger at a time; latecomers just skip.
    if PURGE_GUARD.swap(true, Ordering::Acquire) {
        return;
    }
    let now = os::clock_now();
    let mut budget = if force { max_arena } else { 1 };
    for i in 0..max_arena {
        if let Some(arena) = arena_at(i) {
            if try_purge_arena(arena, now, force) {
                if budget <= 1 {
                    break;
                }
                budget -= 1;
            }
        }
    }
    PURGE_GUARD.store(false, Ordering::Release);
}

/// Give a segment-layer range back: OS ranges unmap, arena ranges clear
/// their bitmap state and go onto the delayed purge schedule.
///
/// # Safety
///
/// `p`/`size`/`memid` must come from a matching [`alloc_aligned`], with no
/// live references into the range. `committed_size` is the caller's count
/// of still-committed bytes in the range.
pub unsafe fn free(p: *mut u8, size: usize, committed_size: usize, memid: MemId) {
    if p.is_null() || size == 0 {
        return;
    }
    match memid.kind {
        MemKind::Os => {
            // SAFETY: caller contract.
            unsafe { os::free(p, size, memid) };
        }
        MemKind::Arena {
            arena_index,
            block_index,
            ..
        } => {
            let blocks = blocks_of_size(size);
            let idx = BitIndex::from_index(block_index);
            let Some(arena) = arena_at(arena_index) else {
                diag::report(AllocError::InvalidPointer { ptr: p as usize });
                return;
            };
            if idx.field() >= arena.field_count {
                diag::report(AllocError::InvalidPointer { ptr: p as usize });
                return;
            }

            if arena.memid.is_pinned || arena.committed.is_null() {
                debug_assert!(committed_size == size);
            } else {
                if committed_size < size {
                    // Mark the whole range uncommitted so a later claim
                    // recommits it in full.
                    bitmap::unclaim_across(arena.committed().unwrap(), blocks, idx);
                }
                schedule_purge(arena, idx, blocks);
            }

            let all_inuse = bitmap::unclaim_across(arena.inuse(), blocks, idx);
            if !all_inuse {
                diag::report(AllocError::DoubleFree { ptr: p as usize });
                return;
            }
        }
        MemKind::External | MemKind::None => {}
    }
    try_purge_all(false);
}

// ---------------------------------------------------------------------------
// Abandoned segments
// ---------------------------------------------------------------------------

pub fn abandoned_count() -> usize {
    ABANDONED_COUNT.load(Ordering::Relaxed)
}

pub(crate) fn abandoned_count_inc() {
    ABANDONED_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn abandoned_count_dec() {
    ABANDONED_COUNT.fetch_sub(1, Ordering::Relaxed);
}

/// Flag the block starting an abandoned segment. Called by the segment
/// layer with the segment's own memid.
pub(crate) fn segment_mark_abandoned(memid: MemId) {
    let MemKind::Arena {
        arena_index,
        block_index,
        ..
    } = memid.kind
    else {
        debug_assert!(false, "arena memid expected");
        return;
    };
    let Some(arena) = arena_at(arena_index) else {
        return;
    };
    let idx = BitIndex::from_index(block_index);
    let outcome = bitmap::claim_across(arena.abandoned(), 1, idx);
    debug_assert!(outcome.all_were_unset, "segment abandoned twice");
    abandoned_count_inc();
    debug_assert!(bitmap::is_claimed_across(arena.inuse(), 1, idx));
}

/// Atomically take the abandoned flag of a specific segment. Whoever gets
/// `true` owns the reclaim.
pub(crate) fn segment_clear_abandoned(memid: MemId) -> bool {
    let MemKind::Arena {
        arena_index,
        block_index,
        ..
    } = memid.kind
    else {
        return false;
    };
    let Some(arena) = arena_at(arena_index) else {
        return false;
    };
    let idx = BitIndex::from_index(block_index);
    let was_set = bitmap::unclaim_across(arena.abandoned(), 1, idx);
    if was_set {
        abandoned_count_dec();
    }
    was_set
}

/// Cursor over the abandoned bitmaps of all arenas, starting at a random
/// arena so concurrent reclaimers spread out.
pub struct AbandonedCursor {
    start_arena: usize,
    visited: usize,
    field: usize,
    bit: usize,
}

impl AbandonedCursor {
    pub fn new(rng: &Rng) -> AbandonedCursor {
        let max_arena = ARENA_COUNT.load(Ordering::Relaxed).min(MAX_ARENAS);
        AbandonedCursor {
            start_arena: if max_arena == 0 {
                0
            } else {
                rng.next_below(max_arena)
            },
            visited: 0,
            field: 0,
            bit: 0,
        }
    }

    /// Claim the next abandoned arena segment. The returned segment still
    /// has `thread_id == 0`; the caller adopts it.
    pub fn next(&mut self) -> Option<NonNull<Segment>> {
        let max_arena = ARENA_COUNT.load(Ordering::Relaxed).min(MAX_ARENAS);
        if max_arena == 0 || abandoned_count() == 0 {
            return None;
        }
        while self.visited < max_arena {
            let arena_index = (self.start_arena + self.visited) % max_arena;
            if let Some(arena) = arena_at(arena_index) {
                while self.field < arena.field_count {
                    let word = arena.abandoned()[self.field].load(Ordering::Relaxed);
                    if word != 0 {
                        while self.bit < FIELD_BITS {
                            let bit = self.bit;
                            self.bit += 1;
                            if (word >> bit) & 1 == 0 {
                                continue;
                            }
                            let idx = BitIndex::new(self.field, bit);
                            if bitmap::unclaim_across(arena.abandoned(), 1, idx) {
                                abandoned_count_dec();
                                debug_assert!(bitmap::is_claimed_across(
                                    arena.inuse(),
                                    1,
                                    idx
                                ));
                                let seg = arena.block_start(idx) as *mut Segment;
                                // SAFETY: an abandoned bit marks a live,
                                // committed segment header.
                                return Some(unsafe { NonNull::new_unchecked(seg) });
                            }
                        }
                    }
                    self.field += 1;
                    self.bit = 0;
                }
            }
            self.visited += 1;
            self.field = 0;
            self.bit = 0;
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Adding arenas
// ---------------------------------------------------------------------------

fn arena_add(arena: *mut Arena) -> Option<ArenaId> {
    let i = ARENA_COUNT.fetch_add(1, Ordering::AcqRel);
    if i >= MAX_ARENAS {
        ARENA_COUNT.fetch_sub(1, Ordering::AcqRel);
        return None;
    }
    let id = i + 1;
    // SAFETY: we exclusively own the arena until it is published here.
    unsafe { (*arena).id = id };
    ARENAS[i].store(arena, Ordering::Release);
    Some(id)
}

/// Wrap an address range in an arena descriptor and publish it.
fn manage_memory(
    start: *mut u8,
    size: usize,
    is_large: bool,
    numa_node: i32,
    exclusive: bool,
    memid: MemId,
) -> Option<ArenaId> {
    if size < ARENA_BLOCK_SIZE || start.is_null() {
        return None;
    }
    if is_large {
        debug_assert!(memid.initially_committed && memid.is_pinned);
    }
    let block_count = size / ARENA_BLOCK_SIZE;
    let field_count = block_count.div_ceil(FIELD_BITS);
    let bitmap_count = if memid.is_pinned { 3 } else { 5 };
    let meta_size =
        size_of::<Arena>() + bitmap_count * field_count * size_of::<BitmapField>();
    let (meta, meta_memid) = os::alloc_meta(meta_size).ok()?;
    let arena = meta.as_ptr() as *mut Arena;

    // SAFETY: meta points at `meta_size` zeroed committed bytes; the
    // bitmaps trail the struct inside the same allocation.
    unsafe {
        let fields = meta.as_ptr().add(size_of::<Arena>()) as *const BitmapField;
        let bm = |n: usize| fields.wrapping_add(n * field_count);
        std::ptr::write(
            arena,
            Arena {
                id: 0,
                memid,
                start,
                block_count,
                field_count,
                meta_size,
                meta_memid,
                numa_node,
                exclusive,
                is_large,
                search_idx: AtomicUsize::new(0),
                purge_expire: AtomicI64::new(0),
                inuse: bm(0),
                dirty: bm(1),
                abandoned: bm(2),
                committed: if memid.is_pinned { std::ptr::null() } else { bm(3) },
                purge: if memid.is_pinned { std::ptr::null() } else { bm(4) },
            },
        );
        let arena_ref = &*arena;
        // Fresh meta memory is zeroed, so all bitmaps start clear. Flag
        // the already-committed case.
        if let Some(committed) = arena_ref.committed() {
            if memid.initially_committed {
                for f in committed {
                    f.store(usize::MAX, Ordering::Relaxed);
                }
            }
        }
        // Claim the bitmap tail past `block_count` so it is never handed
        // out.
        let post = field_count * FIELD_BITS - block_count;
        if post > 0 {
            let post_idx = BitIndex::new(field_count - 1, FIELD_BITS - post);
            bitmap::claim_across(arena_ref.inuse(), post, post_idx);
        }

        match arena_add(arena) {
            Some(id) => Some(id),
            None => {
                os::free(meta.as_ptr(), meta_size, meta_memid);
                None
            }
        }
    }
}

/// Adopt caller-provided memory as an arena.
pub fn manage_os_memory(
    start: *mut u8,
    size: usize,
    is_committed: bool,
    is_large: bool,
    is_zero: bool,
    numa_node: i32,
    exclusive: bool,
) -> Option<ArenaId> {
    let mut memid = MemId::external(is_committed, is_zero, is_large);
    memid.is_pinned = is_large;
    manage_memory(start, size, is_large, numa_node, exclusive, memid)
}

/// Reserve a fresh range of OS memory and publish it as an arena.
pub fn reserve_os_memory(
    size: usize,
    commit: bool,
    allow_large: bool,
    exclusive: bool,
) -> Option<ArenaId> {
    let size = align_up(size, ARENA_BLOCK_SIZE);
    let (start, memid) = os::alloc_aligned(size, SEGMENT_ALIGN, commit, allow_large).ok()?;
    let is_large = memid.is_pinned;
    match manage_memory(start.as_ptr(), size, is_large, -1, exclusive, memid) {
        Some(id) => Some(id),
        None => {
            // SAFETY: freeing the region we just mapped.
            unsafe { os::free(start.as_ptr(), size, memid) };
            None
        }
    }
}

/// Reserve huge (1 GiB) OS pages on a specific NUMA node as a pinned
/// arena. `timeout_msecs` bounds the kernel's page-assembly time.
pub fn reserve_huge_os_pages_at(
    pages: usize,
    numa_node: i32,
    timeout_msecs: usize,
    exclusive: bool,
) -> Option<ArenaId> {
    if pages == 0 {
        return None;
    }
    let numa_node = if numa_node < 0 {
        -1
    } else {
        numa_node % os::numa_node_count() as i32
    };
    let (p, hsize, _reserved, memid) = os::alloc_huge_pages(pages, numa_node, timeout_msecs)?;
    match manage_memory(p.as_ptr(), hsize, true, numa_node, exclusive, memid) {
        Some(id) => Some(id),
        None => {
            // SAFETY: freeing the huge-page region we just obtained.
            unsafe { os::free(p.as_ptr(), hsize, memid) };
            None
        }
    }
}

/// Spread a huge-page reservation evenly over the NUMA nodes, splitting
/// the timeout between them.
pub fn reserve_huge_os_pages_interleave(
    pages: usize,
    numa_nodes: usize,
    timeout_msecs: usize,
) -> bool {
    if pages == 0 {
        return true;
    }
    let numa_count = if numa_nodes > 0 {
        numa_nodes
    } else {
        os::numa_node_count()
    }
    .max(1);
    let pages_per = pages / numa_count;
    let pages_mod = pages % numa_count;
    let timeout_per = if timeout_msecs == 0 {
        0
    } else {
        timeout_msecs / numa_count + 50
    };
    let mut remaining = pages;
    for node in 0..numa_count {
        if remaining == 0 {
            break;
        }
        let mut node_pages = pages_per;
        if node < pages_mod {
            node_pages += 1;
        }
        if node_pages == 0 {
            continue;
        }
        if reserve_huge_os_pages_at(node_pages, node as i32, timeout_per, false).is_none() {
            return false;
        }
        remaining = remaining.saturating_sub(node_pages);
    }
    true
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Is `ptr` inside any arena?
pub fn contains(ptr: *mut u8) -> bool {
    let max_arena = ARENA_COUNT.load(Ordering::Relaxed).min(MAX_ARENAS);
    for i in 0..max_arena {
        if let Some(arena) = arena_at(i) {
            let base = arena.start as usize;
            let p = ptr as usize;
            if p >= base && p < base + arena.total_size() {
                return true;
            }
        }
    }
    false
}

/// The NUMA node of the arena containing `ptr`, if any.
pub fn numa_node_of(ptr: *mut u8) -> Option<i32> {
    let max_arena = ARENA_COUNT.load(Ordering::Relaxed).min(MAX_ARENAS);
    for i in 0..max_arena {
        if let Some(arena) = arena_at(i) {
            let base = arena.start as usize;
            let p = ptr as usize;
            if p >= base && p < base + arena.total_size() {
                return Some(arena.numa_node);
            }
        }
    }
    None
}

/// Aggregate bitmap counters over all arenas (diagnostics and tests).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub arena_count: usize,
    pub total_blocks: usize,
    pub inuse_blocks: usize,
    pub committed_blocks: usize,
    pub purge_blocks: usize,
    pub abandoned_blocks: usize,
}

pub fn stats() -> ArenaStats {
    let mut s = ArenaStats::default();
    let max_arena = ARENA_COUNT.load(Ordering::Relaxed).min(MAX_ARENAS);
    for i in 0..max_arena {
        let Some(arena) = arena_at(i) else { continue };
        s.arena_count += 1;
        s.total_blocks += arena.block_count;
        let tail = arena.field_count * FIELD_BITS - arena.block_count;
        s.inuse_blocks += bitmap::popcount(arena.inuse()) - tail;
        s.abandoned_blocks += bitmap::popcount(arena.abandoned());
        if let Some(committed) = arena.committed() {
            s.committed_blocks += bitmap::popcount(committed);
        } else {
            s.committed_blocks += arena.block_count;
        }
        if let Some(purge) = arena.purge() {
            s.purge_blocks += bitmap::popcount(purge);
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_one_segment() -> (NonNull<u8>, MemId) {
        alloc_aligned(SEGMENT_SIZE, SEGMENT_ALIGN, true, None).expect("segment-sized claim")
    }

    #[test]
    fn test_alloc_is_segment_aligned_and_tracked() {
        let (p, memid) = alloc_one_segment();
        assert_eq!(p.as_ptr() as usize % SEGMENT_ALIGN, 0);
        match memid.kind {
            MemKind::Arena { arena_index, .. } => {
                assert!(arena_index < MAX_ARENAS);
                assert!(contains(p.as_ptr()));
            }
            MemKind::Os => {
                // Arena creation can legitimately fail under memory
                // pressure; the OS fallback is still a valid outcome.
            }
            _ => panic!("unexpected memid {:?}", memid.kind),
        }
        assert!(memid.initially_committed);
        // SAFETY: our own fresh claim.
        unsafe { free(p.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, memid) };
    }

    #[test]
    fn test_free_reuses_address() {
        let (p1, m1) = alloc_one_segment();
        let addr1 = p1.as_ptr() as usize;
        // SAFETY: our own claim.
        unsafe { free(p1.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, m1) };
        let (p2, m2) = alloc_one_segment();
        // The search hint makes reuse of the same block overwhelmingly
        // likely; both claims must at least share an arena.
        if let (MemKind::Arena { arena_index: a, .. }, MemKind::Arena { arena_index: b, .. }) =
            (m1.kind, m2.kind)
        {
            assert_eq!(a, b);
        }
        let _ = addr1;
        // SAFETY: our own claim.
        unsafe { free(p2.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, m2) };
    }

    #[test]
    fn test_double_free_is_reported_not_fatal() {
        let (p, memid) = alloc_one_segment();
        if !matches!(memid.kind, MemKind::Arena { .. }) {
            // OS fallback: double-unmap is UB, skip.
            // SAFETY: our own claim.
            unsafe { free(p.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, memid) };
            return;
        }
        // SAFETY: our own claim; the second free is the case under test
        // and must be dropped by the bitmap check.
        unsafe {
            free(p.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, memid);
            free(p.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, memid);
        }
    }

    #[test]
    fn test_inuse_and_purge_stay_disjoint() {
        let (p, memid) = alloc_one_segment();
        if !matches!(memid.kind, MemKind::Arena { .. }) {
            // SAFETY: our own claim.
            unsafe { free(p.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, memid) };
            return;
        }
        options::set(ShardOption::PurgeDelay, 1_000);
        // SAFETY: our own claim.
        unsafe { free(p.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, memid) };
        let s = stats();
        // The freed block may be scheduled for purge, but it can never be
        // both in use and scheduled.
        assert!(s.inuse_blocks + s.purge_blocks <= s.total_blocks);
        let (p2, m2) = alloc_one_segment();
        let s2 = stats();
        assert!(
            s2.purge_blocks <= s.purge_blocks,
            "claiming must cancel scheduled purges, not add them"
        );
        // SAFETY: our own claim.
        unsafe { free(p2.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, m2) };
        options::set(ShardOption::PurgeDelay, 10);
    }

    #[test]
    fn test_immediate_purge_decommits() {
        options::set(ShardOption::PurgeDelay, 0);
        let (p, memid) = alloc_one_segment();
        if matches!(memid.kind, MemKind::Arena { .. }) {
            let before = stats().committed_blocks;
            // SAFETY: our own claim.
            unsafe { free(p.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, memid) };
            let after = stats().committed_blocks;
            assert!(
                after < before,
                "immediate purge must drop committed blocks ({} -> {})",
                before,
                after
            );
        } else {
            // SAFETY: our own claim.
            unsafe { free(p.as_ptr(), SEGMENT_SIZE, SEGMENT_SIZE, memid) };
        }
        options::set(ShardOption::PurgeDelay, 10);
    }

    #[test]
    fn test_manage_external_memory() {
        // Hand the arena layer a raw OS range and make sure it serves
        // claims from it.
        let size = 8 * ARENA_BLOCK_SIZE;
        let (start, os_memid) = os::alloc_aligned(size, SEGMENT_ALIGN, true, false).unwrap();
        let id = manage_os_memory(start.as_ptr(), size, true, false, true, 0, true)
            .expect("manage_os_memory");
        let blocks = 2;
        let got = alloc_aligned(blocks * ARENA_BLOCK_SIZE, SEGMENT_ALIGN, true, Some(id))
            .expect("exclusive arena claim");
        let (p, memid) = got;
        assert!(p.as_ptr() as usize >= start.as_ptr() as usize);
        assert!((p.as_ptr() as usize) < start.as_ptr() as usize + size);
        match memid.kind {
            MemKind::Arena { exclusive, .. } => assert!(exclusive),
            k => panic!("expected arena memid, got {:?}", k),
        }
        assert_eq!(
            numa_node_of(p.as_ptr()),
            Some(0),
            "the arena must remember its NUMA node"
        );
        // An exclusive arena must not serve anonymous requests: nothing to
        // assert directly here, but the claim above must have come from
        // our range, which we checked.
        // SAFETY: our own claim; external backing stays alive.
        unsafe { free(p.as_ptr(), blocks * ARENA_BLOCK_SIZE, blocks * ARENA_BLOCK_SIZE, memid) };
        let _ = os_memid; // external range intentionally leaked to the arena
    }

    #[test]
    fn test_abandoned_bitmap_round_trip() {
        use crate::segment::Segment;
        use crate::size_class::PageKind;

        let _serial = crate::test_sync::RECLAIM_LOCK.lock();
        let seg = Segment::alloc(PageKind::Small, 0, 41).expect("segment");
        // SAFETY: exclusively ours until abandoned.
        let memid = unsafe { seg.as_ref().memid };
        if !matches!(memid.kind, MemKind::Arena { .. }) {
            // SAFETY: freeing our own segment.
            unsafe { Segment::free(seg.as_ptr()) };
            return;
        }
        // SAFETY: our segment; publishing it for adoption.
        unsafe { seg.as_ref().mark_abandoned() };
        // Reclaim it back. A concurrent test's generic routine may win the
        // race and (since it holds no pages) free it; in that case there
        // is nothing left to assert.
        // SAFETY: the header stays valid until someone reclaims it.
        if unsafe { seg.as_ref().try_reclaim_abandoned(41) } {
            assert!(
                !segment_clear_abandoned(memid),
                "reclaimed segment must have a clear abandoned bit"
            );
            // SAFETY: reclaimed above, so it is ours again.
            unsafe { Segment::free(seg.as_ptr()) };
        }
    }

    #[test]
    fn test_cursor_finds_abandoned_segment() {
        use crate::segment::Segment;
        use crate::size_class::PageKind;

        let _serial = crate::test_sync::RECLAIM_LOCK.lock();
        let seg = Segment::alloc(PageKind::Small, 0, 43).expect("segment");
        // SAFETY: exclusively ours until abandoned.
        let memid = unsafe { seg.as_ref().memid };
        if !matches!(memid.kind, MemKind::Arena { .. }) {
            // SAFETY: freeing our own segment.
            unsafe { Segment::free(seg.as_ptr()) };
            return;
        }
        let target = seg.as_ptr() as usize;
        // SAFETY: our segment; publishing it for adoption.
        unsafe { seg.as_ref().mark_abandoned() };

        let rng = Rng::zeroed();
        rng.seed(0x5eed);
        let mut cursor = AbandonedCursor::new(&rng);
        while let Some(found) = cursor.next() {
            if found.as_ptr() as usize == target {
                // SAFETY: the cursor cleared the bit; adoption makes it
                // ours again.
                unsafe {
                    assert!(found.as_ref().try_adopt(43));
                    Segment::free(found.as_ptr());
                }
                return;
            }
            // Someone else's abandoned segment: put it back.
            // SAFETY: the cursor returned a live abandoned segment header.
            unsafe {
                segment_mark_abandoned(found.as_ref().memid);
            }
        }
        // Not found: a concurrent reclaimer adopted (and, holding no
        // pages, freed) it first. That is a legal outcome; the segment is
        // no longer ours to free.
    }
}
