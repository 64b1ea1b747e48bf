//! POSIX memory primitives and memory provenance ids.
//!
//! Everything the engine asks of the operating system funnels through this
//! module: aligned reservations, commit/decommit, purge advice, huge-page
//! reservation, NUMA queries, the monotonic clock, and entropy. All
//! functions are total (failures are reported as values, never panics).
//!
//! Every region handed out is described by a [`MemId`] so the eventual
//! `free` knows whether the bytes came from an arena block, a direct OS
//! mapping, or externally managed memory.

use std::ffi::CStr;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::size_class::align_up;

/// Where a region's bytes came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemKind {
    /// No backing memory (the null allocation).
    None,
    /// Caller-provided memory adopted via `manage_os_memory`.
    External,
    /// Directly mapped from the OS, bypassing arenas.
    Os,
    /// Claimed from an arena's bitmap.
    Arena {
        /// Index into the global arenas table.
        arena_index: usize,
        /// First claimed bit (field * FIELD_BITS + bit).
        block_index: usize,
        /// Allocated from an exclusive arena.
        exclusive: bool,
    },
}

/// Provenance plus the commit/zero/pin state observed at allocation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemId {
    pub kind: MemKind,
    /// The range was fully committed when handed out.
    pub initially_committed: bool,
    /// The range was known-zero when handed out.
    pub initially_zero: bool,
    /// Backed by large/huge OS pages; can never be decommitted.
    pub is_pinned: bool,
}

impl MemId {
    pub const fn none() -> MemId {
        MemId {
            kind: MemKind::None,
            initially_committed: false,
            initially_zero: false,
            is_pinned: false,
        }
    }

    pub const fn os(committed: bool, zero: bool, pinned: bool) -> MemId {
        MemId {
            kind: MemKind::Os,
            initially_committed: committed,
            initially_zero: zero,
            is_pinned: pinned,
        }
    }

    pub const fn external(committed: bool, zero: bool, pinned: bool) -> MemId {
        MemId {
            kind: MemKind::External,
            initially_committed: committed,
            initially_zero: zero,
            is_pinned: pinned,
        }
    }

    pub fn is_os_allocated(&self) -> bool {
        matches!(self.kind, MemKind::Os)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OsError {
    #[error("reserving {size} bytes failed (errno {errno})")]
    ReserveFailed { size: usize, errno: i32 },
    #[error("committing {size} bytes failed (errno {errno})")]
    CommitFailed { size: usize, errno: i32 },
    #[error("mprotect failed (errno {errno})")]
    ProtectFailed { errno: i32 },
}

fn last_errno() -> i32 {
    // SAFETY: errno location is always valid for the calling thread.
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location()
    }
    #[cfg(target_os = "macos")]
    unsafe {
        *libc::__error()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        0
    }
}

/// System page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf is async-signal-safe and has no memory effects.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if size <= 0 { 4096 } else { size as usize };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

fn mmap_prot(commit: bool) -> i32 {
    if commit {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    }
}

fn mmap_flags(commit: bool) -> i32 {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    #[cfg(target_os = "linux")]
    let flags = if commit {
        flags
    } else {
        flags | libc::MAP_NORESERVE
    };
    let _ = commit;
    flags
}

/// Raw anonymous mapping. Returns null on failure.
unsafe fn raw_map(hint: *mut u8, size: usize, prot: i32, flags: i32) -> *mut u8 {
    // SAFETY: anonymous mapping with fd -1; the caller owns the result.
    let p = unsafe { libc::mmap(hint.cast(), size, prot, flags, -1, 0) };
    if p == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        p.cast()
    }
}

/// Reserve (and optionally commit) `size` bytes aligned to `align`.
///
/// The kernel gives no alignment promises, so a misaligned first attempt is
/// retried by over-allocating `size + align` and trimming both ends. The
/// `allow_large` flag is accepted for contract parity; transparent huge
/// pages need no cooperation from us, and explicit huge pages go through
/// [`alloc_huge_pages`].
pub fn alloc_aligned(
    size: usize,
    align: usize,
    commit: bool,
    _allow_large: bool,
) -> Result<(NonNull<u8>, MemId), OsError> {
    debug_assert!(align.is_power_of_two());
    let size = align_up(size.max(1), page_size());
    let prot = mmap_prot(commit);
    let flags = mmap_flags(commit);

    // SAFETY: plain anonymous mapping.
    let p = unsafe { raw_map(ptr::null_mut(), size, prot, flags) };
    if !p.is_null() && (p as usize) % align == 0 {
        let memid = MemId::os(commit, true, false);
        // SAFETY: checked non-null above.
        return Ok((unsafe { NonNull::new_unchecked(p) }, memid));
    }
    if !p.is_null() {
        // SAFETY: unmapping the full region we just mapped.
        unsafe { libc::munmap(p.cast(), size) };
    }

    // Over-allocate and trim to the alignment.
    let over = size + align;
    // SAFETY: as above.
    let raw = unsafe { raw_map(ptr::null_mut(), over, prot, flags) };
    if raw.is_null() {
        return Err(OsError::ReserveFailed {
            size: over,
            errno: last_errno(),
        });
    }
    let aligned = align_up(raw as usize, align) as *mut u8;
    let pre = aligned as usize - raw as usize;
    let post = over - pre - size;
    // SAFETY: both trims are within the region just mapped and do not
    // overlap [aligned, aligned + size).
    unsafe {
        if pre > 0 {
            libc::munmap(raw.cast(), pre);
        }
        if post > 0 {
            libc::munmap(aligned.add(size).cast(), post);
        }
    }
    let memid = MemId::os(commit, true, false);
    // SAFETY: aligned lies within a successful mapping.
    Ok((unsafe { NonNull::new_unchecked(aligned) }, memid))
}

/// Committed, page-aligned metadata allocation (arena descriptors).
pub fn alloc_meta(size: usize) -> Result<(NonNull<u8>, MemId), OsError> {
    alloc_aligned(size, page_size(), true, false)
}

/// Return a full OS region. `memid` must describe an OS or external region;
/// external memory is left untouched (its owner reclaims it).
///
/// # Safety
///
/// `ptr`/`size` must be exactly the region produced by [`alloc_aligned`]
/// (or adopted), with no live references into it.
pub unsafe fn free(ptr: *mut u8, size: usize, memid: MemId) {
    if ptr.is_null() || size == 0 {
        return;
    }
    match memid.kind {
        MemKind::Os => {
            // SAFETY: caller contract.
            unsafe { libc::munmap(ptr.cast(), size) };
        }
        MemKind::External | MemKind::None => {}
        MemKind::Arena { .. } => {
            debug_assert!(false, "arena memory must be freed through the arena");
        }
    }
}

/// Make `[ptr, ptr+size)` readable and writable.
///
/// Returns whether the range is known to read as zero afterwards (we can
/// never promise that from `mprotect` alone, so this is always `false`).
pub fn commit(ptr: *mut u8, size: usize) -> Result<bool, OsError> {
    // SAFETY: caller owns the range; mprotect on owned anonymous pages.
    let rc = unsafe {
        libc::mprotect(
            ptr.cast(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(OsError::CommitFailed {
            size,
            errno: last_errno(),
        });
    }
    Ok(false)
}

/// Release the physical backing of `[ptr, ptr+size)` and drop access.
///
/// Returns `true` when a later use requires [`commit`] first (always, on
/// this implementation: protection is removed so stray touches trap).
pub fn decommit(ptr: *mut u8, size: usize) -> bool {
    // SAFETY: caller owns the range; DONTNEED on private anonymous memory
    // drops the pages, the subsequent mprotect removes access.
    unsafe {
        libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED);
        libc::mprotect(ptr.cast(), size, libc::PROT_NONE);
    }
    true
}

/// Advise the kernel the range is unused but keep it accessible.
///
/// Softer than [`decommit`]: the pages read as zero after reclaim but no
/// recommit is needed, so this returns `false`.
pub fn purge_reset(ptr: *mut u8, size: usize) -> bool {
    // SAFETY: caller owns the range.
    unsafe {
        libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED);
    }
    false
}

/// Flip a range between no-access and read-write.
pub fn protect(ptr: *mut u8, size: usize, protect: bool) -> Result<(), OsError> {
    let prot = if protect {
        libc::PROT_NONE
    } else {
        libc::PROT_READ | libc::PROT_WRITE
    };
    // SAFETY: caller owns the range.
    let rc = unsafe { libc::mprotect(ptr.cast(), size, prot) };
    if rc != 0 {
        return Err(OsError::ProtectFailed {
            errno: last_errno(),
        });
    }
    Ok(())
}

/// One reserved huge OS page is 1 GiB.
pub const HUGE_OS_PAGE_SIZE: usize = 1 << 30;

/// Reserve `pages` huge (1 GiB) OS pages, stopping at `timeout_msecs` of
/// monotonic time (0 = no limit). Returns the region, its size, and how
/// many pages were actually obtained; `None` if not even one page could be
/// reserved before the deadline.
#[cfg(target_os = "linux")]
pub fn alloc_huge_pages(
    pages: usize,
    _numa_node: i32,
    timeout_msecs: usize,
) -> Option<(NonNull<u8>, usize, usize, MemId)> {
    if pages == 0 {
        return None;
    }
    let total = pages.checked_mul(HUGE_OS_PAGE_SIZE)?;
    let deadline = if timeout_msecs == 0 {
        i64::MAX
    } else {
        clock_now().saturating_add(timeout_msecs as i64)
    };

    // Carve out an aligned address range first, then map huge pages into it
    // one at a time so partial success is usable.
    let (base, _) = alloc_aligned(total, HUGE_OS_PAGE_SIZE, false, true).ok()?;
    let base = base.as_ptr();

    const MAP_HUGE_1GB: i32 = 30 << 26; // MAP_HUGE_SHIFT
    let flags = libc::MAP_PRIVATE
        | libc::MAP_ANONYMOUS
        | libc::MAP_FIXED
        | libc::MAP_HUGETLB
        | MAP_HUGE_1GB;

    let mut reserved = 0;
    while reserved < pages {
        // SAFETY: mapping over our own reservation with MAP_FIXED.
        let p = unsafe {
            raw_map(
                base.wrapping_add(reserved * HUGE_OS_PAGE_SIZE),
                HUGE_OS_PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
            )
        };
        if p.is_null() {
            break;
        }
        reserved += 1;
        if clock_now() > deadline {
            break;
        }
    }

    if reserved == 0 {
        // SAFETY: freeing the whole untouched reservation.
        unsafe { libc::munmap(base.cast(), total) };
        return None;
    }
    if reserved < pages {
        // SAFETY: trimming the unused tail of the reservation.
        unsafe {
            libc::munmap(
                base.wrapping_add(reserved * HUGE_OS_PAGE_SIZE).cast(),
                (pages - reserved) * HUGE_OS_PAGE_SIZE,
            )
        };
    }
    let memid = MemId::os(true, true, true);
    // SAFETY: base came from a successful mapping.
    Some((
        unsafe { NonNull::new_unchecked(base) },
        reserved * HUGE_OS_PAGE_SIZE,
        reserved,
        memid,
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn alloc_huge_pages(
    _pages: usize,
    _numa_node: i32,
    _timeout_msecs: usize,
) -> Option<(NonNull<u8>, usize, usize, MemId)> {
    None
}

/// Read a small pseudo-file into `buf` (for /proc and /sys probes).
fn read_file(path: &CStr, buf: &mut [u8]) -> Option<usize> {
    // SAFETY: read-only open of a path we control; buffer bounds passed to
    // read explicitly.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDONLY);
        if fd < 0 {
            return None;
        }
        let n = libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
        libc::close(fd);
        if n <= 0 {
            None
        } else {
            Some(n as usize)
        }
    }
}

/// NUMA node of the current CPU (0 when unknown).
#[cfg(target_os = "linux")]
pub fn numa_node() -> i32 {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    // SAFETY: getcpu writes the two out-params and nothing else.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_getcpu,
            &mut cpu as *mut libc::c_uint,
            &mut node as *mut libc::c_uint,
            ptr::null_mut::<libc::c_void>(),
        )
    };
    if rc == 0 {
        node as i32
    } else {
        0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn numa_node() -> i32 {
    0
}

/// Number of NUMA nodes (at least 1), cached after the first probe.
pub fn numa_node_count() -> usize {
    static NODE_COUNT: AtomicUsize = AtomicUsize::new(0);
    let cached = NODE_COUNT.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let count = probe_numa_node_count().max(1);
    NODE_COUNT.store(count, Ordering::Relaxed);
    count
}

#[cfg(target_os = "linux")]
fn probe_numa_node_count() -> usize {
    // The file reads like "0" or "0-3".
    let mut buf = [0u8; 64];
    let path = c"/sys/devices/system/node/possible";
    let Some(n) = read_file(path, &mut buf) else {
        return 1;
    };
    let mut last = 0usize;
    let mut cur = 0usize;
    let mut saw_digit = false;
    for &b in &buf[..n] {
        if b.is_ascii_digit() {
            cur = cur * 10 + (b - b'0') as usize;
            saw_digit = true;
        } else {
            if saw_digit {
                last = cur;
            }
            cur = 0;
            saw_digit = false;
        }
    }
    if saw_digit {
        last = cur;
    }
    last + 1
}

#[cfg(not(target_os = "linux"))]
fn probe_numa_node_count() -> usize {
    1
}

/// Milliseconds from a monotonic clock.
pub fn clock_now() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes the out-param only.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

/// Fill `buf` with entropy. Falls back to /dev/urandom and finally to a
/// clock/address mix so callers always get *something* usable as a seed.
pub fn random_buf(buf: &mut [u8]) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: getrandom writes at most buf.len() bytes into buf.
        let n = unsafe { libc::getrandom(buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n == buf.len() as isize {
            return;
        }
    }
    let mut fbuf = [0u8; 64];
    if let Some(n) = read_file(c"/dev/urandom", &mut fbuf) {
        let take = n.min(buf.len());
        buf[..take].copy_from_slice(&fbuf[..take]);
        if take == buf.len() {
            return;
        }
    }
    // Last resort: mix the clock and a stack address.
    let mut seed = clock_now() as u64 ^ (buf.as_ptr() as u64).rotate_left(17);
    for b in buf.iter_mut() {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        *b = (seed >> 56) as u8;
    }
}

/// Whether the OS overcommits memory (influences eager arena commit).
#[cfg(target_os = "linux")]
pub fn has_overcommit() -> bool {
    let mut buf = [0u8; 8];
    match read_file(c"/proc/sys/vm/overcommit_memory", &mut buf) {
        // 0 = heuristic, 1 = always: both overcommit. 2 = strict.
        Some(_) => buf[0] == b'0' || buf[0] == b'1',
        None => true,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn has_overcommit() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::SEGMENT_ALIGN;

    #[test]
    fn test_alloc_aligned_returns_aligned_memory() {
        let (p, memid) = alloc_aligned(SEGMENT_ALIGN, SEGMENT_ALIGN, true, false).unwrap();
        assert_eq!(p.as_ptr() as usize % SEGMENT_ALIGN, 0);
        assert!(memid.initially_committed);
        assert!(memid.initially_zero);
        // SAFETY: committed region; write then read one byte.
        unsafe {
            p.as_ptr().write(0xAB);
            assert_eq!(p.as_ptr().read(), 0xAB);
            free(p.as_ptr(), SEGMENT_ALIGN, memid);
        }
    }

    #[test]
    fn test_reserve_then_commit() {
        let (p, memid) = alloc_aligned(1 << 20, 1 << 20, false, false).unwrap();
        assert!(!memid.initially_committed);
        commit(p.as_ptr(), 1 << 20).unwrap();
        // SAFETY: just committed.
        unsafe {
            p.as_ptr().write(7);
            assert_eq!(p.as_ptr().read(), 7);
            free(p.as_ptr(), 1 << 20, memid);
        }
    }

    #[test]
    fn test_decommit_then_recommit_reads_zero() {
        let (p, memid) = alloc_aligned(1 << 20, 1 << 20, true, false).unwrap();
        // SAFETY: committed region.
        unsafe { p.as_ptr().write(42) };
        let needs_recommit = decommit(p.as_ptr(), 1 << 20);
        assert!(needs_recommit);
        commit(p.as_ptr(), 1 << 20).unwrap();
        // SAFETY: recommitted; dropped pages read back zero-filled.
        unsafe {
            assert_eq!(p.as_ptr().read(), 0);
            free(p.as_ptr(), 1 << 20, memid);
        }
    }

    #[test]
    fn test_clock_is_monotonic() {
        let a = clock_now();
        let b = clock_now();
        assert!(b >= a);
    }

    #[test]
    fn test_random_buf_fills() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random_buf(&mut a);
        random_buf(&mut b);
        assert_ne!(a, b, "two entropy draws should differ");
    }

    #[test]
    fn test_numa_probes() {
        assert!(numa_node() >= 0);
        assert!(numa_node_count() >= 1);
    }

    #[test]
    fn test_page_size_sane() {
        let ps = page_size();
        assert!(ps.is_power_of_two());
        assert!(ps >= 4096);
    }

    #[test]
    fn test_memid_constructors() {
        assert_eq!(MemId::none().kind, MemKind::None);
        assert!(MemId::os(true, true, false).is_os_allocated());
        assert!(!MemId::external(true, false, false).is_os_allocated());
    }
}
