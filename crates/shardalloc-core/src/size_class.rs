//! Size classes and allocator geometry.
//!
//! Small requests are rounded up to word-granular bins (8..=64 bytes), and
//! everything above that follows a geometric schedule with eight bins per
//! power-of-two doubling, i.e. at most 12.5% internal fragmentation. The
//! schedule is exactly invertible: `bin_size(bin_index(n))` is the smallest
//! bin that holds `n` for every in-range `n`.
//!
//! The same module fixes the segment/page geometry the bins map onto:
//! 4 MiB segments aligned to their own size, carrying either 64 small pages
//! of 64 KiB (blocks <= 1 KiB), 8 medium pages of 512 KiB (blocks <= 128 KiB),
//! or a single page for large and huge blocks.

pub const WORD_SIZE: usize = 8;

/// Segments are aligned to their own size so that masking the low bits of
/// any interior pointer recovers the segment header.
pub const SEGMENT_SHIFT: usize = 22;
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT; // 4 MiB
pub const SEGMENT_ALIGN: usize = SEGMENT_SIZE;
pub const SEGMENT_MASK: usize = SEGMENT_SIZE - 1;

pub const SMALL_PAGE_SHIFT: usize = 16; // 64 KiB
pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;
pub const SMALL_PAGES_PER_SEGMENT: usize = SEGMENT_SIZE / SMALL_PAGE_SIZE; // 64

pub const MEDIUM_PAGE_SHIFT: usize = 19; // 512 KiB
pub const MEDIUM_PAGE_SIZE: usize = 1 << MEDIUM_PAGE_SHIFT;
pub const MEDIUM_PAGES_PER_SEGMENT: usize = SEGMENT_SIZE / MEDIUM_PAGE_SIZE; // 8

/// Largest block served from a small page.
pub const SMALL_OBJ_MAX: usize = 1024;
/// Largest block served from a medium page.
pub const MEDIUM_OBJ_MAX: usize = 128 * 1024;
/// Largest block served from a single-page 4 MiB segment; beyond this the
/// segment itself is sized to the request (huge).
pub const LARGE_OBJ_MAX: usize = SEGMENT_SIZE / 2;

const MEDIUM_OBJ_WSIZE_MAX: usize = MEDIUM_OBJ_MAX / WORD_SIZE;

/// Number of sized bins (1..=BIN_SIZED_MAX); bin 0 is unused.
pub const BIN_SIZED_MAX: usize = 96;
/// Queue anchor for large and huge single-page segments.
pub const BIN_HUGE: usize = BIN_SIZED_MAX + 1;
/// Queue anchor for pages whose `free` list ran empty.
pub const BIN_FULL: usize = BIN_HUGE + 1;
/// Total number of page queues per heap.
pub const QUEUE_COUNT: usize = BIN_FULL + 1;

/// One `pages_direct` slot per 8-byte step up to `SMALL_OBJ_MAX`, plus the
/// zero-size slot.
pub const PAGES_DIRECT_COUNT: usize = SMALL_OBJ_MAX / WORD_SIZE + 1;

/// Request size in words, never zero.
#[inline]
pub const fn wsize_of(size: usize) -> usize {
    if size == 0 {
        1
    } else {
        size.div_ceil(WORD_SIZE)
    }
}

/// `pages_direct` slot for a small request. Callers guarantee
/// `size <= SMALL_OBJ_MAX`.
#[inline]
pub const fn direct_index(size: usize) -> usize {
    (size + WORD_SIZE - 1) / WORD_SIZE
}

/// Map a request size to its bin.
///
/// Word-granular up to 8 words; above that the bin number encodes three
/// sub-bin bits per doubling. Sizes past `MEDIUM_OBJ_MAX` all map to
/// `BIN_HUGE` since their pages are never shared between blocks.
#[inline]
pub const fn bin_index(size: usize) -> usize {
    let wsize = wsize_of(size);
    if wsize <= 8 {
        wsize
    } else if wsize > MEDIUM_OBJ_WSIZE_MAX {
        BIN_HUGE
    } else {
        // Round into eight sub-bins per doubling: take the top three bits
        // below the leading one.
        let w = wsize - 1;
        let b = (usize::BITS - 1 - w.leading_zeros()) as usize;
        ((b << 3) + ((w >> (b - 3)) & 7)) - 15
    }
}

/// Block size of a sized bin (the inverse of `bin_index`).
///
/// Only meaningful for `1..=BIN_SIZED_MAX`; queue anchors have no size.
#[inline]
pub const fn bin_size(bin: usize) -> usize {
    if bin <= 8 {
        bin * WORD_SIZE
    } else {
        let group = (bin - 9) / 8;
        let sub = (bin - 9) % 8;
        ((9 + sub) << group) * WORD_SIZE
    }
}

/// Page categories; the category decides the page shift and the segment
/// layout: small and medium pages share a 4 MiB segment, a large block
/// fills one, and a huge block gets a segment sized to the request.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum PageKind {
    Small,
    Medium,
    Large,
    Huge,
}

impl PageKind {
    #[inline]
    pub const fn of_size(size: usize) -> PageKind {
        if size <= SMALL_OBJ_MAX {
            PageKind::Small
        } else if size <= MEDIUM_OBJ_MAX {
            PageKind::Medium
        } else if size <= LARGE_OBJ_MAX {
            PageKind::Large
        } else {
            PageKind::Huge
        }
    }

    /// log2 of the page size within a segment. Large and huge segments hold
    /// a single page, so their shift is the whole segment.
    #[inline]
    pub const fn page_shift(self) -> usize {
        match self {
            PageKind::Small => SMALL_PAGE_SHIFT,
            PageKind::Medium => MEDIUM_PAGE_SHIFT,
            PageKind::Large | PageKind::Huge => SEGMENT_SHIFT,
        }
    }

    #[inline]
    pub const fn pages_per_segment(self) -> usize {
        match self {
            PageKind::Small => SMALL_PAGES_PER_SEGMENT,
            PageKind::Medium => MEDIUM_PAGES_PER_SEGMENT,
            PageKind::Large | PageKind::Huge => 1,
        }
    }
}

/// Round an address or size up to a power-of-two alignment.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

const _: () = assert!(SEGMENT_SIZE.is_power_of_two());
const _: () = assert!(SMALL_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MEDIUM_PAGE_SIZE.is_power_of_two());
const _: () = assert!(bin_index(SMALL_OBJ_MAX) <= BIN_SIZED_MAX);
const _: () = assert!(bin_index(MEDIUM_OBJ_MAX) == BIN_SIZED_MAX);
const _: () = assert!(bin_size(BIN_SIZED_MAX) == MEDIUM_OBJ_MAX);
const _: () = assert!(bin_index(MEDIUM_OBJ_MAX + 1) == BIN_HUGE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_index_word_range() {
        assert_eq!(bin_index(0), 1);
        assert_eq!(bin_index(1), 1);
        assert_eq!(bin_index(8), 1);
        assert_eq!(bin_index(9), 2);
        assert_eq!(bin_index(64), 8);
    }

    #[test]
    fn test_bin_index_geometric_start() {
        assert_eq!(bin_index(65), 9);
        assert_eq!(bin_index(72), 9);
        assert_eq!(bin_index(73), 10);
        assert_eq!(bin_index(128), 16);
        assert_eq!(bin_index(129), 17);
        assert_eq!(bin_index(144), 17);
    }

    #[test]
    fn test_bin_index_huge() {
        assert_eq!(bin_index(MEDIUM_OBJ_MAX), BIN_SIZED_MAX);
        assert_eq!(bin_index(MEDIUM_OBJ_MAX + 1), BIN_HUGE);
        assert_eq!(bin_index(usize::MAX), BIN_HUGE);
    }

    #[test]
    fn test_bin_size_round_trip() {
        for bin in 1..=BIN_SIZED_MAX {
            let size = bin_size(bin);
            assert_eq!(
                bin_index(size),
                bin,
                "bin {} (size {}) must round-trip",
                bin,
                size
            );
            // One past the bin size lands in the next bin.
            if bin < BIN_SIZED_MAX {
                assert_eq!(bin_index(size + 1), bin + 1);
            }
        }
    }

    #[test]
    fn test_bin_size_monotonic() {
        for bin in 2..=BIN_SIZED_MAX {
            assert!(
                bin_size(bin) > bin_size(bin - 1),
                "bin {} ({}) must be > bin {} ({})",
                bin,
                bin_size(bin),
                bin - 1,
                bin_size(bin - 1)
            );
        }
    }

    #[test]
    fn test_bin_spacing_bounded() {
        // Geometric bins are spaced at most 12.5% apart.
        for bin in 10..=BIN_SIZED_MAX {
            let prev = bin_size(bin - 1);
            let next = bin_size(bin);
            assert!(
                next - prev <= prev / 8 + WORD_SIZE,
                "bin {} spacing too wide: {} -> {}",
                bin,
                prev,
                next
            );
        }
    }

    #[test]
    fn test_every_size_fits_its_bin() {
        for size in 1..=MEDIUM_OBJ_MAX {
            let bin = bin_index(size);
            assert!(bin >= 1 && bin <= BIN_SIZED_MAX);
            assert!(
                bin_size(bin) >= size,
                "size {} assigned to bin {} of only {} bytes",
                size,
                bin,
                bin_size(bin)
            );
        }
    }

    #[test]
    fn test_direct_index_covers_small_range() {
        assert_eq!(direct_index(0), 0);
        assert_eq!(direct_index(1), 1);
        assert_eq!(direct_index(8), 1);
        assert_eq!(direct_index(1024), PAGES_DIRECT_COUNT - 1);
    }

    #[test]
    fn test_page_kind_boundaries() {
        assert_eq!(PageKind::of_size(1), PageKind::Small);
        assert_eq!(PageKind::of_size(SMALL_OBJ_MAX), PageKind::Small);
        assert_eq!(PageKind::of_size(SMALL_OBJ_MAX + 1), PageKind::Medium);
        assert_eq!(PageKind::of_size(MEDIUM_OBJ_MAX), PageKind::Medium);
        assert_eq!(PageKind::of_size(MEDIUM_OBJ_MAX + 1), PageKind::Large);
        assert_eq!(PageKind::of_size(LARGE_OBJ_MAX), PageKind::Large);
        assert_eq!(PageKind::of_size(LARGE_OBJ_MAX + 1), PageKind::Huge);
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
    }
}
