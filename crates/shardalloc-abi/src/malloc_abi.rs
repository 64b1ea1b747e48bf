//! ABI layer for the memory allocation functions (`malloc`, `free`,
//! `calloc`, `realloc`, and the aligned/introspection variants).
//!
//! Every function delegates to `shardalloc_core` and takes care of the C
//! contract details: errno on failure, the null/zero-size edge cases, and
//! POSIX's argument validation for the aligned allocators.

use std::ffi::c_void;
use std::ptr::null_mut;

use crate::set_errno;

// ---------------------------------------------------------------------------
// malloc / calloc / realloc / free
// ---------------------------------------------------------------------------

/// `malloc(size)` -- allocate `size` bytes of uninitialized memory.
///
/// `malloc(0)` returns a valid unique pointer that is safe to `free`.
/// Returns null with `errno == ENOMEM` on exhaustion.
///
/// # Safety
///
/// Caller must eventually free the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_malloc(size: usize) -> *mut c_void {
    let p = shardalloc_core::malloc(size);
    if p.is_null() {
        set_errno(libc::ENOMEM);
    }
    p.cast()
}

/// `free(ptr)` -- release memory from this allocator. `free(NULL)` is a
/// no-op; unknown pointers are reported and dropped, never dereferenced.
///
/// # Safety
///
/// `ptr` must be null or a pointer from this allocator, freed only once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_free(ptr: *mut c_void) {
    // SAFETY: caller contract.
    unsafe { shardalloc_core::free(ptr.cast()) };
}

/// `calloc(nmemb, size)` -- zeroed array allocation; overflow of the
/// element product fails with `ENOMEM`.
///
/// # Safety
///
/// Caller must eventually free the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        set_errno(libc::ENOMEM);
        return null_mut();
    };
    let p = shardalloc_core::zalloc(total);
    if p.is_null() {
        set_errno(libc::ENOMEM);
    }
    p.cast()
}

/// `realloc(ptr, size)` -- resize an allocation.
///
/// - `realloc(NULL, n)` behaves like `malloc(n)`.
/// - `realloc(p, 0)` returns a minimum-size allocation (not null) and
///   releases `p`.
/// - On failure the original pointer is untouched and null is returned
///   with `errno == ENOMEM`.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator; on a
/// successful move the old pointer is invalid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: caller contract.
    let p = unsafe { shardalloc_core::realloc(ptr.cast(), size) };
    if p.is_null() {
        set_errno(libc::ENOMEM);
    }
    p.cast()
}

/// `reallocarray(ptr, nmemb, size)` -- `realloc` with overflow-checked
/// element count (OpenBSD extension, adopted by glibc).
///
/// # Safety
///
/// As for [`sh_realloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_reallocarray(
    ptr: *mut c_void,
    nmemb: usize,
    size: usize,
) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        set_errno(libc::ENOMEM);
        return null_mut();
    };
    // SAFETY: caller contract.
    unsafe { sh_realloc(ptr, total) }
}

// ---------------------------------------------------------------------------
// Aligned allocation
// ---------------------------------------------------------------------------

/// `aligned_alloc(alignment, size)` -- ISO C11: `alignment` must be a
/// power of two and `size` a multiple of it; violations return null with
/// `errno == EINVAL`.
///
/// # Safety
///
/// Caller must eventually free the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    if alignment == 0 || !alignment.is_power_of_two() || size % alignment != 0 {
        set_errno(libc::EINVAL);
        return null_mut();
    }
    let p = shardalloc_core::malloc_aligned(size, alignment);
    if p.is_null() {
        set_errno(libc::ENOMEM);
    }
    p.cast()
}

/// `posix_memalign(memptr, alignment, size)` -- POSIX aligned allocation.
/// Returns an error code instead of using errno; `*memptr` is only
/// written on success.
///
/// # Safety
///
/// `memptr` must be a valid writable pointer slot.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> i32 {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    if !alignment.is_power_of_two() || alignment < size_of::<*mut c_void>() {
        return libc::EINVAL;
    }
    let p = shardalloc_core::malloc_aligned(size, alignment);
    if p.is_null() {
        return libc::ENOMEM;
    }
    // SAFETY: caller contract.
    unsafe { *memptr = p.cast() };
    0
}

/// `valloc(size)` -- page-aligned allocation (legacy).
///
/// # Safety
///
/// Caller must eventually free the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_valloc(size: usize) -> *mut c_void {
    let p = shardalloc_core::malloc_aligned(size, shardalloc_core::os::page_size());
    if p.is_null() {
        set_errno(libc::ENOMEM);
    }
    p.cast()
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

/// `malloc_usable_size(ptr)` -- usable bytes behind `ptr` (0 for null or
/// foreign pointers).
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_malloc_usable_size(ptr: *mut c_void) -> usize {
    shardalloc_core::usable_size(ptr.cast())
}

/// Drain deferred frees and release unused memory back to the OS.
///
/// # Safety
///
/// Callable from any thread at any time.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_collect(force: bool) {
    shardalloc_core::collect(force);
}

// ---------------------------------------------------------------------------
// Unprefixed aliases (opt-in override of the system allocator)
// ---------------------------------------------------------------------------

#[cfg(feature = "override")]
mod override_abi {
    use super::*;

    /// # Safety
    /// As for [`sh_malloc`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
        // SAFETY: same contract.
        unsafe { sh_malloc(size) }
    }

    /// # Safety
    /// As for [`sh_free`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        // SAFETY: same contract.
        unsafe { sh_free(ptr) }
    }

    /// # Safety
    /// As for [`sh_calloc`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        // SAFETY: same contract.
        unsafe { sh_calloc(nmemb, size) }
    }

    /// # Safety
    /// As for [`sh_realloc`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        // SAFETY: same contract.
        unsafe { sh_realloc(ptr, size) }
    }

    /// # Safety
    /// As for [`sh_reallocarray`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn reallocarray(
        ptr: *mut c_void,
        nmemb: usize,
        size: usize,
    ) -> *mut c_void {
        // SAFETY: same contract.
        unsafe { sh_reallocarray(ptr, nmemb, size) }
    }

    /// # Safety
    /// As for [`sh_aligned_alloc`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
        // SAFETY: same contract.
        unsafe { sh_aligned_alloc(alignment, size) }
    }

    /// # Safety
    /// As for [`sh_posix_memalign`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn posix_memalign(
        memptr: *mut *mut c_void,
        alignment: usize,
        size: usize,
    ) -> i32 {
        // SAFETY: same contract.
        unsafe { sh_posix_memalign(memptr, alignment, size) }
    }

    /// # Safety
    /// As for [`sh_malloc_usable_size`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
        // SAFETY: same contract.
        unsafe { sh_malloc_usable_size(ptr) }
    }
}
