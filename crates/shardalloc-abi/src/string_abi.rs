//! ABI layer for the string duplication helpers that allocate.

use std::ffi::c_char;
use std::ptr::null_mut;

use crate::set_errno;

/// `strdup(s)` -- duplicate a NUL-terminated string into allocator
/// memory.
///
/// # Safety
///
/// `s` must be a valid NUL-terminated string; the result must eventually
/// be freed exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_strdup(s: *const c_char) -> *mut c_char {
    if s.is_null() {
        return null_mut();
    }
    // SAFETY: caller contract (valid NUL-terminated string).
    let len = unsafe { libc::strlen(s) };
    let p = shardalloc_core::malloc(len + 1);
    if p.is_null() {
        set_errno(libc::ENOMEM);
        return null_mut();
    }
    // SAFETY: source holds len + 1 readable bytes (including the NUL),
    // destination was just allocated with the same size.
    unsafe { std::ptr::copy_nonoverlapping(s.cast::<u8>(), p, len + 1) };
    p.cast()
}

/// `strndup(s, n)` -- duplicate at most `n` bytes of `s`, always
/// NUL-terminating the copy.
///
/// # Safety
///
/// `s` must point to at least `min(strlen(s), n)` readable bytes; the
/// result must eventually be freed exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sh_strndup(s: *const c_char, n: usize) -> *mut c_char {
    if s.is_null() {
        return null_mut();
    }
    // SAFETY: strnlen reads at most n bytes per the caller contract.
    let len = unsafe { libc::strnlen(s, n) };
    let p = shardalloc_core::malloc(len + 1);
    if p.is_null() {
        set_errno(libc::ENOMEM);
        return null_mut();
    }
    // SAFETY: len bytes are readable from s; p holds len + 1 bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(s.cast::<u8>(), p, len);
        p.add(len).write(0);
    }
    p.cast()
}

#[cfg(feature = "override")]
mod override_abi {
    use super::*;

    /// # Safety
    /// As for [`sh_strdup`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn strdup(s: *const c_char) -> *mut c_char {
        // SAFETY: same contract.
        unsafe { sh_strdup(s) }
    }

    /// # Safety
    /// As for [`sh_strndup`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn strndup(s: *const c_char, n: usize) -> *mut c_char {
        // SAFETY: same contract.
        unsafe { sh_strndup(s, n) }
    }
}
