//! Error reporting.
//!
//! The allocator never aborts on a recoverable inconsistency: a double
//! free, an unrecognized pointer, or a failed commit is reported and the
//! offending operation is dropped. Reports go to a process-wide hook if one
//! is registered, otherwise to stderr with a hard cap on the number of
//! lines ever written (a corrupted program could emit reports in a loop).
//!
//! Reporting must not allocate -- it can run inside a failing allocation --
//! so formatting goes through a fixed stack buffer and a raw `write(2)`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use thiserror::Error;

/// Recoverable allocator faults, with the errno-style code each maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
    #[error("double free of {ptr:#x}")]
    DoubleFree { ptr: usize },
    #[error("free of unknown pointer {ptr:#x}")]
    InvalidPointer { ptr: usize },
    #[error("commit of {size} bytes failed")]
    CommitFailed { size: usize },
    #[error("purge failed; range stays scheduled")]
    PurgeFailed,
    #[error("invalid alignment {align}")]
    BadAlignment { align: usize },
    #[error("unparseable option value in environment")]
    BadOptionValue,
}

impl AllocError {
    /// The errno value an embedding C layer should surface.
    pub fn errno(&self) -> i32 {
        match self {
            AllocError::OutOfMemory { .. } | AllocError::CommitFailed { .. } => libc::ENOMEM,
            AllocError::DoubleFree { .. } => libc::EAGAIN,
            AllocError::InvalidPointer { .. }
            | AllocError::BadAlignment { .. }
            | AllocError::BadOptionValue => libc::EINVAL,
            AllocError::PurgeFailed => libc::EAGAIN,
        }
    }
}

pub type ErrorHook = fn(&AllocError);

static ERROR_HOOK: AtomicUsize = AtomicUsize::new(0);
static ERROR_COUNT: AtomicU32 = AtomicU32::new(0);

/// Stop writing to stderr after this many reports.
const MAX_STDERR_REPORTS: u32 = 16;

/// Install (or with `None`, remove) the process-wide error hook.
pub fn set_error_hook(hook: Option<ErrorHook>) {
    let raw = hook.map_or(0, |f| f as usize);
    ERROR_HOOK.store(raw, Ordering::Release);
}

/// Report a recoverable fault. Never panics, never allocates.
pub fn report(err: AllocError) {
    let raw = ERROR_HOOK.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: the only writer stores a valid `fn(&AllocError)` (or 0).
        let hook: ErrorHook = unsafe { std::mem::transmute(raw) };
        hook(&err);
        return;
    }

    let n = ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
    if n >= MAX_STDERR_REPORTS {
        return;
    }

    let mut buf = StackBuf::new();
    let _ = write!(buf, "shardalloc: warning: {} (errno {})\n", err, err.errno());
    buf.write_to_stderr();
    if n + 1 == MAX_STDERR_REPORTS {
        let mut buf = StackBuf::new();
        let _ = write!(buf, "shardalloc: warning: further reports suppressed\n");
        buf.write_to_stderr();
    }
}

/// Fixed-size formatting buffer; overflow truncates.
struct StackBuf {
    buf: [u8; 192],
    len: usize,
}

impl StackBuf {
    fn new() -> StackBuf {
        StackBuf {
            buf: [0; 192],
            len: 0,
        }
    }

    fn write_to_stderr(&self) {
        // SAFETY: the buffer holds `len` initialized bytes; write(2) on fd 2
        // has no memory effects beyond reading them.
        unsafe {
            libc::write(2, self.buf.as_ptr().cast(), self.len);
        }
    }
}

impl std::fmt::Write for StackBuf {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        let avail = self.buf.len() - self.len;
        let take = s.len().min(avail);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static HOOK_HITS: AtomicUsize = AtomicUsize::new(0);

    fn counting_hook(_err: &AllocError) {
        HOOK_HITS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(AllocError::OutOfMemory { size: 1 }.errno(), libc::ENOMEM);
        assert_eq!(AllocError::DoubleFree { ptr: 0x10 }.errno(), libc::EAGAIN);
        assert_eq!(
            AllocError::InvalidPointer { ptr: 0x10 }.errno(),
            libc::EINVAL
        );
        assert_eq!(AllocError::BadAlignment { align: 3 }.errno(), libc::EINVAL);
    }

    #[test]
    fn test_hook_receives_reports() {
        set_error_hook(Some(counting_hook));
        let before = HOOK_HITS.load(Ordering::Relaxed);
        report(AllocError::PurgeFailed);
        report(AllocError::OutOfMemory { size: 64 });
        assert_eq!(HOOK_HITS.load(Ordering::Relaxed), before + 2);
        set_error_hook(None);
    }

    #[test]
    fn test_display_is_stable() {
        let msg = AllocError::DoubleFree { ptr: 0xdead }.to_string();
        assert!(msg.contains("0xdead"), "got: {}", msg);
    }

    #[test]
    fn test_stack_buf_truncates() {
        let mut buf = StackBuf::new();
        let long = "x".repeat(500);
        let _ = write!(buf, "{}", long);
        assert_eq!(buf.len, buf.buf.len());
    }
}
