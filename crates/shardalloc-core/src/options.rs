//! Runtime options.
//!
//! Every option has a compiled-in default and a `SHARDALLOC_<NAME>`
//! environment override. Values are read once, on first access, straight
//! from `getenv` bytes -- option parsing can run inside the first
//! allocation of the process, so it must not allocate.
//!
//! Booleans accept `1/0`, `on/off`, `true/false`, `yes/no`. Sizes accept a
//! `K`/`M`/`G` (or `KiB`/`MiB`/`GiB`) suffix.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use crate::diag::{self, AllocError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ShardOption {
    /// Milliseconds before freed ranges are purged; <0 never, 0 immediate.
    PurgeDelay = 0,
    /// Multiplier applied to `PurgeDelay` at the arena level.
    ArenaPurgeMult,
    /// Purge by decommitting (1) or by resetting only (0).
    PurgeDecommits,
    /// Reserve size for lazily created arenas, in bytes.
    ArenaReserve,
    /// 0 = commit on demand, 1 = eager, 2 = eager iff the OS overcommits.
    ArenaEagerCommit,
    /// Allow arenas backed by large/huge OS pages.
    AllowLargeOsPages,
    /// Bypass arenas entirely and allocate segments from the OS.
    DisallowArenaAlloc,
    /// Never fall back to OS allocation; fail when arenas are exhausted.
    DisallowOsAlloc,
    /// Reserve this many 1 GiB huge OS pages at startup.
    ReserveHugeOsPages,
    /// Adopt an abandoned segment when freeing into it.
    AbandonedReclaimOnFree,
}

const OPTION_COUNT: usize = 10;

struct OptionDesc {
    default: i64,
    env_name: &'static str,
}

static DESCS: [OptionDesc; OPTION_COUNT] = [
    OptionDesc {
        default: 10,
        env_name: "SHARDALLOC_PURGE_DELAY",
    },
    OptionDesc {
        default: 10,
        env_name: "SHARDALLOC_ARENA_PURGE_MULT",
    },
    OptionDesc {
        default: 1,
        env_name: "SHARDALLOC_PURGE_DECOMMITS",
    },
    OptionDesc {
        default: 1 << 30,
        env_name: "SHARDALLOC_ARENA_RESERVE",
    },
    OptionDesc {
        default: 2,
        env_name: "SHARDALLOC_ARENA_EAGER_COMMIT",
    },
    OptionDesc {
        default: 0,
        env_name: "SHARDALLOC_ALLOW_LARGE_OS_PAGES",
    },
    OptionDesc {
        default: 0,
        env_name: "SHARDALLOC_DISALLOW_ARENA_ALLOC",
    },
    OptionDesc {
        default: 0,
        env_name: "SHARDALLOC_DISALLOW_OS_ALLOC",
    },
    OptionDesc {
        default: 0,
        env_name: "SHARDALLOC_RESERVE_HUGE_OS_PAGES",
    },
    OptionDesc {
        default: 1,
        env_name: "SHARDALLOC_ABANDONED_RECLAIM_ON_FREE",
    },
];

const UNINIT: u8 = 0;
const INITED: u8 = 1;

static VALUES: [AtomicI64; OPTION_COUNT] = [const { AtomicI64::new(0) }; OPTION_COUNT];
static STATES: [AtomicU8; OPTION_COUNT] = [const { AtomicU8::new(UNINIT) }; OPTION_COUNT];

/// Current value of an option, loading the environment override on first
/// use.
pub fn get(opt: ShardOption) -> i64 {
    let idx = opt as usize;
    if STATES[idx].load(Ordering::Acquire) == INITED {
        return VALUES[idx].load(Ordering::Relaxed);
    }
    let desc = &DESCS[idx];
    let value = match env_value(desc.env_name) {
        Some(Ok(v)) => v,
        Some(Err(())) => {
            diag::report(AllocError::BadOptionValue);
            desc.default
        }
        None => desc.default,
    };
    VALUES[idx].store(value, Ordering::Relaxed);
    STATES[idx].store(INITED, Ordering::Release);
    value
}

/// Convenience for flag-style options.
pub fn is_enabled(opt: ShardOption) -> bool {
    get(opt) != 0
}

/// Programmatic override; wins over both default and environment.
pub fn set(opt: ShardOption, value: i64) {
    let idx = opt as usize;
    VALUES[idx].store(value, Ordering::Relaxed);
    STATES[idx].store(INITED, Ordering::Release);
}

/// Reset to "unread" so the next `get` re-evaluates (tests only).
#[cfg(test)]
pub fn reset(opt: ShardOption) {
    STATES[opt as usize].store(UNINIT, Ordering::Release);
}

/// Read and parse one environment variable. `None` when unset,
/// `Some(Err(()))` when set but unparseable.
fn env_value(name: &str) -> Option<Result<i64, ()>> {
    let mut cname = [0u8; 64];
    debug_assert!(name.len() < cname.len());
    cname[..name.len()].copy_from_slice(name.as_bytes());
    // SAFETY: cname is NUL-terminated (zero-initialized tail). getenv
    // returns a pointer into the environment block or null.
    let raw = unsafe { libc::getenv(cname.as_ptr().cast()) };
    if raw.is_null() {
        return None;
    }
    // SAFETY: getenv results are NUL-terminated strings.
    let bytes = unsafe { std::ffi::CStr::from_ptr(raw) }.to_bytes();
    Some(parse(bytes).ok_or(()))
}

/// Parse a signed number with optional size suffix, or a boolean word.
fn parse(s: &[u8]) -> Option<i64> {
    let s = trim(s);
    if s.is_empty() {
        return None;
    }
    match to_lower::<8>(s).as_deref() {
        Some(b"on") | Some(b"true") | Some(b"yes") => return Some(1),
        Some(b"off") | Some(b"false") | Some(b"no") => return Some(0),
        _ => {}
    }

    let (neg, digits) = match s[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    let mut consumed = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as i64)?;
        consumed += 1;
    }
    if consumed == 0 {
        return None;
    }
    let suffix = trim(&digits[consumed..]);
    let scale: i64 = match to_lower::<4>(suffix).as_deref() {
        Some(b"") => 1,
        Some(b"k") | Some(b"kib") => 1 << 10,
        Some(b"m") | Some(b"mib") => 1 << 20,
        Some(b"g") | Some(b"gib") => 1 << 30,
        Some(b"kb") => 1_000,
        Some(b"mb") => 1_000_000,
        Some(b"gb") => 1_000_000_000,
        _ => return None,
    };
    let value = value.checked_mul(scale)?;
    Some(if neg { -value } else { value })
}

fn trim(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}

/// Lowercase into a fixed buffer; `None` when the input does not fit.
fn to_lower<const N: usize>(s: &[u8]) -> Option<LowerBuf<N>> {
    if s.len() > N {
        return None;
    }
    let mut buf = [0u8; N];
    for (d, &b) in buf.iter_mut().zip(s) {
        *d = b.to_ascii_lowercase();
    }
    Some(LowerBuf { buf, len: s.len() })
}

struct LowerBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> std::ops::Deref for LowerBuf<N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(get(ShardOption::ArenaPurgeMult), 10);
        assert_eq!(get(ShardOption::ArenaReserve), 1 << 30);
        assert!(is_enabled(ShardOption::PurgeDecommits));
        assert!(!is_enabled(ShardOption::DisallowArenaAlloc));
    }

    #[test]
    fn test_set_overrides() {
        set(ShardOption::ReserveHugeOsPages, 4);
        assert_eq!(get(ShardOption::ReserveHugeOsPages), 4);
        set(ShardOption::ReserveHugeOsPages, 0);
    }

    #[test]
    fn test_parse_plain_numbers() {
        assert_eq!(parse(b"0"), Some(0));
        assert_eq!(parse(b"123"), Some(123));
        assert_eq!(parse(b"-5"), Some(-5));
        assert_eq!(parse(b"+7"), Some(7));
        assert_eq!(parse(b" 42 "), Some(42));
    }

    #[test]
    fn test_parse_booleans() {
        assert_eq!(parse(b"on"), Some(1));
        assert_eq!(parse(b"TRUE"), Some(1));
        assert_eq!(parse(b"no"), Some(0));
        assert_eq!(parse(b"Off"), Some(0));
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse(b"1k"), Some(1 << 10));
        assert_eq!(parse(b"2MiB"), Some(2 << 20));
        assert_eq!(parse(b"1GiB"), Some(1 << 30));
        assert_eq!(parse(b"3KB"), Some(3_000));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse(b""), None);
        assert_eq!(parse(b"abc"), None);
        assert_eq!(parse(b"12parsecs"), None);
        assert_eq!(parse(b"--3"), None);
    }

    #[test]
    fn test_env_override_is_read_once() {
        // SAFETY: single-threaded mutation in tests; the variable is unique
        // to this test.
        unsafe { std::env::set_var("SHARDALLOC_ALLOW_LARGE_OS_PAGES", "on") };
        reset(ShardOption::AllowLargeOsPages);
        assert!(is_enabled(ShardOption::AllowLargeOsPages));
        // SAFETY: as above.
        unsafe { std::env::remove_var("SHARDALLOC_ALLOW_LARGE_OS_PAGES") };
        // Still cached.
        assert!(is_enabled(ShardOption::AllowLargeOsPages));
        set(ShardOption::AllowLargeOsPages, 0);
    }
}
