//! Small deterministic PRNG for scheduling decisions.
//!
//! Used only to pick the starting arena for the abandoned-segment cursor,
//! so quality requirements are modest: xorshift64* is enough. Seeding goes
//! through `os::random_buf` with a clock/address fallback so a failed
//! entropy source never blocks allocation.

use std::cell::Cell;

pub struct Rng {
    state: Cell<u64>,
}

impl Rng {
    pub const fn zeroed() -> Rng {
        Rng {
            state: Cell::new(0),
        }
    }

    /// (Re)seed. A zero seed would make xorshift degenerate, so it is
    /// nudged to a fixed odd constant.
    pub fn seed(&self, seed: u64) {
        self.state
            .set(if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed });
    }

    #[inline]
    pub fn is_seeded(&self) -> bool {
        self.state.get() != 0
    }

    /// Next value, xorshift64* step.
    #[inline]
    pub fn next(&self) -> u64 {
        let mut x = self.state.get();
        if x == 0 {
            x = 0x9e37_79b9_7f4a_7c15;
        }
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Uniform-ish value in `0..bound` (`bound > 0`).
    #[inline]
    pub fn next_below(&self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}
