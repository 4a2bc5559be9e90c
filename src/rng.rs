//! Deterministic per-domain random number generation based on PCG32.
//!
//! Every simulation domain owns exactly one [`DomainRng`]. All randomness the
//! domain's logic consumes must be drawn from it: the generator is the single
//! source of nondeterminism-turned-determinism, and every draw is folded into a
//! running 32-bit window fingerprint. Two peers that make the same draws in the
//! same order therefore produce identical fingerprints, and the first divergent
//! draw shows up in the next sync opinion comparison.
//!
//! # PCG32 Algorithm
//!
//! PCG (Permuted Congruential Generator) is a family of simple, fast,
//! statistically good generators. The XSH-RR variant used here has 64 bits of
//! state and 32-bit output with a period of 2^64.
//!
//! Reference: <https://www.pcg-random.org/>
//!
//! # Usage
//!
//! ```rust
//! use bastion_lockstep::rng::DomainRng;
//!
//! let mut rng = DomainRng::seed_from_u64(12345);
//! let roll = rng.gen_range(0..100);
//! assert!(roll < 100);
//!
//! // Every draw advances the fold; peers compare these fingerprints.
//! let fingerprint = rng.window_hash();
//! assert_eq!(rng.draw_count(), 1);
//! # let _ = fingerprint;
//! ```

use serde::{Deserialize, Serialize};

use crate::hash::Fnv32;

/// Default increment for single-stream PCG32, from the PCG paper.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Multiplier constant for the LCG step of 64-bit-state PCG.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

/// The serializable generator state carried inside domain snapshots.
///
/// Restoring a domain from a snapshot restores this state verbatim, so a
/// joining peer continues the exact draw sequence the authority is on. The
/// window fold is deliberately *not* part of the snapshot: fingerprint windows
/// restart at the snapshot tick on every peer alike.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngSnapshot {
    /// Raw 64-bit PCG state.
    pub state: u64,
    /// Stream increment (always odd).
    pub inc: u64,
    /// Number of draws made so far.
    pub draws: u64,
}

/// The deterministic random number generator owned by one simulation domain.
///
/// A minimal PCG-XSH-RR implementation, extended with the bookkeeping the
/// desync detector needs: a draw counter and a running [`Fnv32`] fold of every
/// drawn value. NOT cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRng {
    state: u64,
    inc: u64,
    draws: u64,
    window: Fnv32,
}

impl DomainRng {
    /// Creates a new generator with the given state and stream.
    ///
    /// The increment must be odd; it is made odd by OR-ing with 1. Seeding
    /// follows the standard PCG procedure: zero state, one advance, add the
    /// seed, advance again.
    #[must_use]
    pub fn new(seed: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut state = 0u64.wrapping_mul(PCG_MULTIPLIER).wrapping_add(inc);
        state = state.wrapping_add(seed);
        state = state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(inc);
        Self {
            state,
            inc,
            draws: 0,
            window: Fnv32::new(),
        }
    }

    /// Creates a new generator seeded from a 64-bit value on the default stream.
    #[must_use]
    pub fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    /// Draws the next 32-bit random value.
    ///
    /// The drawn value is folded into the running window fingerprint and the
    /// draw counter is incremented.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        // XSH-RR output permutation (xor-shift, random rotate)
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        let value = xorshifted.rotate_right(rot);

        self.draws += 1;
        self.window.fold_u32(value);
        value
    }

    /// Draws the next 64-bit random value by combining two 32-bit draws.
    #[inline]
    #[must_use]
    pub fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }

    /// Draws a value uniformly distributed in `range`.
    ///
    /// Uses rejection sampling to avoid modulo bias, so the number of draws
    /// consumed can vary, but it varies identically on every peer, which is
    /// all lockstep requires.
    #[must_use]
    pub fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.saturating_sub(range.start);
        if span == 0 {
            return range.start;
        }
        // Largest multiple of span that fits in u32, for rejection sampling
        let zone = (u32::MAX - span + 1) % span;
        loop {
            let value = self.next_u32();
            if value >= zone {
                return range.start + (value % span);
            }
        }
    }

    /// Returns the total number of draws made since creation or restore.
    #[inline]
    #[must_use]
    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    /// Returns the running fingerprint of all draws since the last
    /// [`reset_window`](Self::reset_window).
    ///
    /// The tick driver reads this once per tick to build the per-window hash
    /// sequence carried in sync opinions.
    #[inline]
    #[must_use]
    pub fn window_hash(&self) -> u32 {
        self.window.value()
    }

    /// Resets the window fingerprint at an opinion-window boundary.
    ///
    /// Does not disturb the generator state or the draw counter.
    #[inline]
    pub fn reset_window(&mut self) {
        self.window.reset();
    }

    /// Captures the generator state for a domain snapshot.
    #[must_use]
    pub fn snapshot(&self) -> RngSnapshot {
        RngSnapshot {
            state: self.state,
            inc: self.inc,
            draws: self.draws,
        }
    }

    /// Restores the generator from a snapshot, restarting the window fold.
    #[must_use]
    pub fn from_snapshot(snapshot: RngSnapshot) -> Self {
        Self {
            state: snapshot.state,
            inc: snapshot.inc | 1,
            draws: snapshot.draws,
            window: Fnv32::new(),
        }
    }
}
