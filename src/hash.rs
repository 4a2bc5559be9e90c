//! Deterministic hashing utilities.
//!
//! This module provides the incremental 32-bit FNV-1a hasher used to fold
//! random draws, executed commands, and diagnostic trace hashes into per-window
//! state fingerprints. Unlike `std::collections::hash_map::DefaultHasher`,
//! which uses a random seed, this hasher is a fixed algorithm: every peer must
//! fold the same sequence of values to the same fingerprint or sync opinions
//! would never match.
//!
//! # Why 32 bits?
//!
//! A window fingerprint is recorded once per tick per domain and shipped over
//! the wire inside every sync opinion. 32 bits keeps opinions small; collision
//! resistance only has to be good enough that a genuine divergence is unlikely
//! to go unnoticed for many consecutive windows, not cryptographic.
//!
//! # Usage
//!
//! ```
//! use bastion_lockstep::hash::Fnv32;
//!
//! let mut hasher = Fnv32::new();
//! hasher.fold_u32(0xdead_beef);
//! hasher.fold_bytes(b"command payload");
//! let fingerprint = hasher.value();
//!
//! // Same fold sequence always produces the same fingerprint
//! let mut hasher2 = Fnv32::new();
//! hasher2.fold_u32(0xdead_beef);
//! hasher2.fold_bytes(b"command payload");
//! assert_eq!(fingerprint, hasher2.value());
//! ```

/// FNV-1a 32-bit offset basis constant.
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a 32-bit prime constant.
const FNV_PRIME: u32 = 0x0100_0193;

/// An incremental, deterministic 32-bit FNV-1a hasher.
///
/// The hasher can be read out with [`value`](Fnv32::value) at any point and
/// continue folding afterwards; the tick driver reads the running value once
/// per tick to build the per-window fingerprint sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fnv32 {
    state: u32,
}

impl Fnv32 {
    /// Creates a new hasher with the standard FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    /// Returns the current running hash value without consuming the hasher.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.state
    }

    /// Resets the hasher to the offset basis.
    #[inline]
    pub fn reset(&mut self) {
        self.state = FNV_OFFSET_BASIS;
    }

    /// Folds raw bytes into the running hash.
    #[inline]
    pub fn fold_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u32::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    /// Folds a `u32` into the running hash, little-endian byte order.
    #[inline]
    pub fn fold_u32(&mut self, value: u32) {
        self.fold_bytes(&value.to_le_bytes());
    }

    /// Folds a `u64` into the running hash, little-endian byte order.
    #[inline]
    pub fn fold_u64(&mut self, value: u64) {
        self.fold_bytes(&value.to_le_bytes());
    }
}

impl Default for Fnv32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the FNV-1a 32-bit hash of a byte slice in one call.
///
/// # Example
///
/// ```
/// use bastion_lockstep::hash::fnv1a_32;
///
/// let hash = fnv1a_32(b"some bytes");
/// assert_eq!(hash, fnv1a_32(b"some bytes"));
/// assert_ne!(hash, fnv1a_32(b"other bytes"));
/// ```
#[inline]
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hasher = Fnv32::new();
    hasher.fold_bytes(bytes);
    hasher.value()
}
