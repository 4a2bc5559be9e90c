//! Globally-unique object id allocation.
//!
//! Independently-ticking domains mint new simulation objects constantly; their
//! ids must never collide across peers. The authority hands each peer a
//! contiguous [`IdBlock`] at session start and grants replacements as the
//! cursor approaches the end, so id minting never needs a network round trip
//! on the hot path.

use serde::{Deserialize, Serialize};

/// Default number of ids in one block.
pub const DEFAULT_ID_BLOCK_SIZE: u64 = 4096;

/// Fraction of a block remaining at which renewal should be requested.
const RENEWAL_FRACTION: u64 = 5;

/// A contiguous range of globally-unique object identifiers reserved for one
/// peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdBlock {
    base: u64,
    size: u64,
    cursor: u64,
}

impl IdBlock {
    /// Creates a block covering `[base, base + size)`.
    #[must_use]
    pub const fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            cursor: 0,
        }
    }

    /// Mints the next id, or `None` when the block is exhausted.
    pub fn next(&mut self) -> Option<u64> {
        if self.cursor >= self.size {
            return None;
        }
        let id = self.base + self.cursor;
        self.cursor += 1;
        Some(id)
    }

    /// Ids left in this block.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.size - self.cursor
    }

    /// `true` once every id has been minted.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.cursor >= self.size
    }

    /// `true` when the cursor is close enough to the end that a replacement
    /// block should be requested from the authority.
    #[must_use]
    pub const fn needs_renewal(&self) -> bool {
        self.remaining() <= self.size / RENEWAL_FRACTION
    }

    /// First id of the block.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Total ids the block covers.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// Authority-side allocator handing out non-overlapping blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocator {
    next_base: u64,
    block_size: u64,
}

impl IdAllocator {
    /// Creates an allocator starting at `first_base` with the given block size.
    #[must_use]
    pub fn new(first_base: u64, block_size: u64) -> Self {
        Self {
            next_base: first_base,
            block_size: block_size.max(1),
        }
    }

    /// Reserves and returns the next block.
    pub fn allocate(&mut self) -> IdBlock {
        let block = IdBlock::new(self.next_base, self.block_size);
        self.next_base += self.block_size;
        block
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(0, DEFAULT_ID_BLOCK_SIZE)
    }
}
