//! Run-length compression for snapshot state bytes.
//!
//! Domain snapshots are dominated by long zero runs and other repeated byte
//! patterns, so a byte-oriented run-length scheme recovers most of the easy
//! redundancy at negligible cost. The format is classic PackBits:
//!
//! - control `0..=127`: copy the next `control + 1` bytes literally
//! - control `129..=255`: repeat the next byte `257 - control` times
//! - control `128`: no-op (never produced by [`encode`], tolerated by [`decode`])
//!
//! Encoding is deterministic: the same input always yields the same output, so
//! compressed snapshot bytes can safely participate in checksums.
//!
//! # Usage
//!
//! ```
//! use bastion_lockstep::compress::{encode, decode};
//!
//! let state = vec![0u8; 500];
//! let packed = encode(&state);
//! assert!(packed.len() < state.len());
//! assert_eq!(decode(&packed).expect("valid stream"), state);
//! ```

/// Longest run or literal block one control byte can describe.
const MAX_BLOCK: usize = 128;

/// Errors produced by [`decode`] on a malformed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompressError {
    /// A literal block's control byte promised more bytes than the stream holds.
    TruncatedLiteral {
        /// Offset of the offending control byte.
        offset: usize,
    },
    /// A repeat control byte was not followed by the byte to repeat.
    TruncatedRun {
        /// Offset of the offending control byte.
        offset: usize,
    },
}

impl std::fmt::Display for CompressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TruncatedLiteral { offset } => {
                write!(f, "truncated literal block at offset {}", offset)
            }
            Self::TruncatedRun { offset } => write!(f, "truncated run at offset {}", offset),
        }
    }
}

impl std::error::Error for CompressError {}

/// Compresses `data` with PackBits run-length encoding.
///
/// Runs of three or more identical bytes become a two-byte repeat block;
/// everything else is emitted as literal blocks of up to 128 bytes. Empty
/// input encodes to empty output.
#[must_use]
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 8);
    let mut literal_start = 0;
    let mut i = 0;

    while i < data.len() {
        // Measure the run starting here, capped at one control byte's worth
        let byte = data[i];
        let mut run = 1;
        while run < MAX_BLOCK && i + run < data.len() && data[i + run] == byte {
            run += 1;
        }

        if run >= 3 {
            flush_literals(&mut out, &data[literal_start..i]);
            out.push((257 - run) as u8);
            out.push(byte);
            i += run;
            literal_start = i;
        } else {
            i += run;
        }
    }

    flush_literals(&mut out, &data[literal_start..]);
    out
}

fn flush_literals(out: &mut Vec<u8>, mut literals: &[u8]) {
    while !literals.is_empty() {
        let take = literals.len().min(MAX_BLOCK);
        out.push((take - 1) as u8);
        out.extend_from_slice(&literals[..take]);
        literals = &literals[take..];
    }
}

/// Decompresses a PackBits stream produced by [`encode`].
///
/// Rejects truncated streams instead of panicking; snapshot bytes arrive off
/// the network and cannot be trusted to be well-formed.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut i = 0;

    while i < data.len() {
        let control = data[i];
        if control == 128 {
            i += 1;
        } else if control < 128 {
            let count = usize::from(control) + 1;
            let start = i + 1;
            let end = start + count;
            if end > data.len() {
                return Err(CompressError::TruncatedLiteral { offset: i });
            }
            out.extend_from_slice(&data[start..end]);
            i = end;
        } else {
            let count = 257 - usize::from(control);
            let Some(&byte) = data.get(i + 1) else {
                return Err(CompressError::TruncatedRun { offset: i });
            };
            out.resize(out.len() + count, byte);
            i += 2;
        }
    }

    Ok(out)
}
