//! Binary codec for network message and snapshot serialization.
//!
//! This module provides a centralized interface for encoding and decoding
//! with bincode. It encapsulates the bincode configuration so every byte the
//! crate produces (wire messages, snapshot bundles, desync diagnostics) is
//! serialized identically on every peer and platform.
//!
//! Fixed-size integer encoding is non-negotiable here: variable-length
//! encodings would still round-trip, but fingerprinted artifacts (snapshot
//! bytes feed compression and checksums) must be byte-identical everywhere.
//!
//! The wire framing is `{u32 length} {payload}`; the message type tag is the
//! first bytes of the payload, courtesy of bincode's enum encoding.
//!
//! # Examples
//!
//! ```
//! use bastion_lockstep::network::codec::{encode, decode};
//!
//! let data: u32 = 42;
//! let bytes = encode(&data).expect("encoding should succeed");
//! let (decoded, _bytes_read): (u32, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(data, decoded);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Fixed-int encoding keeps message and snapshot sizes deterministic across
// peers; the config itself is computed at compile time.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Frames larger than this are rejected before allocation. Generous enough
/// for a full snapshot bundle, small enough to stop a hostile length prefix
/// from reserving gigabytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Errors that can occur during encoding or decoding.
///
/// Bincode's own errors are opaque (only a `Display` implementation), so the
/// underlying reason is carried as a message string. Codec failures are
/// exceptional (corrupted data or a protocol mismatch), never hot-path.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    Encode {
        /// The underlying bincode error message.
        message: String,
    },
    /// The decoding operation failed.
    Decode {
        /// The underlying bincode error message.
        message: String,
    },
    /// A framed message's length prefix exceeded [`MAX_FRAME_LEN`].
    FrameTooLarge {
        /// The length the prefix claimed.
        claimed: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { message } => write!(f, "encoding failed: {message}"),
            Self::Decode { message } => write!(f, "decoding failed: {message}"),
            Self::FrameTooLarge { claimed } => {
                write!(f, "frame length prefix of {claimed} bytes exceeds the maximum")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CodecError::Encode {
        message: e.to_string(),
    })
}

/// Decodes a value from a byte slice.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| CodecError::Decode {
        message: e.to_string(),
    })
}

/// Encodes a value as a length-prefixed frame for stream transports.
pub fn frame<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let payload = encode(value)?;
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

/// Attempts to read one length-prefixed frame from the front of `buffer`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame
/// (read more bytes and retry), and `Ok(Some((value, consumed)))` once it
/// does, where `consumed` covers the prefix plus the payload.
pub fn deframe<T: DeserializeOwned>(buffer: &[u8]) -> CodecResult<Option<(T, usize)>> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&buffer[..4]);
    let length = u32::from_le_bytes(prefix) as usize;
    if length > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { claimed: length });
    }
    if buffer.len() < 4 + length {
        return Ok(None);
    }
    let (value, consumed) = decode(&buffer[4..4 + length])?;
    if consumed != length {
        return Err(CodecError::Decode {
            message: format!("frame declared {length} bytes but payload decoded {consumed}"),
        });
    }
    Ok(Some((value, 4 + length)))
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: encode/decode round-trips arbitrary byte payloads
        #[test]
        fn prop_roundtrip_bytes(data in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let bytes = encode(&data).expect("encode");
            let (decoded, _): (Vec<u8>, _) = decode(&bytes).expect("decode");
            prop_assert_eq!(decoded, data);
        }

        /// Property: framing round-trips and reports exact consumption
        #[test]
        fn prop_frame_roundtrip(value in any::<u64>()) {
            let framed = frame(&value).expect("frame");
            let (decoded, consumed): (u64, _) =
                deframe(&framed).expect("deframe").expect("complete");
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, framed.len());
        }
    }
}
