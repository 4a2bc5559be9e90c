use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::connection::ConnectionState;
use crate::Tick;

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), BastionError>`].
///
/// Two failure classes from the wire deliberately do **not** surface as errors
/// from the session API: malformed packets are dropped and logged (the state
/// machine stays where it is), and a command whose execution fails is logged
/// while ticking continues, because halting one peer would itself break
/// lockstep. The desync detector exists to catch the fallout of the latter.
///
/// [`Result<(), BastionError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq)]
pub enum BastionError {
    /// The remote peer speaks a different protocol version. Always fatal; the
    /// connection is closed with a reason naming both versions.
    ProtocolMismatch {
        /// The protocol version this session speaks.
        expected: u16,
        /// The protocol version the peer announced.
        received: u16,
    },
    /// An inbound packet could not be decoded or was structurally invalid.
    /// The packet is dropped; the connection stays in its current state.
    MalformedPacket {
        /// What failed to decode, for diagnostics.
        context: String,
    },
    /// Local and remote state fingerprints disagree. The session is frozen and
    /// must be rebuilt from a fresh authoritative snapshot.
    Desynchronized {
        /// The first tick of the mismatching comparison window.
        tick: Tick,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// The operation is not valid for the connection's current state.
    WrongState {
        /// The state the connection was in.
        state: ConnectionState,
        /// What was attempted.
        context: String,
    },
    /// The local unique-id block is exhausted and no replacement has been
    /// granted by the authority yet.
    IdExhausted,
}

impl Display for BastionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BastionError::ProtocolMismatch { expected, received } => {
                write!(
                    f,
                    "Protocol version mismatch: expected {}, peer announced {}.",
                    expected, received
                )
            }
            BastionError::MalformedPacket { context } => {
                write!(f, "Malformed packet dropped: {}", context)
            }
            BastionError::Desynchronized { tick } => {
                write!(
                    f,
                    "Simulation desynchronized at tick {}; session frozen pending reload.",
                    tick
                )
            }
            BastionError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            BastionError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
            BastionError::WrongState { state, context } => {
                write!(f, "Operation invalid in connection state {:?}: {}", state, context)
            }
            BastionError::IdExhausted => {
                write!(f, "Unique-id block exhausted; awaiting a new block from the authority.")
            }
        }
    }
}

impl Error for BastionError {}
