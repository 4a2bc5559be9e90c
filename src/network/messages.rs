use serde::{Deserialize, Serialize};

use crate::id_block::IdBlock;
use crate::{DomainId, PlayerId, Tick};

/// Number of bytes of a serialized opinion carried per fragment.
///
/// Opinions grow with the number of domains and the diagnostic depth, so they
/// are split into fragments that fit comfortably inside one datagram.
pub const OPINION_FRAGMENT_LEN: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    /// The wire protocol version of the sender. Checked on every message; a
    /// mismatch is fatal in every connection state.
    pub protocol_version: u16,
}

/// Opening announcement of a connecting client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct Handshake {
    pub protocol_version: u16,
    pub username: String,
}

/// One category of the definitions manifest: a count and an order-sensitive
/// hash over the category's content, not the content itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefCategory {
    /// Category name ("things", "recipes", ...).
    pub name: String,
    /// Number of definitions in the category.
    pub count: u32,
    /// Deterministic hash over the category's definitions.
    pub hash: u64,
}

/// Per-category counts and hashes, exchanged in both directions so each side
/// can validate mod/version compatibility cheaply before any state transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DefsManifest {
    /// All categories, in a fixed order agreed by convention.
    pub categories: Vec<DefCategory>,
}

impl DefsManifest {
    /// Returns the name of the first category that differs from `other`, or
    /// `None` when the manifests are compatible.
    #[must_use]
    pub fn first_difference(&self, other: &DefsManifest) -> Option<String> {
        if self.categories.len() != other.categories.len() {
            return Some("category count".to_owned());
        }
        for (mine, theirs) in self.categories.iter().zip(&other.categories) {
            if mine != theirs {
                return Some(mine.name.clone());
            }
        }
        None
    }
}

/// Full state transfer for a joining peer: the encoded session bundle plus
/// the identity and id range assigned to the new player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    /// An encoded [`SessionBundle`](crate::SessionBundle).
    pub bundle: Vec<u8>,
    pub player_id: PlayerId,
    pub id_block: IdBlock,
    pub tick_until: Tick,
}

/// A command admitted (or, from a client, requested) for scheduled execution.
///
/// From client to authority, `tick` and `seq` are zero placeholders: the
/// authority stamps both before re-broadcasting, and peers never execute a
/// command they stamped themselves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommandBroadcast {
    pub tick: Tick,
    pub target: DomainId,
    pub kind: u16,
    pub payload: Vec<u8>,
    pub seq: u64,
    pub player: PlayerId,
}

/// Raises the receiver's authoritative tick bound.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct TimeBound {
    pub tick_until: Tick,
}

/// Periodic liveness exchange. The authority sends with a fresh `echo`; the
/// client answers with the same `echo` and its packed pacing status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct KeepAlive {
    pub echo: u32,
    /// `(ticks_behind << 1) | is_skipping`, see [`pack_status`].
    pub status: u32,
}

/// Packs a keep-alive status word: ticks-behind in the upper 31 bits, the
/// skip flag in the lowest bit.
#[inline]
#[must_use]
pub(crate) fn pack_status(ticks_behind: u32, is_skipping: bool) -> u32 {
    (ticks_behind << 1) | u32::from(is_skipping)
}

/// Unpacks a keep-alive status word into `(ticks_behind, is_skipping)`.
#[inline]
#[must_use]
pub(crate) fn unpack_status(status: u32) -> (u32, bool) {
    (status >> 1, status & 1 == 1)
}

/// One fragment of a serialized sync opinion.
///
/// Fragments arrive in order on a reliable transport; the connection
/// reassembles `total` of them before decoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct OpinionFragment {
    pub index: u16,
    pub total: u16,
    pub bytes: Vec<u8>,
}

/// A peer announcing it confirmed a desync locally; the session freezes on
/// both ends with the same diagnostic window.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct DesyncNotice {
    pub tick: Tick,
}

/// Grants a fresh unique-id block to a client approaching exhaustion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IdBlockGrant {
    pub block: IdBlock,
}

/// Terminates a connection with a reason the far side can display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Disconnect {
    pub reason: crate::network::connection::DisconnectReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    Handshake(Handshake),
    DefsManifest(DefsManifest),
    Snapshot(Snapshot),
    CommandBroadcast(CommandBroadcast),
    TimeBound(TimeBound),
    KeepAlive(KeepAlive),
    SyncOpinion(OpinionFragment),
    DesyncNotice(DesyncNotice),
    IdBlockRequest,
    IdBlockGrant(IdBlockGrant),
    Disconnect(Disconnect),
}

impl MessageBody {
    /// Short name for logging.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            MessageBody::Handshake(_) => "Handshake",
            MessageBody::DefsManifest(_) => "DefsManifest",
            MessageBody::Snapshot(_) => "Snapshot",
            MessageBody::CommandBroadcast(_) => "CommandBroadcast",
            MessageBody::TimeBound(_) => "TimeBound",
            MessageBody::KeepAlive(_) => "KeepAlive",
            MessageBody::SyncOpinion(_) => "SyncOpinion",
            MessageBody::DesyncNotice(_) => "DesyncNotice",
            MessageBody::IdBlockRequest => "IdBlockRequest",
            MessageBody::IdBlockGrant(_) => "IdBlockGrant",
            MessageBody::Disconnect(_) => "Disconnect",
        }
    }
}

/// A message exchanged between session peers.
///
/// The embedding transport moves these opaquely: serialize with
/// [`codec::frame`] for stream transports or [`codec::encode`] for
/// datagram transports, and hand received ones to the session's inbound
/// queue.
///
/// [`codec::frame`]: crate::network::codec::frame
/// [`codec::encode`]: crate::network::codec::encode
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}

impl Message {
    pub(crate) fn new(protocol_version: u16, body: MessageBody) -> Self {
        Self {
            header: MessageHeader { protocol_version },
            body,
        }
    }
}
