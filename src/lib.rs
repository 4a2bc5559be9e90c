//! # Bastion Lockstep
//!
//! Bastion Lockstep is a deterministic lockstep session library written in 100% safe Rust.
//! Many peers advance the same discrete-time simulation in exact lockstep over an
//! unreliable network; the moment any peer's state diverges from the others', the
//! session detects it, freezes, and captures a diagnostic bundle.
//!
//! The library deliberately owns no sockets and no game logic. The embedding
//! application implements [`Tickable`] for each independently-clocked simulation
//! partition ("domain"), moves wire [`Message`]s between peers with its transport of
//! choice, and drains [`BastionEvent`]s each frame. Everything in between, from command
//! scheduling and tick pacing to catch-up, join transfer, and desync detection,
//! is handled by the [`Session`].

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use config::{SessionConfig, SessionConfigBuilder};
pub use desync::{
    DesyncBundle, DesyncDetector, DesyncFinding, MismatchKind, MismatchReport, Opinion,
    OpinionOrigin,
};
pub use domain::{SimDomain, TickContext, Tickable};
pub use error::BastionError;
pub use id_block::{IdAllocator, IdBlock};
pub use network::connection::{ConnId, Connection, ConnectionState, DisconnectReason};
pub use network::inbound::{InboundQueue, InboundSender};
pub use network::messages::{DefCategory, DefsManifest, Message};
pub use rng::DomainRng;
pub use scheduler::{CommandKind, CommandRegistry, CommandScheduler, ScheduledCommand};
pub use session::{DomainFactory, Session, SessionRole};
pub use snapshot::{DomainSnapshot, NamedEvent, SessionBundle};

pub mod compress;
pub mod config;
pub mod desync;
pub mod domain;
#[doc(hidden)]
pub mod driver;
#[doc(hidden)]
pub mod error;
pub mod hash;
pub mod id_block;
pub mod rng;
pub mod scheduler;
pub mod session;
pub mod snapshot;
#[doc(hidden)]
pub mod network {
    /// Binary codec for network message and snapshot serialization.
    ///
    /// Provides centralized encoding and decoding using bincode with a fixed,
    /// deterministic configuration.
    pub mod codec;
    #[doc(hidden)]
    pub mod connection;
    #[doc(hidden)]
    pub mod inbound;
    #[doc(hidden)]
    pub mod messages;
}

// #############
// # CONSTANTS #
// #############

/// The simulation advances at a fixed rate of 60 ticks per simulated second.
///
/// Real elapsed time is converted to pending simulation time at this rate by the
/// tick driver; domains running at a faster [`SimSpeed`] step multiple times per
/// global tick rather than changing this base rate.
pub const TICKS_PER_SECOND: u32 = 60;

/// A tick is a single step of the global simulation clock.
///
/// Ticks start at 0 and increment sequentially. Every peer in a session executes
/// the same commands at the same tick, so tick numbers are meaningful across the
/// whole session, not just locally.
///
/// # Type Safety
///
/// `Tick` is a newtype wrapper around `u64` that prevents accidentally mixing
/// tick counts with other integers, and provides the arithmetic the tick driver
/// and scheduler need.
///
/// # Examples
///
/// ```
/// use bastion_lockstep::Tick;
///
/// let tick = Tick::ZERO;
/// let later = tick + 30;
/// assert_eq!(later.as_u64(), 30);
/// assert_eq!(later.since(tick), 30);
/// assert!(later > tick);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Tick(u64);

impl Tick {
    /// The first tick of a freshly-hosted session.
    pub const ZERO: Tick = Tick(0);

    /// Creates a new `Tick` from a `u64` value.
    #[inline]
    #[must_use]
    pub const fn new(tick: u64) -> Self {
        Tick(tick)
    }

    /// Returns the underlying `u64` value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the number of ticks between `earlier` and `self`, saturating at
    /// zero if `earlier` is actually later.
    #[inline]
    #[must_use]
    pub const fn since(self, earlier: Tick) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u64> for Tick {
    type Output = Tick;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Tick(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u64> for Tick {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl From<u64> for Tick {
    #[inline]
    fn from(value: u64) -> Self {
        Tick(value)
    }
}

impl From<Tick> for u64 {
    #[inline]
    fn from(tick: Tick) -> Self {
        tick.0
    }
}

impl PartialEq<u64> for Tick {
    #[inline]
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u64> for Tick {
    #[inline]
    fn partial_cmp(&self, other: &u64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A unique identifier for an independently-clocked simulation partition.
///
/// A domain is typically "the world" or a single map. Domains own their command
/// queue, clock position, and deterministic random state exclusively; nothing
/// else in the session mutates them directly.
///
/// The reserved value [`DomainId::GLOBAL`] identifies the session-wide partition:
/// commands scoped to the whole session (rather than one map) are scheduled into
/// the queue of whichever domain registers under this id.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct DomainId(u32);

impl DomainId {
    /// The reserved id of the session-wide partition ("global" command scope).
    pub const GLOBAL: DomainId = DomainId(u32::MAX);

    /// Creates a new `DomainId` from a `u32` value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        DomainId(id)
    }

    /// Returns the underlying `u32` value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` if this is the reserved session-wide id.
    #[inline]
    #[must_use]
    pub const fn is_global(self) -> bool {
        self.0 == u32::MAX
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_global() {
            write!(f, "global")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A unique identifier for a player in a session, assigned by the authority
/// during the join handshake.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerId(u32);

impl PlayerId {
    /// Creates a new `PlayerId` from a `u32` value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        PlayerId(id)
    }

    /// Returns the underlying `u32` value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// #############
// #   ENUMS   #
// #############

/// The configured speed of a domain.
///
/// The speed determines how many domain steps are performed per global tick via
/// the rate multiplier. When domains are not configured to tick independently,
/// the whole session locksteps to the slowest domain's multiplier.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum SimSpeed {
    /// The domain does not step at all.
    Paused,
    /// One domain step per global tick.
    #[default]
    Normal,
    /// Three domain steps per global tick.
    Fast,
    /// Six domain steps per global tick.
    Superfast,
}

impl SimSpeed {
    /// The canonical rate multiplier for this speed.
    ///
    /// [`Tickable::rate_multiplier`] defaults to this mapping; domains may
    /// override it, but an override must be a pure function of speed and
    /// deterministic domain state or peers will diverge.
    #[inline]
    #[must_use]
    pub const fn multiplier(self) -> f32 {
        match self {
            SimSpeed::Paused => 0.0,
            SimSpeed::Normal => 1.0,
            SimSpeed::Fast => 3.0,
            SimSpeed::Superfast => 6.0,
        }
    }
}

/// Notifications that you can receive from the session. Handling them is up to the user.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]` because new event types may be
/// added in future versions. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum BastionEvent {
    /// The authority accepted a peer's handshake and manifest and began the
    /// snapshot transfer.
    JoinStarted {
        /// The transport connection of the joining peer.
        conn: ConnId,
        /// The player id assigned by the authority.
        player: PlayerId,
        /// The username announced in the handshake.
        username: String,
    },
    /// This client received its snapshot and is now fast-forwarding to the
    /// authoritative tick bound.
    CatchUpStarted {
        /// The player id this client was assigned.
        player: PlayerId,
        /// The tick the received snapshot was taken at.
        snapshot_tick: Tick,
        /// The authoritative bound being skipped to.
        target: Tick,
    },
    /// A peer finished catching up and is now playing.
    PeerPlaying {
        /// The transport connection of the peer.
        conn: ConnId,
        /// The peer's player id.
        player: PlayerId,
    },
    /// A skip (fast-forward) reached its target tick.
    SkipCompleted {
        /// The tick the session landed on.
        tick: Tick,
    },
    /// A skip was cancelled before reaching its target; the session is parked
    /// on a tick boundary.
    SkipCancelled {
        /// The tick the session landed on.
        tick: Tick,
    },
    /// A scheduled command arrived too late to be executed deterministically
    /// and was dropped.
    CommandDropped {
        /// The domain the command targeted.
        target: DomainId,
        /// The tick the command was stamped for.
        tick: Tick,
        /// The domain's clock position at the time of rejection.
        clock: Tick,
    },
    /// Local and remote state fingerprints disagree: the simulation has
    /// diverged. The session is frozen; retrieve the diagnostic bundle via
    /// [`Session::take_desync_bundle`].
    ///
    /// Reported at most once per session.
    DesyncDetected {
        /// The first tick of the mismatching comparison window.
        tick: Tick,
        /// Where the comparison first diverged.
        report: MismatchReport,
    },
    /// A peer confirmed a desync on its side and announced it. The session is
    /// frozen; no local diagnostic bundle exists, the reporting peer has it.
    DesyncNoticed {
        /// The window tick the peer reported.
        tick: Tick,
    },
    /// A connection left the session.
    Disconnected {
        /// The transport connection that closed.
        conn: ConnId,
        /// Why it closed.
        reason: DisconnectReason,
    },
    /// The authoritative tick bound was raised.
    TimeBoundRaised {
        /// The new bound; the simulation may now advance up to (but not past) it.
        tick_until: Tick,
    },
}

// ###################
// # UNIT TESTS      #
// ###################
