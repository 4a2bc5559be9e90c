//! Desynchronization detection via windowed state fingerprints.
//!
//! Every peer folds its deterministic random draws (and executed commands)
//! into cheap 32-bit fingerprints, one reading per tick, grouped into fixed
//! windows. A window's worth of fingerprints forms an [`Opinion`]: one peer's
//! summary of what the simulation did during those ticks. Opinions from the
//! opposite origin are matched by their starting tick and compared; the first
//! disagreement freezes the session and captures a diagnostic bundle.
//!
//! The comparison reports the first differing window and domain. The true
//! root cause may predate the reported window without visible symptoms until
//! later: detection is sound (a difference is always reported), but the
//! reported location is where divergence became *visible*, not necessarily
//! where it began.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::SimDomain;
use crate::error::BastionError;
use crate::hash::Fnv32;
use crate::network::codec;
use crate::scheduler::ScheduledCommand;
use crate::snapshot::SessionBundle;
use crate::{DomainId, Tick};

/// How many opinions of one origin are buffered awaiting their counterparts.
pub const OPINION_BUFFER_CAP: usize = 30;

/// Which side of the comparison an opinion came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpinionOrigin {
    /// Produced by this peer's own simulation.
    Local,
    /// Received from the opposite peer over the wire.
    Remote,
}

/// One peer's windowed summary of simulation activity.
///
/// Created fresh each window, appended to a bounded ring, consumed and
/// discarded once matched against the opposite origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opinion {
    /// First tick covered by this window.
    pub start_tick: Tick,
    /// Which side produced it. Rewritten to [`OpinionOrigin::Remote`] on
    /// receipt regardless of what the wire says.
    pub origin: OpinionOrigin,
    /// Per-domain running random-draw fingerprints, one reading per tick.
    pub domain_hashes: BTreeMap<DomainId, Vec<u32>>,
    /// Aggregate executed-command fingerprints, one reading per tick.
    pub command_hashes: Vec<u32>,
    /// Optional diagnostic call-site hashes, bounded by the configured depth.
    pub trace_hashes: Vec<i64>,
}

/// Where two opinions for the same window first disagreed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MismatchKind {
    /// A domain's fingerprint sequences diverged (or have different lengths).
    DomainHashes {
        /// The first differing domain, in id order.
        domain: DomainId,
        /// Index of the first differing tick within the window.
        index: usize,
    },
    /// One side recorded a domain the other side does not know at all.
    MissingDomain {
        /// The domain present on only one side.
        domain: DomainId,
    },
    /// The aggregate command fingerprints diverged.
    CommandHashes {
        /// Index of the first differing tick within the window.
        index: usize,
    },
    /// The diagnostic trace hashes diverged (best-effort comparison).
    TraceHashes {
        /// Index of the first differing recorded hash.
        index: usize,
    },
}

/// Description of a confirmed fingerprint mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchReport {
    /// First tick of the window the opinions cover.
    pub start_tick: Tick,
    /// What diverged first.
    pub kind: MismatchKind,
}

impl std::fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            MismatchKind::DomainHashes { domain, index } => write!(
                f,
                "state fingerprints diverged in domain {} at tick {} (window starting {})",
                domain,
                self.start_tick + *index as u64,
                self.start_tick
            ),
            MismatchKind::MissingDomain { domain } => write!(
                f,
                "peers disagree about the existence of domain {} (window starting {})",
                domain, self.start_tick
            ),
            MismatchKind::CommandHashes { index } => write!(
                f,
                "executed-command fingerprints diverged at tick {} (window starting {})",
                self.start_tick + *index as u64,
                self.start_tick
            ),
            MismatchKind::TraceHashes { index } => write!(
                f,
                "diagnostic trace hashes diverged at index {} (window starting {})",
                index, self.start_tick
            ),
        }
    }
}

/// Compares two opinions covering the same window.
///
/// Checks, in order: per-domain fingerprint sequences (domains in id order),
/// the aggregate command fingerprints, then (best effort) diagnostic trace
/// hashes. Returns `None` on a full match.
#[must_use]
pub fn compare(a: &Opinion, b: &Opinion) -> Option<MismatchReport> {
    let start_tick = a.start_tick;

    let domains: std::collections::BTreeSet<DomainId> = a
        .domain_hashes
        .keys()
        .chain(b.domain_hashes.keys())
        .copied()
        .collect();

    for domain in domains {
        let (Some(seq_a), Some(seq_b)) = (a.domain_hashes.get(&domain), b.domain_hashes.get(&domain))
        else {
            return Some(MismatchReport {
                start_tick,
                kind: MismatchKind::MissingDomain { domain },
            });
        };
        if let Some(index) = first_divergence(seq_a, seq_b) {
            return Some(MismatchReport {
                start_tick,
                kind: MismatchKind::DomainHashes { domain, index },
            });
        }
    }

    if let Some(index) = first_divergence(&a.command_hashes, &b.command_hashes) {
        return Some(MismatchReport {
            start_tick,
            kind: MismatchKind::CommandHashes { index },
        });
    }

    // Trace hashes are best-effort: depths may be configured differently per
    // peer, so only the common prefix is comparable.
    if !a.trace_hashes.is_empty() && !b.trace_hashes.is_empty() {
        let common = a.trace_hashes.len().min(b.trace_hashes.len());
        for index in 0..common {
            if a.trace_hashes[index] != b.trace_hashes[index] {
                return Some(MismatchReport {
                    start_tick,
                    kind: MismatchKind::TraceHashes { index },
                });
            }
        }
    }

    None
}

fn first_divergence<T: PartialEq>(a: &[T], b: &[T]) -> Option<usize> {
    let common = a.len().min(b.len());
    for index in 0..common {
        if a[index] != b[index] {
            return Some(index);
        }
    }
    if a.len() != b.len() {
        return Some(common);
    }
    None
}

/// Everything persisted when a desync is confirmed: both opinions, a fresh
/// snapshot of current state, and the last tick both sides agreed on.
///
/// The embedding application writes the encoded bundle to disk for offline
/// divergence analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesyncBundle {
    /// This peer's opinion for the mismatching window.
    pub local: Opinion,
    /// The opposite peer's opinion for the same window.
    pub remote: Opinion,
    /// Where the comparison first diverged.
    pub report: MismatchReport,
    /// A snapshot of the session as it stood when the mismatch was confirmed.
    pub snapshot: SessionBundle,
    /// The last window start both sides fully agreed on, if any ever matched.
    pub last_good_tick: Option<Tick>,
}

impl DesyncBundle {
    /// Serializes the bundle for persistence.
    pub fn encode(&self) -> Result<Vec<u8>, BastionError> {
        codec::encode(self).map_err(|err| BastionError::SerializationError {
            context: format!("desync bundle: {}", err),
        })
    }

    /// Reads back a persisted bundle.
    pub fn decode(bytes: &[u8]) -> Result<Self, BastionError> {
        codec::decode::<DesyncBundle>(bytes)
            .map(|(bundle, _)| bundle)
            .map_err(|err| BastionError::MalformedPacket {
                context: format!("desync bundle: {}", err),
            })
    }
}

/// A confirmed mismatch together with the two opinions that produced it,
/// ready to be wrapped into a [`DesyncBundle`].
#[derive(Debug, Clone, PartialEq)]
pub struct DesyncFinding {
    /// Where the comparison first diverged.
    pub report: MismatchReport,
    /// The locally-produced opinion of the pair.
    pub local: Opinion,
    /// The remotely-produced opinion of the pair.
    pub remote: Opinion,
}

/// Collects per-origin opinions and matches them against the opposite origin.
///
/// The buffer only ever holds a single origin's backlog: whichever side is
/// currently ahead. Matching pops from both sides by equal start tick.
#[derive(Debug)]
pub struct DesyncDetector {
    buffer: VecDeque<Opinion>,
    capacity: usize,
    last_good: Option<Tick>,
    desynced: bool,
}

impl Default for DesyncDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DesyncDetector {
    /// Creates a detector with the default buffer capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(OPINION_BUFFER_CAP)
    }

    /// Creates a detector with an explicit buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(OPINION_BUFFER_CAP * 4)),
            capacity: capacity.max(1),
            last_good: None,
            desynced: false,
        }
    }

    /// The last window start both sides fully agreed on.
    #[must_use]
    pub fn last_good_tick(&self) -> Option<Tick> {
        self.last_good
    }

    /// `true` once a mismatch has been confirmed. Latched for the session's
    /// lifetime; only a full reload from a fresh snapshot clears it.
    #[must_use]
    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// Number of opinions awaiting their counterparts.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Latches the desync state without a local comparison, used when a peer
    /// reports a desync it confirmed on its side.
    pub fn mark_desynced(&mut self) {
        self.desynced = true;
    }

    /// Offers an opinion to the detector.
    ///
    /// Returns a finding on the **first** confirmed mismatch only; the desync
    /// latch makes every later mismatching pair silent, so freeze and
    /// diagnostics happen exactly once per session.
    pub fn try_add_opinion(&mut self, incoming: Opinion) -> Option<DesyncFinding> {
        if self.desynced {
            return None;
        }

        let same_origin = match self.buffer.front() {
            None => true,
            Some(front) => front.origin == incoming.origin,
        };

        if same_origin {
            if self.buffer.len() >= self.capacity {
                // The counterpart never showed up; drop the oldest rather
                // than grow without bound.
                if let Some(evicted) = self.buffer.pop_front() {
                    warn!(
                        "opinion buffer full; evicting unmatched {:?} opinion for window {}",
                        evicted.origin, evicted.start_tick
                    );
                }
            }
            self.buffer.push_back(incoming);
            return None;
        }

        // Opposite origin: age out buffered windows older than the incoming
        // one; their counterparts are gone for good.
        while let Some(front) = self.buffer.front() {
            if front.start_tick < incoming.start_tick {
                debug!(
                    "discarding stale {:?} opinion for window {} (incoming window is {})",
                    front.origin, front.start_tick, incoming.start_tick
                );
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        match self.buffer.front() {
            None => {
                // Everything buffered was older; the incoming opinion now
                // starts a backlog of its own origin.
                self.buffer.push_back(incoming);
                None
            }
            Some(front) if front.start_tick > incoming.start_tick => {
                // The incoming opinion is older than anything buffered; its
                // counterpart was already evicted.
                debug!(
                    "dropping stale {:?} opinion for window {}",
                    incoming.origin, incoming.start_tick
                );
                None
            }
            Some(_) => {
                let Some(buffered) = self.buffer.pop_front() else {
                    return None;
                };
                match compare(&buffered, &incoming) {
                    None => {
                        debug!("opinions for window {} match", incoming.start_tick);
                        self.last_good = Some(incoming.start_tick);
                        None
                    }
                    Some(report) => {
                        info!("desync confirmed: {}", report);
                        self.desynced = true;
                        let (local, remote) = if buffered.origin == OpinionOrigin::Local {
                            (buffered, incoming)
                        } else {
                            (incoming, buffered)
                        };
                        Some(DesyncFinding {
                            report,
                            local,
                            remote,
                        })
                    }
                }
            }
        }
    }
}

/// Bounded sink for diagnostic call-site hashes recorded during a window.
#[derive(Debug, Default)]
pub struct TraceSink {
    depth: usize,
    hashes: Vec<i64>,
}

impl TraceSink {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            depth,
            hashes: Vec::with_capacity(depth.min(64)),
        }
    }

    /// Records a hash unless the window's budget is already spent.
    pub fn record(&mut self, hash: i64) {
        if self.hashes.len() < self.depth {
            self.hashes.push(hash);
        }
    }

    fn drain(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.hashes)
    }
}

/// Accumulates one local opinion over the current window.
///
/// The tick driver feeds it once per completed tick; every `window` ticks it
/// emits a finished [`Opinion`] and restarts.
#[derive(Debug)]
pub(crate) struct OpinionWindow {
    window: u32,
    start_tick: Tick,
    ticks_recorded: u32,
    /// Ticks to let pass before recording resumes, so windows stay aligned to
    /// multiples of the window length after a mid-session restore.
    warmup: u64,
    domain_hashes: BTreeMap<DomainId, Vec<u32>>,
    command_fold: Fnv32,
    command_hashes: Vec<u32>,
    traces: TraceSink,
    trace_depth: usize,
}

impl OpinionWindow {
    pub(crate) fn new(window: u32, trace_depth: usize, start_tick: Tick) -> Self {
        Self {
            window: window.max(1),
            start_tick,
            ticks_recorded: 0,
            warmup: 0,
            domain_hashes: BTreeMap::new(),
            command_fold: Fnv32::new(),
            command_hashes: Vec::with_capacity(window as usize),
            traces: TraceSink::new(trace_depth),
            trace_depth,
        }
    }

    pub(crate) fn traces_mut(&mut self) -> &mut TraceSink {
        &mut self.traces
    }

    /// Folds an executed command into the window's aggregate fingerprint.
    pub(crate) fn fold_command(&mut self, cmd: &ScheduledCommand) {
        self.command_fold.fold_u64(cmd.tick.as_u64());
        self.command_fold.fold_u32(cmd.target.as_u32());
        self.command_fold.fold_u32(u32::from(cmd.kind.as_u16()));
        self.command_fold.fold_u64(cmd.seq);
        self.command_fold.fold_bytes(&cmd.payload);
    }

    /// Records the fingerprint readings for a just-completed tick; returns the
    /// finished opinion when the window is full.
    pub(crate) fn finish_tick(&mut self, domains: &mut [SimDomain]) -> Option<Opinion> {
        if self.warmup > 0 {
            self.warmup -= 1;
            if self.warmup == 0 {
                // Recording starts on the next tick with fresh folds.
                self.command_fold.reset();
                for domain in domains.iter_mut() {
                    domain.reset_window();
                }
            }
            return None;
        }
        for domain in domains.iter() {
            self.domain_hashes
                .entry(domain.id())
                .or_default()
                .push(domain.window_hash());
        }
        self.command_hashes.push(self.command_fold.value());
        self.ticks_recorded += 1;

        if self.ticks_recorded < self.window {
            return None;
        }

        let opinion = Opinion {
            start_tick: self.start_tick,
            origin: OpinionOrigin::Local,
            domain_hashes: std::mem::take(&mut self.domain_hashes),
            command_hashes: std::mem::take(&mut self.command_hashes),
            trace_hashes: self.traces.drain(),
        };

        self.start_tick += u64::from(self.window);
        self.ticks_recorded = 0;
        self.command_fold.reset();
        self.traces = TraceSink::new(self.trace_depth);
        for domain in domains.iter_mut() {
            domain.reset_window();
        }

        Some(opinion)
    }

    /// Restarts windowing after a restore at an arbitrary tick.
    ///
    /// Opinion windows must begin at multiples of the window length on every
    /// peer or start ticks would never line up for comparison, so recording
    /// resumes at the next aligned boundary and the ticks until then are let
    /// pass unrecorded.
    pub(crate) fn restart_at(&mut self, tick: Tick, domains: &mut [SimDomain]) {
        let window = u64::from(self.window);
        let offset = tick.as_u64() % window;
        self.warmup = if offset == 0 { 0 } else { window - offset };
        self.start_tick = tick + self.warmup;
        self.ticks_recorded = 0;
        self.domain_hashes.clear();
        self.command_hashes.clear();
        self.command_fold.reset();
        self.traces = TraceSink::new(self.trace_depth);
        for domain in domains.iter_mut() {
            domain.reset_window();
        }
    }
}
