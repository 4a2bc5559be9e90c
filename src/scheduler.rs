//! Deterministic scheduling of externally-triggered commands.
//!
//! A command becomes visible to a domain only after the session authority has
//! stamped it with an execution tick and an insertion sequence number. Every
//! peer inserts the same commands with the same `(tick, seq)` key, so each
//! domain's queue is byte-for-byte identical across the session and same-tick
//! ties resolve identically everywhere.
//!
//! Commands whose stamped tick has already passed the target domain's clock
//! can no longer be executed at the same point on every peer; they are dropped
//! and the drop is counted and logged rather than treated as fatal.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::{DomainId, Tick};

/// A closed command-kind tag.
///
/// Kinds are registered once at session startup in a [`CommandRegistry`];
/// decoding a command payload is then a table lookup, never runtime type
/// inspection. The numeric tag travels on the wire.
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
    Serialize,
    Deserialize,
)]
pub struct CommandKind(u16);

impl CommandKind {
    /// Creates a new `CommandKind` from a `u16` tag.
    #[inline]
    #[must_use]
    pub const fn new(tag: u16) -> Self {
        CommandKind(tag)
    }

    /// Returns the underlying `u16` tag.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An externally-triggered action stamped for execution at an exact tick.
///
/// Immutable once created; lives in exactly one domain's queue until executed,
/// then discarded. The ordering key is `(tick, seq)`; `seq` is assigned by
/// the authority at admission, so ties at the same tick resolve identically on
/// every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    /// The global tick this command executes at.
    pub tick: Tick,
    /// The domain whose queue holds the command ([`DomainId::GLOBAL`] for
    /// session-scoped commands).
    pub target: DomainId,
    /// The registered kind tag.
    pub kind: CommandKind,
    /// Opaque payload, decoded by the domain's kind table.
    pub payload: Vec<u8>,
    /// Authority-assigned insertion sequence, the same-tick tie-breaker.
    pub seq: u64,
    /// Whether this peer originally issued the command. Local bookkeeping
    /// only; never serialized.
    #[serde(skip)]
    pub issued_by_self: bool,
}

impl ScheduledCommand {
    /// The ordering key shared by every peer's queues.
    #[inline]
    #[must_use]
    pub fn key(&self) -> (Tick, u64) {
        (self.tick, self.seq)
    }
}

/// A decoder/validator for one command kind's payload.
pub type PayloadCheck = fn(&[u8]) -> bool;

struct KindEntry {
    name: &'static str,
    check: Option<PayloadCheck>,
}

/// The closed set of command kinds a session understands.
///
/// Built once at startup and never mutated afterwards; admission of a kind
/// that was never registered is logged and dropped.
#[derive(Default)]
pub struct CommandRegistry {
    kinds: BTreeMap<CommandKind, KindEntry>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command kind under a diagnostic name.
    pub fn register(&mut self, kind: CommandKind, name: &'static str) {
        self.register_with_check(kind, name, None);
    }

    /// Registers a command kind with a payload validity check, applied at
    /// admission before the command enters any queue.
    pub fn register_with_check(
        &mut self,
        kind: CommandKind,
        name: &'static str,
        check: Option<PayloadCheck>,
    ) {
        if self.kinds.insert(kind, KindEntry { name, check }).is_some() {
            warn!("command kind {} registered twice; keeping latest", kind);
        }
    }

    /// Returns the diagnostic name of a registered kind.
    #[must_use]
    pub fn name_of(&self, kind: CommandKind) -> Option<&'static str> {
        self.kinds.get(&kind).map(|entry| entry.name)
    }

    /// Returns `true` if the kind is registered and its payload passes the
    /// kind's check (if any).
    #[must_use]
    pub fn admits(&self, kind: CommandKind, payload: &[u8]) -> bool {
        match self.kinds.get(&kind) {
            Some(entry) => entry.check.map_or(true, |check| check(payload)),
            None => false,
        }
    }

    /// Number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns `true` if no kinds are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("kinds", &self.kinds.len())
            .finish()
    }
}

/// The result of offering a command to the scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub enum EnqueueOutcome {
    /// The command was inserted into its domain's queue.
    Accepted,
    /// The command's tick has already passed the domain's clock; execution
    /// order can no longer be guaranteed, so it was dropped.
    RejectedStale {
        /// The domain's clock position at rejection time.
        clock: Tick,
    },
    /// The command's kind is not in the registry (or its payload failed the
    /// kind's check).
    RejectedUnknownKind,
    /// No queue exists for the target domain.
    RejectedUnknownDomain,
}

impl EnqueueOutcome {
    /// Returns `true` for [`EnqueueOutcome::Accepted`].
    #[inline]
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, EnqueueOutcome::Accepted)
    }
}

/// Owns the per-domain ordered command queues: the single authorized write
/// path into domain command lists.
pub struct CommandScheduler {
    queues: BTreeMap<DomainId, VecDeque<ScheduledCommand>>,
    registry: CommandRegistry,
    next_seq: u64,
    dropped: u64,
}

impl CommandScheduler {
    /// Creates a scheduler over the given (already complete) kind registry.
    #[must_use]
    pub fn new(registry: CommandRegistry) -> Self {
        Self {
            queues: BTreeMap::new(),
            registry,
            next_seq: 0,
            dropped: 0,
        }
    }

    /// Creates the (empty) queue for a domain. Called when the domain is
    /// registered with the session.
    pub fn add_domain(&mut self, domain: DomainId) {
        self.queues.entry(domain).or_default();
    }

    /// Drops a domain's queue together with every pending command in it.
    pub fn remove_domain(&mut self, domain: DomainId) {
        self.queues.remove(&domain);
    }

    /// Clears all pending commands everywhere (session teardown).
    pub fn clear(&mut self) {
        for queue in self.queues.values_mut() {
            queue.clear();
        }
    }

    /// Returns the next authority-side insertion sequence number.
    ///
    /// Only the authority mints sequence numbers; clients take them from the
    /// broadcast.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// The kind registry this scheduler admits against.
    #[must_use]
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Inserts a stamped command into its domain's queue, maintaining
    /// `(tick, seq)` ascending order.
    ///
    /// `domain_clock` is the target domain's current clock position; a command
    /// stamped below it is rejected (logged, counted, never fatal).
    pub fn enqueue(&mut self, cmd: ScheduledCommand, domain_clock: Tick) -> EnqueueOutcome {
        if !self.registry.admits(cmd.kind, &cmd.payload) {
            warn!(
                "dropping command of unregistered kind {} for domain {}",
                cmd.kind, cmd.target
            );
            self.dropped += 1;
            return EnqueueOutcome::RejectedUnknownKind;
        }

        let Some(queue) = self.queues.get_mut(&cmd.target) else {
            warn!("dropping command for unknown domain {}", cmd.target);
            self.dropped += 1;
            return EnqueueOutcome::RejectedUnknownDomain;
        };

        if cmd.tick < domain_clock {
            warn!(
                "dropping stale command for domain {}: stamped tick {} but clock is already {}",
                cmd.target, cmd.tick, domain_clock
            );
            self.dropped += 1;
            return EnqueueOutcome::RejectedStale {
                clock: domain_clock,
            };
        }

        let key = cmd.key();
        let position = match queue.binary_search_by(|probe| probe.key().cmp(&key)) {
            // Duplicate (tick, seq) should not happen; keep broadcast order
            Ok(index) | Err(index) => index,
        };
        debug!(
            "scheduled command kind {} for domain {} at tick {} (seq {})",
            cmd.kind, cmd.target, cmd.tick, cmd.seq
        );
        queue.insert(position, cmd);
        EnqueueOutcome::Accepted
    }

    /// Removes and returns, in queue order, every command stamped exactly for
    /// `tick` in the given domain's queue.
    ///
    /// Commands are never skipped while catching up: the driver calls this for
    /// every tick it steps through, so a head below `tick` means admission
    /// went wrong somewhere; it is drained and logged rather than left to
    /// wedge the queue.
    pub fn take_due(
        &mut self,
        domain: DomainId,
        tick: Tick,
    ) -> SmallVec<[ScheduledCommand; 4]> {
        let mut due = SmallVec::new();
        let Some(queue) = self.queues.get_mut(&domain) else {
            return due;
        };
        while let Some(head) = queue.front() {
            if head.tick > tick {
                break;
            }
            if head.tick < tick {
                warn!(
                    "command for domain {} stamped tick {} surfaced at tick {}; executing late",
                    domain, head.tick, tick
                );
            }
            if let Some(cmd) = queue.pop_front() {
                due.push(cmd);
            }
        }
        due
    }

    /// Copies the pending commands of one domain, in queue order (snapshot
    /// transfer and diagnostics).
    #[must_use]
    pub fn pending_for(&self, domain: DomainId) -> Vec<ScheduledCommand> {
        self.queues
            .get(&domain)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total pending commands across all domains.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Number of commands dropped since session start (stale, unknown kind,
    /// or unknown domain).
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

impl std::fmt::Debug for CommandScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandScheduler")
            .field("pending", &self.pending_len())
            .field("dropped", &self.dropped)
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIND_A: CommandKind = CommandKind::new(1);
    const KIND_B: CommandKind = CommandKind::new(2);
    const MAP: DomainId = DomainId::new(0);

    fn registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.register(KIND_A, "designate");
        registry.register(KIND_B, "set_speed");
        registry
    }

    fn scheduler() -> CommandScheduler {
        let mut scheduler = CommandScheduler::new(registry());
        scheduler.add_domain(MAP);
        scheduler.add_domain(DomainId::GLOBAL);
        scheduler
    }

    fn cmd(tick: u64, seq: u64) -> ScheduledCommand {
        ScheduledCommand {
            tick: Tick::new(tick),
            target: MAP,
            kind: KIND_A,
            payload: vec![1, 2, 3],
            seq,
            issued_by_self: false,
        }
    }

    #[test]
    fn enqueue_orders_by_tick() {
        let mut scheduler = scheduler();
        assert!(scheduler.enqueue(cmd(20, 1), Tick::ZERO).is_accepted());
        assert!(scheduler.enqueue(cmd(10, 2), Tick::ZERO).is_accepted());
        assert!(scheduler.enqueue(cmd(30, 0), Tick::ZERO).is_accepted());

        assert_eq!(scheduler.take_due(MAP, Tick::new(10)).len(), 1);
        assert_eq!(scheduler.take_due(MAP, Tick::new(20)).len(), 1);
        assert_eq!(scheduler.take_due(MAP, Tick::new(30)).len(), 1);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn same_tick_orders_by_seq() {
        let mut scheduler = scheduler();
        let mut late = cmd(10, 7);
        late.payload = vec![7];
        let mut early = cmd(10, 3);
        early.payload = vec![3];

        assert!(scheduler.enqueue(late, Tick::ZERO).is_accepted());
        assert!(scheduler.enqueue(early, Tick::ZERO).is_accepted());

        let due = scheduler.take_due(MAP, Tick::new(10));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].seq, 3);
        assert_eq!(due[1].seq, 7);
    }

    #[test]
    fn stale_command_is_dropped_and_counted() {
        let mut scheduler = scheduler();
        let outcome = scheduler.enqueue(cmd(5, 0), Tick::new(6));
        assert_eq!(
            outcome,
            EnqueueOutcome::RejectedStale {
                clock: Tick::new(6)
            }
        );
        assert_eq!(scheduler.dropped_count(), 1);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn command_at_current_clock_is_accepted() {
        // The clock position is the next tick to execute, so a command stamped
        // exactly there is still in time.
        let mut scheduler = scheduler();
        assert!(scheduler.enqueue(cmd(6, 0), Tick::new(6)).is_accepted());
    }

    #[test]
    fn unregistered_kind_is_dropped() {
        let mut scheduler = scheduler();
        let mut bad = cmd(10, 0);
        bad.kind = CommandKind::new(999);
        assert_eq!(
            scheduler.enqueue(bad, Tick::ZERO),
            EnqueueOutcome::RejectedUnknownKind
        );
        assert_eq!(scheduler.dropped_count(), 1);
    }

    #[test]
    fn unknown_domain_is_dropped() {
        let mut scheduler = scheduler();
        let mut stray = cmd(10, 0);
        stray.target = DomainId::new(42);
        assert_eq!(
            scheduler.enqueue(stray, Tick::ZERO),
            EnqueueOutcome::RejectedUnknownDomain
        );
    }

    #[test]
    fn payload_check_gates_admission() {
        let mut registry = CommandRegistry::new();
        registry.register_with_check(KIND_A, "checked", Some(|payload| payload.len() == 4));
        let mut scheduler = CommandScheduler::new(registry);
        scheduler.add_domain(MAP);

        let mut short = cmd(10, 0);
        short.payload = vec![1];
        assert_eq!(
            scheduler.enqueue(short, Tick::ZERO),
            EnqueueOutcome::RejectedUnknownKind
        );

        let mut ok = cmd(10, 1);
        ok.payload = vec![1, 2, 3, 4];
        assert!(scheduler.enqueue(ok, Tick::ZERO).is_accepted());
    }

    #[test]
    fn take_due_leaves_future_commands() {
        let mut scheduler = scheduler();
        assert!(scheduler.enqueue(cmd(10, 0), Tick::ZERO).is_accepted());
        assert!(scheduler.enqueue(cmd(11, 1), Tick::ZERO).is_accepted());

        let due = scheduler.take_due(MAP, Tick::new(10));
        assert_eq!(due.len(), 1);
        assert_eq!(scheduler.pending_len(), 1);
    }

    #[test]
    fn take_due_for_unknown_domain_is_empty() {
        let mut scheduler = scheduler();
        assert!(scheduler.take_due(DomainId::new(9), Tick::new(10)).is_empty());
    }

    #[test]
    fn pending_for_preserves_queue_order() {
        let mut scheduler = scheduler();
        assert!(scheduler.enqueue(cmd(20, 5), Tick::ZERO).is_accepted());
        assert!(scheduler.enqueue(cmd(10, 4), Tick::ZERO).is_accepted());

        let pending = scheduler.pending_for(MAP);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].tick, Tick::new(10));
        assert_eq!(pending[1].tick, Tick::new(20));
    }

    #[test]
    fn clear_empties_every_queue() {
        let mut scheduler = scheduler();
        assert!(scheduler.enqueue(cmd(10, 0), Tick::ZERO).is_accepted());
        scheduler.clear();
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn seq_counter_is_monotonic() {
        let mut scheduler = scheduler();
        let first = scheduler.next_seq();
        let second = scheduler.next_seq();
        assert!(second > first);
    }

    #[test]
    fn registry_names_registered_kinds() {
        let registry = registry();
        assert_eq!(registry.name_of(KIND_A), Some("designate"));
        assert_eq!(registry.name_of(CommandKind::new(99)), None);
        assert_eq!(registry.len(), 2);
    }
}
