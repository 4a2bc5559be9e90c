//! Independently-clocked simulation partitions.
//!
//! A domain is one unit of simulation, typically "the world" or a single map.
//! The library does not know what a domain simulates; it owns the domain's
//! determinism-critical bookkeeping (clock, speed, random state, step budget)
//! and drives the embedder's logic through the [`Tickable`] trait.
//!
//! Each domain exclusively owns its random generator, clock, and queue; no
//! other component mutates them directly. The tick driver is the only caller
//! of [`SimDomain::process_tick`], and it invokes it from exactly one thread.

use tracing::{error, warn};

use crate::desync::TraceSink;
use crate::error::BastionError;
use crate::rng::DomainRng;
use crate::scheduler::ScheduledCommand;
use crate::{DomainId, SimSpeed, Tick};

/// The capability interface a simulation partition implements.
///
/// The session core depends only on this trait: it never inspects domain state
/// directly. Implementations must be fully deterministic: given the same
/// command log, the same random draws, and the same starting snapshot, `step`
/// must mutate state identically on every peer.
///
/// # Headless mode
///
/// The authority runs a non-interactive mirror of the simulation to produce
/// its own "local" sync opinions. [`TickContext::headless`] is `true` inside
/// that mirror; implementations must suppress any side effect that depends on
/// observation (anything gated on "is this visible to a camera") when it is
/// set, and must make sure such side effects never feed back into
/// deterministic state in the first place.
pub trait Tickable {
    /// Advances the domain by exactly one domain step.
    ///
    /// An error aborts the remaining steps of the current global tick for this
    /// domain but never halts the session; the desync detector exists to catch
    /// any divergence that follows.
    fn step(&mut self, ctx: &mut TickContext<'_>) -> Result<(), BastionError>;

    /// Applies one scheduled command.
    ///
    /// Failures are logged and simulation continues; one failing command must
    /// never halt ticking, since every peer must remain at an identical point.
    fn execute_command(
        &mut self,
        cmd: &ScheduledCommand,
        ctx: &mut TickContext<'_>,
    ) -> Result<(), BastionError>;

    /// Maps a configured speed to this domain's step rate per global tick.
    ///
    /// Defaults to the canonical [`SimSpeed::multiplier`] mapping. Overrides
    /// must be pure functions of speed and deterministic domain state.
    fn rate_multiplier(&self, speed: SimSpeed) -> f32 {
        speed.multiplier()
    }

    /// Serializes the domain's full deterministic state.
    fn snapshot(&self) -> Result<Vec<u8>, BastionError>;

    /// Reconstructs the domain's state from bytes produced by
    /// [`snapshot`](Tickable::snapshot) on another peer.
    fn restore(&mut self, bytes: &[u8]) -> Result<(), BastionError>;
}

/// Per-step context handed to [`Tickable`] implementations.
///
/// Carries the domain's deterministic random generator and the diagnostic
/// trace sink. All randomness consumed during a step must come from
/// [`TickContext::rng`] or peers will diverge silently.
pub struct TickContext<'a> {
    /// The domain's deterministic random generator.
    pub rng: &'a mut DomainRng,
    /// `true` inside the authority's non-interactive mirror instance.
    pub headless: bool,
    traces: &'a mut TraceSink,
}

impl<'a> TickContext<'a> {
    pub(crate) fn new(rng: &'a mut DomainRng, headless: bool, traces: &'a mut TraceSink) -> Self {
        Self {
            rng,
            headless,
            traces,
        }
    }

    /// Records a diagnostic call-site hash into the current opinion window.
    ///
    /// Bounded by the configured diagnostic depth; a no-op once the window's
    /// budget is spent or when the depth is zero.
    pub fn record_trace(&mut self, hash: i64) {
        self.traces.record(hash);
    }
}

/// One registered simulation partition and its determinism bookkeeping.
///
/// Owned exclusively by the session; mutated only during a step or command
/// application on the simulation thread.
pub struct SimDomain {
    id: DomainId,
    /// Next global tick this domain will process.
    clock: Tick,
    /// Domain steps simulated so far (advances by the rate multiplier per
    /// global tick).
    steps: u64,
    speed: SimSpeed,
    rng: DomainRng,
    pending_budget: f32,
    logic: Box<dyn Tickable>,
}

impl SimDomain {
    /// Creates a domain at tick zero with its own seeded random stream.
    ///
    /// The domain id doubles as the random stream selector so that two domains
    /// seeded from the same session seed still draw independent sequences.
    #[must_use]
    pub fn new(id: DomainId, seed: u64, logic: Box<dyn Tickable>) -> Self {
        Self {
            id,
            clock: Tick::ZERO,
            steps: 0,
            speed: SimSpeed::Normal,
            rng: DomainRng::new(seed, u64::from(id.as_u32())),
            pending_budget: 0.0,
            logic,
        }
    }

    /// This domain's id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// The next global tick this domain will process.
    #[inline]
    #[must_use]
    pub fn clock(&self) -> Tick {
        self.clock
    }

    /// Total domain steps simulated.
    #[inline]
    #[must_use]
    pub fn steps_simulated(&self) -> u64 {
        self.steps
    }

    /// The configured speed.
    #[inline]
    #[must_use]
    pub fn speed(&self) -> SimSpeed {
        self.speed
    }

    /// Reconfigures the speed. Takes effect from the next global tick.
    pub fn set_speed(&mut self, speed: SimSpeed) {
        self.speed = speed;
    }

    /// This domain's effective step rate at its configured speed.
    #[must_use]
    pub fn rate_multiplier(&self) -> f32 {
        self.logic.rate_multiplier(self.speed)
    }

    /// The running random-draw fingerprint of the current opinion window.
    #[inline]
    #[must_use]
    pub fn window_hash(&self) -> u32 {
        self.rng.window_hash()
    }

    /// Resets the fingerprint at an opinion-window boundary.
    pub(crate) fn reset_window(&mut self) {
        self.rng.reset_window();
    }

    pub(crate) fn rng(&self) -> &DomainRng {
        &self.rng
    }

    /// Parks a freshly-created domain at the session's current tick, so a
    /// domain registered mid-session joins the tick cadence without a
    /// fictitious backlog.
    pub(crate) fn align_clock(&mut self, tick: Tick) {
        self.clock = tick;
    }

    /// Processes one global tick: executes every due command in queue order,
    /// then performs budgeted domain steps at the effective multiplier.
    ///
    /// Due commands execute even when the effective multiplier is zero: a
    /// paused domain still consumes its queue so command admission stays
    /// deterministic across peers.
    pub(crate) fn process_tick(
        &mut self,
        tick: Tick,
        due: &[ScheduledCommand],
        effective_multiplier: f32,
        headless: bool,
        traces: &mut TraceSink,
    ) {
        debug_assert_eq!(self.clock, tick, "domain {} skipped a tick", self.id);

        for cmd in due {
            let mut ctx = TickContext::new(&mut self.rng, headless, traces);
            if let Err(err) = self.logic.execute_command(cmd, &mut ctx) {
                // One failing command must never halt ticking; divergence, if
                // any, is the desync detector's job to catch.
                warn!(
                    "command kind {} failed on domain {} at tick {}: {}",
                    cmd.kind, self.id, tick, err
                );
            }
        }

        if effective_multiplier > 0.0 {
            self.pending_budget += effective_multiplier;
            while self.pending_budget >= 1.0 {
                self.pending_budget -= 1.0;
                let mut ctx = TickContext::new(&mut self.rng, headless, traces);
                match self.logic.step(&mut ctx) {
                    Ok(()) => self.steps += 1,
                    Err(err) => {
                        error!(
                            "step failed on domain {} at tick {}: {}; abandoning remaining budget",
                            self.id, tick, err
                        );
                        self.pending_budget = 0.0;
                        break;
                    }
                }
            }
        }

        self.clock = tick + 1;
    }

    /// Serializes the embedder's domain state (uncompressed).
    pub(crate) fn snapshot_state(&self) -> Result<Vec<u8>, BastionError> {
        self.logic.snapshot()
    }

    pub(crate) fn restore(
        &mut self,
        clock: Tick,
        steps: u64,
        speed: SimSpeed,
        rng: crate::rng::RngSnapshot,
        state: &[u8],
    ) -> Result<(), BastionError> {
        self.logic.restore(state)?;
        self.clock = clock;
        self.steps = steps;
        self.speed = speed;
        self.rng = DomainRng::from_snapshot(rng);
        self.pending_budget = 0.0;
        Ok(())
    }
}

impl std::fmt::Debug for SimDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDomain")
            .field("id", &self.id)
            .field("clock", &self.clock)
            .field("steps", &self.steps)
            .field("speed", &self.speed)
            .field("pending_budget", &self.pending_budget)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::CommandKind;

    /// Minimal deterministic logic: counts steps and applied commands, and
    /// consumes one random draw per step.
    #[derive(Default)]
    struct Counter {
        steps: u64,
        commands: Vec<u16>,
        fail_command: bool,
        fail_step: bool,
    }

    impl Tickable for Counter {
        fn step(&mut self, ctx: &mut TickContext<'_>) -> Result<(), BastionError> {
            if self.fail_step {
                return Err(BastionError::InvalidRequest {
                    info: "boom".to_owned(),
                });
            }
            let _ = ctx.rng.next_u32();
            self.steps += 1;
            Ok(())
        }

        fn execute_command(
            &mut self,
            cmd: &ScheduledCommand,
            _ctx: &mut TickContext<'_>,
        ) -> Result<(), BastionError> {
            if self.fail_command {
                return Err(BastionError::InvalidRequest {
                    info: "bad command".to_owned(),
                });
            }
            self.commands.push(cmd.kind.as_u16());
            Ok(())
        }

        fn snapshot(&self) -> Result<Vec<u8>, BastionError> {
            Ok(self.steps.to_le_bytes().to_vec())
        }

        fn restore(&mut self, bytes: &[u8]) -> Result<(), BastionError> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            self.steps = u64::from_le_bytes(raw);
            Ok(())
        }
    }

    fn command(kind: u16, tick: u64) -> ScheduledCommand {
        ScheduledCommand {
            tick: Tick::new(tick),
            target: DomainId::new(0),
            kind: CommandKind::new(kind),
            payload: Vec::new(),
            seq: 0,
            issued_by_self: false,
        }
    }

    fn domain_with(counter: Counter) -> SimDomain {
        SimDomain::new(DomainId::new(0), 42, Box::new(counter))
    }

    #[test]
    fn normal_speed_steps_once_per_tick() {
        let mut domain = domain_with(Counter::default());
        let mut traces = TraceSink::new(0);
        for tick in 0..10 {
            domain.process_tick(Tick::new(tick), &[], 1.0, false, &mut traces);
        }
        assert_eq!(domain.steps_simulated(), 10);
        assert_eq!(domain.clock(), Tick::new(10));
    }

    #[test]
    fn fast_multiplier_steps_multiple_times() {
        let mut domain = domain_with(Counter::default());
        let mut traces = TraceSink::new(0);
        domain.process_tick(Tick::ZERO, &[], 3.0, false, &mut traces);
        assert_eq!(domain.steps_simulated(), 3);
    }

    #[test]
    fn fractional_multiplier_accumulates() {
        let mut domain = domain_with(Counter::default());
        let mut traces = TraceSink::new(0);
        // 0.5 steps per tick: one domain step every two global ticks
        for tick in 0..4 {
            domain.process_tick(Tick::new(tick), &[], 0.5, false, &mut traces);
        }
        assert_eq!(domain.steps_simulated(), 2);
    }

    #[test]
    fn zero_multiplier_still_executes_commands() {
        let mut domain = domain_with(Counter::default());
        let mut traces = TraceSink::new(0);
        let due = vec![command(7, 0)];
        domain.process_tick(Tick::ZERO, &due, 0.0, false, &mut traces);
        assert_eq!(domain.steps_simulated(), 0);
        assert_eq!(domain.clock(), Tick::new(1));
    }

    #[test]
    fn failing_command_does_not_halt_tick() {
        let counter = Counter {
            fail_command: true,
            ..Counter::default()
        };
        let mut domain = domain_with(counter);
        let mut traces = TraceSink::new(0);
        let due = vec![command(1, 0), command(2, 0)];
        domain.process_tick(Tick::ZERO, &due, 1.0, false, &mut traces);
        // Both commands failed, the step still ran and the clock advanced
        assert_eq!(domain.steps_simulated(), 1);
        assert_eq!(domain.clock(), Tick::new(1));
    }

    #[test]
    fn failing_step_abandons_remaining_budget() {
        let counter = Counter {
            fail_step: true,
            ..Counter::default()
        };
        let mut domain = domain_with(counter);
        let mut traces = TraceSink::new(0);
        domain.process_tick(Tick::ZERO, &[], 6.0, false, &mut traces);
        assert_eq!(domain.steps_simulated(), 0);
        // The clock still advances: the session never stalls on one domain
        assert_eq!(domain.clock(), Tick::new(1));
    }

    #[test]
    fn window_hash_reflects_draws() {
        let mut domain = domain_with(Counter::default());
        let mut traces = TraceSink::new(0);
        let before = domain.window_hash();
        domain.process_tick(Tick::ZERO, &[], 1.0, false, &mut traces);
        assert_ne!(domain.window_hash(), before);

        domain.reset_window();
        assert_eq!(domain.window_hash(), before);
    }

    #[test]
    fn identical_domains_stay_identical() {
        let mut a = domain_with(Counter::default());
        let mut b = domain_with(Counter::default());
        let mut traces = TraceSink::new(0);
        for tick in 0..60 {
            a.process_tick(Tick::new(tick), &[], 3.0, false, &mut traces);
            b.process_tick(Tick::new(tick), &[], 3.0, false, &mut traces);
        }
        assert_eq!(a.window_hash(), b.window_hash());
        assert_eq!(a.steps_simulated(), b.steps_simulated());
    }

    #[test]
    fn speed_is_reconfigurable() {
        let mut domain = domain_with(Counter::default());
        assert_eq!(domain.speed(), SimSpeed::Normal);
        domain.set_speed(SimSpeed::Superfast);
        assert_eq!(domain.speed(), SimSpeed::Superfast);
        assert_eq!(domain.rate_multiplier(), 6.0);
    }
}
