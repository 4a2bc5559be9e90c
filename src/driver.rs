//! Real-time to simulation-time conversion and catch-up control.
//!
//! The driver converts elapsed wall-clock time into pending simulation time at
//! 60 ticks per second, steps every domain through whole ticks, and never
//! leaves a domain mid-step: every stop condition (the authoritative bound,
//! a desync freeze, a blocking event, a cancelled skip) lands exactly on a
//! tick boundary.
//!
//! Two pacing regimes exist. Normal play drains the accumulator, boosted
//! slightly when the peer has fallen behind the authoritative bound so it
//! catches up smoothly instead of instantly. Skip mode (joining, replay
//! fast-forward) ignores the accumulator entirely and steps as many ticks as
//! fit in a bounded wall-clock slice per frame, keeping a UI thread that
//! shares the frame responsive.

use std::collections::VecDeque;

use tracing::{debug, info};
use web_time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::desync::{Opinion, OpinionWindow};
use crate::domain::SimDomain;
use crate::scheduler::CommandScheduler;
use crate::{BastionEvent, Tick, TICKS_PER_SECOND};

/// Ticks behind the bound before the catch-up boost kicks in.
const BEHIND_SCHEDULE_THRESHOLD: u64 = 8;

/// Extra accumulator budget injected per tick behind schedule.
const CATCH_UP_BOOST_PER_TICK: f32 = 0.1;

/// Upper bound on the per-frame catch-up boost.
const CATCH_UP_BOOST_MAX: f32 = 2.0;

/// Borrowed view of everything one frame of ticking may touch.
pub(crate) struct TickLoopCtx<'a> {
    pub domains: &'a mut Vec<SimDomain>,
    pub scheduler: &'a mut CommandScheduler,
    pub window: &'a mut OpinionWindow,
    pub config: &'a SessionConfig,
    pub tick: &'a mut Tick,
    pub tick_until: Tick,
    pub frozen: bool,
    pub blocking: bool,
    /// Local opinions completed during this frame, for the session to match
    /// and broadcast.
    pub completed: &'a mut Vec<Opinion>,
    pub events: &'a mut VecDeque<BastionEvent>,
}

struct SkipState {
    target: Tick,
    on_complete: Option<Box<dyn FnOnce(Tick)>>,
}

/// Drives per-frame stepping across all domains.
pub struct TickDriver {
    accumulator: f32,
    skip: Option<SkipState>,
}

impl Default for TickDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TickDriver {
    /// Creates an idle driver.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accumulator: 0.0,
            skip: None,
        }
    }

    /// `true` while a skip is in progress.
    #[must_use]
    pub fn is_skipping(&self) -> bool {
        self.skip.is_some()
    }

    /// The active skip's target, if any.
    #[must_use]
    pub fn skip_target(&self) -> Option<Tick> {
        self.skip.as_ref().map(|skip| skip.target)
    }

    /// Pending simulation time in ticks (diagnostics only).
    #[must_use]
    pub fn pending_time(&self) -> f32 {
        self.accumulator
    }

    /// Begins a skip toward `target`, replacing any active skip.
    ///
    /// The completion callback fires on the frame the target is reached,
    /// always on a tick boundary.
    pub(crate) fn begin_skip(&mut self, target: Tick, on_complete: Option<Box<dyn FnOnce(Tick)>>) {
        info!("beginning skip to tick {}", target);
        self.accumulator = 0.0;
        self.skip = Some(SkipState {
            target,
            on_complete,
        });
    }

    /// Cancels an active skip. Returns `true` if one was active; the session
    /// is parked on whatever tick boundary the skip had reached.
    pub(crate) fn cancel_skip(&mut self) -> bool {
        match self.skip.take() {
            Some(skip) => {
                info!("skip to tick {} cancelled", skip.target);
                true
            }
            None => false,
        }
    }

    /// Advances the simulation for one rendered frame.
    pub(crate) fn advance(&mut self, ctx: &mut TickLoopCtx<'_>, elapsed: Duration) {
        if ctx.frozen || ctx.blocking {
            // Whatever time passed during a freeze or a modal must not turn
            // into a tick burst afterwards.
            self.accumulator = 0.0;
            return;
        }
        if ctx.domains.is_empty() {
            return;
        }

        if self.skip.is_some() {
            self.run_skip(ctx);
            return;
        }

        if Self::is_paused(ctx) {
            self.accumulator = 0.0;
            return;
        }

        self.accumulator += elapsed.as_secs_f32() * TICKS_PER_SECOND as f32;

        // Behind schedule: inject a bounded amount of extra budget so the gap
        // closes over several frames rather than one.
        let behind = ctx.tick_until.since(*ctx.tick);
        if behind > BEHIND_SCHEDULE_THRESHOLD && !ctx.config.replay {
            let boost =
                ((behind - BEHIND_SCHEDULE_THRESHOLD) as f32 * CATCH_UP_BOOST_PER_TICK)
                    .min(CATCH_UP_BOOST_MAX);
            self.accumulator += boost;
        }

        let cap = ctx.config.effective_max_catch_up() as f32;
        if self.accumulator > cap {
            self.accumulator = cap;
        }

        while self.accumulator >= 1.0 {
            if *ctx.tick >= ctx.tick_until || ctx.frozen || ctx.blocking {
                break;
            }
            Self::step_tick(ctx);
            self.accumulator -= 1.0;
        }
    }

    /// Steps ticks within the configured wall-clock slice, regardless of the
    /// accumulator, until the target or the authoritative bound is reached.
    fn run_skip(&mut self, ctx: &mut TickLoopCtx<'_>) {
        let Some(skip) = self.skip.as_ref() else {
            return;
        };
        let target = skip.target;
        let slice_start = Instant::now();

        while *ctx.tick < target
            && *ctx.tick < ctx.tick_until
            && slice_start.elapsed() < ctx.config.skip_slice
        {
            Self::step_tick(ctx);
        }

        if *ctx.tick >= target {
            if let Some(mut skip) = self.skip.take() {
                info!("skip completed at tick {}", *ctx.tick);
                if let Some(on_complete) = skip.on_complete.take() {
                    on_complete(*ctx.tick);
                }
            }
            ctx.events
                .push_back(BastionEvent::SkipCompleted { tick: *ctx.tick });
        } else {
            debug!(
                "skip slice exhausted at tick {} (target {})",
                *ctx.tick, target
            );
        }
    }

    /// Executes one global tick across every domain: due commands first, in
    /// queue order, then budgeted domain steps at the effective rate.
    fn step_tick(ctx: &mut TickLoopCtx<'_>) {
        let tick = *ctx.tick;

        let multipliers: Vec<f32> = ctx
            .domains
            .iter()
            .map(SimDomain::rate_multiplier)
            .collect();
        // Unless domains tick independently, everything locksteps to the
        // slowest domain.
        let min_multiplier = multipliers.iter().copied().fold(f32::INFINITY, f32::min);

        for (index, domain) in ctx.domains.iter_mut().enumerate() {
            let due = ctx.scheduler.take_due(domain.id(), tick);
            for cmd in &due {
                ctx.window.fold_command(cmd);
            }
            let effective = if ctx.config.independent_domain_ticking {
                multipliers[index]
            } else {
                min_multiplier
            };
            domain.process_tick(tick, &due, effective, ctx.config.headless, ctx.window.traces_mut());
        }

        *ctx.tick = tick + 1;

        if let Some(opinion) = ctx.window.finish_tick(ctx.domains) {
            ctx.completed.push(opinion);
        }
    }

    /// Paused means no domain would step at all this tick: the minimum
    /// multiplier in lockstep mode, or every multiplier in independent mode,
    /// is zero.
    fn is_paused(ctx: &TickLoopCtx<'_>) -> bool {
        let mut multipliers = ctx.domains.iter().map(SimDomain::rate_multiplier);
        if ctx.config.independent_domain_ticking {
            multipliers.all(|m| m <= 0.0)
        } else {
            multipliers.any(|m| m <= 0.0)
        }
    }
}

impl std::fmt::Debug for TickDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickDriver")
            .field("accumulator", &self.accumulator)
            .field("skipping_to", &self.skip.as_ref().map(|s| s.target))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TickContext, Tickable};
    use crate::error::BastionError;
    use crate::scheduler::{CommandKind, CommandRegistry, ScheduledCommand};
    use crate::{DomainId, SimSpeed};

    struct Noop;

    impl Tickable for Noop {
        fn step(&mut self, ctx: &mut TickContext<'_>) -> Result<(), BastionError> {
            let _ = ctx.rng.next_u32();
            Ok(())
        }

        fn execute_command(
            &mut self,
            _cmd: &ScheduledCommand,
            _ctx: &mut TickContext<'_>,
        ) -> Result<(), BastionError> {
            Ok(())
        }

        fn snapshot(&self) -> Result<Vec<u8>, BastionError> {
            Ok(Vec::new())
        }

        fn restore(&mut self, _bytes: &[u8]) -> Result<(), BastionError> {
            Ok(())
        }
    }

    struct Fixture {
        domains: Vec<SimDomain>,
        scheduler: CommandScheduler,
        window: OpinionWindow,
        config: SessionConfig,
        tick: Tick,
        completed: Vec<Opinion>,
        events: VecDeque<BastionEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = CommandRegistry::new();
            registry.register(CommandKind::new(1), "test");
            let mut scheduler = CommandScheduler::new(registry);
            scheduler.add_domain(DomainId::new(0));
            Self {
                domains: vec![SimDomain::new(DomainId::new(0), 1, Box::new(Noop))],
                scheduler,
                window: OpinionWindow::new(30, 0, Tick::ZERO),
                config: SessionConfig::default(),
                tick: Tick::ZERO,
                completed: Vec::new(),
                events: VecDeque::new(),
            }
        }

        fn advance(
            &mut self,
            driver: &mut TickDriver,
            elapsed: Duration,
            tick_until: Tick,
        ) {
            let mut ctx = TickLoopCtx {
                domains: &mut self.domains,
                scheduler: &mut self.scheduler,
                window: &mut self.window,
                config: &self.config,
                tick: &mut self.tick,
                tick_until,
                frozen: false,
                blocking: false,
                completed: &mut self.completed,
                events: &mut self.events,
            };
            driver.advance(&mut ctx, elapsed);
        }
    }

    const FRAME: Duration = Duration::from_millis(16);

    #[test]
    fn one_frame_advances_about_one_tick() {
        let mut fixture = Fixture::new();
        let mut driver = TickDriver::new();
        // 4 frames of ~16ms at 60 t/s is just under 4 ticks. The bound is
        // close enough that no catch-up boost applies.
        for _ in 0..4 {
            fixture.advance(&mut driver, FRAME, Tick::new(6));
        }
        assert!(fixture.tick >= Tick::new(2) && fixture.tick <= Tick::new(4));
    }

    #[test]
    fn never_exceeds_per_frame_cap() {
        let mut fixture = Fixture::new();
        let mut driver = TickDriver::new();
        // A 10-second stall must not turn into a 600-tick burst
        fixture.advance(&mut driver, Duration::from_secs(10), Tick::new(10_000));
        assert!(
            fixture.tick.as_u64() <= u64::from(fixture.config.max_catch_up_ticks_per_frame)
        );
    }

    #[test]
    fn catch_up_converges_without_exceeding_cap() {
        let mut fixture = Fixture::new();
        let mut driver = TickDriver::new();
        let bound = Tick::new(200);
        let cap = u64::from(fixture.config.effective_max_catch_up());

        let mut frames = 0;
        while fixture.tick < bound {
            let before = fixture.tick;
            fixture.advance(&mut driver, FRAME, bound);
            assert!(fixture.tick.since(before) <= cap, "cap exceeded in one frame");
            frames += 1;
            assert!(frames < 10_000, "catch-up failed to converge");
        }
        assert_eq!(fixture.tick, bound);
    }

    #[test]
    fn never_ticks_past_the_bound() {
        let mut fixture = Fixture::new();
        let mut driver = TickDriver::new();
        for _ in 0..100 {
            fixture.advance(&mut driver, FRAME, Tick::new(5));
        }
        assert_eq!(fixture.tick, Tick::new(5));
    }

    #[test]
    fn paused_forces_accumulator_to_zero() {
        let mut fixture = Fixture::new();
        fixture.domains[0].set_speed(SimSpeed::Paused);
        let mut driver = TickDriver::new();
        fixture.advance(&mut driver, Duration::from_secs(1), Tick::new(1000));
        assert_eq!(fixture.tick, Tick::ZERO);
        assert_eq!(driver.pending_time(), 0.0);
    }

    #[test]
    fn frozen_session_does_not_tick() {
        let mut fixture = Fixture::new();
        let mut driver = TickDriver::new();
        let mut ctx = TickLoopCtx {
            domains: &mut fixture.domains,
            scheduler: &mut fixture.scheduler,
            window: &mut fixture.window,
            config: &fixture.config,
            tick: &mut fixture.tick,
            tick_until: Tick::new(100),
            frozen: true,
            blocking: false,
            completed: &mut fixture.completed,
            events: &mut fixture.events,
        };
        driver.advance(&mut ctx, Duration::from_secs(1), );
        assert_eq!(fixture.tick, Tick::ZERO);
    }

    #[test]
    fn skip_reaches_target_and_fires_callback() {
        let mut fixture = Fixture::new();
        let mut driver = TickDriver::new();
        let landed = std::rc::Rc::new(std::cell::Cell::new(None));
        let landed_in_cb = std::rc::Rc::clone(&landed);
        driver.begin_skip(
            Tick::new(120),
            Some(Box::new(move |tick| landed_in_cb.set(Some(tick)))),
        );

        let mut frames = 0;
        while driver.is_skipping() {
            fixture.advance(&mut driver, FRAME, Tick::new(120));
            frames += 1;
            assert!(frames < 1000, "skip failed to terminate");
        }
        assert_eq!(fixture.tick, Tick::new(120));
        assert_eq!(landed.get(), Some(Tick::new(120)));
        assert!(fixture
            .events
            .iter()
            .any(|e| matches!(e, BastionEvent::SkipCompleted { tick } if *tick == Tick::new(120))));
    }

    #[test]
    fn skip_never_steps_past_the_bound() {
        let mut fixture = Fixture::new();
        let mut driver = TickDriver::new();
        driver.begin_skip(Tick::new(500), None);
        for _ in 0..100 {
            fixture.advance(&mut driver, FRAME, Tick::new(50));
        }
        // The bound, not the target, is the hard stop
        assert_eq!(fixture.tick, Tick::new(50));
        assert!(driver.is_skipping());
    }

    #[test]
    fn cancel_skip_parks_on_boundary() {
        let mut fixture = Fixture::new();
        let mut driver = TickDriver::new();
        driver.begin_skip(Tick::new(10_000), None);
        fixture.advance(&mut driver, FRAME, Tick::new(10_000));
        let parked = fixture.tick;
        assert!(driver.cancel_skip());
        assert!(!driver.is_skipping());
        assert!(!driver.cancel_skip());

        // No further progress without a new skip or accumulator time
        fixture.advance(&mut driver, Duration::ZERO, Tick::new(10_000));
        assert_eq!(fixture.tick, parked);
    }

    #[test]
    fn skip_ignores_paused_accumulator_rules() {
        // A skip makes progress even though the accumulator would be zeroed;
        // paused domains advance their clocks (commands stay due) without
        // stepping their logic.
        let mut fixture = Fixture::new();
        fixture.domains[0].set_speed(SimSpeed::Paused);
        let mut driver = TickDriver::new();
        driver.begin_skip(Tick::new(30), None);
        let mut frames = 0;
        while driver.is_skipping() {
            fixture.advance(&mut driver, FRAME, Tick::new(30));
            frames += 1;
            assert!(frames < 1000, "skip failed to terminate");
        }
        assert_eq!(fixture.tick, Tick::new(30));
        assert_eq!(fixture.domains[0].steps_simulated(), 0);
    }

    #[test]
    fn due_commands_execute_during_catch_up() {
        let mut fixture = Fixture::new();
        let cmd = ScheduledCommand {
            tick: Tick::new(3),
            target: DomainId::new(0),
            kind: CommandKind::new(1),
            payload: Vec::new(),
            seq: 0,
            issued_by_self: false,
        };
        assert!(fixture.scheduler.enqueue(cmd, Tick::ZERO).is_accepted());

        let mut driver = TickDriver::new();
        driver.begin_skip(Tick::new(10), None);
        let mut frames = 0;
        while driver.is_skipping() {
            fixture.advance(&mut driver, FRAME, Tick::new(10));
            frames += 1;
            assert!(frames < 1000);
        }
        assert_eq!(fixture.scheduler.pending_len(), 0);
    }

    #[test]
    fn opinion_window_completes_during_stepping() {
        let mut fixture = Fixture::new();
        let mut driver = TickDriver::new();
        driver.begin_skip(Tick::new(65), None);
        let mut frames = 0;
        while driver.is_skipping() {
            fixture.advance(&mut driver, FRAME, Tick::new(65));
            frames += 1;
            assert!(frames < 1000);
        }
        // 65 ticks with a 30-tick window: two completed opinions
        assert_eq!(fixture.completed.len(), 2);
        assert_eq!(fixture.completed[0].start_tick, Tick::ZERO);
        assert_eq!(fixture.completed[1].start_tick, Tick::new(30));
        assert_eq!(fixture.completed[0].domain_hashes.len(), 1);
        assert_eq!(
            fixture.completed[0].domain_hashes[&DomainId::new(0)].len(),
            30
        );
    }

    #[test]
    fn two_drivers_produce_identical_hash_sequences() {
        let run = || {
            let mut fixture = Fixture::new();
            let mut driver = TickDriver::new();
            driver.begin_skip(Tick::new(90), None);
            while driver.is_skipping() {
                fixture.advance(&mut driver, FRAME, Tick::new(90));
            }
            fixture
                .completed
                .iter()
                .map(|op| op.domain_hashes[&DomainId::new(0)].clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
