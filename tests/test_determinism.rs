//! Determinism: state must be a pure function of (initial snapshot, ordered
//! command log, tick count).

mod common;

use std::time::Duration;

use bastion_lockstep::{DomainId, Session, SessionConfig, Tick};
use common::{exec_log, test_manifest, test_scheduler, TestWorld, KIND_DESIGNATE, KIND_SET_ZONE};

const FRAME: Duration = Duration::from_millis(16);

/// Builds a hosted session with two domains (a map and the session-wide
/// partition) and runs a fixed script of frames and command submissions.
fn run_scripted_session() -> (Session, common::ExecLog) {
    let log = exec_log();
    let mut session = Session::host(SessionConfig::default(), test_scheduler(), test_manifest());
    session
        .register_domain(DomainId::new(0), 9001, Box::new(TestWorld::new(log.clone())))
        .expect("register map");
    session
        .register_domain(DomainId::GLOBAL, 9002, Box::new(TestWorld::new(log.clone())))
        .expect("register world");

    for frame in 0..600 {
        session.advance_frame(FRAME);
        match frame {
            50 => {
                session
                    .submit_command(DomainId::new(0), KIND_DESIGNATE, vec![1, 2, 3])
                    .expect("submit");
            }
            51 => {
                // Two commands in the same frame land on the same stamped tick
                // and must order by sequence everywhere.
                session
                    .submit_command(DomainId::new(0), KIND_SET_ZONE, vec![4])
                    .expect("submit");
                session
                    .submit_command(DomainId::new(0), KIND_DESIGNATE, vec![5])
                    .expect("submit");
            }
            200 => {
                session
                    .submit_command(DomainId::GLOBAL, KIND_SET_ZONE, vec![6])
                    .expect("submit");
            }
            _ => {}
        }
    }
    (session, log)
}

#[test]
fn identical_scripts_produce_identical_state() {
    let (session_a, log_a) = run_scripted_session();
    let (session_b, log_b) = run_scripted_session();

    assert_eq!(session_a.current_tick(), session_b.current_tick());
    assert_eq!(log_a.borrow().as_slice(), log_b.borrow().as_slice());

    let bundle_a = session_a.bundle().expect("bundle a");
    let bundle_b = session_b.bundle().expect("bundle b");
    assert_eq!(bundle_a.snapshots.len(), 2);
    for (snap_a, snap_b) in bundle_a.snapshots.iter().zip(&bundle_b.snapshots) {
        assert_eq!(snap_a.domain_id, snap_b.domain_id);
        assert_eq!(snap_a.clock, snap_b.clock);
        assert_eq!(snap_a.steps, snap_b.steps);
        assert_eq!(snap_a.rng, snap_b.rng, "random streams diverged");
        assert_eq!(snap_a.state, snap_b.state, "domain state diverged");
    }
}

#[test]
fn commands_execute_in_tick_then_sequence_order() {
    let (_session, log) = run_scripted_session();
    let log = log.borrow();
    assert_eq!(log.len(), 4, "every submitted command executed exactly once");

    // Strictly non-decreasing ticks; equal ticks ordered by sequence.
    for pair in log.windows(2) {
        assert!(
            pair[0].tick < pair[1].tick
                || (pair[0].tick == pair[1].tick && pair[0].seq < pair[1].seq),
            "execution order violated: {:?} before {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn command_execution_lands_on_stamped_ticks() {
    let (session, log) = run_scripted_session();
    for record in log.borrow().iter() {
        assert!(record.tick <= session.current_tick().as_u64());
    }
    assert_eq!(session.dropped_commands(), 0);
}

#[test]
fn replay_of_a_bundle_reproduces_the_same_state() {
    // Run a session, capture a bundle mid-way, keep running; then rebuild a
    // replay session from the bundle and verify it converges to the same
    // state after the same number of ticks (no further commands pending).
    let log = exec_log();
    let mut original = Session::host(SessionConfig::default(), test_scheduler(), test_manifest());
    original
        .register_domain(DomainId::new(0), 77, Box::new(TestWorld::new(log.clone())))
        .expect("register");
    for _ in 0..300 {
        original.advance_frame(FRAME);
    }
    let bundle = original.bundle().expect("bundle");
    let captured_tick = bundle.start_tick;

    let replay_log = exec_log();
    let factory_log = replay_log.clone();
    let mut replay = Session::join(
        SessionConfig::builder()
            .replay(true)
            .build()
            .expect("config"),
        test_scheduler(),
        test_manifest(),
        "replay",
        Box::new(move |_| Box::new(TestWorld::new(factory_log.clone()))),
    );
    replay.restore_bundle(&bundle).expect("restore");
    assert_eq!(replay.current_tick(), captured_tick);

    // Step both to the same later tick and compare state byte-for-byte.
    let target = Tick::new(captured_tick.as_u64() + 120);
    original.skip_to(target, None).expect("skip");
    while original.is_skipping() {
        original.advance_frame(FRAME);
    }
    // Replay has no authority raising its bound; lift it by hand.
    replay.raise_tick_until(target);
    replay.skip_to(target, None).expect("skip");
    while replay.is_skipping() {
        replay.advance_frame(FRAME);
    }

    let snap_original = original.bundle().expect("bundle");
    let snap_replay = replay.bundle().expect("bundle");
    let a = &snap_original.snapshots[0];
    let b = &snap_replay.snapshots[0];
    assert_eq!(a.clock, b.clock);
    assert_eq!(a.rng, b.rng);
    assert_eq!(a.state, b.state);
}
