//! Shared test fixtures: a deterministic stub domain and session plumbing.

#![allow(dead_code)] // each integration test binary uses a subset

use std::cell::RefCell;
use std::rc::Rc;

use bastion_lockstep::scheduler::{CommandRegistry, CommandScheduler};
use bastion_lockstep::{
    BastionError, CommandKind, DefCategory, DefsManifest, ScheduledCommand, TickContext, Tickable,
};

/// Command kind used by every test: "designate".
pub const KIND_DESIGNATE: CommandKind = CommandKind::new(1);

/// Second registered kind, for ordering tests.
pub const KIND_SET_ZONE: CommandKind = CommandKind::new(2);

/// One executed command, as observed by a test domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub tick: u64,
    pub kind: u16,
    pub seq: u64,
}

/// Shared handle onto a domain's executed-command trace.
pub type ExecLog = Rc<RefCell<Vec<ExecRecord>>>;

/// Creates an empty execution log handle.
pub fn exec_log() -> ExecLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// A minimal deterministic simulation: state is a running mix of every random
/// draw and every applied command, so any divergence anywhere shows up in the
/// draw fingerprints within a window.
pub struct TestWorld {
    state: u64,
    steps: u64,
    log: ExecLog,
    /// Test-only fault injection: after this many steps, consume one extra
    /// random draw per step. Not part of snapshots; it models a client whose
    /// build behaves differently, which is exactly what desync detection is
    /// for.
    extra_draw_after_steps: Option<u64>,
}

impl TestWorld {
    pub fn new(log: ExecLog) -> Self {
        Self {
            state: 0x5eed_0ba5_e5ee_d0ba,
            steps: 0,
            log,
            extra_draw_after_steps: None,
        }
    }

    pub fn diverging_after(log: ExecLog, steps: u64) -> Self {
        Self {
            extra_draw_after_steps: Some(steps),
            ..Self::new(log)
        }
    }
}

impl Tickable for TestWorld {
    fn step(&mut self, ctx: &mut TickContext<'_>) -> Result<(), BastionError> {
        let draw = ctx.rng.next_u32();
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(u64::from(draw));
        self.steps += 1;
        if let Some(after) = self.extra_draw_after_steps {
            if self.steps > after {
                let _ = ctx.rng.next_u32();
            }
        }
        Ok(())
    }

    fn execute_command(
        &mut self,
        cmd: &ScheduledCommand,
        _ctx: &mut TickContext<'_>,
    ) -> Result<(), BastionError> {
        self.state = self
            .state
            .wrapping_add(u64::from(cmd.kind.as_u16()))
            .wrapping_mul(cmd.seq | 1);
        self.log.borrow_mut().push(ExecRecord {
            tick: cmd.tick.as_u64(),
            kind: cmd.kind.as_u16(),
            seq: cmd.seq,
        });
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, BastionError> {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&self.state.to_le_bytes());
        bytes.extend_from_slice(&self.steps.to_le_bytes());
        Ok(bytes)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), BastionError> {
        if bytes.len() != 16 {
            return Err(BastionError::SerializationError {
                context: format!("test world snapshot is {} bytes, expected 16", bytes.len()),
            });
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        self.state = u64::from_le_bytes(word);
        word.copy_from_slice(&bytes[8..]);
        self.steps = u64::from_le_bytes(word);
        Ok(())
    }
}

/// A scheduler with the standard test kinds registered.
pub fn test_scheduler() -> CommandScheduler {
    let mut registry = CommandRegistry::new();
    registry.register(KIND_DESIGNATE, "designate");
    registry.register(KIND_SET_ZONE, "set_zone");
    CommandScheduler::new(registry)
}

/// The manifest every compatible test peer announces.
pub fn test_manifest() -> DefsManifest {
    DefsManifest {
        categories: vec![
            DefCategory {
                name: "things".to_owned(),
                count: 120,
                hash: 0x1111_2222_3333_4444,
            },
            DefCategory {
                name: "recipes".to_owned(),
                count: 48,
                hash: 0x5555_6666_7777_8888,
            },
        ],
    }
}
