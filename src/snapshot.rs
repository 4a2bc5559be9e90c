//! Session bundles: point-in-time captures of every domain.
//!
//! One artifact serves three consumers: the join protocol's initial transfer,
//! offline replay review, and the diagnostic capture attached to a desync
//! report. A bundle is the ordered list of per-domain snapshots plus the
//! pending command log for each, the tick range it covers, and any named
//! diagnostic events the session recorded along the way.
//!
//! State bytes are stored run-length compressed; everything else is small.

use serde::{Deserialize, Serialize};

use crate::compress;
use crate::domain::SimDomain;
use crate::error::BastionError;
use crate::network::codec;
use crate::rng::RngSnapshot;
use crate::scheduler::ScheduledCommand;
use crate::{DomainId, SimSpeed, Tick};

/// A serialized, point-in-time capture of one domain's full state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    /// Which domain this captures.
    pub domain_id: DomainId,
    /// The global tick the domain will process next.
    pub clock: Tick,
    /// Domain steps simulated so far.
    pub steps: u64,
    /// The configured speed at capture time.
    pub speed: SimSpeed,
    /// The domain's random generator state.
    pub rng: RngSnapshot,
    /// Run-length compressed state bytes from [`Tickable::snapshot`].
    ///
    /// [`Tickable::snapshot`]: crate::Tickable::snapshot
    pub state: Vec<u8>,
    /// Commands already scheduled but not yet executed at capture time.
    pub pending_commands: Vec<ScheduledCommand>,
}

impl DomainSnapshot {
    /// Captures a domain together with its pending command log.
    pub(crate) fn capture(
        domain: &SimDomain,
        pending_commands: Vec<ScheduledCommand>,
    ) -> Result<Self, BastionError> {
        let raw = domain.snapshot_state()?;
        Ok(Self {
            domain_id: domain.id(),
            clock: domain.clock(),
            steps: domain.steps_simulated(),
            speed: domain.speed(),
            rng: domain.rng().snapshot(),
            state: compress::encode(&raw),
            pending_commands,
        })
    }

    /// Decompresses the captured state bytes.
    pub fn decompress_state(&self) -> Result<Vec<u8>, BastionError> {
        compress::decode(&self.state).map_err(|err| BastionError::MalformedPacket {
            context: format!("snapshot state for domain {}: {}", self.domain_id, err),
        })
    }
}

/// A named diagnostic event recorded into the session's bundle timeline.
///
/// Used for replay review: "colonist died", "raid arrived", "player joined".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedEvent {
    /// The tick the event was recorded at.
    pub tick: Tick,
    /// A short human-readable label.
    pub name: String,
}

/// The ordered capture of a whole session: every domain, every pending
/// command, the covered tick range, and named diagnostic events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBundle {
    /// Per-domain snapshots, in domain-id order.
    pub snapshots: Vec<DomainSnapshot>,
    /// The global tick the capture was taken at.
    pub start_tick: Tick,
    /// The authoritative tick bound at capture time.
    pub tick_until: Tick,
    /// Named diagnostic events recorded up to the capture.
    pub events: Vec<NamedEvent>,
}

impl SessionBundle {
    /// The tick range this bundle covers: capture point to authoritative bound.
    #[must_use]
    pub fn tick_range(&self) -> (Tick, Tick) {
        (self.start_tick, self.tick_until)
    }

    /// Serializes the bundle for transfer or persistence.
    pub fn encode(&self) -> Result<Vec<u8>, BastionError> {
        codec::encode(self).map_err(|err| BastionError::SerializationError {
            context: format!("session bundle: {}", err),
        })
    }

    /// Decodes a bundle received from the authority or read from disk.
    pub fn decode(bytes: &[u8]) -> Result<Self, BastionError> {
        codec::decode::<SessionBundle>(bytes)
            .map(|(bundle, _)| bundle)
            .map_err(|err| BastionError::MalformedPacket {
                context: format!("session bundle: {}", err),
            })
    }
}

/// Captures every domain plus its pending command log into one bundle.
pub(crate) fn capture_session(
    domains: &[SimDomain],
    scheduler: &crate::scheduler::CommandScheduler,
    tick: Tick,
    tick_until: Tick,
    events: &[NamedEvent],
) -> Result<SessionBundle, BastionError> {
    let mut snapshots = Vec::with_capacity(domains.len());
    for domain in domains {
        snapshots.push(DomainSnapshot::capture(
            domain,
            scheduler.pending_for(domain.id()),
        )?);
    }
    Ok(SessionBundle {
        snapshots,
        start_tick: tick,
        tick_until,
        events: events.to_vec(),
    })
}

/// Rebuilds all domains and queues from a bundle, constructing each domain's
/// logic through the embedder's factory.
pub(crate) fn restore_session(
    bundle: &SessionBundle,
    domains: &mut Vec<SimDomain>,
    scheduler: &mut crate::scheduler::CommandScheduler,
    factory: &mut dyn FnMut(DomainId) -> Box<dyn crate::domain::Tickable>,
) -> Result<(), BastionError> {
    domains.clear();
    scheduler.clear();
    for snap in &bundle.snapshots {
        let mut domain = SimDomain::new(snap.domain_id, 0, factory(snap.domain_id));
        let state = snap.decompress_state()?;
        domain.restore(snap.clock, snap.steps, snap.speed, snap.rng, &state)?;
        scheduler.add_domain(snap.domain_id);
        for cmd in &snap.pending_commands {
            let _ = scheduler.enqueue(cmd.clone(), domain.clock());
        }
        domains.push(domain);
    }
    domains.sort_by_key(SimDomain::id);
    Ok(())
}
