//! Per-connection lifecycle and inbound message dispatch.
//!
//! Each transport connection walks the state machine
//! `Connected → Joining → Loading → Playing`, with `Disconnected` terminal.
//! Every state recognizes a fixed, closed set of inbound message kinds;
//! anything else is logged and ignored, except a protocol-version mismatch,
//! which is fatal regardless of state.
//!
//! The same machine serves both roles: on the authority each connection
//! tracks one remote client's progress, on a client the single connection
//! tracks this peer's own progress toward `Playing`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::desync::{DesyncBundle, DesyncDetector, DesyncFinding, Opinion, OpinionOrigin};
use crate::domain::SimDomain;
use crate::error::BastionError;
use crate::id_block::{IdAllocator, IdBlock};
use crate::network::codec;
use crate::network::messages::{
    self, CommandBroadcast, DefsManifest, Disconnect, Handshake, KeepAlive, Message, MessageBody,
    OpinionFragment, Snapshot, TimeBound, OPINION_FRAGMENT_LEN,
};
use crate::scheduler::{CommandKind, CommandScheduler, EnqueueOutcome, ScheduledCommand};
use crate::session::{DomainFactory, SessionRole};
use crate::snapshot::{self, NamedEvent, SessionBundle};
use crate::{BastionEvent, PlayerId, Tick};

/// Index of a transport connection within the session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnId(usize);

impl ConnId {
    /// Creates a connection id from its session-local index.
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        ConnId(index)
    }

    /// Returns the underlying index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is up; the protocol handshake has not completed.
    Connected,
    /// Handshake and manifest exchange accepted; snapshot transfer under way.
    Joining,
    /// Snapshot restored; fast-forwarding to the authoritative tick bound.
    Loading,
    /// Caught up and participating in lockstep.
    Playing,
    /// Terminal: the connection is gone.
    Disconnected,
}

/// Why a connection was closed. Travels on the wire inside the disconnect
/// message: the enum tag is the reason code, the variant fields the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The peers speak different protocol versions.
    ProtocolMismatch {
        /// Version the closing side speaks.
        expected: u16,
        /// Version the other side announced.
        received: u16,
    },
    /// The definitions manifests are incompatible.
    IncompatibleDefs {
        /// First category that differed.
        category: String,
    },
    /// The session desynchronized and cannot continue without a full reload.
    Desynchronized,
    /// The authority removed this peer.
    Kicked,
    /// The session is shutting down in an orderly fashion.
    Shutdown,
    /// The transport reported the connection lost.
    TransportLost,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProtocolMismatch { expected, received } => {
                write!(f, "protocol mismatch (ours {}, theirs {})", expected, received)
            }
            Self::IncompatibleDefs { category } => {
                write!(f, "incompatible definitions in category '{}'", category)
            }
            Self::Desynchronized => write!(f, "simulation desynchronized"),
            Self::Kicked => write!(f, "removed by the authority"),
            Self::Shutdown => write!(f, "session shut down"),
            Self::TransportLost => write!(f, "connection lost"),
        }
    }
}

/// Borrowed view of the session internals a dispatch may touch.
///
/// The connection never stores pointers back into the session; everything it
/// needs arrives here per call and is released when the call returns.
pub(crate) struct DispatchCtx<'a> {
    pub role: SessionRole,
    pub config: &'a SessionConfig,
    pub local_manifest: &'a DefsManifest,
    pub tick: &'a mut Tick,
    pub tick_until: &'a mut Tick,
    pub domains: &'a mut Vec<SimDomain>,
    pub scheduler: &'a mut CommandScheduler,
    pub detector: &'a mut DesyncDetector,
    pub events: &'a mut std::collections::VecDeque<BastionEvent>,
    /// Messages addressed to this connection only.
    pub outbound: &'a mut std::collections::VecDeque<(ConnId, Message)>,
    /// Messages the session fans out to every playing connection afterwards.
    pub broadcasts: &'a mut Vec<Message>,
    pub next_player_id: &'a mut u32,
    pub id_alloc: &'a mut IdAllocator,
    pub id_block: &'a mut Option<IdBlock>,
    pub local_player: &'a mut Option<PlayerId>,
    pub frozen: &'a mut bool,
    pub desync_bundle: &'a mut Option<DesyncBundle>,
    /// Set by a client after snapshot restore; the session starts the skip.
    pub pending_skip: &'a mut Option<Tick>,
    /// Client-side constructor for domain logic during snapshot restore.
    pub factory: Option<&'a mut DomainFactory>,
    /// This peer's own pacing status, for keep-alive replies.
    pub ticks_behind: u32,
    pub is_skipping: bool,
    pub named_events: &'a [NamedEvent],
}

/// One transport connection and its protocol state.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    state: ConnectionState,
    player_id: Option<PlayerId>,
    username: String,
    // pacing as last reported by the remote (authority side)
    ticks_behind: u32,
    is_skipping: bool,
    // sync opinion reassembly
    frag_total: u16,
    frag_parts: Vec<u8>,
    frag_received: u16,
    // broadcasts that raced ahead of the snapshot on a joining client
    pre_join_commands: Vec<CommandBroadcast>,
}

impl Connection {
    pub(crate) fn new(id: ConnId) -> Self {
        Self {
            id,
            state: ConnectionState::Connected,
            player_id: None,
            username: String::new(),
            ticks_behind: 0,
            is_skipping: false,
            frag_total: 0,
            frag_parts: Vec::new(),
            frag_received: 0,
            pre_join_commands: Vec::new(),
        }
    }

    /// This connection's id.
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The player id, once assigned.
    #[must_use]
    pub fn player_id(&self) -> Option<PlayerId> {
        self.player_id
    }

    /// The username announced in the handshake.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Ticks behind the bound, as last reported by the remote peer.
    #[must_use]
    pub fn ticks_behind(&self) -> u32 {
        self.ticks_behind
    }

    /// Whether the remote peer reported an active skip.
    #[must_use]
    pub fn is_skipping(&self) -> bool {
        self.is_skipping
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn set_player_id(&mut self, player: PlayerId) {
        self.player_id = Some(player);
    }

    /// Dispatches one inbound message according to the current state.
    ///
    /// A protocol-version mismatch is the only dispatch outcome surfaced as an
    /// error: the session must close this connection. Everything else either
    /// acts or is logged and ignored.
    pub(crate) fn handle(
        &mut self,
        msg: Message,
        ctx: &mut DispatchCtx<'_>,
    ) -> Result<(), BastionError> {
        trace!("conn {} ({:?}) received {}", self.id, self.state, msg.body.name());

        if self.state == ConnectionState::Disconnected {
            trace!("conn {} is disconnected; ignoring message", self.id);
            return Ok(());
        }

        // The version check outranks every state: a peer on the wrong build
        // must never influence the simulation.
        if msg.header.protocol_version != ctx.config.protocol_version {
            return Err(BastionError::ProtocolMismatch {
                expected: ctx.config.protocol_version,
                received: msg.header.protocol_version,
            });
        }

        match msg.body {
            MessageBody::Handshake(body) => self.on_handshake(body, ctx),
            MessageBody::DefsManifest(body) => self.on_manifest(body, ctx),
            MessageBody::Snapshot(body) => self.on_snapshot(body, ctx)?,
            MessageBody::CommandBroadcast(body) => self.on_command(body, ctx),
            MessageBody::TimeBound(body) => self.on_time_bound(body, ctx),
            MessageBody::KeepAlive(body) => self.on_keep_alive(body, ctx),
            MessageBody::SyncOpinion(body) => self.on_opinion_fragment(body, ctx),
            MessageBody::DesyncNotice(body) => self.on_desync_notice(body.tick, ctx),
            MessageBody::IdBlockRequest => self.on_id_block_request(ctx),
            MessageBody::IdBlockGrant(body) => self.on_id_block_grant(body.block, ctx),
            MessageBody::Disconnect(body) => self.on_disconnect(body, ctx),
        }
        Ok(())
    }

    fn unexpected(&self, what: &str) {
        warn!(
            "conn {} ignoring unexpected {} in state {:?}",
            self.id, what, self.state
        );
    }

    /// Authority, `Connected`: a client announced itself. Answer with our
    /// manifest so the client can validate compatibility cheaply.
    fn on_handshake(&mut self, body: Handshake, ctx: &mut DispatchCtx<'_>) {
        if ctx.role != SessionRole::Authority || self.state != ConnectionState::Connected {
            self.unexpected("Handshake");
            return;
        }
        // The body repeats the version so the reason payload can name it even
        // if the header was mangled; both must agree with ours (the header
        // already did).
        debug!(
            "conn {} handshake from '{}' (protocol {})",
            self.id, body.username, body.protocol_version
        );
        self.username = body.username;
        let manifest = ctx.local_manifest.clone();
        ctx.outbound.push_back((
            self.id,
            Message::new(
                ctx.config.protocol_version,
                MessageBody::DefsManifest(manifest),
            ),
        ));
    }

    fn on_manifest(&mut self, body: DefsManifest, ctx: &mut DispatchCtx<'_>) {
        if self.state != ConnectionState::Connected {
            self.unexpected("DefsManifest");
            return;
        }
        if let Some(category) = ctx.local_manifest.first_difference(&body) {
            info!(
                "conn {} has incompatible definitions (category '{}')",
                self.id, category
            );
            let reason = DisconnectReason::IncompatibleDefs { category };
            ctx.outbound.push_back((
                self.id,
                Message::new(
                    ctx.config.protocol_version,
                    MessageBody::Disconnect(Disconnect {
                        reason: reason.clone(),
                    }),
                ),
            ));
            self.state = ConnectionState::Disconnected;
            ctx.events.push_back(BastionEvent::Disconnected {
                conn: self.id,
                reason,
            });
            return;
        }

        match ctx.role {
            SessionRole::Authority => self.begin_snapshot_transfer(ctx),
            SessionRole::Client => {
                // Manifest accepted both ways: answer with ours and wait for
                // the snapshot.
                let manifest = ctx.local_manifest.clone();
                ctx.outbound.push_back((
                    self.id,
                    Message::new(
                        ctx.config.protocol_version,
                        MessageBody::DefsManifest(manifest),
                    ),
                ));
                self.state = ConnectionState::Joining;
            }
        }
    }

    /// Authority: manifests agree. Assign an identity, capture the session,
    /// and start the transfer.
    fn begin_snapshot_transfer(&mut self, ctx: &mut DispatchCtx<'_>) {
        let player = PlayerId::new(*ctx.next_player_id);
        *ctx.next_player_id += 1;
        self.player_id = Some(player);

        let bundle = match snapshot::capture_session(
            ctx.domains,
            ctx.scheduler,
            *ctx.tick,
            *ctx.tick_until,
            ctx.named_events,
        )
        .and_then(|bundle| bundle.encode())
        {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("conn {} snapshot capture failed: {}", self.id, err);
                return;
            }
        };

        let block = ctx.id_alloc.allocate();
        info!(
            "conn {} joining as player {} ('{}'), snapshot at tick {}",
            self.id, player, self.username, *ctx.tick
        );
        ctx.outbound.push_back((
            self.id,
            Message::new(
                ctx.config.protocol_version,
                MessageBody::Snapshot(Snapshot {
                    bundle,
                    player_id: player,
                    id_block: block,
                    tick_until: *ctx.tick_until,
                }),
            ),
        ));
        self.state = ConnectionState::Joining;
        ctx.events.push_back(BastionEvent::JoinStarted {
            conn: self.id,
            player,
            username: self.username.clone(),
        });
    }

    /// Client, `Joining`: reconstruct every domain from the transferred
    /// bundle, then hand the session a skip target to catch up to.
    fn on_snapshot(
        &mut self,
        body: Snapshot,
        ctx: &mut DispatchCtx<'_>,
    ) -> Result<(), BastionError> {
        if ctx.role != SessionRole::Client || self.state != ConnectionState::Joining {
            self.unexpected("Snapshot");
            return Ok(());
        }
        let Some(factory) = ctx.factory.as_mut() else {
            warn!("conn {} received snapshot but no domain factory is set", self.id);
            return Ok(());
        };

        let bundle = SessionBundle::decode(&body.bundle)?;
        snapshot::restore_session(&bundle, ctx.domains, ctx.scheduler, factory)?;

        *ctx.tick = bundle.start_tick;
        *ctx.tick_until = body.tick_until.max(bundle.tick_until);
        *ctx.local_player = Some(body.player_id);
        *ctx.id_block = Some(body.id_block);
        self.player_id = Some(body.player_id);
        self.state = ConnectionState::Loading;
        *ctx.pending_skip = Some(*ctx.tick_until);

        info!(
            "restored {} domains from snapshot at tick {}; catching up to {}",
            bundle.snapshots.len(),
            bundle.start_tick,
            *ctx.tick_until
        );
        ctx.events.push_back(BastionEvent::CatchUpStarted {
            player: body.player_id,
            snapshot_tick: bundle.start_tick,
            target: *ctx.tick_until,
        });

        // Admit any broadcasts that raced ahead of the snapshot.
        for stashed in std::mem::take(&mut self.pre_join_commands) {
            admit_command(&stashed, ctx);
        }
        Ok(())
    }

    fn on_command(&mut self, body: CommandBroadcast, ctx: &mut DispatchCtx<'_>) {
        if ctx.role == SessionRole::Client && self.state == ConnectionState::Joining {
            // The snapshot has not arrived yet; keep the broadcast for
            // admission right after restore so nothing stamped during the
            // transfer is lost.
            self.pre_join_commands.push(body);
            return;
        }
        // The authority also accepts requests from peers it still considers
        // Joining: a client flips itself to Playing the moment its catch-up
        // lands, while the authority's view lags one keep-alive exchange.
        let acceptable = matches!(
            self.state,
            ConnectionState::Playing | ConnectionState::Loading
        ) || (ctx.role == SessionRole::Authority && self.state == ConnectionState::Joining);
        if !acceptable {
            self.unexpected("CommandBroadcast");
            return;
        }

        match ctx.role {
            SessionRole::Authority => {
                // Unstamped request from a client: stamp tick and sequence,
                // execute locally, and fan out to everyone (the requester
                // included; peers never execute a command they stamped
                // themselves). The stamp sits one lead beyond the broadcast
                // bound: no peer's clock can have passed it, even one that is
                // parked exactly on the bound.
                let tick = *ctx.tick_until + u64::from(ctx.config.command_lead_ticks);
                let seq = ctx.scheduler.next_seq();
                let stamped = CommandBroadcast {
                    tick,
                    seq,
                    ..body
                };
                admit_command(&stamped, ctx);
                ctx.broadcasts.push(Message::new(
                    ctx.config.protocol_version,
                    MessageBody::CommandBroadcast(stamped),
                ));
            }
            SessionRole::Client => {
                // Stamped broadcast from the authority.
                admit_command(&body, ctx);
            }
        }
    }

    fn on_time_bound(&mut self, body: TimeBound, ctx: &mut DispatchCtx<'_>) {
        if ctx.role != SessionRole::Client {
            self.unexpected("TimeBound");
            return;
        }
        // Bounds only ever rise; a stale or reordered update is a no-op.
        if body.tick_until > *ctx.tick_until {
            *ctx.tick_until = body.tick_until;
            ctx.events.push_back(BastionEvent::TimeBoundRaised {
                tick_until: body.tick_until,
            });
        }
    }

    fn on_keep_alive(&mut self, body: KeepAlive, ctx: &mut DispatchCtx<'_>) {
        match ctx.role {
            SessionRole::Authority => {
                // A pacing report from the client echoing our probe.
                let (ticks_behind, is_skipping) = messages::unpack_status(body.status);
                self.ticks_behind = ticks_behind;
                self.is_skipping = is_skipping;
                trace!(
                    "conn {} reports {} ticks behind (skipping: {})",
                    self.id,
                    ticks_behind,
                    is_skipping
                );

                // A joining peer that has stopped skipping and closed the gap
                // is live.
                if self.state == ConnectionState::Joining
                    && !is_skipping
                    && ticks_behind <= ctx.config.command_lead_ticks * 2
                {
                    self.state = ConnectionState::Playing;
                    if let Some(player) = self.player_id {
                        info!("conn {} (player {}) is caught up and playing", self.id, player);
                        ctx.events.push_back(BastionEvent::PeerPlaying {
                            conn: self.id,
                            player,
                        });
                    }
                }
            }
            SessionRole::Client => {
                // Echo the probe back with our own pacing status.
                let reply = KeepAlive {
                    echo: body.echo,
                    status: messages::pack_status(ctx.ticks_behind, ctx.is_skipping),
                };
                ctx.outbound.push_back((
                    self.id,
                    Message::new(ctx.config.protocol_version, MessageBody::KeepAlive(reply)),
                ));
            }
        }
    }

    fn on_opinion_fragment(&mut self, body: OpinionFragment, ctx: &mut DispatchCtx<'_>) {
        if self.state != ConnectionState::Playing {
            self.unexpected("SyncOpinion");
            return;
        }
        if body.index == 0 {
            self.frag_total = body.total;
            self.frag_parts.clear();
            self.frag_received = 0;
        }
        if body.index != self.frag_received || body.total != self.frag_total || body.total == 0 {
            warn!(
                "conn {} opinion fragment {}/{} out of order; dropping window",
                self.id, body.index, body.total
            );
            self.frag_total = 0;
            self.frag_parts.clear();
            self.frag_received = 0;
            return;
        }
        self.frag_parts.extend_from_slice(&body.bytes);
        self.frag_received += 1;
        if self.frag_received < self.frag_total {
            return;
        }

        let decoded = codec::decode::<Opinion>(&self.frag_parts);
        self.frag_total = 0;
        self.frag_parts = Vec::new();
        self.frag_received = 0;

        match decoded {
            Ok((mut opinion, _)) => {
                // Never trust the wire about provenance.
                opinion.origin = OpinionOrigin::Remote;
                if let Some(finding) = ctx.detector.try_add_opinion(opinion) {
                    confirm_desync(self.id, finding, ctx);
                }
            }
            Err(err) => {
                warn!("conn {} sent undecodable opinion: {}", self.id, err);
            }
        }
    }

    fn on_desync_notice(&mut self, tick: Tick, ctx: &mut DispatchCtx<'_>) {
        if self.state != ConnectionState::Playing {
            self.unexpected("DesyncNotice");
            return;
        }
        if ctx.detector.is_desynced() {
            return;
        }
        info!("conn {} reported a desync at window {}; freezing", self.id, tick);
        ctx.detector.mark_desynced();
        *ctx.frozen = true;
        ctx.events.push_back(BastionEvent::DesyncNoticed { tick });
        if ctx.role == SessionRole::Authority {
            // Make sure every other peer freezes too.
            ctx.broadcasts.push(Message::new(
                ctx.config.protocol_version,
                MessageBody::DesyncNotice(messages::DesyncNotice { tick }),
            ));
        }
    }

    fn on_id_block_request(&mut self, ctx: &mut DispatchCtx<'_>) {
        if ctx.role != SessionRole::Authority || self.state != ConnectionState::Playing {
            self.unexpected("IdBlockRequest");
            return;
        }
        let block = ctx.id_alloc.allocate();
        debug!("granting id block [{}, +{}) to conn {}", block.base(), block.size(), self.id);
        ctx.outbound.push_back((
            self.id,
            Message::new(
                ctx.config.protocol_version,
                MessageBody::IdBlockGrant(messages::IdBlockGrant { block }),
            ),
        ));
    }

    fn on_id_block_grant(&mut self, block: IdBlock, ctx: &mut DispatchCtx<'_>) {
        if ctx.role != SessionRole::Client {
            self.unexpected("IdBlockGrant");
            return;
        }
        debug!("received id block [{}, +{})", block.base(), block.size());
        *ctx.id_block = Some(block);
    }

    fn on_disconnect(&mut self, body: Disconnect, ctx: &mut DispatchCtx<'_>) {
        info!("conn {} disconnected: {}", self.id, body.reason);
        self.state = ConnectionState::Disconnected;
        if ctx.role == SessionRole::Client {
            // Losing the authority ends the session: domains and pending
            // commands are gone until a fresh join rebuilds them.
            ctx.domains.clear();
            ctx.scheduler.clear();
        }
        ctx.events.push_back(BastionEvent::Disconnected {
            conn: self.id,
            reason: body.reason,
        });
    }
}

/// Inserts a stamped broadcast into the target domain's queue, surfacing a
/// drop as an observable event.
fn admit_command(body: &CommandBroadcast, ctx: &mut DispatchCtx<'_>) {
    let clock = ctx
        .domains
        .iter()
        .find(|domain| domain.id() == body.target)
        .map_or(*ctx.tick, SimDomain::clock);

    let cmd = ScheduledCommand {
        tick: body.tick,
        target: body.target,
        kind: CommandKind::new(body.kind),
        payload: body.payload.clone(),
        seq: body.seq,
        issued_by_self: *ctx.local_player == Some(body.player),
    };

    match ctx.scheduler.enqueue(cmd, clock) {
        EnqueueOutcome::Accepted => {}
        EnqueueOutcome::RejectedStale { clock } => {
            ctx.events.push_back(BastionEvent::CommandDropped {
                target: body.target,
                tick: body.tick,
                clock,
            });
        }
        EnqueueOutcome::RejectedUnknownKind | EnqueueOutcome::RejectedUnknownDomain => {
            ctx.events.push_back(BastionEvent::CommandDropped {
                target: body.target,
                tick: body.tick,
                clock,
            });
        }
    }
}

/// First confirmed mismatch: freeze the session, capture the diagnostic
/// bundle, tell the user, and notify the other side.
pub(crate) fn confirm_desync(conn: ConnId, finding: DesyncFinding, ctx: &mut DispatchCtx<'_>) {
    *ctx.frozen = true;

    let snapshot = snapshot::capture_session(
        ctx.domains,
        ctx.scheduler,
        *ctx.tick,
        *ctx.tick_until,
        ctx.named_events,
    );
    match snapshot {
        Ok(bundle) => {
            *ctx.desync_bundle = Some(DesyncBundle {
                report: finding.report.clone(),
                local: finding.local,
                remote: finding.remote,
                snapshot: bundle,
                last_good_tick: ctx.detector.last_good_tick(),
            });
        }
        Err(err) => {
            warn!("failed to capture desync diagnostics: {}", err);
        }
    }

    let tick = finding.report.start_tick;
    ctx.events.push_back(BastionEvent::DesyncDetected {
        tick,
        report: finding.report,
    });

    let notice = Message::new(
        ctx.config.protocol_version,
        MessageBody::DesyncNotice(messages::DesyncNotice { tick }),
    );
    match ctx.role {
        SessionRole::Authority => ctx.broadcasts.push(notice),
        SessionRole::Client => ctx.outbound.push_back((conn, notice)),
    }
}

/// Splits a serialized opinion into wire fragments.
pub(crate) fn fragment_opinion(
    opinion: &Opinion,
    protocol_version: u16,
) -> Result<Vec<Message>, BastionError> {
    let bytes = codec::encode(opinion).map_err(|err| BastionError::SerializationError {
        context: format!("sync opinion: {}", err),
    })?;
    let total = bytes.len().div_ceil(OPINION_FRAGMENT_LEN).max(1) as u16;
    let mut fragments = Vec::with_capacity(usize::from(total));
    for (index, chunk) in bytes.chunks(OPINION_FRAGMENT_LEN).enumerate() {
        fragments.push(Message::new(
            protocol_version,
            MessageBody::SyncOpinion(OpinionFragment {
                index: index as u16,
                total,
                bytes: chunk.to_vec(),
            }),
        ));
    }
    if fragments.is_empty() {
        // An empty encoding cannot happen with bincode, but never send zero
        // fragments for a window either way.
        fragments.push(Message::new(
            protocol_version,
            MessageBody::SyncOpinion(OpinionFragment {
                index: 0,
                total: 1,
                bytes: Vec::new(),
            }),
        ));
    }
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_id_roundtrip() {
        let id = ConnId::new(3);
        assert_eq!(id.as_usize(), 3);
        assert_eq!(format!("{}", id), "3");
    }

    #[test]
    fn disconnect_reason_display() {
        let reason = DisconnectReason::ProtocolMismatch {
            expected: 2,
            received: 5,
        };
        let text = format!("{}", reason);
        assert!(text.contains("ours 2"));
        assert!(text.contains("theirs 5"));

        assert_eq!(
            format!("{}", DisconnectReason::Desynchronized),
            "simulation desynchronized"
        );
    }

    #[test]
    fn new_connection_starts_connected() {
        let conn = Connection::new(ConnId::new(0));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.player_id().is_none());
        assert_eq!(conn.username(), "");
        assert!(!conn.is_skipping());
    }

    #[test]
    fn fragment_opinion_splits_and_indexes() {
        let opinion = Opinion {
            start_tick: Tick::new(0),
            origin: OpinionOrigin::Local,
            domain_hashes: std::iter::once((
                crate::DomainId::new(0),
                vec![0u32; OPINION_FRAGMENT_LEN], // 4 KiB of hashes
            ))
            .collect(),
            command_hashes: Vec::new(),
            trace_hashes: Vec::new(),
        };
        let fragments = fragment_opinion(&opinion, 1).expect("fragment");
        assert!(fragments.len() > 1);
        for (i, msg) in fragments.iter().enumerate() {
            if let MessageBody::SyncOpinion(frag) = &msg.body {
                assert_eq!(usize::from(frag.index), i);
                assert_eq!(usize::from(frag.total), fragments.len());
                assert!(frag.bytes.len() <= OPINION_FRAGMENT_LEN);
            } else {
                unreachable!("fragment_opinion only builds SyncOpinion bodies");
            }
        }
    }

    #[test]
    fn small_opinion_is_a_single_fragment() {
        let opinion = Opinion {
            start_tick: Tick::new(30),
            origin: OpinionOrigin::Local,
            domain_hashes: std::collections::BTreeMap::new(),
            command_hashes: vec![1, 2, 3],
            trace_hashes: Vec::new(),
        };
        let fragments = fragment_opinion(&opinion, 1).expect("fragment");
        assert_eq!(fragments.len(), 1);
    }
}
