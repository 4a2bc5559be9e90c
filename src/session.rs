//! The session: root of ownership for everything lockstep.
//!
//! A [`Session`] is constructed on host or join and destroyed on stop. It owns
//! the domains, the command scheduler, the tick driver, the desync detector,
//! and the connection list; components below it communicate only through
//! explicit calls and returned values; there is no ambient global session and
//! no back-pointer from any component into session internals.
//!
//! The embedding application drives one session per process from a single
//! thread: push received messages through the [`InboundQueue`], call
//! [`Session::advance_frame`] once per rendered frame, send everything
//! [`Session::outbound_messages`] yields, and drain [`Session::events`].

use std::collections::VecDeque;

use tracing::{error, info, warn};
use web_time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::desync::{DesyncBundle, DesyncDetector, DesyncFinding, Opinion, OpinionWindow};
use crate::domain::{SimDomain, Tickable};
use crate::driver::{TickDriver, TickLoopCtx};
use crate::error::BastionError;
use crate::id_block::{IdAllocator, IdBlock};
use crate::network::connection::{
    self, ConnId, Connection, ConnectionState, DisconnectReason, DispatchCtx,
};
use crate::network::inbound::{InboundQueue, InboundSender};
use crate::network::messages::{
    CommandBroadcast, DefsManifest, Disconnect, Handshake, KeepAlive, Message, MessageBody,
    TimeBound,
};
use crate::scheduler::{CommandKind, CommandScheduler, EnqueueOutcome, ScheduledCommand};
use crate::snapshot::{self, NamedEvent, SessionBundle};
use crate::{BastionEvent, DomainId, PlayerId, Tick};

/// Constructor for domain logic during snapshot restore on a client.
pub type DomainFactory = Box<dyn FnMut(DomainId) -> Box<dyn Tickable>>;

/// Interval between authority keep-alive probes.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on retained named diagnostic events.
const NAMED_EVENT_CAP: usize = 256;

/// Which side of the single-authority topology this session is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionRole {
    /// The peer whose tick bound and command stamping are canonical.
    Authority,
    /// Any other peer, including the authority's headless mirror process.
    Client,
}

/// A running lockstep session.
///
/// See the [module documentation](self) for the frame loop contract.
pub struct Session {
    role: SessionRole,
    config: SessionConfig,
    manifest: DefsManifest,

    tick: Tick,
    tick_until: Tick,
    frozen: bool,
    blocking: bool,

    domains: Vec<SimDomain>,
    scheduler: CommandScheduler,
    driver: TickDriver,
    detector: DesyncDetector,
    window: OpinionWindow,

    connections: Vec<Connection>,
    inbound: InboundQueue,
    outbound: VecDeque<(ConnId, Message)>,
    events: VecDeque<BastionEvent>,

    id_alloc: IdAllocator,
    id_block: Option<IdBlock>,
    id_block_requested: bool,
    local_player: Option<PlayerId>,
    next_player_id: u32,

    desync_bundle: Option<DesyncBundle>,
    pending_skip: Option<Tick>,
    factory: Option<DomainFactory>,
    named_events: Vec<NamedEvent>,

    keep_alive_timer: Instant,
    next_echo: u32,
    username: String,
}

impl Session {
    /// Creates the authoritative session of a new game.
    ///
    /// Register domains with [`register_domain`](Session::register_domain)
    /// before the first frame.
    #[must_use]
    pub fn host(
        config: SessionConfig,
        scheduler: CommandScheduler,
        manifest: DefsManifest,
    ) -> Self {
        let mut id_alloc = IdAllocator::default();
        let id_block = id_alloc.allocate();
        let window = OpinionWindow::new(config.opinion_window, config.desync_diagnostic_depth, Tick::ZERO);
        Self {
            role: SessionRole::Authority,
            config,
            manifest,
            tick: Tick::ZERO,
            tick_until: Tick::ZERO,
            frozen: false,
            blocking: false,
            domains: Vec::new(),
            scheduler,
            driver: TickDriver::new(),
            detector: DesyncDetector::new(),
            window,
            connections: Vec::new(),
            inbound: InboundQueue::new(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            id_alloc,
            id_block: Some(id_block),
            id_block_requested: false,
            local_player: Some(PlayerId::new(0)),
            next_player_id: 1,
            desync_bundle: None,
            pending_skip: None,
            factory: None,
            named_events: Vec::new(),
            keep_alive_timer: Instant::now(),
            next_echo: 0,
            username: String::new(),
        }
    }

    /// Creates a session that will join a remote authority.
    ///
    /// The factory constructs each domain's blank logic when the snapshot
    /// arrives; the snapshot then restores its state.
    #[must_use]
    pub fn join(
        config: SessionConfig,
        scheduler: CommandScheduler,
        manifest: DefsManifest,
        username: impl Into<String>,
        factory: DomainFactory,
    ) -> Self {
        let window = OpinionWindow::new(config.opinion_window, config.desync_diagnostic_depth, Tick::ZERO);
        Self {
            role: SessionRole::Client,
            config,
            manifest,
            tick: Tick::ZERO,
            tick_until: Tick::ZERO,
            frozen: false,
            blocking: false,
            domains: Vec::new(),
            scheduler,
            driver: TickDriver::new(),
            detector: DesyncDetector::new(),
            window,
            connections: Vec::new(),
            inbound: InboundQueue::new(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            id_alloc: IdAllocator::default(),
            id_block: None,
            id_block_requested: false,
            local_player: None,
            next_player_id: 1,
            desync_bundle: None,
            pending_skip: None,
            factory: Some(factory),
            named_events: Vec::new(),
            keep_alive_timer: Instant::now(),
            next_echo: 0,
            username: username.into(),
        }
    }

    // ==============
    // setup & wiring
    // ==============

    /// Registers a domain on the authority (or for offline replay) before the
    /// session starts ticking.
    pub fn register_domain(
        &mut self,
        id: DomainId,
        seed: u64,
        logic: Box<dyn Tickable>,
    ) -> Result<(), BastionError> {
        if self.domains.iter().any(|domain| domain.id() == id) {
            return Err(BastionError::InvalidRequest {
                info: format!("domain {} is already registered", id),
            });
        }
        let mut domain = SimDomain::new(id, seed, logic);
        domain.align_clock(self.tick);
        self.domains.push(domain);
        self.domains.sort_by_key(SimDomain::id);
        self.scheduler.add_domain(id);
        Ok(())
    }

    /// Accepts an incoming transport connection (authority side).
    pub fn accept_connection(&mut self) -> ConnId {
        let id = ConnId::new(self.connections.len());
        self.connections.push(Connection::new(id));
        info!("accepted transport connection {}", id);
        id
    }

    /// Opens the connection to the authority (client side) and sends the
    /// opening handshake.
    pub fn connect_to_authority(&mut self) -> Result<ConnId, BastionError> {
        if !self.connections.is_empty() {
            return Err(BastionError::InvalidRequest {
                info: "already connected to an authority".to_owned(),
            });
        }
        let id = ConnId::new(0);
        self.connections.push(Connection::new(id));
        self.outbound.push_back((
            id,
            Message::new(
                self.config.protocol_version,
                MessageBody::Handshake(Handshake {
                    protocol_version: self.config.protocol_version,
                    username: self.username.clone(),
                }),
            ),
        ));
        Ok(id)
    }

    /// Producer handle for the transport's receive path.
    #[must_use]
    pub fn inbound_sender(&self) -> InboundSender {
        self.inbound.sender()
    }

    /// Drains all messages the transport should send, in order.
    pub fn outbound_messages(&mut self) -> impl Iterator<Item = (ConnId, Message)> + '_ {
        self.outbound.drain(..)
    }

    /// Drains all notifications since the last call.
    pub fn events(&mut self) -> impl Iterator<Item = BastionEvent> + '_ {
        self.events.drain(..)
    }

    // ===========
    // frame cycle
    // ===========

    /// Runs one frame: drains the inbound queue, advances the simulation, and
    /// pumps periodic protocol traffic.
    ///
    /// `elapsed` is the real time since the previous call. A frozen session
    /// stays parked; the call remains cheap and side-effect free apart from
    /// message dispatch.
    pub fn advance_frame(&mut self, elapsed: Duration) {
        self.drain_inbound();

        if let Some(target) = self.pending_skip.take() {
            // A snapshot was just restored: fingerprint windows restart at
            // the restored tick, then the driver fast-forwards to the bound.
            self.window.restart_at(self.tick, &mut self.domains);
            self.driver.begin_skip(target, None);
        }

        let mut completed = Vec::new();
        {
            let Self {
                domains,
                scheduler,
                window,
                config,
                tick,
                tick_until,
                frozen,
                blocking,
                driver,
                events,
                ..
            } = self;
            let mut ctx = TickLoopCtx {
                domains,
                scheduler,
                window,
                config,
                tick,
                tick_until: *tick_until,
                frozen: *frozen,
                blocking: *blocking,
                completed: &mut completed,
                events,
            };
            driver.advance(&mut ctx, elapsed);
        }

        // A client that just landed its catch-up skip is live.
        if self.role == SessionRole::Client && !self.driver.is_skipping() {
            if let Some(conn) = self.connections.first_mut() {
                if conn.state() == ConnectionState::Loading {
                    conn.set_state(ConnectionState::Playing);
                }
            }
        }

        self.process_completed_opinions(completed);
        self.pump_network();
    }

    fn drain_inbound(&mut self) {
        for (conn_id, msg) in self.inbound.drain() {
            let index = conn_id.as_usize();
            if index >= self.connections.len() {
                warn!("message for unknown connection {}; dropping", conn_id);
                continue;
            }

            let ticks_behind = self.tick_until.since(self.tick).min(u64::from(u32::MAX)) as u32;
            let is_skipping = self.driver.is_skipping();
            let mut broadcasts = Vec::new();

            let result = {
                let Self {
                    role,
                    config,
                    manifest,
                    tick,
                    tick_until,
                    domains,
                    scheduler,
                    detector,
                    events,
                    outbound,
                    connections,
                    next_player_id,
                    id_alloc,
                    id_block,
                    local_player,
                    frozen,
                    desync_bundle,
                    pending_skip,
                    factory,
                    named_events,
                    ..
                } = self;
                let mut ctx = DispatchCtx {
                    role: *role,
                    config,
                    local_manifest: manifest,
                    tick,
                    tick_until,
                    domains,
                    scheduler,
                    detector,
                    events,
                    outbound,
                    broadcasts: &mut broadcasts,
                    next_player_id,
                    id_alloc,
                    id_block,
                    local_player,
                    frozen,
                    desync_bundle,
                    pending_skip,
                    factory: factory.as_mut(),
                    ticks_behind,
                    is_skipping,
                    named_events: named_events.as_slice(),
                };
                connections[index].handle(msg, &mut ctx)
            };

            match result {
                Ok(()) => {}
                Err(BastionError::ProtocolMismatch { expected, received }) => {
                    error!(
                        "connection {} speaks protocol {} (we speak {}); disconnecting",
                        conn_id, received, expected
                    );
                    self.disconnect(
                        conn_id,
                        DisconnectReason::ProtocolMismatch { expected, received },
                    );
                }
                Err(err) => {
                    // Malformed traffic is dropped; the state machine stays put.
                    warn!("dropping message from connection {}: {}", conn_id, err);
                }
            }

            self.fan_out(broadcasts, &[
                ConnectionState::Joining,
                ConnectionState::Loading,
                ConnectionState::Playing,
            ]);
        }
    }

    /// Completed local opinion windows: ship them to peers and feed the
    /// detector.
    fn process_completed_opinions(&mut self, completed: Vec<Opinion>) {
        for opinion in completed {
            match connection::fragment_opinion(&opinion, self.config.protocol_version) {
                Ok(fragments) => self.fan_out(fragments, &[ConnectionState::Playing]),
                Err(err) => warn!("failed to serialize sync opinion: {}", err),
            }
            if let Some(finding) = self.detector.try_add_opinion(opinion) {
                self.on_local_finding(finding);
            }
        }
    }

    /// First confirmed mismatch on this peer: freeze, capture diagnostics,
    /// notify everyone.
    fn on_local_finding(&mut self, finding: DesyncFinding) {
        self.frozen = true;

        match snapshot::capture_session(
            &self.domains,
            &self.scheduler,
            self.tick,
            self.tick_until,
            &self.named_events,
        ) {
            Ok(bundle) => {
                self.desync_bundle = Some(DesyncBundle {
                    report: finding.report.clone(),
                    local: finding.local,
                    remote: finding.remote,
                    snapshot: bundle,
                    last_good_tick: self.detector.last_good_tick(),
                });
            }
            Err(err) => warn!("failed to capture desync diagnostics: {}", err),
        }

        let tick = finding.report.start_tick;
        self.events.push_back(BastionEvent::DesyncDetected {
            tick,
            report: finding.report,
        });

        let notice = Message::new(
            self.config.protocol_version,
            MessageBody::DesyncNotice(crate::network::messages::DesyncNotice { tick }),
        );
        self.fan_out(vec![notice], &[
            ConnectionState::Joining,
            ConnectionState::Loading,
            ConnectionState::Playing,
        ]);
    }

    /// Periodic authority traffic: the rising tick bound and keep-alive
    /// probes; client-side id block renewal.
    fn pump_network(&mut self) {
        match self.role {
            SessionRole::Authority => {
                if !self.frozen && !self.domains.is_empty() {
                    let target = self.tick + u64::from(self.config.command_lead_ticks);
                    if target > self.tick_until {
                        self.tick_until = target;
                        let msg = Message::new(
                            self.config.protocol_version,
                            MessageBody::TimeBound(TimeBound { tick_until: target }),
                        );
                        self.fan_out(vec![msg], &[
                            ConnectionState::Joining,
                            ConnectionState::Loading,
                            ConnectionState::Playing,
                        ]);
                    }
                }

                if self.keep_alive_timer.elapsed() >= KEEP_ALIVE_INTERVAL {
                    self.keep_alive_timer = Instant::now();
                    self.next_echo = self.next_echo.wrapping_add(1);
                    let msg = Message::new(
                        self.config.protocol_version,
                        MessageBody::KeepAlive(KeepAlive {
                            echo: self.next_echo,
                            status: 0,
                        }),
                    );
                    self.fan_out(vec![msg], &[
                        ConnectionState::Joining,
                        ConnectionState::Loading,
                        ConnectionState::Playing,
                    ]);
                }
            }
            SessionRole::Client => {
                let needs_renewal = self
                    .id_block
                    .as_ref()
                    .map_or(false, IdBlock::needs_renewal);
                if !needs_renewal {
                    self.id_block_requested = false;
                } else if !self.id_block_requested {
                    if let Some(conn) = self.connections.first() {
                        if conn.state() == ConnectionState::Playing {
                            self.id_block_requested = true;
                            self.outbound.push_back((
                                conn.id(),
                                Message::new(
                                    self.config.protocol_version,
                                    MessageBody::IdBlockRequest,
                                ),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn fan_out(&mut self, messages: Vec<Message>, states: &[ConnectionState]) {
        if messages.is_empty() {
            return;
        }
        let targets: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|conn| states.contains(&conn.state()))
            .map(Connection::id)
            .collect();
        for conn in targets {
            for msg in &messages {
                self.outbound.push_back((conn, msg.clone()));
            }
        }
    }

    // ========
    // commands
    // ========

    /// Submits a command for deterministic execution on every peer.
    ///
    /// On the authority the command is stamped immediately and broadcast; on a
    /// client it is sent to the authority, which stamps it and broadcasts it
    /// back to everyone (this peer included). Peers never choose execution
    /// ticks themselves.
    pub fn submit_command(
        &mut self,
        target: DomainId,
        kind: CommandKind,
        payload: Vec<u8>,
    ) -> Result<(), BastionError> {
        if self.frozen {
            return Err(BastionError::Desynchronized { tick: self.tick });
        }
        let player = self.local_player.ok_or_else(|| BastionError::InvalidRequest {
            info: "no player identity yet; join must complete first".to_owned(),
        })?;

        match self.role {
            SessionRole::Authority => {
                // One lead beyond the broadcast bound: no peer's clock can
                // have passed the stamp, even one parked exactly on the bound.
                let tick = self.tick_until + u64::from(self.config.command_lead_ticks);
                let seq = self.scheduler.next_seq();
                self.admit_local(ScheduledCommand {
                    tick,
                    target,
                    kind,
                    payload: payload.clone(),
                    seq,
                    issued_by_self: true,
                });
                let msg = Message::new(
                    self.config.protocol_version,
                    MessageBody::CommandBroadcast(CommandBroadcast {
                        tick,
                        target,
                        kind: kind.as_u16(),
                        payload,
                        seq,
                        player,
                    }),
                );
                self.fan_out(vec![msg], &[
                    ConnectionState::Joining,
                    ConnectionState::Loading,
                    ConnectionState::Playing,
                ]);
                Ok(())
            }
            SessionRole::Client => {
                let conn = self
                    .connections
                    .first()
                    .ok_or_else(|| BastionError::InvalidRequest {
                        info: "not connected to an authority".to_owned(),
                    })?;
                if conn.state() != ConnectionState::Playing {
                    return Err(BastionError::WrongState {
                        state: conn.state(),
                        context: "commands can only be submitted while playing".to_owned(),
                    });
                }
                // Tick and sequence are placeholders; the authority stamps both.
                self.outbound.push_back((
                    conn.id(),
                    Message::new(
                        self.config.protocol_version,
                        MessageBody::CommandBroadcast(CommandBroadcast {
                            tick: Tick::ZERO,
                            target,
                            kind: kind.as_u16(),
                            payload,
                            seq: 0,
                            player,
                        }),
                    ),
                ));
                Ok(())
            }
        }
    }

    fn admit_local(&mut self, cmd: ScheduledCommand) {
        let clock = self
            .domains
            .iter()
            .find(|domain| domain.id() == cmd.target)
            .map_or(self.tick, SimDomain::clock);
        let (target, tick) = (cmd.target, cmd.tick);
        match self.scheduler.enqueue(cmd, clock) {
            EnqueueOutcome::Accepted => {}
            EnqueueOutcome::RejectedStale { clock } => {
                self.events.push_back(BastionEvent::CommandDropped {
                    target,
                    tick,
                    clock,
                });
            }
            EnqueueOutcome::RejectedUnknownKind | EnqueueOutcome::RejectedUnknownDomain => {
                self.events.push_back(BastionEvent::CommandDropped {
                    target,
                    tick,
                    clock,
                });
            }
        }
    }

    // ====================
    // skip / pacing control
    // ====================

    /// Fast-forwards to `target`, spending at most the configured wall-clock
    /// slice per frame. `on_complete` fires on the frame the target is
    /// reached, always on a tick boundary.
    pub fn skip_to(
        &mut self,
        target: Tick,
        on_complete: Option<Box<dyn FnOnce(Tick)>>,
    ) -> Result<(), BastionError> {
        if target < self.tick {
            return Err(BastionError::InvalidRequest {
                info: format!("cannot skip backwards to {} from {}", target, self.tick),
            });
        }
        self.driver.begin_skip(target, on_complete);
        Ok(())
    }

    /// Raises the authoritative tick bound locally.
    ///
    /// Intended for offline replay, where no authority exists to broadcast
    /// time-bound updates. Bounds only ever rise; a lower value is a no-op.
    pub fn raise_tick_until(&mut self, bound: Tick) {
        if bound > self.tick_until {
            self.tick_until = bound;
        }
    }

    /// Cancels an active skip; the session is parked on a tick boundary.
    pub fn cancel_skip(&mut self) {
        if self.driver.cancel_skip() {
            self.events
                .push_back(BastionEvent::SkipCancelled { tick: self.tick });
        }
    }

    /// Suspends ticking while a blocking modal (saving, a dialog) is up.
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    /// Reconfigures one domain's speed.
    pub fn set_speed(&mut self, id: DomainId, speed: crate::SimSpeed) -> Result<(), BastionError> {
        match self.domains.iter_mut().find(|domain| domain.id() == id) {
            Some(domain) => {
                domain.set_speed(speed);
                Ok(())
            }
            None => Err(BastionError::InvalidRequest {
                info: format!("no domain {} registered", id),
            }),
        }
    }

    // ========
    // identity
    // ========

    /// Mints the next globally-unique object id from the local block.
    pub fn mint_id(&mut self) -> Result<u64, BastionError> {
        match self.id_block.as_mut().and_then(IdBlock::next) {
            Some(id) => Ok(id),
            None => {
                // Authority can always self-serve a new block; clients must
                // wait for a grant (requested during the frame pump).
                if self.role == SessionRole::Authority {
                    let mut block = self.id_alloc.allocate();
                    let id = block.next().ok_or(BastionError::IdExhausted)?;
                    self.id_block = Some(block);
                    Ok(id)
                } else {
                    Err(BastionError::IdExhausted)
                }
            }
        }
    }

    // ==========
    // diagnostics
    // ==========

    /// Records a named diagnostic event into the session's bundle timeline.
    pub fn note_event(&mut self, name: impl Into<String>) {
        if self.named_events.len() >= NAMED_EVENT_CAP {
            self.named_events.remove(0);
        }
        self.named_events.push(NamedEvent {
            tick: self.tick,
            name: name.into(),
        });
    }

    /// Captures the whole session for transfer, replay, or inspection.
    pub fn bundle(&self) -> Result<SessionBundle, BastionError> {
        snapshot::capture_session(
            &self.domains,
            &self.scheduler,
            self.tick,
            self.tick_until,
            &self.named_events,
        )
    }

    /// Rebuilds the session from a bundle (offline replay, or reload after a
    /// desync freeze). Requires a domain factory: sessions created with
    /// [`Session::join`] have one.
    pub fn restore_bundle(&mut self, bundle: &SessionBundle) -> Result<(), BastionError> {
        let Some(factory) = self.factory.as_mut() else {
            return Err(BastionError::InvalidRequest {
                info: "no domain factory available for restore".to_owned(),
            });
        };
        snapshot::restore_session(bundle, &mut self.domains, &mut self.scheduler, factory)?;
        self.tick = bundle.start_tick;
        self.tick_until = bundle.tick_until;
        self.frozen = false;
        self.detector = DesyncDetector::new();
        self.desync_bundle = None;
        self.window.restart_at(self.tick, &mut self.domains);
        info!(
            "session restored from bundle at tick {} (bound {})",
            self.tick, self.tick_until
        );
        Ok(())
    }

    /// Takes the diagnostic bundle captured by the first confirmed desync.
    pub fn take_desync_bundle(&mut self) -> Option<DesyncBundle> {
        self.desync_bundle.take()
    }

    // =========
    // teardown
    // =========

    /// Closes a connection (local decision or transport loss report).
    ///
    /// On a client this tears the session down: domains and pending commands
    /// are cleared and only a fresh join can rebuild them.
    pub fn disconnect(&mut self, conn_id: ConnId, reason: DisconnectReason) {
        let index = conn_id.as_usize();
        let Some(conn) = self.connections.get_mut(index) else {
            return;
        };
        if conn.state() == ConnectionState::Disconnected {
            return;
        }
        conn.set_state(ConnectionState::Disconnected);
        self.outbound.push_back((
            conn_id,
            Message::new(
                self.config.protocol_version,
                MessageBody::Disconnect(Disconnect {
                    reason: reason.clone(),
                }),
            ),
        ));
        if self.role == SessionRole::Client {
            self.domains.clear();
            self.scheduler.clear();
        }
        self.events.push_back(BastionEvent::Disconnected {
            conn: conn_id,
            reason,
        });
    }

    // =========
    // accessors
    // =========

    /// This session's role.
    #[must_use]
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// The current global tick.
    #[must_use]
    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    /// The authoritative bound ticking may not pass.
    #[must_use]
    pub fn tick_until(&self) -> Tick {
        self.tick_until
    }

    /// `true` once a desync froze the session.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// `true` while a skip (fast-forward) is active.
    #[must_use]
    pub fn is_skipping(&self) -> bool {
        self.driver.is_skipping()
    }

    /// The local player identity, once assigned.
    #[must_use]
    pub fn local_player(&self) -> Option<PlayerId> {
        self.local_player
    }

    /// The last window start both sides fully agreed on.
    #[must_use]
    pub fn last_good_tick(&self) -> Option<Tick> {
        self.detector.last_good_tick()
    }

    /// All registered domains, in id order.
    #[must_use]
    pub fn domains(&self) -> &[SimDomain] {
        &self.domains
    }

    /// One domain by id.
    #[must_use]
    pub fn domain(&self, id: DomainId) -> Option<&SimDomain> {
        self.domains.iter().find(|domain| domain.id() == id)
    }

    /// One connection by id.
    #[must_use]
    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(id.as_usize())
    }

    /// All connections ever made, including disconnected ones.
    #[must_use]
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Commands dropped since session start (stale or unknown).
    #[must_use]
    pub fn dropped_commands(&self) -> u64 {
        self.scheduler.dropped_count()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("tick", &self.tick)
            .field("tick_until", &self.tick_until)
            .field("frozen", &self.frozen)
            .field("domains", &self.domains.len())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TickContext;
    use crate::scheduler::CommandRegistry;

    const FRAME: Duration = Duration::from_millis(16);

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
            Ok(vec![0; 16])
        }

        fn restore(&mut self, _bytes: &[u8]) -> Result<(), BastionError> {
            Ok(())
        }
    }

    fn scheduler() -> CommandScheduler {
        let mut registry = CommandRegistry::new();
        registry.register(CommandKind::new(1), "test");
        CommandScheduler::new(registry)
    }

    fn hosted() -> Session {
        let mut session = Session::host(
            SessionConfig::default(),
            scheduler(),
            DefsManifest::default(),
        );
        session
            .register_domain(DomainId::new(0), 42, Box::new(Noop))
            .expect("register");
        session
    }

    #[test]
    fn host_starts_at_tick_zero_as_player_zero() {
        let session = hosted();
        assert_eq!(session.current_tick(), Tick::ZERO);
        assert_eq!(session.role(), SessionRole::Authority);
        assert_eq!(session.local_player(), Some(PlayerId::new(0)));
        assert!(!session.is_frozen());
    }

    #[test]
    fn authority_raises_its_own_bound_and_ticks() {
        let mut session = hosted();
        for _ in 0..60 {
            session.advance_frame(FRAME);
        }
        assert!(session.current_tick() > Tick::ZERO);
        assert_eq!(
            session.tick_until().since(session.current_tick()),
            u64::from(session.config.command_lead_ticks)
        );
    }

    #[test]
    fn duplicate_domain_registration_fails() {
        let mut session = hosted();
        let result = session.register_domain(DomainId::new(0), 1, Box::new(Noop));
        assert!(result.is_err());
    }

    #[test]
    fn authority_command_executes_without_peers() {
        let mut session = hosted();
        session.advance_frame(FRAME);
        session
            .submit_command(DomainId::new(0), CommandKind::new(1), vec![1])
            .expect("submit");
        for _ in 0..120 {
            session.advance_frame(FRAME);
        }
        // Command was consumed at its stamped tick, not dropped
        assert_eq!(session.dropped_commands(), 0);
        assert_eq!(session.scheduler.pending_len(), 0);
    }

    #[test]
    fn blocking_halts_ticking() {
        let mut session = hosted();
        session.set_blocking(true);
        for _ in 0..30 {
            session.advance_frame(FRAME);
        }
        assert_eq!(session.current_tick(), Tick::ZERO);

        session.set_blocking(false);
        for _ in 0..30 {
            session.advance_frame(FRAME);
        }
        assert!(session.current_tick() > Tick::ZERO);
    }

    #[test]
    fn skip_to_past_is_rejected() {
        let mut session = hosted();
        for _ in 0..120 {
            session.advance_frame(FRAME);
        }
        let parked = session.current_tick();
        assert!(parked > Tick::ZERO);
        assert!(session.skip_to(Tick::ZERO, None).is_err());
        assert_eq!(session.current_tick(), parked);
    }

    #[test]
    fn mint_id_authority_renews_itself() {
        let mut session = hosted();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..10_000 {
            let id = session.mint_id().expect("mint");
            assert!(seen.insert(id), "duplicate id {}", id);
        }
    }

    #[test]
    fn client_without_connection_cannot_submit() {
        let mut session = Session::join(
            SessionConfig::default(),
            scheduler(),
            DefsManifest::default(),
            "newcomer",
            Box::new(|_| Box::new(Noop)),
        );
        assert!(session
            .submit_command(DomainId::new(0), CommandKind::new(1), Vec::new())
            .is_err());
    }

    #[test]
    fn client_handshake_goes_out_on_connect() {
        let mut session = Session::join(
            SessionConfig::default(),
            scheduler(),
            DefsManifest::default(),
            "newcomer",
            Box::new(|_| Box::new(Noop)),
        );
        let conn = session.connect_to_authority().expect("connect");
        let outbound: Vec<_> = session.outbound_messages().collect();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].0, conn);
        assert!(matches!(
            outbound[0].1.body,
            MessageBody::Handshake(ref h) if h.username == "newcomer"
        ));
        assert!(session.connect_to_authority().is_err());
    }

    #[test]
    fn note_event_is_bounded() {
        let mut session = hosted();
        for i in 0..(NAMED_EVENT_CAP + 10) {
            session.note_event(format!("event {}", i));
        }
        assert_eq!(session.named_events.len(), NAMED_EVENT_CAP);
        assert_eq!(session.named_events[0].name, "event 10");
    }

    #[test]
    fn bundle_captures_all_domains() {
        let mut session = hosted();
        session
            .register_domain(DomainId::GLOBAL, 7, Box::new(Noop))
            .expect("register world");
        for _ in 0..30 {
            session.advance_frame(FRAME);
        }
        let bundle = session.bundle().expect("bundle");
        assert_eq!(bundle.snapshots.len(), 2);
        assert_eq!(bundle.start_tick, session.current_tick());
    }

    #[test]
    fn events_drain_once() {
        let mut session = hosted();
        session.cancel_skip(); // no-op, no event
        session.skip_to(Tick::new(5), None).expect("skip");
        session.cancel_skip();
        let events: Vec<_> = session.events().collect();
        assert_eq!(events.len(), 1);
        assert!(session.events().next().is_none());
    }
}
