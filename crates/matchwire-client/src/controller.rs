//! The peer session controller: the client-side orchestrator.
//!
//! One background task owns all mutable session state — the
//! synchronizer, the conflict resolver, the reconnection manager, the
//! request-correlation table — and multiplexes four inputs: commands
//! from the public handle, inbound envelopes from the transport,
//! transport state transitions, and the auto-sync timer. The public
//! [`PeerSessionController`] is a thin handle that sends commands and
//! awaits replies, with request deadlines enforced on the caller's side
//! so a missing hub response can never wedge the event loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};

use matchwire_protocol::{
    now_ms, Envelope, ErrorCode, GridPos, MatchMode, Message, MoveToken,
    PeerId, RoomId, StateDelta, StateSnapshot,
};
use matchwire_sync::{
    apply_delta, ConflictRecord, ConflictResolver, EngineState, Resolution,
    ResolutionPolicy, SyncMode, SyncPayload, SyncStats, Synchronizer,
};
use matchwire_transport::{ClientConfig, ClientTransport, ConnectionState};

use crate::{
    ClientError, GameSnapshot, KvStore, QualityBucket, QualityMonitor,
    ReconnectionManager, RecoveryConfig,
};

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Observable controller state.
///
/// ```text
/// Disconnected → Connecting → Connected → InLobby → InBattle
///                                 ↓   ↖      ↓          ↕
///                               InRoom ──────┴──→ InBattle → InRoom
/// any → Reconnecting → (previous) | Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting in the matchmaking queue.
    InLobby,
    InRoom,
    InBattle,
    Reconnecting,
    /// Terminal for the session: reconnect exhausted or recovery
    /// failed. The app must restart the flow.
    Error,
}

// ---------------------------------------------------------------------------
// Game engine seams
// ---------------------------------------------------------------------------

/// Read-only snapshot producer: the game engine's exposed state.
pub trait SnapshotSource: Send + Sync + 'static {
    fn capture(&self) -> EngineState;
}

/// Command interface into the game engine: apply the opponent's move.
pub trait MoveSink: Send + Sync + 'static {
    fn apply_opponent_move(&self, origin: &PeerId, token: &MoveToken);
}

/// The two seams bundled. The controller consumes the source and
/// drives the sink; it never reaches into the engine any other way.
#[derive(Clone)]
pub struct GameHooks {
    pub source: Arc<dyn SnapshotSource>,
    pub sink: Arc<dyn MoveSink>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the peer session controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub transport: ClientConfig,
    /// Deadline for room requests (create/join). Default 10 s.
    pub request_timeout: Duration,
    /// Client-side matchmaking search deadline. Default 60 s.
    pub match_timeout: Duration,
    /// Auto-sync cadence while in battle. Default 5 s.
    pub sync_interval: Duration,
    pub enable_auto_sync: bool,
    pub sync_mode: SyncMode,
    /// Conflict policy. Resolution runs client-side with server
    /// snapshots as authoritative input.
    pub policy: ResolutionPolicy,
    pub recovery: RecoveryConfig,
}

impl ControllerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            transport: ClientConfig::new(url),
            request_timeout: Duration::from_secs(10),
            match_timeout: Duration::from_secs(60),
            sync_interval: Duration::from_secs(5),
            enable_auto_sync: true,
            sync_mode: SyncMode::default(),
            policy: ResolutionPolicy::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Public result shapes
// ---------------------------------------------------------------------------

/// A successful room join/create.
#[derive(Debug, Clone)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub opponent_id: Option<PeerId>,
    pub peer_count: usize,
}

/// A successful matchmaking pairing.
#[derive(Debug, Clone)]
pub struct MatchSummary {
    pub room_id: RoomId,
    pub opponent_id: Option<PeerId>,
}

// ---------------------------------------------------------------------------
// Observers and commands
// ---------------------------------------------------------------------------

enum Observer {
    OpponentMove(Box<dyn Fn(&PeerId, &MoveToken) + Send + Sync>),
    RemoteState(Box<dyn Fn(&StateSnapshot) + Send + Sync>),
    Conflict(Box<dyn Fn(&ConflictRecord, &Resolution) + Send + Sync>),
    SessionError(Box<dyn Fn(ErrorCode, &str) + Send + Sync>),
    RoomEvent(Box<dyn Fn(&Message) + Send + Sync>),
}

#[derive(Default)]
struct Observers {
    moves: Vec<Box<dyn Fn(&PeerId, &MoveToken) + Send + Sync>>,
    remote: Vec<Box<dyn Fn(&StateSnapshot) + Send + Sync>>,
    conflicts: Vec<Box<dyn Fn(&ConflictRecord, &Resolution) + Send + Sync>>,
    errors: Vec<Box<dyn Fn(ErrorCode, &str) + Send + Sync>>,
    room: Vec<Box<dyn Fn(&Message) + Send + Sync>>,
}

enum Cmd {
    CreateRoom {
        reply: oneshot::Sender<Result<RoomId, ClientError>>,
    },
    JoinRoom {
        room_id: RoomId,
        spectate: bool,
        reply: oneshot::Sender<Result<RoomSummary, ClientError>>,
    },
    LeaveRoom {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    FindMatch {
        mode: MatchMode,
        reply: oneshot::Sender<Result<MatchSummary, ClientError>>,
    },
    CancelMatch,
    ExecuteMove {
        pos_a: GridPos,
        pos_b: GridPos,
        reply: oneshot::Sender<Result<u64, ClientError>>,
    },
    SyncNow {
        terminal: bool,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Observe(Observer),
    Stats {
        reply: oneshot::Sender<SyncStats>,
    },
    Quality {
        reply: oneshot::Sender<(Option<QualityBucket>, Option<f64>)>,
    },
    Shutdown,
}

/// An in-flight correlated request.
enum Pending {
    CreateRoom(oneshot::Sender<Result<RoomId, ClientError>>),
    JoinRoom {
        spectate: bool,
        reply: oneshot::Sender<Result<RoomSummary, ClientError>>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// The client-side orchestrator handle. Cheap to clone.
#[derive(Clone)]
pub struct PeerSessionController {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    state_rx: watch::Receiver<SessionState>,
    transport: ClientTransport,
    request_timeout: Duration,
    match_timeout: Duration,
}

impl PeerSessionController {
    /// Connects to the hub and starts the session event loop.
    ///
    /// `store` backs the reconnection manager's durable snapshot copy.
    pub async fn connect<S: KvStore>(
        config: ControllerConfig,
        hooks: GameHooks,
        store: S,
    ) -> Result<Self, ClientError> {
        let (transport, inbound) = ClientTransport::connect(
            config.transport.clone(),
            PeerId::default(),
        )
        .await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);

        let task = ControllerTask {
            synchronizer: Synchronizer::new(config.sync_mode),
            resolver: ConflictResolver::new(config.policy),
            recovery: ReconnectionManager::new(
                store,
                config.recovery.clone(),
            ),
            quality: QualityMonitor::new(),
            transport_state: transport.subscribe_state(),
            latency_rx: transport.subscribe_latency(),
            sync_interval: config.sync_interval,
            enable_auto_sync: config.enable_auto_sync,
            pending_recovery: None,
            hooks,
            transport: transport.clone(),
            inbound,
            cmd_rx,
            state_tx,
            observers: Observers::default(),
            pending: HashMap::new(),
            match_waiter: None,
            room: None,
            opponent: None,
            remote_state: None,
            move_history: Vec::new(),
            own_moves: 0,
            next_message_id: 1,
            disconnected_at: None,
            spectating: false,
        };
        tokio::spawn(task.run());

        Ok(Self {
            cmd_tx,
            state_rx,
            transport,
            request_timeout: config.request_timeout,
            match_timeout: config.match_timeout,
        })
    }

    /// Creates a room on the hub and takes the host slot.
    pub async fn create_room(&self) -> Result<RoomId, ClientError> {
        self.request(
            |reply| Cmd::CreateRoom { reply },
            "create_room",
            self.request_timeout,
        )
        .await
    }

    /// Joins an existing room as a player.
    pub async fn join_room(
        &self,
        room_id: RoomId,
    ) -> Result<RoomSummary, ClientError> {
        self.request(
            |reply| Cmd::JoinRoom {
                room_id,
                spectate: false,
                reply,
            },
            "join_room",
            self.request_timeout,
        )
        .await
    }

    /// Joins an existing room as a read-only spectator.
    pub async fn spectate_room(
        &self,
        room_id: RoomId,
    ) -> Result<RoomSummary, ClientError> {
        self.request(
            |reply| Cmd::JoinRoom {
                room_id,
                spectate: true,
                reply,
            },
            "spectate_room",
            self.request_timeout,
        )
        .await
    }

    /// Leaves the current room.
    pub async fn leave_room(&self) -> Result<(), ClientError> {
        self.request(
            |reply| Cmd::LeaveRoom { reply },
            "leave_room",
            self.request_timeout,
        )
        .await
    }

    /// Enters the matchmaking queue and waits for a pairing. Cancels
    /// the search (CANCEL_MATCH) if none arrives within the match
    /// timeout.
    pub async fn find_match(
        &self,
        mode: MatchMode,
    ) -> Result<MatchSummary, ClientError> {
        let result = self
            .request(
                |reply| Cmd::FindMatch { mode, reply },
                "find_match",
                self.match_timeout,
            )
            .await;
        if matches!(result, Err(ClientError::Timeout { .. })) {
            let _ = self.cmd_tx.send(Cmd::CancelMatch);
        }
        result
    }

    /// Executes one of this player's moves: numbers it, records it,
    /// and ships it. Returns the assigned move number. Turn violations
    /// come back asynchronously as ERROR frames through the error
    /// observer.
    pub async fn execute_move(
        &self,
        pos_a: GridPos,
        pos_b: GridPos,
    ) -> Result<u64, ClientError> {
        self.request(
            |reply| Cmd::ExecuteMove {
                pos_a,
                pos_b,
                reply,
            },
            "execute_move",
            self.request_timeout,
        )
        .await
    }

    /// Produces a snapshot immediately and ships it (full or delta per
    /// the sync mode). `terminal` marks the final sync of a finished
    /// game.
    pub async fn sync_now(&self, terminal: bool) -> Result<(), ClientError> {
        self.request(
            |reply| Cmd::SyncNow { terminal, reply },
            "sync_now",
            self.request_timeout,
        )
        .await
    }

    /// This producer's sync statistics.
    pub async fn sync_stats(&self) -> Result<SyncStats, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Stats { reply: tx })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Current connection quality: bucket and jitter.
    pub async fn quality(
        &self,
    ) -> Result<(Option<QualityBucket>, Option<f64>), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Quality { reply: tx })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    // -- Observers --------------------------------------------------------

    /// Observes the opponent's (and, when spectating, both players')
    /// moves.
    pub fn on_opponent_move(
        &self,
        f: impl Fn(&PeerId, &MoveToken) + Send + Sync + 'static,
    ) {
        let _ = self
            .cmd_tx
            .send(Cmd::Observe(Observer::OpponentMove(Box::new(f))));
    }

    /// Observes every accepted remote state (post conflict
    /// resolution).
    pub fn on_remote_state(
        &self,
        f: impl Fn(&StateSnapshot) + Send + Sync + 'static,
    ) {
        let _ = self
            .cmd_tx
            .send(Cmd::Observe(Observer::RemoteState(Box::new(f))));
    }

    /// Observes detected conflicts and their resolutions.
    pub fn on_conflict(
        &self,
        f: impl Fn(&ConflictRecord, &Resolution) + Send + Sync + 'static,
    ) {
        let _ = self
            .cmd_tx
            .send(Cmd::Observe(Observer::Conflict(Box::new(f))));
    }

    /// Observes session-logical errors the hub reports outside a
    /// correlated request (NOT_YOUR_TURN on a move, recovery failures).
    pub fn on_error(
        &self,
        f: impl Fn(ErrorCode, &str) + Send + Sync + 'static,
    ) {
        let _ = self
            .cmd_tx
            .send(Cmd::Observe(Observer::SessionError(Box::new(f))));
    }

    /// Observes room notifications (GAME_START/GAME_END, players
    /// leaving, disconnecting, returning, chat).
    pub fn on_room_event(
        &self,
        f: impl Fn(&Message) + Send + Sync + 'static,
    ) {
        let _ = self
            .cmd_tx
            .send(Cmd::Observe(Observer::RoomEvent(Box::new(f))));
    }

    // -- Introspection ----------------------------------------------------

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn peer_id(&self) -> PeerId {
        self.transport.peer_id()
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.transport.latency_ms()
    }

    /// Shuts the session down (terminal).
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ClientError>>) -> Cmd,
        operation: &'static str,
        deadline: Duration,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| ClientError::Closed)?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout { operation }),
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct ControllerTask<S: KvStore> {
    hooks: GameHooks,
    transport: ClientTransport,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    state_tx: watch::Sender<SessionState>,
    transport_state: watch::Receiver<ConnectionState>,
    latency_rx: watch::Receiver<Option<f64>>,
    observers: Observers,
    pending: HashMap<String, Pending>,
    match_waiter: Option<oneshot::Sender<Result<MatchSummary, ClientError>>>,
    synchronizer: Synchronizer,
    resolver: ConflictResolver,
    recovery: ReconnectionManager<S>,
    quality: QualityMonitor,
    sync_interval: Duration,
    enable_auto_sync: bool,
    /// Set while a reconnect's recovery handshake is waiting for the
    /// room's replayed state sync; holds the outage duration the merge
    /// re-validates.
    pending_recovery: Option<Duration>,
    room: Option<RoomId>,
    opponent: Option<PeerId>,
    /// The opponent's latest accepted state — the base deltas apply to.
    remote_state: Option<StateSnapshot>,
    move_history: Vec<MoveToken>,
    /// This player's own move counter (monotone per room membership).
    own_moves: u64,
    next_message_id: u64,
    disconnected_at: Option<Instant>,
    spectating: bool,
}

impl<S: KvStore> ControllerTask<S> {
    async fn run(mut self) {
        let mut autosync = tokio::time::interval(self.sync_interval);
        autosync
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        autosync.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(Cmd::Shutdown) => {
                            // Polite goodbye first: DISCONNECT frees the
                            // hub-side session immediately instead of
                            // leaving it to the grace window.
                            let _ = self.send(
                                Message::Disconnect {
                                    peer_id: self.transport.peer_id(),
                                },
                                None,
                            );
                            self.transport.close();
                            self.set_state(SessionState::Disconnected);
                            break;
                        }
                        Some(cmd) => self.handle_cmd(cmd),
                    }
                }

                envelope = self.inbound.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(envelope),
                        // The transport's event loop ended; its state
                        // watch carries the verdict.
                        None => {
                            self.handle_transport_state();
                            break;
                        }
                    }
                }

                changed = self.transport_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.handle_transport_state();
                }

                changed = self.latency_rx.changed() => {
                    if changed.is_ok() {
                        if let Some(sample) = *self.latency_rx.borrow() {
                            self.quality.record(sample);
                        }
                    }
                }

                _ = autosync.tick() => {
                    if self.enable_auto_sync
                        && !self.spectating
                        && *self.state_tx.borrow() == SessionState::InBattle
                    {
                        if let Err(e) = self.do_sync(false) {
                            tracing::debug!(error = %e, "auto-sync failed");
                        }
                    }
                }
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() != state {
            tracing::debug!(?state, "session state");
            let _ = self.state_tx.send(state);
        }
    }

    fn next_message_id(&mut self) -> String {
        let id = self.next_message_id;
        self.next_message_id += 1;
        format!("m-{id}")
    }

    fn send(&self, message: Message, message_id: Option<String>) -> Result<(), ClientError> {
        let mut envelope = Envelope::new(message, self.transport.peer_id());
        envelope.message_id = message_id;
        self.transport.send(envelope)?;
        Ok(())
    }

    // -- Commands ---------------------------------------------------------

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::CreateRoom { reply } => {
                let message_id = self.next_message_id();
                let message = Message::CreateRoom {
                    peer_id: self.transport.peer_id(),
                };
                match self.send(message, Some(message_id.clone())) {
                    Ok(()) => {
                        self.pending
                            .insert(message_id, Pending::CreateRoom(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            Cmd::JoinRoom {
                room_id,
                spectate,
                reply,
            } => {
                let message_id = self.next_message_id();
                let message = Message::JoinRoom {
                    room_id,
                    peer_id: self.transport.peer_id(),
                    spectate,
                };
                match self.send(message, Some(message_id.clone())) {
                    Ok(()) => {
                        self.pending.insert(
                            message_id,
                            Pending::JoinRoom { spectate, reply },
                        );
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            Cmd::LeaveRoom { reply } => {
                let Some(room_id) = self.room.clone() else {
                    let _ = reply.send(Err(ClientError::InvalidState(
                        "not in a room".into(),
                    )));
                    return;
                };
                let message = Message::LeaveRoom {
                    room_id,
                    peer_id: self.transport.peer_id(),
                };
                let result = self.send(message, None);
                self.exit_room();
                let _ = reply.send(result);
            }

            Cmd::FindMatch { mode, reply } => {
                if self.match_waiter.is_some() {
                    let _ = reply.send(Err(ClientError::InvalidState(
                        "already searching".into(),
                    )));
                    return;
                }
                match self.send(Message::FindMatch { mode }, None) {
                    Ok(()) => {
                        self.match_waiter = Some(reply);
                        self.set_state(SessionState::InLobby);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            Cmd::CancelMatch => {
                if self.match_waiter.take().is_some() {
                    let _ = self.send(Message::CancelMatch, None);
                    self.set_state(SessionState::Connected);
                }
            }

            Cmd::ExecuteMove {
                pos_a,
                pos_b,
                reply,
            } => {
                let result = self.execute_move(pos_a, pos_b);
                let _ = reply.send(result);
            }

            Cmd::SyncNow { terminal, reply } => {
                let _ = reply.send(self.do_sync(terminal));
            }

            Cmd::Observe(observer) => match observer {
                Observer::OpponentMove(f) => self.observers.moves.push(f),
                Observer::RemoteState(f) => self.observers.remote.push(f),
                Observer::Conflict(f) => self.observers.conflicts.push(f),
                Observer::SessionError(f) => self.observers.errors.push(f),
                Observer::RoomEvent(f) => self.observers.room.push(f),
            },

            Cmd::Stats { reply } => {
                let _ = reply.send(self.synchronizer.stats().clone());
            }

            Cmd::Quality { reply } => {
                let _ = reply
                    .send((self.quality.bucket(), self.quality.jitter_ms()));
            }

            // Handled by the run loop before dispatch.
            Cmd::Shutdown => {}
        }
    }

    fn execute_move(
        &mut self,
        pos_a: GridPos,
        pos_b: GridPos,
    ) -> Result<u64, ClientError> {
        if *self.state_tx.borrow() != SessionState::InBattle {
            return Err(ClientError::InvalidState(
                "not in battle".into(),
            ));
        }
        if self.spectating {
            return Err(ClientError::InvalidState(
                "spectators cannot move".into(),
            ));
        }
        let Some(room_id) = self.room.clone() else {
            return Err(ClientError::InvalidState("not in a room".into()));
        };

        let token = MoveToken {
            pos_a,
            pos_b,
            move_number: self.own_moves + 1,
        };
        self.send(Message::Move { room_id, token }, None)?;
        self.own_moves += 1;
        self.move_history.push(token);
        Ok(token.move_number)
    }

    fn do_sync(&mut self, terminal: bool) -> Result<(), ClientError> {
        let Some(room_id) = self.room.clone() else {
            return Err(ClientError::InvalidState("not in a room".into()));
        };

        let view = self.hooks.source.capture();
        let message = match self.synchronizer.next_sync(view) {
            SyncPayload::Full(snapshot) => Message::StateSync {
                room_id,
                state: Some(snapshot),
                delta: None,
                terminal,
            },
            SyncPayload::Delta(delta) => Message::StateSync {
                room_id,
                state: None,
                delta: Some(delta),
                terminal,
            },
        };
        self.send(message, None)?;

        // Every produced snapshot is a recovery point.
        if let Some(current) = self.synchronizer.current().cloned() {
            self.save_recovery_point(current);
        }
        Ok(())
    }

    fn save_recovery_point(&mut self, state: StateSnapshot) {
        let Some(room_id) = self.room.clone() else {
            return;
        };
        let blob = GameSnapshot {
            timestamp: now_ms(),
            room_id,
            peer_id: self.transport.peer_id(),
            opponent_id: self.opponent.clone(),
            state,
            move_history: self.move_history.clone(),
            last_synced_move_number: self.own_moves,
        };
        if let Err(e) = self.recovery.save_snapshot(blob) {
            tracing::warn!(error = %e, "snapshot save failed");
        }
    }

    // -- Inbound ----------------------------------------------------------

    fn handle_envelope(&mut self, envelope: Envelope) {
        let message_id = envelope.message_id.clone();
        let origin = envelope.peer_id.clone();

        match envelope.message {
            Message::RoomCreated { room_id } => {
                if let Some(Pending::CreateRoom(reply)) =
                    self.take_pending(message_id.as_deref())
                {
                    self.enter_room(room_id.clone(), None, false);
                    let _ = reply.send(Ok(room_id));
                }
            }

            Message::RoomJoined {
                room_id,
                opponent_id,
                peer_count,
            } => {
                if let Some(Pending::JoinRoom { spectate, reply }) =
                    self.take_pending(message_id.as_deref())
                {
                    self.enter_room(
                        room_id.clone(),
                        opponent_id.clone(),
                        spectate,
                    );
                    let _ = reply.send(Ok(RoomSummary {
                        room_id,
                        opponent_id,
                        peer_count,
                    }));
                }
            }

            Message::RoomNotFound { room_id } => {
                self.reject_pending(
                    message_id.as_deref(),
                    ErrorCode::RoomNotFound,
                    format!("room {room_id} not found"),
                );
            }

            Message::RoomFull { room_id } => {
                self.reject_pending(
                    message_id.as_deref(),
                    ErrorCode::RoomFull,
                    format!("room {room_id} is full"),
                );
            }

            ref message @ Message::GameStart {
                ref room_id,
                ref players,
                ref opponent_id,
                ..
            } => {
                let me = self.transport.peer_id();
                let opponent = opponent_id.clone().or_else(|| {
                    players.iter().find(|p| **p != me).cloned()
                });
                self.room = Some(room_id.clone());
                self.opponent = opponent.clone();
                self.transport.set_active_room(Some(room_id.clone()));
                self.set_state(SessionState::InBattle);

                if let Some(waiter) = self.match_waiter.take() {
                    let _ = waiter.send(Ok(MatchSummary {
                        room_id: room_id.clone(),
                        opponent_id: opponent,
                    }));
                }
                self.notify_room_event(message);
            }

            Message::Move { token, .. } => {
                self.move_history.push(token);
                self.hooks.sink.apply_opponent_move(&origin, &token);
                for f in &self.observers.moves {
                    f(&origin, &token);
                }
            }

            Message::StateSync {
                state: Some(snapshot),
                terminal: _,
                ..
            } => {
                self.handle_remote_snapshot(snapshot);
            }

            Message::StateSync {
                delta: Some(delta), ..
            } => {
                self.handle_remote_delta(delta);
            }

            Message::StateSync { .. } => {
                tracing::debug!("STATE_SYNC with neither state nor delta");
            }

            ref message @ Message::GameEnd { .. } => {
                if *self.state_tx.borrow() == SessionState::InBattle {
                    self.set_state(SessionState::InRoom);
                }
                if let Some(room_id) = self.room.clone() {
                    if let Err(e) = self.recovery.clear(&room_id) {
                        tracing::debug!(error = %e, "snapshot clear failed");
                    }
                }
                self.notify_room_event(message);
            }

            ref message @ (Message::PlayerLeft { .. }
            | Message::SpectatorLeft { .. }
            | Message::PlayerDisconnected { .. }
            | Message::PlayerReconnected { .. }
            | Message::Chat { .. }
            | Message::MatchQueued { .. }) => {
                self.notify_room_event(message);
            }

            Message::Error { code, message, .. } => {
                if !self.reject_pending(
                    message_id.as_deref(),
                    code,
                    message.clone(),
                ) {
                    for f in &self.observers.errors {
                        f(code, &message);
                    }
                }
            }

            other => {
                tracing::debug!(tag = other.tag(), "ignoring frame");
            }
        }
    }

    fn handle_remote_snapshot(&mut self, snapshot: StateSnapshot) {
        // The first sync after a reconnect is the room replaying its
        // authoritative state. That completes the recovery handshake —
        // the server-precedence merge — rather than flowing through the
        // ordinary divergence path.
        if let Some(outage) = self.pending_recovery.take() {
            let merged = self
                .recovery
                .recover_game_state(outage, Some(&snapshot));
            match merged {
                Ok(recovered) => {
                    self.remote_state = Some(snapshot);
                    for f in &self.observers.remote {
                        f(&recovered.state);
                    }
                    self.save_recovery_point(recovered.state);
                    return;
                }
                Err(error) => {
                    self.fail_recovery(error);
                    return;
                }
            }
        }

        if !self.synchronizer.accept_remote(&snapshot) {
            tracing::debug!(
                version = snapshot.version,
                "discarding stale remote snapshot"
            );
            return;
        }

        let local = self.synchronizer.current().cloned();
        if let Some(local) = local {
            if let Some(record) = self.resolver.detect(&local, &snapshot) {
                self.synchronizer.note_conflict();
                let resolution = self.resolver.resolve(&local, &snapshot);
                for f in &self.observers.conflicts {
                    f(&record, &resolution);
                }
                let resolved = resolution.resolved.clone();
                self.remote_state = Some(resolved.clone());
                for f in &self.observers.remote {
                    f(&resolved);
                }
                self.save_recovery_point(resolved);
                return;
            }
        }

        self.remote_state = Some(snapshot.clone());
        for f in &self.observers.remote {
            f(&snapshot);
        }
        self.save_recovery_point(snapshot);
    }

    fn handle_remote_delta(&mut self, delta: StateDelta) {
        if self.synchronizer.delta_signals_conflict(&delta) {
            self.synchronizer.note_conflict();
            tracing::debug!(
                base = delta.base_version,
                local = self.synchronizer.version(),
                "delta base predates local state"
            );
        }

        let Some(base) = self.remote_state.clone() else {
            tracing::debug!("delta arrived before any full snapshot");
            return;
        };

        match apply_delta(&base, &delta) {
            Ok(next) => {
                self.remote_state = Some(next.clone());
                for f in &self.observers.remote {
                    f(&next);
                }
                self.save_recovery_point(next);
            }
            Err(e) => {
                tracing::debug!(error = %e, "delta application failed");
            }
        }
    }

    // -- Transitions ------------------------------------------------------

    fn enter_room(
        &mut self,
        room_id: RoomId,
        opponent: Option<PeerId>,
        spectate: bool,
    ) {
        // GAME_START can outrun the ROOM_JOINED reply (the room fans
        // it out the instant the second slot fills). Entering a room
        // the battle already started in must not regress the state.
        let battle_already_started = *self.state_tx.borrow()
            == SessionState::InBattle
            && self.room.as_ref() == Some(&room_id);

        self.room = Some(room_id.clone());
        if opponent.is_some() {
            self.opponent = opponent;
        }
        self.spectating = spectate;
        self.own_moves = 0;
        self.move_history.clear();
        self.pending_recovery = None;
        self.transport.set_active_room(Some(room_id));
        if !battle_already_started {
            self.set_state(SessionState::InRoom);
        }
    }

    fn exit_room(&mut self) {
        self.room = None;
        self.opponent = None;
        self.remote_state = None;
        self.spectating = false;
        self.pending_recovery = None;
        self.transport.set_active_room(None);
        self.set_state(SessionState::Connected);
    }

    fn handle_transport_state(&mut self) {
        let transport_state = *self.transport_state.borrow();
        match transport_state {
            ConnectionState::Reconnecting => {
                self.disconnected_at.get_or_insert_with(Instant::now);
                self.set_state(SessionState::Reconnecting);
            }
            ConnectionState::Connected => {
                if let Some(since) = self.disconnected_at.take() {
                    let outage = since.elapsed();
                    if self.room.is_none() {
                        self.set_state(SessionState::Connected);
                        return;
                    }
                    // The recovery handshake proper: validate the
                    // outage against the recovery window and reload
                    // the last local snapshot. The transport already
                    // re-issued JOIN_ROOM, so the room's replayed sync
                    // lands next and completes the server-precedence
                    // merge in handle_remote_snapshot.
                    match self.recovery.recover_game_state(outage, None) {
                        Ok(recovered) => {
                            self.pending_recovery = Some(outage);
                            for f in &self.observers.remote {
                                f(&recovered.state);
                            }
                            self.set_state(SessionState::InBattle);
                        }
                        Err(error) => self.fail_recovery(error),
                    }
                }
            }
            ConnectionState::Failed => {
                for f in &self.observers.errors {
                    f(
                        ErrorCode::ReconnectionFailed,
                        "reconnect attempts exhausted",
                    );
                }
                self.set_state(SessionState::Error);
            }
            ConnectionState::Disconnected => {
                self.set_state(SessionState::Disconnected);
            }
            ConnectionState::Connecting => {
                self.set_state(SessionState::Connecting);
            }
        }
    }

    /// Recovery failed for good: surface the code, drop the dead room
    /// context, and park the session in Error — the app must restart
    /// the flow.
    fn fail_recovery(&mut self, error: ClientError) {
        let code = match &error {
            ClientError::RecoveryTimeout => ErrorCode::RecoveryTimeout,
            ClientError::NoSnapshot => ErrorCode::NoSnapshot,
            _ => ErrorCode::ReconnectionFailed,
        };
        let text = error.to_string();
        tracing::warn!(%code, error = %text, "recovery failed");
        for f in &self.observers.errors {
            f(code, &text);
        }
        self.room = None;
        self.opponent = None;
        self.remote_state = None;
        self.spectating = false;
        self.pending_recovery = None;
        self.transport.set_active_room(None);
        self.set_state(SessionState::Error);
    }

    // -- Small helpers ----------------------------------------------------

    fn take_pending(&mut self, message_id: Option<&str>) -> Option<Pending> {
        self.pending.remove(message_id?)
    }

    /// Completes a correlated request with a rejection. Returns whether
    /// a pending request consumed the error.
    fn reject_pending(
        &mut self,
        message_id: Option<&str>,
        code: ErrorCode,
        message: String,
    ) -> bool {
        match self.take_pending(message_id) {
            Some(Pending::CreateRoom(reply)) => {
                let _ = reply.send(Err(ClientError::Rejected { code, message }));
                true
            }
            Some(Pending::JoinRoom { reply, .. }) => {
                let _ = reply.send(Err(ClientError::Rejected { code, message }));
                true
            }
            None => false,
        }
    }

    fn notify_room_event(&self, message: &Message) {
        for f in &self.observers.room {
            f(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_match_protocol_timings() {
        let config = ControllerConfig::new("ws://127.0.0.1:9");
        assert_eq!(config.request_timeout.as_secs(), 10);
        assert_eq!(config.match_timeout.as_secs(), 60);
        assert_eq!(config.sync_interval.as_secs(), 5);
        assert!(config.enable_auto_sync);
        assert_eq!(config.sync_mode, SyncMode::Hybrid);
        assert_eq!(config.policy, ResolutionPolicy::ServerAuthoritative);
    }
}
