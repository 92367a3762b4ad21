//! Room actor: an isolated Tokio task that owns one battle session.
//!
//! Each room runs in its own task, communicating with the outside world
//! through an mpsc command channel. The actor serializes everything —
//! membership changes, move validation, snapshot storage, fanout — so
//! the room's invariants (0–2 players, append-only move log, strictly
//! increasing per-peer move numbers, turn alternation) hold without
//! locks. The only time-driven event is the awaiting-reconnect
//! deadline, which sits in the actor's `select!` beside the command
//! stream.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use matchwire_protocol::{
    now_ms, Envelope, Message, MoveToken, PeerId, RoomId, StateDelta,
    StateSnapshot,
};
use tokio::sync::{mpsc, oneshot};

use crate::{RoomConfig, RoomError};

/// Channel sender for delivering outbound envelopes to one peer's
/// connection writer.
pub type PeerSender = mpsc::UnboundedSender<Envelope>;

/// The role a peer was given when it joined a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomRole {
    Host,
    Guest,
    Spectator,
}

/// One fully validated, logged move.
#[derive(Debug, Clone)]
pub struct MoveRecord {
    pub token: MoveToken,
    pub origin: PeerId,
    /// Hub clock at acceptance — the authoritative ordering stamp.
    pub server_timestamp: u64,
}

/// What a successful join returned.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub room_id: RoomId,
    pub role: RoomRole,
    pub opponent_id: Option<PeerId>,
    /// Players + spectators currently present.
    pub peer_count: usize,
    pub started: bool,
    /// Whether this join re-attached a disconnected player rather than
    /// filling a fresh slot.
    pub rejoined: bool,
}

/// A metadata snapshot of the room, served to the registry sweeper and
/// to tests. Not the game state.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub player_count: usize,
    pub spectator_count: usize,
    pub started: bool,
    pub finished: bool,
    pub awaiting_reconnect: bool,
    pub move_count: usize,
    pub current_turn: Option<PeerId>,
    pub snapshot_version: Option<u64>,
    /// How long the room has been completely empty, if it is.
    pub empty_for: Option<Duration>,
    pub age: Duration,
}

/// Why a peer is being removed from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Voluntary LEAVE_ROOM (or clean disconnect).
    Left,
    /// The transport dropped; the slot may be held for reconnection.
    ConnectionLost,
}

/// Commands sent to a room actor through its channel.
pub(crate) enum RoomCommand {
    Join {
        peer_id: PeerId,
        sender: PeerSender,
        spectate: bool,
        reply: oneshot::Sender<Result<JoinInfo, RoomError>>,
    },
    Remove {
        peer_id: PeerId,
        reason: LeaveReason,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    RecordMove {
        peer_id: PeerId,
        token: MoveToken,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    RecordSnapshot {
        peer_id: PeerId,
        snapshot: Box<StateSnapshot>,
        terminal: bool,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    /// Fan a delta sync out without storing it — only full snapshots
    /// update the room's authoritative copy.
    RelayDelta {
        peer_id: PeerId,
        delta: Box<StateDelta>,
        terminal: bool,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Chat {
        peer_id: PeerId,
        message: String,
    },
    /// Attach an outbound tap that receives every broadcast frame
    /// (replay recording).
    Subscribe { sender: PeerSender },
    Info {
        reply: oneshot::Sender<RoomInfo>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running room actor. Cheap to clone.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Adds a peer as a player (or re-attaches a disconnected one).
    /// With `spectate`, joins the read-only spectator set instead.
    pub async fn join(
        &self,
        peer_id: PeerId,
        sender: PeerSender,
        spectate: bool,
    ) -> Result<JoinInfo, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Join {
                peer_id,
                sender,
                spectate,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?
    }

    /// Removes a peer, with the reason deciding whether the slot is
    /// held for reconnection.
    pub async fn remove(
        &self,
        peer_id: PeerId,
        reason: LeaveReason,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Remove {
                peer_id,
                reason,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?
    }

    /// Validates and records a move, fanning it out on success.
    pub async fn record_move(
        &self,
        peer_id: PeerId,
        token: MoveToken,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::RecordMove {
                peer_id,
                token,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?
    }

    /// Stores a snapshot if it is newer than the current one, fanning
    /// out STATE_SYNC on success.
    pub async fn record_snapshot(
        &self,
        peer_id: PeerId,
        snapshot: StateSnapshot,
        terminal: bool,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::RecordSnapshot {
                peer_id,
                snapshot: Box::new(snapshot),
                terminal,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?
    }

    /// Relays a delta sync to the other peers without storing it.
    pub async fn relay_delta(
        &self,
        peer_id: PeerId,
        delta: StateDelta,
        terminal: bool,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::RelayDelta {
                peer_id,
                delta: Box::new(delta),
                terminal,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?
    }

    /// Routes a chat line to everyone except the sender
    /// (fire-and-forget).
    pub async fn chat(
        &self,
        peer_id: PeerId,
        message: String,
    ) -> Result<(), RoomError> {
        self.sender
            .send(RoomCommand::Chat { peer_id, message })
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }

    /// Attaches an outbound tap receiving every broadcast frame.
    pub async fn subscribe(
        &self,
        sender: PeerSender,
    ) -> Result<(), RoomError> {
        self.sender
            .send(RoomCommand::Subscribe { sender })
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }

    /// Requests the current room metadata.
    pub async fn info(&self) -> Result<RoomInfo, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Info { reply: reply_tx })
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }

    /// Tells the room to shut down.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.sender
            .send(RoomCommand::Shutdown)
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// One player slot. The slot survives a connection loss (with
/// `sender: None`) while the room awaits the peer's return.
struct PlayerSlot {
    peer_id: PeerId,
    sender: Option<PeerSender>,
    /// Last accepted move number for this peer (0 before the first).
    last_move: u64,
}

struct AwaitingReconnect {
    peer_id: PeerId,
    deadline: tokio::time::Instant,
}

struct RoomActor {
    room_id: RoomId,
    config: RoomConfig,
    host: Option<PlayerSlot>,
    guest: Option<PlayerSlot>,
    spectators: HashMap<PeerId, PeerSender>,
    taps: Vec<PeerSender>,
    move_log: Vec<MoveRecord>,
    latest_snapshot: Option<StateSnapshot>,
    current_turn: Option<PeerId>,
    started: bool,
    finished: bool,
    awaiting: Option<AwaitingReconnect>,
    created_at: Instant,
    empty_since: Option<Instant>,
    receiver: mpsc::Receiver<RoomCommand>,
}

enum Flow {
    Continue,
    Stop,
}

impl RoomActor {
    async fn run(mut self) {
        tracing::info!(room_id = %self.room_id, "room actor started");

        loop {
            let deadline = self.awaiting.as_ref().map(|a| a.deadline);
            // A dummy far-future instant keeps the branch expression
            // valid when no deadline is armed; the precondition stops
            // it from being polled.
            let sleep_target = deadline.unwrap_or_else(|| {
                tokio::time::Instant::now() + Duration::from_secs(86_400)
            });

            tokio::select! {
                cmd = self.receiver.recv() => {
                    match cmd {
                        None => break,
                        Some(cmd) => {
                            if matches!(self.handle(cmd), Flow::Stop) {
                                break;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    self.abandon();
                    break;
                }
            }
        }

        tracing::info!(room_id = %self.room_id, "room actor stopped");
    }

    fn handle(&mut self, cmd: RoomCommand) -> Flow {
        match cmd {
            RoomCommand::Join {
                peer_id,
                sender,
                spectate,
                reply,
            } => {
                let result = if spectate {
                    self.handle_spectate(peer_id, sender)
                } else {
                    self.handle_join(peer_id, sender)
                };
                let _ = reply.send(result);
                Flow::Continue
            }
            RoomCommand::Remove {
                peer_id,
                reason,
                reply,
            } => {
                let result = self.handle_remove(&peer_id, reason);
                let _ = reply.send(result);
                Flow::Continue
            }
            RoomCommand::RecordMove {
                peer_id,
                token,
                reply,
            } => {
                let _ = reply.send(self.handle_move(&peer_id, token));
                Flow::Continue
            }
            RoomCommand::RecordSnapshot {
                peer_id,
                snapshot,
                terminal,
                reply,
            } => {
                let _ = reply.send(
                    self.handle_snapshot(&peer_id, *snapshot, terminal),
                );
                Flow::Continue
            }
            RoomCommand::RelayDelta {
                peer_id,
                delta,
                terminal,
                reply,
            } => {
                let _ = reply.send(
                    self.handle_delta(&peer_id, *delta, terminal),
                );
                Flow::Continue
            }
            RoomCommand::Chat { peer_id, message } => {
                if self.is_member(&peer_id) {
                    let envelope = Envelope::new(
                        Message::Chat {
                            room_id: self.room_id.clone(),
                            message,
                        },
                        peer_id.clone(),
                    );
                    self.broadcast_except(&envelope, Some(&peer_id));
                }
                Flow::Continue
            }
            RoomCommand::Subscribe { sender } => {
                self.taps.push(sender);
                Flow::Continue
            }
            RoomCommand::Info { reply } => {
                let _ = reply.send(self.info());
                Flow::Continue
            }
            RoomCommand::Shutdown => Flow::Stop,
        }
    }

    // -- Joins ------------------------------------------------------------

    fn handle_join(
        &mut self,
        peer_id: PeerId,
        sender: PeerSender,
    ) -> Result<JoinInfo, RoomError> {
        // A peer that already owns a slot is re-attaching (its previous
        // connection dropped, or it re-issued JOIN_ROOM after a
        // reconnect handshake).
        if self.slot_of(&peer_id).is_some() {
            return self.handle_reattach(peer_id, sender);
        }

        if self.finished {
            return Err(RoomError::GameFinished);
        }

        let role = if self.host.is_none() {
            self.host = Some(PlayerSlot {
                peer_id: peer_id.clone(),
                sender: Some(sender),
                last_move: 0,
            });
            RoomRole::Host
        } else if self.guest.is_none() {
            self.guest = Some(PlayerSlot {
                peer_id: peer_id.clone(),
                sender: Some(sender),
                last_move: 0,
            });
            RoomRole::Guest
        } else {
            return Err(RoomError::RoomFull(self.room_id.clone()));
        };

        self.empty_since = None;
        tracing::info!(
            room_id = %self.room_id,
            %peer_id,
            role = ?role,
            "player joined"
        );

        // Second player in → the battle starts, host moves first.
        if !self.started && self.host.is_some() && self.guest.is_some() {
            self.start_game();
        }

        Ok(JoinInfo {
            room_id: self.room_id.clone(),
            role,
            opponent_id: self.opponent_of(&peer_id),
            peer_count: self.peer_count(),
            started: self.started,
            rejoined: false,
        })
    }

    fn handle_spectate(
        &mut self,
        peer_id: PeerId,
        sender: PeerSender,
    ) -> Result<JoinInfo, RoomError> {
        if !self.config.allow_spectators {
            return Err(RoomError::SpectatorsDisabled(self.room_id.clone()));
        }
        if self.slot_of(&peer_id).is_some() {
            return Err(RoomError::AlreadyInRoom(
                peer_id,
                self.room_id.clone(),
            ));
        }

        // A late spectator gets the current state right away.
        if let Some(snapshot) = &self.latest_snapshot {
            let sync = Envelope::new(
                Message::StateSync {
                    room_id: self.room_id.clone(),
                    state: Some(snapshot.clone()),
                    delta: None,
                    terminal: false,
                },
                PeerId::hub(),
            );
            let _ = sender.send(sync);
        }

        self.spectators.insert(peer_id.clone(), sender);
        self.empty_since = None;
        tracing::info!(room_id = %self.room_id, %peer_id, "spectator joined");

        Ok(JoinInfo {
            room_id: self.room_id.clone(),
            role: RoomRole::Spectator,
            opponent_id: None,
            peer_count: self.peer_count(),
            started: self.started,
            rejoined: false,
        })
    }

    fn handle_reattach(
        &mut self,
        peer_id: PeerId,
        sender: PeerSender,
    ) -> Result<JoinInfo, RoomError> {
        let role = match self.slot_of(&peer_id) {
            Some(RoomRole::Host) => RoomRole::Host,
            Some(RoomRole::Guest) => RoomRole::Guest,
            _ => return Err(RoomError::NotInRoom(peer_id)),
        };

        // Cancel the abandon timer if this is the peer it was armed for.
        if self
            .awaiting
            .as_ref()
            .is_some_and(|a| a.peer_id == peer_id)
        {
            self.awaiting = None;
        }

        // Replay the latest authoritative snapshot to the returner
        // before anything else reaches it.
        if let Some(snapshot) = &self.latest_snapshot {
            let sync = Envelope::new(
                Message::StateSync {
                    room_id: self.room_id.clone(),
                    state: Some(snapshot.clone()),
                    delta: None,
                    terminal: false,
                },
                PeerId::hub(),
            );
            let _ = sender.send(sync);
        }

        let slot = match role {
            RoomRole::Host => self.host.as_mut(),
            RoomRole::Guest => self.guest.as_mut(),
            RoomRole::Spectator => None,
        };
        if let Some(slot) = slot {
            slot.sender = Some(sender);
        }

        let notice = Envelope::new(
            Message::PlayerReconnected {
                room_id: self.room_id.clone(),
                peer_id: peer_id.clone(),
            },
            PeerId::hub(),
        );
        self.broadcast_except(&notice, Some(&peer_id));

        tracing::info!(room_id = %self.room_id, %peer_id, "player re-attached");

        Ok(JoinInfo {
            room_id: self.room_id.clone(),
            role,
            opponent_id: self.opponent_of(&peer_id),
            peer_count: self.peer_count(),
            started: self.started,
            rejoined: true,
        })
    }

    // -- Removal ----------------------------------------------------------

    fn handle_remove(
        &mut self,
        peer_id: &PeerId,
        reason: LeaveReason,
    ) -> Result<(), RoomError> {
        // Spectators just go.
        if self.spectators.remove(peer_id).is_some() {
            let notice = Envelope::new(
                Message::SpectatorLeft {
                    room_id: self.room_id.clone(),
                    peer_id: peer_id.clone(),
                },
                PeerId::hub(),
            );
            self.broadcast_except(&notice, None);
            self.note_if_empty();
            return Ok(());
        }

        let role = self
            .slot_of(peer_id)
            .ok_or_else(|| RoomError::NotInRoom(peer_id.clone()))?;

        let mid_match = self.started && !self.finished;

        if reason == LeaveReason::ConnectionLost && mid_match {
            // Hold the slot: the peer has `reconnect_grace` to return.
            let slot = match role {
                RoomRole::Host => self.host.as_mut(),
                RoomRole::Guest => self.guest.as_mut(),
                RoomRole::Spectator => None,
            };
            if let Some(slot) = slot {
                slot.sender = None;
            }
            self.awaiting = Some(AwaitingReconnect {
                peer_id: peer_id.clone(),
                deadline: tokio::time::Instant::now()
                    + self.config.reconnect_grace,
            });
            let notice = Envelope::new(
                Message::PlayerDisconnected {
                    room_id: self.room_id.clone(),
                    peer_id: peer_id.clone(),
                },
                PeerId::hub(),
            );
            self.broadcast_except(&notice, Some(peer_id));
            tracing::info!(
                room_id = %self.room_id,
                %peer_id,
                grace_secs = self.config.reconnect_grace.as_secs(),
                "player awaiting reconnect"
            );
            return Ok(());
        }

        // Voluntary leave (or a pre-start drop): vacate the slot.
        let opponent = self.opponent_of(peer_id);
        match role {
            RoomRole::Host => self.host = None,
            RoomRole::Guest => self.guest = None,
            RoomRole::Spectator => {}
        }
        if self
            .awaiting
            .as_ref()
            .is_some_and(|a| &a.peer_id == peer_id)
        {
            self.awaiting = None;
        }

        let notice = Envelope::new(
            Message::PlayerLeft {
                room_id: self.room_id.clone(),
                peer_id: peer_id.clone(),
            },
            PeerId::hub(),
        );
        self.broadcast_except(&notice, None);
        tracing::info!(room_id = %self.room_id, %peer_id, "player left");

        // Walking out of a live match forfeits it.
        if mid_match {
            self.finish(opponent, "abandoned");
        }

        self.note_if_empty();
        Ok(())
    }

    /// The awaiting-reconnect deadline fired: the match is forfeit.
    fn abandon(&mut self) {
        let Some(awaiting) = self.awaiting.take() else {
            return;
        };
        let winner = self.opponent_of(&awaiting.peer_id);
        tracing::info!(
            room_id = %self.room_id,
            peer_id = %awaiting.peer_id,
            "reconnect window elapsed, match abandoned"
        );
        match self.slot_of(&awaiting.peer_id) {
            Some(RoomRole::Host) => self.host = None,
            Some(RoomRole::Guest) => self.guest = None,
            _ => {}
        }
        self.finish(winner, "abandoned");
    }

    // -- Moves ------------------------------------------------------------

    fn handle_move(
        &mut self,
        peer_id: &PeerId,
        token: MoveToken,
    ) -> Result<(), RoomError> {
        // All validation happens before any mutation: a rejected move
        // leaves the log, the turn, and the counters exactly as found.
        if !self.started {
            return Err(RoomError::GameNotStarted);
        }
        if self.finished {
            return Err(RoomError::GameFinished);
        }
        let role = match self.slot_of(peer_id) {
            Some(r @ (RoomRole::Host | RoomRole::Guest)) => r,
            Some(RoomRole::Spectator) | None => {
                return Err(RoomError::NotAPlayer(peer_id.clone()))
            }
        };
        if self.current_turn.as_ref() != Some(peer_id) {
            return Err(RoomError::NotYourTurn(peer_id.clone()));
        }
        let last = match role {
            RoomRole::Host => self.host.as_ref().map(|s| s.last_move),
            RoomRole::Guest => self.guest.as_ref().map(|s| s.last_move),
            RoomRole::Spectator => None,
        }
        .unwrap_or(0);
        if token.move_number != last + 1 {
            return Err(RoomError::InvalidMove(format!(
                "expected move number {}, got {}",
                last + 1,
                token.move_number
            )));
        }

        // Commit.
        match role {
            RoomRole::Host => {
                if let Some(slot) = self.host.as_mut() {
                    slot.last_move = token.move_number;
                }
            }
            RoomRole::Guest => {
                if let Some(slot) = self.guest.as_mut() {
                    slot.last_move = token.move_number;
                }
            }
            RoomRole::Spectator => {}
        }
        self.move_log.push(MoveRecord {
            token,
            origin: peer_id.clone(),
            server_timestamp: now_ms(),
        });
        self.current_turn = self.opponent_of(peer_id);

        // Fan out to the opponent and spectators, origin id preserved.
        let envelope = Envelope::new(
            Message::Move {
                room_id: self.room_id.clone(),
                token,
            },
            peer_id.clone(),
        );
        self.broadcast_except(&envelope, Some(peer_id));

        Ok(())
    }

    // -- Snapshots --------------------------------------------------------

    fn handle_snapshot(
        &mut self,
        peer_id: &PeerId,
        snapshot: StateSnapshot,
        terminal: bool,
    ) -> Result<(), RoomError> {
        match self.slot_of(peer_id) {
            Some(RoomRole::Host | RoomRole::Guest) => {}
            Some(RoomRole::Spectator) | None => {
                return Err(RoomError::NotAPlayer(peer_id.clone()))
            }
        }

        if let Some(current) = &self.latest_snapshot {
            if snapshot.version <= current.version {
                return Err(RoomError::StaleSnapshot {
                    version: snapshot.version,
                    current: current.version,
                });
            }
        }

        let envelope = Envelope::new(
            Message::StateSync {
                room_id: self.room_id.clone(),
                state: Some(snapshot.clone()),
                delta: None,
                terminal,
            },
            peer_id.clone(),
        );
        self.latest_snapshot = Some(snapshot);
        self.broadcast_except(&envelope, Some(peer_id));

        // A terminal sync is the producer saying "the engine reports
        // this game over". The room closes the match; the winner is the
        // engine's business, not the core's.
        if terminal && !self.finished {
            self.finish(None, "completed");
        }

        Ok(())
    }

    fn handle_delta(
        &mut self,
        peer_id: &PeerId,
        delta: StateDelta,
        terminal: bool,
    ) -> Result<(), RoomError> {
        match self.slot_of(peer_id) {
            Some(RoomRole::Host | RoomRole::Guest) => {}
            Some(RoomRole::Spectator) | None => {
                return Err(RoomError::NotAPlayer(peer_id.clone()))
            }
        }

        let envelope = Envelope::new(
            Message::StateSync {
                room_id: self.room_id.clone(),
                state: None,
                delta: Some(delta),
                terminal,
            },
            peer_id.clone(),
        );
        self.broadcast_except(&envelope, Some(peer_id));

        if terminal && !self.finished {
            self.finish(None, "completed");
        }

        Ok(())
    }

    // -- Shared mechanics -------------------------------------------------

    fn start_game(&mut self) {
        self.started = true;
        let host_id = self.host.as_ref().map(|s| s.peer_id.clone());
        let guest_id = self.guest.as_ref().map(|s| s.peer_id.clone());
        let (Some(host_id), Some(guest_id)) = (host_id, guest_id) else {
            return;
        };
        self.current_turn = Some(host_id.clone());

        let envelope = Envelope::new(
            Message::GameStart {
                room_id: self.room_id.clone(),
                players: vec![host_id.clone(), guest_id],
                starting_player: Some(host_id),
                opponent_id: None,
            },
            PeerId::hub(),
        );
        self.broadcast_except(&envelope, None);
        tracing::info!(room_id = %self.room_id, "game started");
    }

    fn finish(&mut self, winner: Option<PeerId>, reason: &str) {
        self.finished = true;
        self.current_turn = None;
        let envelope = Envelope::new(
            Message::GameEnd {
                winner: winner.clone(),
                reason: reason.to_string(),
                final_score: None,
            },
            PeerId::hub(),
        );
        self.broadcast_except(&envelope, None);
        tracing::info!(
            room_id = %self.room_id,
            winner = winner.as_ref().map(|p| p.0.as_str()).unwrap_or("-"),
            reason,
            "game ended"
        );
    }

    /// Sends to every attached peer (both players, all spectators) and
    /// every tap, except `skip`. Dead receivers are silently dropped.
    fn broadcast_except(&self, envelope: &Envelope, skip: Option<&PeerId>) {
        for slot in [self.host.as_ref(), self.guest.as_ref()]
            .into_iter()
            .flatten()
        {
            if Some(&slot.peer_id) == skip {
                continue;
            }
            if let Some(sender) = &slot.sender {
                let _ = sender.send(envelope.clone());
            }
        }
        for (peer_id, sender) in &self.spectators {
            if Some(peer_id) == skip {
                continue;
            }
            let _ = sender.send(envelope.clone());
        }
        for tap in &self.taps {
            let _ = tap.send(envelope.clone());
        }
    }

    fn slot_of(&self, peer_id: &PeerId) -> Option<RoomRole> {
        if self.host.as_ref().is_some_and(|s| &s.peer_id == peer_id) {
            Some(RoomRole::Host)
        } else if self.guest.as_ref().is_some_and(|s| &s.peer_id == peer_id)
        {
            Some(RoomRole::Guest)
        } else if self.spectators.contains_key(peer_id) {
            Some(RoomRole::Spectator)
        } else {
            None
        }
    }

    fn is_member(&self, peer_id: &PeerId) -> bool {
        self.slot_of(peer_id).is_some()
    }

    fn opponent_of(&self, peer_id: &PeerId) -> Option<PeerId> {
        if self.host.as_ref().is_some_and(|s| &s.peer_id == peer_id) {
            self.guest.as_ref().map(|s| s.peer_id.clone())
        } else if self.guest.as_ref().is_some_and(|s| &s.peer_id == peer_id)
        {
            self.host.as_ref().map(|s| s.peer_id.clone())
        } else {
            None
        }
    }

    fn player_count(&self) -> usize {
        self.host.is_some() as usize + self.guest.is_some() as usize
    }

    fn peer_count(&self) -> usize {
        self.player_count() + self.spectators.len()
    }

    fn note_if_empty(&mut self) {
        if self.player_count() == 0 && self.spectators.is_empty() {
            self.empty_since.get_or_insert_with(Instant::now);
        }
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.room_id.clone(),
            player_count: self.player_count(),
            spectator_count: self.spectators.len(),
            started: self.started,
            finished: self.finished,
            awaiting_reconnect: self.awaiting.is_some(),
            move_count: self.move_log.len(),
            current_turn: self.current_turn.clone(),
            snapshot_version: self
                .latest_snapshot
                .as_ref()
                .map(|s| s.version),
            empty_for: self.empty_since.map(|t| t.elapsed()),
            age: self.created_at.elapsed(),
        }
    }
}

/// Spawns a new room actor task and returns a handle to it.
pub fn spawn_room(
    room_id: RoomId,
    config: RoomConfig,
    channel_size: usize,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(channel_size);

    let actor = RoomActor {
        room_id: room_id.clone(),
        config,
        host: None,
        guest: None,
        spectators: HashMap::new(),
        taps: Vec::new(),
        move_log: Vec::new(),
        latest_snapshot: None,
        current_turn: None,
        started: false,
        finished: false,
        awaiting: None,
        created_at: Instant::now(),
        empty_since: Some(Instant::now()),
        receiver: rx,
    };

    tokio::spawn(actor.run());

    RoomHandle {
        room_id,
        sender: tx,
    }
}
