//! The hub: builder, shared state, accept loop, and housekeeping.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use matchwire_matchmaker::Matchmaker;
use matchwire_protocol::{Envelope, JsonCodec, Message, PeerId};
use matchwire_room::{RoomConfig, RoomRegistry};
use matchwire_session::{PeerRegistry, PeerRole, RegistryConfig};
use matchwire_transport::{Transport, WebSocketTransport};

use crate::handler::handle_connection;
use crate::{HubConfig, HubError};

/// Shared hub state, one per process.
///
/// Every map lives behind its own mutex — the single-writer discipline
/// the concurrency model requires. Rooms serialize their internal state
/// in their own actor tasks; these locks only guard the registries.
pub(crate) struct HubState {
    pub(crate) peers: Mutex<PeerRegistry>,
    pub(crate) rooms: Mutex<RoomRegistry>,
    pub(crate) matchmaker: Mutex<Matchmaker>,
    /// Writer channels per connected peer, for out-of-band delivery
    /// (matchmade GAME_START).
    pub(crate) senders:
        Mutex<HashMap<PeerId, mpsc::UnboundedSender<Envelope>>>,
    pub(crate) codec: JsonCodec,
}

/// Builder for configuring and binding a hub.
pub struct HubBuilder {
    bind_addr: String,
    config: HubConfig,
    room_config: RoomConfig,
    session_config: RegistryConfig,
}

impl HubBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: String::new(),
            config: HubConfig::default(),
            room_config: RoomConfig::default(),
            session_config: RegistryConfig::default(),
        }
    }

    /// Applies a [`HubConfig`] (port, TTLs, housekeeping cadences).
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the bind address entirely (tests bind `127.0.0.1:0`).
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Overrides room behavior (grace windows, TTLs, spectators).
    pub fn room_config(mut self, config: RoomConfig) -> Self {
        self.room_config = config;
        self
    }

    /// Overrides session behavior (disconnect grace).
    pub fn session_config(mut self, config: RegistryConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Binds the listener and assembles the hub.
    pub async fn build(self) -> Result<Hub, HubError> {
        let addr = if self.bind_addr.is_empty() {
            format!("0.0.0.0:{}", self.config.port)
        } else {
            self.bind_addr
        };

        let mut room_config = self.room_config;
        room_config.idle_ttl = self.config.idle_room_ttl;

        let transport = WebSocketTransport::bind(&addr).await?;

        let state = Arc::new(HubState {
            peers: Mutex::new(PeerRegistry::new(self.session_config)),
            rooms: Mutex::new(RoomRegistry::new(room_config)),
            matchmaker: Mutex::new(Matchmaker::new()),
            senders: Mutex::new(HashMap::new()),
            codec: JsonCodec,
        });

        Ok(Hub {
            transport,
            state,
            config: self.config,
        })
    }
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound, ready-to-run hub.
pub struct Hub {
    transport: WebSocketTransport,
    state: Arc<HubState>,
    config: HubConfig,
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder::new()
    }

    /// Binds with the given configuration on `0.0.0.0:<port>`.
    pub async fn bind(config: HubConfig) -> Result<Self, HubError> {
        HubBuilder::new().config(config).build().await
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// Runs the hub: housekeeping tasks plus the accept loop. Runs
    /// until the process is terminated.
    pub async fn run(mut self) -> Result<(), HubError> {
        tracing::info!("matchwire hub running");

        self.spawn_matchmaker_drain();
        self.spawn_sweeper();

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await
                        {
                            tracing::debug!(
                                error = %e,
                                "connection ended with error"
                            );
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }

    /// The periodic matchmaker drain: pop pairs of live tickets, room
    /// them, and notify both sides.
    fn spawn_matchmaker_drain(&self) {
        let state = Arc::clone(&self.state);
        let interval = self.config.matchmake_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                tick.tick().await;
                drain_matchmaker(&state).await;
            }
        });
    }

    /// The periodic sweeper: expired rooms, then expired sessions.
    fn spawn_sweeper(&self) {
        let state = Arc::clone(&self.state);
        let interval = self.config.room_sweep_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                tick.tick().await;

                let swept = state.rooms.lock().await.sweep().await;
                if !swept.is_empty() {
                    tracing::info!(count = swept.len(), "rooms swept");
                }

                let expired = state.peers.lock().await.expire_stale();
                for peer_id in &expired {
                    // The abandon timer usually beat us here; this is
                    // the backstop for peers that never made it into a
                    // room.
                    state.rooms.lock().await.forget_peer(peer_id);
                    state.matchmaker.lock().await.cancel(peer_id);
                    state.senders.lock().await.remove(peer_id);
                }
                state.peers.lock().await.cleanup_expired();
            }
        });
    }
}

/// One drain pass over the pairing queue.
pub(crate) async fn drain_matchmaker(state: &Arc<HubState>) {
    let pairs = {
        let peers = state.peers.lock().await;
        let mut matchmaker = state.matchmaker.lock().await;
        matchmaker.drain(|peer_id| peers.is_connected(peer_id))
    };

    for (first, second) in pairs {
        pair_into_room(state, first.peer_id, second.peer_id).await;
    }
}

/// Creates a room for a matchmade pair, seats both players, and sends
/// each its GAME_START{roomId, opponentId}.
async fn pair_into_room(state: &Arc<HubState>, a: PeerId, b: PeerId) {
    let (sender_a, sender_b) = {
        let senders = state.senders.lock().await;
        (senders.get(&a).cloned(), senders.get(&b).cloned())
    };
    let (Some(sender_a), Some(sender_b)) = (sender_a, sender_b) else {
        // A writer vanished between the liveness check and now; the
        // surviving peer re-queues on its next FIND_MATCH.
        tracing::debug!(%a, %b, "matchmade peer lost its writer, pair dropped");
        return;
    };

    let mut rooms = state.rooms.lock().await;
    let room_id = rooms.create_room();

    let seated_a = rooms
        .join_room(a.clone(), room_id.clone(), sender_a.clone())
        .await;
    let seated_b = rooms
        .join_room(b.clone(), room_id.clone(), sender_b.clone())
        .await;
    drop(rooms);

    if seated_a.is_err() || seated_b.is_err() {
        tracing::warn!(%room_id, "failed to seat matchmade pair");
        return;
    }

    {
        let mut peers = state.peers.lock().await;
        let _ = peers.assign_room(&a, room_id.clone(), PeerRole::Host);
        let _ = peers.assign_room(&b, room_id.clone(), PeerRole::Guest);
    }

    for (mine, theirs, sender) in
        [(&a, &b, &sender_a), (&b, &a, &sender_b)]
    {
        let start = Envelope::new(
            Message::GameStart {
                room_id: room_id.clone(),
                players: vec![],
                starting_player: None,
                opponent_id: Some(theirs.clone()),
            },
            PeerId::hub(),
        );
        if sender.send(start).is_err() {
            tracing::debug!(peer_id = %mine, "matchmade peer unreachable");
        }
    }

    tracing::info!(%room_id, peer_a = %a, peer_b = %b, "matchmade pair seated");
}
