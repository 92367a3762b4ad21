//! Core protocol types for Matchwire's wire format.
//!
//! This module defines every envelope-level type that travels "on the
//! wire" — the structures that get serialized to JSON text, sent over the
//! WebSocket, and deserialized on the other side.
//!
//! The wire format is fixed: every frame is an [`Envelope`] with a `type`
//! tag, a `data` object whose schema depends on the tag, a millisecond
//! `timestamp`, the sender's `peerId`, and an optional `messageId` used
//! to correlate requests with responses. Unknown JSON fields are ignored
//! on read; unknown `type` tags surface as
//! [`ProtocolError::UnknownType`](crate::ProtocolError::UnknownType).

use serde::{Deserialize, Serialize};

use std::fmt;

use crate::state::{MoveToken, StateDelta, StateSnapshot};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A unique identifier for a connected peer.
///
/// Peer ids are opaque strings assigned by the hub on first handshake
/// (a client may offer a previously assigned id when reconnecting).
/// Newtype wrapper so a `RoomId` can't be passed where a `PeerId` is
/// expected. `#[serde(transparent)]` keeps the JSON a plain string.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// An empty id means "not yet assigned" — the client's very first
    /// CONNECT carries this until the hub answers with a real id.
    pub fn is_unassigned(&self) -> bool {
        self.0.is_empty()
    }

    /// The sender id the hub stamps on frames it originates itself
    /// (GAME_START, GAME_END, ERROR, …). Fanout frames keep the
    /// *origin peer's* id instead.
    pub fn hub() -> Self {
        Self("hub".to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A unique identifier for a room (one battle session).
///
/// Room ids are opaque, unique within the hub, and carry at least 48
/// bits of entropy so they cannot be enumerated (see the registry's id
/// generator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Small wire structs
// ---------------------------------------------------------------------------

/// A grid coordinate inside a move token.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct GridPos {
    pub row: usize,
    pub col: usize,
}

/// Final score pair attached to a GAME_END frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalScore {
    pub host: u32,
    pub guest: u32,
}

/// Matchmaking mode requested by a FIND_MATCH frame.
///
/// Only `Random` is implemented at the core level. `Ranked` behaves as
/// `Random`; `Invite` and `Custom` route through the room registry
/// directly and never enter the queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchMode {
    #[default]
    Random,
    Ranked,
    Invite,
    Custom,
}

/// Machine-readable error codes carried in ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomNotFound,
    RoomFull,
    InvalidMove,
    NotYourTurn,
    GameNotStarted,
    ConnectionTimeout,
    ReconnectionFailed,
    ProtocolError,
    BackpressureAbort,
    StaleSnapshot,
    RecoveryTimeout,
    NoSnapshot,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The wire spelling doubles as the display form.
        let s = match self {
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::RoomFull => "ROOM_FULL",
            Self::InvalidMove => "INVALID_MOVE",
            Self::NotYourTurn => "NOT_YOUR_TURN",
            Self::GameNotStarted => "GAME_NOT_STARTED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::ReconnectionFailed => "RECONNECTION_FAILED",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::BackpressureAbort => "BACKPRESSURE_ABORT",
            Self::StaleSnapshot => "STALE_SNAPSHOT",
            Self::RecoveryTimeout => "RECOVERY_TIMEOUT",
            Self::NoSnapshot => "NO_SNAPSHOT",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Message — the tagged payload
// ---------------------------------------------------------------------------

/// The tagged payload of every envelope.
///
/// `#[serde(tag = "type", content = "data")]` produces the adjacently
/// tagged wire shape the protocol fixes:
///
/// ```json
/// { "type": "JOIN_ROOM", "data": { "roomId": "r-...", "peerId": "peer-..." } }
/// ```
///
/// Variant tags are SCREAMING_SNAKE_CASE and field names camelCase —
/// the wire is consumed by JavaScript clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    // -- Connection lifecycle --
    /// C→S: "Hello" (optionally offering a previously assigned id).
    /// S→C: the handshake reply with the authoritative id and
    /// `status: "connected"`.
    Connect {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    /// C→S: clean goodbye before closing the stream.
    Disconnect { peer_id: PeerId },

    // -- Room lifecycle --
    /// C→S: create a room and take the HOST slot.
    CreateRoom { peer_id: PeerId },

    /// S→C: the room exists, here is its id.
    RoomCreated { room_id: RoomId },

    /// C→S: join an existing room. `spectate` requests the read-only
    /// spectator role instead of a player slot.
    JoinRoom {
        room_id: RoomId,
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        spectate: bool,
    },

    /// S→C: join succeeded.
    RoomJoined {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opponent_id: Option<PeerId>,
        peer_count: usize,
    },

    /// S→C: negative join response.
    RoomNotFound { room_id: RoomId },

    /// S→C: both player slots are taken.
    RoomFull { room_id: RoomId },

    /// C→S: leave the current room.
    LeaveRoom { room_id: RoomId, peer_id: PeerId },

    // -- Match flow --
    /// S→C: the battle starts. Rooms filled by JOIN_ROOM carry the
    /// full player list and the starting player; matchmade pairs carry
    /// the opponent id instead.
    GameStart {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        players: Vec<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        starting_player: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opponent_id: Option<PeerId>,
    },

    /// C→S then S→C: a move token, routed to the opponent and
    /// spectators. The origin peer id rides in the envelope.
    Move {
        room_id: RoomId,
        #[serde(rename = "move")]
        token: MoveToken,
    },

    /// Either direction: a full snapshot or a delta. Exactly one of
    /// `state`/`delta` is present. `terminal` marks the final sync of a
    /// finished game, which upgrades the frame to critical for
    /// backpressure purposes.
    StateSync {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<StateSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<StateDelta>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        terminal: bool,
    },

    /// S→C: the battle ended.
    GameEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        winner: Option<PeerId>,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_score: Option<FinalScore>,
    },

    /// Routed unchanged through the room's fanout.
    Chat { room_id: RoomId, message: String },

    // -- Matchmaking --
    /// C→S: enter the pairing queue.
    FindMatch {
        #[serde(default)]
        mode: MatchMode,
    },

    /// S→C: queued; pairing happens on the next drain tick.
    MatchQueued {
        #[serde(default)]
        mode: MatchMode,
    },

    /// C→S: leave the pairing queue (client-side search timeout or
    /// user cancel).
    CancelMatch,

    // -- Room fanout notifications --
    /// S→C: a player left the room voluntarily.
    PlayerLeft { room_id: RoomId, peer_id: PeerId },

    /// S→C: a spectator left the room.
    SpectatorLeft { room_id: RoomId, peer_id: PeerId },

    /// S→C: the opponent's connection dropped; the room holds their
    /// slot for the reconnect window.
    PlayerDisconnected { room_id: RoomId, peer_id: PeerId },

    /// S→C: the disconnected player made it back inside the window.
    PlayerReconnected { room_id: RoomId, peer_id: PeerId },

    // -- Heartbeat --
    /// C→S: "I'm still here." `timestamp` is the sender's clock,
    /// echoed back verbatim for RTT measurement.
    Ping { timestamp: u64 },

    /// S→C: heartbeat echo.
    Pong { timestamp: u64 },

    // -- Errors --
    /// S→C: a request failed or the connection misbehaved.
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl Message {
    /// All tags this protocol version understands. Used by the codec to
    /// distinguish an unknown tag from malformed JSON.
    pub const KNOWN_TAGS: &'static [&'static str] = &[
        "CONNECT",
        "DISCONNECT",
        "CREATE_ROOM",
        "ROOM_CREATED",
        "JOIN_ROOM",
        "ROOM_JOINED",
        "ROOM_NOT_FOUND",
        "ROOM_FULL",
        "LEAVE_ROOM",
        "GAME_START",
        "MOVE",
        "STATE_SYNC",
        "GAME_END",
        "CHAT",
        "FIND_MATCH",
        "MATCH_QUEUED",
        "CANCEL_MATCH",
        "PLAYER_LEFT",
        "SPECTATOR_LEFT",
        "PLAYER_DISCONNECTED",
        "PLAYER_RECONNECTED",
        "PING",
        "PONG",
        "ERROR",
    ];

    /// The wire tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "CONNECT",
            Self::Disconnect { .. } => "DISCONNECT",
            Self::CreateRoom { .. } => "CREATE_ROOM",
            Self::RoomCreated { .. } => "ROOM_CREATED",
            Self::JoinRoom { .. } => "JOIN_ROOM",
            Self::RoomJoined { .. } => "ROOM_JOINED",
            Self::RoomNotFound { .. } => "ROOM_NOT_FOUND",
            Self::RoomFull { .. } => "ROOM_FULL",
            Self::LeaveRoom { .. } => "LEAVE_ROOM",
            Self::GameStart { .. } => "GAME_START",
            Self::Move { .. } => "MOVE",
            Self::StateSync { .. } => "STATE_SYNC",
            Self::GameEnd { .. } => "GAME_END",
            Self::Chat { .. } => "CHAT",
            Self::FindMatch { .. } => "FIND_MATCH",
            Self::MatchQueued { .. } => "MATCH_QUEUED",
            Self::CancelMatch => "CANCEL_MATCH",
            Self::PlayerLeft { .. } => "PLAYER_LEFT",
            Self::SpectatorLeft { .. } => "SPECTATOR_LEFT",
            Self::PlayerDisconnected { .. } => "PLAYER_DISCONNECTED",
            Self::PlayerReconnected { .. } => "PLAYER_RECONNECTED",
            Self::Ping { .. } => "PING",
            Self::Pong { .. } => "PONG",
            Self::Error { .. } => "ERROR",
        }
    }

    /// Whether this frame must never be dropped by the outbound queue.
    ///
    /// Critical frames: MOVE, GAME_START, GAME_END, and a STATE_SYNC
    /// marked terminal. A queue holding only critical frames that
    /// overflows aborts the connection instead of dropping.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Move { .. }
                | Self::GameStart { .. }
                | Self::GameEnd { .. }
                | Self::StateSync { terminal: true, .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Envelope — the top-level wire format
// ---------------------------------------------------------------------------

/// The top-level frame. Every message on the wire is an Envelope.
///
/// The tagged [`Message`] is flattened so `type` and `data` sit next to
/// the metadata fields:
///
/// ```json
/// { "type": "PING",
///   "data": { "timestamp": 1712000000000 },
///   "timestamp": 1712000000000,
///   "peerId": "peer-3f2a9c04d1b6",
///   "messageId": "m-17" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The tagged payload (`type` + `data` on the wire).
    #[serde(flatten)]
    pub message: Message,

    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp: u64,

    /// The sender. Empty on the client's very first CONNECT, before the
    /// hub has assigned an id.
    #[serde(default)]
    pub peer_id: PeerId,

    /// Request/response correlator. Responses to a correlated request
    /// echo the requester's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Envelope {
    /// Builds an envelope stamped with the current wall clock.
    pub fn new(message: Message, peer_id: PeerId) -> Self {
        Self {
            message,
            timestamp: crate::now_ms(),
            peer_id,
            message_id: None,
        }
    }

    /// Attaches a request/response correlator.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

// =========================================================================
// Tests
// =========================================================================
