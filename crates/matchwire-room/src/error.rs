//! Error types for the room layer.

use matchwire_protocol::{PeerId, RoomId};

/// Errors that can occur during room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The room does not exist.
    #[error("room {0} not found")]
    NotFound(RoomId),

    /// Both player slots are taken.
    #[error("room {0} is full")]
    RoomFull(RoomId),

    /// The peer is already placed in a room.
    #[error("peer {0} already in room {1}")]
    AlreadyInRoom(PeerId, RoomId),

    /// The peer is not a member of this room.
    #[error("peer {0} not in this room")]
    NotInRoom(PeerId),

    /// The operation needs a player slot; the peer is a spectator.
    #[error("peer {0} is not a player")]
    NotAPlayer(PeerId),

    /// The room was created with spectating disabled.
    #[error("room {0} does not allow spectators")]
    SpectatorsDisabled(RoomId),

    /// A move arrived before both player slots were filled.
    #[error("game has not started")]
    GameNotStarted,

    /// A move or snapshot arrived after the game ended.
    #[error("game is finished")]
    GameFinished,

    /// The sender does not hold the current turn.
    #[error("not {0}'s turn")]
    NotYourTurn(PeerId),

    /// The move is structurally invalid (out-of-order move number).
    #[error("invalid move: {0}")]
    InvalidMove(String),

    /// The snapshot's version is not newer than the stored one.
    #[error("stale snapshot: version {version} <= current {current}")]
    StaleSnapshot { version: u64, current: u64 },

    /// The room's command channel is closed (actor terminated).
    #[error("room {0} is unavailable")]
    Unavailable(RoomId),
}
