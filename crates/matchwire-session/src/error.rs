//! Error types for the session layer.

use matchwire_protocol::{PeerId, RoomId};

/// Errors that can occur during peer-session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session exists for the given peer.
    #[error("no session for peer {0}")]
    NotFound(PeerId),

    /// The offered id already belongs to an actively connected peer.
    /// A peer can only have one live connection at a time.
    #[error("peer {0} already has an active connection")]
    AlreadyConnected(PeerId),

    /// The peer is already placed in a room. A peer is in at most one
    /// room.
    #[error("peer {0} is already in room {1}")]
    AlreadyInRoom(PeerId, RoomId),

    /// The peer is not in any room.
    #[error("peer {0} is not in a room")]
    NotInRoom(PeerId),
}
