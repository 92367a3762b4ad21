//! Error types for the matchmaking layer.

use matchwire_protocol::{MatchMode, PeerId};

/// Errors that can occur while managing the pairing queue.
#[derive(Debug, thiserror::Error)]
pub enum MatchmakerError {
    /// The peer already holds a ticket.
    #[error("peer {0} is already queued")]
    AlreadyQueued(PeerId),

    /// This mode does not go through the queue — INVITE and CUSTOM
    /// matches route through the room registry directly.
    #[error("mode {0:?} is not queue-based")]
    ModeNotQueued(MatchMode),
}
