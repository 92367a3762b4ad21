//! Unified error type for the hub.

use matchwire_matchmaker::MatchmakerError;
use matchwire_protocol::ProtocolError;
use matchwire_room::RoomError;
use matchwire_session::SessionError;
use matchwire_transport::TransportError;

use crate::ConfigError;

/// Top-level error that wraps every layer's error type, so the binary
/// and the handler deal with one `Result` currency.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Matchmaker(#[from] MatchmakerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
