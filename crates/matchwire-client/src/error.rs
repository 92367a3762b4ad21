//! Error types for the client session layer.

use matchwire_protocol::{ErrorCode, ProtocolError};
use matchwire_transport::TransportError;

use crate::StoreError;

/// Errors surfaced by the peer session controller and its parts.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A transport-level failure (connect, send, reconnect exhausted).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level failure (encode/decode).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The snapshot store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The hub answered the request with an ERROR frame.
    #[error("request rejected: {code}: {message}")]
    Rejected { code: ErrorCode, message: String },

    /// No response arrived within the request deadline.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// The operation needs a state the controller is not in (e.g. a
    /// move while not in battle).
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// The disconnect lasted longer than recovery permits.
    #[error("recovery window exceeded")]
    RecoveryTimeout,

    /// No local snapshot exists to recover from.
    #[error("no snapshot available")]
    NoSnapshot,

    /// The controller (or its event loop) has shut down.
    #[error("session closed")]
    Closed,
}
