//! Error types for the protocol layer.
//!
//! Each crate in Matchwire defines its own error enum. This keeps errors
//! specific and meaningful — when you see a `ProtocolError`, you know the
//! problem is in serialization/deserialization, not in networking or room
//! management.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning an envelope into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into an envelope).
    ///
    /// Common causes: malformed JSON, missing required fields, wrong
    /// data types, or truncated messages. Never fatal to the transport —
    /// the per-peer [`ParseErrorWindow`](crate::ParseErrorWindow) decides
    /// when a connection has misbehaved enough to be dropped.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame exceeds the 256 KiB wire limit, in either direction.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },

    /// The envelope parsed as JSON and carried a `type` field, but the
    /// tag is not one this protocol version knows. The frame is dropped;
    /// the [`UnknownTypeThrottle`](crate::UnknownTypeThrottle) rate-limits
    /// the resulting warning.
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// The message is invalid at the protocol level — it parsed, but
    /// violates a rule (e.g. a CONNECT after the handshake already ran).
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    /// Whether this error counts against the sender's parse-error window.
    ///
    /// Unknown tags are forward-compatibility events, not abuse; they are
    /// warned about (throttled) and dropped without penalty.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Oversized { .. })
    }
}
