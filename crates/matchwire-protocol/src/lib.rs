//! Wire protocol for Matchwire.
//!
//! This crate defines the "language" that peers and the hub speak:
//!
//! - **Types** ([`Envelope`], [`Message`], [`PeerId`], [`RoomId`], etc.) —
//!   the message structures that travel on the wire.
//! - **State model** ([`StateSnapshot`], [`StateDelta`], [`Grid`]) — the
//!   synchronized game-state shapes carried inside `STATE_SYNC` frames.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — how messages are
//!   converted to/from bytes, with the frame-size cap enforced.
//! - **Guards** ([`ParseErrorWindow`], [`UnknownTypeThrottle`]) — the
//!   per-connection abuse limits the frame-codec contract requires.
//! - **Errors** ([`ProtocolError`]) — what can go wrong during
//!   encoding/decoding.
//!
//! # Architecture
//!
//! The protocol layer sits between transport (raw bytes) and session
//! (peer identity). It doesn't know about connections or rooms — it only
//! knows how to serialize, deserialize, and police frames.
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Session / Room (peer context)
//! ```

mod codec;
mod error;
mod guard;
mod state;
mod types;

pub use codec::{Codec, JsonCodec, MAX_FRAME_BYTES};
pub use error::ProtocolError;
pub use guard::{ParseErrorWindow, UnknownTypeThrottle};
pub use state::{
    CellTag, Change, CounterKind, Grid, GridSelector, MoveToken, StateDelta,
    StateSnapshot, Turn,
};
pub use types::{
    Envelope, ErrorCode, FinalScore, GridPos, MatchMode, Message, PeerId,
    RoomId,
};

/// Milliseconds since the Unix epoch. Every envelope and move-log entry
/// is stamped with this clock — wall time, not a process-local instant,
/// because both ends of the wire compare timestamps.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
