//! State synchronization for Matchwire.
//!
//! Each player's client is a snapshot *producer*: it captures the game
//! engine's exposed state into versioned [`StateSnapshot`]s and ships
//! either the full snapshot or a sparse [`StateDelta`] against the
//! previous one. The [`Synchronizer`] owns the version counter, the
//! current/previous pair, the Full/Delta/Hybrid mode selection, and the
//! sync statistics.
//!
//! Because both clients produce snapshots independently, their views can
//! diverge. The [`ConflictResolver`] detects divergence (four ordered
//! checks) and reconciles it under a configurable policy, producing the
//! compensation diffs the game layer needs to repair its board.
//!
//! [`StateSnapshot`]: matchwire_protocol::StateSnapshot
//! [`StateDelta`]: matchwire_protocol::StateDelta

mod conflict;
mod error;
mod synchronizer;

pub use conflict::{
    detect_conflict, merge_snapshots, ConflictKind, ConflictRecord,
    ConflictResolver, Resolution, ResolutionPolicy, ResolverStats,
};
pub use error::SyncError;
pub use synchronizer::{
    apply_delta, diff_snapshots, EngineState, SyncMode, SyncPayload,
    SyncStats, Synchronizer,
};
