//! Client-side session layer for Matchwire.
//!
//! The [`PeerSessionController`] is the single API surface the game app
//! talks to: connect, create/join rooms, find a match, execute moves,
//! and subscribe to state changes and opponent moves. It composes (not
//! inherits) the pieces under it — the reconnecting WebSocket
//! transport, a snapshot [`Synchronizer`](matchwire_sync::Synchronizer),
//! a [`ConflictResolver`](matchwire_sync::ConflictResolver), and the
//! [`ReconnectionManager`] with its durable snapshot store.
//!
//! The game engine plugs in through two narrow seams: a read-only
//! [`SnapshotSource`] the controller captures state from, and a
//! [`MoveSink`] it drives with opponent moves. Everything else reaches
//! the app through registered observers; there is no process-wide
//! mutable state anywhere in the stack.

mod controller;
mod error;
mod quality;
mod recovery;
mod store;

pub use controller::{
    ControllerConfig, GameHooks, MatchSummary, MoveSink, PeerSessionController,
    RoomSummary, SessionState, SnapshotSource,
};
pub use error::ClientError;
pub use quality::{QualityBucket, QualityMonitor};
pub use recovery::{GameSnapshot, ReconnectionManager, RecoveryConfig};
pub use store::{FileStore, KvStore, MemoryStore, StoreError};
