//! Room lifecycle management for Matchwire.
//!
//! Each room is an isolated Tokio task (actor model) owning one battle
//! session: the two player slots, the spectator set, the append-only
//! move log with its per-peer turn discipline, the latest authoritative
//! snapshot, and the awaiting-reconnect window. All cross-task access
//! goes through message passing into the room's command channel — no
//! shared mutable state.
//!
//! The [`RoomRegistry`] maps room ids to running actors, maintains the
//! peer → room index (a peer is in at most one room), and hosts the
//! periodic sweeper that removes rooms left empty or idle too long.

mod config;
mod error;
mod registry;
mod replay;
mod room;

pub use config::RoomConfig;
pub use error::RoomError;
pub use registry::RoomRegistry;
pub use replay::ReplayRecorder;
pub use room::{
    spawn_room, JoinInfo, LeaveReason, MoveRecord, PeerSender, RoomHandle,
    RoomInfo, RoomRole,
};
