//! Peer session management for the Matchwire hub.
//!
//! This crate is the hub's record of who is connected:
//!
//! 1. **Identity** — opaque peer ids, assigned at the CONNECT handshake
//!    (or accepted from a returning client).
//! 2. **Presence** — the Connected → Disconnected → Expired lifecycle,
//!    with a grace window in the middle so a dropped WiFi packet doesn't
//!    end a battle.
//! 3. **Placement** — which room a peer is in and in what role, under
//!    the invariant that a peer is in at most one room and has a role
//!    exactly when it has a room.
//!
//! # How it fits in the stack
//!
//! ```text
//! Room layer (above)   ← asks "who is this, where are they"
//!     ↕
//! Session layer (this crate)
//!     ↕
//! Protocol layer (below)  ← provides PeerId, RoomId
//! ```

mod error;
mod peer;
mod registry;

pub use error::SessionError;
pub use peer::{Peer, PeerRole, PeerState, RegistryConfig};
pub use registry::{ConnectOutcome, PeerRegistry};
