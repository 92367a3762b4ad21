//! Peer types: the hub's record of one connected client.

use std::time::{Duration, Instant};

use matchwire_protocol::{PeerId, RoomId};

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Configuration for peer-session behavior.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a disconnected peer may stay re-attachable before the
    /// session is permanently expired. This is the recovery window:
    /// a peer that returns within it rejoins its room; one that doesn't
    /// forfeits. Default 30 s; 0 disables reconnection entirely.
    pub disconnect_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// PeerRole / PeerState
// ---------------------------------------------------------------------------

/// The role a peer holds inside its room.
///
/// `None` is a real role, not an absence marker: it is what a peer has
/// exactly while it is outside any room (the registry maintains
/// role = None ⟺ room = None).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerRole {
    Host,
    Guest,
    Spectator,
    #[default]
    None,
}

impl PeerRole {
    /// Whether this role occupies one of the two player slots.
    pub fn is_player(&self) -> bool {
        matches!(self, Self::Host | Self::Guest)
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Host => "HOST",
            Self::Guest => "GUEST",
            Self::Spectator => "SPECTATOR",
            Self::None => "NONE",
        };
        f.write_str(s)
    }
}

/// The presence state of a peer's session.
///
/// ```text
///   Connected ──(disconnect)──→ Disconnected ──(grace elapses)──→ Expired
///       ↑                            │
///       └────────(reconnect)─────────┘
/// ```
#[derive(Debug, Clone)]
pub enum PeerState {
    /// Actively connected.
    Connected,
    /// Connection lost at `since`; re-attachable until the grace window
    /// closes.
    Disconnected { since: Instant },
    /// Grace elapsed. The session is dead and will be swept.
    Expired,
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// One client's session on the hub.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: PeerId,
    pub state: PeerState,
    /// Role inside the current room; `PeerRole::None` outside a room.
    pub role: PeerRole,
    /// The room this peer is in, if any.
    pub room: Option<RoomId>,
    /// Last round-trip latency observed from this peer's heartbeat, in
    /// milliseconds. `None` until the first PING arrives.
    pub latency_ms: Option<f64>,
    /// Stamp of the last frame seen from this peer.
    pub last_activity: Instant,
}

impl Peer {
    pub(crate) fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            state: PeerState::Connected,
            role: PeerRole::None,
            room: None,
            latency_ms: None,
            last_activity: Instant::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, PeerState::Connected)
    }
}
