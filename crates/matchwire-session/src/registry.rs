//! The peer registry: tracks every session on the hub.
//!
//! # Concurrency note
//!
//! `PeerRegistry` is NOT thread-safe by itself — it uses a plain
//! `HashMap`, not a concurrent one. This is intentional: the registry
//! is owned by the hub and accessed through a mutex at a higher level.
//! Keeping it simple here avoids hidden locking overhead.

use std::collections::HashMap;
use std::time::Instant;

use matchwire_protocol::{PeerId, RoomId};
use rand::Rng;

use crate::{Peer, PeerRole, PeerState, RegistryConfig, SessionError};

/// What happened when a peer presented itself at the CONNECT handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A brand-new session (no usable prior state).
    Fresh,
    /// The peer came back inside the grace window; its placement
    /// survived. The caller re-attaches it to this room.
    Resumed { room: Option<RoomId> },
}

/// Manages all peer sessions on the hub.
///
/// ## Lifecycle
///
/// ```text
/// connect() ──→ [Connected] ──disconnect()──→ [Disconnected]
///                    ↑                              │
///                    └──── connect() (in grace) ────┤
///                                                   ▼ (grace elapses)
///                                  expire_stale() → [Expired] → cleanup_expired()
/// ```
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    config: RegistryConfig,
}

impl PeerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            peers: HashMap::new(),
            config,
        }
    }

    /// Handles a CONNECT. An unassigned `offered` id gets a freshly
    /// generated one; a known id inside the grace window resumes its
    /// session (room placement intact); anything else starts fresh.
    ///
    /// # Errors
    /// [`SessionError::AlreadyConnected`] if the offered id belongs to
    /// a session that is still actively connected.
    pub fn connect(
        &mut self,
        offered: PeerId,
    ) -> Result<(PeerId, ConnectOutcome), SessionError> {
        if offered.is_unassigned() {
            let peer_id = generate_peer_id();
            self.peers.insert(peer_id.clone(), Peer::new(peer_id.clone()));
            tracing::info!(%peer_id, "peer connected");
            return Ok((peer_id, ConnectOutcome::Fresh));
        }

        match self.peers.get_mut(&offered) {
            Some(peer) => match peer.state {
                PeerState::Connected => {
                    Err(SessionError::AlreadyConnected(offered))
                }
                PeerState::Disconnected { since }
                    if since.elapsed() <= self.config.disconnect_grace =>
                {
                    peer.state = PeerState::Connected;
                    peer.last_activity = Instant::now();
                    let room = peer.room.clone();
                    tracing::info!(peer_id = %offered, "peer reconnected within grace");
                    Ok((offered, ConnectOutcome::Resumed { room }))
                }
                _ => {
                    // Grace elapsed (or already swept to Expired):
                    // same id, fresh session.
                    *peer = Peer::new(offered.clone());
                    tracing::info!(peer_id = %offered, "peer reconnected after grace, fresh session");
                    Ok((offered, ConnectOutcome::Fresh))
                }
            },
            None => {
                // Unknown id offered (client outlived a hub restart).
                // Accept it; ids are opaque either way.
                self.peers
                    .insert(offered.clone(), Peer::new(offered.clone()));
                tracing::info!(peer_id = %offered, "peer connected with offered id");
                Ok((offered, ConnectOutcome::Fresh))
            }
        }
    }

    /// Marks a peer disconnected, starting the grace countdown.
    pub fn disconnect(&mut self, peer_id: &PeerId) -> Result<(), SessionError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SessionError::NotFound(peer_id.clone()))?;
        peer.state = PeerState::Disconnected {
            since: Instant::now(),
        };
        tracing::info!(%peer_id, "peer disconnected, grace window open");
        Ok(())
    }

    /// Removes a session outright (clean DISCONNECT — no grace).
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Peer> {
        let removed = self.peers.remove(peer_id);
        if removed.is_some() {
            tracing::info!(%peer_id, "peer removed");
        }
        removed
    }

    /// Places a peer in a room with a player or spectator role.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`] — unknown peer
    /// - [`SessionError::AlreadyInRoom`] — the one-room invariant
    pub fn assign_room(
        &mut self,
        peer_id: &PeerId,
        room: RoomId,
        role: PeerRole,
    ) -> Result<(), SessionError> {
        debug_assert!(role != PeerRole::None, "assign_room needs a real role");
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SessionError::NotFound(peer_id.clone()))?;
        if let Some(existing) = &peer.room {
            return Err(SessionError::AlreadyInRoom(
                peer_id.clone(),
                existing.clone(),
            ));
        }
        peer.room = Some(room);
        peer.role = role;
        Ok(())
    }

    /// Clears a peer's room placement (role returns to `None` with it).
    pub fn clear_room(&mut self, peer_id: &PeerId) -> Result<(), SessionError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SessionError::NotFound(peer_id.clone()))?;
        peer.room = None;
        peer.role = PeerRole::None;
        Ok(())
    }

    /// Records the latest observed round-trip latency from a heartbeat.
    pub fn record_latency(&mut self, peer_id: &PeerId, latency_ms: f64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.latency_ms = Some(latency_ms);
        }
    }

    /// Stamps activity for a peer (any inbound frame).
    pub fn touch(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_activity = Instant::now();
        }
    }

    /// Expires every disconnected session whose grace window has
    /// closed. Returns the expired ids so the caller can tear down
    /// room state before [`cleanup_expired`](Self::cleanup_expired)
    /// deletes the records.
    pub fn expire_stale(&mut self) -> Vec<PeerId> {
        let grace = self.config.disconnect_grace;
        let mut expired = Vec::new();
        for peer in self.peers.values_mut() {
            if let PeerState::Disconnected { since } = peer.state {
                if since.elapsed() > grace {
                    peer.state = PeerState::Expired;
                    expired.push(peer.peer_id.clone());
                    tracing::info!(
                        peer_id = %peer.peer_id,
                        "peer session expired"
                    );
                }
            }
        }
        expired
    }

    /// Deletes expired sessions.
    pub fn cleanup_expired(&mut self) {
        self.peers
            .retain(|_, peer| !matches!(peer.state, PeerState::Expired));
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Whether the peer exists and is actively connected — the
    /// liveness check the matchmaker drain uses to discard dead
    /// tickets.
    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get(peer_id)
            .map(Peer::is_connected)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Generates a fresh peer id: `peer-` plus 12 hex characters (48 bits
/// of randomness) — unguessable enough that ids cannot be enumerated.
fn generate_peer_id() -> PeerId {
    let mut rng = rand::rng();
    let bytes: [u8; 6] = rng.random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    PeerId(format!("peer-{hex}"))
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! Unit tests for `PeerRegistry`.
    //!
    //! Time-dependent behavior (the grace window) is tested without
    //! sleeping, using two configs:
    //!   - `disconnect_grace: 0` → sessions expire immediately
    //!   - `disconnect_grace: 3600 s` → sessions never expire in-test

    use std::time::Duration;

    use super::*;

    fn registry_with_instant_expiry() -> PeerRegistry {
        PeerRegistry::new(RegistryConfig {
            disconnect_grace: Duration::ZERO,
        })
    }

    fn registry_with_long_grace() -> PeerRegistry {
        PeerRegistry::new(RegistryConfig {
            disconnect_grace: Duration::from_secs(3600),
        })
    }

    fn pid(s: &str) -> PeerId {
        PeerId::from(s)
    }

    // =====================================================================
    // connect()
    // =====================================================================

    #[test]
    fn test_connect_unassigned_generates_id() {
        let mut reg = registry_with_long_grace();

        let (peer_id, outcome) = reg.connect(PeerId::default()).unwrap();

        assert_eq!(outcome, ConnectOutcome::Fresh);
        assert!(peer_id.0.starts_with("peer-"));
        // "peer-" + 12 hex chars of entropy.
        assert_eq!(peer_id.0.len(), 5 + 12);
        assert!(reg.get(&peer_id).unwrap().is_connected());
    }

    #[test]
    fn test_connect_generates_unique_ids() {
        let mut reg = registry_with_long_grace();
        let (a, _) = reg.connect(PeerId::default()).unwrap();
        let (b, _) = reg.connect(PeerId::default()).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_connect_offered_unknown_id_is_accepted() {
        let mut reg = registry_with_long_grace();
        let (peer_id, outcome) = reg.connect(pid("peer-carried")).unwrap();
        assert_eq!(peer_id, pid("peer-carried"));
        assert_eq!(outcome, ConnectOutcome::Fresh);
    }

    #[test]
    fn test_connect_while_connected_is_rejected() {
        let mut reg = registry_with_long_grace();
        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();

        let result = reg.connect(peer_id.clone());

        assert!(matches!(
            result,
            Err(SessionError::AlreadyConnected(p)) if p == peer_id
        ));
    }

    #[test]
    fn test_connect_within_grace_resumes_with_room() {
        let mut reg = registry_with_long_grace();
        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();
        reg.assign_room(&peer_id, RoomId::from("r-1"), PeerRole::Host)
            .unwrap();
        reg.disconnect(&peer_id).unwrap();

        let (_, outcome) = reg.connect(peer_id.clone()).unwrap();

        assert_eq!(
            outcome,
            ConnectOutcome::Resumed {
                room: Some(RoomId::from("r-1"))
            }
        );
        assert!(reg.get(&peer_id).unwrap().is_connected());
    }

    #[test]
    fn test_connect_after_grace_starts_fresh() {
        let mut reg = registry_with_instant_expiry();
        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();
        reg.assign_room(&peer_id, RoomId::from("r-1"), PeerRole::Host)
            .unwrap();
        reg.disconnect(&peer_id).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let (_, outcome) = reg.connect(peer_id.clone()).unwrap();

        // The old placement is gone.
        assert_eq!(outcome, ConnectOutcome::Fresh);
        let peer = reg.get(&peer_id).unwrap();
        assert_eq!(peer.room, None);
        assert_eq!(peer.role, PeerRole::None);
    }

    // =====================================================================
    // Room placement and the role ⟺ room invariant
    // =====================================================================

    #[test]
    fn test_assign_room_sets_role_and_room_together() {
        let mut reg = registry_with_long_grace();
        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();

        reg.assign_room(&peer_id, RoomId::from("r-1"), PeerRole::Guest)
            .unwrap();

        let peer = reg.get(&peer_id).unwrap();
        assert_eq!(peer.room, Some(RoomId::from("r-1")));
        assert_eq!(peer.role, PeerRole::Guest);
    }

    #[test]
    fn test_assign_room_enforces_one_room() {
        let mut reg = registry_with_long_grace();
        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();
        reg.assign_room(&peer_id, RoomId::from("r-1"), PeerRole::Host)
            .unwrap();

        let result =
            reg.assign_room(&peer_id, RoomId::from("r-2"), PeerRole::Guest);

        assert!(matches!(result, Err(SessionError::AlreadyInRoom(_, r)) if r == RoomId::from("r-1")));
    }

    #[test]
    fn test_clear_room_restores_role_none() {
        let mut reg = registry_with_long_grace();
        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();
        reg.assign_room(&peer_id, RoomId::from("r-1"), PeerRole::Spectator)
            .unwrap();

        reg.clear_room(&peer_id).unwrap();

        let peer = reg.get(&peer_id).unwrap();
        assert_eq!(peer.room, None);
        assert_eq!(peer.role, PeerRole::None);
    }

    // =====================================================================
    // Disconnect / expiry lifecycle
    // =====================================================================

    #[test]
    fn test_disconnect_unknown_peer_is_not_found() {
        let mut reg = registry_with_long_grace();
        let result = reg.disconnect(&pid("peer-ghost"));
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[test]
    fn test_expire_stale_expires_only_timed_out() {
        let mut reg = registry_with_instant_expiry();
        let (gone, _) = reg.connect(PeerId::default()).unwrap();
        let (stays, _) = reg.connect(PeerId::default()).unwrap();
        reg.disconnect(&gone).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let expired = reg.expire_stale();

        assert_eq!(expired, vec![gone.clone()]);
        assert!(reg.get(&stays).unwrap().is_connected());
        assert!(!reg.is_connected(&gone));
    }

    #[test]
    fn test_expire_stale_within_grace_is_noop() {
        let mut reg = registry_with_long_grace();
        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();
        reg.disconnect(&peer_id).unwrap();

        assert!(reg.expire_stale().is_empty());
    }

    #[test]
    fn test_cleanup_expired_removes_records() {
        let mut reg = registry_with_instant_expiry();
        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();
        reg.disconnect(&peer_id).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        reg.expire_stale();
        assert_eq!(reg.len(), 1);

        reg.cleanup_expired();

        assert!(reg.is_empty());
        assert!(reg.get(&peer_id).is_none());
    }

    // =====================================================================
    // Latency and activity
    // =====================================================================

    #[test]
    fn test_record_latency_stores_last_observation() {
        let mut reg = registry_with_long_grace();
        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();
        assert_eq!(reg.get(&peer_id).unwrap().latency_ms, None);

        reg.record_latency(&peer_id, 42.0);
        reg.record_latency(&peer_id, 55.0);

        // Last observed value, not an average — smoothing is client-side.
        assert_eq!(reg.get(&peer_id).unwrap().latency_ms, Some(55.0));
    }

    #[test]
    fn test_full_lifecycle_connect_disconnect_reconnect() {
        let mut reg = registry_with_long_grace();

        let (peer_id, _) = reg.connect(PeerId::default()).unwrap();
        reg.assign_room(&peer_id, RoomId::from("r-9"), PeerRole::Host)
            .unwrap();

        reg.disconnect(&peer_id).unwrap();
        assert!(!reg.is_connected(&peer_id));

        let (resumed_id, outcome) = reg.connect(peer_id.clone()).unwrap();
        assert_eq!(resumed_id, peer_id);
        assert!(matches!(outcome, ConnectOutcome::Resumed { .. }));
        assert!(reg.is_connected(&peer_id));
    }
}
