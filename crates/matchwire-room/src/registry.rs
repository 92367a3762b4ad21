//! Room registry: creates, tracks, and routes peers to rooms.
//!
//! The registry is the single-writer owner of the room map and the
//! peer → room index. It is not internally synchronized; the hub wraps
//! it in one mutex, which is the single-writer discipline the
//! concurrency model requires.

use std::collections::HashMap;

use matchwire_protocol::{
    now_ms, MoveToken, PeerId, RoomId, StateDelta, StateSnapshot,
};
use rand::Rng;

use crate::room::{spawn_room, LeaveReason};
use crate::{JoinInfo, PeerSender, RoomConfig, RoomError, RoomHandle};

/// Default command channel size for room actors. Bounded so a stalled
/// actor backpressures callers instead of ballooning.
const DEFAULT_CHANNEL_SIZE: usize = 64;

/// Manages all active rooms and which peer is in which room.
pub struct RoomRegistry {
    rooms: HashMap<RoomId, RoomHandle>,
    /// A peer is in at most ONE room at a time (key invariant).
    peer_rooms: HashMap<PeerId, RoomId>,
    config: RoomConfig,
}

impl RoomRegistry {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            rooms: HashMap::new(),
            peer_rooms: HashMap::new(),
            config,
        }
    }

    /// Creates a new room and returns its id.
    pub fn create_room(&mut self) -> RoomId {
        let room_id = generate_room_id();
        let handle = spawn_room(
            room_id.clone(),
            self.config.clone(),
            DEFAULT_CHANNEL_SIZE,
        );
        self.rooms.insert(room_id.clone(), handle);
        tracing::info!(%room_id, "room created");
        room_id
    }

    /// Looks up a room handle.
    pub fn get(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.rooms.get(room_id).cloned()
    }

    /// Adds a peer to a room as a player, enforcing the one-room
    /// invariant. A peer re-joining the room it is already recorded in
    /// is a re-attach and passes through.
    pub async fn join_room(
        &mut self,
        peer_id: PeerId,
        room_id: RoomId,
        sender: PeerSender,
    ) -> Result<JoinInfo, RoomError> {
        if let Some(current) = self.peer_rooms.get(&peer_id) {
            if *current != room_id {
                // An index entry for a room that no longer exists (the
                // match was terminated under the peer) is stale, not a
                // violation of the one-room invariant.
                if self.rooms.contains_key(current) {
                    return Err(RoomError::AlreadyInRoom(
                        peer_id,
                        current.clone(),
                    ));
                }
                self.peer_rooms.remove(&peer_id);
            }
        }

        let handle = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;

        let info = handle.join(peer_id.clone(), sender, false).await?;
        self.peer_rooms.insert(peer_id, room_id);
        Ok(info)
    }

    /// Adds a peer to a room as a read-only spectator.
    pub async fn spectate_room(
        &mut self,
        peer_id: PeerId,
        room_id: RoomId,
        sender: PeerSender,
    ) -> Result<JoinInfo, RoomError> {
        if let Some(current) = self.peer_rooms.get(&peer_id) {
            if self.rooms.contains_key(current) {
                return Err(RoomError::AlreadyInRoom(
                    peer_id,
                    current.clone(),
                ));
            }
            self.peer_rooms.remove(&peer_id);
        }

        let handle = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;

        let info = handle.join(peer_id.clone(), sender, true).await?;
        self.peer_rooms.insert(peer_id, room_id);
        Ok(info)
    }

    /// Removes a peer from its current room. `LeaveReason::Left` frees
    /// the slot; `ConnectionLost` lets the room hold it for the
    /// reconnect window (the index entry is kept so the peer can find
    /// its way back).
    pub async fn leave_room(
        &mut self,
        peer_id: &PeerId,
        reason: LeaveReason,
    ) -> Result<(), RoomError> {
        let room_id = self
            .peer_rooms
            .get(peer_id)
            .cloned()
            .ok_or_else(|| RoomError::NotInRoom(peer_id.clone()))?;

        if let Some(handle) = self.rooms.get(&room_id) {
            handle.remove(peer_id.clone(), reason).await?;
        }

        if reason == LeaveReason::Left {
            self.peer_rooms.remove(peer_id);
        }
        Ok(())
    }

    /// Drops a peer's index entry without touching the room (used once
    /// a session expires for good).
    pub fn forget_peer(&mut self, peer_id: &PeerId) {
        self.peer_rooms.remove(peer_id);
    }

    /// Routes a move from a peer to its room.
    pub async fn route_move(
        &self,
        peer_id: &PeerId,
        token: MoveToken,
    ) -> Result<(), RoomError> {
        let handle = self.handle_for(peer_id)?;
        handle.record_move(peer_id.clone(), token).await
    }

    /// Routes a snapshot from a peer to its room.
    pub async fn route_snapshot(
        &self,
        peer_id: &PeerId,
        snapshot: StateSnapshot,
        terminal: bool,
    ) -> Result<(), RoomError> {
        let handle = self.handle_for(peer_id)?;
        handle
            .record_snapshot(peer_id.clone(), snapshot, terminal)
            .await
    }

    /// Relays a delta sync from a peer to its room.
    pub async fn route_delta(
        &self,
        peer_id: &PeerId,
        delta: StateDelta,
        terminal: bool,
    ) -> Result<(), RoomError> {
        let handle = self.handle_for(peer_id)?;
        handle.relay_delta(peer_id.clone(), delta, terminal).await
    }

    /// Routes a chat line from a peer to its room.
    pub async fn route_chat(
        &self,
        peer_id: &PeerId,
        message: String,
    ) -> Result<(), RoomError> {
        let handle = self.handle_for(peer_id)?;
        handle.chat(peer_id.clone(), message).await
    }

    /// The room a peer is currently recorded in, if any.
    pub fn peer_room(&self, peer_id: &PeerId) -> Option<RoomId> {
        self.peer_rooms.get(peer_id).cloned()
    }

    /// Shuts a room down and clears every index entry pointing at it.
    pub async fn dispose(&mut self, room_id: &RoomId) -> Result<(), RoomError> {
        let handle = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;

        let _ = handle.shutdown().await;
        self.peer_rooms.retain(|_, rid| rid != room_id);
        tracing::info!(%room_id, "room destroyed");
        Ok(())
    }

    /// One sweeper pass: removes rooms that have been empty for the
    /// configured TTL, outlived the idle TTL, or whose actor is gone
    /// (terminated matches). Returns the ids it removed.
    pub async fn sweep(&mut self) -> Vec<RoomId> {
        let mut doomed = Vec::new();
        for (room_id, handle) in &self.rooms {
            match handle.info().await {
                Ok(info) => {
                    let empty_too_long = info
                        .empty_for
                        .is_some_and(|d| d >= self.config.empty_ttl);
                    let too_old = info.age >= self.config.idle_ttl;
                    if empty_too_long || too_old {
                        doomed.push(room_id.clone());
                    }
                }
                Err(_) => doomed.push(room_id.clone()),
            }
        }

        for room_id in &doomed {
            let _ = self.dispose(room_id).await;
        }
        doomed
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    fn handle_for(&self, peer_id: &PeerId) -> Result<&RoomHandle, RoomError> {
        let room_id = self
            .peer_rooms
            .get(peer_id)
            .ok_or_else(|| RoomError::NotInRoom(peer_id.clone()))?;
        self.rooms
            .get(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(RoomConfig::default())
    }
}

/// Generates a room id: creation time plus 48 bits of randomness
/// (`r-<epoch-ms hex>-<12 hex>`), unique within the hub and not
/// enumerable.
fn generate_room_id() -> RoomId {
    let mut rng = rand::rng();
    let bytes: [u8; 6] = rng.random();
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    RoomId(format!("r-{:x}-{suffix}", now_ms()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_ids_carry_entropy_suffix() {
        let id = generate_room_id();
        let parts: Vec<&str> = id.0.splitn(3, '-').collect();
        assert_eq!(parts[0], "r");
        assert_eq!(parts[2].len(), 12, "48-bit hex suffix");
    }

    #[test]
    fn test_room_ids_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_room_id()));
        }
    }
}
