//! The reconnection manager: a local snapshot store and the recovery
//! merge.
//!
//! While a battle runs, the controller feeds every synchronized state
//! into [`ReconnectionManager::save_snapshot`]: an in-memory ring keeps
//! the last few, and at most once per persist interval the newest is
//! written through to the durable store (one key per room, plus a
//! sentinel naming the most recent room). After a disconnect,
//! [`recover_game_state`](ReconnectionManager::recover_game_state)
//! rebuilds the session from whatever survived — preferring server
//! values for the authoritative fields when a server snapshot is in
//! hand.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use matchwire_protocol::{MoveToken, PeerId, RoomId, StateSnapshot};

use crate::{ClientError, KvStore};

/// Sentinel key holding the id of the most recently persisted room.
const LATEST_ROOM_KEY: &str = "matchwire.snapshot.latest-room";

fn room_key(room_id: &RoomId) -> String {
    format!("matchwire.snapshot.{room_id}")
}

/// Tuning for the reconnection manager.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// In-memory ring size. Default 10.
    pub ring_capacity: usize,
    /// Minimum interval between writes to the durable store; redundant
    /// saves inside it are dropped. Default 5 s.
    pub min_persist_interval: Duration,
    /// Disconnects longer than this are unrecoverable. Default 60 s.
    pub max_disconnect: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 10,
            min_persist_interval: Duration::from_secs(5),
            max_disconnect: Duration::from_secs(60),
        }
    }
}

/// The reconnection blob: everything needed to resume a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    /// Capture time, epoch milliseconds.
    pub timestamp: u64,
    pub room_id: RoomId,
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent_id: Option<PeerId>,
    pub state: StateSnapshot,
    #[serde(default)]
    pub move_history: Vec<MoveToken>,
    pub last_synced_move_number: u64,
}

/// Local snapshot store plus the recovery handshake logic.
pub struct ReconnectionManager<S: KvStore> {
    store: S,
    config: RecoveryConfig,
    ring: VecDeque<GameSnapshot>,
    last_persist: Option<Instant>,
}

impl<S: KvStore> ReconnectionManager<S> {
    pub fn new(store: S, config: RecoveryConfig) -> Self {
        Self {
            store,
            ring: VecDeque::with_capacity(config.ring_capacity),
            config,
            last_persist: None,
        }
    }

    /// Appends a snapshot to the ring and, if the persist interval has
    /// elapsed, writes it through to the durable store. Returns whether
    /// the durable write happened.
    pub fn save_snapshot(
        &mut self,
        snapshot: GameSnapshot,
    ) -> Result<bool, ClientError> {
        if self.ring.len() == self.config.ring_capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(snapshot.clone());

        let due = self
            .last_persist
            .map(|t| t.elapsed() >= self.config.min_persist_interval)
            .unwrap_or(true);
        if !due {
            return Ok(false);
        }

        let blob = serde_json::to_string(&snapshot)
            .map_err(crate::StoreError::Serde)?;
        self.store.put(&room_key(&snapshot.room_id), &blob)?;
        self.store.put(LATEST_ROOM_KEY, &snapshot.room_id.0)?;
        self.last_persist = Some(Instant::now());
        tracing::debug!(room_id = %snapshot.room_id, "snapshot persisted");
        Ok(true)
    }

    /// The newest snapshot in the ring, if any.
    pub fn latest(&self) -> Option<&GameSnapshot> {
        self.ring.back()
    }

    /// Loads the persisted snapshot for a room — or, with `None`, for
    /// whatever room the sentinel names.
    pub fn load_persisted(
        &self,
        room_id: Option<&RoomId>,
    ) -> Result<Option<GameSnapshot>, ClientError> {
        let key = match room_id {
            Some(room_id) => room_key(room_id),
            None => match self.store.get(LATEST_ROOM_KEY)? {
                Some(latest) => room_key(&RoomId(latest)),
                None => return Ok(None),
            },
        };
        let Some(blob) = self.store.get(&key)? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(&blob)
            .map_err(crate::StoreError::Serde)?;
        Ok(Some(snapshot))
    }

    /// Drops the persisted state for a room (battle over, nothing to
    /// come back to).
    pub fn clear(&mut self, room_id: &RoomId) -> Result<(), ClientError> {
        self.store.delete(&room_key(room_id))?;
        if let Some(latest) = self.store.get(LATEST_ROOM_KEY)? {
            if latest == room_id.0 {
                self.store.delete(LATEST_ROOM_KEY)?;
            }
        }
        self.ring.retain(|s| &s.room_id != room_id);
        Ok(())
    }

    /// The recovery handshake:
    ///
    /// 1. A disconnect longer than the window fails with
    ///    [`ClientError::RecoveryTimeout`].
    /// 2. The latest local snapshot is loaded (ring first, then the
    ///    durable store).
    /// 3. If the server supplied a state sync, its values win for the
    ///    authoritative fields — scores, move counts, turn — and the
    ///    local snapshot fills in everything else.
    /// 4. No local snapshot at all fails with
    ///    [`ClientError::NoSnapshot`].
    pub fn recover_game_state(
        &self,
        disconnect_duration: Duration,
        server_state: Option<&StateSnapshot>,
    ) -> Result<GameSnapshot, ClientError> {
        if disconnect_duration > self.config.max_disconnect {
            return Err(ClientError::RecoveryTimeout);
        }

        let local = match self.latest() {
            Some(snapshot) => snapshot.clone(),
            None => self
                .load_persisted(None)?
                .ok_or(ClientError::NoSnapshot)?,
        };

        let Some(server) = server_state else {
            // Server sync unavailable — the local snapshot stands.
            return Ok(local);
        };

        let mut merged = local;
        merged.state.player_score = server.player_score;
        merged.state.opponent_score = server.opponent_score;
        merged.state.player_moves = server.player_moves;
        merged.state.opponent_moves = server.opponent_moves;
        merged.state.current_turn = server.current_turn;
        merged.state.version =
            merged.state.version.max(server.version);
        merged.state.timestamp =
            merged.state.timestamp.max(server.timestamp);
        Ok(merged)
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use matchwire_protocol::{CellTag, Grid, Turn};

    fn state(version: u64) -> StateSnapshot {
        StateSnapshot {
            version,
            timestamp: version * 10,
            player_grid: Grid::filled(2, 2, CellTag(1)),
            opponent_grid: Grid::filled(2, 2, CellTag(2)),
            player_score: 100,
            opponent_score: 50,
            player_moves: 3,
            opponent_moves: 2,
            event_progress: 5,
            active_events: vec!["combo".into()],
            current_turn: Turn::Player,
        }
    }

    fn blob(version: u64, room: &str) -> GameSnapshot {
        GameSnapshot {
            timestamp: version * 10,
            room_id: RoomId::from(room),
            peer_id: PeerId::from("peer-a"),
            opponent_id: Some(PeerId::from("peer-b")),
            state: state(version),
            move_history: vec![],
            last_synced_move_number: version,
        }
    }

    fn manager() -> ReconnectionManager<MemoryStore> {
        ReconnectionManager::new(MemoryStore::new(), RecoveryConfig::default())
    }

    /// A config whose persist throttle never opens again after the
    /// first write.
    fn throttled() -> ReconnectionManager<MemoryStore> {
        ReconnectionManager::new(
            MemoryStore::new(),
            RecoveryConfig {
                min_persist_interval: Duration::from_secs(3600),
                ..RecoveryConfig::default()
            },
        )
    }

    // =====================================================================
    // Ring and persistence
    // =====================================================================

    #[test]
    fn test_ring_keeps_last_ten() {
        let mut mgr = manager();
        for v in 1..=15 {
            mgr.save_snapshot(blob(v, "r-1")).unwrap();
        }
        assert_eq!(mgr.latest().unwrap().state.version, 15);
        // Oldest surviving entry is v6 (15 − 10 + 1).
        let oldest = mgr
            .recover_game_state(Duration::ZERO, None)
            .unwrap();
        assert_eq!(oldest.state.version, 15, "latest wins");
    }

    #[test]
    fn test_first_save_persists_then_throttles() {
        let mut mgr = throttled();
        assert!(mgr.save_snapshot(blob(1, "r-1")).unwrap());
        // Inside the interval: ring only, no durable write.
        assert!(!mgr.save_snapshot(blob(2, "r-1")).unwrap());

        // The durable copy is still v1…
        let persisted = mgr.load_persisted(Some(&RoomId::from("r-1"))).unwrap();
        assert_eq!(persisted.unwrap().state.version, 1);
        // …but the ring has v2.
        assert_eq!(mgr.latest().unwrap().state.version, 2);
    }

    #[test]
    fn test_zero_interval_always_persists() {
        let mut mgr = ReconnectionManager::new(
            MemoryStore::new(),
            RecoveryConfig {
                min_persist_interval: Duration::ZERO,
                ..RecoveryConfig::default()
            },
        );
        assert!(mgr.save_snapshot(blob(1, "r-1")).unwrap());
        assert!(mgr.save_snapshot(blob(2, "r-1")).unwrap());
    }

    #[test]
    fn test_sentinel_names_most_recent_room() {
        let mut mgr = ReconnectionManager::new(
            MemoryStore::new(),
            RecoveryConfig {
                min_persist_interval: Duration::ZERO,
                ..RecoveryConfig::default()
            },
        );
        mgr.save_snapshot(blob(1, "r-1")).unwrap();
        mgr.save_snapshot(blob(2, "r-2")).unwrap();

        let latest = mgr.load_persisted(None).unwrap().unwrap();
        assert_eq!(latest.room_id, RoomId::from("r-2"));
    }

    #[test]
    fn test_clear_removes_room_and_sentinel() {
        let mut mgr = ReconnectionManager::new(
            MemoryStore::new(),
            RecoveryConfig {
                min_persist_interval: Duration::ZERO,
                ..RecoveryConfig::default()
            },
        );
        mgr.save_snapshot(blob(1, "r-1")).unwrap();
        mgr.clear(&RoomId::from("r-1")).unwrap();

        assert!(mgr.load_persisted(None).unwrap().is_none());
        assert!(mgr.latest().is_none());
    }

    // =====================================================================
    // Recovery
    // =====================================================================

    #[test]
    fn test_recovery_fails_past_the_window() {
        let mut mgr = manager();
        mgr.save_snapshot(blob(1, "r-1")).unwrap();

        let result =
            mgr.recover_game_state(Duration::from_secs(61), None);
        assert!(matches!(result, Err(ClientError::RecoveryTimeout)));
    }

    #[test]
    fn test_recovery_with_nothing_fails_no_snapshot() {
        let mgr = manager();
        let result = mgr.recover_game_state(Duration::from_secs(1), None);
        assert!(matches!(result, Err(ClientError::NoSnapshot)));
    }

    #[test]
    fn test_recovery_falls_back_to_local_without_server() {
        let mut mgr = manager();
        mgr.save_snapshot(blob(4, "r-1")).unwrap();

        let recovered =
            mgr.recover_game_state(Duration::from_secs(5), None).unwrap();
        assert_eq!(recovered, blob(4, "r-1"));
    }

    #[test]
    fn test_recovery_reads_durable_store_when_ring_is_cold() {
        // A fresh manager (restarted process) with only the durable
        // copy from a previous run.
        let store = MemoryStore::new();
        let blob_json = serde_json::to_string(&blob(7, "r-1")).unwrap();
        store.put("matchwire.snapshot.r-1", &blob_json).unwrap();
        store.put("matchwire.snapshot.latest-room", "r-1").unwrap();

        let mgr =
            ReconnectionManager::new(store, RecoveryConfig::default());
        let recovered =
            mgr.recover_game_state(Duration::from_secs(5), None).unwrap();
        assert_eq!(recovered.state.version, 7);
    }

    #[test]
    fn test_recovery_merge_takes_server_authoritative_fields() {
        let mut mgr = manager();
        mgr.save_snapshot(blob(4, "r-1")).unwrap();

        let mut server = state(6);
        server.player_score = 999;
        server.opponent_moves = 40;
        server.current_turn = Turn::Opponent;
        // Something only the local side knows: its grid detail.
        server.player_grid = Grid::filled(2, 2, CellTag(9));

        let recovered = mgr
            .recover_game_state(Duration::from_secs(5), Some(&server))
            .unwrap();

        // Server wins the authoritative fields…
        assert_eq!(recovered.state.player_score, 999);
        assert_eq!(recovered.state.opponent_moves, 40);
        assert_eq!(recovered.state.current_turn, Turn::Opponent);
        assert_eq!(recovered.state.version, 6);
        // …the local snapshot supplies the rest.
        assert_eq!(
            recovered.state.player_grid,
            Grid::filled(2, 2, CellTag(1))
        );
        assert_eq!(
            recovered.state.active_events,
            vec!["combo".to_string()]
        );
        assert_eq!(recovered.room_id, RoomId::from("r-1"));
    }
}
