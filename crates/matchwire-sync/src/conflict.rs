//! Conflict detection and resolution between divergent snapshots.
//!
//! Both clients in a battle produce snapshots independently, so their
//! views drift under latency and loss. Detection runs four ordered
//! checks; resolution applies the configured policy and hands back the
//! chosen state plus the cell-level compensation the game layer needs
//! to repair its board. The resolver also keeps the observability
//! surface: a bounded ring of conflict records and per-kind /
//! per-strategy statistics.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use matchwire_protocol::{now_ms, Change, Grid, GridSelector, StateSnapshot};

use crate::SyncError;

/// More cells than this differing between a local grid and the
/// remote's mirror of it is a GRID_INCONSISTENCY.
const GRID_CELL_TOLERANCE: usize = 5;

/// Score totals further apart than this are a SCORE_MISMATCH.
const SCORE_TOLERANCE: u64 = 100;

/// Snapshot clocks further apart than this (ms) are a STATE_DIVERGENCE.
const TIMESTAMP_TOLERANCE_MS: u64 = 10_000;

/// Version counters further apart than this are a VERSION_MISMATCH.
const VERSION_TOLERANCE: u64 = 1;

/// Conflict records retained for observability.
const DEFAULT_LOG_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// The kinds of divergence the detector recognizes, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    VersionMismatch,
    GridInconsistency,
    ScoreMismatch,
    StateDivergence,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::GridInconsistency => "GRID_INCONSISTENCY",
            Self::ScoreMismatch => "SCORE_MISMATCH",
            Self::StateDivergence => "STATE_DIVERGENCE",
        };
        f.write_str(s)
    }
}

/// One detected conflict, as retained in the observability ring.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub kind: ConflictKind,
    /// Wall clock at detection, epoch milliseconds.
    pub detected_at: u64,
    pub local_version: u64,
    pub remote_version: u64,
    pub description: String,
}

/// Counts the cells that differ between two grids. Differently shaped
/// grids count as every cell differing.
fn differing_cells(a: &Grid, b: &Grid) -> usize {
    if !a.same_shape(b) {
        return a.rows() * a.cols();
    }
    a.iter()
        .filter(|(row, col, tag)| b.get(*row, *col) != Some(*tag))
        .count()
}

/// Runs the four ordered checks. The first to trip names the conflict;
/// all clear means no conflict.
pub fn detect_conflict(
    local: &StateSnapshot,
    remote: &StateSnapshot,
) -> Option<ConflictRecord> {
    let record = |kind: ConflictKind, description: String| ConflictRecord {
        kind,
        detected_at: now_ms(),
        local_version: local.version,
        remote_version: remote.version,
        description,
    };

    // 1. Version counters drifted apart.
    let version_gap = local.version.abs_diff(remote.version);
    if version_gap > VERSION_TOLERANCE {
        return Some(record(
            ConflictKind::VersionMismatch,
            format!("versions {} versions apart", version_gap),
        ));
    }

    // 2. A grid and the remote's mirror of it disagree. The remote's
    // "opponent" grid is its picture of our "player" grid, so the
    // comparison is cross-paired.
    let player_drift =
        differing_cells(&local.player_grid, &remote.opponent_grid);
    let opponent_drift =
        differing_cells(&local.opponent_grid, &remote.player_grid);
    let worst = player_drift.max(opponent_drift);
    if worst > GRID_CELL_TOLERANCE {
        return Some(record(
            ConflictKind::GridInconsistency,
            format!("{worst} cells differ from the remote mirror"),
        ));
    }

    // 3. Score totals drifted.
    let score_gap = local.score_total().abs_diff(remote.score_total());
    if score_gap > SCORE_TOLERANCE {
        return Some(record(
            ConflictKind::ScoreMismatch,
            format!("score totals {score_gap} apart"),
        ));
    }

    // 4. Snapshot clocks drifted.
    let time_gap = local.timestamp.abs_diff(remote.timestamp);
    if time_gap > TIMESTAMP_TOLERANCE_MS {
        return Some(record(
            ConflictKind::StateDivergence,
            format!("snapshots {time_gap} ms apart"),
        ));
    }

    None
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Which snapshot wins a conflict, and at what cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResolutionPolicy {
    /// The server-origin snapshot wins; the local side rolls back to
    /// it. The default: server state is authoritative input.
    #[default]
    ServerAuthoritative,
    /// The local snapshot wins; nothing to do.
    ClientAuthoritative,
    /// The snapshot with the later producer timestamp wins.
    LatestTimestamp,
    /// A synthesized snapshot combining both. Never chosen by default:
    /// the merge can produce grid states neither peer ever validated.
    Merge,
    /// The snapshot with the *smaller* version wins — a rewind to the
    /// last state both sides plausibly shared.
    Rollback,
}

/// The outcome of one resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub success: bool,
    pub strategy: ResolutionPolicy,
    pub resolved: StateSnapshot,
    /// Whether the local side must discard its state for `resolved`.
    pub rollback_required: bool,
    /// Cell-level diffs that turn the local grids into the resolved
    /// ones. Empty when the local state won.
    pub compensation: Vec<Change>,
    pub message: String,
}

/// Aggregated resolver statistics.
#[derive(Debug, Clone, Default)]
pub struct ResolverStats {
    pub by_kind: HashMap<ConflictKind, u64>,
    pub by_strategy: HashMap<ResolutionPolicy, u64>,
    /// Exponential moving average of resolution latency (α = 0.1), in
    /// milliseconds.
    pub avg_resolution_ms: f64,
}

/// Detects and resolves conflicts under one configured policy.
pub struct ConflictResolver {
    policy: ResolutionPolicy,
    log: VecDeque<ConflictRecord>,
    log_capacity: usize,
    stats: ResolverStats,
}

impl ConflictResolver {
    pub fn new(policy: ResolutionPolicy) -> Self {
        Self {
            policy,
            log: VecDeque::with_capacity(DEFAULT_LOG_CAPACITY),
            log_capacity: DEFAULT_LOG_CAPACITY,
            stats: ResolverStats::default(),
        }
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Runs detection, recording any conflict in the ring and the
    /// per-kind statistics.
    pub fn detect(
        &mut self,
        local: &StateSnapshot,
        remote: &StateSnapshot,
    ) -> Option<ConflictRecord> {
        let record = detect_conflict(local, remote)?;
        tracing::debug!(
            kind = %record.kind,
            local_version = record.local_version,
            remote_version = record.remote_version,
            "conflict detected"
        );
        *self.stats.by_kind.entry(record.kind).or_insert(0) += 1;
        if self.log.len() == self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(record.clone());
        Some(record)
    }

    /// Applies the configured policy to a local/remote pair.
    pub fn resolve(
        &mut self,
        local: &StateSnapshot,
        remote: &StateSnapshot,
    ) -> Resolution {
        let started = Instant::now();
        let resolution = self.resolve_inner(local, remote);

        *self
            .stats
            .by_strategy
            .entry(resolution.strategy)
            .or_insert(0) += 1;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.avg_resolution_ms = if self.stats.avg_resolution_ms == 0.0
        {
            elapsed_ms
        } else {
            0.1 * elapsed_ms + 0.9 * self.stats.avg_resolution_ms
        };

        resolution
    }

    fn resolve_inner(
        &self,
        local: &StateSnapshot,
        remote: &StateSnapshot,
    ) -> Resolution {
        match self.policy {
            ResolutionPolicy::ServerAuthoritative => {
                let compensation = grid_compensation(local, remote);
                Resolution {
                    success: true,
                    strategy: self.policy,
                    resolved: remote.clone(),
                    rollback_required: !compensation.is_empty(),
                    compensation,
                    message: "server state adopted".into(),
                }
            }
            ResolutionPolicy::ClientAuthoritative => Resolution {
                success: true,
                strategy: self.policy,
                resolved: local.clone(),
                rollback_required: false,
                compensation: Vec::new(),
                message: "local state kept".into(),
            },
            ResolutionPolicy::LatestTimestamp => {
                if remote.timestamp > local.timestamp {
                    Resolution {
                        success: true,
                        strategy: self.policy,
                        resolved: remote.clone(),
                        rollback_required: true,
                        compensation: grid_compensation(local, remote),
                        message: "remote snapshot is newer".into(),
                    }
                } else {
                    Resolution {
                        success: true,
                        strategy: self.policy,
                        resolved: local.clone(),
                        rollback_required: false,
                        compensation: Vec::new(),
                        message: "local snapshot is newer".into(),
                    }
                }
            }
            ResolutionPolicy::Merge => match merge_snapshots(local, remote)
            {
                Ok(merged) => {
                    let compensation = grid_compensation(local, &merged);
                    Resolution {
                        success: true,
                        strategy: self.policy,
                        resolved: merged,
                        rollback_required: false,
                        compensation,
                        message: "snapshots merged".into(),
                    }
                }
                Err(e) => Resolution {
                    success: false,
                    strategy: self.policy,
                    resolved: local.clone(),
                    rollback_required: false,
                    compensation: Vec::new(),
                    message: format!("merge failed: {e}"),
                },
            },
            ResolutionPolicy::Rollback => {
                let resolved = if local.version <= remote.version {
                    local.clone()
                } else {
                    remote.clone()
                };
                Resolution {
                    success: true,
                    strategy: self.policy,
                    rollback_required: true,
                    compensation: Vec::new(),
                    message: format!(
                        "rewound to version {}",
                        resolved.version
                    ),
                    resolved,
                }
            }
        }
    }

    /// The retained conflict records, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.log.iter()
    }

    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolutionPolicy::default())
    }
}

/// Cell-level diffs turning `local`'s grids into `target`'s — the
/// compensation a losing side applies to repair its board.
fn grid_compensation(
    local: &StateSnapshot,
    target: &StateSnapshot,
) -> Vec<Change> {
    let mut changes = Vec::new();
    for (selector, from, to) in [
        (
            GridSelector::Player,
            &local.player_grid,
            &target.player_grid,
        ),
        (
            GridSelector::Opponent,
            &local.opponent_grid,
            &target.opponent_grid,
        ),
    ] {
        if !from.same_shape(to) {
            continue;
        }
        for (row, col, tag) in to.iter() {
            if from.get(row, col) != Some(tag) {
                changes.push(Change::Cell {
                    grid: selector,
                    row,
                    col,
                    value: tag,
                });
            }
        }
    }
    changes
}

/// MERGE synthesis: scalars take the max; timestamp, turn, and active
/// events follow the later snapshot; each cell takes the non-empty
/// value, preferring the local grid when both are non-empty. The
/// result's version is one past both inputs.
pub fn merge_snapshots(
    local: &StateSnapshot,
    remote: &StateSnapshot,
) -> Result<StateSnapshot, SyncError> {
    if !local.player_grid.same_shape(&remote.player_grid)
        || !local.opponent_grid.same_shape(&remote.opponent_grid)
    {
        return Err(SyncError::ShapeMismatch);
    }

    let later = if remote.timestamp > local.timestamp {
        remote
    } else {
        local
    };

    let merge_grid = |ours: &Grid, theirs: &Grid| {
        let mut merged = ours.clone();
        for (row, col, tag) in ours.iter() {
            if tag.is_empty() {
                if let Some(theirs_tag) = theirs.get(row, col) {
                    merged.set(row, col, theirs_tag);
                }
            }
        }
        merged
    };

    Ok(StateSnapshot {
        version: local.version.max(remote.version) + 1,
        timestamp: later.timestamp,
        player_grid: merge_grid(&local.player_grid, &remote.player_grid),
        opponent_grid: merge_grid(
            &local.opponent_grid,
            &remote.opponent_grid,
        ),
        player_score: local.player_score.max(remote.player_score),
        opponent_score: local.opponent_score.max(remote.opponent_score),
        player_moves: local.player_moves.max(remote.player_moves),
        opponent_moves: local.opponent_moves.max(remote.opponent_moves),
        event_progress: local.event_progress.max(remote.event_progress),
        active_events: later.active_events.clone(),
        current_turn: later.current_turn,
    })
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use matchwire_protocol::{CellTag, Turn};

    /// A baseline snapshot; both grids 4×4, all cells CellTag(1).
    fn snap(version: u64) -> StateSnapshot {
        StateSnapshot {
            version,
            timestamp: 1_000_000,
            player_grid: Grid::filled(4, 4, CellTag(1)),
            opponent_grid: Grid::filled(4, 4, CellTag(1)),
            player_score: 100,
            opponent_score: 100,
            player_moves: 5,
            opponent_moves: 5,
            event_progress: 10,
            active_events: vec![],
            current_turn: Turn::Player,
        }
    }

    fn snap_with(
        version: u64,
        f: impl FnOnce(&mut StateSnapshot),
    ) -> StateSnapshot {
        let mut s = snap(version);
        f(&mut s);
        s
    }

    // =====================================================================
    // Detection — one test per check, plus ordering
    // =====================================================================

    #[test]
    fn test_no_conflict_when_aligned() {
        assert!(detect_conflict(&snap(3), &snap(3)).is_none());
        // One version apart is within tolerance.
        assert!(detect_conflict(&snap(3), &snap(4)).is_none());
    }

    #[test]
    fn test_version_mismatch_beyond_one() {
        let record = detect_conflict(&snap(3), &snap(5)).unwrap();
        assert_eq!(record.kind, ConflictKind::VersionMismatch);
        assert_eq!(record.local_version, 3);
        assert_eq!(record.remote_version, 5);
    }

    #[test]
    fn test_grid_inconsistency_beyond_five_cells() {
        // The remote's player grid is its own board — our opponent
        // grid mirrors it. Six differing cells trip the check.
        let remote = snap_with(3, |s| {
            for col in 0..4 {
                s.player_grid.set(0, col, CellTag(9));
            }
            s.player_grid.set(1, 0, CellTag(9));
            s.player_grid.set(1, 1, CellTag(9));
        });
        let record = detect_conflict(&snap(3), &remote).unwrap();
        assert_eq!(record.kind, ConflictKind::GridInconsistency);
    }

    #[test]
    fn test_five_differing_cells_is_tolerated() {
        let remote = snap_with(3, |s| {
            for col in 0..4 {
                s.player_grid.set(0, col, CellTag(9));
            }
            s.player_grid.set(1, 0, CellTag(9));
        });
        assert!(detect_conflict(&snap(3), &remote).is_none());
    }

    #[test]
    fn test_score_mismatch_beyond_hundred() {
        let remote = snap_with(3, |s| s.player_score = 301);
        let record = detect_conflict(&snap(3), &remote).unwrap();
        assert_eq!(record.kind, ConflictKind::ScoreMismatch);
    }

    #[test]
    fn test_state_divergence_beyond_ten_seconds() {
        let remote = snap_with(3, |s| s.timestamp += 10_001);
        let record = detect_conflict(&snap(3), &remote).unwrap();
        assert_eq!(record.kind, ConflictKind::StateDivergence);
    }

    #[test]
    fn test_detection_order_version_wins() {
        // Both a version gap and a score gap: the version check runs
        // first and names the conflict.
        let remote = snap_with(9, |s| s.player_score = 999);
        let record = detect_conflict(&snap(3), &remote).unwrap();
        assert_eq!(record.kind, ConflictKind::VersionMismatch);
    }

    // =====================================================================
    // Resolution policies
    // =====================================================================

    /// Scenario: local and remote differ in 7 cells.
    fn seven_cell_pair() -> (StateSnapshot, StateSnapshot) {
        let local = snap(3);
        let remote = snap_with(3, |s| {
            for col in 0..4 {
                s.player_grid.set(0, col, CellTag(7));
            }
            s.player_grid.set(1, 0, CellTag(7));
            s.player_grid.set(1, 1, CellTag(7));
            s.player_grid.set(1, 2, CellTag(7));
        });
        (local, remote)
    }

    #[test]
    fn test_server_authoritative_adopts_remote_with_compensation() {
        let (local, remote) = seven_cell_pair();

        // Detection first: 7 > 5 differing cells.
        let record = detect_conflict(&local, &remote).unwrap();
        assert_eq!(record.kind, ConflictKind::GridInconsistency);

        let mut resolver =
            ConflictResolver::new(ResolutionPolicy::ServerAuthoritative);
        let resolution = resolver.resolve(&local, &remote);

        assert!(resolution.success);
        assert_eq!(
            resolution.strategy,
            ResolutionPolicy::ServerAuthoritative
        );
        assert_eq!(resolution.resolved, remote);
        assert!(resolution.rollback_required);
        assert_eq!(resolution.compensation.len(), 7);
    }

    #[test]
    fn test_server_authoritative_agreeing_needs_no_rollback() {
        let local = snap(3);
        let mut resolver =
            ConflictResolver::new(ResolutionPolicy::ServerAuthoritative);
        let resolution = resolver.resolve(&local, &local.clone());
        assert!(!resolution.rollback_required);
        assert!(resolution.compensation.is_empty());
    }

    #[test]
    fn test_client_authoritative_keeps_local() {
        let (local, remote) = seven_cell_pair();
        let mut resolver =
            ConflictResolver::new(ResolutionPolicy::ClientAuthoritative);
        let resolution = resolver.resolve(&local, &remote);

        assert_eq!(resolution.resolved, local);
        assert!(!resolution.rollback_required);
        assert!(resolution.compensation.is_empty());
    }

    #[test]
    fn test_latest_timestamp_remote_wins_with_rollback() {
        let (local, mut remote) = seven_cell_pair();
        remote.timestamp = local.timestamp + 500;

        let mut resolver =
            ConflictResolver::new(ResolutionPolicy::LatestTimestamp);
        let resolution = resolver.resolve(&local, &remote);

        assert_eq!(resolution.resolved, remote);
        assert!(resolution.rollback_required);
        assert_eq!(resolution.compensation.len(), 7);
    }

    #[test]
    fn test_latest_timestamp_local_wins_without_rollback() {
        let (mut local, remote) = seven_cell_pair();
        local.timestamp = remote.timestamp + 500;

        let mut resolver =
            ConflictResolver::new(ResolutionPolicy::LatestTimestamp);
        let resolution = resolver.resolve(&local, &remote);

        assert_eq!(resolution.resolved, local);
        assert!(!resolution.rollback_required);
        assert!(resolution.compensation.is_empty());
    }

    #[test]
    fn test_rollback_picks_smaller_version() {
        let local = snap(7);
        let remote = snap(4);
        let mut resolver =
            ConflictResolver::new(ResolutionPolicy::Rollback);
        let resolution = resolver.resolve(&local, &remote);

        assert_eq!(resolution.resolved.version, 4);
        assert!(resolution.rollback_required);
        assert!(resolution.compensation.is_empty());
    }

    // =====================================================================
    // MERGE
    // =====================================================================

    #[test]
    fn test_merge_takes_scalar_max_and_later_metadata() {
        let local = snap_with(3, |s| {
            s.player_score = 250;
            s.opponent_moves = 9;
        });
        let remote = snap_with(4, |s| {
            s.timestamp += 100;
            s.opponent_score = 180;
            s.active_events = vec!["rush".into()];
            s.current_turn = Turn::Opponent;
        });

        let merged = merge_snapshots(&local, &remote).unwrap();

        assert_eq!(merged.version, 5, "max(3, 4) + 1");
        assert_eq!(merged.player_score, 250);
        assert_eq!(merged.opponent_score, 180);
        assert_eq!(merged.opponent_moves, 9);
        // Later snapshot supplies timestamp, turn, and events.
        assert_eq!(merged.timestamp, remote.timestamp);
        assert_eq!(merged.current_turn, Turn::Opponent);
        assert_eq!(merged.active_events, vec!["rush".to_string()]);
    }

    #[test]
    fn test_merge_prefers_non_empty_then_local_cells() {
        let local = snap_with(3, |s| {
            s.player_grid = Grid::empty(2, 2);
            s.player_grid.set(0, 0, CellTag(5));
            // (0,1) empty locally, filled remotely
            // (1,0) empty in both
        });
        let remote = snap_with(3, |s| {
            s.player_grid = Grid::empty(2, 2);
            s.player_grid.set(0, 0, CellTag(8)); // both non-empty → local
            s.player_grid.set(0, 1, CellTag(8)); // only remote → remote
        });

        let merged = merge_snapshots(&local, &remote).unwrap();

        assert_eq!(merged.player_grid.get(0, 0), Some(CellTag(5)));
        assert_eq!(merged.player_grid.get(0, 1), Some(CellTag(8)));
        assert_eq!(merged.player_grid.get(1, 0), Some(CellTag::EMPTY));
    }

    #[test]
    fn test_merge_shape_mismatch_fails_softly() {
        let local = snap(3);
        let remote = snap_with(3, |s| s.player_grid = Grid::empty(2, 2));

        let mut resolver = ConflictResolver::new(ResolutionPolicy::Merge);
        let resolution = resolver.resolve(&local, &remote);

        assert!(!resolution.success);
        assert_eq!(resolution.resolved, local, "falls back to local");
    }

    // =====================================================================
    // Observability
    // =====================================================================

    #[test]
    fn test_detect_records_history_and_stats() {
        let mut resolver = ConflictResolver::default();
        let (local, remote) = seven_cell_pair();

        resolver.detect(&local, &remote);
        resolver.detect(&snap(1), &snap(9));

        let kinds: Vec<_> =
            resolver.history().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ConflictKind::GridInconsistency,
                ConflictKind::VersionMismatch
            ]
        );
        assert_eq!(
            resolver.stats().by_kind[&ConflictKind::VersionMismatch],
            1
        );
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let mut resolver = ConflictResolver::default();
        for i in 0..150 {
            resolver.detect(&snap(1), &snap(10 + i));
        }
        assert_eq!(resolver.history().count(), 100);
        // The oldest records fell off the front.
        let first = resolver.history().next().unwrap();
        assert_eq!(first.remote_version, 60);
    }

    #[test]
    fn test_resolution_stats_track_strategy_and_latency() {
        let mut resolver =
            ConflictResolver::new(ResolutionPolicy::ServerAuthoritative);
        let (local, remote) = seven_cell_pair();
        resolver.resolve(&local, &remote);
        resolver.resolve(&local, &remote);

        let stats = resolver.stats();
        assert_eq!(
            stats.by_strategy[&ResolutionPolicy::ServerAuthoritative],
            2
        );
        assert!(stats.avg_resolution_ms >= 0.0);
    }
}
