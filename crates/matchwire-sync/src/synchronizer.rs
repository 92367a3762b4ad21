//! Snapshot construction, delta generation/application, and sync-mode
//! selection.

use matchwire_protocol::{
    now_ms, Change, CounterKind, Grid, GridSelector, StateDelta,
    StateSnapshot, Turn,
};

use crate::SyncError;

/// In HYBRID mode, every Nth sync ships a full keyframe regardless of
/// how small the delta would be.
const KEYFRAME_EVERY: u64 = 10;

/// In HYBRID mode, a delta with more change records than this ships as
/// a full snapshot instead.
const MAX_DELTA_CHANGES: usize = 50;

// ---------------------------------------------------------------------------
// EngineState — the copy-in source
// ---------------------------------------------------------------------------

/// The game engine's exposed state, as handed to the synchronizer.
///
/// This is everything a snapshot carries except `version` and
/// `timestamp`, which the synchronizer stamps itself. The core never
/// interprets these fields; it copies them in.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    pub player_grid: Grid,
    pub opponent_grid: Grid,
    pub player_score: u32,
    pub opponent_score: u32,
    pub player_moves: u32,
    pub opponent_moves: u32,
    pub event_progress: u32,
    pub active_events: Vec<String>,
    pub current_turn: Turn,
}

impl EngineState {
    fn into_snapshot(self, version: u64) -> StateSnapshot {
        StateSnapshot {
            version,
            timestamp: now_ms(),
            player_grid: self.player_grid,
            opponent_grid: self.opponent_grid,
            player_score: self.player_score,
            opponent_score: self.opponent_score,
            player_moves: self.player_moves,
            opponent_moves: self.opponent_moves,
            event_progress: self.event_progress,
            active_events: self.active_events,
            current_turn: self.current_turn,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync mode and payload
// ---------------------------------------------------------------------------

/// How a producer ships its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Every sync is a full snapshot.
    Full,
    /// Every sync is a delta (except the very first — there is no
    /// previous snapshot to diff against).
    Delta,
    /// Delta, unless there is no previous snapshot, the periodic
    /// keyframe is due, or the delta grew past the change cutoff.
    #[default]
    Hybrid,
}

/// What [`Synchronizer::next_sync`] decided to ship.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPayload {
    Full(StateSnapshot),
    Delta(StateDelta),
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Per-producer sync statistics.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub full_syncs: u64,
    pub delta_syncs: u64,
    /// Exponential moving average of delta size, in change records
    /// (α = 0.1).
    pub avg_delta_changes: f64,
    /// Exponential moving average of sync round-trip latency in
    /// milliseconds (α = 0.1), fed by the session controller.
    pub avg_latency_ms: f64,
    /// Conflicts observed by this producer.
    pub conflicts: u64,
}

impl SyncStats {
    pub fn total_syncs(&self) -> u64 {
        self.full_syncs + self.delta_syncs
    }
}

const STATS_ALPHA: f64 = 0.1;

fn ema(prev: f64, sample: f64) -> f64 {
    if prev == 0.0 {
        sample
    } else {
        STATS_ALPHA * sample + (1.0 - STATS_ALPHA) * prev
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// One producer's synchronization state: the monotone version counter,
/// the current and previous snapshots, and the shipping statistics.
#[derive(Debug, Default)]
pub struct Synchronizer {
    mode: SyncMode,
    version: u64,
    current: Option<StateSnapshot>,
    previous: Option<StateSnapshot>,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Captures the engine state into a new snapshot at `version + 1`,
    /// shifting previous ← current ← new.
    pub fn create_snapshot(&mut self, view: EngineState) -> StateSnapshot {
        self.version += 1;
        let snapshot = view.into_snapshot(self.version);
        self.previous = self.current.take();
        self.current = Some(snapshot.clone());
        snapshot
    }

    /// The sparse diff from the previous snapshot to the current one.
    /// `None` when there is no previous snapshot, the grids changed
    /// shape, or nothing changed at all.
    pub fn make_delta(&self) -> Option<StateDelta> {
        let current = self.current.as_ref()?;
        let previous = self.previous.as_ref()?;
        let changes = diff_snapshots(previous, current).ok()?;
        if changes.is_empty() {
            return None;
        }
        Some(StateDelta {
            version: current.version,
            base_version: previous.version,
            changes,
            timestamp: current.timestamp,
        })
    }

    /// Mode selection: whether the given delta should ship instead of
    /// a full snapshot. The HYBRID keyframe counts the sync about to
    /// ship: every tenth physical sync goes out as a full snapshot, no
    /// matter how small its delta would have been.
    pub fn should_use_delta(&self, delta: Option<&StateDelta>) -> bool {
        let Some(delta) = delta else {
            return false;
        };
        match self.mode {
            SyncMode::Full => false,
            SyncMode::Delta => true,
            SyncMode::Hybrid => {
                if (self.stats.total_syncs() + 1) % KEYFRAME_EVERY == 0 {
                    return false;
                }
                delta.changes.len() <= MAX_DELTA_CHANGES
            }
        }
    }

    /// Captures the engine state and decides what to ship, updating
    /// the statistics.
    pub fn next_sync(&mut self, view: EngineState) -> SyncPayload {
        let snapshot = self.create_snapshot(view);
        let delta = self.make_delta();

        if self.should_use_delta(delta.as_ref()) {
            // should_use_delta returned true, so the delta exists.
            if let Some(delta) = delta {
                self.stats.delta_syncs += 1;
                self.stats.avg_delta_changes =
                    ema(self.stats.avg_delta_changes, delta.changes.len() as f64);
                return SyncPayload::Delta(delta);
            }
        }
        self.stats.full_syncs += 1;
        SyncPayload::Full(snapshot)
    }

    /// Version validation for inbound remote snapshots: accept anything
    /// not more than 5 versions behind our own producer counter; older
    /// remotes are discarded as stale.
    pub fn accept_remote(&self, remote: &StateSnapshot) -> bool {
        remote.version + 5 >= self.version
    }

    /// A delta whose base predates our local version signals divergence
    /// that delta application cannot repair — the conflict resolver
    /// takes over.
    pub fn delta_signals_conflict(&self, delta: &StateDelta) -> bool {
        delta.base_version < self.version
    }

    /// Folds one observed sync round-trip into the latency average.
    pub fn record_latency(&mut self, sample_ms: f64) {
        self.stats.avg_latency_ms = ema(self.stats.avg_latency_ms, sample_ms);
    }

    /// Counts one conflict against this producer.
    pub fn note_conflict(&mut self) {
        self.stats.conflicts += 1;
    }

    pub fn current(&self) -> Option<&StateSnapshot> {
        self.current.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }
}

// ---------------------------------------------------------------------------
// Diff and apply
// ---------------------------------------------------------------------------

/// Cell-by-cell and scalar comparison of two snapshots, producing the
/// change records that turn `base` into `target`.
pub fn diff_snapshots(
    base: &StateSnapshot,
    target: &StateSnapshot,
) -> Result<Vec<Change>, SyncError> {
    if !base.player_grid.same_shape(&target.player_grid)
        || !base.opponent_grid.same_shape(&target.opponent_grid)
    {
        return Err(SyncError::ShapeMismatch);
    }

    let mut changes = Vec::new();

    for (selector, from, to) in [
        (
            GridSelector::Player,
            &base.player_grid,
            &target.player_grid,
        ),
        (
            GridSelector::Opponent,
            &base.opponent_grid,
            &target.opponent_grid,
        ),
    ] {
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

    for (counter, from, to) in [
        (
            CounterKind::PlayerScore,
            base.player_score,
            target.player_score,
        ),
        (
            CounterKind::OpponentScore,
            base.opponent_score,
            target.opponent_score,
        ),
        (
            CounterKind::PlayerMoves,
            base.player_moves,
            target.player_moves,
        ),
        (
            CounterKind::OpponentMoves,
            base.opponent_moves,
            target.opponent_moves,
        ),
    ] {
        if from != to {
            changes.push(Change::Counter { counter, value: to });
        }
    }

    if base.event_progress != target.event_progress
        || base.active_events != target.active_events
    {
        changes.push(Change::Events {
            progress: target.event_progress,
            active: target.active_events.clone(),
        });
    }

    if base.current_turn != target.current_turn {
        changes.push(Change::Turn {
            turn: target.current_turn,
        });
    }

    Ok(changes)
}

/// Applies a delta to a snapshot, producing the snapshot at the delta's
/// version. The input is never mutated — on error the caller's snapshot
/// is exactly as it was.
///
/// Accepts a snapshot already at the delta's version too: change
/// records carry absolute values, so re-application is a no-op, which
/// is what makes delivery retries safe.
pub fn apply_delta(
    snapshot: &StateSnapshot,
    delta: &StateDelta,
) -> Result<StateSnapshot, SyncError> {
    if snapshot.version != delta.base_version
        && snapshot.version != delta.version
    {
        return Err(SyncError::BaseVersionMismatch {
            base: delta.base_version,
            snapshot: snapshot.version,
        });
    }

    let mut next = snapshot.clone();
    next.version = delta.version;
    next.timestamp = delta.timestamp;

    for change in &delta.changes {
        match change {
            Change::Cell {
                grid,
                row,
                col,
                value,
            } => {
                let target = match grid {
                    GridSelector::Player => &mut next.player_grid,
                    GridSelector::Opponent => &mut next.opponent_grid,
                };
                if !target.set(*row, *col, *value) {
                    return Err(SyncError::OutOfRange {
                        row: *row,
                        col: *col,
                    });
                }
            }
            Change::Counter { counter, value } => match counter {
                CounterKind::PlayerScore => next.player_score = *value,
                CounterKind::OpponentScore => next.opponent_score = *value,
                CounterKind::PlayerMoves => next.player_moves = *value,
                CounterKind::OpponentMoves => next.opponent_moves = *value,
            },
            Change::Events { progress, active } => {
                next.event_progress = *progress;
                next.active_events = active.clone();
            }
            Change::Turn { turn } => next.current_turn = *turn,
        }
    }

    Ok(next)
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use matchwire_protocol::CellTag;

    fn view() -> EngineState {
        EngineState {
            player_grid: Grid::filled(6, 6, CellTag(1)),
            opponent_grid: Grid::filled(6, 6, CellTag(2)),
            player_score: 0,
            opponent_score: 0,
            player_moves: 0,
            opponent_moves: 0,
            event_progress: 0,
            active_events: vec![],
            current_turn: Turn::Player,
        }
    }

    fn view_with(f: impl FnOnce(&mut EngineState)) -> EngineState {
        let mut v = view();
        f(&mut v);
        v
    }

    // =====================================================================
    // Versioning
    // =====================================================================

    #[test]
    fn test_versions_are_strictly_monotone_per_producer() {
        let mut sync = Synchronizer::new(SyncMode::Full);
        let s1 = sync.create_snapshot(view());
        let s2 = sync.create_snapshot(view());
        let s3 = sync.create_snapshot(view());
        assert_eq!((s1.version, s2.version, s3.version), (1, 2, 3));
    }

    #[test]
    fn test_create_snapshot_shifts_previous() {
        let mut sync = Synchronizer::new(SyncMode::Hybrid);
        sync.create_snapshot(view());
        sync.create_snapshot(view_with(|v| v.player_score = 50));

        assert_eq!(sync.current().unwrap().player_score, 50);
        // The previous is reachable through the delta machinery.
        assert!(sync.make_delta().is_some());
    }

    // =====================================================================
    // Delta generation
    // =====================================================================

    #[test]
    fn test_delta_requires_a_previous_snapshot() {
        let mut sync = Synchronizer::new(SyncMode::Delta);
        sync.create_snapshot(view());
        assert!(sync.make_delta().is_none());
    }

    #[test]
    fn test_delta_is_none_when_nothing_changed() {
        let mut sync = Synchronizer::new(SyncMode::Delta);
        sync.create_snapshot(view());
        sync.create_snapshot(view());
        assert!(sync.make_delta().is_none());
    }

    #[test]
    fn test_delta_carries_one_change_per_difference() {
        let mut sync = Synchronizer::new(SyncMode::Delta);
        sync.create_snapshot(view());
        sync.create_snapshot(view_with(|v| {
            v.player_grid.set(0, 0, CellTag(9));
            v.player_grid.set(1, 2, CellTag(9));
            v.player_score = 120;
            v.current_turn = Turn::Opponent;
        }));

        let delta = sync.make_delta().unwrap();

        assert_eq!(delta.base_version, 1);
        assert_eq!(delta.version, 2);
        assert_eq!(delta.changes.len(), 4);
        assert_eq!(
            delta
                .changes
                .iter()
                .filter(|c| matches!(c, Change::Cell { .. }))
                .count(),
            2
        );
    }

    // =====================================================================
    // Delta application
    // =====================================================================

    #[test]
    fn test_apply_delta_reaches_the_target_snapshot() {
        let mut sync = Synchronizer::new(SyncMode::Delta);
        let base = sync.create_snapshot(view());
        let target = sync.create_snapshot(view_with(|v| {
            v.opponent_grid.set(3, 3, CellTag(7));
            v.opponent_score = 30;
            v.event_progress = 10;
            v.active_events = vec!["surge".into()];
        }));
        let delta = sync.make_delta().unwrap();

        let applied = apply_delta(&base, &delta).unwrap();

        assert_eq!(applied, target);
    }

    #[test]
    fn test_apply_delta_is_idempotent() {
        let mut sync = Synchronizer::new(SyncMode::Delta);
        let base = sync.create_snapshot(view());
        sync.create_snapshot(view_with(|v| v.player_score = 99));
        let delta = sync.make_delta().unwrap();

        let once = apply_delta(&base, &delta).unwrap();
        let twice = apply_delta(&once, &delta).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_apply_delta_rejects_version_gap() {
        let mut sync = Synchronizer::new(SyncMode::Delta);
        let base = sync.create_snapshot(view());
        sync.create_snapshot(view_with(|v| v.player_score = 1));
        sync.create_snapshot(view_with(|v| v.player_score = 2));
        let delta = sync.make_delta().unwrap(); // base_version = 2

        let result = apply_delta(&base, &delta);
        assert!(matches!(
            result,
            Err(SyncError::BaseVersionMismatch {
                base: 2,
                snapshot: 1
            })
        ));
    }

    #[test]
    fn test_apply_delta_out_of_range_leaves_input_untouched() {
        let base = Synchronizer::new(SyncMode::Full).create_snapshot(view());
        let delta = StateDelta {
            version: 2,
            base_version: 1,
            changes: vec![Change::Cell {
                grid: GridSelector::Player,
                row: 99,
                col: 0,
                value: CellTag(1),
            }],
            timestamp: 0,
        };

        let before = base.clone();
        let result = apply_delta(&base, &delta);

        assert!(matches!(result, Err(SyncError::OutOfRange { .. })));
        assert_eq!(base, before);
    }

    // =====================================================================
    // Mode selection (the HYBRID rules)
    // =====================================================================

    fn small_change(v: &mut EngineState, n: u8) {
        v.player_grid.set(0, 0, CellTag(n));
    }

    #[test]
    fn test_full_mode_never_ships_deltas() {
        let mut sync = Synchronizer::new(SyncMode::Full);
        sync.next_sync(view());
        let payload = sync.next_sync(view_with(|v| small_change(v, 3)));
        assert!(matches!(payload, SyncPayload::Full(_)));
    }

    #[test]
    fn test_delta_mode_ships_delta_after_the_first() {
        let mut sync = Synchronizer::new(SyncMode::Delta);
        // Very first sync must be full: no previous exists.
        assert!(matches!(sync.next_sync(view()), SyncPayload::Full(_)));
        let payload = sync.next_sync(view_with(|v| small_change(v, 3)));
        assert!(matches!(payload, SyncPayload::Delta(_)));
    }

    #[test]
    fn test_hybrid_keyframe_every_tenth_sync() {
        let mut sync = Synchronizer::new(SyncMode::Hybrid);
        sync.next_sync(view()); // first sync: full (no previous)

        // Syncs 2–9: small deltas.
        for n in 2..=9u8 {
            let payload = sync.next_sync(view_with(|v| small_change(v, n)));
            assert!(
                matches!(payload, SyncPayload::Delta(_)),
                "sync {n} should be a delta"
            );
        }
        assert_eq!(sync.stats().total_syncs(), 9);

        // The 10th sync is the keyframe — a full snapshot ships, no
        // matter how small the delta would have been.
        let payload = sync.next_sync(view_with(|v| small_change(v, 10)));
        assert!(matches!(payload, SyncPayload::Full(_)));
        assert_eq!(sync.stats().total_syncs(), 10);

        // The 11th goes back to delta.
        let payload = sync.next_sync(view_with(|v| small_change(v, 11)));
        assert!(matches!(payload, SyncPayload::Delta(_)));
    }

    #[test]
    fn test_hybrid_large_delta_ships_full() {
        let mut sync = Synchronizer::new(SyncMode::Hybrid);
        sync.next_sync(view());

        // Rewriting both 6×6 grids makes 72 cell changes — past the
        // 50-change cutoff, so a full snapshot ships instead.
        let payload = sync.next_sync(view_with(|v| {
            for row in 0..6 {
                for col in 0..6 {
                    v.player_grid.set(row, col, CellTag(5));
                    v.opponent_grid.set(row, col, CellTag(6));
                }
            }
        }));
        assert!(matches!(payload, SyncPayload::Full(_)));
    }

    #[test]
    fn test_hybrid_prefers_delta_for_small_changes() {
        let mut sync = Synchronizer::new(SyncMode::Hybrid);
        sync.next_sync(view());
        let payload = sync.next_sync(view_with(|v| small_change(v, 2)));
        assert!(matches!(payload, SyncPayload::Delta(_)));
    }

    // =====================================================================
    // Remote version validation
    // =====================================================================

    #[test]
    fn test_accept_remote_within_five_versions() {
        let mut sync = Synchronizer::new(SyncMode::Full);
        for _ in 0..10 {
            sync.create_snapshot(view());
        }
        // Local version is 10; remotes at 5..=10 are fine, 4 is stale.
        let mut remote = view().into_snapshot(5);
        assert!(sync.accept_remote(&remote));
        remote.version = 4;
        assert!(!sync.accept_remote(&remote));
        remote.version = 12;
        assert!(sync.accept_remote(&remote));
    }

    #[test]
    fn test_old_delta_base_signals_conflict() {
        let mut sync = Synchronizer::new(SyncMode::Full);
        for _ in 0..3 {
            sync.create_snapshot(view());
        }
        let delta = StateDelta {
            version: 3,
            base_version: 2,
            changes: vec![],
            timestamp: 0,
        };
        assert!(sync.delta_signals_conflict(&delta));

        let fresh = StateDelta {
            version: 4,
            base_version: 3,
            changes: vec![],
            timestamp: 0,
        };
        assert!(!sync.delta_signals_conflict(&fresh));
    }

    // =====================================================================
    // Statistics
    // =====================================================================

    #[test]
    fn test_stats_count_full_and_delta_syncs() {
        let mut sync = Synchronizer::new(SyncMode::Hybrid);
        sync.next_sync(view());
        sync.next_sync(view_with(|v| small_change(v, 2)));
        sync.next_sync(view_with(|v| small_change(v, 3)));

        let stats = sync.stats();
        assert_eq!(stats.full_syncs, 1);
        assert_eq!(stats.delta_syncs, 2);
        assert_eq!(stats.total_syncs(), 3);
        assert!(stats.avg_delta_changes > 0.0);
    }

    #[test]
    fn test_latency_average_moves_toward_samples() {
        let mut sync = Synchronizer::new(SyncMode::Hybrid);
        sync.record_latency(100.0);
        assert_eq!(sync.stats().avg_latency_ms, 100.0);
        sync.record_latency(50.0);
        let avg = sync.stats().avg_latency_ms;
        assert!(avg < 100.0 && avg > 50.0);
    }
}
