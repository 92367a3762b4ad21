//! The synchronized game-state model carried inside STATE_SYNC frames.
//!
//! The core never interprets game rules: cell tags, event tags, and move
//! positions are opaque tokens it shuttles between the game engine on
//! one side and the wire on the other. What the core *does* own is the
//! shape of the synchronized unit — versioned snapshots and the sparse
//! deltas between them — so those types live here, next to the envelope
//! that transports them. The algorithms that diff, apply, and reconcile
//! them live in `matchwire-sync`.

use serde::{Deserialize, Serialize};

use crate::types::GridPos;

// ---------------------------------------------------------------------------
// Cells and grids
// ---------------------------------------------------------------------------

/// An opaque cell tag. Only the game engine knows what the value means;
/// the core relies on exactly one convention: `0` is the empty cell
/// (needed by the MERGE conflict policy, which prefers non-empty cells).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct CellTag(pub u8);

impl CellTag {
    /// The empty cell.
    pub const EMPTY: CellTag = CellTag(0);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// A rectangular grid of cell tags, stored row-major.
///
/// Dimensions are fixed at construction; the core only ever reads and
/// writes cells, it never reshapes a grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    rows: usize,
    cols: usize,
    cells: Vec<CellTag>,
}

impl Grid {
    /// Creates a grid with every cell set to `fill`.
    pub fn filled(rows: usize, cols: usize, fill: CellTag) -> Self {
        Self {
            rows,
            cols,
            cells: vec![fill; rows * cols],
        }
    }

    /// Creates an all-empty grid.
    pub fn empty(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, CellTag::EMPTY)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Reads a cell. `None` when the coordinate is out of range.
    pub fn get(&self, row: usize, col: usize) -> Option<CellTag> {
        if row < self.rows && col < self.cols {
            Some(self.cells[row * self.cols + col])
        } else {
            None
        }
    }

    /// Writes a cell. Returns `false` (and leaves the grid untouched)
    /// when the coordinate is out of range.
    pub fn set(&mut self, row: usize, col: usize, value: CellTag) -> bool {
        if row < self.rows && col < self.cols {
            self.cells[row * self.cols + col] = value;
            true
        } else {
            false
        }
    }

    /// Whether two grids have the same dimensions.
    pub fn same_shape(&self, other: &Grid) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }

    /// Iterates `(row, col, tag)` over every cell.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, CellTag)> + '_ {
        let cols = self.cols;
        self.cells
            .iter()
            .enumerate()
            .map(move |(i, &tag)| (i / cols, i % cols, tag))
    }
}

/// Selects which of a snapshot's two grids a change targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum GridSelector {
    Player,
    Opponent,
}

/// Whose turn it is, from the snapshot producer's point of view.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Turn {
    Player,
    Opponent,
}

/// Names one of the snapshot's four integer counters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum CounterKind {
    PlayerScore,
    OpponentScore,
    PlayerMoves,
    OpponentMoves,
}

// ---------------------------------------------------------------------------
// Move tokens
// ---------------------------------------------------------------------------

/// A single move: a swap of two grid positions, numbered by the peer
/// that made it. Move numbers are strictly 1, 2, 3, … per (peer, room);
/// the room rejects anything else. The origin peer id and the server
/// timestamp ride alongside this token in the envelope / move log, not
/// inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToken {
    pub pos_a: GridPos,
    pub pos_b: GridPos,
    pub move_number: u64,
}

// ---------------------------------------------------------------------------
// Snapshots and deltas
// ---------------------------------------------------------------------------

/// A full capture of one room's game state at a given version.
///
/// Versions are monotone *per producer* (each player's client produces
/// its own sequence); they are not globally ordered across producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Monotone per producer, assigned at snapshot creation.
    pub version: u64,
    /// Producer clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub player_grid: Grid,
    pub opponent_grid: Grid,
    pub player_score: u32,
    pub opponent_score: u32,
    pub player_moves: u32,
    pub opponent_moves: u32,
    pub event_progress: u32,
    #[serde(default)]
    pub active_events: Vec<String>,
    pub current_turn: Turn,
}

impl StateSnapshot {
    /// Sum of both score counters — the quantity the SCORE_MISMATCH
    /// conflict check compares.
    pub fn score_total(&self) -> u64 {
        self.player_score as u64 + self.opponent_score as u64
    }
}

/// One sparse change between two snapshot versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Change {
    /// A single cell took a new tag.
    Cell {
        grid: GridSelector,
        row: usize,
        col: usize,
        value: CellTag,
    },
    /// One of the four named counters took a new value.
    Counter { counter: CounterKind, value: u32 },
    /// Event progress and the active-event set changed.
    Events {
        progress: u32,
        #[serde(default)]
        active: Vec<String>,
    },
    /// The turn flipped.
    Turn { turn: Turn },
}

/// A sparse description of the changes from `base_version` to `version`.
///
/// Applying a delta with `base_version = V` to a snapshot at version V
/// yields a snapshot at the delta's `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    pub version: u64,
    pub base_version: u64,
    pub changes: Vec<Change>,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_get_set_in_range() {
        let mut g = Grid::empty(3, 4);
        assert!(g.set(2, 3, CellTag(7)));
        assert_eq!(g.get(2, 3), Some(CellTag(7)));
        assert_eq!(g.get(0, 0), Some(CellTag::EMPTY));
    }

    #[test]
    fn test_grid_out_of_range_reads_none_writes_false() {
        let mut g = Grid::empty(3, 4);
        assert_eq!(g.get(3, 0), None);
        assert_eq!(g.get(0, 4), None);
        assert!(!g.set(3, 0, CellTag(1)));
        // The failed write left every cell untouched.
        assert!(g.iter().all(|(_, _, tag)| tag.is_empty()));
    }

    #[test]
    fn test_grid_iter_is_row_major() {
        let mut g = Grid::empty(2, 2);
        g.set(0, 1, CellTag(1));
        g.set(1, 0, CellTag(2));
        let cells: Vec<_> = g.iter().collect();
        assert_eq!(
            cells,
            vec![
                (0, 0, CellTag::EMPTY),
                (0, 1, CellTag(1)),
                (1, 0, CellTag(2)),
                (1, 1, CellTag::EMPTY),
            ]
        );
    }

    #[test]
    fn test_grid_same_shape() {
        assert!(Grid::empty(8, 8).same_shape(&Grid::empty(8, 8)));
        assert!(!Grid::empty(8, 8).same_shape(&Grid::empty(8, 7)));
    }

    #[test]
    fn test_cell_tag_serializes_as_plain_number() {
        let json = serde_json::to_string(&CellTag(5)).unwrap();
        assert_eq!(json, "5");
    }

    #[test]
    fn test_change_cell_json_shape() {
        let change = Change::Cell {
            grid: GridSelector::Opponent,
            row: 2,
            col: 5,
            value: CellTag(3),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "cell");
        assert_eq!(json["grid"], "opponent");
        assert_eq!(json["row"], 2);
        assert_eq!(json["col"], 5);
        assert_eq!(json["value"], 3);
    }

    #[test]
    fn test_change_counter_json_shape() {
        let change = Change::Counter {
            counter: CounterKind::OpponentScore,
            value: 1200,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "counter");
        assert_eq!(json["counter"], "opponentScore");
        assert_eq!(json["value"], 1200);
    }

    #[test]
    fn test_delta_round_trip() {
        let delta = StateDelta {
            version: 7,
            base_version: 6,
            changes: vec![
                Change::Turn { turn: Turn::Opponent },
                Change::Events {
                    progress: 40,
                    active: vec!["frenzy".into()],
                },
            ],
            timestamp: 99,
        };
        let bytes = serde_json::to_vec(&delta).unwrap();
        let back: StateDelta = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, delta);
    }

    #[test]
    fn test_snapshot_score_total() {
        let mut snap = StateSnapshot {
            version: 1,
            timestamp: 0,
            player_grid: Grid::empty(1, 1),
            opponent_grid: Grid::empty(1, 1),
            player_score: 300,
            opponent_score: 150,
            player_moves: 0,
            opponent_moves: 0,
            event_progress: 0,
            active_events: vec![],
            current_turn: Turn::Player,
        };
        assert_eq!(snap.score_total(), 450);
        snap.opponent_score = u32::MAX;
        // No overflow: totals are summed in u64.
        assert_eq!(snap.score_total(), 300 + u32::MAX as u64);
    }
}
