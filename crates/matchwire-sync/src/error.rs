//! Error types for the sync layer.

/// Errors that can occur while applying deltas or reconciling state.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The delta's base does not line up with the snapshot it is being
    /// applied to.
    #[error("delta base {base} does not match snapshot version {snapshot}")]
    BaseVersionMismatch { base: u64, snapshot: u64 },

    /// A cell change points outside the grid. The snapshot is left
    /// untouched.
    #[error("cell change out of range at ({row}, {col})")]
    OutOfRange { row: usize, col: usize },

    /// Two snapshots with differently shaped grids cannot be diffed or
    /// merged.
    #[error("grid shapes do not match")]
    ShapeMismatch,
}
