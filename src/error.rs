//! Error types for the engine.
//!
//! Every variant is fatal to the run in progress: BFS has no
//! partial-failure semantics. Back-pressure, buffer-pool growth, and
//! end-of-level sentinels are normal operation, not errors.

use thiserror::Error;

/// Fatal engine errors.
#[derive(Debug, Error)]
pub enum BfsError {
    /// The process grid is not a power-of-two rectangle.
    #[error("invalid grid shape: {rows} x {cols} (both sides must be powers of two)")]
    GridShape {
        /// Requested row count.
        rows: usize,
        /// Requested column count.
        cols: usize,
    },

    /// A resumed run log disagrees with the current configuration.
    #[error("run log mismatch on {field}: log has {found}, run has {expected}")]
    LogMismatch {
        /// Name of the mismatched field.
        field: &'static str,
        /// Value in the current configuration.
        expected: i64,
        /// Value found in the log.
        found: i64,
    },

    /// The transport reported an unexpected state or a peer aborted.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A BFS result failed validation.
    #[error("validation failure: {0}")]
    Validation(String),

    /// Filesystem errors from the run log or edge spill file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BfsError>;
