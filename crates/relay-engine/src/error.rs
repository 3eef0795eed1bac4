//! Engine errors.
//!
//! Domain errors (cursor seeks, pause misuse) are returned to the
//! immediate caller and never abort a run; work errors (script,
//! transport) flow through the instruction completion path and stop a
//! lane only when the run's failure policies say so.

use std::time::Duration;

use relay_types::EventKind;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Scheduler errors.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A seek targeted a coordinate outside the cursor's bounds.
    #[error("cursor out of bounds: position {position}, iteration {iteration} (length {length}, cycles {cycles})")]
    CursorOutOfBounds {
        position: i64,
        iteration: i64,
        length: usize,
        cycles: usize,
    },
    #[error("run is already paused")]
    AlreadyPaused,
    #[error("run is not paused")]
    NotPaused,
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("unknown partition {0}")]
    UnknownPartition(usize),
    /// A script hook failed and the run's policy stops on script errors.
    #[error("{event} script failed: {message}")]
    Script { event: EventKind, message: String },
    /// The transport collaborator could not complete the request.
    #[error("request failed: {0}")]
    Transport(String),
    /// A test assertion failed and the run's policy stops on failures.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
    /// A lane task died without reporting a result.
    #[error("lane failed: {0}")]
    LaneFailed(String),
    #[error("run timed out after {0:?}")]
    Timeout(Duration),
}
