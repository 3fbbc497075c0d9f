//! Error types for the stepgate engine.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for engine operations.
///
/// Gate rejections and approval pauses are not errors: they are recorded
/// outcomes on the run (see [`crate::state::MergeOutcome`]). Everything here
/// halts automatic progress and surfaces to the operator.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or contradictory policy/engine configuration. Fatal before
    /// a run starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Planning service returned an invalid or empty plan.
    #[error("planning failed: {0}")]
    Planning(String),

    /// Execution service failed for a step, after bounded retries.
    #[error("step execution failed: {0}")]
    Execution(String),

    /// Review service failed or returned a malformed response.
    #[error("review failed: {0}")]
    Review(String),

    /// Version-control/forge operation failed.
    #[error("forge operation failed: {0}")]
    Forge(String),

    /// Durable write of run state failed. Fatal: a merge must never proceed
    /// without a successfully persisted record.
    #[error("failed to persist run state at {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    /// The per-project lock could not be acquired.
    #[error("could not lock project {project_id}: {reason}")]
    Lock { project_id: String, reason: String },

    /// Repair ceiling reached with unresolved issues.
    #[error("repair attempts exhausted after {0} attempts with unresolved issues")]
    RepairExhausted(u32),

    /// IO error during state or artifact operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
