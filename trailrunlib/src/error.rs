//! Error types for trailrunlib

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while orchestrating a walk or a run.
///
/// Failures of the caller's function never show up here; they are captured
/// per path as [`Outcome::Failure`](crate::Outcome::Failure).
#[derive(Error, Debug)]
pub enum TrailError {
    /// Failed to read a directory while walking
    #[error("failed to walk '{path}': {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },

    /// Failed to resolve a path to an absolute location
    #[error("failed to resolve path '{path}': {source}")]
    Resolve {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid gitignore-style exclude pattern
    #[error("invalid exclude pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Invalid include glob pattern
    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    /// Pool strategy name not recognized
    #[error("unknown pool strategy '{0}' (expected 'isolated' or 'in-process')")]
    UnknownStrategy(String),

    /// Worker pool could not be started
    #[error("failed to start worker pool: {0}")]
    PoolBuild(String),

    /// Execution context could not be serialized for the workers
    #[error("failed to encode execution context: {0}")]
    ContextEncode(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
