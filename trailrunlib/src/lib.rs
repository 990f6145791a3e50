//! # trailrunlib
//!
//! Find the significant files of a project and run a function on each of
//! them in parallel.
//!
//! ## Overview
//!
//! Developer tools (linters, formatters, analyzers) all need the same two
//! things: the list of files that matter, and a way to process them quickly.
//! This library provides both:
//!
//! - **Discovery**: resolves the project root, honors every nested
//!   `.gitignore` between the root and each directory, and never descends
//!   into ignored directories
//! - **Execution**: applies a function to every file on a worker pool,
//!   capturing errors and panics per file instead of aborting the run
//!
//! ## Features
//!
//! - **Layered ignore rules**: deeper `.gitignore` files take precedence,
//!   `!` negations re-include within their own scope
//! - **Explicit paths win**: files named by the caller are always processed
//! - **Two pool strategies**: dedicated worker threads fed a serialized
//!   context, or a shared rayon pool
//! - **Blocking or streaming**: collect every outcome, or consume them as
//!   they complete and stop early at any time
//! - **Ambient context**: an [`ExecutionContext`] captured at call time is
//!   current inside the function on every worker
//!
//! ## Example
//!
//! ```rust
//! use std::fs;
//! use tempfile::tempdir;
//! use trailrunlib::{walk_and_run, Outcome, WalkRequest};
//!
//! // Set up a temporary project
//! let dir = tempdir().unwrap();
//! fs::write(dir.path().join("pyproject.toml"), "").unwrap();
//! fs::write(dir.path().join(".gitignore"), "build/\n").unwrap();
//! fs::create_dir(dir.path().join("build")).unwrap();
//! fs::write(dir.path().join("build/generated.py"), "").unwrap();
//! fs::write(dir.path().join("app.py"), "print('hi')\n").unwrap();
//!
//! // Count lines in every significant file
//! let results = walk_and_run(&WalkRequest::new([dir.path()]), |path| {
//!     fs::read_to_string(path).map(|text| text.lines().count())
//! })
//! .unwrap();
//!
//! assert_eq!(results.len(), 1);
//! let (path, outcome) = results.into_iter().next().unwrap();
//! assert!(path.ends_with("app.py"));
//! assert_eq!(outcome, Outcome::Success(1));
//! ```

pub mod error;
pub mod exec;
pub mod runner;
pub mod source;

pub use error::TrailError;
pub use exec::{
    default_pool, set_default_pool, Engine, ExecutionContext, Failure, FailureKind, Job, Outcome,
    PoolConfig, PoolFactory, RunIter, Strategy, WorkerPool,
};
pub use runner::{project_root, run, run_iter, walk, walk_and_run, RunnerOptions, Trailrunner};
pub use source::{
    ExcludeReason, Excluded, IgnoreSpec, IncludeFilter, PathSet, RootResolver, SpecCache,
    WalkReport, WalkRequest, DEFAULT_EXCLUDES, DEFAULT_INCLUDE_EXTENSIONS, IGNORE_FILE_NAME,
    ROOT_MARKERS,
};

/// Result type for trailrunlib operations
pub type Result<T> = std::result::Result<T, TrailError>;
