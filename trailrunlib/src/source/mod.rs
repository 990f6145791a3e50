//! Source discovery: find the files to run on.
//!
//! This module handles the first stage of the pipeline - discovering what
//! files to process. It provides:
//!
//! - **Root resolution**: find the project a path belongs to
//! - **Ignore specs**: layered `.gitignore` rules from the root downwards
//! - **Include filtering**: which walked files are significant
//! - **Walking**: recursive enumeration with subtree pruning
//!
//! ## Example
//!
//! ```rust,ignore
//! use trailrunlib::source::{IncludeFilter, RootResolver, SpecCache, WalkRequest, Walker};
//!
//! let roots = RootResolver::new();
//! let specs = SpecCache::new();
//! let include = IncludeFilter::new();
//!
//! let report = Walker::new(&roots, &specs, &include)
//!     .walk(&WalkRequest::new(["."]).exclude("build/"))?;
//! ```

pub mod filter;
pub mod ignore;
pub mod root;
pub mod walk;

pub use filter::{IncludeFilter, DEFAULT_INCLUDE_EXTENSIONS};
pub use self::ignore::{
    IgnoreLayer, IgnoreSpec, SpecCache, DEFAULT_SPEC_CACHE_CAPACITY, IGNORE_FILE_NAME,
};
pub use root::{RootResolver, ROOT_MARKERS};
pub use walk::{
    ExcludeReason, Excluded, PathSet, WalkReport, WalkRequest, Walker, DEFAULT_EXCLUDES,
};
