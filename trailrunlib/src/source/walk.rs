//! Recursive discovery of significant files.
//!
//! For every start path the walker resolves a project root, then descends
//! with `walkdir`, consulting the caller's excludes and the layered ignore
//! spec of each entry's parent before the entry is yielded. Directories that
//! match are pruned without being read, so an ignored dependency cache costs
//! one check, not a traversal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::TrailError;
use crate::source::filter::IncludeFilter;
use crate::source::ignore::{IgnoreLayer, SpecCache};
use crate::source::root::{resolve_path, RootResolver};
use crate::Result;

/// Patterns excluded from every walk.
///
/// They carry no leading `/`, so VCS metadata directories match at any
/// depth, including those of nested checkouts.
pub const DEFAULT_EXCLUDES: &[&str] = &[".git/", ".hg/"];

/// What to walk and how.
#[derive(Debug, Clone, Default)]
pub struct WalkRequest {
    /// Files or directories to start from
    pub paths: Vec<PathBuf>,
    /// Project root to use instead of discovering one
    pub root: Option<PathBuf>,
    /// Extra gitignore-style patterns to exclude, anchored at the root
    pub excludes: Vec<String>,
    /// Include filter overriding the walker's default
    pub include: Option<IncludeFilter>,
}

impl WalkRequest {
    /// Create a request for the given start paths.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Add a start path.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Use `root` as the project root for start paths beneath it.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Add multiple exclude patterns.
    pub fn excludes<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Override the include filter for this request.
    pub fn include(mut self, filter: IncludeFilter) -> Self {
        self.include = Some(filter);
        self
    }
}

/// Deduplicated, insertion-ordered file paths.
///
/// Paths are compared by their resolved location, so `./a.py` and `a.py`
/// only appear once. The stored path keeps the spelling of the start path
/// it was found under.
#[derive(Debug, Clone, Default)]
pub struct PathSet {
    paths: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
}

impl PathSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `path`, keyed by its resolved location `key`.
    ///
    /// Returns false if the location was already present.
    pub fn insert_keyed(&mut self, key: PathBuf, path: PathBuf) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.paths.push(path);
        true
    }

    /// Insert `path`, using the path itself as the key.
    pub fn insert(&mut self, path: PathBuf) -> bool {
        self.insert_keyed(path.clone(), path)
    }

    /// Whether `path` is in the set, as a resolved location or as the
    /// stored spelling.
    ///
    /// Locations are a hash lookup. A spelling that differs from its
    /// location (e.g. a relative path) falls back to a linear scan.
    pub fn contains(&self, path: &Path) -> bool {
        self.seen.contains(path) || self.paths.iter().any(|p| p == path)
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, PathBuf> {
        self.paths.iter()
    }

    /// Number of paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The paths in insertion order.
    pub fn as_slice(&self) -> &[PathBuf] {
        &self.paths
    }

    /// A sorted copy of the paths.
    pub fn sorted(&self) -> Vec<PathBuf> {
        let mut paths = self.paths.clone();
        paths.sort();
        paths
    }

    /// Consume the set, keeping insertion order.
    pub fn into_vec(self) -> Vec<PathBuf> {
        self.paths
    }
}

impl PartialEq for PathSet {
    fn eq(&self, other: &Self) -> bool {
        self.paths == other.paths
    }
}

impl Eq for PathSet {}

impl IntoIterator for PathSet {
    type Item = PathBuf;
    type IntoIter = std::vec::IntoIter<PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.into_iter()
    }
}

impl<'a> IntoIterator for &'a PathSet {
    type Item = &'a PathBuf;
    type IntoIter = std::slice::Iter<'a, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.iter()
    }
}

impl FromIterator<PathBuf> for PathSet {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        let mut set = PathSet::new();
        for path in iter {
            set.insert(path);
        }
        set
    }
}

impl Extend<PathBuf> for PathSet {
    fn extend<I: IntoIterator<Item = PathBuf>>(&mut self, iter: I) {
        for path in iter {
            self.insert(path);
        }
    }
}

/// Why a path was left out of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExcludeReason {
    /// Matched a pattern from an ignore file
    Ignored,
    /// Matched a caller-supplied or built-in exclude pattern
    Excluded,
    /// Symbolic link, not followed
    Symlink,
}

impl fmt::Display for ExcludeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExcludeReason::Ignored => write!(f, "matched gitignore"),
            ExcludeReason::Excluded => write!(f, "matched exclude pattern"),
            ExcludeReason::Symlink => write!(f, "symlink not followed"),
        }
    }
}

/// A path the walk did not return, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Excluded {
    pub path: PathBuf,
    pub reason: ExcludeReason,
}

/// Everything a walk found, plus what it left out.
#[derive(Debug, Clone, Default)]
pub struct WalkReport {
    /// Files to process
    pub files: PathSet,
    /// Entries skipped by ignore rules, excludes or the symlink policy
    pub excluded: Vec<Excluded>,
    /// Distinct project roots the start paths resolved to, in order
    pub roots: Vec<PathBuf>,
}

/// A start path resolved against its project root.
#[derive(Debug)]
struct Start {
    /// The caller's spelling, minus any leading `./`
    base: PathBuf,
    abs: PathBuf,
    root: PathBuf,
}

impl Start {
    fn display(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.abs) {
            Ok(rel) if rel.as_os_str().is_empty() => self.base.clone(),
            Ok(rel) => self.base.join(rel),
            Err(_) => path.to_path_buf(),
        }
    }
}

/// Walks start paths using shared root and ignore-spec caches.
#[derive(Debug, Clone, Copy)]
pub struct Walker<'a> {
    roots: &'a RootResolver,
    specs: &'a SpecCache,
    include: &'a IncludeFilter,
}

impl<'a> Walker<'a> {
    /// Create a walker over the given caches, with a default include filter.
    pub fn new(roots: &'a RootResolver, specs: &'a SpecCache, include: &'a IncludeFilter) -> Self {
        Self {
            roots,
            specs,
            include,
        }
    }

    /// Walk every start path of `request`.
    pub fn walk(&self, request: &WalkRequest) -> Result<WalkReport> {
        let patterns: Vec<&str> = DEFAULT_EXCLUDES
            .iter()
            .copied()
            .chain(request.excludes.iter().map(String::as_str))
            .collect();
        // Surface bad patterns before touching the tree.
        IgnoreLayer::from_patterns(Path::new("."), &patterns)?;

        let include = request.include.as_ref().unwrap_or(self.include);
        let override_root = request
            .root
            .as_deref()
            .map(resolve_path)
            .transpose()?;

        let mut starts = Vec::with_capacity(request.paths.len());
        for path in &request.paths {
            if let Some(start) = self.resolve_start(path, override_root.as_deref())? {
                starts.push(start);
            }
        }

        let mut layers: HashMap<PathBuf, IgnoreLayer> = HashMap::new();
        for start in &starts {
            if !layers.contains_key(&start.root) {
                let layer = IgnoreLayer::from_patterns(&start.root, &patterns)?;
                layers.insert(start.root.clone(), layer);
            }
        }

        info!(starts = starts.len(), "walking");
        let mut report = WalkReport::default();
        for start in &starts {
            if !report.roots.contains(&start.root) {
                report.roots.push(start.root.clone());
            }
            let Some(excludes) = layers.get(&start.root) else {
                continue;
            };
            self.walk_start(start, excludes, include, &mut report)?;
        }

        debug!(
            files = report.files.len(),
            excluded = report.excluded.len(),
            "walk finished"
        );
        Ok(report)
    }

    fn resolve_start(&self, path: &Path, override_root: Option<&Path>) -> Result<Option<Start>> {
        let abs = match path.canonicalize() {
            Ok(abs) => abs,
            Err(err) if is_missing(&err) => {
                debug!(path = %path.display(), error = %err, "skipping missing start path");
                return Ok(None);
            }
            Err(source) => {
                return Err(TrailError::Resolve {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let root = match override_root {
            Some(root) if abs.starts_with(root) => root.to_path_buf(),
            _ => self.roots.resolve(&abs)?,
        };

        Ok(Some(Start {
            base: strip_cur_dir(path),
            abs,
            root,
        }))
    }

    fn walk_start(
        &self,
        start: &Start,
        excludes: &IgnoreLayer,
        include: &IncludeFilter,
        report: &mut WalkReport,
    ) -> Result<()> {
        // Explicit files always win.
        if start.abs.is_file() {
            report
                .files
                .insert_keyed(start.abs.clone(), start.base.clone());
            return Ok(());
        }

        if let Some(reason) = self.ancestry_excluded(start, excludes) {
            debug!(path = %start.base.display(), %reason, "start directory excluded");
            report.excluded.push(Excluded {
                path: start.base.clone(),
                reason,
            });
            return Ok(());
        }

        let files = &mut report.files;
        let excluded = &mut report.excluded;
        let walker = WalkDir::new(&start.abs)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }

                let reason = if entry.path_is_symlink() {
                    Some(ExcludeReason::Symlink)
                } else {
                    self.classify(&start.root, entry.path(), entry.file_type().is_dir(), excludes)
                };

                match reason {
                    Some(reason) => {
                        let path = start.display(entry.path());
                        debug!(path = %path.display(), %reason, "excluded");
                        excluded.push(Excluded { path, reason });
                        false
                    }
                    None => true,
                }
            });

        for entry in walker {
            let entry = entry.map_err(|err| walk_error(err, &start.abs))?;
            if entry.file_type().is_file() && include.matches(entry.path()) {
                files.insert_keyed(entry.path().to_path_buf(), start.display(entry.path()));
            }
        }

        Ok(())
    }

    /// Check the start directory and each of its ancestors below the root.
    fn ancestry_excluded(&self, start: &Start, excludes: &IgnoreLayer) -> Option<ExcludeReason> {
        if !start.abs.starts_with(&start.root) {
            return None;
        }

        let mut chain: Vec<&Path> = start
            .abs
            .ancestors()
            .take_while(|dir| *dir != start.root)
            .collect();
        chain.reverse();

        chain
            .into_iter()
            .find_map(|dir| self.classify(&start.root, dir, true, excludes))
    }

    /// Decide whether `path` is left out: excludes first, then the ignore
    /// spec of its parent directory.
    fn classify(
        &self,
        root: &Path,
        path: &Path,
        is_dir: bool,
        excludes: &IgnoreLayer,
    ) -> Option<ExcludeReason> {
        match excludes.verdict(path, is_dir) {
            Some(true) => return Some(ExcludeReason::Excluded),
            Some(false) => return None,
            None => {}
        }

        let parent = path.parent()?;
        if self.specs.spec_for(root, parent).is_ignored(path, is_dir) {
            Some(ExcludeReason::Ignored)
        } else {
            None
        }
    }
}

/// Missing start paths are skipped; any other failure to resolve one is not.
fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

fn walk_error(err: walkdir::Error, fallback: &Path) -> TrailError {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| fallback.to_path_buf());
    TrailError::Walk { path, source: err }
}

/// Drop leading `.` components so `./foo` reads as `foo`.
fn strip_cur_dir(path: &Path) -> PathBuf {
    path.components()
        .skip_while(|c| matches!(c, Component::CurDir))
        .collect()
}
