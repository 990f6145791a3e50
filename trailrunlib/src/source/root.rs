//! Project root discovery.
//!
//! A project root is the nearest directory, at or above a starting path,
//! that contains one of the [`ROOT_MARKERS`]. Lookups are memoized per
//! resolved start path, so repeated walks of the same tree only ascend once.

use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::debug;

use crate::error::TrailError;
use crate::Result;

/// File or directory names that mark the top of a project, checked in order.
pub const ROOT_MARKERS: &[&str] = &["pyproject.toml", ".git", ".hg"];

/// Finds and caches project roots.
#[derive(Debug)]
pub struct RootResolver {
    markers: Vec<String>,
    cache: DashMap<PathBuf, PathBuf>,
}

impl Default for RootResolver {
    fn default() -> Self {
        Self::with_markers(ROOT_MARKERS.iter().copied())
    }
}

impl RootResolver {
    /// Create a resolver using [`ROOT_MARKERS`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a resolver recognizing a custom, ordered set of marker names.
    pub fn with_markers<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(Into::into).collect(),
            cache: DashMap::new(),
        }
    }

    /// Marker names recognized by this resolver.
    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Find the project root for `start`.
    ///
    /// If `start` names a file, the search begins at its parent directory.
    /// When no ancestor holds a marker, the resolved starting directory is
    /// returned instead.
    pub fn resolve(&self, start: impl AsRef<Path>) -> Result<PathBuf> {
        let start = resolve_path(start.as_ref())?;

        if let Some(root) = self.cache.get(&start) {
            return Ok(root.clone());
        }

        let base = if start.is_dir() {
            start.clone()
        } else {
            start
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| start.clone())
        };

        let root = base
            .ancestors()
            .find(|dir| self.is_marked(dir))
            .unwrap_or(&base)
            .to_path_buf();

        debug!(start = %start.display(), root = %root.display(), "resolved project root");
        self.cache.insert(start, root.clone());
        Ok(root)
    }

    /// Check whether `dir` directly contains any marker.
    pub fn is_marked(&self, dir: &Path) -> bool {
        self.markers.iter().any(|marker| dir.join(marker).exists())
    }

    /// Forget every memoized root.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of memoized lookups.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether nothing has been memoized yet.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Resolve `path` to an absolute path.
///
/// Existing paths are canonicalized (symlinks and `..` resolved). Paths that
/// do not exist are made absolute against the current directory.
pub(crate) fn resolve_path(path: &Path) -> Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(resolved) => Ok(resolved),
        Err(_) => std::path::absolute(path).map_err(|source| TrailError::Resolve {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MARKER: &str = "trailrun-test.toml";

    fn resolver() -> RootResolver {
        RootResolver::with_markers([MARKER])
    }

    #[test]
    fn test_no_marker_falls_back_to_start() {
        let temp = tempdir().unwrap();
        let td = temp.path().canonicalize().unwrap();
        fs::create_dir_all(td.join("a/b")).unwrap();

        let root = resolver().resolve(td.join("a/b")).unwrap();
        assert_eq!(root, td.join("a/b"));
    }

    #[test]
    fn test_file_starts_at_parent() {
        let temp = tempdir().unwrap();
        let td = temp.path().canonicalize().unwrap();
        fs::create_dir_all(td.join("pkg")).unwrap();
        fs::write(td.join("pkg/mod.py"), "").unwrap();

        let root = resolver().resolve(td.join("pkg/mod.py")).unwrap();
        assert_eq!(root, td.join("pkg"));
    }

    #[test]
    fn test_nearest_marker_wins() {
        let temp = tempdir().unwrap();
        let td = temp.path().canonicalize().unwrap();
        fs::write(td.join(MARKER), "").unwrap();
        fs::create_dir_all(td.join("inner/sub/fuzz")).unwrap();
        fs::write(td.join("inner/sub").join(MARKER), "").unwrap();

        let resolver = resolver();
        assert_eq!(resolver.resolve(&td).unwrap(), td);
        assert_eq!(resolver.resolve(td.join("inner")).unwrap(), td);
        assert_eq!(
            resolver.resolve(td.join("inner/sub/fuzz")).unwrap(),
            td.join("inner/sub")
        );
    }

    #[test]
    fn test_directory_marker() {
        let temp = tempdir().unwrap();
        let td = temp.path().canonicalize().unwrap();
        fs::create_dir_all(td.join(".vcs")).unwrap();
        fs::create_dir_all(td.join("src")).unwrap();

        let resolver = RootResolver::with_markers([".vcs"]);
        assert_eq!(resolver.resolve(td.join("src")).unwrap(), td);
    }

    #[test]
    fn test_results_are_memoized() {
        let temp = tempdir().unwrap();
        let td = temp.path().canonicalize().unwrap();
        fs::write(td.join(MARKER), "").unwrap();
        fs::create_dir_all(td.join("src")).unwrap();

        let resolver = resolver();
        assert!(resolver.is_empty());
        resolver.resolve(td.join("src")).unwrap();
        resolver.resolve(td.join("src")).unwrap();
        assert_eq!(resolver.len(), 1);

        // A cached answer survives the marker disappearing until cleared.
        fs::remove_file(td.join(MARKER)).unwrap();
        assert_eq!(resolver.resolve(td.join("src")).unwrap(), td);

        resolver.clear();
        assert_eq!(resolver.resolve(td.join("src")).unwrap(), td.join("src"));
    }

    #[test]
    fn test_default_markers() {
        let resolver = RootResolver::new();
        assert_eq!(resolver.markers(), &["pyproject.toml", ".git", ".hg"]);
    }
}
