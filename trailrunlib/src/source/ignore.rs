//! Layered `.gitignore` matching.
//!
//! Every directory between a project root and the directory being walked may
//! carry its own ignore file. Each file becomes an [`IgnoreLayer`] anchored at
//! its own directory, and an [`IgnoreSpec`] stacks the layers root-first.
//! Matching asks the deepest layer first; the first layer that has an opinion
//! about a path decides, which is the precedence git itself uses.
//!
//! Specs are memoized in a [`SpecCache`] keyed by `(root, directory)`. A
//! directory's spec extends its parent's cached spec, so every ignore file is
//! read at most once per cache lifetime.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use tracing::{debug, warn};

use crate::error::TrailError;
use crate::Result;

/// Name of the per-directory ignore-rule file.
pub const IGNORE_FILE_NAME: &str = ".gitignore";

/// Default bound on the number of memoized specs.
pub const DEFAULT_SPEC_CACHE_CAPACITY: usize = 4096;

/// The compiled patterns of a single ignore file.
#[derive(Debug)]
pub struct IgnoreLayer {
    dir: PathBuf,
    source: Option<PathBuf>,
    lines: Vec<String>,
    matcher: Gitignore,
}

impl IgnoreLayer {
    /// Load the ignore file of `dir`, if there is one.
    ///
    /// A missing or unreadable file yields `None`. Lines that fail to compile
    /// are skipped with a warning; the rest of the file still applies.
    pub fn load(dir: &Path) -> Option<Self> {
        let source = dir.join(IGNORE_FILE_NAME);
        if !source.exists() {
            return None;
        }

        let bytes = match fs::read(&source) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %source.display(), error = %err, "ignoring unreadable ignore file");
                return None;
            }
        };
        // Non-UTF-8 bytes only spoil the lines that contain them.
        let content = String::from_utf8_lossy(&bytes);

        let mut builder = GitignoreBuilder::new(dir);
        let mut lines = Vec::new();
        for line in content.lines() {
            if let Err(err) = builder.add_line(Some(source.clone()), line) {
                warn!(path = %source.display(), line, error = %err, "skipping invalid ignore pattern");
                continue;
            }
            if is_pattern_line(line) {
                lines.push(line.to_string());
            }
        }

        let matcher = builder.build().unwrap_or_else(|err| {
            warn!(path = %source.display(), error = %err, "ignore file failed to compile");
            Gitignore::empty()
        });

        debug!(path = %source.display(), patterns = lines.len(), "loaded ignore file");
        Some(Self {
            dir: dir.to_path_buf(),
            source: Some(source),
            lines,
            matcher,
        })
    }

    /// Compile caller-supplied patterns anchored at `dir`.
    ///
    /// Unlike [`IgnoreLayer::load`], an invalid pattern is an error.
    pub fn from_patterns<S: AsRef<str>>(dir: &Path, patterns: &[S]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(dir);
        let mut lines = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            builder
                .add_line(None, pattern)
                .map_err(|err| TrailError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: err.to_string(),
                })?;
            if is_pattern_line(pattern) {
                lines.push(pattern.to_string());
            }
        }

        let matcher = builder.build().map_err(|err| TrailError::InvalidPattern {
            pattern: lines.join(", "),
            message: err.to_string(),
        })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            source: None,
            lines,
            matcher,
        })
    }

    /// Directory the patterns are anchored at.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The ignore file these patterns came from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Pattern lines in declaration order, without comments or blanks.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// `Some(true)` if this layer ignores `path`, `Some(false)` if a negated
    /// pattern re-includes it, `None` if no pattern matches.
    pub fn verdict(&self, path: &Path, is_dir: bool) -> Option<bool> {
        match self.matcher.matched(path, is_dir) {
            Match::None => None,
            Match::Ignore(_) => Some(true),
            Match::Whitelist(_) => Some(false),
        }
    }
}

fn is_pattern_line(line: &str) -> bool {
    !line.trim().is_empty() && !line.starts_with('#')
}

/// The effective ignore rules for one directory.
#[derive(Debug, Clone)]
pub struct IgnoreSpec {
    root: PathBuf,
    layers: Vec<Arc<IgnoreLayer>>,
}

impl IgnoreSpec {
    /// An empty spec owned by `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            layers: Vec::new(),
        }
    }

    /// A copy of this spec with one more, deeper layer.
    pub fn extended(&self, layer: Option<IgnoreLayer>) -> Self {
        let mut spec = self.clone();
        if let Some(layer) = layer {
            spec.layers.push(Arc::new(layer));
        }
        spec
    }

    /// Directory this spec was composed from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Layers, root-most first.
    pub fn layers(&self) -> &[Arc<IgnoreLayer>] {
        &self.layers
    }

    /// Every `(source file, pattern line)` pair, root-most first.
    pub fn patterns(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.layers.iter().flat_map(|layer| {
            let source = layer.source().unwrap_or(layer.dir());
            layer.lines().iter().map(move |line| (source, line.as_str()))
        })
    }

    /// Total number of pattern lines across all layers.
    pub fn len(&self) -> usize {
        self.layers.iter().map(|layer| layer.lines().len()).sum()
    }

    /// Whether no layer contributes a pattern.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask the layers deepest first; the first one with a verdict wins.
    pub fn verdict(&self, path: &Path, is_dir: bool) -> Option<bool> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.verdict(path, is_dir))
    }

    /// Whether `path` is ignored by this spec.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.verdict(path, is_dir).unwrap_or(false)
    }
}

/// Memoized [`IgnoreSpec`]s keyed by `(root, directory)`.
///
/// The cache is bounded; once it holds `capacity` specs an arbitrary entry
/// is evicted before each insert. A capacity of zero disables the bound.
#[derive(Debug)]
pub struct SpecCache {
    specs: DashMap<(PathBuf, PathBuf), Arc<IgnoreSpec>>,
    capacity: usize,
}

impl Default for SpecCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SPEC_CACHE_CAPACITY)
    }
}

impl SpecCache {
    /// Create a cache with [`DEFAULT_SPEC_CACHE_CAPACITY`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache holding at most `capacity` specs.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            specs: DashMap::new(),
            capacity,
        }
    }

    /// The effective spec for `dir`, composed from `root` downwards.
    ///
    /// Both paths are expected to be resolved and absolute. When `dir` is not
    /// `root` or one of its descendants, only `dir`'s own ignore file applies.
    pub fn spec_for(&self, root: &Path, dir: &Path) -> Arc<IgnoreSpec> {
        let key = (root.to_path_buf(), dir.to_path_buf());
        if let Some(spec) = self.specs.get(&key) {
            return Arc::clone(spec.value());
        }

        let spec = match dir.parent() {
            Some(parent) if dir != root && dir.starts_with(root) => {
                self.spec_for(root, parent).extended(IgnoreLayer::load(dir))
            }
            _ => IgnoreSpec::new(dir).extended(IgnoreLayer::load(dir)),
        };

        debug!(dir = %dir.display(), layers = spec.layers().len(), "composed ignore spec");
        let spec = Arc::new(spec);
        self.insert(key, Arc::clone(&spec));
        spec
    }

    fn insert(&self, key: (PathBuf, PathBuf), spec: Arc<IgnoreSpec>) {
        if self.capacity > 0 && self.specs.len() >= self.capacity {
            let victim = self.specs.iter().next().map(|entry| entry.key().clone());
            if let Some(victim) = victim {
                self.specs.remove(&victim);
            }
        }
        self.specs.insert(key, spec);
    }

    /// Whether a spec for `(root, dir)` is currently memoized.
    pub fn contains(&self, root: &Path, dir: &Path) -> bool {
        self.specs
            .contains_key(&(root.to_path_buf(), dir.to_path_buf()))
    }

    /// Drop every memoized spec.
    pub fn clear(&self) {
        self.specs.clear();
    }

    /// Number of memoized specs.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Maximum number of specs kept, zero meaning unbounded.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
