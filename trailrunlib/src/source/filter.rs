//! Include filtering for walked files.
//!
//! Files found while descending a directory are only returned when they pass
//! the [`IncludeFilter`]. Files named explicitly by the caller bypass it.

use std::path::Path;

use glob::Pattern;

use crate::error::TrailError;
use crate::Result;

/// File extensions returned by a walk when no other filter is configured.
pub const DEFAULT_INCLUDE_EXTENSIONS: &[&str] = &["py", "pyi"];

/// Which discovered files a walk returns.
#[derive(Debug, Clone)]
pub struct IncludeFilter {
    /// Accepted file extensions, without the dot (if empty, any extension)
    pub extensions: Vec<String>,
    /// Glob patterns a file must match at least one of (if empty, no constraint)
    pub patterns: Vec<Pattern>,
}

impl Default for IncludeFilter {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_INCLUDE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            patterns: Vec::new(),
        }
    }
}

impl IncludeFilter {
    /// Create the default filter (matches [`DEFAULT_INCLUDE_EXTENSIONS`]).
    pub fn new() -> Self {
        Self::default()
    }

    /// A filter that accepts every file.
    pub fn all() -> Self {
        Self {
            extensions: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Replace the accepted extensions.
    pub fn extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_string())
            .collect();
        self
    }

    /// Add an include pattern.
    pub fn include(mut self, pattern: &str) -> Result<Self> {
        let pat = Pattern::new(pattern).map_err(|e| TrailError::InvalidGlob {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        self.patterns.push(pat);
        Ok(self)
    }

    /// Add multiple include patterns.
    pub fn include_many(mut self, patterns: &[&str]) -> Result<Self> {
        for pattern in patterns {
            self = self.include(pattern)?;
        }
        Ok(self)
    }

    /// Check if a file passes the filter.
    ///
    /// A path matches if:
    /// 1. Its extension is accepted (or no extensions are configured)
    /// 2. It matches at least one include pattern (or no patterns are configured)
    pub fn matches(&self, path: &Path) -> bool {
        if !self.extensions.is_empty() {
            let accepted = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| self.extensions.iter().any(|e| e == ext));
            if !accepted {
                return false;
            }
        }

        if self.patterns.is_empty() {
            return true;
        }

        let path_str = path.to_string_lossy();
        self.patterns.iter().any(|pattern| pattern.matches(&path_str))
    }
}
