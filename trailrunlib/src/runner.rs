//! The coordinator tying discovery and execution together.
//!
//! A [`Trailrunner`] owns the root and ignore-spec caches, so a long-lived
//! instance makes repeated walks of the same tree cheap. The free functions
//! at the bottom of this module each use a fresh default instance.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::exec::{
    default_pool, Engine, ExecutionContext, Outcome, PoolConfig, PoolFactory, RunIter,
};
use crate::source::root::resolve_path;
use crate::source::{
    IgnoreSpec, IncludeFilter, PathSet, RootResolver, SpecCache, WalkReport, WalkRequest, Walker,
    DEFAULT_SPEC_CACHE_CAPACITY,
};
use crate::Result;

/// Options for a [`Trailrunner`].
#[derive(Clone)]
pub struct RunnerOptions {
    /// Filter applied to walked files (explicit files bypass it)
    pub include: IncludeFilter,
    /// Pool override (None = the process-wide default at call time)
    pub pool: Option<PoolConfig>,
    /// Custom pool construction (None = the built-in pools)
    pub pool_factory: Option<PoolFactory>,
    /// Maximum number of memoized ignore specs (0 = unbounded)
    pub spec_cache_capacity: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            include: IncludeFilter::default(),
            pool: None,
            pool_factory: None,
            spec_cache_capacity: DEFAULT_SPEC_CACHE_CAPACITY,
        }
    }
}

impl fmt::Debug for RunnerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerOptions")
            .field("include", &self.include)
            .field("pool", &self.pool)
            .field("custom_pool", &self.pool_factory.is_some())
            .field("spec_cache_capacity", &self.spec_cache_capacity)
            .finish()
    }
}

impl RunnerOptions {
    /// Create new default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the include filter.
    pub fn include(mut self, filter: IncludeFilter) -> Self {
        self.include = filter;
        self
    }

    /// Pin the pool configuration instead of following the global default.
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = Some(config);
        self
    }

    /// Build run pools with `factory`, e.g. to plug in a custom [`WorkerPool`].
    ///
    /// [`WorkerPool`]: crate::exec::WorkerPool
    pub fn pool_factory(mut self, factory: PoolFactory) -> Self {
        self.pool_factory = Some(factory);
        self
    }

    /// Bound the ignore-spec cache.
    pub fn spec_cache_capacity(mut self, capacity: usize) -> Self {
        self.spec_cache_capacity = capacity;
        self
    }
}

/// Walks projects and runs functions over the files found.
pub struct Trailrunner {
    roots: RootResolver,
    specs: SpecCache,
    options: RunnerOptions,
}

impl Default for Trailrunner {
    fn default() -> Self {
        Self::with_options(RunnerOptions::default())
    }
}

impl fmt::Debug for Trailrunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trailrunner")
            .field("cached_roots", &self.roots.len())
            .field("cached_specs", &self.specs.len())
            .field("options", &self.options)
            .finish()
    }
}

impl Trailrunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: RunnerOptions) -> Self {
        Self {
            roots: RootResolver::new(),
            specs: SpecCache::with_capacity(options.spec_cache_capacity),
            options,
        }
    }

    /// Use a custom root resolver, e.g. one with different markers.
    pub fn with_resolver(mut self, roots: RootResolver) -> Self {
        self.roots = roots;
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn resolver(&self) -> &RootResolver {
        &self.roots
    }

    pub fn spec_cache(&self) -> &SpecCache {
        &self.specs
    }

    /// The engine a run started now would use.
    pub fn engine(&self) -> Engine {
        let engine = Engine::new(self.options.pool.unwrap_or_else(default_pool));
        match &self.options.pool_factory {
            Some(factory) => engine.with_pool_factory(Arc::clone(factory)),
            None => engine,
        }
    }

    /// The project root for `path`.
    pub fn project_root(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.roots.resolve(path)
    }

    /// The effective ignore spec for `dir` within the project at `root`.
    pub fn ignore_spec(
        &self,
        root: impl AsRef<Path>,
        dir: impl AsRef<Path>,
    ) -> Result<Arc<IgnoreSpec>> {
        let root = resolve_path(root.as_ref())?;
        let dir = resolve_path(dir.as_ref())?;
        Ok(self.specs.spec_for(&root, &dir))
    }

    fn walker(&self) -> Walker<'_> {
        Walker::new(&self.roots, &self.specs, &self.options.include)
    }

    /// Discover files, keeping a record of what was left out.
    pub fn walk_report(&self, request: &WalkRequest) -> Result<WalkReport> {
        self.walker().walk(request)
    }

    /// Discover files.
    pub fn walk(&self, request: &WalkRequest) -> Result<PathSet> {
        Ok(self.walk_report(request)?.files)
    }

    /// Run `func` over `paths` and wait for every result.
    pub fn run<I, P, F, T, E>(&self, paths: I, func: F) -> Result<HashMap<PathBuf, Outcome<T>>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
        F: Fn(&Path) -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: fmt::Display + 'static,
    {
        let engine = self.engine();
        let paths: PathSet = paths.into_iter().map(Into::into).collect();
        info!(
            files = paths.len(),
            strategy = %engine.config().strategy,
            "starting run"
        );

        let results = engine.run(paths, func)?;
        let failed = results.values().filter(|o| o.is_failure()).count();
        info!(
            succeeded = results.len() - failed,
            failed,
            "run finished"
        );
        Ok(results)
    }

    /// Run `func` over `paths`, yielding results as they complete.
    pub fn run_iter<I, P, F, T, E>(&self, paths: I, func: F) -> Result<RunIter<T>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
        F: Fn(&Path) -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: fmt::Display + 'static,
    {
        let engine = self.engine();
        let iter = engine.run_iter(paths, func)?;
        info!(
            files = iter.remaining(),
            strategy = %engine.config().strategy,
            "streaming run"
        );
        Ok(iter)
    }

    /// Walk `request`, then run `func` over every file found.
    ///
    /// When all start paths belong to one project and the caller's context
    /// names no root, that project root is made current for the run.
    pub fn walk_and_run<F, T, E>(
        &self,
        request: &WalkRequest,
        func: F,
    ) -> Result<HashMap<PathBuf, Outcome<T>>>
    where
        F: Fn(&Path) -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: fmt::Display + 'static,
    {
        let report = self.walk_report(request)?;
        let current = ExecutionContext::current();
        let _guard = match report.roots.as_slice() {
            [root] if current.root.is_none() => Some(current.with_root(root.clone()).enter()),
            _ => None,
        };
        self.run(report.files, func)
    }

    /// Forget every cached root and ignore spec.
    pub fn clear_caches(&self) {
        self.roots.clear();
        self.specs.clear();
    }
}

/// The project root for `path`.
pub fn project_root(path: impl AsRef<Path>) -> Result<PathBuf> {
    Trailrunner::default().project_root(path)
}

/// Discover files under the request's start paths.
pub fn walk(request: &WalkRequest) -> Result<PathSet> {
    Trailrunner::default().walk(request)
}

/// Run `func` over `paths` on the default pool.
pub fn run<I, P, F, T, E>(paths: I, func: F) -> Result<HashMap<PathBuf, Outcome<T>>>
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
    F: Fn(&Path) -> std::result::Result<T, E> + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + 'static,
{
    Trailrunner::default().run(paths, func)
}

/// Run `func` over `paths` on the default pool, streaming results.
pub fn run_iter<I, P, F, T, E>(paths: I, func: F) -> Result<RunIter<T>>
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
    F: Fn(&Path) -> std::result::Result<T, E> + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + 'static,
{
    Trailrunner::default().run_iter(paths, func)
}

/// Walk, then run `func` over every file found.
pub fn walk_and_run<F, T, E>(request: &WalkRequest, func: F) -> Result<HashMap<PathBuf, Outcome<T>>>
where
    F: Fn(&Path) -> std::result::Result<T, E> + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + 'static,
{
    Trailrunner::default().walk_and_run(request, func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Strategy;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn project() -> (TempDir, PathBuf) {
        let temp = tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::write(root.join("pyproject.toml"), "").unwrap();
        (temp, root)
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn runner() -> Trailrunner {
        Trailrunner::with_options(RunnerOptions::new().pool(PoolConfig::in_process().concurrency(2)))
    }

    #[test]
    fn test_options_builder() {
        let options = RunnerOptions::new()
            .include(IncludeFilter::all())
            .pool(PoolConfig::isolated().concurrency(3))
            .spec_cache_capacity(16);

        assert!(options.include.extensions.is_empty());
        assert_eq!(options.pool, Some(PoolConfig::isolated().concurrency(3)));

        let runner = Trailrunner::with_options(options);
        assert_eq!(runner.spec_cache().capacity(), 16);
        assert_eq!(runner.engine().config().strategy, Strategy::Isolated);
        assert_eq!(runner.engine().config().concurrency, 3);
    }

    #[test]
    fn test_pool_factory_reaches_runs() {
        use crate::exec::{InProcessPool, WorkerPool};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (_temp, root) = project();
        write(&root, "a.py", "");
        write(&root, "pkg/b.py", "");

        let sizes = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&sizes);
        let factory: PoolFactory = Arc::new(
            move |_: &PoolConfig, units: usize| -> Result<Box<dyn WorkerPool>> {
                recorded.fetch_add(units, Ordering::SeqCst);
                Ok(Box::new(InProcessPool::new(1)?))
            },
        );
        let runner = Trailrunner::with_options(RunnerOptions::new().pool_factory(factory));
        assert!(format!("{:?}", runner.options()).contains("custom_pool: true"));

        let results = runner
            .walk_and_run(&WalkRequest::new([&root]), |_| Ok::<_, String>(()))
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(sizes.load(Ordering::SeqCst), 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_walk_and_run_non_utf8_root_in_isolation() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = tempdir().unwrap();
        let root = temp
            .path()
            .canonicalize()
            .unwrap()
            .join(OsStr::from_bytes(b"proj\xff"));
        fs::create_dir(&root).unwrap();
        fs::write(root.join("pyproject.toml"), "").unwrap();
        write(&root, "a.py", "");

        let runner = Trailrunner::with_options(RunnerOptions::new().pool(PoolConfig::isolated()));
        let results = runner
            .walk_and_run(&WalkRequest::new([&root]), |_| {
                Ok::<_, String>(ExecutionContext::current().root)
            })
            .unwrap();

        assert_eq!(results[&root.join("a.py")], Outcome::Success(Some(root.clone())));
    }

    #[test]
    fn test_project_root_and_ignore_spec() {
        let (_temp, root) = project();
        write(&root, ".gitignore", "build/\n*.log\n");
        write(&root, "pkg/.gitignore", "!keep.log\n");
        write(&root, "pkg/mod.py", "");

        let runner = runner();
        assert_eq!(runner.project_root(root.join("pkg/mod.py")).unwrap(), root);

        let spec = runner.ignore_spec(&root, root.join("pkg")).unwrap();
        assert_eq!(spec.len(), 3);
        assert_eq!(spec.layers().len(), 2);
        assert!(spec.is_ignored(&root.join("pkg/debug.log"), false));
        assert!(!spec.is_ignored(&root.join("pkg/keep.log"), false));
    }

    #[test]
    fn test_walk_and_run_end_to_end() {
        let (_temp, root) = project();
        write(&root, ".gitignore", "vendor/\n");
        write(&root, "a.py", "print('a')\n");
        write(&root, "b.py", "");
        write(&root, "vendor/c.py", "");

        let results = runner()
            .walk_and_run(&WalkRequest::new([&root]), |p| {
                fs::read_to_string(p).map(|s| s.len())
            })
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[&root.join("a.py")], Outcome::Success(11));
        assert_eq!(results[&root.join("b.py")], Outcome::Success(0));
    }

    #[test]
    fn test_walk_and_run_sets_project_root() {
        let (_temp, root) = project();
        write(&root, "pkg/a.py", "");

        let results = runner()
            .walk_and_run(&WalkRequest::new([root.join("pkg")]), |_| {
                Ok::<_, String>(ExecutionContext::current().root)
            })
            .unwrap();

        assert_eq!(
            results[&root.join("pkg/a.py")],
            Outcome::Success(Some(root.clone()))
        );
        // Only the run saw it.
        assert_eq!(ExecutionContext::current().root, None);
    }

    #[test]
    fn test_walk_and_run_keeps_caller_root() {
        let (_temp, root) = project();
        write(&root, "a.py", "");

        let _guard = ExecutionContext::new().with_root("/elsewhere").enter();
        let results = runner()
            .walk_and_run(&WalkRequest::new([&root]), |_| {
                Ok::<_, String>(ExecutionContext::current().root)
            })
            .unwrap();

        assert_eq!(
            results[&root.join("a.py")],
            Outcome::Success(Some(PathBuf::from("/elsewhere")))
        );
    }

    #[test]
    fn test_walk_and_run_across_projects_sets_no_root() {
        let (_temp_a, root_a) = project();
        let (_temp_b, root_b) = project();
        write(&root_a, "a.py", "");
        write(&root_b, "b.py", "");

        let results = runner()
            .walk_and_run(&WalkRequest::new([&root_a, &root_b]), |_| {
                Ok::<_, String>(ExecutionContext::current().root)
            })
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.values().all(|o| o == &Outcome::Success(None)));
    }

    #[test]
    fn test_run_iter_streams_every_path() {
        let mut seen: Vec<PathBuf> = runner()
            .run_iter(["x.py", "y.py", "x.py"], |_| Ok::<_, String>(()))
            .unwrap()
            .map(|(path, _)| path)
            .collect();
        seen.sort();

        assert_eq!(seen, vec![PathBuf::from("x.py"), PathBuf::from("y.py")]);
    }

    #[test]
    fn test_clear_caches() {
        let (_temp, root) = project();
        write(&root, "pkg/a.py", "");

        let runner = runner();
        runner.walk(&WalkRequest::new([&root])).unwrap();
        assert!(!runner.resolver().is_empty());
        assert!(!runner.spec_cache().is_empty());

        runner.clear_caches();
        assert!(runner.resolver().is_empty());
        assert!(runner.spec_cache().is_empty());
    }

    #[test]
    fn test_free_functions() {
        let (_temp, root) = project();
        write(&root, "a.py", "");
        write(&root, "notes.txt", "");

        assert_eq!(project_root(root.join("a.py")).unwrap(), root);

        let files = walk(&WalkRequest::new([&root])).unwrap();
        assert_eq!(files.into_vec(), vec![root.join("a.py")]);

        let results = run([root.join("notes.txt")], |p| fs::metadata(p).map(|m| m.len())).unwrap();
        assert_eq!(results[&root.join("notes.txt")], Outcome::Success(0));
    }
}
