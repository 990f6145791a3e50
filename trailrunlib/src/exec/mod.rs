//! Parallel execution of a function over a set of paths.
//!
//! The [`Engine`] schedules one unit of work per distinct path on a
//! [`WorkerPool`]. Each unit runs the caller's function inside the caller's
//! [`ExecutionContext`] and reports an [`Outcome`]; errors and panics are
//! captured per path and never abort the run.
//!
//! ```rust,ignore
//! use trailrunlib::exec::{Engine, PoolConfig};
//!
//! let engine = Engine::new(PoolConfig::in_process().concurrency(4));
//! for (path, outcome) in engine.run_iter(paths, |p| std::fs::metadata(p).map(|m| m.len()))? {
//!     println!("{}: {:?}", path.display(), outcome);
//! }
//! ```

pub mod context;
pub mod outcome;
pub mod pool;

pub use context::{ContextGuard, ExecutionContext};
pub use outcome::{Failure, FailureKind, Outcome};
pub use pool::{
    default_pool, set_default_pool, InProcessPool, IsolatedPool, Job, PoolConfig, PoolFactory,
    Strategy, WorkerPool,
};

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::source::PathSet;
use crate::Result;

/// How the caller's context reaches a worker.
#[derive(Clone)]
enum Snapshot {
    Encoded(Arc<str>),
    Shared(Arc<ExecutionContext>),
}

impl Snapshot {
    fn capture(strategy: Strategy) -> Result<Self> {
        let context = ExecutionContext::current();
        Ok(match strategy {
            Strategy::Isolated => Snapshot::Encoded(context.encode()?.into()),
            Strategy::InProcess => Snapshot::Shared(Arc::new(context)),
        })
    }

    fn restore(&self) -> std::result::Result<ExecutionContext, Failure> {
        match self {
            Snapshot::Encoded(payload) => ExecutionContext::decode(payload)
                .map_err(|e| Failure::new(FailureKind::Context, e.to_string())),
            Snapshot::Shared(context) => Ok(ExecutionContext::clone(context)),
        }
    }
}

/// Runs a function over paths on a worker pool.
#[derive(Clone)]
pub struct Engine {
    config: PoolConfig,
    factory: Option<PoolFactory>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("custom_pool", &self.factory.is_some())
            .finish()
    }
}

impl Default for Engine {
    /// An engine using the process-wide default pool.
    fn default() -> Self {
        Self::new(default_pool())
    }
}

impl Engine {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            factory: None,
        }
    }

    /// Build each run's pool with `factory` instead of the built-in pools.
    pub fn with_pool_factory(mut self, factory: PoolFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    fn build_pool(&self, units: usize) -> Result<Box<dyn WorkerPool>> {
        match &self.factory {
            Some(factory) => factory(&self.config, units),
            None => self.config.build(units),
        }
    }

    /// Run `func` once per distinct path and wait for all of them.
    pub fn run<I, P, F, T, E>(&self, paths: I, func: F) -> Result<HashMap<PathBuf, Outcome<T>>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
        F: Fn(&Path) -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: fmt::Display + 'static,
    {
        Ok(self.run_iter(paths, func)?.collect())
    }

    /// Run `func` once per distinct path, yielding results as units finish.
    ///
    /// Dropping the returned iterator early stops units that have not
    /// started yet; units already running finish in the background.
    pub fn run_iter<I, P, F, T, E>(&self, paths: I, func: F) -> Result<RunIter<T>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
        F: Fn(&Path) -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: fmt::Display + 'static,
    {
        let paths: PathSet = paths.into_iter().map(Into::into).collect();
        if paths.is_empty() {
            return Ok(RunIter::empty());
        }

        let snapshot = Snapshot::capture(self.config.strategy)?;
        let pool = self.build_pool(paths.len())?;
        debug!(
            units = paths.len(),
            workers = pool.workers(),
            strategy = %self.config.strategy,
            "scheduling run"
        );

        let (sender, receiver) = unbounded();
        let cancel = Arc::new(AtomicBool::new(false));
        let func = Arc::new(func);
        let total = paths.len();
        for path in paths {
            pool.execute(unit_job(
                path,
                snapshot.clone(),
                Arc::clone(&func),
                sender.clone(),
                Arc::clone(&cancel),
            ));
        }

        Ok(RunIter {
            receiver: Some(receiver),
            pool: Some(pool),
            cancel,
            remaining: total,
        })
    }
}

fn unit_job<F, T, E>(
    path: PathBuf,
    snapshot: Snapshot,
    func: Arc<F>,
    results: Sender<(PathBuf, Outcome<T>)>,
    cancel: Arc<AtomicBool>,
) -> Job
where
    F: Fn(&Path) -> std::result::Result<T, E> + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + 'static,
{
    Box::new(move || {
        if cancel.load(Ordering::Acquire) {
            return;
        }
        let outcome = run_unit(&path, &snapshot, func.as_ref());
        // The consumer may have gone away; nothing left to report to.
        let _ = results.send((path, outcome));
    })
}

fn run_unit<F, T, E>(path: &Path, snapshot: &Snapshot, func: &F) -> Outcome<T>
where
    F: Fn(&Path) -> std::result::Result<T, E>,
    E: fmt::Display,
{
    let context = match snapshot.restore() {
        Ok(context) => context,
        Err(failure) => return Outcome::Failure(failure),
    };
    let _guard = context.enter();

    match panic::catch_unwind(AssertUnwindSafe(|| func(path))) {
        Ok(Ok(value)) => Outcome::Success(value),
        Ok(Err(err)) => Outcome::Failure(Failure::new(FailureKind::Error, err.to_string())),
        Err(payload) => Outcome::Failure(Failure::from_panic(payload.as_ref())),
    }
}

/// Results of a run, in completion order.
///
/// Ends once every scheduled unit has reported.
pub struct RunIter<T> {
    receiver: Option<Receiver<(PathBuf, Outcome<T>)>>,
    pool: Option<Box<dyn WorkerPool>>,
    cancel: Arc<AtomicBool>,
    remaining: usize,
}

impl<T> RunIter<T> {
    fn empty() -> Self {
        Self {
            receiver: None,
            pool: None,
            cancel: Arc::new(AtomicBool::new(false)),
            remaining: 0,
        }
    }

    /// Units that have not reported yet.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn finish(&mut self) {
        self.receiver = None;
        self.pool = None;
    }
}

impl<T> Iterator for RunIter<T> {
    type Item = (PathBuf, Outcome<T>);

    fn next(&mut self) -> Option<Self::Item> {
        let received = self.receiver.as_ref()?.recv();
        match received {
            Ok(item) => {
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining == 0 {
                    self.finish();
                }
                Some(item)
            }
            Err(_) => {
                self.finish();
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl<T> Drop for RunIter<T> {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }
}

impl<T> fmt::Debug for RunIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunIter")
            .field("remaining", &self.remaining)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrailError;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn strategies() -> [PoolConfig; 2] {
        [
            PoolConfig::isolated().concurrency(2),
            PoolConfig::in_process().concurrency(2),
        ]
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_empty_run_never_calls() {
        for config in strategies() {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let results = Engine::new(config)
                .run(Vec::<PathBuf>::new(), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
                .unwrap();

            assert!(results.is_empty());
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_run_collects_every_path() {
        for config in strategies() {
            let results = Engine::new(config)
                .run(paths(&["a.py", "b.py", "c.py"]), |p| {
                    Ok::<_, String>(p.to_string_lossy().len())
                })
                .unwrap();

            assert_eq!(results.len(), 3);
            assert_eq!(results[Path::new("a.py")], Outcome::Success(4));
        }
    }

    #[test]
    fn test_failure_is_isolated_to_its_path() {
        for config in strategies() {
            let results = Engine::new(config)
                .run(paths(&["p1", "p2", "p3"]), |p| {
                    if p == Path::new("p2") {
                        Err(format!("cannot process {}", p.display()))
                    } else {
                        Ok(1)
                    }
                })
                .unwrap();

            assert_eq!(results.len(), 3);
            assert_eq!(results[Path::new("p1")], Outcome::Success(1));
            assert_eq!(results[Path::new("p3")], Outcome::Success(1));
            let failure = results[Path::new("p2")].failure().unwrap();
            assert_eq!(failure.kind, FailureKind::Error);
            assert_eq!(failure.message, "cannot process p2");
        }
    }

    #[test]
    fn test_panic_is_captured() {
        for config in strategies() {
            let results = Engine::new(config)
                .run(paths(&["fine", "boom"]), |p| {
                    if p == Path::new("boom") {
                        panic!("exploded on {}", p.display());
                    }
                    Ok::<_, String>(())
                })
                .unwrap();

            assert!(results[Path::new("fine")].is_success());
            let failure = results[Path::new("boom")].failure().unwrap();
            assert_eq!(failure.kind, FailureKind::Panic);
            assert_eq!(failure.message, "exploded on boom");
        }
    }

    #[test]
    fn test_duplicate_paths_run_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let results = Engine::new(PoolConfig::in_process().concurrency(2))
            .run(paths(&["same", "same", "other"]), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_iter_yields_each_path_once() {
        for config in strategies() {
            let iter = Engine::new(config)
                .run_iter(paths(&["a", "b", "c", "d"]), |_| Ok::<_, String>(()))
                .unwrap();
            assert_eq!(iter.remaining(), 4);

            let mut seen: Vec<PathBuf> = iter.map(|(path, _)| path).collect();
            seen.sort();
            assert_eq!(seen, paths(&["a", "b", "c", "d"]));
        }
    }

    #[test]
    fn test_run_iter_yields_in_completion_order() {
        let mut iter = Engine::new(PoolConfig::isolated().concurrency(2))
            .run_iter(paths(&["slow", "fast"]), |p| {
                if p == Path::new("slow") {
                    thread::sleep(Duration::from_millis(300));
                }
                Ok::<_, String>(())
            })
            .unwrap();

        assert_eq!(iter.next().unwrap().0, PathBuf::from("fast"));
        assert_eq!(iter.next().unwrap().0, PathBuf::from("slow"));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_dropping_run_iter_stops_pending_units() {
        for config in strategies() {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let names: Vec<PathBuf> = (0..40).map(|i| PathBuf::from(format!("f{i}"))).collect();

            let started = Instant::now();
            let mut iter = Engine::new(config)
                .run_iter(names, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(25));
                    Ok::<_, String>(())
                })
                .unwrap();
            assert!(iter.next().is_some());
            drop(iter);
            assert!(started.elapsed() < Duration::from_millis(500));

            thread::sleep(Duration::from_millis(200));
            assert!(calls.load(Ordering::SeqCst) < 40);
        }
    }

    #[test]
    fn test_context_reaches_workers() {
        let _guard = ExecutionContext::new()
            .with_root("/project")
            .flag("mode", "lint")
            .enter();

        for config in strategies() {
            let results = Engine::new(config)
                .run(paths(&["a", "b"]), |_| {
                    let ctx = ExecutionContext::current();
                    Ok::<_, String>((
                        ctx.root().map(Path::to_path_buf),
                        ctx.get_flag("mode").map(String::from),
                    ))
                })
                .unwrap();

            for outcome in results.values() {
                assert_eq!(
                    outcome,
                    &Outcome::Success((Some(PathBuf::from("/project")), Some("lint".to_string())))
                );
            }
        }
    }

    /// Runs every job on an [`IsolatedPool`], counting them.
    struct CountingPool {
        inner: IsolatedPool,
        jobs: Arc<AtomicUsize>,
    }

    impl WorkerPool for CountingPool {
        fn execute(&self, job: Job) {
            self.jobs.fetch_add(1, Ordering::SeqCst);
            self.inner.execute(job);
        }

        fn workers(&self) -> usize {
            self.inner.workers()
        }
    }

    #[test]
    fn test_pool_factory_supplies_the_pool() {
        let jobs = Arc::new(AtomicUsize::new(0));
        let builds = Arc::new(AtomicUsize::new(0));
        let (job_counter, build_counter) = (Arc::clone(&jobs), Arc::clone(&builds));
        let factory: PoolFactory = Arc::new(
            move |config: &PoolConfig, units: usize| -> Result<Box<dyn WorkerPool>> {
                build_counter.fetch_add(1, Ordering::SeqCst);
                let pool = CountingPool {
                    inner: IsolatedPool::new(config.workers().min(units))?,
                    jobs: Arc::clone(&job_counter),
                };
                Ok(Box::new(pool))
            },
        );

        let engine = Engine::new(PoolConfig::isolated().concurrency(2)).with_pool_factory(factory);
        let results = engine
            .run(paths(&["a", "b", "c", "a"]), |p| Ok::<_, String>(p.to_path_buf()))
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[Path::new("b")], Outcome::Success(PathBuf::from("b")));
        assert_eq!(jobs.load(Ordering::SeqCst), 3);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        // Nothing to run, nothing built.
        engine.run(Vec::<PathBuf>::new(), |_| Ok::<_, String>(())).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_factory_errors_fail_the_run() {
        let factory: PoolFactory = Arc::new(
            |_: &PoolConfig, _: usize| -> Result<Box<dyn WorkerPool>> {
                Err(TrailError::PoolBuild("no workers available".to_string()))
            },
        );
        let result = Engine::new(PoolConfig::in_process())
            .with_pool_factory(factory)
            .run(paths(&["a"]), |_| Ok::<_, String>(()));

        assert!(matches!(result, Err(TrailError::PoolBuild(_))));
    }

    #[test]
    fn test_undecodable_context_fails_the_unit() {
        let snapshot = Snapshot::Encoded(Arc::from("not json"));
        let outcome = run_unit(Path::new("a"), &snapshot, &|_: &Path| Ok::<_, String>(()));

        assert_eq!(outcome.failure().unwrap().kind, FailureKind::Context);
    }
}
