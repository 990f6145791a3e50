//! Worker pools and their configuration.
//!
//! Two strategies are available:
//!
//! - [`Strategy::Isolated`]: fresh, dedicated worker threads per run. Nothing
//!   leaks in from the caller's thread; the execution context is shipped to
//!   them in serialized form.
//! - [`Strategy::InProcess`]: a rayon thread pool. The context is shared
//!   directly.
//!
//! The process-wide default is read at the start of every run and can be
//! replaced with [`set_default_pool`].

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use crossbeam::channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};

use crate::error::TrailError;
use crate::Result;

/// How units of work are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Dedicated threads per run with a serialized context
    #[default]
    Isolated,
    /// A shared-memory rayon pool
    InProcess,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Isolated => write!(f, "isolated"),
            Strategy::InProcess => write!(f, "in-process"),
        }
    }
}

impl FromStr for Strategy {
    type Err = TrailError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolated" | "process" => Ok(Strategy::Isolated),
            "in-process" | "thread" | "threads" => Ok(Strategy::InProcess),
            _ => Err(TrailError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Pool configuration: a strategy and a worker count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub strategy: Strategy,
    /// Worker count (0 = one per available CPU)
    pub concurrency: usize,
}

impl PoolConfig {
    pub const fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            concurrency: 0,
        }
    }

    pub const fn isolated() -> Self {
        Self::new(Strategy::Isolated)
    }

    pub const fn in_process() -> Self {
        Self::new(Strategy::InProcess)
    }

    /// Set the worker count.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// The effective number of workers.
    pub fn workers(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency;
        }
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    /// Build a pool with at most `limit` workers.
    pub fn build(&self, limit: usize) -> Result<Box<dyn WorkerPool>> {
        let workers = self.workers().min(limit).max(1);
        Ok(match self.strategy {
            Strategy::Isolated => Box::new(IsolatedPool::new(workers)?),
            Strategy::InProcess => Box::new(InProcessPool::new(workers)?),
        })
    }
}

static DEFAULT_POOL: RwLock<PoolConfig> = RwLock::new(PoolConfig::isolated());

/// The process-wide default pool configuration.
pub fn default_pool() -> PoolConfig {
    *DEFAULT_POOL.read().unwrap_or_else(PoisonError::into_inner)
}

/// Replace the process-wide default, returning the previous one.
///
/// Runs already in progress keep the configuration they started with.
pub fn set_default_pool(config: PoolConfig) -> PoolConfig {
    let mut guard = DEFAULT_POOL.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *guard, config)
}

/// A unit of work handed to a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs in the background.
pub trait WorkerPool: Send {
    /// Queue a job. Never blocks on the job itself.
    fn execute(&self, job: Job);

    /// Number of workers serving the queue.
    fn workers(&self) -> usize;
}

/// Builds the pool for one run from its configuration and unit count.
///
/// Replaces [`PoolConfig::build`] when set on an engine. The strategy still
/// decides how the execution context reaches the pool's threads.
pub type PoolFactory =
    Arc<dyn Fn(&PoolConfig, usize) -> Result<Box<dyn WorkerPool>> + Send + Sync>;

/// Dedicated threads fed from a shared queue.
///
/// Dropping the pool closes the queue: workers finish whatever is already
/// queued and then exit. The pool never joins them.
pub struct IsolatedPool {
    sender: Option<Sender<Job>>,
    workers: usize,
}

impl IsolatedPool {
    pub fn new(workers: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        for i in 0..workers {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("trailrun-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .map_err(|e| TrailError::PoolBuild(e.to_string()))?;
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }
}

impl WorkerPool for IsolatedPool {
    fn execute(&self, job: Job) {
        if let Some(sender) = &self.sender {
            // Only fails once every worker is gone, which drops the job.
            let _ = sender.send(job);
        }
    }

    fn workers(&self) -> usize {
        self.workers
    }
}

impl Drop for IsolatedPool {
    fn drop(&mut self) {
        self.sender.take();
    }
}

/// A rayon thread pool.
pub struct InProcessPool {
    pool: rayon::ThreadPool,
}

impl InProcessPool {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("trailrun-thread-{i}"))
            .build()
            .map_err(|e| TrailError::PoolBuild(e.to_string()))?;
        Ok(Self { pool })
    }
}

impl WorkerPool for InProcessPool {
    fn execute(&self, job: Job) {
        self.pool.spawn(job);
    }

    fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}
