//! Worker pool lifecycle and the process-wide default worker configuration.

use crate::error::{RunError, RunResult};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Environment variable consulted when neither an explicit worker count nor a
/// registered default is available.
pub const WORKERS_ENV: &str = "TRIALSIM_CORES";

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl WorkerPool {
    pub fn create(workers: usize) -> RunResult<Self> {
        if workers == 0 {
            return Err(RunError::invalid("workers", "must be at least 1"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("trialsim-worker-{}", i))
            .build()?;
        debug!(workers, "worker pool created");
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub(crate) fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        debug!(workers = self.workers, "worker pool destroyed");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}

/// A registered default: either just a worker count, or a pool to share.
#[derive(Debug, Clone)]
pub enum DefaultWorkers {
    Count(usize),
    Pool(Arc<WorkerPool>),
}

impl DefaultWorkers {
    pub fn workers(&self) -> usize {
        match self {
            DefaultWorkers::Count(n) => *n,
            DefaultWorkers::Pool(pool) => pool.workers(),
        }
    }
}

/// Default worker configuration read by the orchestrator when a run does not
/// name its own worker count. Set once during setup, read per run.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    inner: RwLock<Option<DefaultWorkers>>,
}

static GLOBAL_REGISTRY: WorkerRegistry = WorkerRegistry::new();

impl WorkerRegistry {
    pub const fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    pub fn global() -> &'static WorkerRegistry {
        &GLOBAL_REGISTRY
    }

    pub fn set(&self, default: DefaultWorkers) -> RunResult<()> {
        if default.workers() == 0 {
            return Err(RunError::invalid("workers", "must be at least 1"));
        }
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(default);
        Ok(())
    }

    pub fn get(&self) -> Option<DefaultWorkers> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

/// Worker count with precedence: explicit > registered default > environment > 1.
pub(crate) fn resolve_workers(explicit: Option<usize>, default: Option<&DefaultWorkers>) -> usize {
    if let Some(n) = explicit {
        return n;
    }
    if let Some(default) = default {
        return default.workers();
    }
    workers_from_env().unwrap_or(1)
}

fn workers_from_env() -> Option<usize> {
    let raw = std::env::var(WORKERS_ENV).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!(value = %raw, "ignoring {}: expected a positive integer", WORKERS_ENV);
            None
        }
    }
}

/// How a batch is executed.
#[derive(Clone, Copy)]
pub(crate) enum Executor<'a> {
    Sequential,
    Pool(&'a WorkerPool),
}

/// Pool held for the duration of one run. An owned pool is torn down when the
/// lease drops, on every exit path.
pub(crate) enum PoolLease {
    Sequential,
    Shared(Arc<WorkerPool>),
    Owned(WorkerPool),
}

impl PoolLease {
    pub(crate) fn acquire(workers: usize, default: Option<&DefaultWorkers>) -> RunResult<Self> {
        if workers <= 1 {
            return Ok(PoolLease::Sequential);
        }
        if let Some(DefaultWorkers::Pool(pool)) = default {
            if pool.workers() == workers {
                debug!(workers, "reusing registered worker pool");
                return Ok(PoolLease::Shared(Arc::clone(pool)));
            }
        }
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if workers > available {
            warn!(
                workers,
                available, "requested more workers than available parallelism"
            );
        }
        Ok(PoolLease::Owned(WorkerPool::create(workers)?))
    }

    pub(crate) fn executor(&self) -> Executor<'_> {
        match self {
            PoolLease::Sequential => Executor::Sequential,
            PoolLease::Shared(pool) => Executor::Pool(pool.as_ref()),
            PoolLease::Owned(pool) => Executor::Pool(pool),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_set_get_clear() {
        let registry = WorkerRegistry::new();
        assert!(registry.get().is_none());
        registry.set(DefaultWorkers::Count(3)).expect("set");
        assert_eq!(registry.get().map(|d| d.workers()), Some(3));
        registry.clear();
        assert!(registry.get().is_none());
        assert!(registry.set(DefaultWorkers::Count(0)).is_err());
    }

    #[test]
    fn explicit_workers_win_over_registered_default() {
        let default = DefaultWorkers::Count(6);
        assert_eq!(resolve_workers(Some(2), Some(&default)), 2);
        assert_eq!(resolve_workers(None, Some(&default)), 6);
    }

    #[test]
    fn lease_reuses_registered_pool_of_matching_size() {
        let pool = Arc::new(WorkerPool::create(2).expect("pool"));
        let default = DefaultWorkers::Pool(Arc::clone(&pool));
        match PoolLease::acquire(2, Some(&default)).expect("lease") {
            PoolLease::Shared(shared) => assert!(Arc::ptr_eq(&shared, &pool)),
            _ => panic!("expected shared pool"),
        }
        assert!(matches!(
            PoolLease::acquire(1, Some(&default)).expect("lease"),
            PoolLease::Sequential
        ));
        assert!(matches!(
            PoolLease::acquire(3, Some(&default)).expect("lease"),
            PoolLease::Owned(_)
        ));
    }

    #[test]
    fn zero_worker_pool_is_rejected() {
        assert!(matches!(
            WorkerPool::create(0),
            Err(RunError::InvalidArgument { name: "workers", .. })
        ));
    }
}
