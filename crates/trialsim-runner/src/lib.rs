//! Replicate orchestration for adaptive trial simulations.
//!
//! [`run_trials`] simulates `n_rep` independent replicates of a trial
//! specification and returns them as a [`ResultBundle`]. Results are
//! reproducible for a given base seed whatever the worker count, and a bundle
//! saved to disk can be reused as-is or grown to more replicates without
//! re-simulating the ones it already holds.

pub mod cache;
mod dispatch;
pub mod error;
pub mod pool;
pub mod progress;
pub mod rng;
pub mod spec;

pub use cache::{
    check_compatibility, decide_action, load, save, ActionKind, CacheRequest, CacheUse,
    EngineVersion, ResultBundle, RunAction, SaveOptions, ENGINE_VERSION,
};
pub use error::{RunError, RunResult};
pub use pool::{DefaultWorkers, WorkerPool, WorkerRegistry, WORKERS_ENV};
pub use progress::ProgressPlan;
pub use rng::{Mrg32k3a, SeedState, SeedStream};
pub use spec::{ReplicateSimulator, TrialSpec};

use pool::PoolLease;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

/// Caller-facing options for one call to [`run_trials`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub n_rep: usize,
    /// Where the bundle is cached. Without a path every run starts fresh and
    /// nothing is written.
    pub path: Option<PathBuf>,
    pub overwrite: bool,
    pub grow: bool,
    /// Explicit worker count; falls back to the registered default, then to
    /// `TRIALSIM_CORES`, then to 1.
    pub workers: Option<usize>,
    pub base_seed: Option<u64>,
    pub sparse: bool,
    /// Report progress after roughly every `progress` fraction of replicates.
    pub progress: Option<f64>,
    pub save: SaveOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            n_rep: 1,
            path: None,
            overwrite: false,
            grow: false,
            workers: None,
            base_seed: None,
            sparse: true,
            progress: None,
            save: SaveOptions::default(),
        }
    }
}

impl RunOptions {
    pub fn new(n_rep: usize) -> Self {
        Self {
            n_rep,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> RunResult<()> {
        if self.n_rep == 0 {
            return Err(RunError::invalid("n_rep", "must be at least 1"));
        }
        if self.workers == Some(0) {
            return Err(RunError::invalid("workers", "must be at least 1"));
        }
        if let Some(seed) = self.base_seed {
            if seed > u64::from(u32::MAX) {
                return Err(RunError::invalid(
                    "base_seed",
                    format!("{} does not fit in 32 bits", seed),
                ));
            }
        }
        if let Some(p) = self.progress {
            if !p.is_finite() || p <= 0.0 || p > 1.0 {
                return Err(RunError::invalid(
                    "progress",
                    format!("{} is not in (0, 1]", p),
                ));
            }
        }
        if self.grow && self.overwrite {
            return Err(RunError::GrowWithOverwrite);
        }
        if self.grow && self.path.is_none() {
            return Err(RunError::GrowWithoutPath);
        }
        Ok(())
    }
}

/// Final bundle plus what the run did to produce it.
#[derive(Debug)]
pub struct RunOutcome<S, R> {
    pub bundle: ResultBundle<S, R>,
    pub action: ActionKind,
    /// Replicates simulated by this call (0 on reuse).
    pub simulated: usize,
    /// Worker count used for the simulations; `None` when nothing was simulated.
    pub workers: Option<usize>,
    /// Wall time of this call's simulations only.
    pub elapsed: Duration,
}

/// Simulates, reuses, or grows a set of replicates of `spec`.
///
/// All validation (options, cached bundle compatibility) happens before any
/// replicate runs. A replicate error aborts the whole run and nothing is saved.
pub fn run_trials<S, M>(
    spec: S,
    simulator: &M,
    options: &RunOptions,
    registry: Option<&WorkerRegistry>,
) -> RunResult<RunOutcome<S, M::Output>>
where
    S: TrialSpec,
    M: ReplicateSimulator<S>,
{
    options.validate()?;

    let request = CacheRequest {
        spec: &spec,
        n_rep: options.n_rep,
        base_seed: options.base_seed,
        sparse: options.sparse,
        grow: options.grow,
    };
    let action: RunAction<S, M::Output> =
        decide_action(options.path.as_deref(), options.overwrite, &request)?;
    let kind = action.kind();

    let existing = match action {
        RunAction::Reuse(bundle) => {
            info!(n_rep = bundle.n_rep, "reusing cached result bundle");
            return Ok(RunOutcome {
                bundle,
                action: kind,
                simulated: 0,
                workers: None,
                elapsed: Duration::ZERO,
            });
        }
        RunAction::Grow(bundle) => Some(bundle),
        RunAction::New => None,
    };

    let prev = existing.as_ref().map_or(0, |b| b.n_rep);
    let n_new = options.n_rep - prev;
    let stream_seed = match &existing {
        Some(bundle) => bundle.base_seed.or(options.base_seed),
        None => options.base_seed,
    };
    let stream_seed = stream_seed
        .map(|s| {
            u32::try_from(s).map_err(|_| {
                RunError::invalid("base_seed", format!("{} does not fit in 32 bits", s))
            })
        })
        .transpose()?;
    let seeds = SeedStream::generate(stream_seed, options.n_rep);

    let registry = registry.unwrap_or(WorkerRegistry::global());
    let default = registry.get();
    let workers = pool::resolve_workers(options.workers, default.as_ref());
    let lease = PoolLease::acquire(workers, default.as_ref())?;

    info!(
        action = kind.as_str(),
        n_rep = options.n_rep,
        previous = prev,
        new = n_new,
        workers,
        "starting replicates"
    );

    let plan = match options.progress {
        Some(p) => ProgressPlan::new(p, prev, n_new, workers),
        None => ProgressPlan::single(prev, n_new),
    };
    let report = options.progress.is_some();
    if report {
        info!(target: "trialsim::progress", "{}", plan.start_message);
    }

    let started = Instant::now();
    let mut results = Vec::with_capacity(n_new);
    for (batch, message) in plan.batches.iter().zip(plan.messages.iter()) {
        let batch_results = dispatch::run_batch(
            batch,
            &spec,
            simulator,
            &seeds,
            options.sparse,
            lease.executor(),
        )?;
        results.extend(batch_results);
        if report {
            info!(
                target: "trialsim::progress",
                "{} [{:.1}s]",
                message,
                started.elapsed().as_secs_f64()
            );
        }
    }
    let elapsed = started.elapsed();
    drop(lease);

    let bundle = match existing {
        Some(mut bundle) => {
            bundle.append(results, elapsed);
            bundle
        }
        None => ResultBundle::new(spec, results, options.base_seed, options.sparse, elapsed),
    };

    if let Some(path) = &options.path {
        save(path, &bundle, &options.save)?;
        info!(path = %path.display(), n_rep = bundle.n_rep, "saved result bundle");
    }

    info!(
        action = kind.as_str(),
        simulated = n_new,
        elapsed_s = elapsed.as_secs_f64(),
        "replicates finished"
    );

    Ok(RunOutcome {
        bundle,
        action: kind,
        simulated: n_new,
        workers: Some(workers),
        elapsed,
    })
}
