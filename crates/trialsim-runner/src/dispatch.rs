//! Batch execution, sequential or on a worker pool.

use crate::error::{RunError, RunResult};
use crate::pool::Executor;
use crate::rng::SeedStream;
use crate::spec::{ReplicateSimulator, TrialSpec};
use rayon::prelude::*;
use tracing::debug;

/// Simulates each replicate in `indices` and returns the results in the same
/// order. `seeds` must cover every index (1-based, absolute).
pub(crate) fn run_batch<S, M>(
    indices: &[usize],
    spec: &S,
    simulator: &M,
    seeds: &SeedStream,
    sparse: bool,
    executor: Executor<'_>,
) -> RunResult<Vec<M::Output>>
where
    S: TrialSpec,
    M: ReplicateSimulator<S>,
{
    let simulate_one = |&index: &usize| -> RunResult<M::Output> {
        let mut rng = seeds.rng_for(index);
        simulator
            .simulate(spec, sparse, &mut rng)
            .map_err(|source| RunError::Replicate { index, source })
    };

    match executor {
        Executor::Sequential => {
            debug!(replicates = indices.len(), "dispatching batch sequentially");
            indices.iter().map(simulate_one).collect()
        }
        Executor::Pool(pool) => {
            debug!(
                replicates = indices.len(),
                workers = pool.workers(),
                "dispatching batch to worker pool"
            );
            pool.install(|| indices.par_iter().map(simulate_one).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;
    use crate::rng::Mrg32k3a;
    use rand::Rng;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Debug, Serialize, Deserialize)]
    struct Coin {
        p: f64,
    }

    impl TrialSpec for Coin {
        fn structure(&self) -> Value {
            json!({ "p": self.p })
        }
    }

    struct Flips;

    impl ReplicateSimulator<Coin> for Flips {
        type Output = Vec<bool>;

        fn simulate(
            &self,
            spec: &Coin,
            _sparse: bool,
            rng: &mut Mrg32k3a,
        ) -> anyhow::Result<Vec<bool>> {
            Ok((0..16).map(|_| rng.random_bool(spec.p)).collect())
        }
    }

    struct AlwaysFails;

    impl ReplicateSimulator<Coin> for AlwaysFails {
        type Output = u32;

        fn simulate(&self, _spec: &Coin, _sparse: bool, _rng: &mut Mrg32k3a) -> anyhow::Result<u32> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn pool_and_sequential_agree_in_order() {
        let spec = Coin { p: 0.4 };
        let indices: Vec<usize> = (1..=12).collect();
        let seeds = SeedStream::generate(Some(99), 12);
        let sequential =
            run_batch(&indices, &spec, &Flips, &seeds, false, Executor::Sequential).expect("seq");
        let pool = WorkerPool::create(3).expect("pool");
        let pooled =
            run_batch(&indices, &spec, &Flips, &seeds, false, Executor::Pool(&pool)).expect("pool");
        assert_eq!(sequential, pooled);
        assert_eq!(sequential.len(), 12);
    }

    #[test]
    fn subset_of_indices_uses_their_own_states() {
        let spec = Coin { p: 0.5 };
        let seeds = SeedStream::generate(Some(5), 6);
        let all: Vec<usize> = (1..=6).collect();
        let full = run_batch(&all, &spec, &Flips, &seeds, false, Executor::Sequential).expect("all");
        let tail = run_batch(&[4, 5, 6], &spec, &Flips, &seeds, false, Executor::Sequential)
            .expect("tail");
        assert_eq!(&full[3..], tail.as_slice());
    }

    #[test]
    fn replicate_error_carries_index() {
        let spec = Coin { p: 0.5 };
        let seeds = SeedStream::generate(Some(1), 3);
        let err = run_batch(&[2, 3], &spec, &AlwaysFails, &seeds, false, Executor::Sequential)
            .expect_err("must fail");
        match err {
            RunError::Replicate { index, source } => {
                assert_eq!(index, 2);
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
