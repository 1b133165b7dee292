//! Contracts the orchestrator needs from a trial specification and from the
//! single-replicate simulation.

use crate::rng::Mrg32k3a;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use trialsim_core::canonical_json_digest;

/// Configuration of an adaptive design, persisted inside each result bundle.
///
/// Compatibility with a cached bundle is decided from two views: `structure`
/// (everything except embedded hooks) is compared by canonical digest, and each
/// hook is compared through its canonical token. Hooks compiled from the same
/// source therefore match across reloads even when they are not identical values.
pub trait TrialSpec: Serialize + DeserializeOwned + Send + Sync {
    /// Hook-free structural view of the specification.
    fn structure(&self) -> Value;

    /// Canonical token per embedded hook, keyed by hook name.
    fn hook_tokens(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn structure_digest(&self) -> String {
        canonical_json_digest(&self.structure())
    }
}

/// Simulates one replicate of a trial.
///
/// Implementations must draw all randomness from `rng`; with a reproducible
/// stream the result then depends only on the replicate's seed state.
pub trait ReplicateSimulator<S: TrialSpec>: Sync {
    type Output: Serialize + DeserializeOwned + Send;

    fn simulate(&self, spec: &S, sparse: bool, rng: &mut Mrg32k3a)
        -> anyhow::Result<Self::Output>;
}
