//! Persisted result bundles: load, compatibility checks, merge, save.

use crate::error::{RunError, RunResult};
use crate::spec::TrialSpec;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use trialsim_core::atomic_write_bytes;

pub const BUNDLE_SCHEMA_VERSION: &str = "result_bundle_v1";

/// Version tag written into every bundle. Bundles from older engines are rejected.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_ENTRY: &str = "bundle.json";

/// All replicates of one trial specification, plus what is needed to extend them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle<S, R> {
    pub schema_version: String,
    pub engine_version: String,
    pub n_rep: usize,
    pub base_seed: Option<u64>,
    pub sparse: bool,
    /// Simulation time summed over every run that contributed replicates.
    pub elapsed: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub spec: S,
    pub results: Vec<R>,
}

impl<S, R> ResultBundle<S, R> {
    pub fn new(
        spec: S,
        results: Vec<R>,
        base_seed: Option<u64>,
        sparse: bool,
        elapsed: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: BUNDLE_SCHEMA_VERSION.to_string(),
            engine_version: ENGINE_VERSION.to_string(),
            n_rep: results.len(),
            base_seed,
            sparse,
            elapsed,
            created_at: now,
            updated_at: now,
            spec,
            results,
        }
    }

    /// Appends newly simulated replicates after the existing ones.
    pub fn append(&mut self, new_results: Vec<R>, elapsed: Duration) {
        self.results.extend(new_results);
        self.n_rep = self.results.len();
        self.elapsed += elapsed;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOptions {
    /// Store the JSON document inside a deflate-compressed zip archive.
    pub compress: bool,
    pub pretty: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            compress: true,
            pretty: false,
        }
    }
}

pub fn save<S, R>(path: &Path, bundle: &ResultBundle<S, R>, options: &SaveOptions) -> RunResult<()>
where
    S: Serialize,
    R: Serialize,
{
    let json = if options.pretty {
        serde_json::to_vec_pretty(bundle)?
    } else {
        serde_json::to_vec(bundle)?
    };
    let bytes = if options.compress {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let file_options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        writer.start_file(ZIP_ENTRY, file_options)?;
        writer.write_all(&json)?;
        writer.finish()?.into_inner()
    } else {
        json
    };
    atomic_write_bytes(path, &bytes).map_err(RunError::Storage)
}

/// Reads a bundle; `Ok(None)` when nothing exists at `path`.
pub fn load<S, R>(path: &Path) -> RunResult<Option<ResultBundle<S, R>>>
where
    S: DeserializeOwned,
    R: DeserializeOwned,
{
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let json = if bytes.starts_with(ZIP_MAGIC) {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut entry = archive.by_name(ZIP_ENTRY)?;
        let mut json = Vec::new();
        entry.read_to_end(&mut json)?;
        json
    } else {
        bytes
    };
    let bundle: ResultBundle<S, R> =
        serde_json::from_slice(&json).map_err(|e| RunError::MalformedBundle {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if bundle.results.len() != bundle.n_rep {
        return Err(RunError::MalformedBundle {
            path: path.to_path_buf(),
            reason: format!(
                "n_rep is {} but {} results are stored",
                bundle.n_rep,
                bundle.results.len()
            ),
        });
    }
    Ok(Some(bundle))
}

/// `major.minor.patch` engine version; pre-release and build suffixes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion(pub u64, pub u64, pub u64);

impl EngineVersion {
    pub fn current() -> Self {
        ENGINE_VERSION.parse().unwrap_or(EngineVersion(0, 0, 0))
    }
}

impl FromStr for EngineVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s.split(['-', '+']).next().unwrap_or("");
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected major.minor.patch, got '{}'", s));
        }
        let mut nums = [0u64; 3];
        for (slot, part) in nums.iter_mut().zip(parts.iter()) {
            *slot = part
                .parse()
                .map_err(|_| format!("non-numeric version component in '{}'", s))?;
        }
        Ok(EngineVersion(nums[0], nums[1], nums[2]))
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// What a run asks of the cache.
#[derive(Debug)]
pub struct CacheRequest<'a, S> {
    pub spec: &'a S,
    pub n_rep: usize,
    pub base_seed: Option<u64>,
    pub sparse: bool,
    pub grow: bool,
}

/// How a compatible cached bundle is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUse {
    Grow,
    Reuse,
}

/// Rejects a cached bundle that cannot serve `request`.
pub fn check_compatibility<S, R>(
    cached: &ResultBundle<S, R>,
    request: &CacheRequest<'_, S>,
) -> RunResult<CacheUse>
where
    S: TrialSpec,
{
    let cached_digest = cached.spec.structure_digest();
    let requested_digest = request.spec.structure_digest();
    if cached_digest != requested_digest {
        return Err(RunError::SpecMismatch {
            cached: cached_digest,
            requested: requested_digest,
        });
    }

    let cached_hooks = cached.spec.hook_tokens();
    let requested_hooks = request.spec.hook_tokens();
    let names: BTreeSet<&String> = cached_hooks.keys().chain(requested_hooks.keys()).collect();
    for name in names {
        if cached_hooks.get(name) != requested_hooks.get(name) {
            return Err(RunError::HookMismatch { hook: name.clone() });
        }
    }

    let stale = || RunError::StaleEngineVersion {
        cached: cached.engine_version.clone(),
        current: ENGINE_VERSION.to_string(),
    };
    let cached_version: EngineVersion = cached.engine_version.parse().map_err(|_| stale())?;
    if cached_version < EngineVersion::current() {
        return Err(stale());
    }

    if cached.sparse != request.sparse {
        return Err(RunError::SparseMismatch {
            cached: cached.sparse,
            requested: request.sparse,
        });
    }

    if let (Some(cached_seed), Some(requested_seed)) = (cached.base_seed, request.base_seed) {
        if cached_seed != requested_seed {
            return Err(RunError::SeedMismatch {
                cached: cached_seed,
                requested: requested_seed,
            });
        }
    }

    if request.n_rep != cached.n_rep {
        if !request.grow || request.n_rep < cached.n_rep {
            return Err(RunError::ReplicateCountMismatch {
                cached: cached.n_rep,
                requested: request.n_rep,
            });
        }
        return Ok(CacheUse::Grow);
    }
    if request.grow {
        warn!(
            n_rep = cached.n_rep,
            "grow requested but the cached bundle already has the requested number of replicates; reusing it"
        );
    }
    Ok(CacheUse::Reuse)
}

/// What the orchestrator will do for a run.
#[derive(Debug)]
pub enum RunAction<S, R> {
    New,
    Grow(ResultBundle<S, R>),
    Reuse(ResultBundle<S, R>),
}

impl<S, R> RunAction<S, R> {
    pub fn kind(&self) -> ActionKind {
        match self {
            RunAction::New => ActionKind::New,
            RunAction::Grow(_) => ActionKind::Grow,
            RunAction::Reuse(_) => ActionKind::Reuse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    New,
    Grow,
    Reuse,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::New => "new",
            ActionKind::Grow => "grow",
            ActionKind::Reuse => "reuse",
        }
    }
}

/// Decides between a fresh run, growing a cached bundle, or reusing it.
pub fn decide_action<S, R>(
    path: Option<&Path>,
    overwrite: bool,
    request: &CacheRequest<'_, S>,
) -> RunResult<RunAction<S, R>>
where
    S: TrialSpec,
    R: DeserializeOwned,
{
    if request.grow && overwrite {
        return Err(RunError::GrowWithOverwrite);
    }
    let Some(path) = path else {
        if request.grow {
            return Err(RunError::GrowWithoutPath);
        }
        return Ok(RunAction::New);
    };
    if overwrite {
        return Ok(RunAction::New);
    }
    match load::<S, R>(path)? {
        None if request.grow => Err(RunError::GrowWithoutCache {
            path: path.to_path_buf(),
        }),
        None => Ok(RunAction::New),
        Some(cached) => match check_compatibility(&cached, request)? {
            CacheUse::Grow => Ok(RunAction::Grow(cached)),
            CacheUse::Reuse => Ok(RunAction::Reuse(cached)),
        },
    }
}
