//! Error type for replicate orchestration.

use std::path::PathBuf;

/// Errors produced while validating, running, or persisting a set of replicates.
///
/// Everything except `Replicate`, `Io`, `Json`, `Zip`, `Storage` and `Pool` is a
/// validation failure raised before any replicate is simulated.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("grow and overwrite cannot both be requested")]
    GrowWithOverwrite,

    #[error("grow requested but no result bundle exists at {}", path.display())]
    GrowWithoutCache { path: PathBuf },

    #[error("grow requested without an output path")]
    GrowWithoutPath,

    #[error(
        "cached bundle has {cached} replicates but {requested} were requested; \
         use grow with a larger count or overwrite"
    )]
    ReplicateCountMismatch { cached: usize, requested: usize },

    #[error("cached bundle has sparse = {cached} but sparse = {requested} was requested")]
    SparseMismatch { cached: bool, requested: bool },

    #[error("cached trial specification differs from the requested one ({cached} vs {requested})")]
    SpecMismatch { cached: String, requested: String },

    #[error("embedded hook '{hook}' differs between cached and requested trial specification")]
    HookMismatch { hook: String },

    #[error("cached bundle was written by engine {cached}, older than the current {current}")]
    StaleEngineVersion { cached: String, current: String },

    #[error("cached bundle used base seed {cached} but base seed {requested} was requested")]
    SeedMismatch { cached: u64, requested: u64 },

    #[error("malformed result bundle at {}: {reason}", path.display())]
    MalformedBundle { path: PathBuf, reason: String },

    #[error("replicate {index} failed: {source}")]
    Replicate {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl RunError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        RunError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// True for failures detected before any replicate was simulated.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            RunError::Replicate { .. }
                | RunError::Pool(_)
                | RunError::Storage(_)
                | RunError::Io(_)
                | RunError::Json(_)
                | RunError::Zip(_)
        )
    }
}

/// Result type for orchestration operations.
pub type RunResult<T> = std::result::Result<T, RunError>;
