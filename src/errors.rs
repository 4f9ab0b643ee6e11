use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

// ─── Per-city failure taxonomy ───────────────────────────────────────────────

/// Everything that can knock a single city out of a run. Carried in the
/// run report and in the audit row's `metadata_json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    TransientNetwork,
    UpstreamRateLimited,
    UpstreamBadRequest,
    UpstreamMalformed,
    Timeout,
    MissingColumns,
    InsufficientHours,
    NonFiniteOutput,
}

// ─── Fetch errors (one HTTP batch) ───────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("upstream rate limited (HTTP 429)")]
    UpstreamRateLimited,
    #[error("upstream rejected request (HTTP {0})")]
    UpstreamBadRequest(u16),
    #[error("malformed upstream payload: {0}")]
    UpstreamMalformed(String),
    #[error("request timed out")]
    Timeout,
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::TransientNetwork(_) => FailureKind::TransientNetwork,
            FetchError::UpstreamRateLimited => FailureKind::UpstreamRateLimited,
            FetchError::UpstreamBadRequest(_) => FailureKind::UpstreamBadRequest,
            FetchError::UpstreamMalformed(_) => FailureKind::UpstreamMalformed,
            FetchError::Timeout => FailureKind::Timeout,
        }
    }

    /// Retry within a batch only on transient conditions; 4xx and parse
    /// failures abort the batch immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::TransientNetwork(_) | FetchError::UpstreamRateLimited | FetchError::Timeout
        )
    }
}

// ─── Kernel errors (one city) ────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComputeError {
    #[error("required hourly columns absent or misaligned")]
    MissingColumns,
    #[error("only {0} hours available, need at least 24")]
    InsufficientHours(usize),
}

impl ComputeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ComputeError::MissingColumns => FailureKind::MissingColumns,
            ComputeError::InsufficientHours(_) => FailureKind::InsufficientHours,
        }
    }
}

// ─── Run-level errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Every fetch batch failed: the provider is down. Retryable at task level.
    #[error("forecast provider unreachable for every batch")]
    UpstreamOutage,
    /// The hot cache rejected both write attempts. Retryable at task level;
    /// without the hot cache readers cannot be served.
    #[error("hot cache write failed after retry: {0}")]
    CacheWriteFailed(String),
    /// The whole run exceeded its hard deadline. Aborts without retry.
    #[error("run exceeded the {0}s deadline")]
    DeadlineExceeded(u64),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::UpstreamOutage | PipelineError::CacheWriteFailed(_)
        )
    }
}

// ─── Startup errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingConfig(&'static str),
    #[error("invalid value for {name}: {reason}")]
    InvalidConfig { name: &'static str, reason: String },
    #[error("invalid bundled city table: {0}")]
    CityListInvalid(String),
}
