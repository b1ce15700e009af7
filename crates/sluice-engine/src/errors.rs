//! Pipeline error model and retry backoff policy helpers.
//!
//! Each step has its own error enum. Whatever escapes a step is wrapped in
//! [`PipelineError::StepFailed`] together with the identifiers needed to
//! resume or diagnose it.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use sluice_state::StateError;
use sluice_types::error::{BackoffClass, DestinationError};
use sluice_types::ids::LoadId;
use sluice_types::schema::SchemaError;

use crate::load::storage::StorageError;

const BACKOFF_FAST_BASE_MS: u64 = 100;
const BACKOFF_NORMAL_BASE_MS: u64 = 1_000;
const BACKOFF_SLOW_BASE_MS: u64 = 5_000;
const BACKOFF_MAX_MS: u64 = 60_000;

/// Error type of user supplied producers, maps and transformers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Extract,
    Normalize,
    Load,
}

impl Step {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Normalize => "normalize",
            Self::Load => "load",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step errors
// ---------------------------------------------------------------------------

/// Errors raised while draining sources.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The source was already extracted once.
    #[error("source '{source_name}' is exhausted; create a new source instance to extract it again")]
    SourceExhausted { source_name: String },

    /// A producer yielded a value that cannot become a row.
    #[error("resource '{resource}' yielded data of unsupported type: {value}")]
    InvalidResourceDataType { resource: String, value: String },

    /// A transformer was extracted without a parent resource feeding it.
    #[error("transformer '{resource}' has no parent resource")]
    UnboundTransformer { resource: String },

    /// A producer, deferred computation, map or transformer failed.
    #[error("resource '{resource}' failed: {source}")]
    Producer {
        resource: String,
        #[source]
        source: BoxError,
    },

    /// A spawned extraction task panicked or was cancelled.
    #[error("extraction task for resource '{resource}' failed: {message}")]
    TaskFailed { resource: String, message: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors raised while normalizing extracted packages.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// A merge table has neither a primary key nor a content hash.
    #[error("table '{table}' uses the merge write disposition but has no primary key, merge key or row hash")]
    MergeKeyMissing { table: String },

    /// A staged row is not valid JSON.
    #[error("invalid row at {}:{line}: {source}", .file.display())]
    InvalidRow {
        file: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A normalization worker panicked or was cancelled.
    #[error("normalize worker failed: {message}")]
    TaskFailed { message: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors raised while loading normalized packages.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// A job failed permanently and failed jobs are fatal.
    #[error("job '{job}' of load package {load_id} failed in destination '{destination}': {error}")]
    JobFailed {
        destination: String,
        load_id: LoadId,
        job: String,
        error: String,
        /// The destination classified the last error as terminal.
        terminal: bool,
    },

    /// Applying the package schema update failed.
    #[error("destination '{destination}' rejected schema update: {source}")]
    SchemaUpdate {
        destination: String,
        #[source]
        source: DestinationError,
    },

    /// The destination's completion hook failed.
    #[error("destination '{destination}' failed to complete load: {source}")]
    CompleteLoad {
        destination: String,
        #[source]
        source: DestinationError,
    },

    /// A load worker panicked or was cancelled.
    #[error("load worker failed: {message}")]
    TaskFailed { message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Cause of a failed step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

impl StepError {
    /// Whether running the step again may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Extract(ExtractError::Producer { .. } | ExtractError::Storage(_)) => true,
            Self::Load(LoadError::JobFailed { terminal, .. }) => !terminal,
            Self::Load(
                LoadError::SchemaUpdate { source, .. } | LoadError::CompleteLoad { source, .. },
            ) => source.retryable,
            Self::Load(LoadError::Storage(StorageError::PackageLocked { .. })) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

fn describe_ids(load_id: Option<&LoadId>, source_name: Option<&str>) -> String {
    match (load_id, source_name) {
        (Some(id), Some(source)) => format!(" (load id {id}, source '{source}')"),
        (Some(id), None) => format!(" (load id {id})"),
        (None, Some(source)) => format!(" (source '{source}')"),
        (None, None) => String::new(),
    }
}

/// Errors surfaced by [`Pipeline`](crate::pipeline::Pipeline) operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A step failed. Sources committed before the failure stay committed.
    #[error(
        "pipeline step '{step}' failed{}: {cause}",
        describe_ids(.load_id.as_ref(), .source_name.as_deref())
    )]
    StepFailed {
        step: Step,
        load_id: Option<LoadId>,
        source_name: Option<String>,
        #[source]
        cause: StepError,
    },

    /// `deactivate` called on a pipeline that is not the active one.
    #[error("pipeline '{pipeline_name}' is not active")]
    PipelineNotActive { pipeline_name: String },

    /// State was requested through the registry while no pipeline is active.
    #[error("no pipeline is active; source and resource state are not available")]
    PipelineStateNotAvailable,

    /// Loaded packages contain failed jobs.
    #[error("destination '{destination_name}' has {} failed job(s) in load package {load_id}", .failed_jobs.len())]
    DestinationHasFailedJobs {
        destination_name: String,
        load_id: LoadId,
        failed_jobs: Vec<String>,
    },

    #[error("invalid pipeline name '{name}': {reason}")]
    InvalidPipelineName { name: String, reason: String },

    /// `attach` found no working directory.
    #[error("cannot restore pipeline '{name}': working directory {} not found", .path.display())]
    CannotRestorePipeline { name: String, path: PathBuf },

    #[error("pipeline '{pipeline_name}' has no destination")]
    DestinationMissing { pipeline_name: String },

    /// Reading state from the destination failed.
    #[error("failed to restore state from destination '{destination_name}': {source}")]
    StateSync {
        destination_name: String,
        #[source]
        source: DestinationError,
    },

    /// A blocking task panicked or was cancelled.
    #[error("pipeline task failed: {message}")]
    TaskFailed { message: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PipelineError {
    pub(crate) fn step_failed(
        step: Step,
        load_id: Option<LoadId>,
        source_name: Option<String>,
        cause: impl Into<StepError>,
    ) -> Self {
        Self::StepFailed {
            step,
            load_id,
            source_name,
            cause: cause.into(),
        }
    }

    /// The failed step, if this is a step failure.
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::StepFailed { step, .. } => Some(*step),
            _ => None,
        }
    }

    #[must_use]
    pub fn extract_error(&self) -> Option<&ExtractError> {
        match self {
            Self::StepFailed {
                cause: StepError::Extract(e),
                ..
            } => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn normalize_error(&self) -> Option<&NormalizeError> {
        match self {
            Self::StepFailed {
                cause: StepError::Normalize(e),
                ..
            } => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn load_error(&self) -> Option<&LoadError> {
        match self {
            Self::StepFailed {
                cause: StepError::Load(e),
                ..
            } => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if retrying the failed step may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StepFailed { cause, .. } => cause.is_transient(),
            Self::StateSync { source, .. } => source.retryable,
            _ => false,
        }
    }
}

/// Predicate for retry loops around pipeline calls: retry only transient
/// failures of the given steps.
///
/// ```
/// use sluice_engine::errors::{retry_load, Step};
///
/// let should_retry = retry_load(&[Step::Load]);
/// # let _ = should_retry;
/// ```
pub fn retry_load(steps: &[Step]) -> impl Fn(&PipelineError) -> bool {
    let steps = steps.to_vec();
    move |err| match err {
        PipelineError::StepFailed { step, cause, .. } => {
            steps.contains(step) && cause.is_transient()
        }
        _ => false,
    }
}

/// Compute retry delay based on error hints and attempt number.
pub(crate) fn compute_backoff(err: &DestinationError, attempt: u32) -> Duration {
    if let Some(ms) = err.retry_after_ms {
        return Duration::from_millis(ms);
    }

    let base_ms: u64 = match err.backoff_class {
        BackoffClass::Fast => BACKOFF_FAST_BASE_MS,
        BackoffClass::Normal => BACKOFF_NORMAL_BASE_MS,
        BackoffClass::Slow => BACKOFF_SLOW_BASE_MS,
    };

    let exponent = attempt.saturating_sub(1).min(16);
    let delay_ms = base_ms.saturating_mul(2u64.pow(exponent));
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}
