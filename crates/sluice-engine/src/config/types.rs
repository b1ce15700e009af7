//! Pipeline configuration types and the resolved runtime settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Working directory root used when neither the config nor `$HOME` names one.
pub const FALLBACK_PIPELINES_DIR: &str = ".sluice";

/// Top-level pipeline YAML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    #[serde(default)]
    pub pipelines_dir: Option<PathBuf>,
    #[serde(default)]
    pub dataset: Option<String>,
    pub destination: DestinationConfig,
    #[serde(default = "default_true")]
    pub restore_from_destination: bool,
    #[serde(default)]
    pub extract: ExtractSettings,
    #[serde(default)]
    pub normalize: NormalizeSettings,
    #[serde(default)]
    pub load: LoadSettings,
}

impl PipelineConfig {
    /// Dataset name, defaulting to `<pipeline>_dataset`.
    #[must_use]
    pub fn dataset_name(&self) -> String {
        self.dataset
            .clone()
            .unwrap_or_else(|| format!("{}_dataset", self.pipeline))
    }

    /// Root of pipeline working directories: the configured one, else
    /// `$HOME/.sluice/pipelines`, else `./.sluice`.
    #[must_use]
    pub fn resolved_pipelines_dir(&self) -> PathBuf {
        self.pipelines_dir.clone().unwrap_or_else(default_pipelines_dir)
    }

    #[must_use]
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            extract: self.extract.clone(),
            normalize: self.normalize.clone(),
            load: self.load.clone(),
            restore_from_destination: self.restore_from_destination,
        }
    }
}

#[must_use]
pub fn default_pipelines_dir() -> PathBuf {
    std::env::var_os("HOME").map_or_else(
        || PathBuf::from(FALLBACK_PIPELINES_DIR),
        |home| PathBuf::from(home).join(".sluice").join("pipelines"),
    )
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub kind: DestinationKind,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Step settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractSettings {
    /// Blocking pool size for deferred computations.
    pub workers: usize,
    /// Pending futures and deferred computations in flight per resource.
    pub max_in_flight: usize,
    /// Rows per job file before it is rotated.
    pub file_max_items: usize,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            max_in_flight: 20,
            file_max_items: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizeSettings {
    pub workers: usize,
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadSettings {
    /// Jobs of one package loaded concurrently.
    pub workers: usize,
    /// Retries of a job on transient destination errors.
    pub max_retries: u32,
    /// Abort the package and fail the step when a job fails.
    pub raise_on_failed_jobs: bool,
    /// Scales retry delays; `0` disables sleeping between retries.
    pub backoff_multiplier: f64,
    pub delete_completed_packages: bool,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            workers: 20,
            max_retries: 5,
            raise_on_failed_jobs: false,
            backoff_multiplier: 1.0,
            delete_completed_packages: false,
        }
    }
}

/// Runtime settings of a pipeline, with or without a YAML file.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub extract: ExtractSettings,
    pub normalize: NormalizeSettings,
    pub load: LoadSettings,
    /// Sync state from the destination before running and stage state rows
    /// with every package whose state changed.
    pub restore_from_destination: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            extract: ExtractSettings::default(),
            normalize: NormalizeSettings::default(),
            load: LoadSettings::default(),
            restore_from_destination: true,
        }
    }
}
