//! Step results returned by pipeline operations.

use std::collections::BTreeMap;

use serde::Serialize;
use sluice_types::ids::LoadId;
use sluice_types::package::LoadOutcome;

use crate::errors::PipelineError;

/// Rows written by one source into its package.
#[derive(Debug, Clone, Serialize)]
pub struct SourceExtractInfo {
    pub source_name: String,
    pub schema_name: String,
    pub load_id: LoadId,
    /// Rows per table, state rows included.
    pub row_counts: BTreeMap<String, u64>,
}

/// Result of an extract step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractInfo {
    pub pipeline_name: String,
    pub sources: Vec<SourceExtractInfo>,
}

impl ExtractInfo {
    /// One package per source, in extraction order.
    #[must_use]
    pub fn load_ids(&self) -> Vec<LoadId> {
        self.sources.iter().map(|s| s.load_id.clone()).collect()
    }
}

/// Result of a normalize step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeInfo {
    pub load_ids: Vec<LoadId>,
    /// Rows per table over all normalized packages, child tables included.
    pub row_counts: BTreeMap<String, u64>,
}

/// A job that reached the failed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedJob {
    pub job_id: String,
    pub file_name: String,
    pub retry_count: u32,
    pub message: Option<String>,
}

/// How one package was loaded.
#[derive(Debug, Clone, Serialize)]
pub struct PackageLoadInfo {
    pub load_id: LoadId,
    pub outcome: LoadOutcome,
    pub schema_name: String,
    pub completed_jobs: Vec<String>,
    pub failed_jobs: Vec<FailedJob>,
}

/// Result of a load step.
#[derive(Debug, Clone, Serialize)]
pub struct LoadInfo {
    pub pipeline_name: String,
    pub destination_name: String,
    pub dataset_name: String,
    pub packages: Vec<PackageLoadInfo>,
    /// The pipeline had neither local nor destination state before this load.
    pub first_run: bool,
}

impl LoadInfo {
    #[must_use]
    pub fn load_ids(&self) -> Vec<LoadId> {
        self.packages.iter().map(|p| p.load_id.clone()).collect()
    }

    #[must_use]
    pub fn has_failed_jobs(&self) -> bool {
        self.packages.iter().any(|p| !p.failed_jobs.is_empty())
    }

    /// Fail on the first package with failed jobs.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DestinationHasFailedJobs`] naming the package
    /// and its failed jobs.
    pub fn raise_on_failed_jobs(&self) -> Result<(), PipelineError> {
        match self.packages.iter().find(|p| !p.failed_jobs.is_empty()) {
            Some(package) => Err(PipelineError::DestinationHasFailedJobs {
                destination_name: self.destination_name.clone(),
                load_id: package.load_id.clone(),
                failed_jobs: package.failed_jobs.iter().map(|j| j.job_id.clone()).collect(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(load_id: &str, failed: &[&str]) -> PackageLoadInfo {
        PackageLoadInfo {
            load_id: LoadId::new(load_id),
            outcome: LoadOutcome::Loaded,
            schema_name: "s".into(),
            completed_jobs: vec!["t.000000".into()],
            failed_jobs: failed
                .iter()
                .map(|id| FailedJob {
                    job_id: (*id).to_string(),
                    file_name: format!("{id}.0.jsonl"),
                    retry_count: 0,
                    message: Some("[data] BAD_ROW: rejected".into()),
                })
                .collect(),
        }
    }

    fn info(packages: Vec<PackageLoadInfo>) -> LoadInfo {
        LoadInfo {
            pipeline_name: "p".into(),
            destination_name: "filesystem".into(),
            dataset_name: "p_dataset".into(),
            packages,
            first_run: false,
        }
    }

    #[test]
    fn clean_load_does_not_raise() {
        let info = info(vec![package("1.000001", &[])]);
        assert!(!info.has_failed_jobs());
        assert!(info.raise_on_failed_jobs().is_ok());
    }

    #[test]
    fn failed_jobs_raise_with_package_id() {
        let info = info(vec![package("1.000001", &[]), package("2.000001", &["t.000003"])]);
        assert!(info.has_failed_jobs());
        match info.raise_on_failed_jobs().unwrap_err() {
            PipelineError::DestinationHasFailedJobs {
                load_id, failed_jobs, ..
            } => {
                assert_eq!(load_id, LoadId::new("2.000001"));
                assert_eq!(failed_jobs, vec!["t.000003"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn extract_info_lists_packages_in_order() {
        let extract = ExtractInfo {
            pipeline_name: "p".into(),
            sources: ["a", "b"]
                .iter()
                .enumerate()
                .map(|(i, name)| SourceExtractInfo {
                    source_name: (*name).to_string(),
                    schema_name: (*name).to_string(),
                    load_id: LoadId::from_micros(1_000_000 + i as u64),
                    row_counts: BTreeMap::new(),
                })
                .collect(),
        };
        assert_eq!(
            extract.load_ids(),
            vec![LoadId::new("1.000000"), LoadId::new("1.000001")]
        );
    }
}
