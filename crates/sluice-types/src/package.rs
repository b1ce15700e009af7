//! Load package and job state model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Package state
// ---------------------------------------------------------------------------

/// Folder a load package currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    /// Extraction in progress.
    New,
    Extracted,
    Normalized,
    Loaded,
}

impl PackageState {
    /// Folder name under the load storage root.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Extracted => "extracted",
            Self::Normalized => "normalized",
            Self::Loaded => "loaded",
        }
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded on a package once it reaches [`PackageState::Loaded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOutcome {
    /// All jobs completed, or failures were tolerated.
    Loaded,
    /// A job failed permanently and failed jobs are fatal.
    Aborted,
}

impl LoadOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for LoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "loaded" => Ok(Self::Loaded),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown package outcome '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Job state, given by the folder the job file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    Started,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [Self::New, Self::Started, Self::Completed, Self::Failed];

    /// Folder name inside a package directory.
    #[must_use]
    pub fn folder(self) -> &'static str {
        match self {
            Self::New => "new_jobs",
            Self::Started => "started_jobs",
            Self::Completed => "completed_jobs",
            Self::Failed => "failed_jobs",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Job file names
// ---------------------------------------------------------------------------

/// Job file extension.
pub const JOB_FILE_EXTENSION: &str = "jsonl";

/// Parsed `<table>.<file_id>.<retry_count>.jsonl` job file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobFileName {
    pub table: String,
    pub file_id: String,
    pub retry_count: u32,
}

impl JobFileName {
    #[must_use]
    pub fn new(table: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            file_id: file_id.into(),
            retry_count: 0,
        }
    }

    /// Same job with a different retry count.
    #[must_use]
    pub fn with_retry(&self, retry_count: u32) -> Self {
        Self {
            retry_count,
            ..self.clone()
        }
    }

    /// Name of the job ignoring its retry count: `<table>.<file_id>`.
    #[must_use]
    pub fn job_id(&self) -> String {
        format!("{}.{}", self.table, self.file_id)
    }
}

impl fmt::Display for JobFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{JOB_FILE_EXTENSION}",
            self.table, self.file_id, self.retry_count
        )
    }
}

impl FromStr for JobFileName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let [table, file_id, retry, ext] = parts.as_slice() else {
            return Err(format!("'{s}' is not a <table>.<file_id>.<retry>.{JOB_FILE_EXTENSION} name"));
        };
        if *ext != JOB_FILE_EXTENSION || table.is_empty() || file_id.is_empty() {
            return Err(format!("'{s}' is not a <table>.<file_id>.<retry>.{JOB_FILE_EXTENSION} name"));
        }
        let retry_count = retry
            .parse()
            .map_err(|_| format!("'{s}' has an invalid retry count"))?;
        Ok(Self {
            table: (*table).to_string(),
            file_id: (*file_id).to_string(),
            retry_count,
        })
    }
}
