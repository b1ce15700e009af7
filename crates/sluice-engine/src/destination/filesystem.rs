//! Local filesystem destination writing JSON lines.
//!
//! ```text
//! <root>/<dataset>/<table>/<load_id>.<file_id>.jsonl
//! <root>/<dataset>/_schema/<schema>.json   # newest schema of a completed load
//! <root>/<dataset>/_loads.jsonl
//! ```
//!
//! Merge tables are written like append tables; deduplication is left to
//! readers of the files.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sluice_types::error::DestinationError;
use sluice_types::ids::{LoadId, PipelineName};
use sluice_types::naming::STATE_TABLE;
use sluice_types::schema::{Schema, SchemaUpdate, WriteDisposition};
use sluice_types::state::SyncedState;

use super::{Destination, WriteJob};

const SCHEMA_DIR: &str = "_schema";
const LOADS_FILE: &str = "_loads.jsonl";

/// One line of `_loads.jsonl`.
#[derive(Debug, Deserialize)]
struct LoadRecord {
    load_id: String,
}

/// One row of the state table, as normalized.
#[derive(Debug, Deserialize)]
struct StateRow {
    version: u64,
    pipeline_name: String,
    state: String,
    #[serde(rename = "_load_id")]
    load_id: String,
}

/// Destination writing every table as a folder of JSON lines files.
#[derive(Debug)]
pub struct FilesystemDestination {
    dataset_dir: PathBuf,
    /// `(load_id, table)` pairs already truncated for `replace`.
    truncated: Mutex<HashSet<(String, String)>>,
}

impl FilesystemDestination {
    #[must_use]
    pub fn new(root: impl AsRef<Path>, dataset_name: &str) -> Self {
        Self {
            dataset_dir: root.as_ref().join(dataset_name),
            truncated: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    #[must_use]
    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.dataset_dir.join(table)
    }

    /// All rows of a table, file by file in name order.
    ///
    /// # Errors
    ///
    /// Returns a [`DestinationError`] if a file can't be read or parsed.
    pub fn read_table(&self, table: &str) -> Result<Vec<serde_json::Value>, DestinationError> {
        let mut rows = Vec::new();
        for path in table_files(&self.table_dir(table))? {
            let content = fs::read_to_string(&path).map_err(|e| DestinationError::io("read table file", &e))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                rows.push(serde_json::from_str(line).map_err(|e| {
                    DestinationError::data("INVALID_ROW", format!("{}: {e}", path.display()))
                })?);
            }
        }
        Ok(rows)
    }

    /// Load ids recorded by [`Destination::complete_load`].
    ///
    /// # Errors
    ///
    /// Returns a [`DestinationError`] if the loads file can't be read.
    pub fn completed_loads(&self) -> Result<HashSet<String>, DestinationError> {
        let path = self.dataset_dir.join(LOADS_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(DestinationError::io("read loads file", &e)),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<LoadRecord>(line)
                    .map(|r| r.load_id)
                    .map_err(|e| DestinationError::data("INVALID_LOAD_RECORD", e.to_string()))
            })
            .collect()
    }

    fn schema_path(&self, schema_name: &str) -> PathBuf {
        self.dataset_dir.join(SCHEMA_DIR).join(format!("{schema_name}.json"))
    }

    /// Keep the schema of a completed load unless a newer version is stored.
    fn store_schema(&self, schema: &Schema) -> Result<(), DestinationError> {
        let path = self.schema_path(&schema.name);
        if let Some(stored) = read_schema_file(&path)? {
            if stored.version > schema.version {
                return Ok(());
            }
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| DestinationError::io("create schema folder", &e))?;
        }
        let bytes = serde_json::to_vec_pretty(schema)
            .map_err(|e| DestinationError::internal("SCHEMA_ENCODE", e.to_string()))?;
        fs::write(&path, bytes).map_err(|e| DestinationError::io("write schema", &e))
    }

    /// Delete files of earlier loads, once per load and table.
    fn truncate_once(&self, load_id: &LoadId, table: &str) -> Result<(), DestinationError> {
        let mut truncated = self.truncated.lock().unwrap_or_else(PoisonError::into_inner);
        if !truncated.insert((load_id.to_string(), table.to_string())) {
            return Ok(());
        }
        let prefix = format!("{load_id}.");
        for path in table_files(&self.table_dir(table))? {
            let own = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&prefix));
            if !own {
                fs::remove_file(&path).map_err(|e| DestinationError::io("truncate table", &e))?;
            }
        }
        tracing::debug!(table, load_id = %load_id, "Truncated table for replace");
        Ok(())
    }
}

fn read_schema_file(path: &Path) -> Result<Option<Schema>, DestinationError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DestinationError::io("read schema", &e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| DestinationError::data("INVALID_SCHEMA", format!("{}: {e}", path.display())))
}

fn table_files(dir: &Path) -> Result<Vec<PathBuf>, DestinationError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DestinationError::io("list table files", &e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| DestinationError::io("list table files", &e))?
            .path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl Destination for FilesystemDestination {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn update_schema(&self, _schema: &Schema, update: &SchemaUpdate) -> Result<(), DestinationError> {
        for table in update.tables.keys() {
            let dir = self.table_dir(table);
            fs::create_dir_all(&dir).map_err(|e| DestinationError::io("create table folder", &e))?;
        }
        Ok(())
    }

    fn write_job(&self, job: &WriteJob) -> Result<(), DestinationError> {
        let table = &job.table.name;
        let dir = self.table_dir(table);
        fs::create_dir_all(&dir).map_err(|e| DestinationError::io("create table folder", &e))?;
        if job.root_table.write_disposition == WriteDisposition::Replace {
            self.truncate_once(&job.load_id, table)?;
        }
        let target = dir.join(format!("{}.{}.jsonl", job.load_id, job.job.file_id));
        fs::copy(&job.file_path, &target).map_err(|e| DestinationError::io("copy job file", &e))?;
        tracing::debug!(table, job = %job.job, "Job written");
        Ok(())
    }

    fn complete_load(&self, load_id: &LoadId, schema: &Schema) -> Result<(), DestinationError> {
        fs::create_dir_all(&self.dataset_dir)
            .map_err(|e| DestinationError::io("create dataset folder", &e))?;
        let record = json!({
            "load_id": load_id.as_str(),
            "schema_name": schema.name,
            "schema_version": schema.version,
            "schema_version_hash": schema.version_hash,
            "inserted_at": Utc::now().to_rfc3339(),
        });
        let path = self.dataset_dir.join(LOADS_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DestinationError::io("open loads file", &e))?;
        writeln!(file, "{record}").map_err(|e| DestinationError::io("append loads file", &e))?;
        self.store_schema(schema)
    }

    fn get_stored_schema(&self, schema_name: &str) -> Result<Option<Schema>, DestinationError> {
        read_schema_file(&self.schema_path(schema_name))
    }

    fn get_stored_state(&self, pipeline_name: &PipelineName) -> Result<Option<SyncedState>, DestinationError> {
        let completed = self.completed_loads()?;
        let newest = self
            .read_table(STATE_TABLE)?
            .into_iter()
            .filter_map(|row| serde_json::from_value::<StateRow>(row).ok())
            .filter(|row| row.pipeline_name == pipeline_name.as_str() && completed.contains(&row.load_id))
            .max_by_key(|row| row.version);
        let Some(row) = newest else {
            return Ok(None);
        };
        serde_json::from_str(&row.state)
            .map(Some)
            .map_err(|e| DestinationError::data("INVALID_STATE", e.to_string()))
    }
}
