//! On-disk load package storage.
//!
//! ```text
//! <root>/new/<load_id>/          extraction in progress
//! <root>/extracted/<load_id>/    schema.json, new_jobs/<table>.<file_id>.0.jsonl
//! <root>/normalized/<load_id>/   schema.json, schema_updates.json, <job folders>
//! <root>/loaded/<load_id>/       ... plus package_state
//! ```
//!
//! A job's state is the folder its file lives in. Moving a file between
//! folders is a single rename, so a crash never leaves a job in two states.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_types::ids::LoadId;
use sluice_types::package::{JobFileName, JobState, LoadOutcome, PackageState};
use sluice_types::schema::{Schema, SchemaUpdate};

pub const SCHEMA_FILE: &str = "schema.json";
pub const SCHEMA_UPDATES_FILE: &str = "schema_updates.json";
pub const APPLIED_SCHEMA_UPDATE_FILE: &str = "applied_schema_update.json";
pub const PACKAGE_STATE_FILE: &str = "package_state";
const LOCK_FILE: &str = ".load.lock";
const EXCEPTION_EXTENSION: &str = "exception";
const PARTIAL_SUFFIX: &str = ".partial";

static LAST_LOAD_ID_MICROS: AtomicU64 = AtomicU64::new(0);

/// Errors raised by [`PackageStorage`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("load package {load_id} not found")]
    PackageNotFound { load_id: LoadId },

    /// Another load attempt owns the package.
    #[error("load package {load_id} is locked by another load attempt")]
    PackageLocked { load_id: LoadId },
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Package introspection
// ---------------------------------------------------------------------------

/// One job of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub file_name: String,
    pub table: String,
    pub job_id: String,
    pub retry_count: u32,
    pub state: JobState,
    pub file_size: u64,
    /// Last error of a failed job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_message: Option<String>,
}

/// Snapshot of a package for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct LoadPackageInfo {
    pub load_id: LoadId,
    pub state: PackageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<LoadOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub schema_update: SchemaUpdate,
    pub jobs: BTreeMap<JobState, Vec<JobInfo>>,
}

impl LoadPackageInfo {
    #[must_use]
    pub fn jobs_in(&self, state: JobState) -> &[JobInfo] {
        self.jobs.get(&state).map_or(&[], Vec::as_slice)
    }

    /// Some jobs were attempted already.
    #[must_use]
    pub fn is_partially_loaded(&self) -> bool {
        [JobState::Started, JobState::Completed, JobState::Failed]
            .iter()
            .any(|s| !self.jobs_in(*s).is_empty())
    }
}

// ---------------------------------------------------------------------------
// PackageStorage
// ---------------------------------------------------------------------------

/// Filesystem layout of all load packages of one pipeline.
#[derive(Debug, Clone)]
pub struct PackageStorage {
    root: PathBuf,
}

impl PackageStorage {
    /// Open the storage, creating the state folders if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if a folder can't be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let storage = Self { root: root.into() };
        for state in [
            PackageState::New,
            PackageState::Extracted,
            PackageState::Normalized,
            PackageState::Loaded,
        ] {
            let dir = storage.root.join(state.as_str());
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        Ok(storage)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn package_dir(&self, state: PackageState, load_id: &LoadId) -> PathBuf {
        self.root.join(state.as_str()).join(load_id.as_str())
    }

    /// Mint a load id greater than every id minted in this process and every
    /// package already in storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the package folders can't be listed.
    pub fn new_load_id(&self) -> Result<LoadId> {
        let mut floor = 0;
        for state in [
            PackageState::New,
            PackageState::Extracted,
            PackageState::Normalized,
            PackageState::Loaded,
        ] {
            if let Some(max) = self
                .list_packages(state)?
                .iter()
                .filter_map(LoadId::as_micros)
                .max()
            {
                floor = floor.max(max);
            }
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX));

        let mut last = LAST_LOAD_ID_MICROS.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1).max(floor + 1);
            match LAST_LOAD_ID_MICROS.compare_exchange_weak(
                last,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(LoadId::from_micros(next)),
                Err(actual) => last = actual,
            }
        }
    }

    /// Create an empty package in `new/`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the folders can't be created.
    pub fn create_package(&self, load_id: &LoadId) -> Result<PathBuf> {
        let dir = self.package_dir(PackageState::New, load_id);
        let jobs = dir.join(JobState::New.folder());
        fs::create_dir_all(&jobs).map_err(io_err(&jobs))?;
        Ok(dir)
    }

    /// Move a package between state folders.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PackageNotFound`] if the package is not in
    /// `from`, or [`StorageError::Io`] if the rename fails.
    pub fn move_package(&self, load_id: &LoadId, from: PackageState, to: PackageState) -> Result<PathBuf> {
        let src = self.package_dir(from, load_id);
        if !src.exists() {
            return Err(StorageError::PackageNotFound {
                load_id: load_id.clone(),
            });
        }
        let dst = self.package_dir(to, load_id);
        fs::rename(&src, &dst).map_err(io_err(&src))?;
        Ok(dst)
    }

    /// Delete a package if present.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if removal fails.
    pub fn delete_package(&self, state: PackageState, load_id: &LoadId) -> Result<()> {
        remove_dir_if_exists(&self.package_dir(state, load_id))
    }

    /// Packages in `state`, oldest first. In-progress `.partial` folders are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the folder can't be read.
    pub fn list_packages(&self, state: PackageState) -> Result<Vec<LoadId>> {
        let dir = self.root.join(state.as_str());
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            ids.push(LoadId::new(name));
        }
        ids.sort();
        Ok(ids)
    }

    /// Extracted or normalized packages exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if a folder can't be read.
    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.list_packages(PackageState::Extracted)?.is_empty()
            || !self.list_packages(PackageState::Normalized)?.is_empty())
    }

    /// Folder of a package currently in `state`, as `<load_id>.partial`, for
    /// building a package before publishing it with [`PackageStorage::publish_partial`].
    #[must_use]
    pub fn partial_dir(&self, state: PackageState, load_id: &LoadId) -> PathBuf {
        self.root
            .join(state.as_str())
            .join(format!("{load_id}{PARTIAL_SUFFIX}"))
    }

    /// Publish a `.partial` folder under its final name.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the rename fails.
    pub fn publish_partial(&self, state: PackageState, load_id: &LoadId) -> Result<PathBuf> {
        let src = self.partial_dir(state, load_id);
        let dst = self.package_dir(state, load_id);
        fs::rename(&src, &dst).map_err(io_err(&src))?;
        Ok(dst)
    }

    // -----------------------------------------------------------------------
    // Schema files
    // -----------------------------------------------------------------------

    /// Write `value` as pretty JSON into `dir/name`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Json`] or [`StorageError::Io`].
    pub fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
        let path = dir.join(name);
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, bytes).map_err(io_err(&path))
    }

    /// Read JSON from `dir/name`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Json`] or [`StorageError::Io`].
    pub fn read_json<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
        let path = dir.join(name);
        let bytes = fs::read(&path).map_err(io_err(&path))?;
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Json { path, source })
    }

    /// Schema snapshot stored in a package.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the file is missing or corrupt.
    pub fn read_schema(&self, state: PackageState, load_id: &LoadId) -> Result<Schema> {
        Self::read_json(&self.package_dir(state, load_id), SCHEMA_FILE)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    fn job_path(&self, state: PackageState, load_id: &LoadId, job_state: JobState, job: &JobFileName) -> PathBuf {
        self.package_dir(state, load_id)
            .join(job_state.folder())
            .join(job.to_string())
    }

    /// Jobs of a package in `job_state`, sorted by file name.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the folder exists but can't be read.
    pub fn list_jobs(&self, state: PackageState, load_id: &LoadId, job_state: JobState) -> Result<Vec<JobFileName>> {
        list_job_files(&self.package_dir(state, load_id).join(job_state.folder()))
    }

    /// Path of a job file in a normalized package.
    #[must_use]
    pub fn normalized_job_path(&self, load_id: &LoadId, job_state: JobState, job: &JobFileName) -> PathBuf {
        self.job_path(PackageState::Normalized, load_id, job_state, job)
    }

    fn move_job(&self, load_id: &LoadId, job: &JobFileName, from: JobState, to: JobState, renamed: &JobFileName) -> Result<PathBuf> {
        let src = self.job_path(PackageState::Normalized, load_id, from, job);
        let dst_dir = self.package_dir(PackageState::Normalized, load_id).join(to.folder());
        fs::create_dir_all(&dst_dir).map_err(io_err(&dst_dir))?;
        let dst = dst_dir.join(renamed.to_string());
        fs::rename(&src, &dst).map_err(io_err(&src))?;
        Ok(dst)
    }

    /// `new` → `started`. Returns the path of the started job file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the rename fails.
    pub fn start_job(&self, load_id: &LoadId, job: &JobFileName) -> Result<PathBuf> {
        self.move_job(load_id, job, JobState::New, JobState::Started, job)
    }

    /// `started` → `completed`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the rename fails.
    pub fn complete_job(&self, load_id: &LoadId, job: &JobFileName) -> Result<()> {
        self.move_job(load_id, job, JobState::Started, JobState::Completed, job)
            .map(drop)
    }

    /// `started` → `failed`, recording `message` next to the job file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the rename or the write fails.
    pub fn fail_job(&self, load_id: &LoadId, job: &JobFileName, message: &str) -> Result<()> {
        let dst = self.move_job(load_id, job, JobState::Started, JobState::Failed, job)?;
        let exception = exception_path(&dst);
        fs::write(&exception, message).map_err(io_err(&exception))
    }

    /// `started` → `new` with the retry count incremented.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the rename fails.
    pub fn retry_job(&self, load_id: &LoadId, job: &JobFileName) -> Result<JobFileName> {
        let next = job.with_retry(job.retry_count + 1);
        self.move_job(load_id, job, JobState::Started, JobState::New, &next)?;
        Ok(next)
    }

    /// Put jobs left in `started` by an interrupted attempt back into `new`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if a rename fails.
    pub fn requeue_started_jobs(&self, load_id: &LoadId) -> Result<Vec<JobFileName>> {
        self.list_jobs(PackageState::Normalized, load_id, JobState::Started)?
            .iter()
            .map(|job| self.retry_job(load_id, job))
            .collect()
    }

    /// Take exclusive ownership of a normalized package for one load attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PackageLocked`] if another attempt holds it.
    pub fn lock_package(&self, load_id: &LoadId) -> Result<PackageLock> {
        let path = self
            .package_dir(PackageState::Normalized, load_id)
            .join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id()).map_err(io_err(&path))?;
                Ok(PackageLock { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StorageError::PackageLocked {
                load_id: load_id.clone(),
            }),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Record the outcome and move the package to `loaded/`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the write or the move fails.
    pub fn complete_package(&self, load_id: &LoadId, outcome: LoadOutcome) -> Result<PathBuf> {
        let dir = self.package_dir(PackageState::Normalized, load_id);
        let state_file = dir.join(PACKAGE_STATE_FILE);
        fs::write(&state_file, outcome.as_str()).map_err(io_err(&state_file))?;
        let lock = dir.join(LOCK_FILE);
        if lock.exists() {
            fs::remove_file(&lock).map_err(io_err(&lock))?;
        }
        self.move_package(load_id, PackageState::Normalized, PackageState::Loaded)
    }

    /// Find the state folder a package is in.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PackageNotFound`] if it is in none.
    pub fn package_state(&self, load_id: &LoadId) -> Result<PackageState> {
        [
            PackageState::Loaded,
            PackageState::Normalized,
            PackageState::Extracted,
            PackageState::New,
        ]
        .into_iter()
        .find(|s| self.package_dir(*s, load_id).is_dir())
        .ok_or_else(|| StorageError::PackageNotFound {
            load_id: load_id.clone(),
        })
    }

    /// Describe a package and all of its jobs.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PackageNotFound`] for unknown packages.
    pub fn package_info(&self, load_id: &LoadId) -> Result<LoadPackageInfo> {
        let state = self.package_state(load_id)?;
        let dir = self.package_dir(state, load_id);

        let outcome = fs::read_to_string(dir.join(PACKAGE_STATE_FILE))
            .ok()
            .and_then(|s| s.parse().ok());
        let schema_name = Self::read_json::<Schema>(&dir, SCHEMA_FILE)
            .ok()
            .map(|s| s.name);
        let schema_update = if dir.join(SCHEMA_UPDATES_FILE).exists() {
            Self::read_json(&dir, SCHEMA_UPDATES_FILE)?
        } else {
            SchemaUpdate::default()
        };

        let mut jobs = BTreeMap::new();
        for job_state in JobState::ALL {
            let folder = dir.join(job_state.folder());
            let mut infos = Vec::new();
            for job in list_job_files(&folder)? {
                let path = folder.join(job.to_string());
                let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let failed_message = (job_state == JobState::Failed)
                    .then(|| fs::read_to_string(exception_path(&path)).ok())
                    .flatten();
                infos.push(JobInfo {
                    file_name: job.to_string(),
                    table: job.table.clone(),
                    job_id: job.job_id(),
                    retry_count: job.retry_count,
                    state: job_state,
                    file_size,
                    failed_message,
                });
            }
            if !infos.is_empty() {
                jobs.insert(job_state, infos);
            }
        }

        Ok(LoadPackageInfo {
            load_id: load_id.clone(),
            state,
            outcome,
            schema_name,
            schema_update,
            jobs,
        })
    }

    /// Delete packages that were not loaded yet. Normalized packages with
    /// attempted jobs survive unless `with_partial_loads` is set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if listing or removal fails.
    pub fn drop_pending(&self, with_partial_loads: bool) -> Result<Vec<LoadId>> {
        let mut dropped = Vec::new();
        for state in [PackageState::New, PackageState::Extracted] {
            for load_id in self.list_packages(state)? {
                self.delete_package(state, &load_id)?;
                dropped.push(load_id);
            }
        }
        for load_id in self.list_packages(PackageState::Normalized)? {
            if !with_partial_loads && self.package_info(&load_id)?.is_partially_loaded() {
                tracing::info!(load_id = %load_id, "Keeping partially loaded package");
                continue;
            }
            self.delete_package(PackageState::Normalized, &load_id)?;
            dropped.push(load_id);
        }
        Ok(dropped)
    }
}

/// Held for the duration of a load attempt; releases the package on drop.
#[derive(Debug)]
pub struct PackageLock {
    path: PathBuf,
}

impl Drop for PackageLock {
    fn drop(&mut self) {
        // The package may have moved to `loaded/` already, taking the file along.
        let _ = fs::remove_file(&self.path);
    }
}

fn exception_path(job_path: &Path) -> PathBuf {
    let mut name = job_path.as_os_str().to_owned();
    name.push(".");
    name.push(EXCEPTION_EXTENSION);
    PathBuf::from(name)
}

fn list_job_files(dir: &Path) -> Result<Vec<JobFileName>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };
    let mut jobs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        if let Ok(job) = entry.file_name().to_string_lossy().parse::<JobFileName>() {
            jobs.push(job);
        }
    }
    jobs.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    Ok(jobs)
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(dir)(e)),
    }
}

// ---------------------------------------------------------------------------
// PackageWriter
// ---------------------------------------------------------------------------

struct OpenJobFile {
    writer: BufWriter<File>,
    path: PathBuf,
    items: usize,
}

/// Appends rows to per-table job files of one package, rotating files after
/// `max_items` rows. File ids are unique within the package.
pub(crate) struct PackageWriter {
    jobs_dir: PathBuf,
    max_items: usize,
    file_id_prefix: String,
    next_file_id: u32,
    open: HashMap<String, OpenJobFile>,
}

impl PackageWriter {
    pub(crate) fn new(jobs_dir: PathBuf, max_items: usize) -> Self {
        Self {
            jobs_dir,
            max_items: max_items.max(1),
            file_id_prefix: String::new(),
            next_file_id: 0,
            open: HashMap::new(),
        }
    }

    /// Prefix file ids, so several writers can share one jobs folder.
    pub(crate) fn with_file_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_id_prefix = prefix.into();
        self
    }

    fn open_file(&mut self, table: &str) -> Result<OpenJobFile> {
        let job = JobFileName::new(
            table,
            format!("{}{:06}", self.file_id_prefix, self.next_file_id),
        );
        self.next_file_id += 1;
        let path = self.jobs_dir.join(job.to_string());
        let file = File::create(&path).map_err(io_err(&path))?;
        Ok(OpenJobFile {
            writer: BufWriter::new(file),
            path,
            items: 0,
        })
    }

    pub(crate) fn write_row(&mut self, table: &str, row: &serde_json::Value) -> Result<()> {
        let rotate = self
            .open
            .get(table)
            .map_or(true, |f| f.items >= self.max_items);
        if rotate {
            if let Some(mut full) = self.open.remove(table) {
                full.writer.flush().map_err(io_err(&full.path))?;
            }
            let fresh = self.open_file(table)?;
            self.open.insert(table.to_string(), fresh);
        }
        let Some(file) = self.open.get_mut(table) else {
            unreachable!("job file for '{table}' opened above");
        };
        serde_json::to_writer(&mut file.writer, row).map_err(|source| StorageError::Json {
            path: file.path.clone(),
            source,
        })?;
        file.writer.write_all(b"\n").map_err(io_err(&file.path))?;
        file.items += 1;
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> Result<()> {
        for (_, mut file) in self.open.drain() {
            file.writer.flush().map_err(io_err(&file.path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> (tempfile::TempDir, PackageStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = PackageStorage::open(dir.path().join("load")).unwrap();
        (dir, storage)
    }

    fn normalized_package(storage: &PackageStorage, jobs: &[&str]) -> LoadId {
        let load_id = storage.new_load_id().unwrap();
        let dir = storage.create_package(&load_id).unwrap();
        for job in jobs {
            fs::write(dir.join("new_jobs").join(job), "{}\n").unwrap();
        }
        PackageStorage::write_json(&dir, SCHEMA_FILE, &Schema::new("s")).unwrap();
        storage
            .move_package(&load_id, PackageState::New, PackageState::Extracted)
            .unwrap();
        storage
            .move_package(&load_id, PackageState::Extracted, PackageState::Normalized)
            .unwrap();
        load_id
    }

    #[test]
    fn load_ids_strictly_increase() {
        let (_dir, storage) = storage();
        let a = storage.new_load_id().unwrap();
        let b = storage.new_load_id().unwrap();
        assert!(b > a, "{b} should be after {a}");
    }

    #[test]
    fn load_ids_stay_above_existing_packages() {
        let (_dir, storage) = storage();
        let future = LoadId::from_micros(u64::MAX / 2);
        fs::create_dir_all(storage.package_dir(PackageState::Loaded, &future)).unwrap();
        let next = storage.new_load_id().unwrap();
        assert!(next.as_micros().unwrap() > future.as_micros().unwrap());
    }

    #[test]
    fn job_lifecycle_moves_files() {
        let (_dir, storage) = storage();
        let load_id = normalized_package(&storage, &["users.000000.0.jsonl"]);
        let job: JobFileName = "users.000000.0.jsonl".parse().unwrap();

        storage.start_job(&load_id, &job).unwrap();
        let retried = storage.retry_job(&load_id, &job).unwrap();
        assert_eq!(retried.to_string(), "users.000000.1.jsonl");
        storage.start_job(&load_id, &retried).unwrap();
        storage.fail_job(&load_id, &retried, "[schema] X: boom").unwrap();

        let info = storage.package_info(&load_id).unwrap();
        assert_eq!(info.state, PackageState::Normalized);
        assert!(info.jobs_in(JobState::New).is_empty());
        let failed = info.jobs_in(JobState::Failed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(failed[0].failed_message.as_deref(), Some("[schema] X: boom"));
        assert!(info.is_partially_loaded());
    }

    #[test]
    fn requeue_started_after_crash() {
        let (_dir, storage) = storage();
        let load_id = normalized_package(&storage, &["t.000000.0.jsonl"]);
        let job: JobFileName = "t.000000.0.jsonl".parse().unwrap();
        storage.start_job(&load_id, &job).unwrap();

        let requeued = storage.requeue_started_jobs(&load_id).unwrap();
        assert_eq!(requeued[0].retry_count, 1);
        assert_eq!(
            storage
                .list_jobs(PackageState::Normalized, &load_id, JobState::New)
                .unwrap(),
            requeued
        );
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let (_dir, storage) = storage();
        let load_id = normalized_package(&storage, &[]);

        let lock = storage.lock_package(&load_id).unwrap();
        assert!(matches!(
            storage.lock_package(&load_id),
            Err(StorageError::PackageLocked { .. })
        ));
        drop(lock);
        assert!(storage.lock_package(&load_id).is_ok());
    }

    #[test]
    fn complete_package_records_outcome() {
        let (_dir, storage) = storage();
        let load_id = normalized_package(&storage, &[]);
        let _lock = storage.lock_package(&load_id).unwrap();
        storage
            .complete_package(&load_id, LoadOutcome::Aborted)
            .unwrap();

        let info = storage.package_info(&load_id).unwrap();
        assert_eq!(info.state, PackageState::Loaded);
        assert_eq!(info.outcome, Some(LoadOutcome::Aborted));
        assert_eq!(info.schema_name.as_deref(), Some("s"));
        assert!(!storage.has_pending().unwrap());
    }

    #[test]
    fn drop_pending_respects_partial_loads() {
        let (_dir, storage) = storage();
        let untouched = normalized_package(&storage, &["a.000000.0.jsonl"]);
        let partial = normalized_package(&storage, &["b.000000.0.jsonl", "b.000001.0.jsonl"]);
        let job: JobFileName = "b.000000.0.jsonl".parse().unwrap();
        storage.start_job(&partial, &job).unwrap();
        storage.complete_job(&partial, &job).unwrap();

        let dropped = storage.drop_pending(false).unwrap();
        assert_eq!(dropped, vec![untouched]);
        assert_eq!(
            storage.list_packages(PackageState::Normalized).unwrap(),
            vec![partial.clone()]
        );

        let dropped = storage.drop_pending(true).unwrap();
        assert_eq!(dropped, vec![partial]);
        assert!(!storage.has_pending().unwrap());
    }

    #[test]
    fn partial_folders_are_invisible_until_published() {
        let (_dir, storage) = storage();
        let load_id = storage.new_load_id().unwrap();
        fs::create_dir_all(storage.partial_dir(PackageState::Normalized, &load_id)).unwrap();
        assert!(storage
            .list_packages(PackageState::Normalized)
            .unwrap()
            .is_empty());
        storage
            .publish_partial(PackageState::Normalized, &load_id)
            .unwrap();
        assert_eq!(
            storage.list_packages(PackageState::Normalized).unwrap(),
            vec![load_id]
        );
    }

    #[test]
    fn writer_rotates_files_with_unique_ids() {
        let (_dir, storage) = storage();
        let load_id = storage.new_load_id().unwrap();
        let dir = storage.create_package(&load_id).unwrap();
        let mut writer = PackageWriter::new(dir.join("new_jobs"), 2);
        for i in 0..3 {
            writer.write_row("a", &json!({"i": i})).unwrap();
        }
        writer.write_row("b", &json!({"i": 0})).unwrap();
        writer.finish().unwrap();

        let jobs: Vec<String> = storage
            .list_jobs(PackageState::New, &load_id, JobState::New)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            jobs,
            vec!["a.000000.0.jsonl", "a.000001.0.jsonl", "b.000002.0.jsonl"]
        );
        let first = fs::read_to_string(dir.join("new_jobs/a.000000.0.jsonl")).unwrap();
        assert_eq!(first.lines().count(), 2);
    }
}
