//! Loads one normalized package into a destination.

use std::sync::Arc;
use std::time::Duration;

use sluice_types::error::DestinationError;
use sluice_types::ids::LoadId;
use sluice_types::package::{JobFileName, JobState, LoadOutcome, PackageState};
use sluice_types::schema::{Schema, SchemaUpdate, Table};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::storage::{PackageStorage, APPLIED_SCHEMA_UPDATE_FILE, SCHEMA_UPDATES_FILE};
use crate::config::types::LoadSettings;
use crate::destination::{Destination, WriteJob};
use crate::errors::{compute_backoff, LoadError};
use crate::result::{FailedJob, PackageLoadInfo};

/// Everything a load attempt needs from its pipeline.
#[derive(Clone)]
pub(crate) struct LoadContext {
    pub storage: PackageStorage,
    pub destination: Arc<dyn Destination>,
    pub settings: LoadSettings,
}

enum JobOutcome {
    Completed,
    Failed { job: JobFileName, error: DestinationError },
}

/// Run one load attempt of a normalized package.
///
/// # Errors
///
/// Returns [`LoadError::JobFailed`] when a job failed and failed jobs are
/// fatal (the package is then completed as aborted), or the error that
/// interrupted the attempt. An interrupted package stays in `normalized/`
/// and resumes with its pending jobs on the next attempt.
pub(crate) async fn load_package(ctx: &LoadContext, load_id: &LoadId) -> Result<PackageLoadInfo, LoadError> {
    let _lock = ctx.storage.lock_package(load_id)?;
    let requeued = ctx.storage.requeue_started_jobs(load_id)?;
    if !requeued.is_empty() {
        tracing::warn!(load_id = %load_id, jobs = requeued.len(), "Requeued jobs of an interrupted load");
    }

    let schema = Arc::new(ctx.storage.read_schema(PackageState::Normalized, load_id)?);
    apply_schema_update(ctx, load_id, &schema).await?;

    let jobs = ctx
        .storage
        .list_jobs(PackageState::Normalized, load_id, JobState::New)?;
    tracing::info!(
        destination = ctx.destination.name(),
        load_id = %load_id,
        jobs = jobs.len(),
        workers = ctx.settings.workers,
        "Loading package"
    );

    let failures = run_jobs(ctx, load_id, &schema, jobs).await?;
    let fatal = ctx.settings.raise_on_failed_jobs && !failures.is_empty();
    if fatal {
        ctx.storage.complete_package(load_id, LoadOutcome::Aborted)?;
        let (job, error) = failures
            .into_iter()
            .next()
            .map(|(job, error)| (job.job_id(), error))
            .unwrap_or_else(|| (String::new(), DestinationError::internal("UNKNOWN", "job failed")));
        tracing::error!(load_id = %load_id, job, "Package aborted on failed job");
        return Err(LoadError::JobFailed {
            destination: ctx.destination.name().to_string(),
            load_id: load_id.clone(),
            job,
            terminal: error.is_terminal(),
            error: error.to_string(),
        });
    }

    {
        let destination = Arc::clone(&ctx.destination);
        let load_id = load_id.clone();
        let schema = Arc::clone(&schema);
        tokio::task::spawn_blocking(move || destination.complete_load(&load_id, &schema))
            .await
            .map_err(|e| task_failed("complete load", &e))?
            .map_err(|source| LoadError::CompleteLoad {
                destination: ctx.destination.name().to_string(),
                source,
            })?;
    }
    ctx.storage.complete_package(load_id, LoadOutcome::Loaded)?;
    let info = package_load_info(&ctx.storage, load_id, LoadOutcome::Loaded, &schema)?;
    if ctx.settings.delete_completed_packages {
        ctx.storage.delete_package(PackageState::Loaded, load_id)?;
    }

    tracing::info!(
        load_id = %load_id,
        completed = info.completed_jobs.len(),
        failed = info.failed_jobs.len(),
        "Package loaded"
    );
    Ok(info)
}

/// Summary of a package in `loaded/`.
pub(crate) fn package_load_info(
    storage: &PackageStorage,
    load_id: &LoadId,
    outcome: LoadOutcome,
    schema: &Schema,
) -> Result<PackageLoadInfo, LoadError> {
    let info = storage.package_info(load_id)?;
    Ok(PackageLoadInfo {
        load_id: load_id.clone(),
        outcome: info.outcome.unwrap_or(outcome),
        schema_name: schema.name.clone(),
        completed_jobs: info
            .jobs_in(JobState::Completed)
            .iter()
            .map(|j| j.job_id.clone())
            .collect(),
        failed_jobs: info
            .jobs_in(JobState::Failed)
            .iter()
            .map(|j| FailedJob {
                job_id: j.job_id.clone(),
                file_name: j.file_name.clone(),
                retry_count: j.retry_count,
                message: j.failed_message.clone(),
            })
            .collect(),
    })
}

fn task_failed(what: &str, e: &tokio::task::JoinError) -> LoadError {
    LoadError::TaskFailed {
        message: format!("{what} task panicked: {e}"),
    }
}

/// Apply the package's schema update once, before any job runs.
async fn apply_schema_update(ctx: &LoadContext, load_id: &LoadId, schema: &Arc<Schema>) -> Result<(), LoadError> {
    let dir = ctx.storage.package_dir(PackageState::Normalized, load_id);
    if dir.join(APPLIED_SCHEMA_UPDATE_FILE).exists() {
        return Ok(());
    }
    let update: SchemaUpdate = if dir.join(SCHEMA_UPDATES_FILE).exists() {
        PackageStorage::read_json(&dir, SCHEMA_UPDATES_FILE)?
    } else {
        SchemaUpdate::default()
    };

    let destination = Arc::clone(&ctx.destination);
    let schema = Arc::clone(schema);
    let applied = update.clone();
    tokio::task::spawn_blocking(move || destination.update_schema(&schema, &applied))
        .await
        .map_err(|e| task_failed("schema update", &e))?
        .map_err(|source| LoadError::SchemaUpdate {
            destination: ctx.destination.name().to_string(),
            source,
        })?;

    PackageStorage::write_json(&dir, APPLIED_SCHEMA_UPDATE_FILE, &update)?;
    tracing::debug!(load_id = %load_id, tables = update.tables.len(), "Schema update applied");
    Ok(())
}

/// Run all jobs concurrently. Returns the jobs that failed, in job order.
async fn run_jobs(
    ctx: &LoadContext,
    load_id: &LoadId,
    schema: &Arc<Schema>,
    jobs: Vec<JobFileName>,
) -> Result<Vec<(JobFileName, DestinationError)>, LoadError> {
    let semaphore = Arc::new(Semaphore::new(ctx.settings.workers.max(1)));
    let mut join_set = JoinSet::new();
    for job in jobs {
        let ctx = ctx.clone();
        let load_id = load_id.clone();
        let schema = Arc::clone(schema);
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|e| LoadError::TaskFailed {
                message: format!("load semaphore closed: {e}"),
            })?;
            run_job(&ctx, &load_id, &schema, job).await
        });
    }

    let mut failures = Vec::new();
    let mut first_error: Option<LoadError> = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(JobOutcome::Completed)) => {}
            Ok(Ok(JobOutcome::Failed { job, error })) => failures.push((job, error)),
            Ok(Err(error)) => {
                tracing::error!(load_id = %load_id, "Load worker failed: {error}");
                if first_error.is_none() {
                    first_error = Some(error);
                    join_set.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {
                // Cancelled after the first failure; started jobs are requeued
                // by the next attempt.
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(task_failed("load job", &join_err));
                    join_set.abort_all();
                }
            }
        }
    }

    if let Some(error) = first_error {
        return Err(error);
    }
    failures.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(failures)
}

fn scaled(delay: Duration, multiplier: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier).unwrap_or(Duration::ZERO)
}

/// Attempt one job until it completes, fails terminally or runs out of retries.
async fn run_job(
    ctx: &LoadContext,
    load_id: &LoadId,
    schema: &Schema,
    mut job: JobFileName,
) -> Result<JobOutcome, LoadError> {
    let max_retries = ctx.settings.max_retries;
    let table = schema
        .table(&job.table)
        .cloned()
        .unwrap_or_else(|| Table::new(job.table.clone()));
    let root_table = schema.root_table(&table).clone();

    loop {
        let file_path = ctx.storage.start_job(load_id, &job)?;
        let request = WriteJob {
            load_id: load_id.clone(),
            job: job.clone(),
            table: table.clone(),
            root_table: root_table.clone(),
            schema_name: schema.name.clone(),
            file_path,
        };
        let destination = Arc::clone(&ctx.destination);
        let result = tokio::task::spawn_blocking(move || destination.write_job(&request))
            .await
            .map_err(|e| task_failed("write job", &e))?;

        match result {
            Ok(()) => {
                ctx.storage.complete_job(load_id, &job)?;
                tracing::debug!(load_id = %load_id, job = %job, "Job completed");
                return Ok(JobOutcome::Completed);
            }
            Err(error) if error.retryable && job.retry_count < max_retries => {
                let attempt = job.retry_count + 1;
                let delay = scaled(compute_backoff(&error, attempt), ctx.settings.backoff_multiplier);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    load_id = %load_id,
                    job = %job,
                    attempt,
                    max_retries,
                    delay_ms,
                    category = %error.category,
                    code = %error.code,
                    "Retryable error, will retry"
                );
                job = ctx.storage.retry_job(load_id, &job)?;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(error) => {
                if error.retryable {
                    tracing::error!(
                        load_id = %load_id,
                        job = %job,
                        max_retries,
                        category = %error.category,
                        code = %error.code,
                        "Max retries exhausted, failing job"
                    );
                } else {
                    tracing::error!(
                        load_id = %load_id,
                        job = %job,
                        category = %error.category,
                        code = %error.code,
                        "Terminal destination error, failing job"
                    );
                }
                ctx.storage.fail_job(load_id, &job, &error.to_string())?;
                return Ok(JobOutcome::Failed { job, error });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use sluice_types::ids::PipelineName;
    use sluice_types::state::SyncedState;

    use crate::load::storage::{StorageError, SCHEMA_FILE};

    /// Destination failing jobs with scripted errors, keyed by table.
    #[derive(Default)]
    struct Scripted {
        failures: Mutex<HashMap<String, VecDeque<DestinationError>>>,
        written: Mutex<Vec<String>>,
        schema_updates: AtomicUsize,
        complete_failures: Mutex<VecDeque<DestinationError>>,
        completed: Mutex<Vec<LoadId>>,
    }

    impl Scripted {
        fn fail(self, table: &str, errors: impl IntoIterator<Item = DestinationError>) -> Self {
            self.failures
                .lock()
                .unwrap()
                .insert(table.to_string(), errors.into_iter().collect());
            self
        }
    }

    impl Destination for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn update_schema(&self, _: &Schema, _: &SchemaUpdate) -> Result<(), DestinationError> {
            self.schema_updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn write_job(&self, job: &WriteJob) -> Result<(), DestinationError> {
            let scripted = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&job.table.name)
                .and_then(VecDeque::pop_front);
            if let Some(error) = scripted {
                return Err(error);
            }
            self.written.lock().unwrap().push(job.job.job_id());
            Ok(())
        }

        fn complete_load(&self, load_id: &LoadId, _: &Schema) -> Result<(), DestinationError> {
            if let Some(error) = self.complete_failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            self.completed.lock().unwrap().push(load_id.clone());
            Ok(())
        }

        fn get_stored_state(&self, _: &PipelineName) -> Result<Option<SyncedState>, DestinationError> {
            Ok(None)
        }
    }

    fn settings(max_retries: u32, raise_on_failed_jobs: bool) -> LoadSettings {
        LoadSettings {
            workers: 4,
            max_retries,
            raise_on_failed_jobs,
            backoff_multiplier: 0.0,
            delete_completed_packages: false,
        }
    }

    fn context(dir: &tempfile::TempDir, destination: Scripted, settings: LoadSettings) -> (LoadContext, Arc<Scripted>) {
        let destination = Arc::new(destination);
        let ctx = LoadContext {
            storage: PackageStorage::open(dir.path().join("load")).unwrap(),
            destination: Arc::clone(&destination) as Arc<dyn Destination>,
            settings,
        };
        (ctx, destination)
    }

    fn normalized_package(storage: &PackageStorage, tables: &[&str]) -> LoadId {
        let load_id = storage.new_load_id().unwrap();
        let dir = storage.create_package(&load_id).unwrap();
        let mut schema = Schema::new("s");
        for (i, table) in tables.iter().enumerate() {
            schema.get_or_insert_table(table);
            fs::write(dir.join("new_jobs").join(format!("{table}.{i:06}.0.jsonl")), "{\"a\":1}\n").unwrap();
        }
        let update = SchemaUpdate {
            tables: schema.tables.clone(),
        };
        PackageStorage::write_json(&dir, SCHEMA_FILE, &schema).unwrap();
        PackageStorage::write_json(&dir, SCHEMA_UPDATES_FILE, &update).unwrap();
        storage
            .move_package(&load_id, PackageState::New, PackageState::Extracted)
            .unwrap();
        storage
            .move_package(&load_id, PackageState::Extracted, PackageState::Normalized)
            .unwrap();
        load_id
    }

    #[tokio::test]
    async fn all_jobs_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, dest) = context(&dir, Scripted::default(), settings(3, false));
        let load_id = normalized_package(&ctx.storage, &["a", "b", "c"]);

        let info = load_package(&ctx, &load_id).await.unwrap();
        assert_eq!(info.outcome, LoadOutcome::Loaded);
        assert_eq!(info.completed_jobs.len(), 3);
        assert!(info.failed_jobs.is_empty());
        assert_eq!(dest.schema_updates.load(Ordering::SeqCst), 1);
        assert_eq!(*dest.completed.lock().unwrap(), vec![load_id.clone()]);
        assert_eq!(ctx.storage.package_state(&load_id).unwrap(), PackageState::Loaded);
    }

    #[tokio::test]
    async fn transient_failures_within_bound_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Scripted::default().fail(
            "a",
            (0..2).map(|_| DestinationError::transient_network("RESET", "connection reset")),
        );
        let (ctx, dest) = context(&dir, flaky, settings(3, true));
        let load_id = normalized_package(&ctx.storage, &["a"]);

        let info = load_package(&ctx, &load_id).await.unwrap();
        assert!(info.failed_jobs.is_empty());
        assert_eq!(*dest.written.lock().unwrap(), vec!["a.000000"]);
        let completed = ctx.storage.package_info(&load_id).unwrap();
        assert_eq!(completed.jobs_in(JobState::Completed)[0].retry_count, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_abort_when_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Scripted::default().fail(
            "a",
            (0..3).map(|_| DestinationError::transient_db("LOCKED", "database is locked")),
        );
        let (ctx, _dest) = context(&dir, flaky, settings(1, true));
        let load_id = normalized_package(&ctx.storage, &["a", "b"]);

        let err = load_package(&ctx, &load_id).await.unwrap_err();
        match &err {
            LoadError::JobFailed { job, error, terminal, .. } => {
                assert_eq!(job, "a.000000");
                assert!(error.contains("database is locked"));
                assert!(!terminal);
            }
            other => panic!("unexpected error: {other}"),
        }

        let info = ctx.storage.package_info(&load_id).unwrap();
        assert_eq!(info.state, PackageState::Loaded);
        assert_eq!(info.outcome, Some(LoadOutcome::Aborted));
        let failed = info.jobs_in(JobState::Failed);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].failed_message.as_deref().unwrap().contains("LOCKED"));
    }

    #[tokio::test]
    async fn terminal_failure_does_not_mask_other_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let bad = Scripted::default().fail("b", [DestinationError::schema("CLASH", "column exists")]);
        let (ctx, dest) = context(&dir, bad, settings(5, false));
        let load_id = normalized_package(&ctx.storage, &["a", "b", "c"]);

        let info = load_package(&ctx, &load_id).await.unwrap();
        assert_eq!(info.outcome, LoadOutcome::Loaded);
        assert_eq!(info.completed_jobs.len(), 2);
        assert_eq!(info.failed_jobs.len(), 1);
        assert_eq!(info.failed_jobs[0].retry_count, 0);
        assert_eq!(dest.written.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn schema_update_is_applied_once_across_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Scripted::default();
        dest.complete_failures
            .lock()
            .unwrap()
            .push_back(DestinationError::transient_network("TIMEOUT", "timed out"));
        let (ctx, dest) = context(&dir, dest, settings(0, false));
        let load_id = normalized_package(&ctx.storage, &["a"]);

        let err = load_package(&ctx, &load_id).await.unwrap_err();
        assert!(matches!(err, LoadError::CompleteLoad { .. }));
        assert_eq!(ctx.storage.package_state(&load_id).unwrap(), PackageState::Normalized);

        let info = load_package(&ctx, &load_id).await.unwrap();
        assert_eq!(info.completed_jobs, vec!["a.000000"]);
        assert_eq!(dest.schema_updates.load(Ordering::SeqCst), 1);
        assert_eq!(dest.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_attempt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _dest) = context(&dir, Scripted::default(), settings(0, false));
        let load_id = normalized_package(&ctx.storage, &["a"]);

        let _held = ctx.storage.lock_package(&load_id).unwrap();
        let err = load_package(&ctx, &load_id).await.unwrap_err();
        assert!(matches!(err, LoadError::Storage(StorageError::PackageLocked { .. })));
    }

    #[test]
    fn backoff_multiplier_scales_delay() {
        assert_eq!(scaled(Duration::from_millis(100), 0.0), Duration::ZERO);
        assert_eq!(scaled(Duration::from_millis(100), 2.0), Duration::from_millis(200));
    }
}
