//! Normalization: extracted packages → normalized packages.
//!
//! Each staged file is normalized by its own worker against an immutable
//! schema snapshot. Workers return a schema delta; deltas are merged in file
//! order once all workers finished. A conflict between deltas discards the
//! output and the package is normalized again by a single worker.

pub mod flatten;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use sluice_state::StateBackend;
use sluice_types::ids::{LoadId, PipelineName};
use sluice_types::package::{JobFileName, JobState, PackageState};
use sluice_types::schema::Schema;
use tokio::sync::Semaphore;

pub use flatten::{NormalizedRow, RowNormalizer};

use crate::errors::NormalizeError;
use crate::extract::seed_schema;
use crate::load::storage::{PackageStorage, PackageWriter, StorageError, SCHEMA_FILE, SCHEMA_UPDATES_FILE};

type RowCounts = BTreeMap<String, u64>;

/// Everything a normalization pass needs from its pipeline.
#[derive(Clone)]
pub(crate) struct NormalizeContext {
    pub pipeline_name: PipelineName,
    pub storage: PackageStorage,
    pub backend: Arc<dyn StateBackend>,
    pub workers: usize,
    pub file_max_items: usize,
}

/// Result of normalizing one package.
#[derive(Debug, Clone)]
pub(crate) struct PackageNormalized {
    pub load_id: LoadId,
    pub schema: Schema,
    pub row_counts: RowCounts,
}

/// Normalize one extracted package and publish it to `normalized/`.
///
/// Returns `None` when the package had already been normalized by an
/// interrupted run; the stale extracted copy is removed.
///
/// # Errors
///
/// Returns [`NormalizeError`] if a row can't be normalized or storage fails.
/// The extracted package is left in place.
pub(crate) async fn normalize_package(
    ctx: &NormalizeContext,
    load_id: &LoadId,
) -> Result<Option<PackageNormalized>, NormalizeError> {
    if ctx.storage.package_dir(PackageState::Normalized, load_id).is_dir() {
        tracing::warn!(load_id = %load_id, "Package already normalized, removing extracted copy");
        ctx.storage.delete_package(PackageState::Extracted, load_id)?;
        return Ok(None);
    }

    let package_schema = ctx.storage.read_schema(PackageState::Extracted, load_id)?;
    let stored = {
        let backend = Arc::clone(&ctx.backend);
        let pipeline_name = ctx.pipeline_name.clone();
        let schema_name = package_schema.name.clone();
        tokio::task::spawn_blocking(move || backend.load_schema(&pipeline_name, &schema_name))
            .await
            .map_err(|e| task_failed("load schema", &e))??
    };
    let base = seed_schema(stored, &package_schema);
    let files = ctx
        .storage
        .list_jobs(PackageState::Extracted, load_id, JobState::New)?;

    tracing::info!(
        pipeline = %ctx.pipeline_name,
        load_id = %load_id,
        schema = base.name,
        files = files.len(),
        workers = ctx.workers,
        "Normalizing package"
    );

    let mut merged = None;
    if ctx.workers > 1 && files.len() > 1 {
        reset_partial(ctx, load_id)?;
        match normalize_parallel(ctx, load_id, &base, &files).await? {
            Ok(result) => merged = Some(result),
            Err(conflict) => tracing::warn!(
                load_id = %load_id,
                "Schema conflict between workers, normalizing sequentially: {conflict}"
            ),
        }
    }
    let (schema, row_counts) = match merged {
        Some(result) => result,
        None => {
            reset_partial(ctx, load_id)?;
            normalize_sequential(ctx, load_id, &base, &files).await?
        }
    };

    let finalize_ctx = ctx.clone();
    let finalize_id = load_id.clone();
    let schema = tokio::task::spawn_blocking(move || {
        finalize_package(&finalize_ctx, &finalize_id, &base, schema)
    })
    .await
    .map_err(|e| task_failed("finalize package", &e))??;

    tracing::info!(
        load_id = %load_id,
        schema = schema.name,
        schema_version = schema.version,
        tables = row_counts.len(),
        "Package normalized"
    );
    Ok(Some(PackageNormalized {
        load_id: load_id.clone(),
        schema,
        row_counts,
    }))
}

fn task_failed(what: &str, e: &tokio::task::JoinError) -> NormalizeError {
    NormalizeError::TaskFailed {
        message: format!("{what} task panicked: {e}"),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> NormalizeError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
    .into()
}

/// Start from an empty `.partial` folder.
fn reset_partial(ctx: &NormalizeContext, load_id: &LoadId) -> Result<(), NormalizeError> {
    let partial = ctx.storage.partial_dir(PackageState::Normalized, load_id);
    match fs::remove_dir_all(&partial) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(&partial, e)),
    }
    let jobs = partial.join(JobState::New.folder());
    fs::create_dir_all(&jobs).map_err(|e| io_error(&jobs, e))
}

struct FileTask {
    input: PathBuf,
    output_dir: PathBuf,
    job: JobFileName,
    max_items: usize,
}

impl FileTask {
    fn new(ctx: &NormalizeContext, load_id: &LoadId, job: &JobFileName) -> Self {
        Self {
            input: ctx
                .storage
                .package_dir(PackageState::Extracted, load_id)
                .join(JobState::New.folder())
                .join(job.to_string()),
            output_dir: ctx
                .storage
                .partial_dir(PackageState::Normalized, load_id)
                .join(JobState::New.folder()),
            job: job.clone(),
            max_items: ctx.file_max_items,
        }
    }

    /// Normalize every row of the staged file into job files of the output
    /// package. Output file ids start with the input file id, so workers
    /// never collide.
    fn run(&self, normalizer: &mut RowNormalizer, counts: &mut RowCounts) -> Result<(), NormalizeError> {
        let file = File::open(&self.input).map_err(|e| io_error(&self.input, e))?;
        let mut writer = PackageWriter::new(self.output_dir.clone(), self.max_items)
            .with_file_id_prefix(format!("{}_", self.job.file_id));

        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_error(&self.input, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Map<String, Value> =
                serde_json::from_str(&line).map_err(|source| NormalizeError::InvalidRow {
                    file: self.input.clone(),
                    line: idx + 1,
                    source,
                })?;
            for (table, row) in normalizer.normalize_row(&self.job.table, row)? {
                writer.write_row(&table, &Value::Object(row))?;
                *counts.entry(table).or_default() += 1;
            }
        }
        writer.finish()?;
        tracing::debug!(file = %self.job, "File normalized");
        Ok(())
    }
}

fn add_counts(total: &mut RowCounts, counts: RowCounts) {
    for (table, n) in counts {
        *total.entry(table).or_default() += n;
    }
}

/// One worker per file, bounded by `ctx.workers`. The inner error reports a
/// conflict between worker deltas.
async fn normalize_parallel(
    ctx: &NormalizeContext,
    load_id: &LoadId,
    base: &Schema,
    files: &[JobFileName],
) -> Result<Result<(Schema, RowCounts), sluice_types::schema::SchemaError>, NormalizeError> {
    let semaphore = Arc::new(Semaphore::new(ctx.workers));
    let snapshot = Arc::new(base.clone());
    let mut handles = Vec::with_capacity(files.len());

    for job in files {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| NormalizeError::TaskFailed {
                message: format!("normalize semaphore closed: {e}"),
            })?;
        let task = FileTask::new(ctx, load_id, job);
        let snapshot = Arc::clone(&snapshot);
        let load_id = load_id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut normalizer = RowNormalizer::new((*snapshot).clone(), load_id);
            let mut counts = RowCounts::new();
            task.run(&mut normalizer, &mut counts)?;
            Ok::<_, NormalizeError>((normalizer.into_schema().diff_from(&snapshot), counts))
        }));
    }

    // Wait for every worker before looking at results: they all write into
    // the partial folder.
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.map_err(|e| task_failed("normalize worker", &e))?);
    }

    let mut schema = base.clone();
    let mut row_counts = RowCounts::new();
    for result in results {
        let (delta, counts) = result?;
        if let Err(conflict) = schema.merge_update(&delta) {
            return Ok(Err(conflict));
        }
        add_counts(&mut row_counts, counts);
    }
    Ok(Ok((schema, row_counts)))
}

async fn normalize_sequential(
    ctx: &NormalizeContext,
    load_id: &LoadId,
    base: &Schema,
    files: &[JobFileName],
) -> Result<(Schema, RowCounts), NormalizeError> {
    let tasks: Vec<FileTask> = files.iter().map(|job| FileTask::new(ctx, load_id, job)).collect();
    let mut normalizer = RowNormalizer::new(base.clone(), load_id.clone());
    tokio::task::spawn_blocking(move || {
        let mut counts = RowCounts::new();
        for task in &tasks {
            task.run(&mut normalizer, &mut counts)?;
        }
        Ok::<_, NormalizeError>((normalizer.into_schema(), counts))
    })
    .await
    .map_err(|e| task_failed("normalize worker", &e))?
}

/// Write schema files, persist the schema and publish the package.
fn finalize_package(
    ctx: &NormalizeContext,
    load_id: &LoadId,
    base: &Schema,
    mut schema: Schema,
) -> Result<Schema, NormalizeError> {
    schema.bump_version();
    let update = schema.diff_from(base);
    let partial = ctx.storage.partial_dir(PackageState::Normalized, load_id);
    PackageStorage::write_json(&partial, SCHEMA_FILE, &schema)?;
    PackageStorage::write_json(&partial, SCHEMA_UPDATES_FILE, &update)?;

    ctx.backend.commit(&ctx.pipeline_name, None, &[&schema])?;
    ctx.storage
        .publish_partial(PackageState::Normalized, load_id)?;
    ctx.storage.delete_package(PackageState::Extracted, load_id)?;
    Ok(schema)
}
