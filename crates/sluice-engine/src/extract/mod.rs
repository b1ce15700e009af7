//! Extraction: drain sources into load packages.
//!
//! Every source gets its own package. Resources of a source drain
//! concurrently into the shared [`SourceTxn`](drain::SourceTxn); the package
//! is published to `extracted/` only when every resource finished.

mod drain;
pub mod item;
pub mod resource;
pub mod source;

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::{json, Value};
use sluice_types::ids::{LoadId, PipelineName};
use sluice_types::naming::STATE_TABLE;
use sluice_types::package::{JobState, PackageState};
use sluice_types::schema::{ColumnHint, Schema, WriteDisposition};
use sluice_types::state::PipelineState;
use tokio::task::JoinSet;

pub use item::{DataItem, PipeItem};
pub use resource::{ItemStream, Resource, ResourceContext, TableNamePolicy};
pub use source::Source;

use crate::config::types::ExtractSettings;
use crate::errors::ExtractError;
use crate::load::storage::{PackageStorage, PackageWriter, StorageError, SCHEMA_FILE};
use crate::result::SourceExtractInfo;
use drain::{DrainLimits, SourceTxn};
use resource::ResourceSpec;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Anything that can be extracted.
#[derive(Debug)]
pub enum ExtractInput {
    Source(Source),
    Resource(Resource),
    /// Literal rows for one table: an array of rows or a scalar.
    Rows { table_name: String, rows: Value },
    Many(Vec<ExtractInput>),
}

impl ExtractInput {
    #[must_use]
    pub fn rows(table_name: impl Into<String>, rows: Value) -> Self {
        Self::Rows {
            table_name: table_name.into(),
            rows,
        }
    }

    fn flatten_into(self, out: &mut Vec<Result<Source, Resource>>) -> Result<(), ExtractError> {
        match self {
            Self::Source(source) => out.push(Ok(source)),
            Self::Resource(resource) => out.push(Err(resource)),
            Self::Rows { table_name, rows } => out.push(Err(Resource::from_rows(table_name, rows)?)),
            Self::Many(inputs) => {
                for input in inputs {
                    input.flatten_into(out)?;
                }
            }
        }
        Ok(())
    }

    /// Sources in input order. Bare resources and rows are grouped into one
    /// source named `default_source`, placed where the first of them appeared.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidResourceDataType`] for rows that are a
    /// bare object.
    pub(crate) fn into_sources(self, default_source: &str) -> Result<Vec<Source>, ExtractError> {
        let mut flat = Vec::new();
        self.flatten_into(&mut flat)?;

        let mut sources = Vec::new();
        let mut implicit: Option<(usize, Vec<Resource>)> = None;
        for entry in flat {
            match entry {
                Ok(source) => sources.push(source),
                Err(resource) => implicit
                    .get_or_insert_with(|| (sources.len(), Vec::new()))
                    .1
                    .push(resource),
            }
        }
        if let Some((position, resources)) = implicit {
            let source = resources
                .into_iter()
                .fold(Source::new(default_source), Source::resource);
            sources.insert(position, source);
        }
        Ok(sources)
    }
}

impl From<Source> for ExtractInput {
    fn from(source: Source) -> Self {
        Self::Source(source)
    }
}

impl From<Resource> for ExtractInput {
    fn from(resource: Resource) -> Self {
        Self::Resource(resource)
    }
}

impl<T: Into<ExtractInput>> From<Vec<T>> for ExtractInput {
    fn from(inputs: Vec<T>) -> Self {
        Self::Many(inputs.into_iter().map(Into::into).collect())
    }
}

// ---------------------------------------------------------------------------
// Source extraction
// ---------------------------------------------------------------------------

/// A source extracted into a published package, not yet committed to state.
pub(crate) struct ExtractedSource {
    pub info: SourceExtractInfo,
    pub schema: Schema,
    pub state: PipelineState,
}

/// Why a source failed, and the package it was writing, if any.
#[derive(Debug)]
pub(crate) struct SourceFailure {
    pub load_id: Option<LoadId>,
    pub error: ExtractError,
}

pub(crate) struct ExtractContext<'a> {
    pub pipeline_name: &'a PipelineName,
    pub storage: &'a PackageStorage,
    pub settings: &'a ExtractSettings,
    pub restore_from_destination: bool,
}

/// Stored schema plus the tables and hints pre-declared by the source.
pub(crate) fn seed_schema(stored: Option<Schema>, prototype: &Schema) -> Schema {
    let mut schema = stored.unwrap_or_else(|| Schema::new(prototype.name.clone()));
    for (name, declared) in &prototype.tables {
        let table = schema.get_or_insert_table(name);
        table.write_disposition = declared.write_disposition;
        table.row_hash = declared.row_hash;
        if table.parent.is_none() {
            table.parent.clone_from(&declared.parent);
        }
        if table.resource.is_none() {
            table.resource.clone_from(&declared.resource);
        }
        for column in &declared.columns {
            table.apply_hint(&ColumnHint {
                name: column.name.clone(),
                data_type: column.data_type,
                nullable: Some(column.nullable),
                primary_key: Some(column.primary_key),
                unique: Some(column.unique),
                merge_key: Some(column.merge_key),
            });
        }
    }
    schema
}

/// Drain every resource of `source` into a new package in `extracted/`.
///
/// On failure the package is deleted; `state` and `schema` are never
/// touched, only the returned copies carry the changes.
pub(crate) async fn extract_source(
    source: &Source,
    schema: Schema,
    state: PipelineState,
    ctx: &ExtractContext<'_>,
) -> Result<ExtractedSource, SourceFailure> {
    let resources = source
        .take_resources()
        .map_err(|error| SourceFailure { load_id: None, error })?;
    let load_id = ctx
        .storage
        .new_load_id()
        .map_err(|e| SourceFailure {
            load_id: None,
            error: e.into(),
        })?;

    tracing::info!(
        pipeline = %ctx.pipeline_name,
        source = source.name(),
        load_id = %load_id,
        resources = resources.len(),
        "Extracting source"
    );

    match extract_into_package(source, resources, schema, state, &load_id, ctx).await {
        Ok(extracted) => {
            tracing::info!(
                source = source.name(),
                load_id = %load_id,
                tables = extracted.info.row_counts.len(),
                "Source extracted"
            );
            Ok(extracted)
        }
        Err(error) => {
            tracing::error!(source = source.name(), load_id = %load_id, "Source failed: {error}");
            if let Err(e) = ctx.storage.delete_package(PackageState::New, &load_id) {
                tracing::warn!(load_id = %load_id, "Failed to delete aborted package: {e}");
            }
            Err(SourceFailure {
                load_id: Some(load_id),
                error,
            })
        }
    }
}

async fn extract_into_package(
    source: &Source,
    resources: Vec<resource::Resource>,
    schema: Schema,
    state: PipelineState,
    load_id: &LoadId,
    ctx: &ExtractContext<'_>,
) -> Result<ExtractedSource, ExtractError> {
    let package_dir = ctx.storage.create_package(load_id)?;
    let writer = PackageWriter::new(
        package_dir.join(JobState::New.folder()),
        ctx.settings.file_max_items,
    );
    let txn = Arc::new(Mutex::new(SourceTxn::new(schema, state, writer)));
    let limits = DrainLimits::new(ctx.settings.workers, ctx.settings.max_in_flight);

    let mut join_set = JoinSet::new();
    for resource in resources {
        join_set.spawn(drain::drain_resource(
            resource,
            source.name().to_string(),
            Arc::clone(&txn),
            limits.clone(),
        ));
    }
    collect_drain_results(join_set, source.name()).await?;

    let mut guard = txn.lock().unwrap_or_else(PoisonError::into_inner);
    let txn = &mut *guard;

    txn.state.add_schema_name(&txn.schema.name);
    if txn.state.bump_version() && ctx.restore_from_destination {
        let row = state_row(&txn.state, ctx.pipeline_name).map_err(|source| StorageError::Json {
            path: package_dir.clone(),
            source,
        })?;
        txn.write_row(&state_table_spec(), STATE_TABLE, &row)?;
    }
    txn.writer.finish()?;
    txn.schema.bump_version();

    PackageStorage::write_json(&package_dir, SCHEMA_FILE, &txn.schema)?;
    ctx.storage
        .move_package(load_id, PackageState::New, PackageState::Extracted)?;

    Ok(ExtractedSource {
        info: SourceExtractInfo {
            source_name: source.name().to_string(),
            schema_name: txn.schema.name.clone(),
            load_id: load_id.clone(),
            row_counts: std::mem::take(&mut txn.row_counts),
        },
        schema: txn.schema.clone(),
        state: txn.state.clone(),
    })
}

/// Wait for all resource drains. The first failure cancels the rest.
async fn collect_drain_results(
    mut join_set: JoinSet<Result<u64, ExtractError>>,
    source_name: &str,
) -> Result<u64, ExtractError> {
    let mut rows = 0;
    let mut first_error: Option<ExtractError> = None;

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(n)) => rows += n,
            Ok(Err(error)) => {
                tracing::error!(source = source_name, "Resource failed: {error}");
                if first_error.is_none() {
                    first_error = Some(error);
                    join_set.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {
                // Sibling drains cancelled after the first failure.
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(ExtractError::TaskFailed {
                        resource: source_name.to_string(),
                        message: join_err.to_string(),
                    });
                    join_set.abort_all();
                }
            }
        }
    }

    first_error.map_or(Ok(rows), Err)
}

fn state_table_spec() -> ResourceSpec {
    ResourceSpec {
        name: STATE_TABLE.to_string(),
        table_name: None,
        write_disposition: WriteDisposition::Append,
        primary_key: Vec::new(),
        columns: Vec::new(),
        row_hash: false,
    }
}

fn state_row(state: &PipelineState, pipeline_name: &PipelineName) -> serde_json::Result<Value> {
    Ok(json!({
        "version": state.version,
        "version_hash": state.version_hash,
        "pipeline_name": pipeline_name.as_str(),
        "state": serde_json::to_string(&state.to_synced())?,
        "created_at": Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_types::schema::{Column, DataType, Table};

    fn names(sources: &[Source]) -> Vec<&str> {
        sources.iter().map(Source::name).collect()
    }

    #[test]
    fn bare_resources_group_into_one_source() {
        let input = ExtractInput::from(vec![
            ExtractInput::rows("a", json!([{"x": 1}])),
            ExtractInput::from(Source::new("explicit")),
            ExtractInput::from(Resource::from_iter("b", [json!(1)])),
        ]);
        let sources = input.into_sources("pipeline_schema").unwrap();
        assert_eq!(names(&sources), vec!["pipeline_schema", "explicit"]);
        assert_eq!(sources[0].resource_names(), vec!["a", "b"]);
    }

    #[test]
    fn bare_object_rows_fail() {
        let err = ExtractInput::rows("t", json!({"x": 1}))
            .into_sources("p")
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidResourceDataType { .. }));
    }

    #[test]
    fn seed_schema_applies_declared_hints() {
        let mut stored = Schema::new("s");
        stored
            .get_or_insert_table("users")
            .merge_inferred_column(&Column::with_type("id", DataType::Text))
            .unwrap();

        let mut prototype = Schema::new("s");
        let mut users = Table::new("users");
        users.write_disposition = WriteDisposition::Merge;
        let mut id = Column::with_type("id", DataType::Bigint);
        id.primary_key = true;
        id.nullable = false;
        users.columns.push(id);
        prototype.tables.insert("users".into(), users);

        let schema = seed_schema(Some(stored), &prototype);
        let users = schema.table("users").unwrap();
        assert_eq!(users.write_disposition, WriteDisposition::Merge);
        assert_eq!(users.column("id").unwrap().data_type, Some(DataType::Bigint));
        assert_eq!(users.primary_key(), vec!["id"]);
    }

    #[tokio::test]
    async fn failed_source_leaves_no_package() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PackageStorage::open(dir.path()).unwrap();
        let settings = ExtractSettings::default();
        let pipeline_name = PipelineName::new("p");
        let ctx = ExtractContext {
            pipeline_name: &pipeline_name,
            storage: &storage,
            settings: &settings,
            restore_from_destination: true,
        };
        let source = Source::new("s")
            .resource(Resource::from_iter("ok", [json!({"id": 1})]))
            .resource(Resource::from_results(
                "bad",
                vec![Err(anyhow::anyhow!("upstream down"))],
            ));

        let failure = extract_source(&source, Schema::new("s"), PipelineState::default(), &ctx)
            .await
            .err()
            .unwrap();
        assert!(failure.load_id.is_some());
        assert!(failure.error.to_string().contains("upstream down"));
        assert!(storage.list_packages(PackageState::New).unwrap().is_empty());
        assert!(storage.list_packages(PackageState::Extracted).unwrap().is_empty());
    }

    #[tokio::test]
    async fn state_change_emits_state_row() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PackageStorage::open(dir.path()).unwrap();
        let settings = ExtractSettings::default();
        let pipeline_name = PipelineName::new("p");
        let ctx = ExtractContext {
            pipeline_name: &pipeline_name,
            storage: &storage,
            settings: &settings,
            restore_from_destination: true,
        };
        let source = Source::new("s").resource(Resource::with_context("r", |ctx: ResourceContext| {
            ctx.update_source_state(|s| s.insert("seen".into(), json!(true)));
            futures::stream::iter(vec![Ok::<_, anyhow::Error>(PipeItem::ready(json!({"id": 1})))])
        }));

        let extracted = extract_source(&source, Schema::new("s"), PipelineState::default(), &ctx)
            .await
            .unwrap();
        assert_eq!(extracted.state.version, 1);
        assert_eq!(extracted.state.source("s").unwrap().values["seen"], json!(true));
        assert_eq!(extracted.info.row_counts[STATE_TABLE], 1);
        assert_eq!(extracted.info.row_counts["r"], 1);
        assert_eq!(extracted.schema.version, 1);
        assert_eq!(
            storage.list_packages(PackageState::Extracted).unwrap(),
            vec![extracted.info.load_id.clone()]
        );
    }
}
