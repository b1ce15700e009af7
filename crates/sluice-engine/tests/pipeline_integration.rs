//! End-to-end pipeline tests against the filesystem destination.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use sluice_engine::config::parser;
use sluice_engine::config::types::PipelineSettings;
use sluice_engine::config::validator;
use sluice_engine::errors::{ExtractError, NormalizeError, Step};
use sluice_engine::{
    ExtractInput, FilesystemDestination, PipeItem, Pipeline, PipelineError, PipelineRegistry,
    Resource, ResourceContext, Source,
};
use sluice_types::naming::{LOAD_ID_COLUMN, PARENT_ID_COLUMN, ROW_ID_COLUMN};
use sluice_types::package::LoadOutcome;
use sluice_types::schema::WriteDisposition;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    registry: Arc<PipelineRegistry>,
    dest: Arc<FilesystemDestination>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let dest = Arc::new(FilesystemDestination::new(dir.path().join("out"), "ds"));
        Self {
            dir,
            registry: Arc::new(PipelineRegistry::new()),
            dest,
        }
    }

    fn pipeline(&self, name: &str) -> Pipeline {
        let mut settings = PipelineSettings::default();
        settings.load.backoff_multiplier = 0.0;
        Pipeline::builder(name)
            .pipelines_dir(self.dir.path().join("pipelines"))
            .dataset_name("ds")
            .destination(Arc::clone(&self.dest) as Arc<dyn sluice_engine::Destination>)
            .settings(settings)
            .registry(Arc::clone(&self.registry))
            .create()
            .unwrap()
    }

    /// Rows of a table without engine columns, sorted by their JSON text.
    fn user_rows(&self, table: &str) -> Vec<Value> {
        let mut rows: Vec<Value> = self
            .dest
            .read_table(table)
            .unwrap()
            .into_iter()
            .map(|mut row| {
                let obj = row.as_object_mut().unwrap();
                obj.retain(|k, _| !k.starts_with('_'));
                row
            })
            .collect();
        rows.sort_by_key(ToString::to_string);
        rows
    }
}

fn fixture_path(name: &str) -> PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/fixtures/pipelines")
        .join(name)
}

fn rows_source(name: &str, table: &str, rows: Value) -> Source {
    Source::new(name).resource(Resource::from_rows(table, rows).unwrap())
}

#[tokio::test]
async fn late_column_is_null_for_earlier_rows() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");

    for rows in [json!([{}, {}, {}]), json!([{"a": 1}, {}, {}]), json!([{"a": null}, {}])] {
        pipeline
            .run(Some(ExtractInput::rows("t", rows)))
            .await
            .unwrap()
            .unwrap();
    }

    let rows = h.dest.read_table("t").unwrap();
    assert_eq!(rows.len(), 8);
    let values: Vec<Value> = rows
        .iter()
        .map(|r| r.get("a").cloned().unwrap_or(Value::Null))
        .collect();
    assert_eq!(values.iter().filter(|v| **v == json!(1)).count(), 1);
    assert_eq!(values.iter().filter(|v| v.is_null()).count(), 7);
    assert!(rows.iter().all(|r| r.get(LOAD_ID_COLUMN).is_some()));
}

#[tokio::test]
async fn nested_list_becomes_child_table() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");

    let info = pipeline
        .run(Some(ExtractInput::rows(
            "parent",
            json!([{"a": 1, "items": [{"c": 2}, {"c": 3}]}]),
        )))
        .await
        .unwrap()
        .unwrap();
    assert!(!info.has_failed_jobs());
    assert!(info.first_run);

    let parent = h.dest.read_table("parent").unwrap();
    assert_eq!(parent.len(), 1);
    assert_eq!(parent[0]["a"], json!(1));
    assert!(parent[0].get("items").is_none());

    let children = h.dest.read_table("parent__items").unwrap();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child[PARENT_ID_COLUMN], parent[0][ROW_ID_COLUMN]);
    }
    assert_eq!(h.user_rows("parent__items"), vec![json!({"c": 2}), json!({"c": 3})]);

    let schema = pipeline.schema("p").await.unwrap().unwrap();
    let child = schema.table("parent__items").unwrap();
    assert_eq!(child.parent.as_deref(), Some("parent"));
}

#[tokio::test]
async fn failed_source_keeps_earlier_sources_committed() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");

    let failing = Source::new("c").resource(Resource::from_results(
        "tc",
        vec![
            Ok(PipeItem::ready(json!({"x": 1}))),
            Err(anyhow::anyhow!("upstream went away")),
        ],
    ));
    let err = pipeline
        .extract(vec![
            rows_source("a", "ta", json!([{"x": 1}])),
            rows_source("b", "tb", json!([{"x": 2}])),
            failing,
        ])
        .await
        .unwrap_err();

    match &err {
        PipelineError::StepFailed {
            step, source_name, ..
        } => {
            assert_eq!(*step, Step::Extract);
            assert_eq!(source_name.as_deref(), Some("c"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.extract_error(), Some(ExtractError::Producer { .. })));
    assert_eq!(pipeline.schema_names().await.unwrap(), vec!["a", "b"]);
    assert_eq!(pipeline.list_extracted_packages().unwrap().len(), 2);

    pipeline
        .extract(vec![
            rows_source("a", "ta", json!([{"x": 3}])),
            rows_source("b", "tb", json!([{"x": 4}])),
            rows_source("c", "tc", json!([{"x": 5}])),
        ])
        .await
        .unwrap();
    assert_eq!(pipeline.schema_names().await.unwrap(), vec!["a", "b", "c"]);

    let info = pipeline.run(None).await.unwrap().unwrap();
    assert_eq!(info.packages.len(), 5);
    assert_eq!(h.user_rows("ta"), vec![json!({"x": 1}), json!({"x": 3})]);
    assert_eq!(h.user_rows("tc"), vec![json!({"x": 5})]);
    assert!(!pipeline.has_pending_data().unwrap());
}

#[tokio::test]
async fn exhausted_source_fails_with_its_name() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");

    let source = rows_source("events", "e", json!([{"id": 1}]));
    pipeline.extract(source.clone()).await.unwrap();
    assert!(source.is_exhausted());

    let err = pipeline.extract(source).await.unwrap_err();
    match err.extract_error() {
        Some(ExtractError::SourceExhausted { source_name }) => assert_eq!(source_name, "events"),
        other => panic!("unexpected error: {other:?}"),
    }

    pipeline
        .extract(rows_source("events", "e", json!([{"id": 2}])))
        .await
        .unwrap();
}

#[tokio::test]
async fn replace_keeps_only_the_latest_load() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");

    for ids in [[1, 2], [3, 4]] {
        let resource = Resource::from_iter("items", ids.map(|id| json!({"id": id})))
            .write_disposition(WriteDisposition::Replace);
        pipeline
            .run(Some(Source::new("shop").resource(resource).into()))
            .await
            .unwrap();
    }
    assert_eq!(h.user_rows("items"), vec![json!({"id": 3}), json!({"id": 4})]);
}

#[tokio::test]
async fn merge_without_key_fails_before_the_destination() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");

    let resource =
        Resource::from_iter("m", [json!({"id": 1})]).write_disposition(WriteDisposition::Merge);
    let err = pipeline
        .run(Some(Source::new("s").resource(resource).into()))
        .await
        .unwrap_err();
    assert_eq!(err.step(), Some(Step::Normalize));
    assert!(matches!(
        err.normalize_error(),
        Some(NormalizeError::MergeKeyMissing { table }) if table == "m"
    ));
    assert!(h.dest.read_table("m").unwrap().is_empty());
    assert_eq!(pipeline.list_extracted_packages().unwrap().len(), 1);

    let keyed = Resource::from_iter("m", [json!({"id": 1})])
        .write_disposition(WriteDisposition::Merge)
        .primary_key(["id"]);
    pipeline.drop_pending_packages(false).unwrap();
    pipeline
        .run(Some(Source::new("s").resource(keyed).into()))
        .await
        .unwrap();
    assert_eq!(h.user_rows("m"), vec![json!({"id": 1})]);
}

#[tokio::test]
async fn identical_shapes_keep_the_schema() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");
    let shape = json!([{"b": "x", "a": 1, "nested": {"z": true}}]);

    pipeline
        .run(Some(ExtractInput::rows("t", shape.clone())))
        .await
        .unwrap();
    let first = pipeline.schema("p").await.unwrap().unwrap();
    pipeline
        .run(Some(ExtractInput::rows("t", shape)))
        .await
        .unwrap();
    let second = pipeline.schema("p").await.unwrap().unwrap();

    let columns = |schema: &sluice_types::schema::Schema| {
        schema
            .table("t")
            .unwrap()
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type))
            .collect::<Vec<_>>()
    };
    assert_eq!(columns(&first), columns(&second));
    assert_eq!(first.version_hash, second.version_hash);
    assert_eq!(
        columns(&first).into_iter().map(|c| c.0).take(3).collect::<Vec<_>>(),
        vec!["b", "a", "nested__z"]
    );
}

#[tokio::test]
async fn pending_packages_load_before_new_input() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");

    pipeline
        .extract(ExtractInput::rows("first", json!([{"n": 1}])))
        .await
        .unwrap();
    assert!(pipeline.has_pending_data().unwrap());

    let info = pipeline
        .run(Some(ExtractInput::rows("second", json!([{"n": 2}]))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.packages.len(), 1);
    assert_eq!(h.user_rows("first"), vec![json!({"n": 1})]);
    assert!(h.dest.read_table("second").unwrap().is_empty());

    pipeline
        .run(Some(ExtractInput::rows("second", json!([{"n": 2}]))))
        .await
        .unwrap();
    assert_eq!(h.user_rows("second"), vec![json!({"n": 2})]);
}

#[tokio::test]
async fn state_is_restored_from_the_destination() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");

    let resource = Resource::with_context("events", |ctx: ResourceContext| {
        ctx.update_resource_state(|state| state.insert("cursor".to_string(), json!(10)));
        futures::stream::iter(vec![Ok::<_, anyhow::Error>(PipeItem::ready(json!({"id": 1})))])
    });
    let info = pipeline
        .run(Some(Source::new("api").resource(resource).into()))
        .await
        .unwrap()
        .unwrap();
    assert!(info.first_run);
    assert!(!pipeline.first_run().await.unwrap());
    assert_eq!(
        h.registry.resource_state("api", "events").unwrap()["cursor"],
        json!(10)
    );
    let version = pipeline.state().await.unwrap().version;
    assert!(version > 0);

    pipeline.drop().await.unwrap();
    assert!(matches!(
        h.registry.source_state("api"),
        Err(PipelineError::PipelineStateNotAvailable)
    ));

    let restored = h.pipeline("p");
    assert!(restored.run(None).await.unwrap().is_none());
    let state = restored.state().await.unwrap();
    assert_eq!(state.version, version);
    assert_eq!(state.resource("api", "events").unwrap()["cursor"], json!(10));
    assert!(!restored.first_run().await.unwrap());
    assert_eq!(
        Source::new("api").state(&h.registry).unwrap(),
        serde_json::Map::new()
    );
}

#[tokio::test]
async fn schemas_are_restored_with_the_state() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");
    let orders = Resource::from_rows("orders", json!([{"id": 1, "amount": 5}, {"id": 2, "amount": "n/a"}]))
        .unwrap()
        .primary_key(["id"]);
    pipeline
        .run(Some(Source::new("shop").resource(orders).into()))
        .await
        .unwrap()
        .unwrap();
    let original = pipeline.schema("shop").await.unwrap().unwrap();
    assert!(original.table("orders").unwrap().column("amount__v_text").is_some());

    let working_dir = pipeline.working_dir().to_path_buf();
    pipeline.drop().await.unwrap();
    assert!(!working_dir.exists());

    let restored = h.pipeline("p");
    assert!(restored.schema("shop").await.unwrap().is_none());
    assert!(restored.sync_destination().await.unwrap().is_some());
    let schema = restored.schema("shop").await.unwrap().unwrap();
    assert_eq!(schema, original);
    assert!(schema.table("orders").unwrap().column("id").unwrap().primary_key);

    let more = Resource::from_rows("orders", json!([{"id": 3, "amount": "free"}]))
        .unwrap()
        .primary_key(["id"]);
    restored
        .run(Some(Source::new("shop").resource(more).into()))
        .await
        .unwrap()
        .unwrap();
    let next = restored.schema("shop").await.unwrap().unwrap();
    let columns = |s: &sluice_types::schema::Schema| -> Vec<String> {
        s.table("orders").unwrap().columns.iter().map(|c| c.name.clone()).collect()
    };
    assert_eq!(columns(&next), columns(&original));
    assert_eq!(next.version, original.version);
}

#[tokio::test]
async fn loaded_package_info_lists_jobs() {
    let h = Harness::new();
    let pipeline = h.pipeline("p");

    let info = pipeline
        .run(Some(ExtractInput::rows("t", json!([{"a": 1}, {"a": 2}]))))
        .await
        .unwrap()
        .unwrap();
    let load_id = info.load_ids()[0].clone();
    assert_eq!(pipeline.list_loaded_packages().unwrap(), vec![load_id.clone()]);

    let package = pipeline.get_load_package_info(&load_id).unwrap();
    assert_eq!(package.outcome, Some(LoadOutcome::Loaded));
    assert_eq!(package.schema_name.as_deref(), Some("p"));
    assert!(package.schema_update.tables.contains_key("t"));
    assert!(pipeline.list_failed_jobs(&load_id).unwrap().is_empty());
    assert!(h.dest.completed_loads().unwrap().contains(load_id.as_str()));
}

#[tokio::test]
async fn fixture_pipeline_runs_end_to_end() {
    let pipelines_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    std::env::set_var("SLUICE_TEST_PIPELINES_DIR", pipelines_dir.path());
    std::env::set_var("SLUICE_TEST_OUT_DIR", out_dir.path());

    let config = parser::parse_pipeline(&fixture_path("filesystem_pipeline.yaml"))
        .expect("Failed to parse fixture pipeline");
    validator::validate_pipeline(&config).expect("Validation should pass");
    assert_eq!(config.pipeline, "fixture_events");
    assert_eq!(config.load.max_retries, 2);

    let pipeline = Pipeline::from_config(&config).unwrap();
    assert!(pipeline.working_dir().starts_with(pipelines_dir.path()));
    pipeline
        .run(Some(ExtractInput::rows("clicks", json!([{"id": 1}, {"id": 2}]))))
        .await
        .unwrap();

    let dest = FilesystemDestination::new(out_dir.path(), "events");
    assert_eq!(dest.read_table("clicks").unwrap().len(), 2);

    std::env::remove_var("SLUICE_TEST_PIPELINES_DIR");
    std::env::remove_var("SLUICE_TEST_OUT_DIR");
}

#[test]
fn invalid_fixture_reports_every_problem() {
    let config = parser::parse_pipeline(&fixture_path("invalid_pipeline.yaml")).unwrap();
    let err = validator::validate_pipeline(&config).unwrap_err().to_string();
    assert!(err.contains("Unsupported pipeline version '2.0'"));
    assert!(err.contains("Invalid pipeline name 'bad/name'"));
    assert!(err.contains("Destination path must not be empty"));
    assert!(err.contains("extract.workers must be at least 1"));
    assert!(err.contains("load.backoff_multiplier"));
}
