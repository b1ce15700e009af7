//! Worker pool sizes must not change what gets loaded.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sluice_engine::config::types::PipelineSettings;
use sluice_engine::{Destination, FilesystemDestination, PipeItem, Pipeline, PipelineRegistry, Resource, Source};

fn source() -> Source {
    let deferred = Resource::from_iter(
        "numbers",
        (0_u64..40).map(|i| {
            PipeItem::deferred(move || {
                std::thread::sleep(Duration::from_millis(u64::from(i % 3)));
                Ok(PipeItem::ready(json!({"id": i, "square": i * i, "tags": [i % 2, i % 5]})))
            })
        }),
    );
    let pending = Resource::from_iter(
        "letters",
        (0_u64..20).map(|i| {
            PipeItem::pending(async move {
                tokio::time::sleep(Duration::from_millis(u64::from(i % 4))).await;
                Ok::<_, anyhow::Error>(PipeItem::ready(json!({"id": i, "letter": format!("l{i}")})))
            })
        }),
    );
    Source::new("pool").resource(deferred).resource(pending)
}

/// Rows of `table` without engine columns, sorted.
fn contents(dest: &FilesystemDestination, table: &str) -> Vec<Value> {
    let mut rows: Vec<Value> = dest
        .read_table(table)
        .unwrap()
        .into_iter()
        .map(|mut row| {
            row.as_object_mut().unwrap().retain(|k, _| !k.starts_with('_'));
            row
        })
        .collect();
    rows.sort_by_key(ToString::to_string);
    rows
}

async fn run_with(extract_workers: usize, normalize_workers: usize) -> (Vec<Vec<Value>>, Vec<String>) {
    let dir = tempfile::tempdir().unwrap();
    let dest = Arc::new(FilesystemDestination::new(dir.path().join("out"), "ds"));
    let mut settings = PipelineSettings::default();
    settings.extract.workers = extract_workers;
    settings.extract.file_max_items = 7;
    settings.normalize.workers = normalize_workers;
    settings.load.backoff_multiplier = 0.0;

    let pipeline = Pipeline::builder("pool")
        .pipelines_dir(dir.path().join("pipelines"))
        .destination(Arc::clone(&dest) as Arc<dyn Destination>)
        .settings(settings)
        .registry(Arc::new(PipelineRegistry::new()))
        .create()
        .unwrap();
    let info = pipeline.run(Some(source().into())).await.unwrap().unwrap();
    assert!(!info.has_failed_jobs());

    let tables = ["numbers", "numbers__tags", "letters"]
        .iter()
        .map(|t| contents(&dest, t))
        .collect();
    let schema = pipeline.schema("pool").await.unwrap().unwrap();
    let columns = schema
        .table("numbers")
        .unwrap()
        .columns
        .iter()
        .map(|c| c.name.clone())
        .collect();
    (tables, columns)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deferred_pool_size_does_not_change_contents() {
    let (single, single_columns) = run_with(1, 1).await;
    let (wide, wide_columns) = run_with(8, 1).await;
    assert_eq!(single[0].len(), 40);
    assert_eq!(single[1].len(), 80);
    assert_eq!(single[2].len(), 20);
    assert_eq!(single, wide);
    assert_eq!(single_columns, wide_columns);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_normalize_matches_sequential() {
    let (sequential, sequential_columns) = run_with(4, 1).await;
    let (parallel, parallel_columns) = run_with(4, 4).await;
    assert_eq!(sequential, parallel);
    assert_eq!(sequential_columns, parallel_columns);
}
