//! Criterion benchmarks for the SQLite state backend.
//!
//! Every extract and normalize step ends with one atomic commit of the state
//! document and the touched schemas.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use sluice_state::prelude::*;
use sluice_types::schema::{Column, DataType};

fn schema_with_tables(name: &str, tables: usize) -> Schema {
    let mut schema = Schema::new(name);
    for t in 0..tables {
        let table = schema.get_or_insert_table(&format!("table_{t}"));
        for c in 0..20 {
            table
                .merge_inferred_column(&Column::with_type(format!("column_{c}"), DataType::Text))
                .unwrap();
        }
    }
    schema.bump_version();
    schema
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("state/commit");

    for table_count in [1, 10, 50] {
        group.bench_with_input(
            BenchmarkId::new("tables", table_count),
            &table_count,
            |b, &table_count| {
                let backend = SqliteStateBackend::in_memory().unwrap();
                let pipeline = PipelineName::new("bench_pipeline");
                let schema = schema_with_tables("bench", table_count);
                let mut state = PipelineState::default();
                let mut counter = 0u64;

                b.iter(|| {
                    counter += 1;
                    state
                        .resource_mut("bench", "rows")
                        .insert("cursor".into(), json!(counter));
                    state.bump_version();
                    backend.commit(&pipeline, Some(&state), &[&schema]).unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_load_schema(c: &mut Criterion) {
    let backend = SqliteStateBackend::in_memory().unwrap();
    let pipeline = PipelineName::new("bench_pipeline");
    let schema = schema_with_tables("bench", 50);
    backend.commit(&pipeline, None, &[&schema]).unwrap();

    c.bench_function("state/load_schema", |b| {
        b.iter(|| backend.load_schema(&pipeline, "bench").unwrap());
    });
}

criterion_group!(benches, bench_commit, bench_load_schema);
criterion_main!(benches);
