use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::Value;

use sluice_engine::{ExtractInput, LoadInfo};

/// Execute the `run` command: load `input` (or only pending packages)
/// through the pipeline.
pub async fn execute(pipeline_path: &Path, input: Option<&Path>, table: Option<&str>) -> Result<()> {
    let (config, pipeline) = super::open_pipeline(pipeline_path)?;

    let extract_input = match input {
        Some(path) => {
            let table = match table {
                Some(table) => table.to_string(),
                None => default_table_name(path)?,
            };
            let rows = read_rows(path)?;
            tracing::info!(
                pipeline = config.pipeline,
                table,
                rows = rows.len(),
                "Input rows read"
            );
            Some(ExtractInput::rows(table, Value::Array(rows)))
        }
        None => None,
    };

    let start = Instant::now();
    let Some(info) = pipeline.run(extract_input).await? else {
        println!("Pipeline '{}': nothing to load.", config.pipeline);
        return Ok(());
    };

    print_load_info(&info, start.elapsed().as_secs_f64());
    info.raise_on_failed_jobs()?;
    Ok(())
}

fn default_table_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("Cannot derive a table name from {}; pass --table", path.display()))
}

/// Rows of a JSON array file or a JSON lines file.
fn read_rows(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    parse_rows(&text).with_context(|| format!("Failed to parse input file: {}", path.display()))
}

fn parse_rows(text: &str) -> Result<Vec<Value>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str::<Vec<Value>>(trimmed)?);
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid JSON on line {}", i + 1))
        })
        .collect()
}

fn print_load_info(info: &LoadInfo, duration_secs: f64) {
    println!("Pipeline '{}' completed.", info.pipeline_name);
    println!("  Destination:     {}", info.destination_name);
    println!("  Dataset:         {}", info.dataset_name);
    if info.first_run {
        println!("  First run:       yes");
    }
    for package in &info.packages {
        println!("  Package {}:", package.load_id);
        println!("    Outcome:       {}", package.outcome);
        println!("    Schema:        {}", package.schema_name);
        println!("    Jobs loaded:   {}", package.completed_jobs.len());
        if !package.failed_jobs.is_empty() {
            println!("    Jobs failed:   {}", package.failed_jobs.len());
            for job in &package.failed_jobs {
                println!(
                    "      {} (retries: {}): {}",
                    job.file_name,
                    job.retry_count,
                    job.message.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    println!("  Duration:        {duration_secs:.2}s");
}
