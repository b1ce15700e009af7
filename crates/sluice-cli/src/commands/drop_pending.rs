use std::path::Path;

use anyhow::Result;

/// Execute the `drop-pending` command.
pub fn execute(pipeline_path: &Path, with_partial_loads: bool) -> Result<()> {
    let (config, pipeline) = super::open_pipeline(pipeline_path)?;
    let dropped = pipeline.drop_pending_packages(with_partial_loads)?;

    if dropped.is_empty() {
        println!("Pipeline '{}' has no pending packages to drop.", config.pipeline);
    } else {
        println!("Dropped {} package(s) of pipeline '{}':", dropped.len(), config.pipeline);
        for load_id in &dropped {
            println!("  {load_id}");
        }
    }
    Ok(())
}
