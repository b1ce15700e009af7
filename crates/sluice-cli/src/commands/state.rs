use std::path::Path;

use anyhow::Result;

/// Execute the `state` command: print the pipeline state document as JSON.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let (_, pipeline) = super::open_pipeline(pipeline_path)?;
    let state = pipeline.state().await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
