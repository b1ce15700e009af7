use std::path::Path;

use anyhow::Result;

/// Execute the `schema` command: print a stored schema as YAML.
pub async fn execute(pipeline_path: &Path, name: Option<&str>) -> Result<()> {
    let (config, pipeline) = super::open_pipeline(pipeline_path)?;

    let schema = match name {
        Some(name) => pipeline.schema(name).await?,
        None => pipeline.default_schema().await?,
    };
    let Some(schema) = schema else {
        anyhow::bail!(
            "Pipeline '{}' has no schema {}",
            config.pipeline,
            name.map_or_else(|| "yet".to_string(), |n| format!("'{n}'"))
        );
    };
    print!("{}", serde_yaml::to_string(&schema)?);
    Ok(())
}
