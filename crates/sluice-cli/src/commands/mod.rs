pub mod check;
pub mod drop_pending;
pub mod packages;
pub mod run;
pub mod schema;
pub mod state;

use std::path::Path;

use anyhow::{Context, Result};

use sluice_engine::config::parser;
use sluice_engine::config::types::PipelineConfig;
use sluice_engine::config::validator;
use sluice_engine::Pipeline;

/// Parse and validate a pipeline YAML file.
pub fn load_config(pipeline_path: &Path) -> Result<PipelineConfig> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validator::validate_pipeline(&config)?;
    Ok(config)
}

/// Open the pipeline described by a YAML file.
pub fn open_pipeline(pipeline_path: &Path) -> Result<(PipelineConfig, Pipeline)> {
    let config = load_config(pipeline_path)?;
    let pipeline = Pipeline::from_config(&config)
        .with_context(|| format!("Failed to open pipeline '{}'", config.pipeline))?;
    Ok((config, pipeline))
}
