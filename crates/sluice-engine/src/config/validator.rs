//! Semantic validation for parsed pipeline configuration values.

use anyhow::{bail, Result};
use sluice_types::ids::PipelineName;

use crate::config::types::PipelineConfig;

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    } else if let Err(reason) = PipelineName::new(config.pipeline.as_str()).validate() {
        errors.push(format!("Invalid pipeline name '{}': {reason}", config.pipeline));
    }

    if let Some(dataset) = &config.dataset {
        if dataset.trim().is_empty() {
            errors.push("dataset must not be empty when set".to_string());
        }
    }

    if config.destination.path.as_os_str().is_empty() {
        errors.push("Destination path must not be empty".to_string());
    }

    if config.extract.workers == 0 {
        errors.push("extract.workers must be at least 1".to_string());
    }
    if config.extract.max_in_flight == 0 {
        errors.push("extract.max_in_flight must be at least 1".to_string());
    }
    if config.extract.file_max_items == 0 {
        errors.push("extract.file_max_items must be at least 1".to_string());
    }
    if config.normalize.workers == 0 {
        errors.push("normalize.workers must be at least 1".to_string());
    }
    if config.load.workers == 0 {
        errors.push("load.workers must be at least 1".to_string());
    }
    if !(config.load.backoff_multiplier >= 0.0 && config.load.backoff_multiplier.is_finite()) {
        errors.push(format!(
            "load.backoff_multiplier must be a finite number >= 0, got {}",
            config.load.backoff_multiplier
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}
