use std::path::Path;

use anyhow::{Context, Result};

use sluice_types::ids::LoadId;

/// Execute the `packages` command: list packages by state, or print one
/// package as JSON.
pub fn execute(pipeline_path: &Path, load_id: Option<&str>) -> Result<()> {
    let (_, pipeline) = super::open_pipeline(pipeline_path)?;

    if let Some(load_id) = load_id {
        let info = pipeline
            .get_load_package_info(&LoadId::new(load_id))
            .with_context(|| format!("Failed to read package {load_id}"))?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let groups = [
        ("extracted", pipeline.list_extracted_packages()?),
        ("normalized", pipeline.list_normalized_packages()?),
        ("loaded", pipeline.list_loaded_packages()?),
    ];
    for (label, load_ids) in &groups {
        println!("{label} ({}):", load_ids.len());
        for load_id in load_ids {
            println!("  {load_id}");
        }
    }
    Ok(())
}
