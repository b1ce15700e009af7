use std::path::Path;

use anyhow::Result;

/// Execute the `check` command: validate the config, open the working
/// directory and read the state stored in the destination.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load_config(pipeline_path)?;
    println!("Pipeline structure: OK");

    let pipeline = sluice_engine::Pipeline::from_config(&config)?;
    println!("Working directory:  {}", pipeline.working_dir().display());

    let mut ok = true;
    match pipeline.sync_destination().await {
        Ok(Some(version)) => println!("Destination state:  OK (restored version {version})"),
        Ok(None) => println!("Destination state:  OK"),
        Err(e) => {
            println!("Destination state:  FAILED ({e})");
            ok = false;
        }
    }

    let schemas = pipeline.schema_names().await?;
    println!("Schemas:            {}", schemas.len());
    if pipeline.has_pending_data()? {
        println!("Pending packages:   yes (loaded by the next run)");
    }

    if ok {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}
