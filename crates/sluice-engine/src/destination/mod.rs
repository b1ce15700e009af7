//! Destination lifecycle trait.
//!
//! The loader calls every method from the blocking pool, so implementations
//! may do synchronous I/O. Calls for different jobs of one package run
//! concurrently.

pub mod filesystem;

use std::path::PathBuf;

use sluice_types::error::DestinationError;
use sluice_types::ids::{LoadId, PipelineName};
use sluice_types::package::JobFileName;
use sluice_types::schema::{Schema, SchemaUpdate, Table};
use sluice_types::state::SyncedState;

pub use filesystem::FilesystemDestination;

/// A job handed to [`Destination::write_job`].
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub load_id: LoadId,
    pub job: JobFileName,
    /// Schema table the job's rows belong to.
    pub table: Table,
    /// Write disposition and identity of the job's root table.
    pub root_table: Table,
    pub schema_name: String,
    /// JSON lines file with the normalized rows.
    pub file_path: PathBuf,
}

/// Destination lifecycle for load packages.
pub trait Destination: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Apply tables and columns added by one package, before its first job.
    ///
    /// # Errors
    ///
    /// Returns a [`DestinationError`]; retryable errors fail the load attempt
    /// without touching any job.
    fn update_schema(&self, schema: &Schema, update: &SchemaUpdate) -> Result<(), DestinationError>;

    /// Write one job file.
    ///
    /// # Errors
    ///
    /// Returns a [`DestinationError`]; the loader retries retryable errors.
    fn write_job(&self, job: &WriteJob) -> Result<(), DestinationError>;

    /// Called once all jobs of a package reached a terminal state.
    ///
    /// # Errors
    ///
    /// Returns a [`DestinationError`] if the load can't be recorded.
    fn complete_load(&self, load_id: &LoadId, schema: &Schema) -> Result<(), DestinationError>;

    /// Newest state document stored for `pipeline_name`, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`DestinationError`] if the stored state can't be read.
    fn get_stored_state(&self, pipeline_name: &PipelineName) -> Result<Option<SyncedState>, DestinationError>;

    /// Newest schema named `schema_name` recorded by a completed load.
    /// Destinations that don't keep schemas return `None`.
    ///
    /// # Errors
    ///
    /// Returns a [`DestinationError`] if the stored schema can't be read.
    fn get_stored_schema(&self, schema_name: &str) -> Result<Option<Schema>, DestinationError> {
        let _ = schema_name;
        Ok(None)
    }
}
