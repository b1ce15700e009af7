//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for a pipeline's state
//! document and schemas. Model types live in [`sluice_types`].

use sluice_types::ids::PipelineName;
use sluice_types::schema::Schema;
use sluice_types::state::PipelineState;

use crate::error;

/// Storage contract for pipeline state and schemas.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    /// Read the state document of a pipeline.
    ///
    /// Returns `Ok(None)` when nothing has been committed yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn load_state(&self, pipeline: &PipelineName) -> error::Result<Option<PipelineState>>;

    /// Read one schema of a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn load_schema(&self, pipeline: &PipelineName, name: &str) -> error::Result<Option<Schema>>;

    /// Names of all stored schemas of a pipeline, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_schemas(&self, pipeline: &PipelineName) -> error::Result<Vec<String>>;

    /// Persist `state` (when given) and `schemas` in one transaction.
    ///
    /// Either everything is written or nothing is.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn commit(
        &self,
        pipeline: &PipelineName,
        state: Option<&PipelineState>,
        schemas: &[&Schema],
    ) -> error::Result<()>;

    /// Remove everything stored for a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn drop_pipeline(&self, pipeline: &PipelineName) -> error::Result<()>;
}
