//! Active pipeline registry.
//!
//! Producers get their state through [`ResourceContext`](crate::extract::ResourceContext).
//! The registry covers reads from outside an extraction, such as
//! [`Source::state`](crate::extract::Source::state).

use std::sync::{Arc, LazyLock, PoisonError, RwLock, Weak};

use serde_json::{Map, Value};

use super::{Pipeline, PipelineInner};
use crate::errors::PipelineError;

static GLOBAL: LazyLock<Arc<PipelineRegistry>> = LazyLock::new(|| Arc::new(PipelineRegistry::new()));

/// Holds at most one active pipeline. Pipelines register themselves on
/// `create`/`attach` unless given another registry.
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    active: RwLock<Option<Weak<PipelineInner>>>,
}

impl PipelineRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process wide registry.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// The active pipeline, if it is still alive.
    #[must_use]
    pub fn active(&self) -> Option<Pipeline> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        active
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Pipeline { inner })
    }

    #[must_use]
    pub fn is_active(&self, pipeline: &Pipeline) -> bool {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        active
            .as_ref()
            .is_some_and(|weak| weak.ptr_eq(&Arc::downgrade(&pipeline.inner)))
    }

    /// Make `pipeline` the active one, replacing any other.
    pub fn activate(&self, pipeline: &Pipeline) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = active.as_ref().and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&previous, &pipeline.inner) {
                tracing::debug!(pipeline = %previous.name, "Pipeline deactivated");
            }
        }
        *active = Some(Arc::downgrade(&pipeline.inner));
        tracing::debug!(pipeline = %pipeline.name(), "Pipeline activated");
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::PipelineNotActive`] if `pipeline` is not the
    /// active pipeline.
    pub fn deactivate(&self, pipeline: &Pipeline) -> Result<(), PipelineError> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        let is_active = active
            .as_ref()
            .is_some_and(|weak| weak.ptr_eq(&Arc::downgrade(&pipeline.inner)));
        if !is_active {
            return Err(PipelineError::PipelineNotActive {
                pipeline_name: pipeline.name().to_string(),
            });
        }
        *active = None;
        Ok(())
    }

    fn require_active(&self) -> Result<Pipeline, PipelineError> {
        self.active().ok_or(PipelineError::PipelineStateNotAvailable)
    }

    /// Committed state of `source_name` in the active pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PipelineStateNotAvailable`] when no pipeline
    /// is active, or the state backend error.
    pub fn source_state(&self, source_name: &str) -> Result<Map<String, Value>, PipelineError> {
        let state = self.require_active()?.current_state()?;
        Ok(state
            .source(source_name)
            .map(|s| s.values.clone())
            .unwrap_or_default())
    }

    /// Committed state of one resource in the active pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PipelineStateNotAvailable`] when no pipeline
    /// is active, or the state backend error.
    pub fn resource_state(&self, source_name: &str, resource_name: &str) -> Result<Map<String, Value>, PipelineError> {
        let state = self.require_active()?.current_state()?;
        Ok(state
            .resource(source_name, resource_name)
            .cloned()
            .unwrap_or_default())
    }
}
