//! Sources: named bundles of resources sharing one schema and one state namespace.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use sluice_types::naming;
use sluice_types::schema::Schema;

use super::resource::Resource;
use crate::errors::{ExtractError, PipelineError};
use crate::pipeline::PipelineRegistry;

struct SourceInner {
    name: String,
    schema: Schema,
    /// `None` once the resources were taken for extraction.
    resources: Mutex<Option<Vec<Resource>>>,
    selected: Mutex<Option<Vec<String>>>,
}

/// Cloneable handle to a source. Clones share the resources, so a source is
/// extracted at most once through any of them.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

impl Source {
    /// Empty source whose schema is named after the normalized source name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let schema = Schema::new(naming::normalize_identifier(&name));
        Self::with_schema(name, schema)
    }

    /// Source with a schema prototype: its name and pre-declared tables.
    #[must_use]
    pub fn with_schema(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                name: name.into(),
                schema,
                resources: Mutex::new(Some(Vec::new())),
                selected: Mutex::new(None),
            }),
        }
    }

    fn resources_lock(&self) -> MutexGuard<'_, Option<Vec<Resource>>> {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a resource. Ignored with a warning once the source was extracted.
    #[must_use]
    pub fn resource(self, resource: Resource) -> Self {
        match self.resources_lock().as_mut() {
            Some(resources) => resources.push(resource),
            None => tracing::warn!(
                source = self.inner.name,
                resource = resource.name(),
                "Source already extracted, resource ignored"
            ),
        }
        self
    }

    /// Extract only the named resources.
    #[must_use]
    pub fn with_resources<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self
            .inner
            .selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(names.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Names of the resources not yet extracted.
    #[must_use]
    pub fn resource_names(&self) -> Vec<String> {
        self.resources_lock()
            .as_ref()
            .map(|r| r.iter().map(|r| r.name().to_string()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.resources_lock().is_none()
    }

    /// Take the selected resources, exhausting the source.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::SourceExhausted`] if they were taken before.
    pub(crate) fn take_resources(&self) -> Result<Vec<Resource>, ExtractError> {
        let Some(resources) = self.resources_lock().take() else {
            return Err(ExtractError::SourceExhausted {
                source_name: self.inner.name.clone(),
            });
        };
        let selected = self
            .inner
            .selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(selected) = selected else {
            return Ok(resources);
        };
        for name in &selected {
            if !resources.iter().any(|r| r.name() == name) {
                tracing::warn!(source = self.inner.name, resource = name, "Selected resource not found");
            }
        }
        Ok(resources
            .into_iter()
            .filter(|r| selected.iter().any(|s| s == r.name()))
            .collect())
    }

    /// Committed state of this source, read through the active pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PipelineStateNotAvailable`] when no pipeline
    /// is active in `registry`.
    pub fn state(&self, registry: &PipelineRegistry) -> Result<Map<String, Value>, PipelineError> {
        registry.source_state(&self.inner.name)
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.inner.name)
            .field("schema", &self.inner.schema.name)
            .field("resources", &self.resource_names())
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}
