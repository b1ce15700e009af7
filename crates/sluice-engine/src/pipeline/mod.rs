//! Pipeline orchestration: extract → normalize → load with persisted state.
//!
//! A pipeline owns a working directory holding its state database and its
//! load packages:
//!
//! ```text
//! <pipelines_dir>/<pipeline>/state.db
//! <pipelines_dir>/<pipeline>/load/{new,extracted,normalized,loaded}/<load_id>/
//! ```

mod registry;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use sluice_state::{SqliteStateBackend, StateBackend, StateError};
use sluice_types::error::DestinationError;
use sluice_types::ids::{LoadId, PipelineName};
use sluice_types::package::{JobState, PackageState};
use sluice_types::schema::Schema;
use sluice_types::state::PipelineState;

pub use registry::PipelineRegistry;

use crate::config::types::{PipelineConfig, PipelineSettings};
use crate::destination::{Destination, FilesystemDestination};
use crate::errors::{ExtractError, PipelineError, Step};
use crate::extract::{self, ExtractContext, ExtractInput};
use crate::load::loader::{self, LoadContext};
use crate::load::storage::{JobInfo, LoadPackageInfo, PackageStorage};
use crate::normalize::{self, NormalizeContext};
use crate::result::{ExtractInfo, LoadInfo, NormalizeInfo};

const STATE_DB_FILE: &str = "state.db";
const LOAD_DIR: &str = "load";
const FIRST_RUN_KEY: &str = "first_run";

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and opens a [`Pipeline`].
pub struct PipelineBuilder {
    name: String,
    pipelines_dir: Option<PathBuf>,
    dataset_name: Option<String>,
    destination: Option<Arc<dyn Destination>>,
    settings: PipelineSettings,
    registry: Option<Arc<PipelineRegistry>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn pipelines_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipelines_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn dataset_name(mut self, name: impl Into<String>) -> Self {
        self.dataset_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn destination(mut self, destination: Arc<dyn Destination>) -> Self {
        self.destination = Some(destination);
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Register with `registry` instead of [`PipelineRegistry::global`].
    #[must_use]
    pub fn registry(mut self, registry: Arc<PipelineRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Open the pipeline, creating its working directory if needed, and
    /// activate it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPipelineName`] for unusable names and
    /// storage or state errors if the working directory can't be opened.
    pub fn create(self) -> Result<Pipeline, PipelineError> {
        self.open(true)
    }

    /// Reopen an existing pipeline and activate it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CannotRestorePipeline`] if the working
    /// directory does not exist.
    pub fn attach(self) -> Result<Pipeline, PipelineError> {
        self.open(false)
    }

    fn open(self, create: bool) -> Result<Pipeline, PipelineError> {
        let name = PipelineName::new(self.name);
        name.validate()
            .map_err(|reason| PipelineError::InvalidPipelineName {
                name: name.to_string(),
                reason,
            })?;

        let pipelines_dir = self
            .pipelines_dir
            .unwrap_or_else(crate::config::types::default_pipelines_dir);
        let working_dir = pipelines_dir.join(name.as_str());
        if !create && !working_dir.is_dir() {
            return Err(PipelineError::CannotRestorePipeline {
                name: name.to_string(),
                path: working_dir,
            });
        }
        std::fs::create_dir_all(&working_dir).map_err(StateError::Io)?;

        let backend: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::open(&working_dir.join(STATE_DB_FILE))?);
        let storage = PackageStorage::open(working_dir.join(LOAD_DIR))?;
        let dataset_name = self
            .dataset_name
            .unwrap_or_else(|| format!("{name}_dataset"));

        let pipeline = Pipeline {
            inner: Arc::new(PipelineInner {
                name,
                working_dir,
                dataset_name,
                destination: self.destination,
                settings: self.settings,
                storage,
                backend,
                registry: self.registry.unwrap_or_else(PipelineRegistry::global),
            }),
        };
        pipeline.activate();
        tracing::info!(
            pipeline = %pipeline.name(),
            working_dir = %pipeline.working_dir().display(),
            attached = !create,
            "Pipeline opened"
        );
        Ok(pipeline)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub(crate) struct PipelineInner {
    pub(crate) name: PipelineName,
    working_dir: PathBuf,
    dataset_name: String,
    destination: Option<Arc<dyn Destination>>,
    settings: PipelineSettings,
    storage: PackageStorage,
    backend: Arc<dyn StateBackend>,
    registry: Arc<PipelineRegistry>,
}

/// Handle to a pipeline. Clones share the same pipeline.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) inner: Arc<PipelineInner>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.inner.name)
            .field("working_dir", &self.inner.working_dir)
            .field("dataset_name", &self.inner.dataset_name)
            .field("destination", &self.destination_name())
            .finish_non_exhaustive()
    }
}

fn task_failed(e: &tokio::task::JoinError) -> PipelineError {
    PipelineError::TaskFailed {
        message: format!("state task panicked: {e}"),
    }
}

impl Pipeline {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            pipelines_dir: None,
            dataset_name: None,
            destination: None,
            settings: PipelineSettings::default(),
            registry: None,
        }
    }

    /// Open (or create) the pipeline described by a validated config, with
    /// a filesystem destination.
    ///
    /// # Errors
    ///
    /// Same as [`PipelineBuilder::create`].
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let dataset_name = config.dataset_name();
        let destination = FilesystemDestination::new(&config.destination.path, &dataset_name);
        Self::builder(config.pipeline.clone())
            .pipelines_dir(config.resolved_pipelines_dir())
            .dataset_name(dataset_name)
            .destination(Arc::new(destination))
            .settings(config.settings())
            .create()
    }

    #[must_use]
    pub fn name(&self) -> &PipelineName {
        &self.inner.name
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.inner.working_dir
    }

    #[must_use]
    pub fn dataset_name(&self) -> &str {
        &self.inner.dataset_name
    }

    #[must_use]
    pub fn destination_name(&self) -> Option<&str> {
        self.inner.destination.as_deref().map(Destination::name)
    }

    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn storage(&self) -> &PackageStorage {
        &self.inner.storage
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Make this the active pipeline of its registry.
    pub fn activate(&self) {
        self.inner.registry.activate(self);
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::PipelineNotActive`] if another pipeline (or
    /// none) is active.
    pub fn deactivate(&self) -> Result<(), PipelineError> {
        self.inner.registry.deactivate(self)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.registry.is_active(self)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.inner.registry
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    /// Committed state, read synchronously.
    pub(crate) fn current_state(&self) -> Result<PipelineState, PipelineError> {
        Ok(self
            .inner
            .backend
            .load_state(&self.inner.name)?
            .unwrap_or_default())
    }

    async fn with_backend<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StateBackend, &PipelineName) -> Result<T, StateError> + Send + 'static,
    {
        let backend = Arc::clone(&self.inner.backend);
        let name = self.inner.name.clone();
        tokio::task::spawn_blocking(move || f(backend.as_ref(), &name))
            .await
            .map_err(|e| task_failed(&e))?
            .map_err(PipelineError::from)
    }

    async fn load_state(&self) -> Result<Option<PipelineState>, PipelineError> {
        self.with_backend(|backend, name| backend.load_state(name)).await
    }

    async fn commit_state(&self, state: PipelineState) -> Result<(), PipelineError> {
        self.with_backend(move |backend, name| backend.commit(name, Some(&state), &[]))
            .await
    }

    /// Committed pipeline state; empty before the first commit.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] on backend failure.
    pub async fn state(&self) -> Result<PipelineState, PipelineError> {
        Ok(self.load_state().await?.unwrap_or_default())
    }

    /// Committed schema by name.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] on backend failure.
    pub async fn schema(&self, name: &str) -> Result<Option<Schema>, PipelineError> {
        let name = name.to_string();
        self.with_backend(move |backend, pipeline| backend.load_schema(pipeline, &name))
            .await
    }

    /// Names of committed schemas, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] on backend failure.
    pub async fn schema_names(&self) -> Result<Vec<String>, PipelineError> {
        self.with_backend(|backend, pipeline| backend.list_schemas(pipeline))
            .await
    }

    /// Schema of the default source, if any was extracted.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] on backend failure.
    pub async fn default_schema(&self) -> Result<Option<Schema>, PipelineError> {
        match self.state().await?.default_schema_name {
            Some(name) => self.schema(&name).await,
            None => Ok(None),
        }
    }

    /// Set a value in the local, never synced, state namespace.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] on backend failure.
    pub async fn set_local_state_val(&self, key: &str, value: Value) -> Result<(), PipelineError> {
        let mut state = self.state().await?;
        state.local.insert(key.to_string(), value);
        self.commit_state(state).await
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::State`] on backend failure.
    pub async fn get_local_state_val(&self, key: &str) -> Result<Option<Value>, PipelineError> {
        Ok(self.state().await?.local.get(key).cloned())
    }

    /// Neither local nor destination state existed when the pipeline first
    /// synced. Cleared by the first successful load.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] on backend failure.
    pub async fn first_run(&self) -> Result<bool, PipelineError> {
        Ok(self
            .get_local_state_val(FIRST_RUN_KEY)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Restore state from the destination when it is newer than the local
    /// one, together with the stored schemas it names that are missing or
    /// older locally. Returns the adopted version.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StateSync`] if the destination can't be read.
    pub async fn sync_destination(&self) -> Result<Option<u64>, PipelineError> {
        let local = self.load_state().await?;
        let remote = self
            .read_destination(|destination, name| destination.get_stored_state(name))
            .await?
            .flatten();

        let mut state = local.clone().unwrap_or_default();
        let adopted = match remote {
            Some(remote) if remote.version > state.version => {
                let version = remote.version;
                state.adopt(remote);
                Some(version)
            }
            Some(_) => None,
            None if local.is_none() => {
                state.local.insert(FIRST_RUN_KEY.to_string(), Value::Bool(true));
                None
            }
            None => return Ok(None),
        };

        let Some(version) = adopted else {
            if local.is_none() {
                self.commit_state(state).await?;
            }
            return Ok(None);
        };

        let names = state.schema_names.clone();
        let stored = self
            .read_destination(move |destination, _| {
                names
                    .iter()
                    .filter_map(|name| destination.get_stored_schema(name).transpose())
                    .collect::<Result<Vec<Schema>, _>>()
            })
            .await?
            .unwrap_or_default();

        let restored = self
            .with_backend(move |backend, pipeline| {
                let mut newer = Vec::with_capacity(stored.len());
                for schema in stored {
                    let local_version = backend.load_schema(pipeline, &schema.name)?.map(|s| s.version);
                    if local_version.map_or(true, |v| v < schema.version) {
                        newer.push(schema);
                    }
                }
                let refs: Vec<&Schema> = newer.iter().collect();
                backend.commit(pipeline, Some(&state), &refs)?;
                Ok(newer.len())
            })
            .await?;
        tracing::info!(
            pipeline = %self.name(),
            version,
            schemas = restored,
            "Restored pipeline state from destination"
        );
        Ok(Some(version))
    }

    /// Run a read against the destination on the blocking pool. `None`
    /// without a destination.
    async fn read_destination<T, F>(&self, f: F) -> Result<Option<T>, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Destination, &PipelineName) -> Result<T, DestinationError> + Send + 'static,
    {
        let Some(destination) = &self.inner.destination else {
            return Ok(None);
        };
        let destination = Arc::clone(destination);
        let name = self.inner.name.clone();
        tokio::task::spawn_blocking(move || f(destination.as_ref(), &name))
            .await
            .map_err(|e| task_failed(&e))?
            .map(Some)
            .map_err(|source| PipelineError::StateSync {
                destination_name: self.destination_name().unwrap_or_default().to_string(),
                source,
            })
    }

    /// Mark a never committed pipeline as first run without reading the
    /// destination.
    async fn init_local_state(&self) -> Result<(), PipelineError> {
        if self.load_state().await?.is_none() {
            let mut state = PipelineState::default();
            state.local.insert(FIRST_RUN_KEY.to_string(), Value::Bool(true));
            self.commit_state(state).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Extract `input` into one package per source.
    ///
    /// Sources are extracted in order; each successful source commits its
    /// schema and state before the next one starts.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StepFailed`] for the first failing source.
    /// Sources extracted before it stay committed.
    pub async fn extract(&self, input: impl Into<ExtractInput>) -> Result<ExtractInfo, PipelineError> {
        let mut state = self.state().await?;
        let default_source = state
            .default_schema_name
            .clone()
            .unwrap_or_else(|| self.inner.name.to_string());
        let sources = input
            .into()
            .into_sources(&default_source)
            .map_err(|e| PipelineError::step_failed(Step::Extract, None, None, e))?;

        let ctx = ExtractContext {
            pipeline_name: &self.inner.name,
            storage: &self.inner.storage,
            settings: &self.inner.settings.extract,
            restore_from_destination: self.inner.settings.restore_from_destination
                && self.inner.destination.is_some(),
        };

        let mut info = ExtractInfo {
            pipeline_name: self.inner.name.to_string(),
            sources: Vec::with_capacity(sources.len()),
        };
        for source in &sources {
            let source_name = source.name().to_string();
            let schema_name = source.schema().name.clone();
            let stored = self
                .with_backend(move |backend, pipeline| backend.load_schema(pipeline, &schema_name))
                .await?;
            let schema = extract::seed_schema(stored, source.schema());

            let extracted = extract::extract_source(source, schema, state.clone(), &ctx)
                .await
                .map_err(|failure| {
                    PipelineError::step_failed(Step::Extract, failure.load_id, Some(source_name.clone()), failure.error)
                })?;

            let load_id = extracted.info.load_id.clone();
            let committed_state = extracted.state.clone();
            let schema = extracted.schema;
            self.with_backend(move |backend, pipeline| backend.commit(pipeline, Some(&committed_state), &[&schema]))
                .await
                .map_err(|e| match e {
                    PipelineError::State(error) => PipelineError::step_failed(
                        Step::Extract,
                        Some(load_id),
                        Some(source_name.clone()),
                        ExtractError::State(error),
                    ),
                    other => other,
                })?;
            state = extracted.state;
            info.sources.push(extracted.info);
        }
        Ok(info)
    }

    /// Normalize all extracted packages.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StepFailed`] naming the first package that
    /// failed; it stays in `extracted/`.
    pub async fn normalize(&self) -> Result<NormalizeInfo, PipelineError> {
        self.normalize_with_workers(self.inner.settings.normalize.workers)
            .await
    }

    /// [`Pipeline::normalize`] with an explicit worker count.
    ///
    /// # Errors
    ///
    /// Same as [`Pipeline::normalize`].
    pub async fn normalize_with_workers(&self, workers: usize) -> Result<NormalizeInfo, PipelineError> {
        let ctx = NormalizeContext {
            pipeline_name: self.inner.name.clone(),
            storage: self.inner.storage.clone(),
            backend: Arc::clone(&self.inner.backend),
            workers: workers.max(1),
            file_max_items: self.inner.settings.extract.file_max_items,
        };

        let mut info = NormalizeInfo::default();
        for load_id in self.inner.storage.list_packages(PackageState::Extracted)? {
            let normalized = normalize::normalize_package(&ctx, &load_id)
                .await
                .map_err(|e| PipelineError::step_failed(Step::Normalize, Some(load_id.clone()), None, e))?;
            if let Some(normalized) = normalized {
                for (table, rows) in normalized.row_counts {
                    *info.row_counts.entry(table).or_default() += rows;
                }
                info.load_ids.push(normalized.load_id);
            }
        }
        Ok(info)
    }

    /// Load all normalized packages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DestinationMissing`] without a destination,
    /// or [`PipelineError::StepFailed`] naming the package that failed.
    pub async fn load(&self) -> Result<LoadInfo, PipelineError> {
        let destination = self
            .inner
            .destination
            .clone()
            .ok_or_else(|| PipelineError::DestinationMissing {
                pipeline_name: self.inner.name.to_string(),
            })?;
        let first_run = self.first_run().await?;
        let ctx = LoadContext {
            storage: self.inner.storage.clone(),
            destination: Arc::clone(&destination),
            settings: self.inner.settings.load.clone(),
        };

        let mut info = LoadInfo {
            pipeline_name: self.inner.name.to_string(),
            destination_name: destination.name().to_string(),
            dataset_name: self.inner.dataset_name.clone(),
            packages: Vec::new(),
            first_run,
        };
        for load_id in self.inner.storage.list_packages(PackageState::Normalized)? {
            let loaded = loader::load_package(&ctx, &load_id)
                .await
                .map_err(|e| PipelineError::step_failed(Step::Load, Some(load_id.clone()), None, e))?;
            info.packages.push(loaded);
        }

        if first_run && !info.packages.is_empty() {
            self.set_local_state_val(FIRST_RUN_KEY, Value::Bool(false))
                .await?;
        }
        Ok(info)
    }

    /// Sync, then extract, normalize and load `input`.
    ///
    /// Pending packages from an earlier run are normalized and loaded first;
    /// `input` is then not extracted and has to be passed to another run.
    /// Returns `None` when there was no input and nothing pending.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub async fn run(&self, input: Option<ExtractInput>) -> Result<Option<LoadInfo>, PipelineError> {
        if self.inner.settings.restore_from_destination && self.inner.destination.is_some() {
            self.sync_destination().await?;
        } else {
            self.init_local_state().await?;
        }

        if self.has_pending_data()? {
            if input.is_some() {
                tracing::warn!(
                    pipeline = %self.name(),
                    "Pending packages found; loading them instead of the new input. Run again to extract it"
                );
            }
            self.normalize().await?;
            return self.load().await.map(Some);
        }

        let Some(input) = input else {
            tracing::info!(pipeline = %self.name(), "Nothing to extract and nothing pending");
            return Ok(None);
        };
        self.extract(input).await?;
        self.normalize().await?;
        self.load().await.map(Some)
    }

    // -----------------------------------------------------------------------
    // Packages
    // -----------------------------------------------------------------------

    /// Extracted or normalized packages are waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] if the package folders can't be read.
    pub fn has_pending_data(&self) -> Result<bool, PipelineError> {
        Ok(self.inner.storage.has_pending()?)
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] if the folder can't be read.
    pub fn list_extracted_packages(&self) -> Result<Vec<LoadId>, PipelineError> {
        Ok(self.inner.storage.list_packages(PackageState::Extracted)?)
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] if the folder can't be read.
    pub fn list_normalized_packages(&self) -> Result<Vec<LoadId>, PipelineError> {
        Ok(self.inner.storage.list_packages(PackageState::Normalized)?)
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] if the folder can't be read.
    pub fn list_loaded_packages(&self) -> Result<Vec<LoadId>, PipelineError> {
        Ok(self.inner.storage.list_packages(PackageState::Loaded)?)
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] for unknown packages.
    pub fn get_load_package_info(&self, load_id: &LoadId) -> Result<LoadPackageInfo, PipelineError> {
        Ok(self.inner.storage.package_info(load_id)?)
    }

    /// Failed jobs of a package, with their messages.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] for unknown packages.
    pub fn list_failed_jobs(&self, load_id: &LoadId) -> Result<Vec<JobInfo>, PipelineError> {
        Ok(self
            .inner
            .storage
            .package_info(load_id)?
            .jobs_in(JobState::Failed)
            .to_vec())
    }

    /// Delete extracted and normalized packages. Partially loaded packages
    /// are kept unless `with_partial_loads` is set.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] if a package can't be removed.
    pub fn drop_pending_packages(&self, with_partial_loads: bool) -> Result<Vec<LoadId>, PipelineError> {
        let dropped = self.inner.storage.drop_pending(with_partial_loads)?;
        if !dropped.is_empty() {
            tracing::warn!(pipeline = %self.name(), packages = dropped.len(), "Dropped pending packages");
        }
        Ok(dropped)
    }

    /// Delete the pipeline's state and working directory and deactivate it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] or an I/O error wrapped in it.
    pub async fn drop(self) -> Result<(), PipelineError> {
        self.with_backend(|backend, pipeline| backend.drop_pipeline(pipeline))
            .await?;
        match self.deactivate() {
            Ok(()) => {}
            Err(PipelineError::PipelineNotActive { .. }) => {
                tracing::debug!(pipeline = %self.name(), "Dropped pipeline was not active");
            }
            Err(e) => return Err(e),
        }
        let dir = self.inner.working_dir.clone();
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&dir))
            .await
            .map_err(|e| task_failed(&e))?
            .map_err(StateError::Io)?;
        tracing::info!(pipeline = %self.name(), "Pipeline dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builder(dir: &tempfile::TempDir, name: &str) -> PipelineBuilder {
        Pipeline::builder(name)
            .pipelines_dir(dir.path().join("pipelines"))
            .registry(Arc::new(PipelineRegistry::new()))
    }

    #[test]
    fn create_activates_and_attach_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PipelineRegistry::new());
        let first = builder(&dir, "p1").registry(Arc::clone(&registry)).create().unwrap();
        assert!(first.is_active());
        assert!(first.working_dir().join(STATE_DB_FILE).is_file());
        assert_eq!(first.dataset_name(), "p1_dataset");

        let second = builder(&dir, "p2").registry(Arc::clone(&registry)).create().unwrap();
        assert!(second.is_active());
        assert!(!first.is_active());
        assert!(matches!(
            first.deactivate(),
            Err(PipelineError::PipelineNotActive { .. })
        ));
        second.deactivate().unwrap();
        assert!(registry.active().is_none());

        let again = builder(&dir, "p1").attach().unwrap();
        assert_eq!(again.name().as_str(), "p1");
    }

    #[test]
    fn attach_missing_pipeline_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = builder(&dir, "ghost").attach().unwrap_err();
        assert!(matches!(err, PipelineError::CannotRestorePipeline { .. }));
    }

    #[test]
    fn invalid_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = builder(&dir, "../escape").create().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPipelineName { .. }));
    }

    #[tokio::test]
    async fn local_state_values_persist() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = builder(&dir, "p").create().unwrap();
        assert_eq!(pipeline.get_local_state_val("cursor").await.unwrap(), None);
        pipeline.set_local_state_val("cursor", json!(42)).await.unwrap();
        drop(pipeline);

        let attached = builder(&dir, "p").attach().unwrap();
        assert_eq!(attached.get_local_state_val("cursor").await.unwrap(), Some(json!(42)));
    }

    #[tokio::test]
    async fn sync_without_any_state_marks_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Arc::new(FilesystemDestination::new(dir.path().join("out"), "ds"));
        let pipeline = builder(&dir, "p").destination(dest).create().unwrap();
        assert!(!pipeline.first_run().await.unwrap());
        assert_eq!(pipeline.sync_destination().await.unwrap(), None);
        assert!(pipeline.first_run().await.unwrap());
    }

    #[tokio::test]
    async fn load_without_destination_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = builder(&dir, "p").create().unwrap();
        assert!(matches!(
            pipeline.load().await,
            Err(PipelineError::DestinationMissing { .. })
        ));
    }

    #[tokio::test]
    async fn run_without_input_or_pending_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Arc::new(FilesystemDestination::new(dir.path().join("out"), "ds"));
        let pipeline = builder(&dir, "p").destination(dest).create().unwrap();
        assert!(pipeline.run(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drop_removes_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = builder(&dir, "p").create().unwrap();
        pipeline.set_local_state_val("k", json!(1)).await.unwrap();
        let working_dir = pipeline.working_dir().to_path_buf();
        let registry = Arc::clone(pipeline.registry());

        pipeline.drop().await.unwrap();
        assert!(!working_dir.exists());
        assert!(registry.active().is_none());
    }

    #[tokio::test]
    async fn drop_of_inactive_pipeline_leaves_active_one() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PipelineRegistry::new());
        let first = builder(&dir, "p1").registry(Arc::clone(&registry)).create().unwrap();
        let second = builder(&dir, "p2").registry(Arc::clone(&registry)).create().unwrap();
        assert!(!first.is_active());

        let working_dir = first.working_dir().to_path_buf();
        first.drop().await.unwrap();
        assert!(!working_dir.exists());
        assert!(second.is_active());
    }
}
