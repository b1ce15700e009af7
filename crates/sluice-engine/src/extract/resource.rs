//! Resources: named producers of rows with load hints and a pipe of steps.

use std::fmt;
use std::sync::{Arc, PoisonError};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::{Map, Value};
use sluice_types::naming;
use sluice_types::schema::{ColumnHint, WriteDisposition};

use super::drain::SharedTxn;
use super::item::{DataItem, PipeItem};
use crate::errors::{ExtractError, PipelineError};
use crate::pipeline::PipelineRegistry;

/// Stream of items produced by a pipe head.
pub type ItemStream = BoxStream<'static, anyhow::Result<PipeItem>>;

pub(crate) type HeadFactory = Box<dyn FnOnce(ResourceContext) -> ItemStream + Send>;
type TableNameFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;
type MapFn = Arc<dyn Fn(DataItem) -> anyhow::Result<DataItem> + Send + Sync>;
type FilterFn = Arc<dyn Fn(&DataItem) -> bool + Send + Sync>;
type TransformFn = Arc<dyn Fn(DataItem, &ResourceContext) -> anyhow::Result<PipeItem> + Send + Sync>;

// ---------------------------------------------------------------------------
// ResourceContext
// ---------------------------------------------------------------------------

/// Handle given to producers and transformers for reading and writing state.
///
/// Writes go to the source's working copy and are persisted only when the
/// whole source extracts successfully.
#[derive(Clone)]
pub struct ResourceContext {
    source_name: String,
    resource_name: String,
    txn: SharedTxn,
}

impl ResourceContext {
    pub(crate) fn new(source_name: String, resource_name: String, txn: SharedTxn) -> Self {
        Self {
            source_name,
            resource_name,
            txn,
        }
    }

    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    #[must_use]
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Snapshot of the source namespace, without nested resource states.
    #[must_use]
    pub fn source_state(&self) -> Map<String, Value> {
        let txn = self.txn.lock().unwrap_or_else(PoisonError::into_inner);
        txn.state
            .source(&self.source_name)
            .map(|s| s.values.clone())
            .unwrap_or_default()
    }

    pub fn update_source_state<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut txn = self.txn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut txn.state.source_mut(&self.source_name).values)
    }

    /// Snapshot of this resource's namespace.
    #[must_use]
    pub fn resource_state(&self) -> Map<String, Value> {
        let txn = self.txn.lock().unwrap_or_else(PoisonError::into_inner);
        txn.state
            .resource(&self.source_name, &self.resource_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_resource_state<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut txn = self.txn.lock().unwrap_or_else(PoisonError::into_inner);
        f(txn.state.resource_mut(&self.source_name, &self.resource_name))
    }

    /// Snapshot of the pipeline-local namespace, which is never synced.
    #[must_use]
    pub fn local_state(&self) -> Map<String, Value> {
        let txn = self.txn.lock().unwrap_or_else(PoisonError::into_inner);
        txn.state.local.clone()
    }

    pub fn update_local_state<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut txn = self.txn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut txn.state.local)
    }
}

impl fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContext")
            .field("source_name", &self.source_name)
            .field("resource_name", &self.resource_name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Table names and steps
// ---------------------------------------------------------------------------

/// Where the rows of a resource go, unless an item names its own table.
#[derive(Clone)]
pub enum TableNamePolicy {
    Static(String),
    Function(TableNameFn),
}

impl fmt::Debug for TableNamePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(name) => f.debug_tuple("Static").field(name).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

#[derive(Clone)]
pub(crate) enum PipeStep {
    Map(MapFn),
    Filter(FilterFn),
    Transform(TransformFn),
}

/// Everything about a resource except its producer and steps.
#[derive(Debug, Clone)]
pub(crate) struct ResourceSpec {
    pub name: String,
    pub table_name: Option<TableNamePolicy>,
    pub write_disposition: WriteDisposition,
    pub primary_key: Vec<String>,
    pub columns: Vec<ColumnHint>,
    pub row_hash: bool,
}

impl ResourceSpec {
    /// Item annotation, then the policy, then the resource name; normalized.
    pub(crate) fn resolve_table_name(&self, item: &DataItem) -> String {
        let raw = match (&item.table_name, &self.table_name) {
            (Some(name), _) => name.clone(),
            (None, Some(TableNamePolicy::Function(f))) => f(&item.value),
            (None, Some(TableNamePolicy::Static(name))) => name.clone(),
            (None, None) => self.name.clone(),
        };
        naming::normalize_identifier(&raw)
    }

    /// Hints with normalized column names, primary key columns included.
    pub(crate) fn column_hints(&self) -> Vec<ColumnHint> {
        let mut hints: Vec<ColumnHint> = self
            .columns
            .iter()
            .map(|h| ColumnHint {
                name: naming::normalize_identifier(&h.name),
                ..h.clone()
            })
            .collect();
        for pk in &self.primary_key {
            hints.push(ColumnHint::new(naming::normalize_identifier(pk)).primary_key(true));
        }
        hints
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A named producer of rows and the steps its items go through.
///
/// A resource without a producer is a transformer: it only runs once bound
/// to a parent with [`Resource::pipe`].
pub struct Resource {
    pub(crate) spec: ResourceSpec,
    pub(crate) head: Option<HeadFactory>,
    pub(crate) steps: Vec<PipeStep>,
    pub(crate) limit: Option<usize>,
}

impl Resource {
    fn with_head(name: impl Into<String>, head: Option<HeadFactory>) -> Self {
        Self {
            spec: ResourceSpec {
                name: name.into(),
                table_name: None,
                write_disposition: WriteDisposition::default(),
                primary_key: Vec::new(),
                columns: Vec::new(),
                row_hash: false,
            },
            head,
            steps: Vec::new(),
            limit: None,
        }
    }

    /// Resource producing the items of a synchronous iterator.
    #[must_use]
    pub fn from_iter<I>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator + Send + 'static,
        I::IntoIter: Send + 'static,
        I::Item: Into<PipeItem>,
    {
        Self::from_results(name, items.into_iter().map(|item| Ok(item.into())))
    }

    /// Like [`Resource::from_iter`] for producers that can fail.
    #[must_use]
    pub fn from_results<I>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<PipeItem>> + Send + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(name, stream::iter(items))
    }

    /// Resource producing the items of an async stream.
    #[must_use]
    pub fn from_stream<S>(name: impl Into<String>, items: S) -> Self
    where
        S: Stream<Item = anyhow::Result<PipeItem>> + Send + 'static,
    {
        Self::with_head(name, Some(Box::new(move |_: ResourceContext| items.boxed())))
    }

    /// Resource whose producer is built with access to state.
    #[must_use]
    pub fn with_context<F, S>(name: impl Into<String>, producer: F) -> Self
    where
        F: FnOnce(ResourceContext) -> S + Send + 'static,
        S: Stream<Item = anyhow::Result<PipeItem>> + Send + 'static,
    {
        Self::with_head(
            name,
            Some(Box::new(move |ctx: ResourceContext| producer(ctx).boxed())),
        )
    }

    /// Resource over literal rows: an array of rows, a single scalar, or `null`
    /// for nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidResourceDataType`] for a bare object;
    /// wrap it in an array to load it as one row.
    pub fn from_rows(name: impl Into<String>, rows: Value) -> Result<Self, ExtractError> {
        let name = name.into();
        match rows {
            Value::Object(_) => Err(ExtractError::InvalidResourceDataType {
                resource: name,
                value: truncate_for_error(&rows),
            }),
            Value::Array(items) => Ok(Self::from_iter(name, items)),
            Value::Null => Ok(Self::from_iter(name, Vec::<Value>::new())),
            scalar => Ok(Self::from_iter(name, [scalar])),
        }
    }

    /// Transformer applied to every row of the resource it is piped from.
    #[must_use]
    pub fn transformer<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(DataItem, &ResourceContext) -> anyhow::Result<PipeItem> + Send + Sync + 'static,
    {
        let mut resource = Self::with_head(name, None);
        resource.steps.push(PipeStep::Transform(Arc::new(f)));
        resource
    }

    // -----------------------------------------------------------------------
    // Composition
    // -----------------------------------------------------------------------

    /// Feed this resource's rows into `transformer`. The result carries the
    /// transformer's name and hints.
    #[must_use]
    pub fn pipe(self, transformer: Resource) -> Resource {
        let mut steps = self.steps;
        steps.extend(transformer.steps);
        Resource {
            spec: transformer.spec,
            head: self.head,
            steps,
            limit: self.limit,
        }
    }

    /// Synchronous per-row map.
    #[must_use]
    pub fn add_map<F>(mut self, f: F) -> Self
    where
        F: Fn(DataItem) -> anyhow::Result<DataItem> + Send + Sync + 'static,
    {
        self.steps.push(PipeStep::Map(Arc::new(f)));
        self
    }

    /// Drop rows for which `f` returns `false`.
    #[must_use]
    pub fn add_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&DataItem) -> bool + Send + Sync + 'static,
    {
        self.steps.push(PipeStep::Filter(Arc::new(f)));
        self
    }

    /// Take at most `n` items from the producer. Bounds infinite producers.
    #[must_use]
    pub fn add_limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    // -----------------------------------------------------------------------
    // Hints
    // -----------------------------------------------------------------------

    /// Rename the resource. The table name follows unless set explicitly.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = name.into();
        self
    }

    #[must_use]
    pub fn write_disposition(mut self, write_disposition: WriteDisposition) -> Self {
        self.spec.write_disposition = write_disposition;
        self
    }

    #[must_use]
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn columns(mut self, hints: impl IntoIterator<Item = ColumnHint>) -> Self {
        self.spec.columns = hints.into_iter().collect();
        self
    }

    /// Derive row identity from row content.
    #[must_use]
    pub fn row_hash(mut self, row_hash: bool) -> Self {
        self.spec.row_hash = row_hash;
        self
    }

    #[must_use]
    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.spec.table_name = Some(TableNamePolicy::Static(table_name.into()));
        self
    }

    /// Pick the table per row.
    #[must_use]
    pub fn table_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.spec.table_name = Some(TableNamePolicy::Function(Arc::new(f)));
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn get_write_disposition(&self) -> WriteDisposition {
        self.spec.write_disposition
    }

    /// No producer is bound yet.
    #[must_use]
    pub fn is_transformer(&self) -> bool {
        self.head.is_none()
    }

    /// Committed state of this resource, read through the active pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PipelineStateNotAvailable`] when no pipeline
    /// is active in `registry`.
    pub fn state(
        &self,
        registry: &PipelineRegistry,
        source_name: &str,
    ) -> Result<Map<String, Value>, PipelineError> {
        registry.resource_state(source_name, &self.spec.name)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("spec", &self.spec)
            .field("steps", &self.steps.len())
            .field("limit", &self.limit)
            .field("transformer", &self.is_transformer())
            .finish()
    }
}

/// Short rendering of an offending value for error messages.
pub(crate) fn truncate_for_error(value: &Value) -> String {
    const MAX: usize = 120;
    let rendered = value.to_string();
    match rendered.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &rendered[..idx]),
        None => rendered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_name_precedence() {
        let resource = Resource::from_iter("Users", Vec::<Value>::new());
        let plain = DataItem::new(json!({"kind": "Admin"}));
        assert_eq!(resource.spec.resolve_table_name(&plain), "users");

        let resource = resource.table_name("people");
        assert_eq!(resource.spec.resolve_table_name(&plain), "people");

        let resource = resource.table_name_fn(|row| format!("{}Users", row["kind"].as_str().unwrap()));
        assert_eq!(resource.spec.resolve_table_name(&plain), "admin_users");

        let annotated = plain.with_table_name("Override");
        assert_eq!(resource.spec.resolve_table_name(&annotated), "override");
    }

    #[test]
    fn renamed_resource_table_follows_name() {
        let resource = Resource::from_iter("a", Vec::<Value>::new()).with_name("Renamed");
        let item = DataItem::new(json!({}));
        assert_eq!(resource.spec.resolve_table_name(&item), "renamed");
    }

    #[test]
    fn bare_object_rows_are_rejected() {
        let err = Resource::from_rows("t", json!({"a": 1})).unwrap_err();
        assert!(
            matches!(&err, ExtractError::InvalidResourceDataType { resource, .. } if resource == "t"),
            "got {err:?}"
        );
        assert!(Resource::from_rows("t", json!([{"a": 1}])).is_ok());
    }

    #[test]
    fn pipe_binds_transformer() {
        let parent = Resource::from_iter("parent", [json!(1)]).add_limit(5);
        let child = Resource::transformer("child", |item, _| Ok(PipeItem::Ready(item)))
            .write_disposition(WriteDisposition::Merge)
            .primary_key(["id"]);
        assert!(child.is_transformer());

        let bound = parent.pipe(child);
        assert!(!bound.is_transformer());
        assert_eq!(bound.name(), "child");
        assert_eq!(bound.get_write_disposition(), WriteDisposition::Merge);
        assert_eq!(bound.steps.len(), 1);
        assert_eq!(bound.limit, Some(5));
    }

    #[test]
    fn column_hints_include_primary_key() {
        let resource = Resource::from_iter("r", Vec::<Value>::new())
            .primary_key(["userId"])
            .columns([ColumnHint::new("createdAt").nullable(false)]);
        let hints = resource.spec.column_hints();
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].name, "created_at");
        assert_eq!(hints[1].name, "user_id");
        assert_eq!(hints[1].primary_key, Some(true));
    }

    #[test]
    fn long_values_are_truncated() {
        let value = json!("x".repeat(500));
        assert!(truncate_for_error(&value).ends_with("..."));
        assert_eq!(truncate_for_error(&json!(1)), "1");
    }
}
