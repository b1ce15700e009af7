//! Items flowing through a resource pipe.

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

/// Blocking computation producing more pipe items.
pub type DeferredFn = Box<dyn FnOnce() -> anyhow::Result<PipeItem> + Send + 'static>;

/// Async computation producing more pipe items.
pub type PendingFuture = BoxFuture<'static, anyhow::Result<PipeItem>>;

/// A value with an optional table name override.
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    pub value: Value,
    /// Wins over every table name policy of the resource.
    pub table_name: Option<String>,
}

impl DataItem {
    #[must_use]
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            table_name: None,
        }
    }

    /// Route this item (and every row it expands to) into `table_name`.
    #[must_use]
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }
}

impl From<Value> for DataItem {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Everything a pipe head, map or transformer may produce.
///
/// Computations resolve to another `PipeItem`, so deferred work may itself
/// yield rows, lists or further work.
pub enum PipeItem {
    /// A row, a scalar, or an array expanded into one row per element.
    Ready(DataItem),
    /// Items spliced into the sequence in order.
    Many(Vec<PipeItem>),
    /// Runs on the blocking worker pool.
    Deferred(DeferredFn),
    /// Awaited on the runtime.
    Pending(PendingFuture),
}

impl PipeItem {
    #[must_use]
    pub fn ready(value: impl Into<Value>) -> Self {
        Self::Ready(DataItem::new(value))
    }

    #[must_use]
    pub fn many(items: impl IntoIterator<Item = PipeItem>) -> Self {
        Self::Many(items.into_iter().collect())
    }

    #[must_use]
    pub fn deferred<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<PipeItem> + Send + 'static,
    {
        Self::Deferred(Box::new(f))
    }

    #[must_use]
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<PipeItem>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }
}

impl From<Value> for PipeItem {
    fn from(value: Value) -> Self {
        Self::ready(value)
    }
}

impl From<DataItem> for PipeItem {
    fn from(item: DataItem) -> Self {
        Self::Ready(item)
    }
}

impl fmt::Debug for PipeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(item) => f.debug_tuple("Ready").field(item).finish(),
            Self::Many(items) => f.debug_tuple("Many").field(items).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_name_annotation() {
        let item = DataItem::new(json!({"id": 1})).with_table_name("users");
        assert_eq!(item.table_name.as_deref(), Some("users"));
    }

    #[test]
    fn debug_hides_computations() {
        let item = PipeItem::many([PipeItem::ready(json!(1)), PipeItem::deferred(|| Ok(PipeItem::ready(json!(2))))]);
        let shown = format!("{item:?}");
        assert!(shown.contains("Deferred(..)"), "got {shown}");
        assert!(shown.contains("Number(1)"), "got {shown}");
    }
}
