//! Drains one resource pipe into the source's load package.
//!
//! The drain loop is agnostic of how items are produced: ready values are
//! expanded and pushed through the pipe steps in place, deferred and pending
//! computations run as tasks and re-enter the queue at the step they were
//! produced for. Completion order does not matter.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use serde_json::{Map, Value};
use sluice_types::naming::VALUE_COLUMN;
use sluice_types::schema::Schema;
use sluice_types::state::PipelineState;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::item::{DataItem, PipeItem};
use super::resource::{truncate_for_error, ItemStream, PipeStep, Resource, ResourceContext, ResourceSpec};
use crate::errors::ExtractError;
use crate::load::storage::PackageWriter;

/// Working copies of everything a source changes while it extracts.
pub(crate) struct SourceTxn {
    pub schema: Schema,
    pub state: PipelineState,
    pub writer: PackageWriter,
    pub row_counts: BTreeMap<String, u64>,
    registered: HashSet<(String, String)>,
}

pub(crate) type SharedTxn = Arc<Mutex<SourceTxn>>;

impl SourceTxn {
    pub(crate) fn new(schema: Schema, state: PipelineState, writer: PackageWriter) -> Self {
        Self {
            schema,
            state,
            writer,
            row_counts: BTreeMap::new(),
            registered: HashSet::new(),
        }
    }

    /// Register `table` for the resource once, applying its hints.
    pub(crate) fn register_table(&mut self, spec: &ResourceSpec, table_name: &str) {
        if !self
            .registered
            .insert((spec.name.clone(), table_name.to_string()))
        {
            return;
        }
        let table = self.schema.get_or_insert_table(table_name);
        if table.resource.is_none() {
            table.resource = Some(spec.name.clone());
        }
        table.write_disposition = spec.write_disposition;
        table.row_hash = spec.row_hash;
        for hint in spec.column_hints() {
            table.apply_hint(&hint);
        }
    }

    pub(crate) fn write_row(&mut self, spec: &ResourceSpec, table_name: &str, row: &Value) -> Result<(), ExtractError> {
        self.register_table(spec, table_name);
        self.writer.write_row(table_name, row)?;
        *self.row_counts.entry(table_name.to_string()).or_default() += 1;
        Ok(())
    }
}

/// Concurrency bounds shared by all resources of a source.
#[derive(Clone)]
pub(crate) struct DrainLimits {
    /// Deferred computations on the blocking pool.
    pub workers: Arc<Semaphore>,
    /// Pending futures on the runtime.
    pub in_flight: Arc<Semaphore>,
}

impl DrainLimits {
    pub(crate) fn new(workers: usize, in_flight: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(workers.max(1))),
            in_flight: Arc::new(Semaphore::new(in_flight.max(1))),
        }
    }
}

type TaskOutput = (anyhow::Result<PipeItem>, usize);

struct Drain {
    spec: ResourceSpec,
    steps: Vec<PipeStep>,
    ctx: ResourceContext,
    txn: SharedTxn,
    limits: DrainLimits,
    /// Items waiting to be processed, with the index of the next step.
    queue: VecDeque<(PipeItem, usize)>,
    tasks: JoinSet<TaskOutput>,
    rows: u64,
}

/// Drain `resource` to completion. Returns the number of rows written.
pub(crate) async fn drain_resource(
    resource: Resource,
    source_name: String,
    txn: SharedTxn,
    limits: DrainLimits,
) -> Result<u64, ExtractError> {
    let Resource {
        spec,
        head,
        steps,
        limit,
    } = resource;
    let Some(head) = head else {
        return Err(ExtractError::UnboundTransformer { resource: spec.name });
    };

    let ctx = ResourceContext::new(source_name, spec.name.clone(), Arc::clone(&txn));
    let mut items = head(ctx.clone());
    if let Some(n) = limit {
        items = items.take(n).boxed();
    }

    let drain = Drain {
        spec,
        steps,
        ctx,
        txn,
        limits,
        queue: VecDeque::new(),
        tasks: JoinSet::new(),
        rows: 0,
    };
    drain.run(items).await
}

impl Drain {
    async fn run(mut self, mut head: ItemStream) -> Result<u64, ExtractError> {
        let mut head_done = false;
        loop {
            if let Some((item, stage)) = self.queue.pop_front() {
                self.process(item, stage).await?;
                continue;
            }
            if head_done && self.tasks.is_empty() {
                break;
            }
            tokio::select! {
                next = head.next(), if !head_done => match next {
                    Some(Ok(item)) => self.queue.push_back((item, 0)),
                    Some(Err(source)) => return Err(self.producer_error(source)),
                    None => head_done = true,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    let (result, stage) = joined.map_err(|e| ExtractError::TaskFailed {
                        resource: self.spec.name.clone(),
                        message: e.to_string(),
                    })?;
                    let item = result.map_err(|e| self.producer_error(e))?;
                    self.queue.push_back((item, stage));
                }
            }
        }
        tracing::debug!(resource = self.spec.name, rows = self.rows, "Resource drained");
        Ok(self.rows)
    }

    fn producer_error(&self, source: anyhow::Error) -> ExtractError {
        ExtractError::Producer {
            resource: self.spec.name.clone(),
            source: source.into(),
        }
    }

    fn semaphore_closed(&self, e: &tokio::sync::AcquireError) -> ExtractError {
        ExtractError::TaskFailed {
            resource: self.spec.name.clone(),
            message: format!("semaphore closed: {e}"),
        }
    }

    async fn process(&mut self, item: PipeItem, stage: usize) -> Result<(), ExtractError> {
        match item {
            PipeItem::Ready(data) => self.process_ready(data, stage)?,
            PipeItem::Many(items) => {
                for item in items.into_iter().rev() {
                    self.queue.push_front((item, stage));
                }
            }
            PipeItem::Deferred(compute) => {
                let permit = Arc::clone(&self.limits.workers)
                    .acquire_owned()
                    .await
                    .map_err(|e| self.semaphore_closed(&e))?;
                self.tasks.spawn(async move {
                    let _permit = permit;
                    let result = tokio::task::spawn_blocking(compute)
                        .await
                        .unwrap_or_else(|e| Err(anyhow::anyhow!("deferred computation panicked: {e}")));
                    (result, stage)
                });
            }
            PipeItem::Pending(future) => {
                let permit = Arc::clone(&self.limits.in_flight)
                    .acquire_owned()
                    .await
                    .map_err(|e| self.semaphore_closed(&e))?;
                self.tasks.spawn(async move {
                    let _permit = permit;
                    (future.await, stage)
                });
            }
        }
        Ok(())
    }

    fn process_ready(&mut self, data: DataItem, stage: usize) -> Result<(), ExtractError> {
        let DataItem { value, table_name } = data;
        match value {
            Value::Null => Ok(()),
            Value::Array(values) => {
                for value in values.into_iter().rev() {
                    if value.is_array() {
                        return Err(ExtractError::InvalidResourceDataType {
                            resource: self.spec.name.clone(),
                            value: truncate_for_error(&value),
                        });
                    }
                    let item = DataItem {
                        value,
                        table_name: table_name.clone(),
                    };
                    self.queue.push_front((PipeItem::Ready(item), stage));
                }
                Ok(())
            }
            value => self.apply_step(DataItem { value, table_name }, stage),
        }
    }

    fn apply_step(&mut self, item: DataItem, stage: usize) -> Result<(), ExtractError> {
        let Some(step) = self.steps.get(stage).cloned() else {
            return self.emit(item);
        };
        match step {
            PipeStep::Map(map) => {
                let mapped = map(item).map_err(|e| self.producer_error(e))?;
                self.queue.push_front((PipeItem::Ready(mapped), stage + 1));
            }
            PipeStep::Filter(keep) => {
                if keep(&item) {
                    self.queue.push_front((PipeItem::Ready(item), stage + 1));
                }
            }
            PipeStep::Transform(transform) => {
                let out = transform(item, &self.ctx).map_err(|e| self.producer_error(e))?;
                self.queue.push_front((out, stage + 1));
            }
        }
        Ok(())
    }

    fn emit(&mut self, item: DataItem) -> Result<(), ExtractError> {
        let table_name = self.spec.resolve_table_name(&item);
        let row = match item.value {
            row @ Value::Object(_) => row,
            scalar => {
                let mut row = Map::new();
                row.insert(VALUE_COLUMN.to_string(), scalar);
                Value::Object(row)
            }
        };
        let mut txn = self.txn.lock().unwrap_or_else(PoisonError::into_inner);
        txn.write_row(&self.spec, &table_name, &row)?;
        self.rows += 1;
        Ok(())
    }
}
