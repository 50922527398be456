//! Grouped writes with per-item outcomes.
//!
//! A batch may mix tables and operations. Items are grouped by (table,
//! operation) in order of first appearance and each group is processed in
//! chunks; a chunk borrows one pooled connection and runs its items one after
//! another through the retry path. A failing item or a chunk that cannot get
//! a connection is recorded and the batch moves on. Every written table is
//! invalidated once, after the last chunk.

use serde::Serialize;
use tracing::{info, warn};

use bizdesk_core::errors::{DataError, RemoteError, RemoteErrorKind};
use bizdesk_core::query::{DeleteMode, Filter, Row, WriteOp};
use bizdesk_core::scope::Scope;

use crate::cache::QueryCache;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::retry::BackoffExecutor;

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOperation {
    Insert,
    Upsert { on_conflict: Option<String> },
    Update,
    Delete { mode: DeleteMode },
}

impl BatchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Upsert { .. } => "upsert",
            Self::Update => "update",
            Self::Delete { mode: DeleteMode::Hard } => "delete",
            Self::Delete { mode: DeleteMode::Soft { .. } } => "soft_delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchItem {
    /// Identifies the item in the outcome list, usually the record id.
    pub key: String,
    pub table: String,
    pub operation: BatchOperation,
    pub payload: Option<Row>,
    pub filters: Vec<Filter>,
}

impl BatchItem {
    pub fn insert(table: impl Into<String>, key: impl Into<String>, row: Row) -> Self {
        Self {
            key: key.into(),
            table: table.into(),
            operation: BatchOperation::Insert,
            payload: Some(row),
            filters: Vec::new(),
        }
    }

    pub fn upsert(
        table: impl Into<String>,
        key: impl Into<String>,
        row: Row,
        on_conflict: Option<String>,
    ) -> Self {
        Self {
            operation: BatchOperation::Upsert { on_conflict },
            ..Self::insert(table, key, row)
        }
    }

    pub fn update(
        table: impl Into<String>,
        key: impl Into<String>,
        filters: Vec<Filter>,
        patch: Row,
    ) -> Self {
        Self {
            key: key.into(),
            table: table.into(),
            operation: BatchOperation::Update,
            payload: Some(patch),
            filters,
        }
    }

    pub fn delete(
        table: impl Into<String>,
        key: impl Into<String>,
        filters: Vec<Filter>,
        mode: DeleteMode,
    ) -> Self {
        Self {
            key: key.into(),
            table: table.into(),
            operation: BatchOperation::Delete { mode },
            payload: None,
            filters,
        }
    }

    /// Deletes the row whose `id` equals `id`.
    pub fn delete_by_id(table: impl Into<String>, id: impl Into<String>, mode: DeleteMode) -> Self {
        let id = id.into();
        Self::delete(table, id.clone(), vec![Filter::eq("id", id)], mode)
    }

    /// The single-row write this item stands for. Malformed items are
    /// rejected here without a remote call.
    fn write_op(&self) -> Result<WriteOp, RemoteError> {
        let table = self.table.clone();
        let missing = |what: &str| {
            RemoteError::new(
                RemoteErrorKind::Validation,
                format!("batch item `{}` has no {what}", self.key),
            )
        };
        match &self.operation {
            BatchOperation::Insert => {
                let row = self.payload.clone().ok_or_else(|| missing("payload"))?;
                Ok(WriteOp::Insert { table, rows: vec![row] })
            }
            BatchOperation::Upsert { on_conflict } => {
                let row = self.payload.clone().ok_or_else(|| missing("payload"))?;
                Ok(WriteOp::Upsert { table, rows: vec![row], on_conflict: on_conflict.clone() })
            }
            BatchOperation::Update => {
                let patch = self.payload.clone().ok_or_else(|| missing("patch"))?;
                if self.filters.is_empty() {
                    return Err(missing("filters"));
                }
                Ok(WriteOp::Update { table, filters: self.filters.clone(), patch })
            }
            BatchOperation::Delete { mode } => {
                if self.filters.is_empty() {
                    return Err(missing("filters"));
                }
                Ok(WriteOp::Delete { table, filters: self.filters.clone(), mode: mode.clone() })
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub items: Vec<BatchItem>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes the rows with the given ids, one item per id.
    pub fn delete_ids<I, S>(table: impl Into<String>, ids: I, mode: DeleteMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        Self {
            items: ids
                .into_iter()
                .map(|id| BatchItem::delete_by_id(table.clone(), id, mode.clone()))
                .collect(),
        }
    }

    pub fn item(mut self, item: BatchItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Distinct tables touched, in order of first appearance.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = Vec::new();
        for item in &self.items {
            if !tables.contains(&item.table.as_str()) {
                tables.push(item.table.as_str());
            }
        }
        tables
    }

    /// Item indices grouped by (table, operation), groups in order of first
    /// appearance and items in batch order within a group.
    fn groups(&self) -> Vec<Vec<usize>> {
        let mut groups: Vec<(&str, &BatchOperation, Vec<usize>)> = Vec::new();
        for (index, item) in self.items.iter().enumerate() {
            let existing = groups.iter_mut().find(|(table, operation, _)| {
                *table == item.table && **operation == item.operation
            });
            match existing {
                Some((_, _, indices)) => indices.push(index),
                None => groups.push((item.table.as_str(), &item.operation, vec![index])),
            }
        }
        groups.into_iter().map(|(_, _, indices)| indices).collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ItemOutcome {
    pub key: String,
    pub result: Result<Vec<Row>, DataError>,
}

impl ItemOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Complete,
    Partial,
    Failed,
}

/// Outcomes in item order. A batch never fails as a whole.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchResult {
    pub outcomes: Vec<ItemOutcome>,
    pub succeeded_count: usize,
    pub failed_count: usize,
}

impl BatchResult {
    fn record(&mut self, key: String, result: Result<Vec<Row>, DataError>) {
        if result.is_ok() {
            self.succeeded_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.outcomes.push(ItemOutcome { key, result });
    }

    pub fn status(&self) -> BatchStatus {
        match (self.succeeded_count, self.failed_count) {
            (_, 0) => BatchStatus::Complete,
            (0, _) => BatchStatus::Failed,
            _ => BatchStatus::Partial,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &DataError)> {
        self.outcomes.iter().filter_map(|outcome| match &outcome.result {
            Ok(_) => None,
            Err(error) => Some((outcome.key.as_str(), error)),
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.outcomes.iter().filter_map(|outcome| outcome.result.as_ref().ok()).flatten()
    }

    /// `PartialBatchFailure` when any item failed.
    pub fn into_error(self) -> Option<DataError> {
        (self.failed_count > 0).then_some(DataError::PartialBatchFailure {
            succeeded: self.succeeded_count,
            failed: self.failed_count,
        })
    }
}

type Slots = Vec<Option<Result<Vec<Row>, DataError>>>;

pub struct BatchExecutor<'a> {
    pool: &'a ConnectionPool,
    retry: &'a BackoffExecutor,
    cache: Option<&'a QueryCache>,
    max_chunk_size: usize,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(pool: &'a ConnectionPool, retry: &'a BackoffExecutor) -> Self {
        Self { pool, retry, cache: None, max_chunk_size: DEFAULT_MAX_CHUNK_SIZE }
    }

    pub fn with_cache(mut self, cache: &'a QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size.max(1);
        self
    }

    /// Runs every item and returns their outcomes. Only a cache malfunction
    /// during the final invalidation is reported as an error.
    pub async fn run_batch(&self, scope: &Scope, batch: &Batch) -> Result<BatchResult, DataError> {
        let mut result = BatchResult::default();
        if batch.is_empty() {
            return Ok(result);
        }

        let mut slots: Slots = vec![None; batch.len()];
        let groups = batch.groups();
        for indices in &groups {
            for (chunk_index, chunk) in indices.chunks(self.max_chunk_size).enumerate() {
                self.run_chunk(scope, batch, chunk, chunk_index, &mut slots).await;
            }
        }

        for (item, slot) in batch.items.iter().zip(slots) {
            let outcome = slot.unwrap_or_else(|| {
                Err(DataError::Internal(format!("batch item `{}` was never run", item.key)))
            });
            result.record(item.key.clone(), outcome);
        }

        let tables = batch.tables();
        if let Some(cache) = self.cache {
            let key = scope.key();
            for table in &tables {
                cache.invalidate_after_write(&key, table)?;
            }
        }

        info!(
            event_name = "db.batch.completed",
            scope = %scope,
            tables = %tables.join(","),
            groups = groups.len(),
            succeeded = result.succeeded_count,
            failed = result.failed_count,
            "batch finished"
        );
        Ok(result)
    }

    /// Runs one chunk on a single connection. After a transport failure the
    /// connection is discarded and the rest of the chunk gets a fresh one.
    async fn run_chunk(
        &self,
        scope: &Scope,
        batch: &Batch,
        chunk: &[usize],
        chunk_index: usize,
        slots: &mut Slots,
    ) {
        let mut connection: Option<PooledConnection> = None;
        for (position, &index) in chunk.iter().enumerate() {
            let item = &batch.items[index];
            let op = match item.write_op() {
                Ok(op) => op,
                Err(error) => {
                    slots[index] = Some(Err(DataError::Permanent(error)));
                    continue;
                }
            };

            let live = match connection.take() {
                Some(live) => live,
                None => match self.pool.acquire(scope).await {
                    Ok(live) => live,
                    Err(error) => {
                        warn!(
                            event_name = "db.batch.chunk_failed",
                            scope = %scope,
                            table = %item.table,
                            operation = item.operation.as_str(),
                            chunk = chunk_index,
                            items = chunk.len() - position,
                            error = %error,
                            "could not acquire a connection for batch chunk"
                        );
                        for &rest in &chunk[position..] {
                            slots[rest] = Some(Err(error.clone()));
                        }
                        return;
                    }
                },
            };

            let session = live.session();
            let op = &op;
            let outcome = self.retry.run_write(op, move || session.write(op)).await;
            match outcome {
                Ok(rows) => {
                    slots[index] = Some(Ok(rows));
                    connection = Some(live);
                }
                Err(failure) => {
                    if failure.error().is_transient() {
                        live.discard();
                    } else {
                        connection = Some(live);
                    }
                    slots[index] = Some(Err(DataError::from(failure)));
                }
            }
        }
    }
}
