use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use bizdesk_core::errors::{RemoteError, RemoteErrorKind};
use bizdesk_core::query::{DeleteMode, Filter, Query, Row, SortDirection, WriteOp};
use bizdesk_core::scope::{Scope, ScopeKey};

use super::{require_filters, RemoteSession, RemoteStore};

/// In-process table store with the same filter, order and paging semantics as
/// the REST backend. User scopes only see rows whose `user_id` matches, which
/// mirrors the backend's row-level security policies.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    next_id: AtomicU64,
    connects: AtomicUsize,
    selects: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut tables = self.state.tables.write().await;
        tables.entry(table.to_string()).or_default().extend(rows);
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let tables = self.state.tables.read().await;
        tables.get(table).cloned().unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(AtomicOrdering::SeqCst)
    }

    pub fn select_count(&self) -> usize {
        self.state.selects.load(AtomicOrdering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.state.writes.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn connect(&self, scope: &Scope) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        self.state.connects.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Arc::new(MemorySession { state: self.state.clone(), scope: scope.key() }))
    }
}

struct MemorySession {
    state: Arc<MemoryState>,
    scope: ScopeKey,
}

impl MemorySession {
    fn visible(&self, row: &Row) -> bool {
        match &self.scope {
            ScopeKey::Service => true,
            ScopeKey::User(user_id) => {
                row.get("user_id").and_then(Value::as_str) == Some(user_id.as_str())
            }
        }
    }

    fn selected(&self, row: &Row, filters: &[Filter]) -> bool {
        self.visible(row) && filters.iter().all(|filter| filter.matches(row))
    }

    fn prepare_insert(&self, table: &str, row: &Row) -> Result<Row, RemoteError> {
        let Value::Object(fields) = row else {
            return Err(RemoteError::new(
                RemoteErrorKind::Validation,
                format!("rows inserted into `{table}` must be JSON objects"),
            ));
        };
        let mut fields = fields.clone();
        if !fields.contains_key("id") {
            let id = self.state.next_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            fields.insert("id".to_string(), Value::String(format!("{table}-{id}")));
        }
        if let ScopeKey::User(user_id) = &self.scope {
            fields.entry("user_id").or_insert_with(|| Value::String(user_id.clone()));
        }
        Ok(Value::Object(fields))
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, RemoteError> {
        self.state.selects.fetch_add(1, AtomicOrdering::SeqCst);
        let tables = self.state.tables.read().await;
        let Some(rows) = tables.get(&query.table) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<&Row> =
            rows.iter().filter(|row| self.selected(row, &query.filters)).collect();

        matched.sort_by(|left, right| {
            for clause in &query.order {
                let ordering = compare_nulls_last(
                    left.get(&clause.column).unwrap_or(&Value::Null),
                    right.get(&clause.column).unwrap_or(&Value::Null),
                );
                let ordering = match clause.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });

        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map(|limit| limit as usize).unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| project(row, &query.columns))
            .collect())
    }

    async fn write(&self, op: &WriteOp) -> Result<Vec<Row>, RemoteError> {
        self.state.writes.fetch_add(1, AtomicOrdering::SeqCst);
        if let WriteOp::Update { filters, .. } | WriteOp::Delete { filters, .. } = op {
            require_filters(op, filters)?;
        }
        let mut tables = self.state.tables.write().await;
        let rows = tables.entry(op.table().to_string()).or_default();

        match op {
            WriteOp::Insert { table, rows: new_rows } => {
                let prepared = new_rows
                    .iter()
                    .map(|row| self.prepare_insert(table, row))
                    .collect::<Result<Vec<_>, _>>()?;
                rows.extend(prepared.iter().cloned());
                Ok(prepared)
            }
            WriteOp::Upsert { table, rows: new_rows, on_conflict } => {
                let key = on_conflict.as_deref().unwrap_or("id");
                let mut written = Vec::with_capacity(new_rows.len());
                for row in new_rows {
                    let prepared = self.prepare_insert(table, row)?;
                    let existing = rows.iter_mut().find(|current| {
                        self.visible(current)
                            && current.get(key).is_some()
                            && current.get(key) == prepared.get(key)
                    });
                    match existing {
                        Some(current) => {
                            merge(current, &prepared);
                            written.push(current.clone());
                        }
                        None => {
                            rows.push(prepared.clone());
                            written.push(prepared);
                        }
                    }
                }
                Ok(written)
            }
            WriteOp::Update { filters, patch, .. } => {
                let mut updated = Vec::new();
                for row in rows.iter_mut().filter(|row| self.selected(row, filters)) {
                    merge(row, patch);
                    updated.push(row.clone());
                }
                Ok(updated)
            }
            WriteOp::Delete { filters, mode: DeleteMode::Soft { column }, .. } => {
                let patch = DeleteMode::soft_delete_patch(column, Utc::now());
                let mut stamped = Vec::new();
                for row in rows.iter_mut().filter(|row| self.selected(row, filters)) {
                    merge(row, &patch);
                    stamped.push(row.clone());
                }
                Ok(stamped)
            }
            WriteOp::Delete { filters, mode: DeleteMode::Hard, .. } => {
                let (removed, kept): (Vec<Row>, Vec<Row>) =
                    rows.drain(..).partition(|row| self.selected(row, filters));
                *rows = kept;
                Ok(removed)
            }
        }
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

fn merge(target: &mut Row, patch: &Row) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn project(row: &Row, columns: &[String]) -> Row {
    if columns.is_empty() || columns.iter().any(|column| column == "*") {
        return row.clone();
    }
    let mut projected = Map::new();
    for column in columns {
        if let Some(value) = row.get(column) {
            projected.insert(column.clone(), value.clone());
        }
    }
    Value::Object(projected)
}

fn compare_nulls_last(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}
