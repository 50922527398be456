//! Typed table operations.
//!
//! Filters are a closed set of operators rather than free-form JSON so that
//! two semantically identical queries always produce the same canonical
//! signature, which is what the read cache is keyed on.

use std::cmp::Ordering;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ErrorClass, RemoteError, RemoteErrorKind};

pub type Row = Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum FilterOp {
    Eq(Value),
    Neq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Like(String),
    #[serde(rename = "ilike")]
    ILike(String),
    IsNull,
    NotNull,
}

impl FilterOp {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Eq(_) => "eq",
            Self::Neq(_) => "neq",
            Self::Gt(_) => "gt",
            Self::Gte(_) => "gte",
            Self::Lt(_) => "lt",
            Self::Lte(_) => "lte",
            Self::In(_) => "in",
            Self::Like(_) => "like",
            Self::ILike(_) => "ilike",
            Self::IsNull => "is_null",
            Self::NotNull => "not_null",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    #[serde(flatten)]
    pub op: FilterOp,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp) -> Self {
        Self { column: column.into(), op }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq(value.into()))
    }

    pub fn in_set<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(column, FilterOp::In(values.into_iter().map(Into::into).collect()))
    }

    /// Evaluates the filter against a JSON row. A missing column reads as null.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.column).unwrap_or(&Value::Null);
        match &self.op {
            FilterOp::Eq(expected) => values_equal(actual, expected),
            FilterOp::Neq(expected) => !actual.is_null() && !values_equal(actual, expected),
            FilterOp::Gt(bound) => compare(actual, bound) == Some(Ordering::Greater),
            FilterOp::Gte(bound) => {
                matches!(compare(actual, bound), Some(Ordering::Greater | Ordering::Equal))
            }
            FilterOp::Lt(bound) => compare(actual, bound) == Some(Ordering::Less),
            FilterOp::Lte(bound) => {
                matches!(compare(actual, bound), Some(Ordering::Less | Ordering::Equal))
            }
            FilterOp::In(set) => set.iter().any(|candidate| values_equal(actual, candidate)),
            FilterOp::Like(pattern) => {
                actual.as_str().is_some_and(|text| like_match(pattern, text, false))
            }
            FilterOp::ILike(pattern) => {
                actual.as_str().is_some_and(|text| like_match(pattern, text, true))
            }
            FilterOp::IsNull => actual.is_null(),
            FilterOp::NotNull => !actual.is_null(),
        }
    }

    fn canonical(&self) -> String {
        let mut out = String::new();
        push_quoted(&mut out, &self.column);
        out.push('.');
        out.push_str(self.op.tag());
        out.push('.');
        match &self.op {
            FilterOp::Eq(value)
            | FilterOp::Neq(value)
            | FilterOp::Gt(value)
            | FilterOp::Gte(value)
            | FilterOp::Lt(value)
            | FilterOp::Lte(value) => canonical_value(value, &mut out),
            FilterOp::In(values) => {
                let mut members: Vec<String> = values
                    .iter()
                    .map(|value| {
                        let mut member = String::new();
                        canonical_value(value, &mut member);
                        member
                    })
                    .collect();
                members.sort();
                members.dedup();
                out.push('(');
                out.push_str(&members.join(","));
                out.push(')');
            }
            FilterOp::Like(pattern) | FilterOp::ILike(pattern) => push_quoted(&mut out, pattern),
            FilterOp::IsNull | FilterOp::NotNull => {}
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

/// A read against one table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    /// Empty means every column.
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order.push(OrderBy { column: column.into(), direction });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Deterministic textual form of the query shape.
    ///
    /// Filters are a conjunction, so they are sorted; `in` sets are sorted and
    /// deduplicated; selected columns are sorted and deduplicated. Order
    /// clauses keep their position because they change the result. Every
    /// caller-supplied string is JSON-quoted so separators cannot be forged.
    pub fn canonical_signature(&self) -> String {
        let mut columns: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut quoted = String::new();
                push_quoted(&mut quoted, column);
                quoted
            })
            .collect();
        columns.sort();
        columns.dedup();

        let mut filters: Vec<String> = self.filters.iter().map(Filter::canonical).collect();
        filters.sort();
        filters.dedup();

        let order: Vec<String> = self
            .order
            .iter()
            .map(|clause| {
                let mut rendered = String::new();
                push_quoted(&mut rendered, &clause.column);
                rendered.push('.');
                rendered.push_str(clause.direction.as_str());
                rendered
            })
            .collect();

        let mut out = String::new();
        out.push_str("t=");
        push_quoted(&mut out, &self.table);
        let _ = write!(
            out,
            "|s=[{}]|f=[{}]|o=[{}]|l={}|p={}",
            columns.join(","),
            filters.join(";"),
            order.join(","),
            self.limit.map(|limit| limit.to_string()).unwrap_or_else(|| "-".to_string()),
            self.offset.map(|offset| offset.to_string()).unwrap_or_else(|| "-".to_string()),
        );
        out
    }

    /// Short hash of [`Self::canonical_signature`], for logs.
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.canonical_signature().as_bytes()).to_hex()[..16].to_string()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeleteMode {
    #[default]
    Hard,
    /// Stamp `column` with the deletion time instead of removing the row.
    Soft { column: String },
}

impl DeleteMode {
    pub fn soft() -> Self {
        Self::Soft { column: "deleted_at".to_string() }
    }

    pub fn soft_delete_patch(column: &str, now: DateTime<Utc>) -> Row {
        let mut patch = Map::new();
        patch.insert(column.to_string(), Value::String(now.to_rfc3339()));
        Value::Object(patch)
    }
}

/// A mutation against one table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteOp {
    Insert { table: String, rows: Vec<Row> },
    Upsert { table: String, rows: Vec<Row>, on_conflict: Option<String> },
    Update { table: String, filters: Vec<Filter>, patch: Row },
    Delete { table: String, filters: Vec<Filter>, mode: DeleteMode },
}

impl WriteOp {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Upsert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. } => table,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Upsert { .. } => "upsert",
            Self::Update { .. } => "update",
            Self::Delete { mode: DeleteMode::Hard, .. } => "delete",
            Self::Delete { mode: DeleteMode::Soft { .. }, .. } => "soft_delete",
        }
    }

    /// Applying the write twice leaves the same rows as applying it once.
    /// Plain inserts are the exception: a repeat adds the rows again.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Insert { .. })
    }

    /// Retry class of `error` for this write. A non-idempotent write is only
    /// repeated when the request never reached the backend.
    pub fn retry_class(&self, error: &RemoteError) -> ErrorClass {
        if self.is_idempotent() || error.kind == RemoteErrorKind::Connect {
            error.class()
        } else {
            ErrorClass::Permanent
        }
    }
}

fn push_quoted(out: &mut String, text: &str) {
    match serde_json::to_string(text) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str(text),
    }
}

fn canonical_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => push_quoted(out, text),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                canonical_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                push_quoted(out, key);
                out.push(':');
                canonical_value(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) if left.is_number() && right.is_number() => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// SQL `LIKE` with `%` and `_` wildcards.
fn like_match(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    let (pattern, text): (Vec<char>, Vec<char>) = if case_insensitive {
        (pattern.to_lowercase().chars().collect(), text.to_lowercase().chars().collect())
    } else {
        (pattern.chars().collect(), text.chars().collect())
    };

    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|ch| *ch == '%')
}
