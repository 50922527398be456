//! PostgREST adapter.
//!
//! One shared `reqwest::Client` keeps the underlying HTTP connections; a
//! [`RestSession`] is that client plus the headers that authenticate one
//! scope. Filters are rendered in PostgREST's `column=op.value` syntax.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use bizdesk_core::config::BackendConfig;
use bizdesk_core::errors::{RemoteError, RemoteErrorKind};
use bizdesk_core::query::{DeleteMode, Filter, FilterOp, Query, Row, WriteOp};
use bizdesk_core::scope::Scope;

use super::{require_filters, RemoteSession, RemoteStore};

#[derive(Clone, Debug)]
pub struct RestStoreOptions {
    pub url: String,
    pub service_key: SecretString,
    pub schema: String,
    pub request_timeout: Duration,
    pub health_table: String,
}

impl From<&BackendConfig> for RestStoreOptions {
    fn from(config: &BackendConfig) -> Self {
        Self {
            url: config.url.clone(),
            service_key: config.service_key.clone(),
            schema: config.schema.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            health_table: config.health_table.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    rest_url: String,
    service_key: SecretString,
    schema: String,
    health_table: Arc<str>,
}

impl std::fmt::Debug for RestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestStore")
            .field("rest_url", &self.rest_url)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl RestStore {
    pub fn new(options: RestStoreOptions) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|error| {
                RemoteError::new(RemoteErrorKind::Connect, format!("http client: {error}"))
            })?;

        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", options.url.trim_end_matches('/')),
            service_key: options.service_key,
            schema: options.schema,
            health_table: Arc::from(options.health_table),
        })
    }

    fn scope_headers(&self, scope: &Scope) -> Result<HeaderMap, RemoteError> {
        let service_key = self.service_key.expose_secret(); // ubs:ignore
        let bearer = match scope.token() {
            Some(token) => token.expose_secret(), // ubs:ignore
            None => service_key,
        };

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("apikey"), sensitive(service_key)?);
        headers.insert(AUTHORIZATION, sensitive(&format!("Bearer {bearer}"))?);
        let profile = HeaderValue::from_str(&self.schema).map_err(|_| {
            RemoteError::new(RemoteErrorKind::Validation, "schema is not a valid header value")
        })?;
        headers.insert(HeaderName::from_static("accept-profile"), profile.clone());
        headers.insert(HeaderName::from_static("content-profile"), profile);
        Ok(headers)
    }
}

fn sensitive(value: &str) -> Result<HeaderValue, RemoteError> {
    let mut header = HeaderValue::from_str(value).map_err(|_| {
        RemoteError::new(RemoteErrorKind::Auth, "credential is not a valid header value")
    })?;
    header.set_sensitive(true);
    Ok(header)
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn connect(&self, scope: &Scope) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let headers = self.scope_headers(scope)?;
        debug!(event_name = "db.rest.session_opened", scope = %scope, "opened rest session");
        Ok(Arc::new(RestSession {
            client: self.client.clone(),
            rest_url: self.rest_url.clone(),
            headers,
            health_table: self.health_table.clone(),
        }))
    }
}

pub struct RestSession {
    client: reqwest::Client,
    rest_url: String,
    headers: HeaderMap,
    health_table: Arc<str>,
}

impl RestSession {
    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, table))
            .headers(self.headers.clone())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Vec<Row>, RemoteError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), error_message(status, &body)));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let body = response.bytes().await.map_err(transport_error)?;
        if body.is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Array(rows)) => Ok(rows),
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(row) => Ok(vec![row]),
            Err(error) => Err(RemoteError::new(
                RemoteErrorKind::Decode,
                format!("response was not valid JSON: {error}"),
            )),
        }
    }
}

#[async_trait]
impl RemoteSession for RestSession {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, RemoteError> {
        let request = self.request(Method::GET, &query.table).query(&select_params(query));
        self.send(request).await
    }

    async fn write(&self, op: &WriteOp) -> Result<Vec<Row>, RemoteError> {
        let request = match op {
            WriteOp::Insert { table, rows } => self
                .request(Method::POST, table)
                .header("Prefer", "return=representation")
                .json(rows),
            WriteOp::Upsert { table, rows, on_conflict } => {
                let mut request = self
                    .request(Method::POST, table)
                    .header("Prefer", "resolution=merge-duplicates,return=representation");
                if let Some(column) = on_conflict {
                    request = request.query(&[("on_conflict", column.as_str())]);
                }
                request.json(rows)
            }
            WriteOp::Update { table, filters, patch } => {
                require_filters(op, filters)?;
                self.request(Method::PATCH, table)
                    .header("Prefer", "return=representation")
                    .query(&filter_params(filters))
                    .json(patch)
            }
            WriteOp::Delete { table, filters, mode: DeleteMode::Hard } => {
                require_filters(op, filters)?;
                self.request(Method::DELETE, table)
                    .header("Prefer", "return=representation")
                    .query(&filter_params(filters))
            }
            WriteOp::Delete { table, filters, mode: DeleteMode::Soft { column } } => {
                require_filters(op, filters)?;
                self.request(Method::PATCH, table)
                    .header("Prefer", "return=representation")
                    .query(&filter_params(filters))
                    .json(&DeleteMode::soft_delete_patch(column, Utc::now()))
            }
        };
        self.send(request).await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let request = self
            .request(Method::GET, &self.health_table)
            .query(&[("select", "id"), ("limit", "1")]);
        self.send(request).await.map(|_| ())
    }
}

fn select_params(query: &Query) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let columns = if query.columns.is_empty() { "*".to_string() } else { query.columns.join(",") };
    params.push(("select".to_string(), columns));
    params.extend(filter_params(&query.filters));
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|clause| format!("{}.{}", clause.column, clause.direction.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_string(), order));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = query.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(|filter| (filter.column.clone(), filter_expression(&filter.op))).collect()
}

fn filter_expression(op: &FilterOp) -> String {
    match op {
        FilterOp::Eq(value) => format!("eq.{}", scalar(value)),
        FilterOp::Neq(value) => format!("neq.{}", scalar(value)),
        FilterOp::Gt(value) => format!("gt.{}", scalar(value)),
        FilterOp::Gte(value) => format!("gte.{}", scalar(value)),
        FilterOp::Lt(value) => format!("lt.{}", scalar(value)),
        FilterOp::Lte(value) => format!("lte.{}", scalar(value)),
        FilterOp::In(values) => {
            let members: Vec<String> = values.iter().map(list_member).collect();
            format!("in.({})", members.join(","))
        }
        FilterOp::Like(pattern) => format!("like.{pattern}"),
        FilterOp::ILike(pattern) => format!("ilike.{pattern}"),
        FilterOp::IsNull => "is.null".to_string(),
        FilterOp::NotNull => "not.is.null".to_string(),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// `in.(...)` members containing reserved characters must be double-quoted.
fn list_member(value: &Value) -> String {
    let text = scalar(value);
    if text.contains([',', '(', ')', '"', '\\', ' ']) {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text
    }
}

#[derive(Deserialize)]
struct PostgrestError {
    message: Option<String>,
    details: Option<String>,
}

fn error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<PostgrestError>(body) {
        Ok(PostgrestError { message: Some(message), details: Some(details) }) => {
            format!("{message} ({details})")
        }
        Ok(PostgrestError { message: Some(message), .. }) => message,
        _ if body.trim().is_empty() => status.to_string(),
        _ => body.trim().to_string(),
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    let kind = if error.is_timeout() {
        RemoteErrorKind::Timeout
    } else if error.is_connect() {
        RemoteErrorKind::Connect
    } else if error.is_decode() || error.is_body() {
        RemoteErrorKind::Decode
    } else {
        RemoteErrorKind::Unavailable
    };
    match error.status() {
        Some(status) => RemoteError::from_status(status.as_u16(), error.to_string()),
        None => RemoteError::new(kind, error.to_string()),
    }
}
