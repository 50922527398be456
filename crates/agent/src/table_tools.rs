//! Generic CRUD tools for one business table.
//!
//! A [`TableToolset`] turns a [`TableToolConfig`] into five tools:
//! `get_<table>`, `create_<singular>`, `update_<singular>`,
//! `delete_<singular>` and `batch_delete_<table>`. Every tool takes a JSON
//! object and answers with either `{"success": true, ...}` or
//! `{"error", "user_message"}`; data-layer failures also carry a
//! `correlation_id` that matches the warning logged for them.
//!
//! Calls with an `access_token` run in the caller's user scope. Without one
//! they fall back to the service scope unless the table requires a token; the
//! owner filter is applied either way.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use bizdesk_core::errors::DataError;
use bizdesk_core::query::{DeleteMode, Filter, FilterOp, Query, SortDirection, WriteOp};
use bizdesk_core::scope::Scope;
use bizdesk_db::batch::{Batch, BatchItem, BatchStatus};
use bizdesk_db::manager::ClientManager;

use crate::tools::{Tool, ToolRegistry};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableToolConfig {
    pub table: String,
    pub singular: String,
    pub required_fields: Vec<String>,
    pub id_field: String,
    pub owner_field: String,
    pub default_limit: u32,
    pub max_limit: u32,
    pub default_order: String,
    /// Column stamped instead of removing rows. Stamped rows are hidden from reads.
    pub soft_delete: Option<String>,
    pub require_user_token: bool,
}

impl TableToolConfig {
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        let singular = table.strip_suffix('s').unwrap_or(&table).to_string();
        Self {
            table,
            singular,
            required_fields: Vec::new(),
            id_field: "id".to_string(),
            owner_field: "user_id".to_string(),
            default_limit: 10,
            max_limit: 100,
            default_order: "created_at".to_string(),
            soft_delete: None,
            require_user_token: false,
        }
    }

    pub fn required<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn limits(mut self, default_limit: u32, max_limit: u32) -> Self {
        self.max_limit = max_limit.max(1);
        self.default_limit = default_limit.clamp(1, self.max_limit);
        self
    }

    pub fn soft_delete(mut self, column: impl Into<String>) -> Self {
        self.soft_delete = Some(column.into());
        self
    }

    pub fn require_user_token(mut self, required: bool) -> Self {
        self.require_user_token = required;
        self
    }

    fn delete_mode(&self) -> DeleteMode {
        match &self.soft_delete {
            Some(column) => DeleteMode::Soft { column: column.clone() },
            None => DeleteMode::Hard,
        }
    }
}

/// The business tables exposed to agents, with the fields a new record needs.
pub fn business_tables() -> Vec<TableToolConfig> {
    vec![
        TableToolConfig::new("contacts").required(["name"]),
        TableToolConfig::new("invoices").required([
            "invoice_number",
            "client_name",
            "due_date",
            "total_amount",
        ]),
        TableToolConfig::new("projects").required(["name", "client_name"]),
        TableToolConfig::new("appointments").required([
            "client_name",
            "scheduled_date",
            "scheduled_time",
        ]),
        TableToolConfig::new("reviews").required(["reviewer_name", "rating"]),
        TableToolConfig::new("campaigns").required(["name"]),
    ]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableToolKind {
    Get,
    Create,
    Update,
    Delete,
    BatchDelete,
}

impl TableToolKind {
    const ALL: [Self; 5] = [Self::Get, Self::Create, Self::Update, Self::Delete, Self::BatchDelete];

    fn tool_name(self, config: &TableToolConfig) -> String {
        match self {
            Self::Get => format!("get_{}", config.table),
            Self::Create => format!("create_{}", config.singular),
            Self::Update => format!("update_{}", config.singular),
            Self::Delete => format!("delete_{}", config.singular),
            Self::BatchDelete => format!("batch_delete_{}", config.table),
        }
    }

    fn description(self, config: &TableToolConfig) -> String {
        match self {
            Self::Get => format!("Fetch records from the {} table", config.table),
            Self::Create => format!("Create a new record in the {} table", config.table),
            Self::Update => format!("Update an existing record in the {} table", config.table),
            Self::Delete => format!("Delete a record from the {} table", config.table),
            Self::BatchDelete => format!("Delete several records from the {} table", config.table),
        }
    }
}

pub struct TableToolset {
    manager: ClientManager,
    config: Arc<TableToolConfig>,
}

impl TableToolset {
    pub fn new(manager: ClientManager, config: TableToolConfig) -> Self {
        Self { manager, config: Arc::new(config) }
    }

    pub fn config(&self) -> &TableToolConfig {
        &self.config
    }

    pub fn tools(&self) -> Vec<TableTool> {
        TableToolKind::ALL
            .into_iter()
            .map(|kind| TableTool {
                kind,
                name: kind.tool_name(&self.config),
                description: kind.description(&self.config),
                manager: self.manager.clone(),
                config: self.config.clone(),
            })
            .collect()
    }

    pub fn register(&self, registry: &mut ToolRegistry) {
        for tool in self.tools() {
            registry.register(tool);
        }
    }
}

pub struct TableTool {
    kind: TableToolKind,
    name: String,
    description: String,
    manager: ClientManager,
    config: Arc<TableToolConfig>,
}

impl TableTool {
    pub fn kind(&self) -> TableToolKind {
        self.kind
    }
}

#[async_trait]
impl Tool for TableTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let outcome = match self.kind {
            TableToolKind::Get => self.get(input).await,
            TableToolKind::Create => self.create(input).await,
            TableToolKind::Update => self.update(input).await,
            TableToolKind::Delete => self.delete(input).await,
            TableToolKind::BatchDelete => self.batch_delete(input).await,
        };
        match outcome {
            Ok(output) => {
                debug!(event_name = "agent.tool.completed", tool = %self.name, "tool succeeded");
                Ok(output)
            }
            Err(rejection) => Ok(serde_json::to_value(rejection)?),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Caller {
    user_id: String,
    #[serde(default)]
    access_token: Option<String>,
}

/// A JSON object given inline or as an encoded string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonObject {
    Inline(Map<String, Value>),
    Encoded(String),
}

impl JsonObject {
    fn into_map(self, what: &str) -> Result<Map<String, Value>, ToolRejection> {
        match self {
            Self::Inline(map) => Ok(map),
            Self::Encoded(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(ToolRejection::invalid(
                    format!("{what} must be a JSON object"),
                    format!("The {what} format is invalid. Please provide a JSON object."),
                )),
                Err(parse_error) => Err(ToolRejection::invalid(
                    format!("invalid {what} JSON: {parse_error}"),
                    format!("The {what} format is invalid. Please provide valid JSON."),
                )),
            },
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct GetInput {
    #[serde(flatten)]
    caller: Caller,
    #[serde(default)]
    filters: Option<JsonObject>,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    order_by: Option<String>,
    #[serde(default = "default_true")]
    order_desc: bool,
}

#[derive(Debug, Deserialize)]
struct CreateInput {
    #[serde(flatten)]
    caller: Caller,
    data: JsonObject,
}

#[derive(Debug, Deserialize)]
struct UpdateInput {
    #[serde(flatten)]
    caller: Caller,
    record_id: String,
    data: JsonObject,
}

#[derive(Debug, Deserialize)]
struct DeleteInput {
    #[serde(flatten)]
    caller: Caller,
    record_id: String,
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct BatchDeleteInput {
    #[serde(flatten)]
    caller: Caller,
    record_ids: Vec<String>,
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Serialize)]
struct ToolRejection {
    error: String,
    user_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

impl ToolRejection {
    fn invalid(error: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self { error: error.into(), user_message: user_message.into(), correlation_id: None }
    }
}

impl TableTool {
    async fn get(&self, input: Value) -> Result<Value, ToolRejection> {
        let input: GetInput = parse(input)?;
        let scope = self.scope_for(&input.caller)?;
        let config = &self.config;

        let mut query = Query::table(&config.table)
            .filter(Filter::eq(&config.owner_field, input.caller.user_id.as_str()));
        if let Some(column) = &config.soft_delete {
            query = query.filter(Filter::new(column, FilterOp::IsNull));
        }
        if let Some(filters) = input.filters {
            for (column, value) in filters.into_map("filters")? {
                query = query.filter(Filter::eq(column, value));
            }
        }
        let limit = input.limit.unwrap_or(config.default_limit).clamp(1, config.max_limit);
        let direction = if input.order_desc { SortDirection::Desc } else { SortDirection::Asc };
        let order_by = input.order_by.unwrap_or_else(|| config.default_order.clone());
        let query = query.order_by(order_by, direction).limit(limit);

        let rows = self
            .manager
            .execute_query(&scope, &query)
            .await
            .map_err(|error| self.data_failure(error))?;
        Ok(json!({ "success": true, "data": rows.as_slice(), "count": rows.len() }))
    }

    async fn create(&self, input: Value) -> Result<Value, ToolRejection> {
        let input: CreateInput = parse(input)?;
        let scope = self.scope_for(&input.caller)?;
        let config = &self.config;

        let mut record = input.data.into_map("data")?;
        let missing: Vec<&str> = config
            .required_fields
            .iter()
            .map(String::as_str)
            .filter(|field| !record.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            let fields = missing.join(", ");
            return Err(ToolRejection::invalid(
                format!("missing required fields: {fields}"),
                format!("Please provide the following required fields: {fields}"),
            ));
        }
        record.insert(config.owner_field.clone(), Value::String(input.caller.user_id));

        let op = WriteOp::Insert { table: config.table.clone(), rows: vec![Value::Object(record)] };
        let rows = self.write(&scope, op).await?;
        Ok(json!({
            "success": true,
            "data": rows.first(),
            "message": format!("Successfully created {}", config.singular),
        }))
    }

    async fn update(&self, input: Value) -> Result<Value, ToolRejection> {
        let input: UpdateInput = parse(input)?;
        let scope = self.scope_for(&input.caller)?;
        let config = &self.config;

        let mut patch = input.data.into_map("data")?;
        patch.remove(&config.owner_field);
        patch.remove(&config.id_field);
        if patch.is_empty() {
            return Err(ToolRejection::invalid(
                "no fields to update",
                "Please provide at least one field to update.",
            ));
        }

        let op = WriteOp::Update {
            table: config.table.clone(),
            filters: self.record_filters(&input.record_id, &input.caller.user_id),
            patch: Value::Object(patch),
        };
        let rows = self.write(&scope, op).await?;
        if rows.is_empty() {
            return Err(self.not_found("update"));
        }
        Ok(json!({
            "success": true,
            "data": rows.first(),
            "message": format!("Successfully updated {}", config.singular),
        }))
    }

    async fn delete(&self, input: Value) -> Result<Value, ToolRejection> {
        let input: DeleteInput = parse(input)?;
        if !input.confirm {
            return Err(unconfirmed());
        }
        let scope = self.scope_for(&input.caller)?;
        let config = &self.config;

        let op = WriteOp::Delete {
            table: config.table.clone(),
            filters: self.record_filters(&input.record_id, &input.caller.user_id),
            mode: config.delete_mode(),
        };
        let rows = self.write(&scope, op).await?;
        if rows.is_empty() {
            return Err(self.not_found("delete"));
        }
        Ok(json!({
            "success": true,
            "message": format!("Successfully deleted {}", config.singular),
        }))
    }

    async fn batch_delete(&self, input: Value) -> Result<Value, ToolRejection> {
        let input: BatchDeleteInput = parse(input)?;
        if !input.confirm {
            return Err(unconfirmed());
        }
        if input.record_ids.is_empty() {
            return Err(ToolRejection::invalid(
                "record_ids is empty",
                "Please provide at least one record to delete.",
            ));
        }
        let scope = self.scope_for(&input.caller)?;
        let config = &self.config;

        let mode = config.delete_mode();
        let mut batch = Batch::new();
        for record_id in &input.record_ids {
            batch = batch.item(BatchItem::delete(
                config.table.as_str(),
                record_id.clone(),
                self.record_filters(record_id, &input.caller.user_id),
                mode.clone(),
            ));
        }

        let result = self
            .manager
            .run_batch(&scope, batch)
            .await
            .map_err(|error| self.data_failure(error))?;

        let not_found: Vec<&str> = result
            .outcomes
            .iter()
            .filter(|outcome| matches!(&outcome.result, Ok(rows) if rows.is_empty()))
            .map(|outcome| outcome.key.as_str())
            .collect();
        let failed: Vec<Value> = result
            .failures()
            .map(|(record_id, error)| {
                json!({
                    "record_id": record_id,
                    "error": error.detail(),
                    "user_message": error.user_message(),
                })
            })
            .collect();
        if !failed.is_empty() {
            warn!(
                event_name = "agent.tool.batch_partial",
                tool = %self.name,
                failed = failed.len(),
                succeeded = result.succeeded_count,
                "batch delete had failures"
            );
        }

        Ok(json!({
            "success": result.status() == BatchStatus::Complete && not_found.is_empty(),
            "status": result.status(),
            "deleted": result.succeeded_count - not_found.len(),
            "not_found": not_found,
            "failed": failed,
        }))
    }

    fn scope_for(&self, caller: &Caller) -> Result<Scope, ToolRejection> {
        if caller.user_id.trim().is_empty() {
            return Err(ToolRejection::invalid("missing user_id", "User identification required."));
        }
        match caller.access_token.as_deref().filter(|token| !token.is_empty()) {
            Some(token) => Ok(Scope::user(caller.user_id.as_str(), token)),
            None if self.config.require_user_token => Err(ToolRejection::invalid(
                "access token required",
                "Authentication required. Please log in.",
            )),
            None => {
                warn!(
                    event_name = "agent.tool.service_scope",
                    tool = %self.name,
                    user_id = %caller.user_id,
                    "no access token; running with the service scope"
                );
                Ok(Scope::Service)
            }
        }
    }

    fn record_filters(&self, record_id: &str, user_id: &str) -> Vec<Filter> {
        vec![
            Filter::eq(&self.config.id_field, record_id),
            Filter::eq(&self.config.owner_field, user_id),
        ]
    }

    async fn write(&self, scope: &Scope, op: WriteOp) -> Result<Vec<Value>, ToolRejection> {
        self.manager.execute_write(scope, op).await.map_err(|error| self.data_failure(error))
    }

    fn not_found(&self, action: &str) -> ToolRejection {
        ToolRejection::invalid(
            "record not found or unauthorized",
            format!(
                "Could not find or {action} the {}. Please check the ID.",
                self.config.singular
            ),
        )
    }

    fn data_failure(&self, error: DataError) -> ToolRejection {
        let correlation_id = Uuid::new_v4().to_string();
        let user_message = error.user_message().to_string();
        let interface = error.into_interface(correlation_id.clone());
        warn!(
            event_name = "agent.tool.data_error",
            tool = %self.name,
            correlation_id = %correlation_id,
            error = %interface,
            "tool call failed in the data layer"
        );
        ToolRejection { error: interface.to_string(), user_message, correlation_id: Some(correlation_id) }
    }
}

fn parse<T: DeserializeOwned>(input: Value) -> Result<T, ToolRejection> {
    serde_json::from_value(input).map_err(|parse_error| {
        ToolRejection::invalid(
            format!("invalid input: {parse_error}"),
            "The request format is invalid. Please check the inputs and try again.",
        )
    })
}

fn unconfirmed() -> ToolRejection {
    ToolRejection::invalid(
        "deletion not confirmed",
        "Please confirm that you want to delete by setting confirm to true.",
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use bizdesk_db::manager::{ClientManager, ManagerSettings};
    use bizdesk_db::memory::InMemoryStore;

    use super::{business_tables, TableToolConfig, TableToolset};
    use crate::tools::ToolRegistry;

    async fn registry_with(store: &InMemoryStore, config: TableToolConfig) -> ToolRegistry {
        let manager = ClientManager::new(Arc::new(store.clone()), ManagerSettings::default());
        let mut registry = ToolRegistry::default();
        TableToolset::new(manager, config).register(&mut registry);
        registry
    }

    async fn seeded_invoices() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .seed(
                "invoices",
                [
                    json!({"id": "inv-1", "user_id": "42", "status": "paid", "created_at": "2026-01-01"}),
                    json!({"id": "inv-2", "user_id": "42", "status": "draft", "created_at": "2026-02-01"}),
                    json!({"id": "inv-3", "user_id": "42", "status": "paid", "created_at": "2026-03-01"}),
                    json!({"id": "inv-4", "user_id": "7", "status": "paid", "created_at": "2026-04-01"}),
                ],
            )
            .await;
        store
    }

    fn invoices() -> TableToolConfig {
        TableToolConfig::new("invoices").required(["invoice_number", "total_amount"])
    }

    #[tokio::test]
    async fn toolset_registers_five_named_tools() {
        let registry = registry_with(&InMemoryStore::new(), invoices()).await;

        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec![
                "batch_delete_invoices",
                "create_invoice",
                "delete_invoice",
                "get_invoices",
                "update_invoice",
            ]
        );
        assert_eq!(
            registry.get("get_invoices").map(|tool| tool.description()),
            Some("Fetch records from the invoices table")
        );
    }

    #[tokio::test]
    async fn get_filters_by_owner_and_clamps_limit() {
        let store = seeded_invoices().await;
        let registry = registry_with(&store, invoices().limits(10, 2)).await;

        let output = registry
            .execute("get_invoices", json!({"user_id": "42", "limit": 50}))
            .await
            .expect("get");

        assert_eq!(output["success"], true);
        assert_eq!(output["count"], 2);
        assert_eq!(output["data"][0]["id"], "inv-3", "newest first by default");

        let filtered = registry
            .execute(
                "get_invoices",
                json!({"user_id": "42", "access_token": "jwt-42", "filters": "{\"status\": \"paid\"}", "order_desc": false}),
            )
            .await
            .expect("filtered get");
        assert_eq!(filtered["count"], 2);
        assert_eq!(filtered["data"][0]["id"], "inv-1");
    }

    #[tokio::test]
    async fn bad_filter_json_is_reported_to_the_user() {
        let registry = registry_with(&seeded_invoices().await, invoices()).await;

        let output = registry
            .execute("get_invoices", json!({"user_id": "42", "filters": "{status"}))
            .await
            .expect("tool output");

        assert!(output["error"].as_str().is_some_and(|error| error.contains("invalid filters JSON")));
        assert_eq!(output["user_message"], "The filters format is invalid. Please provide valid JSON.");
    }

    #[tokio::test]
    async fn create_checks_required_fields_and_sets_owner() {
        let store = InMemoryStore::new();
        let registry = registry_with(&store, invoices()).await;

        let rejected = registry
            .execute("create_invoice", json!({"user_id": "42", "data": {"invoice_number": "A-1"}}))
            .await
            .expect("tool output");
        assert_eq!(
            rejected["user_message"],
            "Please provide the following required fields: total_amount"
        );

        let created = registry
            .execute(
                "create_invoice",
                json!({"user_id": "42", "data": {"invoice_number": "A-1", "total_amount": 120, "user_id": "99"}}),
            )
            .await
            .expect("create");
        assert_eq!(created["success"], true);
        assert_eq!(created["data"]["user_id"], "42");
        assert_eq!(created["message"], "Successfully created invoice");
        assert_eq!(store.rows("invoices").await.len(), 1);
    }

    #[tokio::test]
    async fn reads_after_create_see_the_new_record() {
        let store = seeded_invoices().await;
        let registry = registry_with(&store, invoices()).await;
        let before = registry.execute("get_invoices", json!({"user_id": "7"})).await.expect("get");
        assert_eq!(before["count"], 1);

        registry
            .execute(
                "create_invoice",
                json!({"user_id": "7", "data": {"invoice_number": "B-2", "total_amount": 5}}),
            )
            .await
            .expect("create");

        let after = registry.execute("get_invoices", json!({"user_id": "7"})).await.expect("get");
        assert_eq!(after["count"], 2);
    }

    #[tokio::test]
    async fn update_reports_missing_records() {
        let store = seeded_invoices().await;
        let registry = registry_with(&store, invoices()).await;

        let foreign = registry
            .execute(
                "update_invoice",
                json!({"user_id": "42", "record_id": "inv-4", "data": {"status": "void"}}),
            )
            .await
            .expect("tool output");
        assert_eq!(
            foreign["user_message"],
            "Could not find or update the invoice. Please check the ID."
        );

        let updated = registry
            .execute(
                "update_invoice",
                json!({"user_id": "42", "record_id": "inv-2", "data": {"status": "sent"}}),
            )
            .await
            .expect("update");
        assert_eq!(updated["data"]["status"], "sent");
    }

    #[tokio::test]
    async fn delete_requires_confirmation_and_soft_deletes_hide_rows() {
        let store = seeded_invoices().await;
        let registry = registry_with(&store, invoices().soft_delete("deleted_at")).await;

        let unconfirmed = registry
            .execute("delete_invoice", json!({"user_id": "42", "record_id": "inv-1"}))
            .await
            .expect("tool output");
        assert_eq!(unconfirmed["error"], "deletion not confirmed");

        let deleted = registry
            .execute("delete_invoice", json!({"user_id": "42", "record_id": "inv-1", "confirm": true}))
            .await
            .expect("delete");
        assert_eq!(deleted["success"], true);

        let remaining = registry.execute("get_invoices", json!({"user_id": "42"})).await.expect("get");
        assert_eq!(remaining["count"], 2);
        assert_eq!(store.rows("invoices").await.len(), 4, "row kept with a deletion stamp");
    }

    #[tokio::test]
    async fn batch_delete_reports_missing_ids() {
        let store = seeded_invoices().await;
        let registry = registry_with(&store, invoices()).await;

        let output = registry
            .execute(
                "batch_delete_invoices",
                json!({"user_id": "42", "record_ids": ["inv-1", "inv-4", "inv-2"], "confirm": true}),
            )
            .await
            .expect("batch delete");

        assert_eq!(output["success"], false);
        assert_eq!(output["status"], "complete");
        assert_eq!(output["deleted"], 2);
        assert_eq!(output["not_found"], json!(["inv-4"]));
        assert_eq!(output["failed"], json!([]));
        assert_eq!(store.rows("invoices").await.len(), 2);
    }

    #[tokio::test]
    async fn token_can_be_required() {
        let registry =
            registry_with(&seeded_invoices().await, invoices().require_user_token(true)).await;

        let output =
            registry.execute("get_invoices", json!({"user_id": "42"})).await.expect("tool output");
        assert_eq!(output["user_message"], "Authentication required. Please log in.");

        let with_token = registry
            .execute("get_invoices", json!({"user_id": "42", "access_token": "jwt"}))
            .await
            .expect("get");
        assert_eq!(with_token["count"], 3);
    }

    #[tokio::test]
    async fn data_layer_failures_carry_a_correlation_id() {
        let store = InMemoryStore::new();
        let manager = ClientManager::new(Arc::new(store), ManagerSettings::default());
        let mut registry = ToolRegistry::default();
        TableToolset::new(manager.clone(), invoices()).register(&mut registry);
        manager.shutdown().await;

        let output =
            registry.execute("get_invoices", json!({"user_id": "42"})).await.expect("tool output");

        assert_eq!(
            output["user_message"],
            "The data service is temporarily unavailable. Please try again shortly."
        );
        assert!(output["correlation_id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(output.get("success").is_none());
    }

    #[test]
    fn business_tables_cover_the_core_records() {
        let tables: Vec<String> = business_tables().into_iter().map(|config| config.table).collect();
        assert_eq!(
            tables,
            vec!["contacts", "invoices", "projects", "appointments", "reviews", "campaigns"]
        );
        assert_eq!(TableToolConfig::new("campaigns").singular, "campaign");
    }
}
