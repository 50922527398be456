use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use bizdesk_db::manager::{ClientManager, ManagerStats};
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    manager: ClientManager,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub backend: HealthCheck,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_layer: Option<ManagerStats>,
    pub checked_at: String,
}

pub fn router(manager: ClientManager) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { manager })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    manager: ClientManager,
) -> std::io::Result<JoinHandle<()>> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    Ok(tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(manager)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    }))
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let reachable = state.manager.health_check().await;
    let backend = if reachable {
        HealthCheck { status: "ready", detail: "backend answered the health probe".to_string() }
    } else {
        HealthCheck { status: "degraded", detail: "backend health probe failed".to_string() }
    };

    let payload = HealthResponse {
        status: if reachable { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "bizdesk-server runtime initialized".to_string(),
        },
        backend,
        data_layer: state.manager.stats().ok(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if reachable { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}
