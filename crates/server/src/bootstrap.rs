use std::sync::Arc;
use std::time::Duration;

use bizdesk_agent::{business_tables, TableToolset, ToolRegistry};
use bizdesk_core::config::{AppConfig, ConfigError, LoadOptions};
use bizdesk_core::errors::RemoteError;
use bizdesk_db::manager::{ClientManager, ManagerSettings};
use bizdesk_db::memory::InMemoryStore;
use bizdesk_db::remote::RemoteStore;
use bizdesk_db::rest::{RestStore, RestStoreOptions};
use thiserror::Error;
use tracing::{info, warn};

pub struct Application {
    pub config: AppConfig,
    pub manager: ClientManager,
    pub tools: ToolRegistry,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backend client could not be built: {0}")]
    Backend(#[source] RemoteError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let store = remote_store(&config)?;
    let manager = ClientManager::new(store, ManagerSettings::from(&config));
    manager.start();

    let mut tools = ToolRegistry::default();
    for table in business_tables() {
        TableToolset::new(manager.clone(), table).register(&mut tools);
    }
    info!(
        event_name = "system.bootstrap.tools_registered",
        correlation_id = "bootstrap",
        tool_count = tools.len(),
        "agent tools registered"
    );

    if manager.health_check().await {
        info!(
            event_name = "system.bootstrap.backend_connected",
            correlation_id = "bootstrap",
            "backend reachable"
        );
    } else {
        warn!(
            event_name = "system.bootstrap.backend_unreachable",
            correlation_id = "bootstrap",
            "backend did not answer the startup health check; continuing"
        );
    }

    Ok(Application { config, manager, tools })
}

fn remote_store(config: &AppConfig) -> Result<Arc<dyn RemoteStore>, BootstrapError> {
    if config.backend.is_in_memory() {
        warn!(
            event_name = "system.bootstrap.in_memory_backend",
            correlation_id = "bootstrap",
            "using the in-process store; data is not persisted"
        );
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let store =
        RestStore::new(RestStoreOptions::from(&config.backend)).map_err(BootstrapError::Backend)?;
    Ok(Arc::new(store))
}

impl Application {
    /// Stops background work and closes the pools, bounded by the configured
    /// grace period.
    pub async fn shutdown(self) {
        let grace = Duration::from_secs(self.config.server.graceful_shutdown_secs);
        if tokio::time::timeout(grace, self.manager.shutdown()).await.is_err() {
            warn!(
                event_name = "system.shutdown.timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "client manager did not stop within the grace period"
            );
        }
    }
}
