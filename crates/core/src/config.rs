use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`. `memory://` selects the
    /// in-process store.
    pub url: String,
    pub service_key: SecretString,
    pub schema: String,
    pub request_timeout_secs: u64,
    /// Table probed by health checks.
    pub health_table: String,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_handles_per_scope: u32,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub cache_empty_results: bool,
    pub table_ttls: BTreeMap<String, u64>,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub max_chunk_size: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub backend_url: Option<String>,
    pub service_key: Option<String>,
    pub log_level: Option<String>,
    pub cache_enabled: Option<bool>,
    pub max_handles_per_scope: Option<u32>,
    pub max_retries: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Per-table TTLs for the business tables, keyed by how often they change.
pub fn default_table_ttls() -> BTreeMap<String, u64> {
    [
        ("contacts", 300),
        ("invoices", 180),
        ("projects", 600),
        ("appointments", 120),
        ("reviews", 900),
        ("campaigns", 1800),
    ]
    .into_iter()
    .map(|(table, secs)| (table.to_string(), secs))
    .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                url: String::new(),
                service_key: String::new().into(),
                schema: "api".to_string(),
                request_timeout_secs: 30,
                health_table: "agent_conversations".to_string(),
            },
            pool: PoolConfig {
                max_handles_per_scope: 10,
                acquire_timeout_ms: 5_000,
                idle_timeout_secs: 300,
                max_lifetime_secs: 3_600,
                sweep_interval_secs: 60,
            },
            cache: CacheConfig {
                enabled: true,
                max_entries: 1_000,
                default_ttl_secs: 300,
                sweep_interval_secs: 300,
                cache_empty_results: true,
                table_ttls: default_table_ttls(),
            },
            retry: RetryConfig { max_retries: 3, base_delay_ms: 1_000, max_delay_ms: 10_000 },
            batch: BatchConfig { max_chunk_size: 100 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl BackendConfig {
    pub fn is_in_memory(&self) -> bool {
        self.url.trim().starts_with("memory://")
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("bizdesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// TTL in seconds for reads against `table`.
    pub fn cache_ttl_secs(&self, table: &str) -> u64 {
        self.cache.table_ttls.get(table).copied().unwrap_or(self.cache.default_ttl_secs)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(backend) = patch.backend {
            if let Some(url) = backend.url {
                self.backend.url = url;
            }
            if let Some(service_key_value) = backend.service_key {
                self.backend.service_key = secret_value(service_key_value); // ubs:ignore
            }
            if let Some(schema) = backend.schema {
                self.backend.schema = schema;
            }
            if let Some(request_timeout_secs) = backend.request_timeout_secs {
                self.backend.request_timeout_secs = request_timeout_secs;
            }
            if let Some(health_table) = backend.health_table {
                self.backend.health_table = health_table;
            }
        }

        if let Some(pool) = patch.pool {
            if let Some(max_handles_per_scope) = pool.max_handles_per_scope {
                self.pool.max_handles_per_scope = max_handles_per_scope;
            }
            if let Some(acquire_timeout_ms) = pool.acquire_timeout_ms {
                self.pool.acquire_timeout_ms = acquire_timeout_ms;
            }
            if let Some(idle_timeout_secs) = pool.idle_timeout_secs {
                self.pool.idle_timeout_secs = idle_timeout_secs;
            }
            if let Some(max_lifetime_secs) = pool.max_lifetime_secs {
                self.pool.max_lifetime_secs = max_lifetime_secs;
            }
            if let Some(sweep_interval_secs) = pool.sweep_interval_secs {
                self.pool.sweep_interval_secs = sweep_interval_secs;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(enabled) = cache.enabled {
                self.cache.enabled = enabled;
            }
            if let Some(max_entries) = cache.max_entries {
                self.cache.max_entries = max_entries;
            }
            if let Some(default_ttl_secs) = cache.default_ttl_secs {
                self.cache.default_ttl_secs = default_ttl_secs;
            }
            if let Some(sweep_interval_secs) = cache.sweep_interval_secs {
                self.cache.sweep_interval_secs = sweep_interval_secs;
            }
            if let Some(cache_empty_results) = cache.cache_empty_results {
                self.cache.cache_empty_results = cache_empty_results;
            }
            if let Some(table_ttls) = cache.table_ttls {
                self.cache.table_ttls.extend(table_ttls);
            }
        }

        if let Some(retry) = patch.retry {
            if let Some(max_retries) = retry.max_retries {
                self.retry.max_retries = max_retries;
            }
            if let Some(base_delay_ms) = retry.base_delay_ms {
                self.retry.base_delay_ms = base_delay_ms;
            }
            if let Some(max_delay_ms) = retry.max_delay_ms {
                self.retry.max_delay_ms = max_delay_ms;
            }
        }

        if let Some(batch) = patch.batch {
            if let Some(max_chunk_size) = batch.max_chunk_size {
                self.batch.max_chunk_size = max_chunk_size;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let backend_url = read_env("BIZDESK_BACKEND_URL").or_else(|| read_env("SUPABASE_URL"));
        if let Some(value) = backend_url {
            self.backend.url = value;
        }
        let service_key =
            read_env("BIZDESK_BACKEND_SERVICE_KEY").or_else(|| read_env("SUPABASE_SERVICE_KEY"));
        if let Some(value) = service_key {
            self.backend.service_key = secret_value(value); // ubs:ignore
        }
        if let Some(value) = read_env("BIZDESK_BACKEND_SCHEMA") {
            self.backend.schema = value;
        }
        if let Some(value) = read_env("BIZDESK_BACKEND_REQUEST_TIMEOUT_SECS") {
            self.backend.request_timeout_secs =
                parse_u64("BIZDESK_BACKEND_REQUEST_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("BIZDESK_POOL_MAX_HANDLES_PER_SCOPE") {
            self.pool.max_handles_per_scope =
                parse_u32("BIZDESK_POOL_MAX_HANDLES_PER_SCOPE", &value)?;
        }
        if let Some(value) = read_env("BIZDESK_POOL_ACQUIRE_TIMEOUT_MS") {
            self.pool.acquire_timeout_ms = parse_u64("BIZDESK_POOL_ACQUIRE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("BIZDESK_POOL_IDLE_TIMEOUT_SECS") {
            self.pool.idle_timeout_secs = parse_u64("BIZDESK_POOL_IDLE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("BIZDESK_CACHE_ENABLED") {
            self.cache.enabled = parse_bool("BIZDESK_CACHE_ENABLED", &value)?;
        }
        if let Some(value) = read_env("BIZDESK_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = parse_u64("BIZDESK_CACHE_MAX_ENTRIES", &value)? as usize;
        }
        if let Some(value) = read_env("BIZDESK_CACHE_DEFAULT_TTL_SECS") {
            self.cache.default_ttl_secs = parse_u64("BIZDESK_CACHE_DEFAULT_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("BIZDESK_RETRY_MAX_RETRIES") {
            self.retry.max_retries = parse_u32("BIZDESK_RETRY_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("BIZDESK_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_u64("BIZDESK_RETRY_MAX_DELAY_MS", &value)?;
        }

        if let Some(value) = read_env("BIZDESK_BATCH_MAX_CHUNK_SIZE") {
            self.batch.max_chunk_size = parse_u64("BIZDESK_BATCH_MAX_CHUNK_SIZE", &value)? as usize;
        }

        if let Some(value) = read_env("BIZDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("BIZDESK_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("BIZDESK_SERVER_HEALTH_CHECK_PORT", &value)?;
        }

        let log_level = read_env("BIZDESK_LOGGING_LEVEL").or_else(|| read_env("BIZDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("BIZDESK_LOGGING_FORMAT").or_else(|| read_env("BIZDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(backend_url) = overrides.backend_url {
            self.backend.url = backend_url;
        }
        if let Some(service_key) = overrides.service_key {
            self.backend.service_key = secret_value(service_key); // ubs:ignore
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(cache_enabled) = overrides.cache_enabled {
            self.cache.enabled = cache_enabled;
        }
        if let Some(max_handles_per_scope) = overrides.max_handles_per_scope {
            self.pool.max_handles_per_scope = max_handles_per_scope;
        }
        if let Some(max_retries) = overrides.max_retries {
            self.retry.max_retries = max_retries;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_backend(&self.backend)?;
        validate_pool(&self.pool)?;
        validate_cache(&self.cache)?;
        validate_retry(&self.retry)?;
        validate_batch(&self.batch)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("bizdesk.toml"), PathBuf::from("config/bizdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_backend(backend: &BackendConfig) -> Result<(), ConfigError> {
    let url = backend.url.trim();
    if url.is_empty() {
        return Err(ConfigError::Validation(
            "backend.url is required (set BIZDESK_BACKEND_URL or SUPABASE_URL)".to_string(),
        ));
    }
    if backend.is_in_memory() {
        return Ok(());
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "backend.url must start with http://, https:// or memory://".to_string(),
        ));
    }

    let service_key = backend.service_key.expose_secret(); // ubs:ignore
    if service_key.trim().is_empty() {
        return Err(ConfigError::Validation(
            "backend.service_key is required (set BIZDESK_BACKEND_SERVICE_KEY or SUPABASE_SERVICE_KEY)"
                .to_string(),
        ));
    }

    if backend.schema.trim().is_empty() {
        return Err(ConfigError::Validation("backend.schema must not be empty".to_string()));
    }

    if backend.request_timeout_secs == 0 || backend.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "backend.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_pool(pool: &PoolConfig) -> Result<(), ConfigError> {
    if pool.max_handles_per_scope == 0 {
        return Err(ConfigError::Validation(
            "pool.max_handles_per_scope must be greater than zero".to_string(),
        ));
    }
    if pool.acquire_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "pool.acquire_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if pool.idle_timeout_secs == 0 || pool.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "pool.idle_timeout_secs and pool.sweep_interval_secs must be greater than zero"
                .to_string(),
        ));
    }
    if pool.max_lifetime_secs < pool.idle_timeout_secs {
        return Err(ConfigError::Validation(
            "pool.max_lifetime_secs must be at least pool.idle_timeout_secs".to_string(),
        ));
    }
    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.max_entries == 0 {
        return Err(ConfigError::Validation(
            "cache.max_entries must be greater than zero".to_string(),
        ));
    }
    if cache.default_ttl_secs == 0 || cache.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "cache.default_ttl_secs and cache.sweep_interval_secs must be greater than zero"
                .to_string(),
        ));
    }
    if let Some((table, _)) = cache.table_ttls.iter().find(|(_, secs)| **secs == 0) {
        return Err(ConfigError::Validation(format!(
            "cache.table_ttls.{table} must be greater than zero"
        )));
    }
    Ok(())
}

fn validate_retry(retry: &RetryConfig) -> Result<(), ConfigError> {
    if retry.max_retries > 10 {
        return Err(ConfigError::Validation("retry.max_retries must be at most 10".to_string()));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(ConfigError::Validation(
            "retry.max_delay_ms must be at least retry.base_delay_ms".to_string(),
        ));
    }
    Ok(())
}

fn validate_batch(batch: &BatchConfig) -> Result<(), ConfigError> {
    if batch.max_chunk_size == 0 || batch.max_chunk_size > 1_000 {
        return Err(ConfigError::Validation(
            "batch.max_chunk_size must be in range 1..=1000".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    backend: Option<BackendPatch>,
    pool: Option<PoolPatch>,
    cache: Option<CachePatch>,
    retry: Option<RetryPatch>,
    batch: Option<BatchPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendPatch {
    url: Option<String>,
    service_key: Option<String>,
    schema: Option<String>,
    request_timeout_secs: Option<u64>,
    health_table: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PoolPatch {
    max_handles_per_scope: Option<u32>,
    acquire_timeout_ms: Option<u64>,
    idle_timeout_secs: Option<u64>,
    max_lifetime_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    enabled: Option<bool>,
    max_entries: Option<usize>,
    default_ttl_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    cache_empty_results: Option<bool>,
    table_ttls: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryPatch {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchPatch {
    max_chunk_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
