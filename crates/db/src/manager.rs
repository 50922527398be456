//! Client manager: the single entry point callers use for data access.
//!
//! Reads go cache, then pool, then retry; writes go pool, then retry, then
//! invalidate. Writes and batches run on their own task so a caller that
//! gives up on the future cannot leave a write half-applied with the cache
//! still holding pre-write rows.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bizdesk_core::config::AppConfig;
use bizdesk_core::errors::DataError;
use bizdesk_core::query::{Query, Row, WriteOp};
use bizdesk_core::scope::{Scope, ScopeKey};

use crate::batch::{Batch, BatchExecutor, BatchResult, DEFAULT_MAX_CHUNK_SIZE};
use crate::cache::{CacheKey, CacheStats, QueryCache, TtlPolicy};
use crate::pool::{ConnectionPool, PoolSettings, PoolStats};
use crate::remote::RemoteStore;
use crate::retry::{BackoffExecutor, RetryPolicy};

#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub pool: PoolSettings,
    pub retry: RetryPolicy,
    pub cache_enabled: bool,
    pub cache_max_entries: usize,
    pub cache_empty_results: bool,
    pub ttl: TtlPolicy,
    pub max_chunk_size: usize,
    pub pool_sweep_interval: Duration,
    pub cache_sweep_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            retry: RetryPolicy::default(),
            cache_enabled: true,
            cache_max_entries: 1_000,
            cache_empty_results: true,
            ttl: TtlPolicy::default(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            pool_sweep_interval: Duration::from_secs(60),
            cache_sweep_interval: Duration::from_secs(300),
        }
    }
}

impl From<&AppConfig> for ManagerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            pool: PoolSettings::from(&config.pool),
            retry: RetryPolicy::from(&config.retry),
            cache_enabled: config.cache.enabled,
            cache_max_entries: config.cache.max_entries,
            cache_empty_results: config.cache.cache_empty_results,
            ttl: TtlPolicy::from(&config.cache),
            max_chunk_size: config.batch.max_chunk_size,
            pool_sweep_interval: Duration::from_secs(config.pool.sweep_interval_secs),
            cache_sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub cache_enabled: bool,
}

struct Background {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct ManagerInner {
    pool: ConnectionPool,
    cache: QueryCache,
    retry: BackoffExecutor,
    settings: ManagerSettings,
    background: Mutex<Option<Background>>,
}

/// Cheap to clone; every clone shares the same pools and cache.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager").field("settings", &self.inner.settings).finish_non_exhaustive()
    }
}

impl ClientManager {
    pub fn new(store: Arc<dyn RemoteStore>, settings: ManagerSettings) -> Self {
        let inner = ManagerInner {
            pool: ConnectionPool::new(store, settings.pool.clone()),
            cache: QueryCache::new(settings.cache_max_entries),
            retry: BackoffExecutor::new(settings.retry.clone()),
            settings,
            background: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Spawns the pool sweep and cache purge. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut background = self.inner.background.lock().unwrap_or_else(PoisonError::into_inner);
        if background.is_some() {
            return;
        }

        let (shutdown, signal) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let pool_sweep = spawn_periodic(
            "pool_sweep",
            self.inner.settings.pool_sweep_interval,
            signal.clone(),
            weak.clone(),
            |inner| inner.pool.sweep_idle().map(|_| ()),
        );
        let mut tasks = vec![pool_sweep];
        if self.inner.settings.cache_enabled {
            tasks.push(spawn_periodic(
                "cache_purge",
                self.inner.settings.cache_sweep_interval,
                signal,
                weak,
                |inner| inner.cache.purge_expired().map(|_| ()),
            ));
        }

        *background = Some(Background { shutdown, tasks });
        info!(event_name = "db.manager.started", "client manager background tasks started");
    }

    /// Stops background tasks and closes the pools. In-flight operations keep
    /// the handles they hold; new acquires fail.
    pub async fn shutdown(&self) {
        let background =
            self.inner.background.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            for task in background.tasks {
                if let Err(join_error) = task.await {
                    warn!(event_name = "db.manager.task_failed", error = %join_error, "background task ended abnormally");
                }
            }
        }
        self.inner.pool.close();
        info!(event_name = "db.manager.stopped", "client manager shut down");
    }

    /// Reads with the table's configured TTL.
    pub async fn execute_query(
        &self,
        scope: &Scope,
        query: &Query,
    ) -> Result<Arc<Vec<Row>>, DataError> {
        let ttl = self.inner.settings.ttl.ttl_for(&query.table);
        self.execute_query_with_ttl(scope, query, ttl).await
    }

    pub async fn execute_query_with_ttl(
        &self,
        scope: &Scope,
        query: &Query,
        ttl: Duration,
    ) -> Result<Arc<Vec<Row>>, DataError> {
        let inner = &self.inner;
        let key = scope.key();
        if !inner.settings.cache_enabled {
            return inner.fetch(scope, query).await.map(Arc::new);
        }

        let cache_key = CacheKey::for_query(&key, query);
        if let Some(rows) = inner.cache.get(&cache_key)? {
            debug!(
                event_name = "db.cache.hit",
                scope = %key,
                table = %query.table,
                fingerprint = %query.fingerprint(),
                rows = rows.len(),
                "served read from cache"
            );
            return Ok(rows);
        }
        debug!(
            event_name = "db.cache.miss",
            scope = %key,
            table = %query.table,
            fingerprint = %query.fingerprint(),
            "cache miss"
        );

        let generation = inner.cache.generation(&key, &query.table)?;
        let rows = Arc::new(inner.fetch(scope, query).await?);
        if !rows.is_empty() || inner.settings.cache_empty_results {
            inner.cache.put_if_current(cache_key, rows.clone(), ttl, generation)?;
        }
        Ok(rows)
    }

    /// Applies `op` and invalidates affected cache entries before returning.
    /// The write finishes even if the returned future is dropped.
    pub async fn execute_write(&self, scope: &Scope, op: WriteOp) -> Result<Vec<Row>, DataError> {
        let inner = self.inner.clone();
        let scope = scope.clone();
        let task = tokio::spawn(async move { inner.write(&scope, &op).await });
        task.await.map_err(|join_error| DataError::Internal(format!("write task failed: {join_error}")))?
    }

    /// Runs `batch` to completion on its own task.
    pub async fn run_batch(&self, scope: &Scope, batch: Batch) -> Result<BatchResult, DataError> {
        let inner = self.inner.clone();
        let scope = scope.clone();
        let task = tokio::spawn(async move {
            let mut executor = BatchExecutor::new(&inner.pool, &inner.retry)
                .with_max_chunk_size(inner.settings.max_chunk_size);
            if inner.settings.cache_enabled {
                executor = executor.with_cache(&inner.cache);
            }
            executor.run_batch(&scope, &batch).await
        });
        task.await.map_err(|join_error| DataError::Internal(format!("batch task failed: {join_error}")))?
    }

    /// Whether the backend answers a service-scope ping.
    pub async fn health_check(&self) -> bool {
        self.inner.pool.health_check(&Scope::Service).await
    }

    /// Forgets everything cached or pooled for `user_id`, e.g. on sign-out.
    pub fn invalidate_user(&self, user_id: &str) -> Result<(), DataError> {
        let key = ScopeKey::User(user_id.to_string());
        let entries = self.inner.cache.invalidate_scope(&key)?;
        let handles = self.inner.pool.invalidate_scope(&key)?;
        debug!(event_name = "db.manager.user_invalidated", scope = %key, entries, handles, "dropped user state");
        Ok(())
    }

    pub fn stats(&self) -> Result<ManagerStats, DataError> {
        Ok(ManagerStats {
            pool: self.inner.pool.stats()?,
            cache: self.inner.cache.stats()?,
            cache_enabled: self.inner.settings.cache_enabled,
        })
    }
}

impl ManagerInner {
    async fn fetch(&self, scope: &Scope, query: &Query) -> Result<Vec<Row>, DataError> {
        let connection = self.pool.acquire(scope).await?;
        let session = connection.session();
        let outcome = self.retry.run_remote(move || session.select(query)).await;
        match outcome {
            Ok(rows) => Ok(rows),
            Err(failure) => {
                connection.release_after_error(failure.error());
                let error = DataError::from(failure);
                warn!(
                    event_name = "db.query.failed",
                    scope = %scope,
                    table = %query.table,
                    error = %error,
                    "read failed"
                );
                Err(error)
            }
        }
    }

    async fn write(&self, scope: &Scope, op: &WriteOp) -> Result<Vec<Row>, DataError> {
        let outcome = self.write_remote(scope, op).await;

        // A failed write may still have landed, so invalidate either way.
        if self.settings.cache_enabled {
            let removed = self.cache.invalidate_after_write(&scope.key(), op.table())?;
            debug!(
                event_name = "db.cache.invalidated",
                scope = %scope,
                table = op.table(),
                removed,
                "invalidated after write"
            );
        }

        match &outcome {
            Ok(rows) => debug!(
                event_name = "db.write.completed",
                scope = %scope,
                table = op.table(),
                kind = op.kind(),
                rows = rows.len(),
                "write applied"
            ),
            Err(error) => warn!(
                event_name = "db.write.failed",
                scope = %scope,
                table = op.table(),
                kind = op.kind(),
                error = %error,
                "write failed"
            ),
        }
        outcome
    }

    async fn write_remote(&self, scope: &Scope, op: &WriteOp) -> Result<Vec<Row>, DataError> {
        let connection = self.pool.acquire(scope).await?;
        let session = connection.session();
        let outcome = self.retry.run_write(op, move || session.write(op)).await;
        match outcome {
            Ok(rows) => Ok(rows),
            Err(failure) => {
                connection.release_after_error(failure.error());
                Err(DataError::from(failure))
            }
        }
    }
}

fn spawn_periodic(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    inner: Weak<ManagerInner>,
    job: fn(&ManagerInner) -> Result<(), DataError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if let Err(job_error) = job(&inner) {
                error!(event_name = "db.manager.job_failed", job = name, error = %job_error, "background job failed");
            }
        }
        debug!(event_name = "db.manager.job_stopped", job = name, "background job stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use bizdesk_core::config::AppConfig;
    use bizdesk_core::errors::{DataError, RemoteError, RemoteErrorKind};
    use bizdesk_core::query::{DeleteMode, Filter, Query, WriteOp};
    use bizdesk_core::scope::Scope;

    use super::{ClientManager, ManagerSettings};
    use crate::batch::{Batch, BatchStatus};
    use crate::cache::TtlPolicy;
    use crate::pool::PoolSettings;
    use crate::retry::RetryPolicy;
    use crate::testing::ScriptedStore;

    fn settings() -> ManagerSettings {
        ManagerSettings {
            pool: PoolSettings {
                max_handles_per_scope: 2,
                acquire_timeout: Duration::from_secs(5),
                ..PoolSettings::default()
            },
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            },
            ttl: TtlPolicy::new(Duration::from_secs(300))
                .with_table("invoices", Duration::from_secs(5)),
            ..ManagerSettings::default()
        }
    }

    fn manager(store: &ScriptedStore, settings: ManagerSettings) -> ClientManager {
        ClientManager::new(Arc::new(store.clone()), settings)
    }

    async fn seed_invoices(store: &ScriptedStore) {
        store
            .memory()
            .seed(
                "invoices",
                [
                    json!({"id": "inv-1", "user_id": "42", "status": "paid"}),
                    json!({"id": "inv-2", "user_id": "42", "status": "draft"}),
                    json!({"id": "inv-3", "user_id": "7", "status": "paid"}),
                ],
            )
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn reads_within_ttl_hit_the_backend_once() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        let scope = Scope::user("42", "jwt-42");
        let query = Query::table("invoices").filter(Filter::eq("status", "paid"));

        let first = manager.execute_query(&scope, &query).await.expect("first read");
        tokio::time::advance(Duration::from_secs(2)).await;
        let second = manager.execute_query(&scope, &query).await.expect("second read");

        assert_eq!(store.selects(), 1);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        manager.execute_query(&scope, &query).await.expect("read after ttl");
        assert_eq!(store.selects(), 2);
    }

    #[tokio::test]
    async fn read_after_write_sees_the_write() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        let scope = Scope::user("42", "jwt-42");
        let query = Query::table("invoices");

        assert_eq!(manager.execute_query(&scope, &query).await.expect("read").len(), 2);
        manager
            .execute_write(
                &scope,
                WriteOp::Insert {
                    table: "invoices".to_string(),
                    rows: vec![json!({"id": "inv-4", "status": "draft"})],
                },
            )
            .await
            .expect("write");

        let after = manager.execute_query(&scope, &query).await.expect("read again");
        assert_eq!(after.len(), 3);
        assert_eq!(store.selects(), 2);
    }

    #[tokio::test]
    async fn scopes_are_isolated_in_the_cache() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        let query = Query::table("invoices");

        let user_42 = manager.execute_query(&Scope::user("42", "a"), &query).await.expect("42");
        let user_7 = manager.execute_query(&Scope::user("7", "b"), &query).await.expect("7");
        let service = manager.execute_query(&Scope::Service, &query).await.expect("service");

        assert_eq!((user_42.len(), user_7.len(), service.len()), (2, 1, 3));
        assert_eq!(store.selects(), 3);
    }

    #[tokio::test]
    async fn user_write_drops_service_entries_but_not_other_users() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        let query = Query::table("invoices");
        let user_42 = Scope::user("42", "a");
        let user_7 = Scope::user("7", "b");

        manager.execute_query(&Scope::Service, &query).await.expect("service");
        manager.execute_query(&user_7, &query).await.expect("7");
        manager
            .execute_write(
                &user_42,
                WriteOp::Delete {
                    table: "invoices".to_string(),
                    filters: vec![Filter::eq("id", "inv-2")],
                    mode: DeleteMode::Hard,
                },
            )
            .await
            .expect("delete");

        assert_eq!(manager.execute_query(&Scope::Service, &query).await.expect("service").len(), 2);
        manager.execute_query(&user_7, &query).await.expect("7 again");
        assert_eq!(store.selects(), 3, "user 7's entry survived");
    }

    #[tokio::test]
    async fn per_scope_cap_makes_excess_readers_wait() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let gate = store.gate_selects();
        let manager = manager(&store, settings());

        let readers: Vec<_> = ["paid", "draft", "void"]
            .into_iter()
            .map(|status| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let query = Query::table("invoices").filter(Filter::eq("status", status));
                    manager.execute_query(&Scope::user("7", "jwt-7"), &query).await
                })
            })
            .collect();

        while store.in_flight() < 2 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.in_flight(), 2, "third reader waits for a handle");
        assert_eq!(manager.stats().expect("stats").pool.in_use, 2);

        gate.add_permits(3);
        for reader in readers {
            reader.await.expect("join").expect("read");
        }
        assert_eq!(store.max_in_flight(), 2);
        assert_eq!(store.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_read_failures_are_retried_on_the_same_handle() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        store.fail_next_selects([
            RemoteError::from_status(503, "busy"),
            RemoteError::new(RemoteErrorKind::Timeout, "slow"),
        ]);

        let rows =
            manager.execute_query(&Scope::Service, &Query::table("invoices")).await.expect("read");

        assert_eq!(rows.len(), 3);
        assert_eq!(store.selects(), 3);
        assert_eq!(store.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reads_are_not_cached_and_discard_the_handle() {
        let store = ScriptedStore::new();
        let manager = manager(&store, settings());
        store.fail_next_selects((0..4).map(|_| RemoteError::from_status(503, "down")));

        let error = manager
            .execute_query(&Scope::Service, &Query::table("invoices"))
            .await
            .expect_err("exhausted");
        assert!(matches!(error, DataError::RetryExhausted { attempts: 4, .. }));
        assert_eq!(
            error.user_message(),
            "The data service is temporarily unavailable. Please try again shortly."
        );

        let stats = manager.stats().expect("stats");
        assert_eq!(stats.cache.entries, 0);
        assert_eq!(stats.pool.idle, 0);
        assert_eq!(stats.pool.evicted_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_write_still_completes_and_invalidates() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        let scope = Scope::user("42", "jwt-42");
        let query = Query::table("invoices");
        manager.execute_query(&scope, &query).await.expect("warm cache");

        store.fail_next_writes([RemoteError::from_status(503, "busy")]);
        let write = manager.execute_write(
            &scope,
            WriteOp::Update {
                table: "invoices".to_string(),
                filters: vec![Filter::eq("id", "inv-2")],
                patch: json!({"status": "sent"}),
            },
        );
        let abandoned = tokio::time::timeout(Duration::from_millis(10), write).await;
        assert!(abandoned.is_err(), "caller gave up during the retry delay");

        tokio::time::sleep(Duration::from_secs(1)).await;

        let rows = manager.execute_query(&scope, &query).await.expect("read");
        assert!(rows.iter().any(|row| row["status"] == "sent"));
        assert_eq!(store.selects(), 2);
    }

    #[tokio::test]
    async fn failed_write_still_invalidates() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        let scope = Scope::user("42", "jwt-42");
        let query = Query::table("invoices");
        manager.execute_query(&scope, &query).await.expect("warm cache");

        store.fail_next_writes([RemoteError::from_status(422, "bad amount")]);
        let error = manager
            .execute_write(
                &scope,
                WriteOp::Insert { table: "invoices".to_string(), rows: vec![json!({})] },
            )
            .await
            .expect_err("rejected");
        assert!(matches!(error, DataError::Permanent(_)));

        manager.execute_query(&scope, &query).await.expect("read");
        assert_eq!(store.selects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn insert_with_lost_response_is_applied_once() {
        let store = ScriptedStore::new();
        let manager = manager(&store, settings());
        let scope = Scope::user("42", "jwt-42");
        let query = Query::table("invoices");
        manager.execute_query(&scope, &query).await.expect("warm cache");
        store.lose_next_write_responses([RemoteError::new(RemoteErrorKind::Timeout, "no reply")]);

        let error = manager
            .execute_write(
                &scope,
                WriteOp::Insert {
                    table: "invoices".to_string(),
                    rows: vec![json!({"number": "INV-1"})],
                },
            )
            .await
            .expect_err("outcome unknown");

        assert!(matches!(
            error,
            DataError::Permanent(ref remote) if remote.kind == RemoteErrorKind::Timeout
        ));
        assert_eq!(store.writes(), 1);
        assert_eq!(store.memory().rows("invoices").await.len(), 1);
        assert_eq!(manager.execute_query(&scope, &query).await.expect("read").len(), 1);
        assert_eq!(manager.stats().expect("stats").pool.evicted_total, 1);
    }

    #[tokio::test]
    async fn rejected_requests_keep_their_handle() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        store.fail_next_selects([RemoteError::from_status(404, "no such table")]);
        store.fail_next_writes([RemoteError::from_status(422, "bad amount")]);

        manager
            .execute_query(&Scope::Service, &Query::table("invoicez"))
            .await
            .expect_err("not found");
        manager
            .execute_write(
                &Scope::Service,
                WriteOp::Update {
                    table: "invoices".to_string(),
                    filters: vec![Filter::eq("id", "inv-1")],
                    patch: json!({"amount": -1}),
                },
            )
            .await
            .expect_err("rejected");

        let stats = manager.stats().expect("stats");
        assert_eq!(stats.pool.evicted_total, 0);
        assert_eq!(stats.pool.idle, 1);
        assert_eq!(store.connects(), 1);
    }

    #[tokio::test]
    async fn batch_through_manager_invalidates_once() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        let scope = Scope::user("42", "jwt-42");
        manager.execute_query(&scope, &Query::table("invoices")).await.expect("warm cache");

        let result = manager
            .run_batch(&scope, Batch::delete_ids("invoices", ["inv-1", "inv-2"], DeleteMode::soft()))
            .await
            .expect("batch");

        assert_eq!(result.status(), BatchStatus::Complete);
        let stats = manager.stats().expect("stats");
        assert_eq!(stats.cache.invalidation_passes, 1);
        assert_eq!(stats.cache.entries, 0);
    }

    #[tokio::test]
    async fn disabled_cache_always_reads_through() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, ManagerSettings { cache_enabled: false, ..settings() });
        let query = Query::table("invoices");

        manager.execute_query(&Scope::Service, &query).await.expect("first");
        manager.execute_query(&Scope::Service, &query).await.expect("second");

        assert_eq!(store.selects(), 2);
        assert_eq!(manager.stats().expect("stats").cache.entries, 0);
    }

    #[tokio::test]
    async fn empty_results_can_be_left_uncached() {
        let store = ScriptedStore::new();
        let manager =
            manager(&store, ManagerSettings { cache_empty_results: false, ..settings() });
        let query = Query::table("reviews");

        manager.execute_query(&Scope::Service, &query).await.expect("first");
        manager.execute_query(&Scope::Service, &query).await.expect("second");

        assert_eq!(store.selects(), 2);
    }

    #[tokio::test]
    async fn invalidate_user_drops_cached_reads() {
        let store = ScriptedStore::new();
        seed_invoices(&store).await;
        let manager = manager(&store, settings());
        let scope = Scope::user("42", "jwt-42");
        let query = Query::table("invoices");

        manager.execute_query(&scope, &query).await.expect("warm");
        manager.invalidate_user("42").expect("invalidate");
        manager.execute_query(&scope, &query).await.expect("read");

        assert_eq!(store.selects(), 2);
        assert_eq!(store.connects(), 2, "idle handle was dropped too");
    }

    #[tokio::test]
    async fn health_check_reports_backend_state() {
        let store = ScriptedStore::new();
        let manager = manager(&store, settings());

        assert!(manager.health_check().await);
        store.fail_next_ping(RemoteError::new(RemoteErrorKind::Connect, "refused"));
        assert!(!manager.health_check().await);
    }

    #[tokio::test(start_paused = true)]
    async fn background_jobs_run_until_shutdown() {
        let store = ScriptedStore::new();
        let manager = manager(
            &store,
            ManagerSettings {
                pool_sweep_interval: Duration::from_secs(1),
                pool: PoolSettings { idle_timeout: Duration::from_secs(2), ..settings().pool },
                ..settings()
            },
        );
        manager.start();
        manager.start();

        manager.execute_query(&Scope::user("9", "jwt"), &Query::table("projects")).await.expect("read");
        assert_eq!(manager.stats().expect("stats").pool.scopes, 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(manager.stats().expect("stats").pool.scopes, 1, "idle user pool retired");

        manager.shutdown().await;
        let error = manager
            .execute_query(&Scope::Service, &Query::table("projects").limit(1))
            .await
            .expect_err("closed");
        assert!(matches!(error, DataError::Connection { .. }));
    }

    #[test]
    fn settings_follow_app_config() {
        let mut config = AppConfig::default();
        config.cache.enabled = false;
        config.pool.max_handles_per_scope = 4;
        config.retry.max_retries = 5;

        let settings = ManagerSettings::from(&config);
        assert!(!settings.cache_enabled);
        assert_eq!(settings.pool.max_handles_per_scope, 4);
        assert_eq!(settings.retry.max_attempts(), 6);
        assert_eq!(settings.ttl.ttl_for("appointments"), Duration::from_secs(120));
    }
}
