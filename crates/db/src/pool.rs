//! Scope-partitioned connection pool.
//!
//! Each [`ScopeKey`] owns a semaphore sized to `max_handles_per_scope` and an
//! idle list. A checkout holds one permit for as long as it lives; a new
//! handle is opened only while holding a permit and finding no reusable idle
//! handle, so `checked_out + idle <= max_handles_per_scope` per scope. Moving a
//! handle between the two sets happens under the idle lock, so stats never
//! see one handle on both sides.
//!
//! The service pool lives as long as the pool itself. User pools are created
//! on first use and retired by [`ConnectionPool::sweep_idle`] once nobody has
//! touched them for `idle_timeout`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bizdesk_core::config::PoolConfig;
use bizdesk_core::errors::{DataError, RemoteError};
use bizdesk_core::scope::{Scope, ScopeKey};

use crate::remote::{RemoteSession, RemoteStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_handles_per_scope: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_handles_per_scope: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3_600),
        }
    }
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_handles_per_scope: config.max_handles_per_scope as usize,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_lifetime: Duration::from_secs(config.max_lifetime_secs),
        }
    }
}

/// An open, authenticated session plus the bookkeeping the pool needs.
pub struct ConnectionHandle {
    id: u64,
    scope: ScopeKey,
    fingerprint: String,
    session: Arc<dyn RemoteSession>,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl ConnectionHandle {
    fn open(
        id: u64,
        scope: ScopeKey,
        fingerprint: String,
        session: Arc<dyn RemoteSession>,
    ) -> Self {
        let now = Instant::now();
        Self { id, scope, fingerprint, session, created_at: now, last_used: now, use_count: 0 }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    fn is_expired(&self, now: Instant, settings: &PoolSettings) -> bool {
        now.duration_since(self.last_used) >= settings.idle_timeout
            || now.duration_since(self.created_at) >= settings.max_lifetime
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}

struct ScopePool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<ConnectionHandle>>,
    /// Handles currently held by callers. Only changed under the `idle` lock.
    checked_out: AtomicUsize,
    /// Callers currently waiting on or holding a checkout. Only incremented
    /// under the scope map lock.
    users: AtomicUsize,
    last_activity: Mutex<Instant>,
}

impl ScopePool {
    fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(Vec::new()),
            checked_out: AtomicUsize::new(0),
            users: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn check_out_new(&self) {
        let _idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        self.checked_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a handle to the idle list, or just forgets it when `handle` is
    /// `None` or the pool is closed.
    fn check_in(&self, handle: Option<ConnectionHandle>) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        self.checked_out.fetch_sub(1, Ordering::Relaxed);
        if let Some(mut handle) = handle {
            if !self.semaphore.is_closed() {
                handle.last_used = Instant::now();
                idle.push(handle);
            }
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.last_activity.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Default)]
struct PoolCounters {
    opened: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    exhausted: AtomicU64,
}

impl PoolCounters {
    fn evicted(&self, count: usize) {
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub scopes: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opened_total: u64,
    pub reused_total: u64,
    pub evicted_total: u64,
    pub exhausted_total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub retired_scopes: usize,
}

pub struct ConnectionPool {
    store: Arc<dyn RemoteStore>,
    settings: PoolSettings,
    scopes: Mutex<HashMap<ScopeKey, Arc<ScopePool>>>,
    counters: Arc<PoolCounters>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(store: Arc<dyn RemoteStore>, settings: PoolSettings) -> Self {
        let mut scopes = HashMap::new();
        scopes.insert(ScopeKey::Service, Arc::new(ScopePool::new(settings.max_handles_per_scope)));
        Self {
            store,
            settings,
            scopes: Mutex::new(scopes),
            counters: Arc::default(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Checks out a handle for `scope`, waiting up to `acquire_timeout` for
    /// capacity. Dropping the returned guard returns the handle.
    pub async fn acquire(&self, scope: &Scope) -> Result<PooledConnection, DataError> {
        let key = scope.key();
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error(&key));
        }

        let scope_pool = self.enter_scope(&key)?;
        let checkout = Checkout { pool: scope_pool };

        let started = Instant::now();
        let acquired = tokio::time::timeout(
            self.settings.acquire_timeout,
            checkout.pool.semaphore.clone().acquire_owned(),
        )
        .await;
        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(closed_error(&key)),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_name = "db.pool.exhausted",
                    scope = %key,
                    waited_ms,
                    max_handles = self.settings.max_handles_per_scope,
                    "no connection became available before the acquire timeout"
                );
                return Err(DataError::PoolExhausted { scope: key.to_string(), waited_ms });
            }
        };

        let fingerprint = scope.credential_fingerprint();
        let reused = self.take_idle(&checkout.pool, &fingerprint)?;
        let mut handle = match reused {
            Some(handle) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                handle
            }
            None => {
                let session = self.store.connect(scope).await.map_err(|error| {
                    warn!(
                        event_name = "db.pool.connect_failed",
                        scope = %key,
                        error = %error,
                        "could not open a connection"
                    );
                    DataError::Connection { scope: key.to_string(), message: error.to_string() }
                })?;
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.counters.opened.fetch_add(1, Ordering::Relaxed);
                checkout.pool.check_out_new();
                debug!(event_name = "db.pool.opened", scope = %key, handle_id = id, "opened connection");
                ConnectionHandle::open(id, key.clone(), fingerprint, session)
            }
        };
        handle.use_count += 1;
        handle.last_used = Instant::now();

        Ok(PooledConnection {
            session: handle.session.clone(),
            handle: Some(handle),
            permit: Some(permit),
            counters: self.counters.clone(),
            checkout,
        })
    }

    /// Returns a checked-out handle to its idle list.
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Pings the backend through a pooled handle. A failing handle is evicted
    /// rather than recycled.
    pub async fn health_check(&self, scope: &Scope) -> bool {
        let connection = match self.acquire(scope).await {
            Ok(connection) => connection,
            Err(error) => {
                warn!(event_name = "db.pool.health_check_failed", scope = %scope, error = %error, "health check could not acquire");
                return false;
            }
        };
        match connection.session().ping().await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    event_name = "db.pool.health_check_failed",
                    scope = %scope,
                    handle_id = connection.handle_id(),
                    error = %error,
                    "evicting handle after failed ping"
                );
                connection.discard();
                false
            }
        }
    }

    /// Evicts expired idle handles and retires user pools that have been
    /// unused for `idle_timeout`.
    pub fn sweep_idle(&self) -> Result<SweepReport, DataError> {
        let now = Instant::now();
        let mut report = SweepReport::default();

        let pools: Vec<(ScopeKey, Arc<ScopePool>)> =
            lock(&self.scopes)?.iter().map(|(key, pool)| (key.clone(), pool.clone())).collect();
        for (_, pool) in &pools {
            let expired: Vec<ConnectionHandle> = {
                let mut idle = lock(&pool.idle)?;
                let (expired, live) = idle
                    .drain(..)
                    .partition(|handle: &ConnectionHandle| handle.is_expired(now, &self.settings));
                *idle = live;
                expired
            };
            report.evicted += expired.len();
        }

        {
            let mut scopes = lock(&self.scopes)?;
            let before = scopes.len();
            scopes.retain(|key, pool| {
                let retire = *key != ScopeKey::Service
                    && pool.users.load(Ordering::Acquire) == 0
                    && pool.idle_for(now) >= self.settings.idle_timeout;
                if retire {
                    let idle = pool.idle.lock().unwrap_or_else(PoisonError::into_inner).len();
                    report.evicted += idle;
                }
                !retire
            });
            report.retired_scopes = before - scopes.len();
        }

        self.counters.evicted(report.evicted);
        if report.evicted > 0 || report.retired_scopes > 0 {
            debug!(
                event_name = "db.pool.swept",
                evicted = report.evicted,
                retired_scopes = report.retired_scopes,
                "pool sweep finished"
            );
        }
        Ok(report)
    }

    /// Drops every idle handle for `key`. Checked-out handles are unaffected.
    pub fn invalidate_scope(&self, key: &ScopeKey) -> Result<usize, DataError> {
        let pool = lock(&self.scopes)?.get(key).cloned();
        let Some(pool) = pool else {
            return Ok(0);
        };
        let dropped = std::mem::take(&mut *lock(&pool.idle)?);
        self.counters.evicted(dropped.len());
        Ok(dropped.len())
    }

    pub fn stats(&self) -> Result<PoolStats, DataError> {
        let scopes = lock(&self.scopes)?;
        let mut stats = PoolStats {
            scopes: scopes.len(),
            opened_total: self.counters.opened.load(Ordering::Relaxed),
            reused_total: self.counters.reused.load(Ordering::Relaxed),
            evicted_total: self.counters.evicted.load(Ordering::Relaxed),
            exhausted_total: self.counters.exhausted.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for pool in scopes.values() {
            let idle = lock(&pool.idle)?;
            stats.idle += idle.len();
            stats.in_use += pool.checked_out.load(Ordering::Relaxed);
        }
        Ok(stats)
    }

    /// Rejects new and waiting acquires and drops idle handles. Handles still
    /// checked out are closed when their guards drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let scopes = lock(&self.scopes).map(|scopes| scopes.values().cloned().collect::<Vec<_>>());
        let scopes = scopes.unwrap_or_default();
        for pool in scopes {
            pool.semaphore.close();
            pool.idle.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
        info!(event_name = "db.pool.closed", "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn enter_scope(&self, key: &ScopeKey) -> Result<Arc<ScopePool>, DataError> {
        let mut scopes = lock(&self.scopes)?;
        let pool = scopes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ScopePool::new(self.settings.max_handles_per_scope)))
            .clone();
        pool.users.fetch_add(1, Ordering::AcqRel);
        pool.touch();
        Ok(pool)
    }

    /// Pops a reusable idle handle. Expired handles and handles opened with a
    /// different credential are dropped on the way.
    fn take_idle(
        &self,
        pool: &ScopePool,
        fingerprint: &str,
    ) -> Result<Option<ConnectionHandle>, DataError> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let found = {
            let mut idle = lock(&pool.idle)?;
            let mut found = None;
            while let Some(handle) = idle.pop() {
                if handle.is_expired(now, &self.settings) || handle.fingerprint != fingerprint {
                    stale.push(handle);
                } else {
                    pool.checked_out.fetch_add(1, Ordering::Relaxed);
                    found = Some(handle);
                    break;
                }
            }
            found
        };
        if !stale.is_empty() {
            self.counters.evicted(stale.len());
            debug!(event_name = "db.pool.evicted", evicted = stale.len(), "dropped stale idle handles");
        }
        Ok(found)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, DataError> {
    mutex.lock().map_err(|_| DataError::Internal("connection pool lock poisoned".to_string()))
}

fn closed_error(key: &ScopeKey) -> DataError {
    DataError::Connection { scope: key.to_string(), message: "connection pool is closed".to_string() }
}

/// Counts a caller against its scope pool until dropped, so the sweep never
/// retires a pool somebody is waiting on.
struct Checkout {
    pool: Arc<ScopePool>,
}

impl Drop for Checkout {
    fn drop(&mut self) {
        self.pool.touch();
        self.pool.users.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A checked-out handle. Returned to the idle list on drop.
pub struct PooledConnection {
    session: Arc<dyn RemoteSession>,
    handle: Option<ConnectionHandle>,
    permit: Option<OwnedSemaphorePermit>,
    counters: Arc<PoolCounters>,
    checkout: Checkout,
}

impl PooledConnection {
    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    pub fn handle_id(&self) -> u64 {
        self.handle.as_ref().map(ConnectionHandle::id).unwrap_or_default()
    }

    pub fn use_count(&self) -> u64 {
        self.handle.as_ref().map(ConnectionHandle::use_count).unwrap_or_default()
    }

    /// Closes the handle instead of recycling it, e.g. after a failed call.
    pub fn discard(mut self) {
        if self.handle.take().is_some() {
            self.checkout.pool.check_in(None);
            self.counters.evicted(1);
        }
    }

    /// Releases the handle after a call that failed with `error`. Transport
    /// failures discard it; a request the backend rejected leaves it usable.
    pub fn release_after_error(self, error: &RemoteError) {
        if error.is_transient() {
            self.discard();
        } else {
            drop(self);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.checkout.pool.check_in(Some(handle));
        }
        // The handle is back on the idle list before the permit frees up.
        drop(self.permit.take());
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("handle", &self.handle).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bizdesk_core::errors::{DataError, RemoteError, RemoteErrorKind};
    use bizdesk_core::scope::{Scope, ScopeKey};

    use super::{ConnectionPool, PoolSettings};
    use crate::testing::ScriptedStore;

    fn settings(max: usize) -> PoolSettings {
        PoolSettings {
            max_handles_per_scope: max,
            acquire_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(600),
        }
    }

    fn pool(store: &ScriptedStore, max: usize) -> ConnectionPool {
        ConnectionPool::new(Arc::new(store.clone()), settings(max))
    }

    #[tokio::test]
    async fn released_handles_are_reused() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 2);
        let scope = Scope::user("42", "jwt");

        let first = pool.acquire(&scope).await.expect("first acquire");
        let first_id = first.handle_id();
        pool.release(first);
        let second = pool.acquire(&scope).await.expect("second acquire");

        assert_eq!(second.handle_id(), first_id);
        assert_eq!(second.use_count(), 2);
        assert_eq!(store.connects(), 1);
        let stats = pool.stats().expect("stats");
        assert_eq!((stats.opened_total, stats.reused_total, stats.in_use), (1, 1, 1));
    }

    #[tokio::test]
    async fn handles_never_cross_scopes_or_credentials() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 2);

        drop(pool.acquire(&Scope::user("7", "jwt-7")).await.expect("user 7"));
        drop(pool.acquire(&Scope::user("42", "jwt-42")).await.expect("user 42"));
        drop(pool.acquire(&Scope::Service).await.expect("service"));
        assert_eq!(store.connects(), 3);

        // Same user, refreshed token: the old handle is dropped, not reused.
        let refreshed = pool.acquire(&Scope::user("42", "jwt-42-refreshed")).await.expect("refreshed");
        assert_eq!(store.connects(), 4);
        assert_eq!(pool.stats().expect("stats").evicted_total, 1);
        drop(refreshed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_scope_waits_then_times_out() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 2);
        let scope = Scope::user("7", "jwt");

        let a = pool.acquire(&scope).await.expect("a");
        let _b = pool.acquire(&scope).await.expect("b");

        let error = pool.acquire(&scope).await.expect_err("cap reached");
        assert!(matches!(error, DataError::PoolExhausted { waited_ms: 500, .. }));

        drop(a);
        let c = pool.acquire(&scope).await.expect("capacity freed");
        assert_eq!(store.connects(), 2, "freed handle is reused");
        drop(c);

        // Other scopes are not affected by user 7's cap.
        pool.acquire(&Scope::user("8", "jwt")).await.expect("independent scope");
    }

    #[tokio::test]
    async fn waiter_is_served_when_a_handle_is_released() {
        let store = ScriptedStore::new();
        let pool = Arc::new(pool(&store, 1));
        let scope = Scope::user("7", "jwt");

        let held = pool.acquire(&scope).await.expect("held");
        let waiter = tokio::spawn({
            let pool = pool.clone();
            let scope = scope.clone();
            async move { pool.acquire(&scope).await.map(|conn| conn.handle_id()) }
        });
        tokio::task::yield_now().await;
        let held_id = held.handle_id();
        drop(held);

        assert_eq!(waiter.await.expect("join").expect("acquire"), held_id);
        assert_eq!(store.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_handles_and_retires_user_pools() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 2);

        drop(pool.acquire(&Scope::user("42", "jwt")).await.expect("user"));
        drop(pool.acquire(&Scope::Service).await.expect("service"));
        assert_eq!(pool.stats().expect("stats").scopes, 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        let early = pool.sweep_idle().expect("sweep");
        assert_eq!(early.evicted, 0);
        assert_eq!(early.retired_scopes, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = pool.sweep_idle().expect("sweep");
        assert_eq!(report.evicted, 2);
        assert_eq!(report.retired_scopes, 1);

        let stats = pool.stats().expect("stats");
        assert_eq!(stats.scopes, 1, "service pool is kept");
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pools_with_checkouts_are_not_retired() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 2);

        let held = pool.acquire(&Scope::user("42", "jwt")).await.expect("user");
        tokio::time::advance(Duration::from_secs(120)).await;

        assert_eq!(pool.sweep_idle().expect("sweep").retired_scopes, 0);
        drop(held);
        assert_eq!(pool.stats().expect("stats").idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handles_past_max_lifetime_are_replaced() {
        let store = ScriptedStore::new();
        let pool = ConnectionPool::new(
            Arc::new(store.clone()),
            PoolSettings { max_lifetime: Duration::from_secs(10), ..settings(2) },
        );

        for _ in 0..3 {
            drop(pool.acquire(&Scope::Service).await.expect("acquire"));
            tokio::time::advance(Duration::from_secs(6)).await;
        }

        assert_eq!(store.connects(), 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_capacity() {
        let store = ScriptedStore::new();
        let pool = Arc::new(pool(&store, 1));
        let scope = Scope::user("7", "jwt");

        let held = pool.acquire(&scope).await.expect("held");
        let waiter = tokio::spawn({
            let pool = pool.clone();
            let scope = scope.clone();
            async move { pool.acquire(&scope).await.map(|_| ()) }
        });
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;
        drop(held);

        let again = pool.acquire(&scope).await.expect("capacity restored");
        assert_eq!(pool.stats().expect("stats").in_use, 1);
        drop(again);
    }

    #[tokio::test]
    async fn failed_health_check_discards_the_handle() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 2);

        assert!(pool.health_check(&Scope::Service).await);
        assert_eq!(pool.stats().expect("stats").idle, 1);

        store.fail_next_ping(RemoteError::from_status(503, "down"));
        assert!(!pool.health_check(&Scope::Service).await);
        let stats = pool.stats().expect("stats");
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.evicted_total, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stats_count_each_handle_once_under_contention() {
        let store = ScriptedStore::new();
        let pool = Arc::new(pool(&store, 3));
        let scope = Scope::user("7", "jwt");

        let workers: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                let scope = scope.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let connection = pool.acquire(&scope).await.expect("acquire");
                        tokio::task::yield_now().await;
                        drop(connection);
                    }
                })
            })
            .collect();

        while !workers.iter().all(|worker| worker.is_finished()) {
            let stats = pool.stats().expect("stats");
            assert!(
                stats.idle + stats.in_use <= 3,
                "idle {} + in_use {} exceeds the cap",
                stats.idle,
                stats.in_use
            );
            tokio::task::yield_now().await;
        }
        for worker in workers {
            worker.await.expect("join");
        }

        let stats = pool.stats().expect("stats");
        assert_eq!(stats.in_use, 0);
        assert!(stats.idle <= 3);
        assert!(store.connects() <= 3);
    }

    #[tokio::test]
    async fn rejected_requests_keep_the_handle_and_transport_failures_drop_it() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 2);

        let connection = pool.acquire(&Scope::Service).await.expect("acquire");
        connection.release_after_error(&RemoteError::from_status(404, "no such table"));
        let stats = pool.stats().expect("stats");
        assert_eq!((stats.idle, stats.in_use, stats.evicted_total), (1, 0, 0));

        let connection = pool.acquire(&Scope::Service).await.expect("reuse");
        connection.release_after_error(&RemoteError::new(RemoteErrorKind::Timeout, "slow"));
        let stats = pool.stats().expect("stats");
        assert_eq!((stats.idle, stats.in_use, stats.evicted_total), (0, 0, 1));
        assert_eq!(store.connects(), 1);
    }

    #[tokio::test]
    async fn connect_failures_surface_as_connection_errors() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 1);
        store.fail_next_connect(RemoteError::new(RemoteErrorKind::Connect, "refused"));

        let error = pool.acquire(&Scope::Service).await.expect_err("connect fails");
        assert!(matches!(error, DataError::Connection { ref scope, .. } if scope == "service"));

        // The permit was returned with the failed attempt.
        pool.acquire(&Scope::Service).await.expect("next acquire opens a handle");
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquires() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 1);
        drop(pool.acquire(&Scope::Service).await.expect("acquire"));

        pool.close();

        assert!(pool.is_closed());
        assert!(matches!(
            pool.acquire(&Scope::Service).await,
            Err(DataError::Connection { .. })
        ));
        assert_eq!(pool.stats().expect("stats").idle, 0);
    }

    #[tokio::test]
    async fn invalidate_scope_drops_idle_handles() {
        let store = ScriptedStore::new();
        let pool = pool(&store, 2);
        let scope = Scope::user("42", "jwt");
        let a = pool.acquire(&scope).await.expect("a");
        let b = pool.acquire(&scope).await.expect("b");
        drop(a);
        drop(b);

        assert_eq!(pool.invalidate_scope(&ScopeKey::User("42".into())).expect("invalidate"), 2);
        drop(pool.acquire(&scope).await.expect("reopen"));
        assert_eq!(store.connects(), 3);
    }
}
