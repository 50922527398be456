//! Scoped read cache.
//!
//! ## Keys
//!
//! Entries are keyed by `(scope, table, canonical query signature)`, so two
//! users issuing the same query never share a result.
//!
//! ## Expiry & eviction
//!
//! Every entry carries its own TTL. `get` treats an entry older than its TTL
//! as absent and drops it. When an insert finds the cache full, expired
//! entries go first; only if none are expired is the least recently used
//! entry evicted. LRU order lives in an `IndexMap`: hits move an entry to the
//! back, eviction pops the front.
//!
//! ## Generations
//!
//! `invalidate` bumps a per-(scope, table) generation. A read samples the
//! generation before it goes to the backend and stores its result with
//! [`QueryCache::put_if_current`], which refuses the store if an invalidation
//! happened in between. This keeps a slow read that started before a write
//! from re-populating the cache with pre-write rows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use bizdesk_core::config::{AppConfig, CacheConfig};
use bizdesk_core::errors::DataError;
use bizdesk_core::query::{Query, Row};
use bizdesk_core::scope::ScopeKey;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: ScopeKey,
    pub table: String,
    pub signature: String,
}

impl CacheKey {
    pub fn for_query(scope: &ScopeKey, query: &Query) -> Self {
        Self {
            scope: scope.clone(),
            table: query.table.clone(),
            signature: query.canonical_signature(),
        }
    }
}

/// Maps tables to how long their reads stay fresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtlPolicy {
    default_ttl: Duration,
    per_table: HashMap<String, Duration>,
}

impl TtlPolicy {
    pub fn new(default_ttl: Duration) -> Self {
        Self { default_ttl, per_table: HashMap::new() }
    }

    pub fn with_table(mut self, table: impl Into<String>, ttl: Duration) -> Self {
        self.per_table.insert(table.into(), ttl);
        self
    }

    pub fn ttl_for(&self, table: &str) -> Duration {
        self.per_table.get(table).copied().unwrap_or(self.default_ttl)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default().cache)
    }
}

impl From<&CacheConfig> for TtlPolicy {
    fn from(config: &CacheConfig) -> Self {
        config.table_ttls.iter().fold(
            Self::new(Duration::from_secs(config.default_ttl_secs)),
            |policy, (table, secs)| policy.with_table(table.clone(), Duration::from_secs(*secs)),
        )
    }
}

struct CacheEntry {
    rows: Arc<Vec<Row>>,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) <= self.ttl
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub stale_stores_rejected: u64,
    pub expired_evictions: u64,
    pub lru_evictions: u64,
    pub invalidation_passes: u64,
    pub invalidated_entries: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: IndexMap<CacheKey, CacheEntry>,
    generations: HashMap<(ScopeKey, String), u64>,
    /// Last generation handed out.
    clock: u64,
    /// Generation reported for (scope, table) pairs with no record. Raised
    /// when records are pruned so an in-flight read can never match again.
    floor: u64,
    stats: CacheStats,
}

impl CacheState {
    fn generation(&self, scope: &ScopeKey, table: &str) -> u64 {
        self.generations.get(&(scope.clone(), table.to_string())).copied().unwrap_or(self.floor)
    }

    fn bump(&mut self, scope: &ScopeKey, table: &str) {
        self.clock += 1;
        self.generations.insert((scope.clone(), table.to_string()), self.clock);
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        let removed = before - self.entries.len();
        self.stats.expired_evictions += removed as u64;
        removed
    }

    fn remove_where(&mut self, predicate: impl Fn(&CacheKey) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        before - self.entries.len()
    }

    fn record_invalidation(&mut self, removed: usize) {
        self.stats.invalidation_passes += 1;
        self.stats.invalidated_entries += removed as u64;
    }
}

pub struct QueryCache {
    max_entries: usize,
    state: Mutex<CacheState>,
}

impl QueryCache {
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries: max_entries.max(1), state: Mutex::new(CacheState::default()) }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Fresh rows for `key`, refreshing its recency. Expired entries are
    /// dropped and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Arc<Vec<Row>>>, DataError> {
        let mut state = self.lock()?;
        let now = Instant::now();

        let Some(index) = state.entries.get_index_of(key) else {
            state.stats.misses += 1;
            return Ok(None);
        };
        let fresh = state.entries.get_index(index).is_some_and(|(_, entry)| entry.is_fresh(now));
        if !fresh {
            state.entries.shift_remove_index(index);
            state.stats.expired_evictions += 1;
            state.stats.misses += 1;
            return Ok(None);
        }

        let last = state.entries.len() - 1;
        state.entries.move_index(index, last);
        state.stats.hits += 1;
        Ok(state.entries.get_index(last).map(|(_, entry)| entry.rows.clone()))
    }

    pub fn put(
        &self,
        key: CacheKey,
        rows: Arc<Vec<Row>>,
        ttl: Duration,
    ) -> Result<(), DataError> {
        let mut state = self.lock()?;
        self.insert(&mut state, key, rows, ttl);
        Ok(())
    }

    /// Stores `rows` only if `(key.scope, key.table)` has not been invalidated
    /// since `generation` was sampled. Returns whether the rows were stored.
    pub fn put_if_current(
        &self,
        key: CacheKey,
        rows: Arc<Vec<Row>>,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, DataError> {
        let mut state = self.lock()?;
        if state.generation(&key.scope, &key.table) != generation {
            state.stats.stale_stores_rejected += 1;
            debug!(
                event_name = "db.cache.stale_store_rejected",
                scope = %key.scope,
                table = %key.table,
                "read raced with an invalidation; result not cached"
            );
            return Ok(false);
        }
        self.insert(&mut state, key, rows, ttl);
        Ok(true)
    }

    pub fn generation(&self, scope: &ScopeKey, table: &str) -> Result<u64, DataError> {
        Ok(self.lock()?.generation(scope, table))
    }

    /// Drops every entry for `table` under `scope`.
    pub fn invalidate(&self, scope: &ScopeKey, table: &str) -> Result<usize, DataError> {
        let mut state = self.lock()?;
        state.bump(scope, table);
        let removed = state.remove_where(|key| key.scope == *scope && key.table == table);
        state.record_invalidation(removed);
        Ok(removed)
    }

    /// Drops every entry for `table` in every scope.
    pub fn invalidate_table(&self, table: &str) -> Result<usize, DataError> {
        let mut state = self.lock()?;
        let mut scopes: Vec<ScopeKey> = state
            .generations
            .keys()
            .filter(|(_, known)| known == table)
            .map(|(scope, _)| scope.clone())
            .chain(state.entries.keys().filter(|key| key.table == table).map(|key| key.scope.clone()))
            .collect();
        scopes.sort();
        scopes.dedup();
        for scope in &scopes {
            state.bump(scope, table);
        }
        // Scopes with no record yet read `floor`; raising it covers them.
        state.floor = state.clock + 1;
        state.clock = state.floor;

        let removed = state.remove_where(|key| key.table == table);
        state.record_invalidation(removed);
        Ok(removed)
    }

    /// One invalidation pass for a write to `table` made under `scope`.
    ///
    /// A service-scope write can change rows visible to every user, so the
    /// table is dropped everywhere. A user-scope write drops that user's
    /// entries and the service scope's, which also sees the user's rows.
    pub fn invalidate_after_write(&self, scope: &ScopeKey, table: &str) -> Result<usize, DataError> {
        if *scope == ScopeKey::Service {
            return self.invalidate_table(table);
        }
        let mut state = self.lock()?;
        state.bump(scope, table);
        state.bump(&ScopeKey::Service, table);
        let removed = state.remove_where(|key| {
            key.table == table && (key.scope == *scope || key.scope == ScopeKey::Service)
        });
        state.record_invalidation(removed);
        Ok(removed)
    }

    /// Drops every entry belonging to `scope`.
    pub fn invalidate_scope(&self, scope: &ScopeKey) -> Result<usize, DataError> {
        let mut state = self.lock()?;
        let tables: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.scope == *scope)
            .map(|key| key.table.clone())
            .collect();
        for table in tables {
            state.bump(scope, &table);
        }
        let removed = state.remove_where(|key| key.scope == *scope);
        state.record_invalidation(removed);
        Ok(removed)
    }

    pub fn invalidate_key(&self, key: &CacheKey) -> Result<bool, DataError> {
        let mut state = self.lock()?;
        Ok(state.entries.shift_remove(key).is_some())
    }

    /// Removes expired entries. Also prunes generation records once they
    /// outnumber the entry capacity.
    pub fn purge_expired(&self) -> Result<usize, DataError> {
        let mut state = self.lock()?;
        let removed = state.purge_expired(Instant::now());
        if state.generations.len() > self.max_entries {
            state.generations.clear();
            state.floor = state.clock + 1;
            state.clock = state.floor;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), DataError> {
        let mut state = self.lock()?;
        state.entries.clear();
        state.floor = state.clock + 1;
        state.clock = state.floor;
        state.generations.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize, DataError> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, DataError> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<CacheStats, DataError> {
        let state = self.lock()?;
        Ok(CacheStats { entries: state.entries.len(), ..state.stats.clone() })
    }

    fn insert(
        &self,
        state: &mut CacheState,
        key: CacheKey,
        rows: Arc<Vec<Row>>,
        ttl: Duration,
    ) {
        let now = Instant::now();
        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_entries {
            state.purge_expired(now);
            while state.entries.len() >= self.max_entries {
                if state.entries.shift_remove_index(0).is_none() {
                    break;
                }
                state.stats.lru_evictions += 1;
            }
        }
        // Re-inserting moves the key to the back.
        state.entries.shift_remove(&key);
        state.entries.insert(key, CacheEntry { rows, stored_at: now, ttl });
        state.stats.stores += 1;
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, DataError> {
        self.state.lock().map_err(|_| DataError::Internal("query cache lock poisoned".to_string()))
    }
}
