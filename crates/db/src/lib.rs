pub mod batch;
pub mod cache;
pub mod manager;
pub mod pool;
pub mod remote;
pub mod retry;

#[cfg(test)]
mod testing;

pub use remote::{memory, rest};

pub use batch::{
    Batch, BatchExecutor, BatchItem, BatchOperation, BatchResult, BatchStatus, ItemOutcome,
};
pub use cache::{CacheKey, CacheStats, QueryCache, TtlPolicy};
pub use manager::{ClientManager, ManagerSettings, ManagerStats};
pub use pool::{ConnectionPool, PoolSettings, PoolStats, PooledConnection};
pub use remote::{InMemoryStore, RemoteSession, RemoteStore, RestStore, RestStoreOptions};
pub use retry::{BackoffExecutor, RetryFailure, RetryPolicy};
