use std::sync::Arc;

use async_trait::async_trait;

use bizdesk_core::errors::{RemoteError, RemoteErrorKind};
use bizdesk_core::query::{Filter, Query, Row, WriteOp};
use bizdesk_core::scope::Scope;

pub mod memory;
pub mod rest;

pub use memory::InMemoryStore;
pub use rest::{RestSession, RestStore, RestStoreOptions};

/// Opens authenticated sessions against the backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn connect(&self, scope: &Scope) -> Result<Arc<dyn RemoteSession>, RemoteError>;
}

/// One authenticated session. Lent to a single operation at a time by the pool.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, RemoteError>;
    async fn write(&self, op: &WriteOp) -> Result<Vec<Row>, RemoteError>;
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Update and delete must name the rows they touch; an empty filter list would
/// hit the whole table.
pub(crate) fn require_filters(op: &WriteOp, filters: &[Filter]) -> Result<(), RemoteError> {
    if filters.is_empty() {
        return Err(RemoteError::new(
            RemoteErrorKind::Validation,
            format!("refusing unfiltered {} on `{}`", op.kind(), op.table()),
        ));
    }
    Ok(())
}
