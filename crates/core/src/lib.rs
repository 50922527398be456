pub mod config;
pub mod errors;
pub mod query;
pub mod scope;

pub use config::{AppConfig, ConfigError, LoadOptions};
pub use errors::{DataError, ErrorClass, InterfaceError, RemoteError, RemoteErrorKind};
pub use query::{DeleteMode, Filter, FilterOp, OrderBy, Query, Row, SortDirection, WriteOp};
pub use scope::{Scope, ScopeKey};
