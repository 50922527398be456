//! Tool layer for the business agents.
//!
//! Agents never talk to the backend directly: every record they read or write
//! goes through a [`tools::Tool`] backed by the shared
//! [`bizdesk_db::manager::ClientManager`], so caching, pooling and retry apply
//! uniformly. [`table_tools`] generates the standard CRUD tools per table.

pub mod table_tools;
pub mod tools;

pub use table_tools::{business_tables, TableTool, TableToolConfig, TableToolKind, TableToolset};
pub use tools::{Tool, ToolRegistry};
