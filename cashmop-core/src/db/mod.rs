//! Database layer for cashmop
//!
//! SQLite storage with:
//! - A pooled [`Store`] handle that owns the live file
//! - Versioned migrations tracked in a ledger table
//! - Retry-with-backoff for lock contention

pub mod migrate;
pub mod repo;
pub mod retry;
pub mod schema;
pub mod store;

pub use migrate::{Direction, MigrationFile, MigrationReport, MigrationRunner, MigrationSet, SchemaMigrationRecord};
pub use repo::NewTransaction;
pub use retry::{is_busy_error, retry_busy, RetryBudget, RetryPolicy};
pub use schema::{EmbeddedScript, MIGRATIONS, SCHEMA_VERSION};
pub use store::{PooledConnection, Store, StoreOptions};
