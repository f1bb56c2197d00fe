//! # cashmop-core
//!
//! Storage lifecycle for cashmop, a personal finance tracker.
//!
//! This library provides:
//! - A pooled SQLite [`Store`] that migrates itself on open
//! - Versioned migrations with single-step rollback
//! - Validated snapshots, atomic restore and retention of old backups
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Lifecycle
//!
//! `Store::open` resolves the file, builds the pool and applies pending
//! migrations, taking a pre-migration snapshot when an existing schema is
//! about to change. Backups go to `backups/` beside the live file. Restore
//! takes a safety snapshot of the live database, then swaps the file with a
//! single rename.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cashmop_core::{Config, Store};
//!
//! let config = Config::load().expect("failed to load config");
//! let store = Store::open_from_config(&config).expect("failed to open database");
//!
//! if store.should_auto_backup().expect("failed to read backup dir") {
//!     let path = store.create_auto_backup().expect("backup failed");
//!     println!("backed up to {}", path.display());
//! }
//! ```

// Re-export commonly used items at the crate root
pub use backup::{BackupSnapshot, CleanupReport, RetentionPolicy, SpaceCheck, SpaceProbe};
pub use config::{Config, TimestampSource};
pub use db::{MigrationReport, NewTransaction, SchemaMigrationRecord, Store, StoreOptions, SCHEMA_VERSION};
pub use error::{Error, ErrorKind, Result};

// Public modules
pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
