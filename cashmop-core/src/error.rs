//! Error types for cashmop-core

use std::path::PathBuf;

use thiserror::Error;

/// Broad classification used by callers to decide how to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input was wrong: bad path, empty or corrupt file, version mismatch.
    Validation,
    /// Something failed while doing the work: I/O, engine, disk space.
    Runtime,
}

/// Main error type for the cashmop-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool error
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller passed something unusable
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The store was closed (or is mid-restore) and has no live connection
    #[error("database not ready, please restart the application")]
    Closed,

    /// Backup file cannot be read at all
    #[error("cannot access the backup file {path}: {reason}")]
    BackupUnreadable { path: PathBuf, reason: String },

    /// Backup file has zero bytes
    #[error("the backup file is empty: {0}")]
    EmptyBackup(PathBuf),

    /// Backup file failed `PRAGMA integrity_check` or is not SQLite at all
    #[error("the backup file appears to be corrupted: {0}")]
    CorruptBackup(PathBuf),

    /// Backup is a SQLite file but not a cashmop database
    #[error("this is not a valid cashmop backup file: {0}")]
    NotABackup(PathBuf),

    /// Backup was written under a different migration generation
    #[error(
        "this backup was created with a different version of the app \
         (backup schema v{backup}, current schema v{current}) and cannot be restored"
    )]
    SchemaMismatch { backup: i64, current: i64 },

    /// Backup validated but holds nothing worth restoring
    #[error("the backup file contains no transactions: {0}")]
    NoTransactions(PathBuf),

    /// Refusing to overwrite an existing snapshot
    #[error("backup destination already exists: {0}")]
    DestinationExists(PathBuf),

    /// Free-space check said no
    #[error("not enough disk space to create a backup (need {required} bytes, {available} available)")]
    InsufficientSpace { required: u64, available: u64 },

    /// Backup was written but did not pass its own validation
    #[error("backup verification failed: {0}")]
    BackupVerification(String),

    /// Backup creation failed for a reason other than verification
    #[error("unable to create the backup file: {0}")]
    Backup(String),

    /// Restore failed; the message says which step
    #[error("restore failed: {0}")]
    Restore(String),

    /// A migration script failed; the ledger was left unchanged
    #[error("migration {version} failed{}: {source}", backup_note(.backup))]
    Migration {
        version: i64,
        backup: Option<PathBuf>,
        #[source]
        source: rusqlite::Error,
    },

    /// Rollback requested with nothing to undo
    #[error("no migrations have been applied")]
    NothingToRollback,

    /// Head version has no down-script
    #[error("migration {0} has no down migration")]
    MissingDownMigration(i64),
}

fn backup_note(backup: &Option<PathBuf>) -> String {
    match backup {
        Some(path) => format!(" (backup at {})", path.display()),
        None => String::new(),
    }
}

impl Error {
    /// Classify the error for callers that report validation and runtime
    /// failures differently.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::InvalidInput(_)
            | Error::BackupUnreadable { .. }
            | Error::EmptyBackup(_)
            | Error::CorruptBackup(_)
            | Error::NotABackup(_)
            | Error::SchemaMismatch { .. }
            | Error::NoTransactions(_)
            | Error::DestinationExists(_)
            | Error::NothingToRollback
            | Error::MissingDownMigration(_) => ErrorKind::Validation,
            _ => ErrorKind::Runtime,
        }
    }

    /// A short remediation hint for user-facing output, when one exists.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::CorruptBackup(_) => Some("choose a different backup file; this one cannot be repaired"),
            Error::NotABackup(_) => Some("select a .db file created by cashmop's backup feature"),
            Error::SchemaMismatch { .. } => {
                Some("restore a backup made by this version of the app, or update the app first")
            }
            Error::EmptyBackup(_) | Error::NoTransactions(_) => Some("choose a backup that contains data"),
            Error::InsufficientSpace { .. } => Some("free up disk space and try again"),
            Error::Migration { backup: Some(_), .. } => {
                Some("the failed migration was not applied; restore the pre-migration backup to return to the earlier schema")
            }
            Error::Closed => Some("restart the application"),
            _ => None,
        }
    }
}

/// Result type alias for cashmop-core
pub type Result<T> = std::result::Result<T, Error>;
