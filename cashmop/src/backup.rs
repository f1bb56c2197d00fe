//! `cashmop backup ...`

use std::path::PathBuf;

use chrono::{DateTime, Local};
use clap::Subcommand;
use serde::Serialize;

use crate::process_lock::acquire_maintenance_guard;
use crate::response::{print_success, CliError};
use crate::AppContext;

#[derive(Subcommand)]
pub enum BackupCommand {
    /// Write a validated snapshot of the database
    Create {
        /// Destination file; defaults to a timestamped file in the backup
        /// directory, after which old backups are pruned
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Show when the last automatic backup ran
    Info,
    /// Check that a file can be restored
    Validate {
        #[arg(long, value_name = "PATH")]
        file: PathBuf,
    },
    /// Replace the database with a backup, keeping a safety copy
    Restore {
        #[arg(long, value_name = "PATH")]
        file: PathBuf,
    },
    /// Delete old automatic backups according to the retention policy
    Cleanup,
}

#[derive(Serialize)]
struct CreateResponse {
    path: PathBuf,
    transaction_count: i64,
    deleted: Vec<PathBuf>,
}

#[derive(Serialize)]
struct InfoResponse {
    backup_dir: PathBuf,
    last_backup_time: Option<String>,
    has_backup: bool,
    should_auto_backup: bool,
}

#[derive(Serialize)]
struct ValidateResponse {
    path: PathBuf,
    size: u64,
    transaction_count: i64,
    created_at: DateTime<Local>,
    schema_version: i64,
}

#[derive(Serialize)]
struct RestoreResponse {
    restored_from: PathBuf,
    safety_backup_path: PathBuf,
    transaction_count: i64,
}

#[derive(Serialize)]
struct CleanupResponse {
    kept: usize,
    deleted: Vec<PathBuf>,
    failed: Vec<PathBuf>,
}

pub fn run(ctx: &AppContext, cmd: BackupCommand) -> Result<(), CliError> {
    match cmd {
        BackupCommand::Create { out } => create(ctx, out),
        BackupCommand::Info => info(ctx),
        BackupCommand::Validate { file } => validate(ctx, file),
        BackupCommand::Restore { file } => restore(ctx, file),
        BackupCommand::Cleanup => cleanup(ctx),
    }
}

fn create(ctx: &AppContext, out: Option<PathBuf>) -> Result<(), CliError> {
    let _guard = acquire_maintenance_guard(&ctx.db_path)?;
    let store = ctx.open_store()?;

    let auto = out.is_none();
    let path = match out {
        Some(path) => {
            // Explicit destinations are overwritten, never the live file
            store.check_backup_destination(&path)?;
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    CliError::runtime(format!("failed to remove existing file {}: {e}", path.display()))
                })?;
            }
            path
        }
        None => store.next_backup_path()?,
    };

    let transaction_count = store.create_backup(&path)?;
    let deleted = if auto {
        store.cleanup_old_backups()?.deleted
    } else {
        Vec::new()
    };

    print_success(CreateResponse {
        path,
        transaction_count,
        deleted,
    })
}

fn info(ctx: &AppContext) -> Result<(), CliError> {
    let store = ctx.open_store()?;
    let last = store.last_backup_time()?;

    print_success(InfoResponse {
        backup_dir: store.backup_dir().to_path_buf(),
        last_backup_time: last.map(|t| t.to_rfc3339()),
        has_backup: last.is_some(),
        should_auto_backup: store.should_auto_backup()?,
    })
}

fn validate(ctx: &AppContext, file: PathBuf) -> Result<(), CliError> {
    let store = ctx.open_store()?;
    let snapshot = store.inspect_backup(&file)?;

    print_success(ValidateResponse {
        path: snapshot.path,
        size: snapshot.size_bytes,
        transaction_count: snapshot.transaction_count,
        created_at: snapshot.created_at,
        schema_version: snapshot.schema_version,
    })
}

fn restore(ctx: &AppContext, file: PathBuf) -> Result<(), CliError> {
    let _guard = acquire_maintenance_guard(&ctx.db_path)?;
    let store = ctx.open_store()?;

    let safety_backup_path = store.restore_backup_with_safety(&file)?;
    let transaction_count = store.transaction_count()?;

    print_success(RestoreResponse {
        restored_from: file,
        safety_backup_path,
        transaction_count,
    })
}

fn cleanup(ctx: &AppContext) -> Result<(), CliError> {
    let _guard = acquire_maintenance_guard(&ctx.db_path)?;
    let store = ctx.open_store()?;
    let report = store.cleanup_old_backups()?;

    print_success(CleanupResponse {
        kept: report.kept.len(),
        deleted: report.deleted,
        failed: report.failed.into_iter().map(|(path, _)| path).collect(),
    })
}
