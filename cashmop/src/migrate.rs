//! `cashmop migrate ...`

use cashmop_core::SchemaMigrationRecord;
use clap::Subcommand;
use serde::Serialize;

use crate::process_lock::acquire_maintenance_guard;
use crate::response::{print_success, CliError};
use crate::AppContext;

#[derive(Subcommand)]
pub enum MigrateCommand {
    /// Show applied and pending schema versions
    Status,
    /// Roll back the most recent migration
    ///
    /// The rolled-back version is applied again the next time the database
    /// is opened normally.
    Down,
}

#[derive(Serialize)]
struct StatusResponse {
    current_version: i64,
    latest_version: i64,
    applied: Vec<SchemaMigrationRecord>,
    pending: Vec<i64>,
}

#[derive(Serialize)]
struct DownResponse {
    rolled_back: i64,
    current_version: i64,
}

pub fn run(ctx: &AppContext, cmd: MigrateCommand) -> Result<(), CliError> {
    match cmd {
        MigrateCommand::Status => status(ctx),
        MigrateCommand::Down => down(ctx),
    }
}

fn status(ctx: &AppContext) -> Result<(), CliError> {
    let store = ctx.open_store()?;

    print_success(StatusResponse {
        current_version: store.current_schema_version()?,
        latest_version: store.latest_schema_version(),
        applied: store.applied_migrations()?,
        pending: store.pending_migrations()?,
    })
}

fn down(ctx: &AppContext) -> Result<(), CliError> {
    let _guard = acquire_maintenance_guard(&ctx.db_path)?;
    let store = ctx.open_store()?;

    let rolled_back = store.rollback()?;
    tracing::info!(version = rolled_back, "Rolled back migration");

    print_success(DownResponse {
        rolled_back,
        current_version: store.current_schema_version()?,
    })
}
