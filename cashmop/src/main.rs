//! cashmop - command-line access to the cashmop database lifecycle
//!
//! Creates, validates and restores backups, prunes old ones, and inspects or
//! rolls back schema migrations. Output is always a single JSON document.
//!
//! File locations:
//! - Database: `<config dir>/cashmop/cashmop.db` unless `--db`, `storage.path`
//!   or `APP_ENV` says otherwise
//! - Backups: `backups/` beside the database
//! - Logs: `$XDG_STATE_HOME/cashmop/cashmop.log`
//! - Config: `$XDG_CONFIG_HOME/cashmop/config.toml`

mod backup;
mod migrate;
mod process_lock;
mod response;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use cashmop_core::{Config, Store};
use clap::{Parser, Subcommand};
use response::{print_error, CliError};

#[derive(Parser)]
#[command(name = "cashmop")]
#[command(about = "Manage cashmop database backups and migrations")]
#[command(version)]
struct Cli {
    /// Database file to operate on (overrides config and APP_ENV)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create, inspect, validate and restore backups
    #[command(subcommand)]
    Backup(backup::BackupCommand),

    /// Inspect or roll back schema migrations
    #[command(subcommand)]
    Migrate(migrate::MigrateCommand),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            print_error(&err);
            ExitCode::from(err.code)
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(db) = cli.db {
        config.storage.path = Some(db);
    }

    let _log_guard =
        cashmop_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = config.database_path();
    tracing::info!(path = %db_path.display(), "cashmop starting");

    let ctx = AppContext { config, db_path };
    let result = match cli.command {
        Command::Backup(cmd) => backup::run(&ctx, cmd),
        Command::Migrate(cmd) => migrate::run(&ctx, cmd),
    };
    if let Err(err) = &result {
        tracing::error!(code = err.code, errors = ?err.errors, "Command failed");
    }
    result
}

/// What every command needs to reach the store.
pub struct AppContext {
    pub config: Config,
    pub db_path: PathBuf,
}

impl AppContext {
    /// Open the store, applying any pending migrations.
    pub fn open_store(&self) -> Result<Store, CliError> {
        Store::open_from_config(&self.config).map_err(|e| {
            let mut err = CliError::from(e);
            for detail in &mut err.errors {
                detail.message = format!("unable to open database: {}", detail.message);
            }
            err
        })
    }
}
