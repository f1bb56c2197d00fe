//! The live database handle
//!
//! [`Store`] owns a bounded connection pool over one SQLite file and the
//! lifecycle around it: migrations on open, backups, restore and retention.
//! Backup and restore entry points live in [`crate::backup`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;

use super::migrate::{MigrationReport, MigrationRunner, MigrationSet, SchemaMigrationRecord};
use super::schema::{read_schema_version, EmbeddedScript, MIGRATIONS};
use crate::backup::space::{FsSpaceProbe, SpaceProbe};
use crate::config::{AppEnv, BackupConfig, Config};
use crate::error::{Error, Result};

type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

/// A connection checked out of the store's pool.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Everything [`Store::open_with`] needs besides the path.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum open connections
    pub pool_size: u32,
    /// Per-connection busy timeout
    pub busy_timeout: Duration,
    /// Skip pre-migration backups (set when `APP_ENV=test`)
    pub test_mode: bool,
    /// Naming, retention and timeout settings for snapshots
    pub backup: BackupConfig,
    /// Migration assets to apply on open
    pub migrations: &'static [EmbeddedScript],
    /// Free-space source for backup pre-checks
    pub space_probe: Arc<dyn SpaceProbe>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            busy_timeout: Duration::from_millis(5000),
            test_mode: AppEnv::current() == AppEnv::Test,
            backup: BackupConfig::default(),
            migrations: MIGRATIONS,
            space_probe: Arc::new(FsSpaceProbe),
        }
    }
}

impl StoreOptions {
    /// Options taken from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool_size: config.storage.pool_size,
            busy_timeout: Duration::from_millis(config.storage.busy_timeout_ms),
            backup: config.backup.clone(),
            ..Self::default()
        }
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn with_backup_config(mut self, backup: BackupConfig) -> Self {
        self.backup = backup;
        self
    }

    pub fn with_migrations(mut self, migrations: &'static [EmbeddedScript]) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = probe;
        self
    }
}

/// Handle to the live database file.
///
/// Cheap operations check a connection out of the pool. Backup creation and
/// restore are serialized through an internal lock; restore also swaps the
/// pool out while the file underneath is replaced.
#[derive(Debug)]
pub struct Store {
    pub(crate) path: PathBuf,
    pub(crate) backup_dir: PathBuf,
    pub(crate) options: StoreOptions,
    migrations: MigrationSet,
    pool: RwLock<Option<SqlitePool>>,
    backup_lock: Mutex<()>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open the database the configuration points at.
    pub fn open_from_config(config: &Config) -> Result<Self> {
        Self::open_with(config.database_path(), StoreOptions::from_config(config))
    }

    /// Open with explicit options.
    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("database path is empty".to_string()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let backup_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("backups");
        let pool = build_pool(path, &options)?;
        let store = Self {
            path: path.to_path_buf(),
            backup_dir,
            migrations: MigrationSet::discover(options.migrations),
            options,
            pool: RwLock::new(Some(pool)),
            backup_lock: Mutex::new(()),
        };

        tracing::info!(path = %store.path.display(), "Opened database");
        store.migrate()?;
        Ok(store)
    }

    /// Path of the live database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding snapshots, `<db dir>/backups`.
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Check a connection out of the pool.
    pub fn connection(&self) -> Result<PooledConnection> {
        let pool = self
            .pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::Closed)?;
        Ok(pool.get()?)
    }

    /// Release the pool. Later operations fail with [`Error::Closed`].
    pub fn close(&self) {
        self.shutdown_pool();
        tracing::info!(path = %self.path.display(), "Closed database");
    }

    pub fn is_open(&self) -> bool {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Apply pending migrations, taking a pre-migration backup first when the
    /// database already holds a schema and the store is not in test mode.
    pub fn migrate(&self) -> Result<MigrationReport> {
        let runner = MigrationRunner::new(&self.migrations);
        let (pending, current) = {
            let conn = self.connection()?;
            (runner.pending_versions(&conn)?, read_schema_version(&conn)?)
        };

        let mut backup = match pending.first() {
            Some(&first) if !self.options.test_mode && current > 0 => {
                self.pre_migration_backup(first)
            }
            _ => None,
        };

        let mut conn = self.connection()?;
        runner.migrate(&mut conn, |_| backup.take())
    }

    fn pre_migration_backup(&self, version: i64) -> Option<PathBuf> {
        match self.create_pre_migration_backup(version) {
            Ok(path) => {
                tracing::info!(path = %path.display(), version, "Created pre-migration backup");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(version, "Pre-migration backup failed, migrating anyway: {}", e);
                None
            }
        }
    }

    /// Undo the newest applied migration. Returns the version undone.
    pub fn rollback(&self) -> Result<i64> {
        let mut conn = self.connection()?;
        MigrationRunner::new(&self.migrations).rollback(&mut conn)
    }

    /// Highest applied migration version, 0 for an empty database.
    pub fn current_schema_version(&self) -> Result<i64> {
        let conn = self.connection()?;
        Ok(read_schema_version(&conn)?)
    }

    /// Highest version the store's migration set knows about.
    pub fn latest_schema_version(&self) -> i64 {
        self.migrations.latest_version()
    }

    /// Ledger rows, ascending by version.
    pub fn applied_migrations(&self) -> Result<Vec<SchemaMigrationRecord>> {
        let conn = self.connection()?;
        MigrationRunner::ensure_ledger(&conn)?;
        MigrationRunner::records(&conn)
    }

    /// Versions a call to [`migrate`](Self::migrate) would apply.
    pub fn pending_migrations(&self) -> Result<Vec<i64>> {
        let conn = self.connection()?;
        MigrationRunner::new(&self.migrations).pending_versions(&conn)
    }

    pub(crate) fn lock_backups(&self) -> MutexGuard<'_, ()> {
        self.backup_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Checkpoint the WAL into the main file and drop every pooled connection.
    pub(crate) fn shutdown_pool(&self) {
        let mut guard = self.pool.write().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = guard.take() {
            match pool.get() {
                Ok(conn) => {
                    if let Err(e) =
                        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                    {
                        tracing::warn!("WAL checkpoint before close failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!("No connection available for checkpoint: {}", e),
            }
        }
    }

    /// Build a fresh pool over the current file.
    pub(crate) fn reopen(&self) -> Result<()> {
        let pool = build_pool(&self.path, &self.options)?;
        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Some(pool);
        tracing::debug!(path = %self.path.display(), "Reopened database");
        Ok(())
    }
}

fn build_pool(path: &Path, options: &StoreOptions) -> Result<SqlitePool> {
    let busy_timeout = options.busy_timeout;
    let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA synchronous = NORMAL;
            ",
        )
    });

    let pool = r2d2::Pool::builder()
        .max_size(options.pool_size.max(1))
        .min_idle(Some(1))
        .connection_timeout(Duration::from_secs(30))
        .build(manager)?;
    Ok(pool)
}
