//! Snapshot creation, validation and restore
//!
//! Snapshots are written with `VACUUM INTO`, which produces a consistent,
//! compacted copy while other connections keep reading. Every snapshot is
//! validated right after it is written. Restore swaps the live file with a
//! single rename.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;

use super::naming::{list_auto_backups, parse_snapshot_name, snapshot_file_name, SnapshotKind};
use super::retention::{CleanupReport, RetentionPolicy};
use super::space::{check_space, SpaceCheck};
use crate::db::retry::{retry_busy, RetryPolicy};
use crate::db::schema::read_schema_version;
use crate::db::Store;
use crate::error::{Error, Result};

/// What a backup file holds, derived by opening it.
#[derive(Debug, Clone, Serialize)]
pub struct BackupSnapshot {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub transaction_count: i64,
    pub created_at: DateTime<Local>,
    pub schema_version: i64,
}

impl Store {
    /// Create `<db dir>/backups` if needed and return it.
    pub fn ensure_backup_dir(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.backup_dir)?;
        Ok(self.backup_dir.clone())
    }

    fn snapshot_path(&self, kind: SnapshotKind) -> Result<PathBuf> {
        let dir = self.ensure_backup_dir()?;
        let name = snapshot_file_name(&self.options.backup.file_prefix, kind, Local::now());
        Ok(dir.join(name))
    }

    /// Write a validated snapshot of the live database to `destination`.
    ///
    /// Returns the number of transactions in the snapshot.
    pub fn create_backup(&self, destination: impl AsRef<Path>) -> Result<i64> {
        let _guard = self.lock_backups();
        self.write_snapshot(destination.as_ref())
    }

    /// Where the next auto-backup would be written.
    pub fn next_backup_path(&self) -> Result<PathBuf> {
        self.snapshot_path(SnapshotKind::Backup)
    }

    /// Snapshot into the backup directory under a timestamped name, then
    /// prune old auto-backups on a background thread.
    pub fn create_auto_backup(&self) -> Result<PathBuf> {
        let path = self.next_backup_path()?;
        self.create_backup(&path)?;
        tracing::info!(path = %path.display(), "Created automatic backup");

        let policy = RetentionPolicy::from_config(&self.options.backup);
        let dir = self.backup_dir.clone();
        let prefix = self.options.backup.file_prefix.clone();
        let spawned = std::thread::Builder::new()
            .name("backup-cleanup".to_string())
            .spawn(move || {
                if let Err(e) = policy.cleanup(&dir, &prefix) {
                    tracing::warn!("Backup cleanup failed: {}", e);
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not start backup cleanup: {}", e);
        }
        Ok(path)
    }

    /// Snapshot taken before migrating to `version`.
    pub fn create_pre_migration_backup(&self, version: i64) -> Result<PathBuf> {
        let path = self.snapshot_path(SnapshotKind::PreMigration(version))?;
        self.create_backup(&path)?;
        Ok(path)
    }

    /// Refuse a destination that resolves to the live database or one of its
    /// journal files.
    pub fn check_backup_destination(&self, destination: impl AsRef<Path>) -> Result<()> {
        let destination = destination.as_ref();
        let target = resolve_path(destination);
        let live = resolve_path(&self.path);
        let clashes = target == live
            || ["-wal", "-shm", "-journal"]
                .iter()
                .any(|suffix| target == sidecar_path(&live, suffix));
        if clashes {
            return Err(Error::InvalidInput(format!(
                "backup destination {} is the live database",
                destination.display()
            )));
        }
        Ok(())
    }

    /// Caller must hold the backup lock.
    fn write_snapshot(&self, destination: &Path) -> Result<i64> {
        if destination.as_os_str().is_empty() {
            return Err(Error::InvalidInput("backup destination is empty".to_string()));
        }
        let dest_str = destination.to_str().ok_or_else(|| {
            Error::InvalidInput(format!("backup destination is not UTF-8: {}", destination.display()))
        })?;
        let dir = match destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                parent.to_path_buf()
            }
            None => PathBuf::from("."),
        };
        self.check_backup_destination(destination)?;
        if destination.exists() {
            return Err(Error::DestinationExists(destination.to_path_buf()));
        }

        let required = live_size(&self.path)?;
        match check_space(self.options.space_probe.as_ref(), &dir, required) {
            SpaceCheck::Sufficient => {}
            SpaceCheck::Unknown => {
                tracing::debug!("Free space unknown, assuming {} bytes fit", required)
            }
            SpaceCheck::Insufficient { available } => {
                return Err(Error::InsufficientSpace {
                    required,
                    available,
                })
            }
        }

        let policy = RetryPolicy::backup(Duration::from_secs(self.options.backup.create_timeout_secs));
        let copied = {
            let conn = self.connection()?;
            retry_busy(&policy, || conn.execute("VACUUM INTO ?1", [dest_str]).map(|_| ()))
        };
        if let Err(e) = copied {
            remove_partial(destination);
            return Err(Error::Backup(e.to_string()));
        }
        if !destination.exists() {
            return Err(Error::Backup(format!(
                "{} was not written",
                destination.display()
            )));
        }
        // Snapshots are single files; keep them out of WAL mode.
        if let Err(e) = Connection::open(destination).and_then(|out| {
            out.pragma_update_and_check(None, "journal_mode", "DELETE", |r| r.get::<_, String>(0))
        }) {
            remove_partial(destination);
            return Err(Error::Backup(e.to_string()));
        }

        match self.validate_backup(destination) {
            Ok(count) => {
                tracing::info!(path = %destination.display(), transactions = count, "Backup written");
                Ok(count)
            }
            Err(e) => {
                remove_partial(destination);
                Err(Error::BackupVerification(e.to_string()))
            }
        }
    }

    /// Check that `path` is a restorable snapshot and return its transaction
    /// count.
    pub fn validate_backup(&self, path: impl AsRef<Path>) -> Result<i64> {
        Ok(self.inspect_backup(path)?.transaction_count)
    }

    /// Validate `path` and describe what it holds.
    pub fn inspect_backup(&self, path: impl AsRef<Path>) -> Result<BackupSnapshot> {
        let path = path.as_ref();
        let unreadable = |reason: String| Error::BackupUnreadable {
            path: path.to_path_buf(),
            reason,
        };

        let meta = fs::metadata(path).map_err(|e| unreadable(e.to_string()))?;
        if !meta.is_file() {
            return Err(unreadable("not a regular file".to_string()));
        }
        if meta.len() == 0 {
            return Err(Error::EmptyBackup(path.to_path_buf()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| unreadable(e.to_string()))?;
        conn.busy_timeout(self.options.busy_timeout)?;

        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|_| Error::CorruptBackup(path.to_path_buf()))?;
        if integrity != "ok" {
            tracing::warn!(path = %path.display(), result = %integrity, "Backup failed integrity check");
            return Err(Error::CorruptBackup(path.to_path_buf()));
        }

        let has_transactions: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'transactions')",
            [],
            |r| r.get(0),
        )?;
        if !has_transactions {
            return Err(Error::NotABackup(path.to_path_buf()));
        }

        let schema_version = read_schema_version(&conn)?;
        let current = self.current_schema_version()?;
        if schema_version != current {
            return Err(Error::SchemaMismatch {
                backup: schema_version,
                current,
            });
        }

        let transaction_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))
            .map_err(|e| unreadable(e.to_string()))?;

        Ok(BackupSnapshot {
            path: path.to_path_buf(),
            size_bytes: meta.len(),
            transaction_count,
            created_at: self.created_at(path, &meta),
            schema_version,
        })
    }

    fn created_at(&self, path: &Path, meta: &fs::Metadata) -> DateTime<Local> {
        let from_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| parse_snapshot_name(&self.options.backup.file_prefix, n))
            .and_then(|(_, ts)| Local.from_local_datetime(&ts).earliest());
        from_name
            .or_else(|| meta.modified().ok().map(DateTime::<Local>::from))
            .unwrap_or_else(Local::now)
    }

    /// Replace the live database with `backup_path`.
    pub fn restore_backup(&self, backup_path: impl AsRef<Path>) -> Result<()> {
        self.restore_backup_with_safety(backup_path).map(|_| ())
    }

    /// Replace the live database with `backup_path`, returning the path of the
    /// safety snapshot taken of the database it replaced.
    pub fn restore_backup_with_safety(&self, backup_path: impl AsRef<Path>) -> Result<PathBuf> {
        let backup_path = backup_path.as_ref();
        let _guard = self.lock_backups();

        let count = self.validate_backup(backup_path)?;
        if count == 0 {
            return Err(Error::NoTransactions(backup_path.to_path_buf()));
        }

        let safety = self.snapshot_path(SnapshotKind::PreRestore)?;
        self.write_snapshot(&safety)
            .map_err(|e| Error::Restore(format!("unable to create a safety backup: {e}")))?;
        tracing::info!(path = %safety.display(), "Created safety backup before restore");

        self.shutdown_pool();
        let temp = temp_path_for(&self.path);
        if let Err(e) = self.swap_in(backup_path, &temp) {
            let _ = fs::remove_file(&temp);
            self.reopen()?;
            return Err(e);
        }

        self.reopen()
            .map_err(|e| Error::Restore(format!("unable to reopen the restored database: {e}")))?;
        tracing::info!(
            from = %backup_path.display(),
            transactions = count,
            "Restored database from backup"
        );
        Ok(safety)
    }

    /// Copy `source` beside the live file and rename it into place. The pool
    /// must already be closed.
    fn swap_in(&self, source: &Path, temp: &Path) -> Result<()> {
        copy_synced(source, temp)
            .map_err(|e| Error::Restore(format!("unable to copy the backup file: {e}")))?;

        for suffix in ["-wal", "-shm"] {
            let sidecar = sidecar_path(&self.path, suffix);
            match fs::metadata(&sidecar) {
                Ok(meta) if suffix == "-wal" && meta.len() > 0 => {
                    return Err(Error::Restore(
                        "the database is still in use by another connection".to_string(),
                    ));
                }
                Ok(_) => {
                    if let Err(e) = fs::remove_file(&sidecar) {
                        tracing::warn!(path = %sidecar.display(), "Could not remove stale sidecar: {}", e);
                    }
                }
                Err(_) => {}
            }
        }

        fs::rename(temp, &self.path)
            .map_err(|e| Error::Restore(format!("unable to replace the database file: {e}")))?;
        sync_parent(&self.path);
        Ok(())
    }

    /// Modification time of the newest auto-backup, if any.
    pub fn last_backup_time(&self) -> Result<Option<DateTime<Local>>> {
        let dir = self.ensure_backup_dir()?;
        let newest = list_auto_backups(&dir, &self.options.backup.file_prefix)?
            .iter()
            .filter_map(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
            .max();
        Ok(newest.map(DateTime::<Local>::from))
    }

    /// True when no auto-backup exists or the newest is older than the
    /// configured interval.
    pub fn should_auto_backup(&self) -> Result<bool> {
        let interval = chrono::Duration::hours(i64::from(self.options.backup.auto_backup_interval_hours));
        Ok(match self.last_backup_time()? {
            None => true,
            Some(last) => Local::now().signed_duration_since(last) >= interval,
        })
    }

    /// Apply the retention policy to the backup directory.
    pub fn cleanup_old_backups(&self) -> Result<CleanupReport> {
        RetentionPolicy::from_config(&self.options.backup)
            .cleanup(&self.backup_dir, &self.options.backup.file_prefix)
    }
}

fn live_size(path: &Path) -> Result<u64> {
    let main = fs::metadata(path)?.len();
    let wal = fs::metadata(sidecar_path(path, "-wal"))
        .map(|m| m.len())
        .unwrap_or(0);
    Ok(main + wal)
}

/// Absolute form of `path`, following symlinks. Paths that do not exist yet
/// resolve through their parent directory.
fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(path) {
        return resolved;
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match (fs::canonicalize(parent), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cashmop.db".to_string());
    path.with_file_name(format!(".{}.restore-{}.tmp", name, uuid::Uuid::new_v4()))
}

fn copy_synced(source: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(source, dest)?;
    fs::File::open(dest)?.sync_all()
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = fs::File::open(parent).and_then(|d| d.sync_all()) {
            tracing::debug!("Directory sync failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial backup"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "Could not remove partial backup: {}", e),
    }
}
