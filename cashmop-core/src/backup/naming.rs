//! Snapshot file names
//!
//! Every snapshot is `<prefix>_<kind>_<timestamp>.db` where the timestamp is
//! local time as `YYYYMMDD_HHMMSS_mmm`. Older builds wrote `YYYYMMDD_HHMMSS`
//! without milliseconds; both forms parse.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{Error, Result};

/// What a snapshot was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Scheduled or manual backup; the only kind retention prunes
    Backup,
    /// Safety copy of the live database taken right before a restore
    PreRestore,
    /// Copy taken before migrating to the given version
    PreMigration(i64),
}

/// Format a timestamp the way snapshot names carry it.
pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// File name for a snapshot of `kind` taken at `at`.
pub fn snapshot_file_name(prefix: &str, kind: SnapshotKind, at: DateTime<Local>) -> String {
    let ts = format_timestamp(at);
    match kind {
        SnapshotKind::Backup => format!("{prefix}_backup_{ts}.db"),
        SnapshotKind::PreRestore => format!("{prefix}_pre_restore_{ts}.db"),
        SnapshotKind::PreMigration(version) => {
            format!("{prefix}_pre_migration_v{version:03}_{ts}.db")
        }
    }
}

/// Recover kind and timestamp from a snapshot file name.
pub fn parse_snapshot_name(prefix: &str, file_name: &str) -> Option<(SnapshotKind, NaiveDateTime)> {
    let rest = file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(".db")?;

    if let Some(ts) = rest.strip_prefix("backup_") {
        return Some((SnapshotKind::Backup, parse_timestamp(ts)?));
    }
    if let Some(ts) = rest.strip_prefix("pre_restore_") {
        return Some((SnapshotKind::PreRestore, parse_timestamp(ts)?));
    }
    let rest = rest.strip_prefix("pre_migration_v")?;
    let (version, ts) = rest.split_once('_')?;
    Some((SnapshotKind::PreMigration(version.parse().ok()?), parse_timestamp(ts)?))
}

/// True for names retention is allowed to prune.
pub fn is_auto_backup_name(prefix: &str, file_name: &str) -> bool {
    file_name.starts_with(&format!("{prefix}_backup_")) && file_name.ends_with(".db")
}

/// Parse `YYYYMMDD_HHMMSS[_mmm]`.
pub fn parse_timestamp(ts: &str) -> Option<NaiveDateTime> {
    let parts: Vec<&str> = ts.split('_').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }

    let date_part = parts[0];
    let time_part = parts[1];
    if date_part.len() != 8 || time_part.len() != 6 {
        return None;
    }
    let millis: u32 = match parts.get(2) {
        Some(ms) if ms.len() == 3 => ms.parse().ok()?,
        Some(_) => return None,
        None => 0,
    };

    let year: i32 = date_part.get(0..4)?.parse().ok()?;
    let month: u32 = date_part.get(4..6)?.parse().ok()?;
    let day: u32 = date_part.get(6..8)?.parse().ok()?;
    let hour: u32 = time_part.get(0..2)?.parse().ok()?;
    let minute: u32 = time_part.get(2..4)?.parse().ok()?;
    let second: u32 = time_part.get(4..6)?.parse().ok()?;

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = NaiveTime::from_hms_milli_opt(hour, minute, second, millis)?;
    Some(NaiveDateTime::new(date, time))
}

/// Every auto-backup file in `dir`, in no particular order.
///
/// A missing directory yields an empty list.
pub fn list_auto_backups(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let dir_str = dir
        .to_str()
        .ok_or_else(|| Error::InvalidInput(format!("backup directory is not UTF-8: {}", dir.display())))?;
    let pattern = format!(
        "{}/{}_backup_*.db",
        glob::Pattern::escape(dir_str),
        glob::Pattern::escape(prefix)
    );

    let paths = glob::glob(&pattern).map_err(|e| Error::Config(format!("bad backup pattern: {e}")))?;
    let mut found = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() && has_auto_backup_name(&path, prefix) => found.push(path),
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping unreadable backup entry: {}", e),
        }
    }
    Ok(found)
}

fn has_auto_backup_name(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| is_auto_backup_name(prefix, n))
}
