//! Which auto-backups survive a cleanup pass
//!
//! The newest `daily_keep` backups always stay. On top of that, walking from
//! newest to oldest, the first backup seen in each ISO week stays until
//! `weekly_keep` distinct weeks are covered. Everything else is deleted.
//! Pre-restore and pre-migration snapshots are never considered.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, NaiveDateTime};
use serde::Serialize;

use super::naming::{list_auto_backups, parse_snapshot_name};
use crate::config::{BackupConfig, TimestampSource};
use crate::error::Result;

/// An auto-backup file and the moment it was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    pub taken_at: NaiveDateTime,
}

/// What a cleanup pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub kept: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    /// Files that could not be deleted, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

/// Daily-tail plus weekly-digest retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub daily_keep: usize,
    pub weekly_keep: usize,
    pub timestamp_source: TimestampSource,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_keep: 10,
            weekly_keep: 5,
            timestamp_source: TimestampSource::FileName,
        }
    }
}

impl RetentionPolicy {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            daily_keep: config.daily_keep,
            weekly_keep: config.weekly_keep,
            timestamp_source: config.timestamp_source,
        }
    }

    /// Paths that survive, given every candidate.
    pub fn select_keep(&self, entries: &[SnapshotEntry]) -> HashSet<PathBuf> {
        let mut sorted: Vec<&SnapshotEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| b.taken_at.cmp(&a.taken_at).then_with(|| b.path.cmp(&a.path)));

        let mut keep: HashSet<PathBuf> = sorted
            .iter()
            .take(self.daily_keep)
            .map(|e| e.path.clone())
            .collect();

        let mut weeks = HashSet::new();
        for entry in &sorted {
            if weeks.len() >= self.weekly_keep {
                break;
            }
            let week = entry.taken_at.date().iso_week();
            if weeks.insert((week.year(), week.week())) {
                keep.insert(entry.path.clone());
            }
        }
        keep
    }

    /// Auto-backups in `dir` with a usable timestamp.
    pub fn collect(&self, dir: &Path, prefix: &str) -> Result<Vec<SnapshotEntry>> {
        let mut entries = Vec::new();
        for path in list_auto_backups(dir, prefix)? {
            match self.timestamp_of(&path, prefix) {
                Some(taken_at) => entries.push(SnapshotEntry { path, taken_at }),
                None => tracing::warn!(path = %path.display(), "Skipping backup with no usable timestamp"),
            }
        }
        Ok(entries)
    }

    fn timestamp_of(&self, path: &Path, prefix: &str) -> Option<NaiveDateTime> {
        let from_name = || {
            let name = path.file_name()?.to_str()?;
            parse_snapshot_name(prefix, name).map(|(_, ts)| ts)
        };
        let from_mtime = || {
            let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
            Some(DateTime::<Local>::from(modified).naive_local())
        };
        match self.timestamp_source {
            TimestampSource::FileName => from_name().or_else(from_mtime),
            TimestampSource::ModifiedTime => from_mtime(),
        }
    }

    /// Delete every auto-backup in `dir` outside the keep-set.
    ///
    /// Each deletion is attempted independently; failures are logged and
    /// reported, never fatal.
    pub fn cleanup(&self, dir: &Path, prefix: &str) -> Result<CleanupReport> {
        let entries = self.collect(dir, prefix)?;
        let keep = self.select_keep(&entries);

        let mut report = CleanupReport::default();
        for entry in entries {
            if keep.contains(&entry.path) {
                report.kept.push(entry.path);
                continue;
            }
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {
                    tracing::debug!(path = %entry.path.display(), "Deleted old backup");
                    report.deleted.push(entry.path);
                }
                Err(e) => {
                    tracing::warn!(path = %entry.path.display(), "Failed to delete old backup: {}", e);
                    report.failed.push((entry.path, e.to_string()));
                }
            }
        }

        if !report.deleted.is_empty() {
            tracing::info!(
                kept = report.kept.len(),
                deleted = report.deleted.len(),
                "Cleaned up old backups"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use std::fs;
    use tempfile::TempDir;

    fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn entry(ts: NaiveDateTime) -> SnapshotEntry {
        SnapshotEntry {
            path: PathBuf::from(format!("cashmop_backup_{}.db", ts.format("%Y%m%d_%H%M%S"))),
            taken_at: ts,
        }
    }

    fn write_daily(dir: &Path, last: NaiveDateTime, count: i64) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let ts = last - Duration::days(i);
                let path = dir.join(format!("cashmop_backup_{}_000.db", ts.format("%Y%m%d_%H%M%S")));
                fs::write(&path, b"snapshot").unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_thirty_days_keeps_daily_tail_and_weekly_digest() {
        // 2024-03-31 is a Sunday, so ISO weeks end on each Sunday.
        let entries: Vec<SnapshotEntry> = (0..30)
            .map(|i| entry(day(2024, 3, 31) - Duration::days(i)))
            .collect();

        let keep = RetentionPolicy::default().select_keep(&entries);
        assert_eq!(keep.len(), 13);

        for d in 22..=31 {
            assert!(keep.contains(&entry(day(2024, 3, d)).path), "daily {d}");
        }
        for d in [17, 10, 3] {
            assert!(keep.contains(&entry(day(2024, 3, d)).path), "weekly {d}");
        }
        assert!(!keep.contains(&entry(day(2024, 3, 2)).path));
    }

    #[test]
    fn test_fewer_than_daily_keeps_everything() {
        let entries: Vec<SnapshotEntry> = (0..4)
            .map(|i| entry(day(2024, 1, 10) - Duration::days(i)))
            .collect();
        assert_eq!(RetentionPolicy::default().select_keep(&entries).len(), 4);
    }

    #[test]
    fn test_weekly_digest_extends_past_daily_tail() {
        // One backup every 7 days for 12 weeks, daily tail of 2
        let policy = RetentionPolicy {
            daily_keep: 2,
            weekly_keep: 5,
            ..RetentionPolicy::default()
        };
        let entries: Vec<SnapshotEntry> = (0..12)
            .map(|i| entry(day(2024, 6, 30) - Duration::days(7 * i)))
            .collect();

        let keep = policy.select_keep(&entries);
        assert_eq!(keep.len(), 5);
        for i in 0..5 {
            assert!(keep.contains(&entries[i].path));
        }
    }

    #[test]
    fn test_cleanup_deletes_outside_keep_set() {
        let dir = TempDir::new().unwrap();
        let files = write_daily(dir.path(), day(2024, 3, 31), 30);
        let safety = dir.path().join("cashmop_pre_restore_20230101_120000.db");
        let pre_migration = dir.path().join("cashmop_pre_migration_v003_20230101_120000.db");
        fs::write(&safety, b"safety").unwrap();
        fs::write(&pre_migration, b"premig").unwrap();

        let report = RetentionPolicy::default().cleanup(dir.path(), "cashmop").unwrap();
        assert_eq!(report.kept.len(), 13);
        assert_eq!(report.deleted.len(), 17);
        assert!(report.failed.is_empty());

        for path in &report.kept {
            assert!(path.exists());
        }
        for path in &report.deleted {
            assert!(!path.exists());
        }
        assert!(files[0].exists());
        assert!(safety.exists());
        assert!(pre_migration.exists());
    }

    #[test]
    fn test_cleanup_is_stable_on_second_pass() {
        let dir = TempDir::new().unwrap();
        write_daily(dir.path(), day(2024, 3, 31), 20);
        let policy = RetentionPolicy::default();

        let first = policy.cleanup(dir.path(), "cashmop").unwrap();
        let second = policy.cleanup(dir.path(), "cashmop").unwrap();
        assert!(second.deleted.is_empty());
        assert_eq!(second.kept.len(), first.kept.len());
    }

    #[test]
    fn test_mtime_fallback_for_unparseable_name() {
        let dir = TempDir::new().unwrap();
        let odd = dir.path().join("cashmop_backup_manual.db");
        fs::write(&odd, b"x").unwrap();

        let entries = RetentionPolicy::default()
            .collect(dir.path(), "cashmop")
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, odd);
    }

    #[test]
    fn test_modified_time_source_ignores_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cashmop_backup_20200101_000000.db");
        fs::write(&path, b"x").unwrap();

        let policy = RetentionPolicy {
            timestamp_source: TimestampSource::ModifiedTime,
            ..RetentionPolicy::default()
        };
        let entries = policy.collect(dir.path(), "cashmop").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].taken_at > day(2020, 1, 2));
    }
}
