//! Versioned schema migrations tracked in the `schema_migrations` ledger.
//!
//! Each version is applied in its own transaction together with its ledger
//! row, so a version is either fully applied or not applied at all. Rollback
//! undoes exactly one version: the current head.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::schema::{EmbeddedScript, LEDGER_DDL};
use crate::error::{Error, Result};

/// Whether a script moves the schema forward or back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// A discovered migration script.
#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub version: i64,
    pub name: String,
    pub direction: Direction,
    pub sql: &'static str,
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaMigrationRecord {
    pub version: i64,
    pub applied_at: Option<NaiveDateTime>,
}

/// Outcome of a [`MigrationRunner::migrate`] run.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Versions applied by this run, ascending
    pub applied: Vec<i64>,
    /// Safety snapshot taken before the first applied version, if any
    pub backup: Option<PathBuf>,
}

/// Parse `<version>_<name>[_down].sql`.
///
/// Returns `None` for files that are not SQL; `Some(Err(..))` when the
/// version prefix cannot be parsed.
fn parse_file_name(file_name: &str) -> Option<std::result::Result<(i64, String, Direction), String>> {
    let stem = file_name.strip_suffix(".sql")?;
    let Some((prefix, rest)) = stem.split_once('_') else {
        return Some(Err(format!("missing '_' after version in {file_name}")));
    };
    let version = match prefix.parse::<i64>() {
        Ok(v) if v > 0 => v,
        _ => return Some(Err(format!("invalid version prefix {prefix:?} in {file_name}"))),
    };
    let (name, direction) = match rest.strip_suffix("_down") {
        Some(name) => (name, Direction::Down),
        None => (rest, Direction::Up),
    };
    Some(Ok((version, name.to_string(), direction)))
}

/// Up and down scripts indexed by version.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    up: BTreeMap<i64, MigrationFile>,
    down: BTreeMap<i64, MigrationFile>,
}

impl MigrationSet {
    /// Index an asset set by filename convention, skipping files whose
    /// version cannot be parsed.
    pub fn discover(assets: &[EmbeddedScript]) -> Self {
        let mut set = Self::default();

        for asset in assets {
            let (version, name, direction) = match parse_file_name(asset.name) {
                None => {
                    tracing::debug!(file = asset.name, "Ignoring non-SQL migration asset");
                    continue;
                }
                Some(Err(reason)) => {
                    tracing::warn!(file = asset.name, "Skipping migration file: {}", reason);
                    continue;
                }
                Some(Ok(parsed)) => parsed,
            };

            let target = match direction {
                Direction::Up => &mut set.up,
                Direction::Down => &mut set.down,
            };
            if target.contains_key(&version) {
                tracing::warn!(file = asset.name, version, "Duplicate migration version, ignoring");
                continue;
            }
            target.insert(
                version,
                MigrationFile {
                    version,
                    name,
                    direction,
                    sql: asset.sql,
                },
            );
        }

        set
    }

    /// Highest version with an up-script, or 0 when empty
    pub fn latest_version(&self) -> i64 {
        self.up.keys().next_back().copied().unwrap_or(0)
    }

    /// Up-script for `version`
    pub fn up(&self, version: i64) -> Option<&MigrationFile> {
        self.up.get(&version)
    }

    /// Down-script for `version`
    pub fn down(&self, version: i64) -> Option<&MigrationFile> {
        self.down.get(&version)
    }

    /// Up-scripts not in `applied`, ascending
    pub fn pending<'a>(&'a self, applied: &'a BTreeSet<i64>) -> impl Iterator<Item = &'a MigrationFile> + 'a {
        self.up.values().filter(move |m| !applied.contains(&m.version))
    }
}

/// Applies and rolls back migrations against one connection.
pub struct MigrationRunner<'a> {
    set: &'a MigrationSet,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(set: &'a MigrationSet) -> Self {
        Self { set }
    }

    /// Create the ledger table if it does not exist.
    pub fn ensure_ledger(conn: &Connection) -> Result<()> {
        conn.execute_batch(LEDGER_DDL)?;
        Ok(())
    }

    /// Snapshot of applied versions.
    pub fn applied_versions(conn: &Connection) -> Result<BTreeSet<i64>> {
        let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
        let versions = stmt
            .query_map([], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(versions)
    }

    /// Ledger rows, ascending by version.
    pub fn records(conn: &Connection) -> Result<Vec<SchemaMigrationRecord>> {
        let mut stmt =
            conn.prepare("SELECT version, applied_at FROM schema_migrations ORDER BY version")?;
        let records = stmt
            .query_map([], |r| {
                Ok(SchemaMigrationRecord {
                    version: r.get(0)?,
                    applied_at: r.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Versions that [`migrate`](Self::migrate) would apply, ascending.
    pub fn pending_versions(&self, conn: &Connection) -> Result<Vec<i64>> {
        Self::ensure_ledger(conn)?;
        let applied = Self::applied_versions(conn)?;
        Ok(self.set.pending(&applied).map(|m| m.version).collect())
    }

    /// Apply every pending version in ascending order.
    ///
    /// `before_first` is called once, with the first pending version, before
    /// anything is applied; the path it returns is attached to the report and
    /// to any failure. A failing script stops the run and leaves the ledger
    /// at the last successful version.
    pub fn migrate<F>(&self, conn: &mut Connection, mut before_first: F) -> Result<MigrationReport>
    where
        F: FnMut(i64) -> Option<PathBuf>,
    {
        Self::ensure_ledger(conn)?;
        let applied = Self::applied_versions(conn)?;
        let pending: Vec<&MigrationFile> = self.set.pending(&applied).collect();

        let mut report = MigrationReport::default();
        if pending.is_empty() {
            tracing::debug!(current = applied.last().copied().unwrap_or(0), "No pending migrations");
            return Ok(report);
        }

        tracing::info!(
            current = applied.last().copied().unwrap_or(0),
            target = self.set.latest_version(),
            pending = pending.len(),
            "Running database migrations"
        );

        for (i, migration) in pending.into_iter().enumerate() {
            if i == 0 {
                report.backup = before_first(migration.version);
            }

            tracing::info!(version = migration.version, name = %migration.name, "Running migration");
            if let Err(source) = apply_up(conn, migration) {
                tracing::error!(version = migration.version, "Migration failed: {}", source);
                return Err(Error::Migration {
                    version: migration.version,
                    backup: report.backup.clone(),
                    source,
                });
            }
            report.applied.push(migration.version);
        }

        tracing::info!(applied = ?report.applied, "Migrations complete");
        Ok(report)
    }

    /// Undo the head version with its down-script. Returns the version undone.
    pub fn rollback(&self, conn: &mut Connection) -> Result<i64> {
        Self::ensure_ledger(conn)?;
        let applied = Self::applied_versions(conn)?;
        let head = *applied.last().ok_or(Error::NothingToRollback)?;
        let down = self.set.down(head).ok_or(Error::MissingDownMigration(head))?;

        tracing::info!(version = head, name = %down.name, "Rolling back migration");
        apply_down(conn, down).map_err(|source| Error::Migration {
            version: head,
            backup: None,
            source,
        })?;
        Ok(head)
    }
}

fn apply_up(conn: &mut Connection, migration: &MigrationFile) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT INTO schema_migrations (version) VALUES (?1)",
        params![migration.version],
    )?;
    tx.commit()
}

fn apply_down(conn: &mut Connection, migration: &MigrationFile) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "DELETE FROM schema_migrations WHERE version = ?1",
        params![migration.version],
    )?;
    tx.commit()
}
