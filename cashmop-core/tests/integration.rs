//! Integration tests for the storage lifecycle
//!
//! Each test opens its own store in a temp directory and drives it through
//! migrations, backups, restore and retention the way the application does.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cashmop_core::backup::{RetentionPolicy, SnapshotEntry, StaticSpaceProbe};
use cashmop_core::config::BackupConfig;
use cashmop_core::db::EmbeddedScript;
use cashmop_core::{Error, ErrorKind, NewTransaction, Store, StoreOptions, SCHEMA_VERSION};
use chrono::NaiveDate;
use tempfile::TempDir;

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("cashmop.db")
}

fn open_test_store(dir: &TempDir) -> Store {
    cashmop_core::logging::init_test();
    Store::open_with(db_path(dir), StoreOptions::default().with_test_mode(true)).unwrap()
}

fn insert(store: &Store, n: usize) {
    let account = store.get_or_create_account("Chequing").unwrap();
    let rows: Vec<NewTransaction> = (0..n)
        .map(|i| NewTransaction::new(account, "2024-03-01", format!("Row {i}"), 1000 + i as i64))
        .collect();
    store.insert_transactions(&rows).unwrap();
}

fn backup_names(store: &Store) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(store.backup_dir()) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

#[test]
fn test_custom_backup_prefix_is_honored() {
    let dir = TempDir::new().unwrap();
    let backup = BackupConfig {
        file_prefix: "ledger".to_string(),
        ..BackupConfig::default()
    };
    let options = StoreOptions::default()
        .with_test_mode(true)
        .with_backup_config(backup);
    let store = Store::open_with(db_path(&dir), options).unwrap();
    insert(&store, 1);

    assert!(store.should_auto_backup().unwrap());
    let path = store.create_auto_backup().unwrap();
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("ledger_backup_"), "unexpected name {name}");
    assert!(!store.should_auto_backup().unwrap());
}

// ============================================
// Migration Tests
// ============================================

#[test]
fn test_migrate_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);

    let before = store.applied_migrations().unwrap();
    let report = store.migrate().unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(store.applied_migrations().unwrap(), before);
    assert_eq!(store.current_schema_version().unwrap(), SCHEMA_VERSION);
}

#[test]
fn test_migrate_rollback_migrate_restores_ledger() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    let versions = |s: &Store| -> Vec<i64> {
        s.applied_migrations()
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect()
    };

    let before = versions(&store);
    assert_eq!(store.rollback().unwrap(), SCHEMA_VERSION);
    assert_eq!(versions(&store), before[..before.len() - 1].to_vec());

    store.migrate().unwrap();
    assert_eq!(versions(&store), before);
}

#[test]
fn test_rollback_to_first_version_then_stops() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);

    for expected in (2..=SCHEMA_VERSION).rev() {
        assert_eq!(store.rollback().unwrap(), expected);
    }
    let err = store.rollback().unwrap_err();
    assert!(matches!(err, Error::MissingDownMigration(1)));
    assert_eq!(store.current_schema_version().unwrap(), 1);
}

#[test]
fn test_pre_migration_backup_taken_for_existing_schema() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_test_store(&dir);
        insert(&store, 2);
        store.rollback().unwrap();
    }

    let store = Store::open_with(db_path(&dir), StoreOptions::default().with_test_mode(false)).unwrap();
    assert_eq!(store.current_schema_version().unwrap(), SCHEMA_VERSION);

    let names = backup_names(&store);
    assert_eq!(names.len(), 1, "{names:?}");
    assert!(names[0].starts_with(&format!("cashmop_pre_migration_v{SCHEMA_VERSION:03}_")));
}

#[test]
fn test_no_pre_migration_backup_for_fresh_database() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_with(db_path(&dir), StoreOptions::default().with_test_mode(false)).unwrap();

    assert_eq!(store.current_schema_version().unwrap(), SCHEMA_VERSION);
    assert!(backup_names(&store).is_empty());
}

const BASE: &[EmbeddedScript] = &[EmbeddedScript {
    name: "001_base.sql",
    sql: "CREATE TABLE transactions (id INTEGER PRIMARY KEY, amount INTEGER NOT NULL);",
}];

const BROKEN_UPGRADE: &[EmbeddedScript] = &[
    EmbeddedScript {
        name: "001_base.sql",
        sql: "CREATE TABLE transactions (id INTEGER PRIMARY KEY, amount INTEGER NOT NULL);",
    },
    EmbeddedScript {
        name: "002_broken.sql",
        sql: "ALTER TABLE transactions ADD COLUMN note TEXT; UPDATE missing_table SET x = 1;",
    },
    EmbeddedScript {
        name: "003_unreached.sql",
        sql: "CREATE TABLE later (id INTEGER);",
    },
];

#[test]
fn test_failed_migration_reports_backup_and_keeps_ledger() {
    let dir = TempDir::new().unwrap();
    drop(
        Store::open_with(
            db_path(&dir),
            StoreOptions::default()
                .with_test_mode(true)
                .with_migrations(BASE),
        )
        .unwrap(),
    );

    let options = StoreOptions::default()
        .with_test_mode(false)
        .with_migrations(BROKEN_UPGRADE);
    let err = Store::open_with(db_path(&dir), options).unwrap_err();
    let backup = match &err {
        Error::Migration {
            version: 2,
            backup: Some(path),
            ..
        } => path.clone(),
        other => panic!("unexpected error: {other}"),
    };
    assert!(backup.exists());
    assert!(err.to_string().contains(&backup.display().to_string()));
    assert_eq!(err.kind(), ErrorKind::Runtime);

    // Ledger untouched, so the next launch retries from the same point
    let store = Store::open_with(
        db_path(&dir),
        StoreOptions::default()
            .with_test_mode(true)
            .with_migrations(BASE),
    )
    .unwrap();
    assert_eq!(store.current_schema_version().unwrap(), 1);
    let has_note: bool = store
        .connection()
        .unwrap()
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM pragma_table_info('transactions') WHERE name = 'note')",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert!(!has_note);
}

// ============================================
// Backup Tests
// ============================================

#[test]
fn test_backup_then_validate_reports_live_count() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    insert(&store, 4);

    let dest = dir.path().join("manual").join("b.db");
    let written = store.create_backup(&dest).unwrap();
    assert_eq!(written, store.transaction_count().unwrap());
    assert_eq!(store.validate_backup(&dest).unwrap(), 4);
}

#[test]
fn test_validate_backup_rejections() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);

    let missing = store.validate_backup(dir.path().join("nope.db")).unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::Validation);

    let empty = dir.path().join("empty.db");
    fs::write(&empty, b"").unwrap();
    assert!(matches!(store.validate_backup(&empty), Err(Error::EmptyBackup(_))));

    let junk = dir.path().join("junk.db");
    fs::write(&junk, vec![0x5a; 8192]).unwrap();
    let err = store.validate_backup(&junk).unwrap_err();
    assert!(matches!(err, Error::CorruptBackup(_)));
    assert!(err.hint().is_some());

    // A backup taken one schema generation earlier
    let older = dir.path().join("older.db");
    store.rollback().unwrap();
    store.create_backup(&older).unwrap();
    store.migrate().unwrap();
    let err = store.validate_backup(&older).unwrap_err();
    assert!(matches!(
        err,
        Error::SchemaMismatch { backup, current } if backup == SCHEMA_VERSION - 1 && current == SCHEMA_VERSION
    ));
}

#[test]
fn test_low_disk_space_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_with(
        db_path(&dir),
        StoreOptions::default()
            .with_test_mode(true)
            .with_space_probe(Arc::new(StaticSpaceProbe(Some(0)))),
    )
    .unwrap();

    let err = store.create_auto_backup().unwrap_err();
    assert!(matches!(err, Error::InsufficientSpace { .. }));
    assert!(backup_names(&store).is_empty());
}

#[test]
fn test_concurrent_backups_serialize() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    insert(&store, 10);

    let a = dir.path().join("a.db");
    let b = dir.path().join("b.db");
    std::thread::scope(|s| {
        let first = s.spawn(|| store.create_backup(&a));
        let second = s.spawn(|| store.create_backup(&b));
        assert_eq!(first.join().unwrap().unwrap(), 10);
        assert_eq!(second.join().unwrap().unwrap(), 10);
    });
}

#[test]
fn test_should_auto_backup_after_backdating() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    insert(&store, 1);

    assert!(store.should_auto_backup().unwrap());
    let path = store.create_auto_backup().unwrap();
    assert!(!store.should_auto_backup().unwrap());

    let last = store.last_backup_time().unwrap().unwrap();
    assert!(chrono::Local::now().signed_duration_since(last) < chrono::Duration::minutes(5));

    backdate(&path, Duration::from_secs(24 * 3600 + 60));
    assert!(store.should_auto_backup().unwrap());
}

fn backdate(path: &Path, by: Duration) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - by)
        .unwrap();
}

// ============================================
// Restore Tests
// ============================================

#[test]
fn test_restore_ignores_later_mutations() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    insert(&store, 3);

    let b = dir.path().join("b.db");
    let captured = store.create_backup(&b).unwrap();
    insert(&store, 9);
    store
        .connection()
        .unwrap()
        .execute("DELETE FROM transactions WHERE description = 'Row 0'", [])
        .unwrap();

    store.restore_backup(&b).unwrap();
    assert_eq!(store.transaction_count().unwrap(), captured);
}

#[test]
fn test_restore_can_be_undone_with_safety_backup() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    insert(&store, 1);
    let b = dir.path().join("b.db");
    store.create_backup(&b).unwrap();
    insert(&store, 4);

    let safety = store.restore_backup_with_safety(&b).unwrap();
    assert_eq!(store.transaction_count().unwrap(), 1);

    store.restore_backup(&safety).unwrap();
    assert_eq!(store.transaction_count().unwrap(), 5);
}

#[test]
fn test_restore_of_invalid_file_leaves_live_untouched() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    insert(&store, 2);

    let junk = dir.path().join("junk.db");
    fs::write(&junk, b"definitely not sqlite").unwrap();
    assert!(store.restore_backup(&junk).is_err());

    assert_eq!(store.transaction_count().unwrap(), 2);
    assert!(backup_names(&store).is_empty());
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_restore_blocked_by_open_reader_keeps_live_database() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    insert(&store, 2);
    let b1 = dir.path().join("b1.db");
    store.create_backup(&b1).unwrap();
    insert(&store, 3);

    {
        // A reader pins the WAL so the swap cannot go ahead
        let conn = store.connection().unwrap();
        let tx = conn.unchecked_transaction().unwrap();
        let seen: i64 = tx
            .query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(seen, 5);

        let err = store.restore_backup(&b1).unwrap_err();
        assert!(matches!(err, Error::Restore(_)), "unexpected error: {err}");
    }

    assert!(store.is_open());
    assert_eq!(store.transaction_count().unwrap(), 5);
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".restore-"))
        .collect();
    assert!(leftovers.is_empty());

    insert(&store, 1);
    assert_eq!(store.transaction_count().unwrap(), 6);
    assert_eq!(store.validate_backup(&b1).unwrap(), 2);
}

#[test]
fn test_end_to_end_backup_insert_restore() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    assert_eq!(store.current_schema_version().unwrap(), 6);
    insert(&store, 5);
    let before = store.transaction_count().unwrap();

    let b1 = dir.path().join("b1.db");
    store.create_backup(&b1).unwrap();
    insert(&store, 1);
    assert_eq!(store.transaction_count().unwrap(), before + 1);

    store.restore_backup(&b1).unwrap();
    assert_eq!(store.transaction_count().unwrap(), before);
    assert_eq!(store.validate_backup(&b1).unwrap(), before);
    assert_eq!(store.current_schema_version().unwrap(), 6);

    // Still writable after the swap
    insert(&store, 1);
    assert_eq!(store.transaction_count().unwrap(), before + 1);
}

// ============================================
// Retention Tests
// ============================================

#[test]
fn test_cleanup_keeps_daily_tail_and_weekly_digest() {
    let dir = TempDir::new().unwrap();
    let store = open_test_store(&dir);
    let backups = store.ensure_backup_dir().unwrap();

    // 15 backups three days apart span nine ISO weeks
    let newest = NaiveDate::from_ymd_opt(2024, 5, 31)
        .unwrap()
        .and_hms_opt(8, 30, 0)
        .unwrap();
    let mut entries = Vec::new();
    for i in 0..15 {
        let ts = newest - chrono::Duration::days(3 * i);
        let path = backups.join(format!("cashmop_backup_{}_000.db", ts.format("%Y%m%d_%H%M%S")));
        fs::write(&path, b"snapshot").unwrap();
        entries.push(SnapshotEntry { path, taken_at: ts });
    }
    let safety = backups.join("cashmop_pre_restore_20200101_000000_000.db");
    fs::write(&safety, b"safety").unwrap();

    let keep = RetentionPolicy::default().select_keep(&entries);
    let report = store.cleanup_old_backups().unwrap();

    let remaining: Vec<String> = backup_names(&store)
        .into_iter()
        .filter(|n| n.starts_with("cashmop_backup_"))
        .collect();
    assert!(remaining.len() <= 15);
    assert!(!report.deleted.is_empty());
    for path in &keep {
        assert!(path.exists(), "kept file deleted: {}", path.display());
    }
    assert_eq!(remaining.len(), keep.len());
    assert!(safety.exists());
}
