//! Embedded migration scripts
//!
//! Scripts live in `cashmop-core/migrations/` and are compiled into the
//! binary. File names follow `<version>_<name>.sql` for the forward script
//! and `<version>_<name>_down.sql` for its reversal.

/// A named SQL asset compiled into the binary.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedScript {
    /// File name, which carries the version and direction
    pub name: &'static str,
    /// SQL text
    pub sql: &'static str,
}

macro_rules! script {
    ($name:literal) => {
        EmbeddedScript {
            name: $name,
            sql: include_str!(concat!("../../migrations/", $name)),
        }
    };
}

/// Every migration asset shipped with the application, in no particular order.
pub const MIGRATIONS: &[EmbeddedScript] = &[
    script!("001_initial_schema.sql"),
    script!("002_currency_settings.sql"),
    script!("002_currency_settings_down.sql"),
    script!("003_fx_rates.sql"),
    script!("003_fx_rates_down.sql"),
    script!("004_rule_amount_bounds.sql"),
    script!("004_rule_amount_bounds_down.sql"),
    script!("005_transaction_indexes.sql"),
    script!("005_transaction_indexes_down.sql"),
    script!("006_rename_default_owner.sql"),
    script!("006_rename_default_owner_down.sql"),
];

/// Highest version shipped in [`MIGRATIONS`]
pub const SCHEMA_VERSION: i64 = 6;

/// Ledger of applied migrations
pub(crate) const LEDGER_DDL: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version    INTEGER PRIMARY KEY,
        applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
";

/// Read the schema version recorded in a connection's ledger.
///
/// A database without a ledger is at version 0.
pub fn read_schema_version(conn: &rusqlite::Connection) -> rusqlite::Result<i64> {
    let has_ledger: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
        [],
        |r| r.get(0),
    )?;
    if !has_ledger {
        return Ok(0);
    }
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |r| r.get(0))?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::MigrationSet;
    use rusqlite::Connection;

    #[test]
    fn test_schema_version_matches_assets() {
        let set = MigrationSet::discover(MIGRATIONS);
        assert_eq!(set.latest_version(), SCHEMA_VERSION);
    }

    #[test]
    fn test_every_version_after_first_has_down() {
        let set = MigrationSet::discover(MIGRATIONS);
        for version in 2..=SCHEMA_VERSION {
            assert!(set.down(version).is_some(), "missing down for {}", version);
        }
        assert!(set.down(1).is_none());
    }

    #[test]
    fn test_read_schema_version_without_ledger() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), 0);

        conn.execute_batch(LEDGER_DDL).unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), 0);

        conn.execute("INSERT INTO schema_migrations (version) VALUES (3)", [])
            .unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), 3);
    }
}
