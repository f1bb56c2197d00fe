//! Row-level operations used by importers and fixtures
//!
//! Only the handful of writes the storage lifecycle needs to exercise itself;
//! richer queries belong to the application layer.

use rusqlite::{params, Connection, OptionalExtension};

use super::retry::{retry_busy, RetryPolicy};
use super::store::Store;
use crate::error::{Error, Result};

/// A transaction row to insert. Amounts are in minor units (cents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub account_id: i64,
    pub owner_id: Option<i64>,
    pub date: String,
    pub description: String,
    pub amount: i64,
    pub category_id: Option<i64>,
    pub currency: String,
    pub raw_metadata: Option<String>,
}

impl NewTransaction {
    pub fn new(account_id: i64, date: impl Into<String>, description: impl Into<String>, amount: i64) -> Self {
        Self {
            account_id,
            owner_id: None,
            date: date.into(),
            description: description.into(),
            amount,
            category_id: None,
            currency: "CAD".to_string(),
            raw_metadata: None,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }
}

impl Store {
    // ============================================
    // Account operations
    // ============================================

    /// Look up an account by name, creating it when missing.
    pub fn get_or_create_account(&self, name: &str) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("account name cannot be empty".to_string()));
        }

        let conn = self.connection()?;
        let existing: Option<i64> = conn
            .query_row("SELECT id FROM accounts WHERE name = ?1", [name], |r| r.get(0))
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        conn.execute("INSERT INTO accounts (name) VALUES (?1)", [name])?;
        Ok(conn.last_insert_rowid())
    }

    // ============================================
    // Transaction operations
    // ============================================

    /// Insert rows in one transaction, retrying on lock contention.
    ///
    /// Returns the number of rows inserted.
    pub fn insert_transactions(&self, rows: &[NewTransaction]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let inserted = retry_busy(&RetryPolicy::bulk(), || insert_batch(&mut conn, rows))?;
        tracing::debug!(count = inserted, "Inserted transactions");
        Ok(inserted)
    }

    /// Number of rows in `transactions`.
    pub fn transaction_count(&self) -> Result<i64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))?;
        Ok(count)
    }
}

fn insert_batch(conn: &mut Connection, rows: &[NewTransaction]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            r#"
            INSERT INTO transactions
                (account_id, owner_id, date, description, amount, category_id, currency, raw_metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )?;
        for row in rows {
            inserted += stmt.execute(params![
                row.account_id,
                row.owner_id,
                row.date,
                row.description,
                row.amount,
                row.category_id,
                row.currency,
                row.raw_metadata,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}
