use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use super::{Store, from_millis, to_millis};

/// Short-lived pool account on a worker host.
///
/// `allocated_at` is `None` both for a row whose preparation has not finished and for an account
/// whose password has already expired; either way the account may be reclaimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub host: String,
    pub user_name: Option<String>,
    pub allocated_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Login of the OS user backing this account.
    pub fn login(&self, pool_prefix: &str) -> String {
        format!("{pool_prefix}{}", self.id)
    }
}

const ACCOUNT_COLUMNS: &str = "id, host, user_name, allocated_at";

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        host: row.get(1)?,
        user_name: row.get(2)?,
        allocated_at: row.get::<_, Option<i64>>(3)?.map(from_millis),
    })
}

impl Store {
    /// Inserts a fresh, unallocated account on `host` and returns its id.
    pub fn create_account(&self, host: &str) -> crate::Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO accounts (host, user_name, allocated_at) VALUES (?1, NULL, NULL)",
            params![host],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Marks a freshly prepared account as allocated to `user_name`.
    ///
    /// Only a row that has never been allocated can be allocated, so an account whose password
    /// was expired never becomes active again.
    pub fn allocate_account(
        &self,
        id: i64,
        user_name: &str,
        now: DateTime<Utc>,
    ) -> crate::Result<Option<Account>> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE accounts SET user_name = ?2, allocated_at = ?3 \
             WHERE id = ?1 AND user_name IS NULL AND allocated_at IS NULL",
            params![id, user_name, to_millis(now)],
        )?;
        let account = if updated > 0 {
            tx.query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                account_from_row,
            )
            .optional()?
        } else {
            None
        };
        tx.commit()?;
        Ok(account)
    }

    pub fn get_account(&self, id: i64) -> crate::Result<Option<Account>> {
        let conn = self.connection()?;
        let account = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    /// Accounts whose password was armed before `before`.
    pub fn find_expired_accounts(&self, before: DateTime<Utc>) -> crate::Result<Vec<Account>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE allocated_at IS NOT NULL AND allocated_at < ?1 ORDER BY id"
        ))?;
        let accounts = statement
            .query_map(params![to_millis(before)], account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    /// Clears the allocation time of an account. Returns false if it was already cleared.
    pub fn expire_account(&self, id: i64) -> crate::Result<bool> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE accounts SET allocated_at = NULL WHERE id = ?1 AND allocated_at IS NOT NULL",
            params![id],
        )?;
        tx.commit()?;
        Ok(updated > 0)
    }

    /// Accounts without an armed password, candidates for deletion.
    pub fn find_deletable_accounts(&self) -> crate::Result<Vec<Account>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE allocated_at IS NULL ORDER BY id"
        ))?;
        let accounts = statement
            .query_map([], account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn remove_account(&self, id: i64) -> crate::Result<bool> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn count_accounts_on(&self, host: &str) -> crate::Result<u64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM accounts WHERE host = ?1",
            params![host],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
