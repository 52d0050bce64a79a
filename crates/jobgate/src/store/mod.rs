//! SQLite persistence of jobs and pool accounts.
//!
//! The connection is guarded by a synchronous mutex. Every method takes the lock for the duration
//! of a single statement or transaction and never across an `.await`, so the store can be shared
//! freely between request handlers and periodic ticks. Request handlers go through
//! [`Store::blocking`] to keep SQLite work off the async worker threads.

mod account;
mod job;

pub use account::Account;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::common::error::GatewayError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    backend      TEXT NOT NULL,
    username     TEXT NOT NULL,
    owner        TEXT NOT NULL,
    executable   TEXT NOT NULL,
    submitted_at INTEGER NOT NULL,
    location     TEXT NOT NULL,
    status       TEXT,
    worker_node  TEXT,
    comment      TEXT,
    cancelled    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_jobs_username ON jobs(username);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

CREATE TABLE IF NOT EXISTS accounts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    host         TEXT NOT NULL,
    user_name    TEXT,
    allocated_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_accounts_host ON accounts(host);
";

pub struct Store {
    conn: Mutex<Connection>,
}

pub type StoreRef = Arc<Store>;

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Cannot open database {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             PRAGMA synchronous=NORMAL;",
        )
        .context("Cannot configure database")?;
        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Cannot open in-memory database")?;
        Self::with_schema(conn)
    }

    fn with_schema(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Cannot create database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` against the store on the blocking thread pool.
    pub async fn blocking<F, R>(self: &Arc<Self>, f: F) -> crate::Result<R>
    where
        F: FnOnce(&Store) -> crate::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|error| {
                GatewayError::InternalError(format!("Database task failed: {error}"))
            })?
    }

    fn connection(&self) -> crate::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| GatewayError::InternalError("Database connection is poisoned".into()))
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
