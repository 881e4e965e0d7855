//! `SQLite`-backed implementation of [`StateStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. One database file
//! per flow is canonical; multiple runner processes may share it, so every
//! operation is a single atomic statement.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::Connection;

use aetherflow_types::state::{JobStatus, StepStatus};

use crate::backend::StateStore;
use crate::error::{self, StateError};

/// Idempotent DDL for the three record kinds.
const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS job_runs(
    job_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY(job_id, run_id)
);

CREATE TABLE IF NOT EXISTS step_runs(
    job_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    step_id TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY(job_id, run_id, step_id)
);

CREATE TABLE IF NOT EXISTS locks(
    key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateStore::open`] for file-backed persistence or
/// [`SqliteStateStore::in_memory`] for tests.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a state database at `path`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created, or
    /// [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory state store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't be
    /// initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Current epoch seconds, used for `updated_at` and lock expiry.
    fn now_epoch() -> i64 {
        Utc::now().timestamp()
    }
}

impl StateStore for SqliteStateStore {
    fn get_job_status(&self, job_id: &str, run_id: &str) -> error::Result<Option<JobStatus>> {
        let conn = self.lock_conn()?;
        let row: Option<String> = match conn.query_row(
            "SELECT status FROM job_runs WHERE job_id = ?1 AND run_id = ?2",
            rusqlite::params![job_id, run_id],
            |row| row.get(0),
        ) {
            Ok(s) => Some(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        row.map(|s| JobStatus::parse(&s).ok_or(StateError::InvalidStatus(s)))
            .transpose()
    }

    fn set_job_status(&self, job_id: &str, run_id: &str, status: JobStatus) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO job_runs(job_id, run_id, status, updated_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(job_id, run_id) \
             DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
            rusqlite::params![job_id, run_id, status.as_str(), Self::now_epoch()],
        )?;
        Ok(())
    }

    fn get_step_status(
        &self,
        job_id: &str,
        run_id: &str,
        step_id: &str,
    ) -> error::Result<Option<StepStatus>> {
        let conn = self.lock_conn()?;
        let row: Option<String> = match conn.query_row(
            "SELECT status FROM step_runs WHERE job_id = ?1 AND run_id = ?2 AND step_id = ?3",
            rusqlite::params![job_id, run_id, step_id],
            |row| row.get(0),
        ) {
            Ok(s) => Some(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        row.map(|s| StepStatus::parse(&s).ok_or(StateError::InvalidStatus(s)))
            .transpose()
    }

    fn set_step_status(
        &self,
        job_id: &str,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO step_runs(job_id, run_id, step_id, status, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(job_id, run_id, step_id) \
             DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
            rusqlite::params![job_id, run_id, step_id, status.as_str(), Self::now_epoch()],
        )?;
        Ok(())
    }

    fn try_acquire_lock(&self, key: &str, owner: &str, ttl_seconds: u64) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let now = Self::now_epoch();
        let expires = now + i64::try_from(ttl_seconds).unwrap_or(i64::MAX);

        conn.execute("DELETE FROM locks WHERE expires_at <= ?1", [now])?;

        // Insert wins when the row is absent; the conditional update wins
        // when the caller already owns the row (refreshing the TTL). A live
        // row held by a different owner changes nothing.
        let changed = conn.execute(
            "INSERT INTO locks(key, owner, expires_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at \
             WHERE locks.owner = excluded.owner",
            rusqlite::params![key, owner, expires],
        )?;
        Ok(changed > 0)
    }

    fn release_lock(&self, key: &str, owner: &str) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND owner = ?2",
            rusqlite::params![key, owner],
        )?;
        Ok(())
    }
}
