//! Persistent state store.
//!
//! Single SQLite database owning four tables: `sync_jobs` (the durable work
//! list), `processing_queue` (the in-flight guard), `node_mappings` (local
//! path → remote node identity) and `change_tokens` (local path → content
//! proxy). Every mutating call from the classifier or executor runs inside
//! one IMMEDIATE transaction so job, mapping and token rows commit together.

pub mod mappings;
pub mod queue;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};

pub use mappings::NodeMapping;
pub use queue::{EventType, Job, JobCounts, JobStatus, NewJob, OrphanCleanup};

/// Database filename inside the state directory.
pub const DB_FILE: &str = "state.db";

/// Current epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Handle to the state database.
///
/// Single connection, single writer. All multi-row invariants are enforced
/// by running the mutation inside [`SyncStore::with_tx`].
pub struct SyncStore {
    conn: Connection,
    db_path: PathBuf,
}

impl SyncStore {
    /// Open (creating if needed) the store under a state directory.
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir).with_context(|| {
            format!("failed to create state directory {}", state_dir.display())
        })?;
        Self::open_db(&state_dir.join(DB_FILE))
    }

    /// Open a store at an explicit database path.
    pub fn open_db(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous mode")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Read-only access for query helpers.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside an IMMEDIATE transaction.
    ///
    /// IMMEDIATE takes the write lock up front so a competing reader cannot
    /// upgrade-deadlock us halfway through a multi-row mutation.
    pub fn with_tx<T>(&mut self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let out = f(&tx)?;
        tx.commit().context("failed to commit transaction")?;
        Ok(out)
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                local_path TEXT NOT NULL,
                remote_path TEXT NOT NULL,
                old_local_path TEXT,
                old_remote_path TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                n_retries INTEGER NOT NULL DEFAULT 0,
                retry_at INTEGER NOT NULL DEFAULT 0,
                change_token TEXT,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE(local_path, remote_path)
            )",
        [],
    )
    .context("failed to create sync_jobs table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_jobs_status_retry
                ON sync_jobs(status, retry_at)",
        [],
    )
    .context("failed to create sync_jobs status index")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS processing_queue (
                local_path TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL
            )",
        [],
    )
    .context("failed to create processing_queue table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS node_mappings (
                local_path TEXT PRIMARY KEY,
                remote_path TEXT NOT NULL,
                node_uid TEXT NOT NULL,
                parent_node_uid TEXT NOT NULL,
                is_directory INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )",
        [],
    )
    .context("failed to create node_mappings table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_tokens (
                local_path TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        [],
    )
    .context("failed to create change_tokens table")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SyncStore::open(dir.path()).unwrap();
        let count: i64 = store
            .conn()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('sync_jobs','processing_queue','node_mappings','change_tokens')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        drop(SyncStore::open(dir.path()).unwrap());
        // Second open must not fail on existing tables.
        SyncStore::open(dir.path()).unwrap();
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = SyncStore::open(dir.path()).unwrap();
        let result: Result<()> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO change_tokens (local_path, token, updated_at) VALUES ('/a', 't', 0)",
                [],
            )?;
            anyhow::bail!("boom")
        });
        assert!(result.is_err());
        let count: i64 = store
            .conn()
            .query_row("SELECT count(*) FROM change_tokens", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
