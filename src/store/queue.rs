//! Durable job queue operations.
//!
//! Jobs are upserted by `(local_path, remote_path)`: a newer event for the
//! same pair overwrites the prior record and resets its retry state. The
//! `processing_queue` table is the in-flight guard; a path present there is
//! never handed out twice, and stale guard rows (crashed executor) are swept
//! back to PENDING on the next dequeue.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;

use crate::config::SyncDir;
use crate::paths;
use crate::retry::ErrorCategory;
use crate::store::SyncStore;

/// Guard rows older than this are considered abandoned by a dead executor.
pub const STALE_GUARD_MS: i64 = 2 * 60 * 1000;

/// SYNCED jobs are garbage-collected once they are this old.
pub const SYNCED_GC_MS: i64 = 24 * 60 * 60 * 1000;

/// Kind of remote operation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    CreateFile,
    CreateDir,
    Update,
    Delete,
    Rename,
    Move,
    DeleteAndCreate,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::CreateFile => "CREATE_FILE",
            EventType::CreateDir => "CREATE_DIR",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::Rename => "RENAME",
            EventType::Move => "MOVE",
            EventType::DeleteAndCreate => "DELETE_AND_CREATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE_FILE" => Some(EventType::CreateFile),
            "CREATE_DIR" => Some(EventType::CreateDir),
            "UPDATE" => Some(EventType::Update),
            "DELETE" => Some(EventType::Delete),
            "RENAME" => Some(EventType::Rename),
            "MOVE" => Some(EventType::Move),
            "DELETE_AND_CREATE" => Some(EventType::DeleteAndCreate),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Synced,
    Blocked,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Synced => "SYNCED",
            JobStatus::Blocked => "BLOCKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "PROCESSING" => Some(JobStatus::Processing),
            "SYNCED" => Some(JobStatus::Synced),
            "BLOCKED" => Some(JobStatus::Blocked),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable sync job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub event_type: EventType,
    pub local_path: String,
    pub remote_path: String,
    pub old_local_path: Option<String>,
    pub old_remote_path: Option<String>,
    pub status: JobStatus,
    pub n_retries: i64,
    pub retry_at: i64,
    pub change_token: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// Parameters for a job upsert.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub event_type: EventType,
    pub local_path: String,
    pub remote_path: String,
    pub change_token: Option<String>,
    pub old_local_path: Option<String>,
    pub old_remote_path: Option<String>,
}

impl NewJob {
    pub fn new(event_type: EventType, local_path: String, remote_path: String) -> Self {
        Self {
            event_type,
            local_path,
            remote_path,
            change_token: None,
            old_local_path: None,
            old_remote_path: None,
        }
    }
}

/// Row counts per status plus mapping/token totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobCounts {
    pub pending: i64,
    pub processing: i64,
    pub synced: i64,
    pub blocked: i64,
}

/// What `cleanup_orphans` changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanCleanup {
    /// PROCESSING jobs reset to PENDING.
    pub reset: usize,
    /// PENDING jobs whose path left the configuration.
    pub deleted: usize,
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let event_raw: String = row.get("event_type")?;
    let status_raw: String = row.get("status")?;
    Ok(Job {
        id: row.get("id")?,
        event_type: EventType::parse(&event_raw).unwrap_or(EventType::Update),
        local_path: row.get("local_path")?,
        remote_path: row.get("remote_path")?,
        old_local_path: row.get("old_local_path")?,
        old_remote_path: row.get("old_remote_path")?,
        status: JobStatus::parse(&status_raw).unwrap_or(JobStatus::Pending),
        n_retries: row.get("n_retries")?,
        retry_at: row.get("retry_at")?,
        change_token: row.get("change_token")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
    })
}

const JOB_COLUMNS: &str = "id, event_type, local_path, remote_path, old_local_path, \
     old_remote_path, status, n_retries, retry_at, change_token, last_error, created_at";

/// Upsert a job by `(local_path, remote_path)`.
///
/// On conflict the newer event wins: event type, old paths, change token are
/// overwritten and status/retry state reset. Returns `false` (and writes
/// nothing) when the path is not under any configured watch root, which
/// keeps stale-config events from leaking into the queue.
pub fn enqueue(conn: &Connection, job: &NewJob, dirs: &[SyncDir], now: i64) -> Result<bool> {
    if !paths::is_under_any_root(Path::new(&job.local_path), dirs) {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO sync_jobs
                (event_type, local_path, remote_path, old_local_path, old_remote_path,
                 status, n_retries, retry_at, change_token, last_error, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', 0, ?6, ?7, NULL, ?6)
         ON CONFLICT(local_path, remote_path) DO UPDATE SET
                event_type = excluded.event_type,
                old_local_path = excluded.old_local_path,
                old_remote_path = excluded.old_remote_path,
                status = 'PENDING',
                n_retries = 0,
                retry_at = excluded.retry_at,
                change_token = excluded.change_token,
                last_error = NULL",
        params![
            job.event_type.as_str(),
            job.local_path,
            job.remote_path,
            job.old_local_path,
            job.old_remote_path,
            now,
            job.change_token,
        ],
    )
    .context("failed to upsert job")?;
    Ok(true)
}

/// Dequeue the next eligible job. Must run inside a transaction.
///
/// In order: (a) sweep stale guard rows, resetting their jobs to PENDING;
/// (b) pick the PENDING job with the smallest `retry_at <= now` whose path
/// is not in flight; (c) mark it PROCESSING and insert its guard row.
pub fn next_pending_tx(conn: &Connection, now: i64) -> Result<Option<Job>> {
    let stale_before = now - STALE_GUARD_MS;
    conn.execute(
        "UPDATE sync_jobs SET status = 'PENDING'
         WHERE status = 'PROCESSING'
           AND local_path IN (SELECT local_path FROM processing_queue WHERE started_at <= ?1)",
        params![stale_before],
    )
    .context("failed to reset stale processing jobs")?;
    conn.execute(
        "DELETE FROM processing_queue WHERE started_at <= ?1",
        params![stale_before],
    )
    .context("failed to sweep stale guard rows")?;

    let job = conn
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM sync_jobs
                 WHERE status = 'PENDING' AND retry_at <= ?1
                   AND local_path NOT IN (SELECT local_path FROM processing_queue)
                 ORDER BY retry_at ASC, id ASC
                 LIMIT 1"
            ),
            params![now],
            job_from_row,
        )
        .optional()
        .context("failed to select next pending job")?;

    let Some(mut job) = job else {
        return Ok(None);
    };

    conn.execute(
        "UPDATE sync_jobs SET status = 'PROCESSING' WHERE id = ?1",
        params![job.id],
    )
    .context("failed to mark job processing")?;
    conn.execute(
        "INSERT INTO processing_queue (local_path, started_at) VALUES (?1, ?2)",
        params![job.local_path, now],
    )
    .context("failed to insert processing guard")?;
    job.status = JobStatus::Processing;
    Ok(Some(job))
}

/// Record a successful job: SYNCED, error cleared, guard dropped.
///
/// Guarded on PROCESSING: if a newer event upserted the row back to PENDING
/// while the task was in flight, the fresh work wins and the next dequeue
/// picks it up. Opportunistically garbage-collects SYNCED jobs older than
/// 24 hours.
pub fn mark_synced(conn: &Connection, id: i64, local_path: &str, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE sync_jobs SET status = 'SYNCED', last_error = NULL
         WHERE id = ?1 AND status = 'PROCESSING'",
        params![id],
    )
    .context("failed to mark job synced")?;
    conn.execute(
        "DELETE FROM processing_queue WHERE local_path = ?1",
        params![local_path],
    )
    .context("failed to drop processing guard")?;
    conn.execute(
        "DELETE FROM sync_jobs WHERE status = 'SYNCED' AND created_at <= ?1",
        params![now - SYNCED_GC_MS],
    )
    .context("failed to garbage-collect synced jobs")?;
    Ok(())
}

/// Record a terminal failure: BLOCKED, error kept, guard dropped. Guarded
/// on PROCESSING like [`mark_synced`].
pub fn mark_blocked(conn: &Connection, id: i64, local_path: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE sync_jobs SET status = 'BLOCKED', last_error = ?2
         WHERE id = ?1 AND status = 'PROCESSING'",
        params![id, error],
    )
    .context("failed to mark job blocked")?;
    conn.execute(
        "DELETE FROM processing_queue WHERE local_path = ?1",
        params![local_path],
    )
    .context("failed to drop processing guard")?;
    Ok(())
}

/// Put a failed job back in the queue with its next backoff delay.
///
/// Returns the scheduled `retry_at`.
pub fn schedule_retry(
    conn: &Connection,
    id: i64,
    local_path: &str,
    category: ErrorCategory,
    n_retries: i64,
    error: &str,
    now: i64,
) -> Result<i64> {
    let retry_at = now + category.retry_delay_ms(n_retries);
    let next_count = category.next_retry_count(n_retries);
    conn.execute(
        "UPDATE sync_jobs
         SET status = 'PENDING', n_retries = ?2, retry_at = ?3, last_error = ?4
         WHERE id = ?1 AND status = 'PROCESSING'",
        params![id, next_count, retry_at, error],
    )
    .context("failed to schedule retry")?;
    conn.execute(
        "DELETE FROM processing_queue WHERE local_path = ?1",
        params![local_path],
    )
    .context("failed to drop processing guard")?;
    Ok(retry_at)
}

/// Make every future-scheduled PENDING job eligible now.
///
/// BLOCKED jobs are deliberately untouched; they come back only through a
/// fresh filesystem event.
pub fn retry_all_now(conn: &Connection, now: i64) -> Result<usize> {
    let changed = conn
        .execute(
            "UPDATE sync_jobs SET retry_at = ?1 WHERE status = 'PENDING' AND retry_at > ?1",
            params![now],
        )
        .context("failed to reset retry schedule")?;
    Ok(changed)
}

/// Startup recovery. Must run inside a transaction.
///
/// Resets every PROCESSING job to PENDING, truncates the guard table and
/// deletes PENDING jobs whose path no longer falls under any watch root.
pub fn cleanup_orphans_tx(conn: &Connection, dirs: &[SyncDir]) -> Result<OrphanCleanup> {
    let reset = conn
        .execute(
            "UPDATE sync_jobs SET status = 'PENDING' WHERE status = 'PROCESSING'",
            [],
        )
        .context("failed to reset processing jobs")?;
    conn.execute("DELETE FROM processing_queue", [])
        .context("failed to truncate processing guard")?;

    let mut stmt = conn
        .prepare("SELECT id, local_path FROM sync_jobs WHERE status = 'PENDING'")
        .context("failed to prepare orphan query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let mut deleted = 0;
    for (id, local_path) in rows {
        if !paths::is_under_any_root(Path::new(&local_path), dirs) {
            deleted += conn
                .execute("DELETE FROM sync_jobs WHERE id = ?1", params![id])
                .context("failed to delete orphaned job")?;
        }
    }
    Ok(OrphanCleanup { reset, deleted })
}

/// Row counts per status.
pub fn counts(conn: &Connection) -> Result<JobCounts> {
    let mut out = JobCounts::default();
    let mut stmt = conn.prepare("SELECT status, count(*) FROM sync_jobs GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        match JobStatus::parse(&status) {
            Some(JobStatus::Pending) => out.pending = count,
            Some(JobStatus::Processing) => out.processing = count,
            Some(JobStatus::Synced) => out.synced = count,
            Some(JobStatus::Blocked) => out.blocked = count,
            None => {}
        }
    }
    Ok(out)
}

/// List jobs, optionally filtered by status, newest first.
pub fn list_jobs(
    conn: &Connection,
    status: Option<JobStatus>,
    limit: usize,
) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE status = ?1
                 ORDER BY id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![status.as_str(), limit as i64], job_from_row)?;
            for row in rows {
                jobs.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], job_from_row)?;
            for row in rows {
                jobs.push(row?);
            }
        }
    }
    Ok(jobs)
}

/// Fetch one job by its path pair.
pub fn get_by_path_pair(
    conn: &Connection,
    local_path: &str,
    remote_path: &str,
) -> Result<Option<Job>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE local_path = ?1 AND remote_path = ?2"),
        params![local_path, remote_path],
        job_from_row,
    )
    .optional()
    .context("failed to fetch job by path pair")
}

/// Earliest `retry_at` among PENDING jobs, if any. Drives the drain loop's
/// decision to wait for a scheduled retry versus exit.
pub fn earliest_pending_retry(conn: &Connection) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT min(retry_at) FROM sync_jobs WHERE status = 'PENDING'",
        [],
        |row| row.get::<_, Option<i64>>(0),
    )
    .context("failed to query earliest pending retry")
}

/// Guard table contents, oldest first. Used by invariant checks.
pub fn guard_rows(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt =
        conn.prepare("SELECT local_path, started_at FROM processing_queue ORDER BY started_at")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

impl SyncStore {
    pub fn enqueue(&mut self, job: &NewJob, dirs: &[SyncDir], now: i64) -> Result<bool> {
        enqueue(self.conn(), job, dirs, now)
    }

    pub fn next_pending(&mut self, now: i64) -> Result<Option<Job>> {
        self.with_tx(|tx| next_pending_tx(tx, now))
    }

    pub fn mark_synced(&mut self, id: i64, local_path: &str, now: i64) -> Result<()> {
        self.with_tx(|tx| mark_synced(tx, id, local_path, now))
    }

    pub fn mark_blocked(&mut self, id: i64, local_path: &str, error: &str) -> Result<()> {
        self.with_tx(|tx| mark_blocked(tx, id, local_path, error))
    }

    pub fn schedule_retry(
        &mut self,
        id: i64,
        local_path: &str,
        category: ErrorCategory,
        n_retries: i64,
        error: &str,
        now: i64,
    ) -> Result<i64> {
        self.with_tx(|tx| schedule_retry(tx, id, local_path, category, n_retries, error, now))
    }

    pub fn retry_all_now(&mut self, now: i64) -> Result<usize> {
        retry_all_now(self.conn(), now)
    }

    pub fn cleanup_orphans(&mut self, dirs: &[SyncDir]) -> Result<OrphanCleanup> {
        self.with_tx(|tx| cleanup_orphans_tx(tx, dirs))
    }

    pub fn counts(&self) -> Result<JobCounts> {
        counts(self.conn())
    }
}
