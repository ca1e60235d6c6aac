//! Jobs command: list queue contents.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use driftsync::store::{queue, SyncStore};
use driftsync::{output_json, JobStatus, OutputFormat};

/// Run jobs listing command
///
/// Usage: driftsync jobs --state-dir <DIR> [--status <STATUS>] [--limit <N>]
pub fn run_jobs(
    state_dir: PathBuf,
    status: Option<JobStatus>,
    limit: usize,
    output: OutputFormat,
) -> Result<()> {
    let store = SyncStore::open(&state_dir)?;
    let jobs = queue::list_jobs(store.conn(), status, limit)?;

    match output {
        OutputFormat::Json => output_json(&jobs)?,
        OutputFormat::Human => {
            if jobs.is_empty() {
                println!("no jobs");
                return Ok(());
            }
            for job in &jobs {
                let retry_at = DateTime::<Utc>::from_timestamp_millis(job.retry_at)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| job.retry_at.to_string());
                println!(
                    "#{} {} {} {} (retries: {}, retry_at: {})",
                    job.id, job.status, job.event_type, job.local_path, job.n_retries, retry_at
                );
                if let Some(error) = &job.last_error {
                    println!("    last error: {}", error);
                }
            }
        }
    }
    Ok(())
}
