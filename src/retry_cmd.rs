//! Retry command: make future-scheduled pending jobs eligible now.
//!
//! BLOCKED jobs are not requeued here; a blocked job only comes back when a
//! fresh filesystem event upserts its path.

use anyhow::Result;
use std::path::PathBuf;

use driftsync::store::{now_ms, SyncStore};
use driftsync::{output_json, OutputFormat};

#[derive(serde::Serialize)]
struct RetryResponse {
    rescheduled: usize,
}

pub fn run_retry(state_dir: PathBuf, output: OutputFormat) -> Result<()> {
    let mut store = SyncStore::open(&state_dir)?;
    let rescheduled = store.retry_all_now(now_ms())?;

    match output {
        OutputFormat::Json => output_json(&RetryResponse { rescheduled })?,
        OutputFormat::Human => {
            println!("{} job(s) made eligible for retry", rescheduled);
            let blocked = store.counts()?.blocked;
            if blocked > 0 {
                println!(
                    "{} blocked job(s) were not touched; they need a new local change",
                    blocked
                );
            }
        }
    }
    Ok(())
}
