//! Status command: queue and mapping counters.

use anyhow::Result;
use std::path::PathBuf;

use driftsync::store::{mappings, queue, SyncStore};
use driftsync::{output_json, OutputFormat};

#[derive(serde::Serialize)]
struct StatusResponse {
    pending: i64,
    processing: i64,
    synced: i64,
    blocked: i64,
    node_mappings: i64,
    change_tokens: i64,
}

/// Run status query command
///
/// Usage: driftsync status --state-dir <DIR>
pub fn run_status(state_dir: PathBuf, output: OutputFormat) -> Result<()> {
    let store = SyncStore::open(&state_dir)?;
    let counts = queue::counts(store.conn())?;
    let response = StatusResponse {
        pending: counts.pending,
        processing: counts.processing,
        synced: counts.synced,
        blocked: counts.blocked,
        node_mappings: mappings::mapping_count(store.conn())?,
        change_tokens: mappings::token_count(store.conn())?,
    };

    match output {
        OutputFormat::Json => output_json(&response)?,
        OutputFormat::Human => {
            println!("pending: {}", response.pending);
            println!("processing: {}", response.processing);
            println!("synced: {}", response.synced);
            println!("blocked: {}", response.blocked);
            println!("node_mappings: {}", response.node_mappings);
            println!("change_tokens: {}", response.change_tokens);
        }
    }
    Ok(())
}
