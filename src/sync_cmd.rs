//! One-shot sync command: scan, drain, exit.

use anyhow::{anyhow, Result};
use indicatif::ProgressBar;
use std::path::PathBuf;
use std::sync::Arc;

use driftsync::engine::{DrainStats, SyncEngine};
use driftsync::{output_json, Config, FsDriver, OutputFormat};

#[derive(serde::Serialize)]
struct SyncResponse {
    roots_scanned: usize,
    records: usize,
    suppressed: usize,
    synced: usize,
    retried: usize,
    blocked: usize,
}

pub fn run_sync(
    config_path: PathBuf,
    state_dir: PathBuf,
    target: PathBuf,
    dry_run: bool,
    output: OutputFormat,
) -> Result<()> {
    let config = Config::load(&config_path)?;
    let driver = Arc::new(FsDriver::open(&target).map_err(|e| anyhow!(e.0))?);
    let mut engine = SyncEngine::new(config, &state_dir, driver)?;

    engine.startup_recovery()?;
    let summary = engine.initial_scan(dry_run, true)?;

    if dry_run {
        match output {
            OutputFormat::Human => {
                println!(
                    "dry run: {} change(s) across {} root(s), {} suppressed",
                    summary.planned.len(),
                    summary.roots_scanned,
                    summary.suppressed
                );
                for job in &summary.planned {
                    println!("  {:<17} {} -> {}", job.event_type, job.local_path, job.remote_path);
                }
            }
            OutputFormat::Json => {
                #[derive(serde::Serialize)]
                struct PlannedJob<'a> {
                    event_type: &'a str,
                    local_path: &'a str,
                    remote_path: &'a str,
                }
                let planned: Vec<_> = summary
                    .planned
                    .iter()
                    .map(|j| PlannedJob {
                        event_type: j.event_type.as_str(),
                        local_path: &j.local_path,
                        remote_path: &j.remote_path,
                    })
                    .collect();
                output_json(&planned)?;
            }
        }
        return Ok(());
    }

    let pending = engine.store().counts()?.pending;
    let bar = match output {
        OutputFormat::Human if pending > 0 => ProgressBar::new(pending as u64),
        _ => ProgressBar::hidden(),
    };

    let stats: DrainStats = engine.drain(|s| {
        bar.set_position((s.synced + s.blocked) as u64);
    })?;
    bar.finish_and_clear();

    match output {
        OutputFormat::Human => {
            println!(
                "synced {} job(s), {} retried along the way, {} blocked",
                stats.synced, stats.retried, stats.blocked
            );
            if stats.blocked > 0 {
                eprintln!("run `driftsync jobs --status blocked` to inspect failures");
            }
        }
        OutputFormat::Json => {
            output_json(&SyncResponse {
                roots_scanned: summary.roots_scanned,
                records: summary.records,
                suppressed: summary.suppressed,
                synced: stats.synced,
                retried: stats.retried,
                blocked: stats.blocked,
            })?;
        }
    }
    Ok(())
}
