//! driftsync CLI - durable one-way mirror into a remote object store
//!
//! Usage: driftsync <command> [arguments]

mod cli;
mod jobs_cmd;
mod retry_cmd;
mod status_cmd;
mod sync_cmd;
mod version;
mod watch_cmd;

use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use cli::{parse_args, print_usage, Command};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && matches!(args[1].as_str(), "--help" | "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }
    if args.len() < 2 {
        print_usage();
        return ExitCode::from(1);
    }

    let command = match parse_args() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::from(1);
        }
    };

    let result = match command {
        Command::Sync {
            config,
            state_dir,
            target,
            dry_run,
            output,
        } => sync_cmd::run_sync(config, state_dir, target, dry_run, output),
        Command::Watch {
            config,
            state_dir,
            target,
            debounce_ms,
        } => watch_cmd::run_watch(config, state_dir, target, debounce_ms),
        Command::Status { state_dir, output } => status_cmd::run_status(state_dir, output),
        Command::Jobs {
            state_dir,
            status,
            limit,
            output,
        } => jobs_cmd::run_jobs(state_dir, status, limit, output),
        Command::Retry { state_dir, output } => retry_cmd::run_retry(state_dir, output),
        Command::Version => {
            println!("{}", version::version());
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
