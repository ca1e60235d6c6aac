//! CLI argument parsing.
//!
//! Defines the Command enum and parse_args() for all commands.

use anyhow::{bail, Result};
use std::path::PathBuf;

use driftsync::{JobStatus, OutputFormat};

pub fn print_usage() {
    eprintln!("driftsync - durable one-way mirror into a remote object store");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  driftsync <command> [arguments]");
    eprintln!("  driftsync --help");
    eprintln!("  driftsync --version");
    eprintln!();
    eprintln!("  driftsync sync --config <FILE> --state-dir <DIR> --target <DIR> [--dry-run]");
    eprintln!("  driftsync watch --config <FILE> --state-dir <DIR> --target <DIR> [--debounce-ms <N>]");
    eprintln!("  driftsync status --state-dir <DIR>");
    eprintln!("  driftsync jobs --state-dir <DIR> [--status <STATUS>] [--limit <N>]");
    eprintln!("  driftsync retry --state-dir <DIR>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  sync    Scan all watch roots, process every pending job, then exit");
    eprintln!("  watch   Watch roots continuously and mirror changes as they happen");
    eprintln!("  status  Show queue and mapping counters");
    eprintln!("  jobs    List jobs (use --status blocked to see failures)");
    eprintln!("  retry   Make every future-scheduled pending job eligible now");
    eprintln!();
    eprintln!("Global arguments:");
    eprintln!("  --output <FORMAT>   Output format: human (default) or json");
    eprintln!();
    eprintln!("Sync/watch arguments:");
    eprintln!("  --config <FILE>     JSON configuration file");
    eprintln!("  --state-dir <DIR>   Directory for the state database and snapshots");
    eprintln!("  --target <DIR>      Local mirror target (e.g. a mounted remote volume)");
    eprintln!("  --dry-run           Report what would be synced without doing it");
    eprintln!("  --debounce-ms <N>   Watcher debounce delay in milliseconds (default: 500)");
    eprintln!();
    eprintln!("Jobs arguments:");
    eprintln!("  --status <STATUS>   Filter: pending|processing|synced|blocked");
    eprintln!("  --limit <N>         Maximum rows to list (default: 50)");
    eprintln!();
    eprintln!("Signals (watch mode):");
    eprintln!("  SIGTERM/SIGINT  stop    SIGUSR1  pause    SIGUSR2  resume    SIGHUP  reload config");
}

/// Parsed command.
#[derive(Debug)]
pub enum Command {
    Sync {
        config: PathBuf,
        state_dir: PathBuf,
        target: PathBuf,
        dry_run: bool,
        output: OutputFormat,
    },
    Watch {
        config: PathBuf,
        state_dir: PathBuf,
        target: PathBuf,
        debounce_ms: u64,
    },
    Status {
        state_dir: PathBuf,
        output: OutputFormat,
    },
    Jobs {
        state_dir: PathBuf,
        status: Option<JobStatus>,
        limit: usize,
        output: OutputFormat,
    },
    Retry {
        state_dir: PathBuf,
        output: OutputFormat,
    },
    Version,
}

struct Args {
    args: Vec<String>,
    pos: usize,
}

impl Args {
    fn next(&mut self) -> Option<&str> {
        let arg = self.args.get(self.pos)?;
        self.pos += 1;
        Some(arg)
    }

    fn value_for(&mut self, flag: &str) -> Result<String> {
        match self.next() {
            Some(value) if !value.starts_with("--") => Ok(value.to_string()),
            _ => bail!("{} requires a value", flag),
        }
    }
}

fn parse_status(s: &str) -> Result<JobStatus> {
    JobStatus::parse(&s.to_uppercase())
        .ok_or_else(|| anyhow::anyhow!("unknown status: {} (expected pending|processing|synced|blocked)", s))
}

/// Parse process arguments into a Command.
pub fn parse_args() -> Result<Command> {
    parse_from(std::env::args().skip(1).collect())
}

fn parse_from(raw: Vec<String>) -> Result<Command> {
    let mut args = Args { args: raw, pos: 0 };
    let Some(command) = args.next().map(|s| s.to_string()) else {
        bail!("no command given");
    };

    if command == "--version" || command == "-V" {
        return Ok(Command::Version);
    }

    let mut config: Option<PathBuf> = None;
    let mut state_dir: Option<PathBuf> = None;
    let mut target: Option<PathBuf> = None;
    let mut dry_run = false;
    let mut debounce_ms: u64 = 500;
    let mut status: Option<JobStatus> = None;
    let mut limit: usize = 50;
    let mut output = OutputFormat::Human;

    while let Some(flag) = args.next().map(|s| s.to_string()) {
        match flag.as_str() {
            "--config" => config = Some(PathBuf::from(args.value_for("--config")?)),
            "--state-dir" => state_dir = Some(PathBuf::from(args.value_for("--state-dir")?)),
            "--target" => target = Some(PathBuf::from(args.value_for("--target")?)),
            "--dry-run" => dry_run = true,
            "--debounce-ms" => {
                debounce_ms = args
                    .value_for("--debounce-ms")?
                    .parse()
                    .map_err(|_| anyhow::anyhow!("--debounce-ms requires an integer"))?
            }
            "--status" => status = Some(parse_status(&args.value_for("--status")?)?),
            "--limit" => {
                limit = args
                    .value_for("--limit")?
                    .parse()
                    .map_err(|_| anyhow::anyhow!("--limit requires an integer"))?
            }
            "--output" => output = OutputFormat::parse(&args.value_for("--output")?)?,
            other => bail!("unknown argument: {}", other),
        }
    }

    let need = |opt: Option<PathBuf>, flag: &str| -> Result<PathBuf> {
        opt.ok_or_else(|| anyhow::anyhow!("{} is required for `{}`", flag, command))
    };

    match command.as_str() {
        "sync" => Ok(Command::Sync {
            config: need(config, "--config")?,
            state_dir: need(state_dir, "--state-dir")?,
            target: need(target, "--target")?,
            dry_run,
            output,
        }),
        "watch" => Ok(Command::Watch {
            config: need(config, "--config")?,
            state_dir: need(state_dir, "--state-dir")?,
            target: need(target, "--target")?,
            debounce_ms,
        }),
        "status" => Ok(Command::Status {
            state_dir: need(state_dir, "--state-dir")?,
            output,
        }),
        "jobs" => Ok(Command::Jobs {
            state_dir: need(state_dir, "--state-dir")?,
            status,
            limit,
            output,
        }),
        "retry" => Ok(Command::Retry {
            state_dir: need(state_dir, "--state-dir")?,
            output,
        }),
        other => bail!("unknown command: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command> {
        parse_from(args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_parse_sync() {
        let cmd = parse(&[
            "sync", "--config", "c.json", "--state-dir", "/s", "--target", "/t", "--dry-run",
        ])
        .unwrap();
        match cmd {
            Command::Sync {
                config,
                state_dir,
                target,
                dry_run,
                output,
            } => {
                assert_eq!(config, PathBuf::from("c.json"));
                assert_eq!(state_dir, PathBuf::from("/s"));
                assert_eq!(target, PathBuf::from("/t"));
                assert!(dry_run);
                assert_eq!(output, OutputFormat::Human);
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_sync_requires_config() {
        assert!(parse(&["sync", "--state-dir", "/s", "--target", "/t"]).is_err());
    }

    #[test]
    fn test_parse_jobs_with_status() {
        let cmd = parse(&[
            "jobs", "--state-dir", "/s", "--status", "blocked", "--limit", "10", "--output",
            "json",
        ])
        .unwrap();
        match cmd {
            Command::Jobs {
                status,
                limit,
                output,
                ..
            } => {
                assert_eq!(status, Some(JobStatus::Blocked));
                assert_eq!(limit, 10);
                assert_eq!(output, OutputFormat::Json);
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(parse(&["frobnicate"]).is_err());
    }

    #[test]
    fn test_flag_missing_value_rejected() {
        assert!(parse(&["status", "--state-dir"]).is_err());
    }

    #[test]
    fn test_version_flag() {
        assert!(matches!(parse(&["--version"]).unwrap(), Command::Version));
    }
}
