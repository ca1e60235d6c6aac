//! Output format selection for CLI commands.

use anyhow::{bail, Result};
use serde::Serialize;

/// How command results are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Plain text for terminals.
    Human,
    /// Pretty-printed JSON for scripting.
    Json,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "human" => Ok(OutputFormat::Human),
            "json" => Ok(OutputFormat::Json),
            other => bail!("unknown output format: {} (expected human|json)", other),
        }
    }
}

/// Print a value as pretty JSON on stdout.
pub fn output_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
