//! Configuration types and loading.
//!
//! The daemon is configured by a single JSON file. Unknown keys are ignored
//! so that host-environment options (dashboard, credential store) can live in
//! the same file without the core needing to understand them.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How remote deletions are performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteDeleteBehavior {
    /// Move the node into the remote trash (recoverable).
    Trash,
    /// Remove the node permanently.
    Permanent,
}

/// One local directory tree mirrored to a remote subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDir {
    /// Absolute local path of the watch root.
    pub source_path: PathBuf,
    /// Remote folder under which the watch root is mirrored.
    pub remote_root: String,
}

/// Glob exclusions scoped to one watch root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludePattern {
    /// Watch root the globs apply to.
    pub path: PathBuf,
    /// Glob patterns matched against root-relative paths.
    pub globs: Vec<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync_dirs: Vec<SyncDir>,
    #[serde(default = "default_concurrency")]
    pub sync_concurrency: usize,
    #[serde(default)]
    pub exclude_patterns: Vec<ExcludePattern>,
    #[serde(default = "default_delete_behavior")]
    pub remote_delete_behavior: RemoteDeleteBehavior,
    /// Consumed by the dashboard process, not by the sync core.
    #[serde(default = "default_dashboard_host")]
    pub dashboard_host: String,
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,
}

fn default_concurrency() -> usize {
    1
}

fn default_delete_behavior() -> RemoteDeleteBehavior {
    RemoteDeleteBehavior::Trash
}

fn default_dashboard_host() -> String {
    "127.0.0.1".to_string()
}

fn default_dashboard_port() -> u16 {
    4242
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_dirs: Vec::new(),
            sync_concurrency: default_concurrency(),
            exclude_patterns: Vec::new(),
            remote_delete_behavior: default_delete_behavior(),
            dashboard_host: default_dashboard_host(),
            dashboard_port: default_dashboard_port(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// # Validation
    /// - `sync_concurrency` must be >= 1
    /// - every `source_path` must be absolute
    /// - no watch root may be nested inside another (a nested root would
    ///   double-process every event under it)
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_concurrency < 1 {
            bail!("sync_concurrency must be >= 1");
        }
        for dir in &self.sync_dirs {
            if !dir.source_path.is_absolute() {
                bail!(
                    "source_path must be absolute: {}",
                    dir.source_path.display()
                );
            }
            if dir.remote_root.trim().is_empty() {
                bail!("remote_root must not be empty");
            }
        }
        for a in &self.sync_dirs {
            for b in &self.sync_dirs {
                if a.source_path != b.source_path && a.source_path.starts_with(&b.source_path) {
                    bail!(
                        "watch root {} is nested inside {}",
                        a.source_path.display(),
                        b.source_path.display()
                    );
                }
            }
        }
        Ok(())
    }

    /// Globs configured for the given watch root.
    pub fn excludes_for(&self, root: &Path) -> Vec<String> {
        self.exclude_patterns
            .iter()
            .filter(|p| p.path == root)
            .flat_map(|p| p.globs.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config: Config = serde_json::from_str(r#"{"sync_dirs": []}"#).unwrap();
        assert_eq!(config.sync_concurrency, 1);
        assert_eq!(config.remote_delete_behavior, RemoteDeleteBehavior::Trash);
        assert_eq!(config.dashboard_port, 4242);
    }

    #[test]
    fn test_load_validates_concurrency() {
        let config: Config =
            serde_json::from_str(r#"{"sync_dirs": [], "sync_concurrency": 0}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relative_source_path_rejected() {
        let config: Config = serde_json::from_str(
            r#"{"sync_dirs": [{"source_path": "docs", "remote_root": "/backup"}]}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nested_roots_rejected() {
        let config: Config = serde_json::from_str(
            r#"{"sync_dirs": [
                {"source_path": "/a", "remote_root": "/r1"},
                {"source_path": "/a/b", "remote_root": "/r2"}
            ]}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_delete_behavior_parsing() {
        let config: Config = serde_json::from_str(
            r#"{"sync_dirs": [], "remote_delete_behavior": "permanent"}"#,
        )
        .unwrap();
        assert_eq!(
            config.remote_delete_behavior,
            RemoteDeleteBehavior::Permanent
        );
    }

    #[test]
    fn test_excludes_for_root() {
        let config: Config = serde_json::from_str(
            r#"{"sync_dirs": [{"source_path": "/a", "remote_root": "/r"}],
                "exclude_patterns": [
                    {"path": "/a", "globs": ["*.tmp", "cache/**"]},
                    {"path": "/other", "globs": ["*.log"]}
                ]}"#,
        )
        .unwrap();
        assert_eq!(config.excludes_for(Path::new("/a")), vec!["*.tmp", "cache/**"]);
        assert!(config.excludes_for(Path::new("/b")).is_empty());
    }
}
