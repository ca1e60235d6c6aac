//! Exclusion filtering for watch roots.
//!
//! Filtering has two layers with fixed precedence:
//! 1. Hard internal ignores (state database, driver sidecar files, VCS and
//!    OS junk) that are never mirrored regardless of configuration
//! 2. User-configured glob patterns, scoped per watch root
//!
//! The filter is compiled once per watch root. Filtering is a pure function
//! of the path: same inputs always produce same output.

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::paths;

/// Directory names that are always ignored, at any depth (hard-coded).
const INTERNAL_IGNORE_DIRS: &[&str] = &[".git", "node_modules", ".driftsync-trash"];

/// File names that are always ignored (hard-coded). The node table is the
/// filesystem driver's sidecar; watching a mirror target would otherwise
/// feed the driver's own writes back into the queue.
const INTERNAL_IGNORE_FILES: &[&str] = &[".DS_Store", ".driftsync-nodes.json"];

/// Per-watch-root exclusion filter.
pub struct ExclusionFilter {
    root: PathBuf,
    /// Directory holding the state database and snapshots. Anything under it
    /// is never mirrored, even when a watch root contains it.
    state_dir: Option<PathBuf>,
    exclude: Vec<GlobMatcher>,
}

impl ExclusionFilter {
    /// Compile the filter for one watch root from the configuration.
    pub fn for_root(root: &Path, config: &Config, state_dir: Option<&Path>) -> Result<Self> {
        let globs = config.excludes_for(root);
        let mut exclude = Vec::with_capacity(globs.len());
        for pattern in &globs {
            let matcher = Glob::new(pattern)
                .with_context(|| format!("invalid exclude pattern {:?}", pattern))?
                .compile_matcher();
            exclude.push(matcher);
        }
        Ok(Self {
            root: root.to_path_buf(),
            state_dir: state_dir.map(|p| p.to_path_buf()),
            exclude,
        })
    }

    /// Whether an absolute path is excluded from syncing.
    ///
    /// Globs match the root-relative path, so `cache/**` excludes the cache
    /// directory of this root only. Internal ignores match path components,
    /// so `.git` anywhere under the root prunes its whole subtree.
    pub fn is_excluded(&self, abs: &Path) -> bool {
        if let Some(state_dir) = &self.state_dir {
            if abs.starts_with(state_dir) {
                return true;
            }
        }
        let Some(rel) = paths::rel_key(abs, &self.root) else {
            // Outside the root entirely; nothing to sync.
            return true;
        };
        if rel.is_empty() {
            return false;
        }
        if is_internal_ignore(&rel) {
            return true;
        }
        self.exclude.iter().any(|m| m.is_match(&rel))
    }
}

/// Hard ignore check over the components of a root-relative path.
fn is_internal_ignore(rel: &str) -> bool {
    let mut components = rel.split('/').peekable();
    while let Some(component) = components.next() {
        if INTERNAL_IGNORE_DIRS.contains(&component) {
            return true;
        }
        // File names only apply to the last component.
        if components.peek().is_none() && INTERNAL_IGNORE_FILES.contains(&component) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with(globs: &str) -> Config {
        serde_json::from_str(&format!(
            r#"{{"sync_dirs": [{{"source_path": "/a", "remote_root": "/r"}}],
                 "exclude_patterns": [{{"path": "/a", "globs": {}}}]}}"#,
            globs
        ))
        .unwrap()
    }

    #[test]
    fn test_glob_exclusion() {
        let config = config_with(r#"["*.tmp", "cache/**"]"#);
        let filter = ExclusionFilter::for_root(Path::new("/a"), &config, None).unwrap();
        assert!(filter.is_excluded(Path::new("/a/x.tmp")));
        assert!(filter.is_excluded(Path::new("/a/cache/blob")));
        assert!(!filter.is_excluded(Path::new("/a/x.txt")));
        assert!(!filter.is_excluded(Path::new("/a/sub/cache")));
    }

    #[test]
    fn test_internal_dirs_ignored_at_any_depth() {
        let config = config_with("[]");
        let filter = ExclusionFilter::for_root(Path::new("/a"), &config, None).unwrap();
        assert!(filter.is_excluded(Path::new("/a/.git")));
        assert!(filter.is_excluded(Path::new("/a/.git/config")));
        assert!(filter.is_excluded(Path::new("/a/sub/node_modules/pkg/index.js")));
        assert!(filter.is_excluded(Path::new("/a/.driftsync-trash/old")));
    }

    #[test]
    fn test_internal_files_ignored() {
        let config = config_with("[]");
        let filter = ExclusionFilter::for_root(Path::new("/a"), &config, None).unwrap();
        assert!(filter.is_excluded(Path::new("/a/.DS_Store")));
        assert!(filter.is_excluded(Path::new("/a/sub/.DS_Store")));
        assert!(filter.is_excluded(Path::new("/a/.driftsync-nodes.json")));
    }

    #[test]
    fn test_internal_names_do_not_match_substrings() {
        let config = config_with("[]");
        let filter = ExclusionFilter::for_root(Path::new("/a"), &config, None).unwrap();
        assert!(!filter.is_excluded(Path::new("/a/gitignore.txt")));
        assert!(!filter.is_excluded(Path::new("/a/my.git.notes")));
        // A directory named like an ignored file is still synced.
        assert!(!filter.is_excluded(Path::new("/a/.DS_Store.backup/f")));
    }

    #[test]
    fn test_state_dir_always_excluded() {
        let config = config_with("[]");
        let filter =
            ExclusionFilter::for_root(Path::new("/a"), &config, Some(Path::new("/a/.state")))
                .unwrap();
        assert!(filter.is_excluded(Path::new("/a/.state/state.db")));
        assert!(!filter.is_excluded(Path::new("/a/other")));
    }

    #[test]
    fn test_outside_root_excluded() {
        let config = config_with("[]");
        let filter = ExclusionFilter::for_root(Path::new("/a"), &config, None).unwrap();
        assert!(filter.is_excluded(Path::new("/b/file")));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = config_with(r#"["[unclosed"]"#);
        assert!(ExclusionFilter::for_root(Path::new("/a"), &config, None).is_err());
    }

    #[test]
    fn test_root_itself_not_excluded() {
        let config = config_with(r#"["**"]"#);
        let filter = ExclusionFilter::for_root(Path::new("/a"), &config, None).unwrap();
        assert!(!filter.is_excluded(Path::new("/a")));
    }
}
