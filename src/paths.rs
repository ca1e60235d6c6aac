//! Path mapping between local watch roots and the remote tree.
//!
//! Local paths are stored as UTF-8 strings with `/` separators (job table,
//! mapping table, token table all key on them). Remote paths are plain
//! `/`-separated strings rooted at the configured `remote_root`.

use crate::config::SyncDir;
use std::path::{Component, Path, PathBuf};

/// Render a local path the way the state store keys it.
pub fn local_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Find the watch root containing `local`, if any.
pub fn watch_root_for<'a>(local: &Path, dirs: &'a [SyncDir]) -> Option<&'a SyncDir> {
    dirs.iter().find(|d| local.starts_with(&d.source_path))
}

/// Whether `local` lives under any configured watch root.
pub fn is_under_any_root(local: &Path, dirs: &[SyncDir]) -> bool {
    watch_root_for(local, dirs).is_some()
}

/// Compute the remote path for a local path under its watch root.
///
/// The watch root mirrors as a folder named after its last component:
/// `source_path=/home/u/docs, remote_root=/backup` maps
/// `/home/u/docs/a/x.txt` to `/backup/docs/a/x.txt`.
pub fn remote_path_for(local: &Path, dir: &SyncDir) -> Option<String> {
    let rel = local.strip_prefix(&dir.source_path).ok()?;
    let root_name = dir
        .source_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut remote = String::from(dir.remote_root.trim_end_matches('/'));
    if !root_name.is_empty() {
        remote.push('/');
        remote.push_str(&root_name);
    }
    for component in rel.components() {
        if let Component::Normal(part) = component {
            remote.push('/');
            remote.push_str(&part.to_string_lossy());
        }
    }
    Some(remote)
}

/// Remote path for a root-relative path.
pub fn remote_path_for_rel(rel: &str, dir: &SyncDir) -> String {
    let local = dir.source_path.join(rel);
    remote_path_for(&local, dir).unwrap_or_else(|| {
        let mut remote = String::from(dir.remote_root.trim_end_matches('/'));
        remote.push('/');
        remote.push_str(rel);
        remote
    })
}

/// Parent of a `/`-separated path string, without trailing slash.
///
/// Returns `None` for the root (`"/"`) and for paths with no separator.
pub fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        if trimmed.len() > 1 {
            Some("/")
        } else {
            None
        }
    } else {
        Some(&trimmed[..idx])
    }
}

/// Last component of a `/`-separated path string.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Whether `path` is a strict descendant of `ancestor` (string keys).
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    let ancestor = ancestor.trim_end_matches('/');
    path.len() > ancestor.len() + 1
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Rewrite the `from` prefix of `path` to `to`. Exact matches rewrite to `to`.
pub fn rewrite_prefix(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    if is_descendant(path, from) {
        let rest = &path[from.trim_end_matches('/').len()..];
        return Some(format!("{}{}", to.trim_end_matches('/'), rest));
    }
    None
}

/// Reject paths with traversal components before they reach the store.
///
/// Watcher callbacks hand us paths from the OS; anything containing `..` or
/// resolving outside the root is dropped rather than mirrored.
pub fn is_within_root(path: &Path, root: &Path) -> bool {
    if !path.starts_with(root) {
        return false;
    }
    !path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
}

/// Root-relative `/`-separated key for a local path under `root`.
pub fn rel_key(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&part.to_string_lossy());
        }
    }
    Some(out)
}

/// Absolute local path for a root-relative key.
pub fn abs_for_rel(rel: &str, root: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}
