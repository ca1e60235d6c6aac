//! Per-watch-root filesystem snapshots.
//!
//! A snapshot is the observer's record of what a watch root looked like the
//! last time a batch was successfully enqueued. Diffing disk against it
//! yields the exact change set, including everything that happened while the
//! process was down. Snapshots live in `<state_dir>/snapshots/`, one file
//! per root, named by a stable hash of the root path so roots can come and
//! go without coordination.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Length of the hex prefix used in snapshot filenames.
const HASH_PREFIX_LEN: usize = 16;

const SNAPSHOT_EXT: &str = "snapshot";

const SNAPSHOT_VERSION: u32 = 1;

/// One filesystem entry as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapEntry {
    pub ino: u64,
    pub size: u64,
    pub mtime_ms: i64,
    pub is_dir: bool,
}

/// Contents of one watch root, keyed by root-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub entries: BTreeMap<String, SnapEntry>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    root: String,
    entries: BTreeMap<String, SnapEntry>,
}

/// Directory of snapshot files.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("snapshots"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic filename for a watch root: `sha256(path)[:16].snapshot`.
    pub fn file_name(root: &Path) -> String {
        let digest = Sha256::digest(root.to_string_lossy().as_bytes());
        format!("{}.{}", &hex::encode(digest)[..HASH_PREFIX_LEN], SNAPSHOT_EXT)
    }

    pub fn path_for(&self, root: &Path) -> PathBuf {
        self.dir.join(Self::file_name(root))
    }

    /// Load the snapshot for a root.
    ///
    /// Returns `Ok(None)` when no snapshot exists or the file is corrupted;
    /// a corrupted snapshot is deleted so the caller falls back to a full
    /// rescan instead of failing forever.
    pub fn load(&self, root: &Path) -> Result<Option<Snapshot>> {
        let path = self.path_for(root);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read snapshot {}", path.display()))
            }
        };
        match serde_json::from_slice::<SnapshotFile>(&raw) {
            Ok(file) if file.version == SNAPSHOT_VERSION => Ok(Some(Snapshot {
                entries: file.entries,
            })),
            Ok(file) => {
                warn!(
                    snapshot = %path.display(),
                    version = file.version,
                    "snapshot version mismatch, forcing full rescan"
                );
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
            Err(e) => {
                warn!(
                    snapshot = %path.display(),
                    error = %e,
                    "corrupted snapshot, forcing full rescan"
                );
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    /// Persist the snapshot for a root. Write-then-rename so a crash cannot
    /// leave a truncated file behind.
    pub fn save(&self, root: &Path, snapshot: &Snapshot) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create snapshot directory {}", self.dir.display())
        })?;
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            root: root.to_string_lossy().to_string(),
            entries: snapshot.entries.clone(),
        };
        let raw = serde_json::to_vec(&file).context("failed to serialize snapshot")?;
        let path = self.path_for(root);
        let tmp = path.with_extension("snapshot.tmp");
        std::fs::write(&tmp, raw)
            .with_context(|| format!("failed to write snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move snapshot into place {}", path.display()))?;
        Ok(())
    }

    /// Delete every snapshot file. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize> {
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to list snapshot directory {}", self.dir.display())
                })
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == SNAPSHOT_EXT) {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove snapshot {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove snapshot files whose hash matches no configured watch root.
    pub fn cleanup_orphans(&self, roots: &[PathBuf]) -> Result<usize> {
        let keep: Vec<String> = roots.iter().map(|r| Self::file_name(r)).collect();
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to list snapshot directory {}", self.dir.display())
                })
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == SNAPSHOT_EXT) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !keep.contains(&name) {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove snapshot {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> Snapshot {
        let mut entries = BTreeMap::new();
        entries.insert(
            "x.txt".to_string(),
            SnapEntry {
                ino: 42,
                size: 5,
                mtime_ms: 1000,
                is_dir: false,
            },
        );
        entries.insert(
            "d".to_string(),
            SnapEntry {
                ino: 43,
                size: 0,
                mtime_ms: 900,
                is_dir: true,
            },
        );
        Snapshot { entries }
    }

    #[test]
    fn test_file_name_is_hash_prefix() {
        let name = SnapshotStore::file_name(Path::new("/a"));
        assert_eq!(name.len(), HASH_PREFIX_LEN + 1 + SNAPSHOT_EXT.len());
        assert!(name.ends_with(".snapshot"));
        // Deterministic
        assert_eq!(name, SnapshotStore::file_name(Path::new("/a")));
        assert_ne!(name, SnapshotStore::file_name(Path::new("/b")));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let snapshot = sample_snapshot();
        store.save(Path::new("/a"), &snapshot).unwrap();
        let loaded = store.load(Path::new("/a")).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.load(Path::new("/a")).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_snapshot_removed_and_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        std::fs::create_dir_all(store.dir()).unwrap();
        let path = store.path_for(Path::new("/a"));
        std::fs::write(&path, b"not json at all").unwrap();

        assert!(store.load(Path::new("/a")).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_cleanup_orphans_keeps_configured_roots() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(Path::new("/a"), &sample_snapshot()).unwrap();
        store.save(Path::new("/b"), &sample_snapshot()).unwrap();

        let removed = store
            .cleanup_orphans(&[PathBuf::from("/a")])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.path_for(Path::new("/a")).exists());
        assert!(!store.path_for(Path::new("/b")).exists());

        // Every surviving file matches a configured root's hash.
        for entry in std::fs::read_dir(store.dir()).unwrap().flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".snapshot") {
                assert_eq!(name, SnapshotStore::file_name(Path::new("/a")));
            }
        }
    }

    #[test]
    fn test_clear_all() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(Path::new("/a"), &sample_snapshot()).unwrap();
        store.save(Path::new("/b"), &sample_snapshot()).unwrap();
        assert_eq!(store.clear_all().unwrap(), 2);
        assert_eq!(store.clear_all().unwrap(), 0);
    }
}
