//! Change observation: snapshot diffing and batch materialization.
//!
//! The observer turns "something happened under this root" into the exact
//! set of mutations since the last persisted snapshot. It is the only
//! component that stats the filesystem; everything downstream works from
//! its [`ChangeRecord`]s.
//!
//! Delete records carry the inode remembered by the snapshot (the file is
//! gone, so the snapshot is the only place it can come from), which is what
//! lets the classifier pair a delete with the create of the same inode and
//! recognize a rename.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{Config, SyncDir};
use crate::filter::ExclusionFilter;
use crate::paths;
use crate::snapshot::{SnapEntry, Snapshot, SnapshotStore};

/// One filesystem mutation relative to the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Root-relative path, `/`-separated.
    pub rel_path: String,
    pub size: u64,
    pub mtime_ms: i64,
    /// Inode, or 0 when unknown.
    pub ino: u64,
    pub is_dir: bool,
    /// False for deletions.
    pub exists: bool,
    /// True when the path was absent from the snapshot (a create).
    pub is_new: bool,
}

/// All mutations observed for one root in one notification.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub root_index: usize,
    pub records: Vec<ChangeRecord>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct RootState {
    dir: SyncDir,
    filter: ExclusionFilter,
    current: Snapshot,
}

/// Snapshot-based incremental change observer for all configured roots.
pub struct Observer {
    snapshots: SnapshotStore,
    roots: Vec<RootState>,
}

impl Observer {
    /// Build the observer: compile filters and load persisted snapshots.
    pub fn new(config: &Config, state_dir: &Path) -> Result<Self> {
        let snapshots = SnapshotStore::new(state_dir);
        let mut roots = Vec::with_capacity(config.sync_dirs.len());
        for dir in &config.sync_dirs {
            let filter = ExclusionFilter::for_root(&dir.source_path, config, Some(state_dir))?;
            let current = snapshots.load(&dir.source_path)?.unwrap_or_default();
            roots.push(RootState {
                dir: dir.clone(),
                filter,
                current,
            });
        }
        Ok(Self { snapshots, roots })
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub fn root(&self, root_index: usize) -> &SyncDir {
        &self.roots[root_index].dir
    }

    /// Full diff of one root: disk versus snapshot.
    ///
    /// On first run (no snapshot) every entry surfaces as a create. Fails
    /// when the root directory is missing; proceeding would read an empty
    /// tree and mirror a mass deletion.
    pub fn initial_batch(&mut self, root_index: usize) -> Result<ChangeBatch> {
        let state = &self.roots[root_index];
        if !state.dir.source_path.is_dir() {
            bail!(
                "watch root does not exist: {}",
                state.dir.source_path.display()
            );
        }
        let disk = walk_tree(&state.dir.source_path, &state.dir.source_path, &state.filter);
        let mut records = BTreeMap::new();

        for (rel, entry) in &disk {
            diff_against_snapshot(rel, entry, state.current.entries.get(rel), &mut records);
        }
        for (rel, old) in &state.current.entries {
            if !disk.contains_key(rel) {
                insert_record(&mut records, delete_record(rel, old));
            }
        }

        debug!(
            root = %state.dir.source_path.display(),
            changes = records.len(),
            "initial scan complete"
        );
        Ok(ChangeBatch {
            root_index,
            records: records.into_values().collect(),
        })
    }

    /// Materialize change records for a debounced set of dirty paths.
    ///
    /// A dirty directory is expanded: its subtree is re-walked and diffed,
    /// so a directory rename yields the delete side (from the snapshot,
    /// with inodes) and the create side (from disk) for the directory and
    /// every descendant in the same batch.
    pub fn batch_from_dirty(&mut self, root_index: usize, dirty: &[PathBuf]) -> Result<ChangeBatch> {
        let state = &self.roots[root_index];
        let root = &state.dir.source_path;
        let mut records = BTreeMap::new();

        for path in dirty {
            if !paths::is_within_root(path, root) || state.filter.is_excluded(path) {
                continue;
            }
            let Some(rel) = paths::rel_key(path, root) else {
                continue;
            };
            if rel.is_empty() {
                // The root itself; only its contents matter.
                continue;
            }

            match scan_entry(path) {
                Some(entry) if entry.is_dir => {
                    match state.current.entries.get(&rel) {
                        None => insert_record(&mut records, create_record(&rel, &entry)),
                        Some(old) if !old.is_dir => {
                            // File replaced by a directory.
                            insert_record(&mut records, delete_record(&rel, old));
                            insert_record(&mut records, create_record(&rel, &entry));
                        }
                        Some(_) => {}
                    }
                    // Diff the whole subtree: renames into or out of this
                    // directory only dirtied the directory path itself.
                    let sub_disk = walk_tree(path, root, &state.filter);
                    for (sub_rel, sub_entry) in &sub_disk {
                        diff_against_snapshot(
                            sub_rel,
                            sub_entry,
                            state.current.entries.get(sub_rel),
                            &mut records,
                        );
                    }
                    for (snap_rel, old) in snapshot_under(&state.current, &rel) {
                        if !sub_disk.contains_key(snap_rel) {
                            insert_record(&mut records, delete_record(snap_rel, old));
                        }
                    }
                }
                Some(entry) => match state.current.entries.get(&rel) {
                    None => insert_record(&mut records, create_record(&rel, &entry)),
                    Some(old) if old.is_dir => {
                        // Directory replaced by a file: the subtree is gone.
                        insert_record(&mut records, delete_record(&rel, old));
                        for (snap_rel, old_entry) in snapshot_under(&state.current, &rel) {
                            insert_record(&mut records, delete_record(snap_rel, old_entry));
                        }
                        insert_record(&mut records, create_record(&rel, &entry));
                    }
                    Some(old) => {
                        if old.mtime_ms != entry.mtime_ms || old.size != entry.size {
                            insert_record(&mut records, update_record(&rel, &entry));
                        }
                    }
                },
                None => {
                    if let Some(old) = state.current.entries.get(&rel) {
                        insert_record(&mut records, delete_record(&rel, old));
                        if old.is_dir {
                            for (snap_rel, old_entry) in snapshot_under(&state.current, &rel) {
                                insert_record(&mut records, delete_record(snap_rel, old_entry));
                            }
                        }
                    }
                    // Created and deleted between notifications: unknown
                    // inode, nothing to pair, drop it.
                }
            }
        }

        Ok(ChangeBatch {
            root_index,
            records: records.into_values().collect(),
        })
    }

    /// Fold an accepted batch into the in-memory snapshot.
    pub fn apply_batch(&mut self, batch: &ChangeBatch) {
        let current = &mut self.roots[batch.root_index].current;
        for record in &batch.records {
            if record.exists {
                current.entries.insert(
                    record.rel_path.clone(),
                    SnapEntry {
                        ino: record.ino,
                        size: record.size,
                        mtime_ms: record.mtime_ms,
                        is_dir: record.is_dir,
                    },
                );
            } else {
                current.entries.remove(&record.rel_path);
                if record.is_dir {
                    let prefix = format!("{}/", record.rel_path);
                    current.entries.retain(|rel, _| !rel.starts_with(&prefix));
                }
            }
        }
    }

    /// Persist the current snapshot for one root.
    pub fn write_snapshot(&self, root_index: usize) -> Result<()> {
        let state = &self.roots[root_index];
        self.snapshots
            .save(&state.dir.source_path, &state.current)
            .with_context(|| {
                format!(
                    "failed to write snapshot for {}",
                    state.dir.source_path.display()
                )
            })
    }

    pub fn clear_snapshots(&self) -> Result<usize> {
        self.snapshots.clear_all()
    }

    /// Remove snapshot files belonging to roots that left the configuration.
    pub fn cleanup_orphan_snapshots(&self, config: &Config) -> Result<usize> {
        let roots: Vec<PathBuf> = config
            .sync_dirs
            .iter()
            .map(|d| d.source_path.clone())
            .collect();
        self.snapshots.cleanup_orphans(&roots)
    }
}

/// Keyed by (rel_path, exists) so a type change can hold both the delete and
/// the create for the same path. BTreeMap keeps output deterministic.
type RecordMap = BTreeMap<(String, bool), ChangeRecord>;

fn insert_record(records: &mut RecordMap, record: ChangeRecord) {
    records.insert((record.rel_path.clone(), record.exists), record);
}

fn create_record(rel: &str, entry: &SnapEntry) -> ChangeRecord {
    ChangeRecord {
        rel_path: rel.to_string(),
        size: entry.size,
        mtime_ms: entry.mtime_ms,
        ino: entry.ino,
        is_dir: entry.is_dir,
        exists: true,
        is_new: true,
    }
}

fn update_record(rel: &str, entry: &SnapEntry) -> ChangeRecord {
    ChangeRecord {
        is_new: false,
        ..create_record(rel, entry)
    }
}

fn delete_record(rel: &str, old: &SnapEntry) -> ChangeRecord {
    ChangeRecord {
        rel_path: rel.to_string(),
        size: 0,
        mtime_ms: 0,
        ino: old.ino,
        is_dir: old.is_dir,
        exists: false,
        is_new: false,
    }
}

fn diff_against_snapshot(
    rel: &str,
    entry: &SnapEntry,
    old: Option<&SnapEntry>,
    records: &mut RecordMap,
) {
    match old {
        None => insert_record(records, create_record(rel, entry)),
        Some(old) if old.is_dir != entry.is_dir => {
            insert_record(records, delete_record(rel, old));
            insert_record(records, create_record(rel, entry));
        }
        Some(old) => {
            // Directory metadata changes are not mirrored.
            if !entry.is_dir && (old.mtime_ms != entry.mtime_ms || old.size != entry.size) {
                insert_record(records, update_record(rel, entry));
            }
        }
    }
}

fn snapshot_under<'a>(
    snapshot: &'a Snapshot,
    rel: &str,
) -> impl Iterator<Item = (&'a String, &'a SnapEntry)> {
    let prefix = format!("{}/", rel);
    snapshot
        .entries
        .iter()
        .filter(move |(r, _)| r.starts_with(&prefix))
}

/// Stat one path into a snapshot entry. Symlinks and vanished paths yield
/// `None`.
fn scan_entry(path: &Path) -> Option<SnapEntry> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if meta.file_type().is_symlink() {
        return None;
    }
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let is_dir = meta.is_dir();
    Some(SnapEntry {
        ino: ino_of(&meta),
        size: if is_dir { 0 } else { meta.len() },
        mtime_ms,
        is_dir,
    })
}

#[cfg(unix)]
fn ino_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn ino_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Walk a subtree into rel-keyed entries, honoring exclusions. Walk errors
/// (permission, races) are logged and skipped; observation must not stop
/// the process.
fn walk_tree(start: &Path, root: &Path, filter: &ExclusionFilter) -> BTreeMap<String, SnapEntry> {
    let mut out = BTreeMap::new();
    let walker = WalkDir::new(start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !filter.is_excluded(e.path()));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%error, "skipping unreadable path during scan");
                continue;
            }
        };
        let Some(rel) = paths::rel_key(entry.path(), root) else {
            continue;
        };
        if rel.is_empty() {
            continue;
        }
        if let Some(snap) = scan_entry(entry.path()) {
            out.insert(rel, snap);
        }
    }
    out
}
