//! Batch classification: change records → job upserts.
//!
//! Turns each observer batch into the minimal set of queue writes:
//! suppresses events that do not change content, coalesces delete+create
//! pairs sharing an inode into RENAME/MOVE, promotes to DELETE_AND_CREATE
//! when content also changed or no mapping exists, and lets a directory
//! rename cover its children instead of emitting per-child jobs.
//!
//! Every surviving event commits in its own transaction touching job,
//! mapping and token rows together. The classifier performs no network I/O
//! and never hashes content; the `mtime:size` token is the content proxy.

use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;

use crate::config::Config;
use crate::observer::{ChangeBatch, ChangeRecord};
use crate::paths;
use crate::store::mappings::{self, change_token};
use crate::store::queue::{self, EventType, NewJob};
use crate::store::{now_ms, SyncStore};

/// What one batch turned into.
#[derive(Debug, Default)]
pub struct ClassifyOutcome {
    /// Jobs upserted (or, in dry-run, that would have been).
    pub planned: Vec<NewJob>,
    /// Events suppressed as already in sync.
    pub suppressed: usize,
}

/// One event with its local/remote addressing resolved.
#[derive(Debug, Clone)]
struct Ev {
    local: String,
    remote: String,
    size: u64,
    mtime_ms: i64,
    ino: u64,
    is_dir: bool,
    is_new: bool,
}

fn resolve(record: &ChangeRecord, config: &Config, root_index: usize) -> Ev {
    let dir = &config.sync_dirs[root_index];
    let abs = paths::abs_for_rel(&record.rel_path, &dir.source_path);
    Ev {
        local: paths::local_key(&abs),
        remote: paths::remote_path_for_rel(&record.rel_path, dir),
        size: record.size,
        mtime_ms: record.mtime_ms,
        ino: record.ino,
        is_dir: record.is_dir,
        is_new: record.is_new,
    }
}

/// Process one observer batch into job upserts.
///
/// In dry-run mode decisions are computed against live store state but
/// nothing is written; the returned plan is the only output.
pub fn process_batch(
    store: &mut SyncStore,
    config: &Config,
    batch: &ChangeBatch,
    dry_run: bool,
) -> Result<ClassifyOutcome> {
    let dirs = &config.sync_dirs;
    let mut outcome = ClassifyOutcome::default();
    let now = now_ms();

    let mut deletes = Vec::new();
    let mut creates = Vec::new();
    let mut updates = Vec::new();
    for record in &batch.records {
        let ev = resolve(record, config, batch.root_index);
        if record.exists {
            if ev.is_new {
                creates.push(ev);
            } else {
                updates.push(ev);
            }
        } else {
            deletes.push(ev);
        }
    }

    // Pair deletes and creates by inode. Inode 0 means unknown and never
    // pairs.
    let mut deletes_by_ino: HashMap<u64, Ev> = HashMap::new();
    for ev in deletes {
        if ev.ino != 0 && !deletes_by_ino.contains_key(&ev.ino) {
            deletes_by_ino.insert(ev.ino, ev);
        } else {
            emit_delete(store, dirs, &ev, now, dry_run, &mut outcome)?;
        }
    }

    let mut pairs: Vec<(Ev, Ev)> = Vec::new();
    let mut lone_creates = Vec::new();
    for ev in creates {
        let paired = if ev.ino != 0 {
            deletes_by_ino.remove(&ev.ino)
        } else {
            None
        };
        match paired {
            Some(from) => pairs.push((from, ev)),
            None => lone_creates.push(ev),
        }
    }

    // A directory rename covers its descendants atomically at the remote;
    // drop the per-child candidates it implies.
    let dir_rename_sources: Vec<String> = pairs
        .iter()
        .filter(|(from, _)| from.is_dir)
        .map(|(from, _)| from.local.clone())
        .collect();
    pairs.retain(|(from, _)| {
        !dir_rename_sources
            .iter()
            .any(|src| paths::is_descendant(&from.local, src))
    });

    for (from, to) in pairs {
        emit_pair(store, config, &from, &to, now, dry_run, &mut outcome)?;
    }

    for ev in deletes_by_ino.into_values() {
        emit_delete(store, dirs, &ev, now, dry_run, &mut outcome)?;
    }

    for ev in lone_creates {
        emit_create(store, dirs, &ev, now, dry_run, &mut outcome)?;
    }

    for ev in updates {
        emit_update(store, dirs, &ev, now, dry_run, &mut outcome)?;
    }

    debug!(
        root_index = batch.root_index,
        planned = outcome.planned.len(),
        suppressed = outcome.suppressed,
        dry_run,
        "classified batch"
    );
    Ok(outcome)
}

/// Rename candidate: RENAME/MOVE when the mapping is intact and content is
/// unchanged, DELETE_AND_CREATE otherwise.
fn emit_pair(
    store: &mut SyncStore,
    config: &Config,
    from: &Ev,
    to: &Ev,
    now: i64,
    dry_run: bool,
    outcome: &mut ClassifyOutcome,
) -> Result<()> {
    let mapping = store.get_mapping(&from.local)?;
    let to_token = (!to.is_dir).then(|| change_token(to.mtime_ms, to.size));
    let content_changed = if from.is_dir {
        false
    } else {
        store.get_token(&from.local)?.as_deref() != to_token.as_deref()
    };

    if mapping.is_none() || content_changed {
        let job = NewJob {
            event_type: EventType::DeleteAndCreate,
            local_path: to.local.clone(),
            remote_path: to.remote.clone(),
            change_token: to_token,
            old_local_path: Some(from.local.clone()),
            old_remote_path: Some(from.remote.clone()),
        };
        outcome.planned.push(job.clone());
        if !dry_run {
            let from_local = from.local.clone();
            let is_dir = from.is_dir;
            store.with_tx(|tx| {
                queue::enqueue(tx, &job, &config.sync_dirs, now)?;
                if is_dir {
                    mappings::delete_mappings_under(tx, &from_local)?;
                    mappings::delete_tokens_under(tx, &from_local)?;
                } else {
                    mappings::delete_mapping(tx, &from_local)?;
                    mappings::delete_token(tx, &from_local)?;
                }
                Ok(())
            })?;
        }
        return Ok(());
    }

    let event_type = if paths::parent_of(&from.local) == paths::parent_of(&to.local) {
        EventType::Rename
    } else {
        EventType::Move
    };
    let job = NewJob {
        event_type,
        local_path: to.local.clone(),
        remote_path: to.remote.clone(),
        change_token: to_token,
        old_local_path: Some(from.local.clone()),
        old_remote_path: Some(from.remote.clone()),
    };
    outcome.planned.push(job.clone());
    if !dry_run {
        let (from_local, from_remote) = (from.local.clone(), from.remote.clone());
        let (to_local, to_remote) = (to.local.clone(), to.remote.clone());
        let is_dir = from.is_dir;
        store.with_tx(|tx| {
            queue::enqueue(tx, &job, &config.sync_dirs, now)?;
            if is_dir {
                // Re-key the whole subtree so later child operations target
                // the right nodes whether or not the rename has executed.
                mappings::rewrite_mapping_prefix(tx, &from_local, &to_local, &from_remote, &to_remote)?;
                mappings::rewrite_token_prefix(tx, &from_local, &to_local)?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn emit_delete(
    store: &mut SyncStore,
    dirs: &[crate::config::SyncDir],
    ev: &Ev,
    now: i64,
    dry_run: bool,
    outcome: &mut ClassifyOutcome,
) -> Result<()> {
    let job = NewJob {
        event_type: EventType::Delete,
        local_path: ev.local.clone(),
        remote_path: ev.remote.clone(),
        change_token: None,
        old_local_path: None,
        old_remote_path: None,
    };
    outcome.planned.push(job.clone());
    if !dry_run {
        let local = ev.local.clone();
        let is_dir = ev.is_dir;
        store.with_tx(|tx| {
            queue::enqueue(tx, &job, dirs, now)?;
            if is_dir {
                mappings::delete_mappings_under(tx, &local)?;
                mappings::delete_tokens_under(tx, &local)?;
            } else {
                mappings::delete_mapping(tx, &local)?;
                mappings::delete_token(tx, &local)?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn emit_create(
    store: &mut SyncStore,
    dirs: &[crate::config::SyncDir],
    ev: &Ev,
    now: i64,
    dry_run: bool,
    outcome: &mut ClassifyOutcome,
) -> Result<()> {
    if ev.is_dir {
        if store.get_mapping(&ev.local)?.is_some() {
            outcome.suppressed += 1;
            return Ok(());
        }
    } else {
        let token = change_token(ev.mtime_ms, ev.size);
        if store.get_token(&ev.local)?.as_deref() == Some(token.as_str()) {
            outcome.suppressed += 1;
            return Ok(());
        }
    }

    let job = NewJob {
        event_type: if ev.is_dir {
            EventType::CreateDir
        } else {
            EventType::CreateFile
        },
        local_path: ev.local.clone(),
        remote_path: ev.remote.clone(),
        change_token: (!ev.is_dir).then(|| change_token(ev.mtime_ms, ev.size)),
        old_local_path: None,
        old_remote_path: None,
    };
    outcome.planned.push(job.clone());
    if !dry_run {
        store.with_tx(|tx| {
            queue::enqueue(tx, &job, dirs, now)?;
            Ok(())
        })?;
    }
    Ok(())
}

fn emit_update(
    store: &mut SyncStore,
    dirs: &[crate::config::SyncDir],
    ev: &Ev,
    now: i64,
    dry_run: bool,
    outcome: &mut ClassifyOutcome,
) -> Result<()> {
    // Directory metadata updates are not mirrored.
    if ev.is_dir {
        outcome.suppressed += 1;
        return Ok(());
    }
    let token = change_token(ev.mtime_ms, ev.size);
    if store.get_token(&ev.local)?.as_deref() == Some(token.as_str()) {
        outcome.suppressed += 1;
        return Ok(());
    }

    let job = NewJob {
        event_type: EventType::Update,
        local_path: ev.local.clone(),
        remote_path: ev.remote.clone(),
        change_token: Some(token),
        old_local_path: None,
        old_remote_path: None,
    };
    outcome.planned.push(job.clone());
    if !dry_run {
        store.with_tx(|tx| {
            queue::enqueue(tx, &job, dirs, now)?;
            Ok(())
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ChangeRecord;
    use crate::store::mappings::{get_mapping, get_token, put_mapping, put_token, NodeMapping};
    use crate::store::queue::{get_by_path_pair, list_jobs, JobStatus};

    fn config() -> Config {
        serde_json::from_str(r#"{"sync_dirs": [{"source_path": "/a", "remote_root": "/R"}]}"#)
            .unwrap()
    }

    fn open_store() -> (tempfile::TempDir, SyncStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SyncStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn file_create(rel: &str, ino: u64, mtime_ms: i64, size: u64) -> ChangeRecord {
        ChangeRecord {
            rel_path: rel.to_string(),
            size,
            mtime_ms,
            ino,
            is_dir: false,
            exists: true,
            is_new: true,
        }
    }

    fn file_update(rel: &str, ino: u64, mtime_ms: i64, size: u64) -> ChangeRecord {
        ChangeRecord {
            is_new: false,
            ..file_create(rel, ino, mtime_ms, size)
        }
    }

    fn deletion(rel: &str, ino: u64, is_dir: bool) -> ChangeRecord {
        ChangeRecord {
            rel_path: rel.to_string(),
            size: 0,
            mtime_ms: 0,
            ino,
            is_dir,
            exists: false,
            is_new: false,
        }
    }

    fn dir_create(rel: &str, ino: u64) -> ChangeRecord {
        ChangeRecord {
            rel_path: rel.to_string(),
            size: 0,
            mtime_ms: 0,
            ino,
            is_dir: true,
            exists: true,
            is_new: true,
        }
    }

    fn batch(records: Vec<ChangeRecord>) -> ChangeBatch {
        ChangeBatch {
            root_index: 0,
            records,
        }
    }

    fn mapping(local: &str, remote: &str, is_dir: bool) -> NodeMapping {
        NodeMapping {
            local_path: local.to_string(),
            remote_path: remote.to_string(),
            node_uid: format!("uid:{}", local),
            parent_node_uid: "uid:parent".to_string(),
            is_directory: is_dir,
        }
    }

    #[test]
    fn test_create_file_job() {
        let (_dir, mut store) = open_store();
        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![file_create("x.txt", 42, 1000, 5)]),
            false,
        )
        .unwrap();

        assert_eq!(outcome.planned.len(), 1);
        let job = get_by_path_pair(store.conn(), "/a/x.txt", "/R/a/x.txt")
            .unwrap()
            .unwrap();
        assert_eq!(job.event_type, EventType::CreateFile);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.change_token.as_deref(), Some("1000:5"));
    }

    #[test]
    fn test_create_suppressed_when_token_matches() {
        let (_dir, mut store) = open_store();
        put_token(store.conn(), "/a/x.txt", "1000:5", 0).unwrap();

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![file_create("x.txt", 42, 1000, 5)]),
            false,
        )
        .unwrap();

        assert!(outcome.planned.is_empty());
        assert_eq!(outcome.suppressed, 1);
        assert!(list_jobs(store.conn(), None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_dir_create_suppressed_when_mapped() {
        let (_dir, mut store) = open_store();
        put_mapping(store.conn(), &mapping("/a/d", "/R/a/d", true), 0).unwrap();

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![dir_create("d", 7)]),
            false,
        )
        .unwrap();
        assert!(outcome.planned.is_empty());
        assert_eq!(outcome.suppressed, 1);
    }

    #[test]
    fn test_update_suppressed_when_token_matches() {
        let (_dir, mut store) = open_store();
        put_token(store.conn(), "/a/x.txt", "1000:5", 0).unwrap();

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![file_update("x.txt", 42, 1000, 5)]),
            false,
        )
        .unwrap();
        assert!(outcome.planned.is_empty());

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![file_update("x.txt", 42, 2000, 9)]),
            false,
        )
        .unwrap();
        assert_eq!(outcome.planned.len(), 1);
        assert_eq!(outcome.planned[0].event_type, EventType::Update);
        assert_eq!(outcome.planned[0].change_token.as_deref(), Some("2000:9"));
    }

    #[test]
    fn test_pure_rename_detected() {
        let (_dir, mut store) = open_store();
        put_mapping(store.conn(), &mapping("/a/x.txt", "/R/a/x.txt", false), 0).unwrap();
        put_token(store.conn(), "/a/x.txt", "1000:5", 0).unwrap();

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![
                deletion("x.txt", 42, false),
                file_create("y.txt", 42, 1000, 5),
            ]),
            false,
        )
        .unwrap();

        assert_eq!(outcome.planned.len(), 1);
        let job = &outcome.planned[0];
        assert_eq!(job.event_type, EventType::Rename);
        assert_eq!(job.local_path, "/a/y.txt");
        assert_eq!(job.old_local_path.as_deref(), Some("/a/x.txt"));
        assert_eq!(job.old_remote_path.as_deref(), Some("/R/a/x.txt"));
    }

    #[test]
    fn test_move_detected_across_parents() {
        let (_dir, mut store) = open_store();
        put_mapping(store.conn(), &mapping("/a/x.txt", "/R/a/x.txt", false), 0).unwrap();
        put_token(store.conn(), "/a/x.txt", "1000:5", 0).unwrap();

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![
                deletion("x.txt", 42, false),
                file_create("sub/x.txt", 42, 1000, 5),
            ]),
            false,
        )
        .unwrap();

        assert_eq!(outcome.planned.len(), 1);
        assert_eq!(outcome.planned[0].event_type, EventType::Move);
    }

    #[test]
    fn test_rename_with_content_change_promotes() {
        let (_dir, mut store) = open_store();
        put_mapping(store.conn(), &mapping("/a/x.txt", "/R/a/x.txt", false), 0).unwrap();
        put_token(store.conn(), "/a/x.txt", "1000:5", 0).unwrap();

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![
                deletion("x.txt", 42, false),
                file_create("y.txt", 42, 2000, 9),
            ]),
            false,
        )
        .unwrap();

        assert_eq!(outcome.planned.len(), 1);
        let job = &outcome.planned[0];
        assert_eq!(job.event_type, EventType::DeleteAndCreate);
        assert_eq!(job.change_token.as_deref(), Some("2000:9"));
        assert_eq!(job.old_remote_path.as_deref(), Some("/R/a/x.txt"));

        // Old identity is gone.
        assert!(get_mapping(store.conn(), "/a/x.txt").unwrap().is_none());
        assert!(get_token(store.conn(), "/a/x.txt").unwrap().is_none());
    }

    #[test]
    fn test_rename_without_mapping_promotes() {
        let (_dir, mut store) = open_store();
        put_token(store.conn(), "/a/x.txt", "1000:5", 0).unwrap();

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![
                deletion("x.txt", 42, false),
                file_create("y.txt", 42, 1000, 5),
            ]),
            false,
        )
        .unwrap();
        assert_eq!(outcome.planned[0].event_type, EventType::DeleteAndCreate);
    }

    #[test]
    fn test_dir_rename_covers_children() {
        let (_dir, mut store) = open_store();
        put_mapping(store.conn(), &mapping("/a/d", "/R/a/d", true), 0).unwrap();
        put_mapping(store.conn(), &mapping("/a/d/f1", "/R/a/d/f1", false), 0).unwrap();
        put_mapping(store.conn(), &mapping("/a/d/f2", "/R/a/d/f2", false), 0).unwrap();
        put_token(store.conn(), "/a/d/f1", "1:1", 0).unwrap();
        put_token(store.conn(), "/a/d/f2", "2:2", 0).unwrap();

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![
                deletion("d", 10, true),
                deletion("d/f1", 11, false),
                deletion("d/f2", 12, false),
                dir_create("e", 10),
                file_create("e/f1", 11, 1, 1),
                file_create("e/f2", 12, 2, 2),
            ]),
            false,
        )
        .unwrap();

        // Exactly one RENAME; no child jobs.
        assert_eq!(outcome.planned.len(), 1);
        assert_eq!(outcome.planned[0].event_type, EventType::Rename);
        assert_eq!(list_jobs(store.conn(), None, 10).unwrap().len(), 1);

        // Descendant mappings and tokens re-keyed in the same pass.
        let m = get_mapping(store.conn(), "/a/e/f1").unwrap().unwrap();
        assert_eq!(m.remote_path, "/R/a/e/f1");
        assert_eq!(m.node_uid, "uid:/a/d/f1");
        assert_eq!(
            get_token(store.conn(), "/a/e/f2").unwrap().as_deref(),
            Some("2:2")
        );
        assert!(get_mapping(store.conn(), "/a/d/f1").unwrap().is_none());
        assert!(get_token(store.conn(), "/a/d/f1").unwrap().is_none());
    }

    #[test]
    fn test_delete_drops_identity_recursively() {
        let (_dir, mut store) = open_store();
        put_mapping(store.conn(), &mapping("/a/d", "/R/a/d", true), 0).unwrap();
        put_mapping(store.conn(), &mapping("/a/d/f1", "/R/a/d/f1", false), 0).unwrap();
        put_token(store.conn(), "/a/d/f1", "1:1", 0).unwrap();

        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![deletion("d", 10, true), deletion("d/f1", 11, false)]),
            false,
        )
        .unwrap();

        // Both deletes survive (no creates to pair with).
        assert_eq!(outcome.planned.len(), 2);
        assert!(outcome
            .planned
            .iter()
            .all(|j| j.event_type == EventType::Delete));
        assert!(get_mapping(store.conn(), "/a/d/f1").unwrap().is_none());
        assert!(get_token(store.conn(), "/a/d/f1").unwrap().is_none());
    }

    #[test]
    fn test_unknown_inode_delete_does_not_pair() {
        let (_dir, mut store) = open_store();
        // ino 0 on both sides must not form a rename candidate.
        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![
                deletion("x.txt", 0, false),
                file_create("y.txt", 0, 1000, 5),
            ]),
            false,
        )
        .unwrap();

        assert_eq!(outcome.planned.len(), 2);
        let types: Vec<_> = outcome.planned.iter().map(|j| j.event_type).collect();
        assert!(types.contains(&EventType::Delete));
        assert!(types.contains(&EventType::CreateFile));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let (_dir, mut store) = open_store();
        let outcome = process_batch(
            &mut store,
            &config(),
            &batch(vec![file_create("x.txt", 42, 1000, 5)]),
            true,
        )
        .unwrap();

        assert_eq!(outcome.planned.len(), 1);
        assert!(list_jobs(store.conn(), None, 10).unwrap().is_empty());
    }
}
