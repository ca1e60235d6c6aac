//! Job execution against the remote driver.
//!
//! The engine thread prepares an [`Assignment`] (job plus the mappings it
//! needs), hands it to a worker thread which calls the driver, and commits
//! the returned [`TaskOutcome`] back into the store. Workers never touch the
//! store; all state mutation stays on the engine thread.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use crate::config::Config;
use crate::driver::RemoteDriver;
use crate::filter::ExclusionFilter;
use crate::paths;
use crate::retry::{classify, ErrorCategory};
use crate::store::mappings::{self, change_token, NodeMapping};
use crate::store::queue::{self, EventType, Job, NewJob};
use crate::store::SyncStore;

/// Everything a worker needs to run one job without store access.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job: Job,
    /// Mapping for `job.local_path`, when one exists.
    pub mapping: Option<NodeMapping>,
    /// Mapping for the rename/move source. For directory renames the
    /// classifier already re-keyed it to the new path, so the lookup falls
    /// back there.
    pub old_mapping: Option<NodeMapping>,
    pub trash_only: bool,
}

/// Successful remote effect, with whatever the commit needs to record.
#[derive(Debug, Clone)]
pub enum Applied {
    Created {
        node_uid: String,
        parent_uid: String,
        is_dir: bool,
    },
    Updated,
    Deleted,
    Relocated {
        node_uid: String,
        parent_uid: String,
        is_dir: bool,
    },
}

/// What a worker hands back to the engine thread.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub job: Job,
    pub result: Result<Applied, String>,
}

/// How an outcome was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    Synced,
    Retried { retry_at: i64 },
    Blocked,
}

/// Resolve the mappings a job needs before dispatch.
pub fn prepare_assignment(store: &SyncStore, job: Job, config: &Config) -> Result<Assignment> {
    let mapping = store.get_mapping(&job.local_path)?;
    let old_mapping = match job.old_local_path.as_deref() {
        Some(old_local) => match store.get_mapping(old_local)? {
            Some(m) => Some(m),
            None => mapping.clone(),
        },
        None => None,
    };
    Ok(Assignment {
        job,
        mapping,
        old_mapping,
        trash_only: config.remote_delete_behavior == crate::config::RemoteDeleteBehavior::Trash,
    })
}

/// Run one job to a terminal task result, including the compensating
/// delete-then-recreate for an exhausted REUPLOAD_NEEDED failure.
pub fn run_task(driver: &dyn RemoteDriver, assignment: &Assignment) -> TaskOutcome {
    let result = match execute(driver, assignment) {
        Ok(applied) => Ok(applied),
        Err(error) => {
            let category = classify(&error);
            if category == ErrorCategory::ReuploadNeeded
                && category.is_exhausted(assignment.job.n_retries)
                && assignment.job.event_type != EventType::Delete
            {
                warn!(
                    local_path = %assignment.job.local_path,
                    %error,
                    "remote diverged, compensating with delete-then-recreate"
                );
                compensate(driver, assignment)
            } else {
                Err(error)
            }
        }
    };
    TaskOutcome {
        job: assignment.job.clone(),
        result,
    }
}

fn execute(driver: &dyn RemoteDriver, assignment: &Assignment) -> Result<Applied, String> {
    let job = &assignment.job;
    match job.event_type {
        EventType::CreateFile => create_file_at(driver, &job.local_path, &job.remote_path),
        EventType::CreateDir => create_folder_at(driver, &job.remote_path),
        EventType::Update => match &assignment.mapping {
            Some(mapping) => {
                let local = Path::new(&job.local_path);
                if !local.exists() {
                    return Err(format!("local path not found: {}", job.local_path));
                }
                driver
                    .upload_revision(&mapping.node_uid, local)
                    .map_err(|e| e.0)?;
                Ok(Applied::Updated)
            }
            // Nothing known remotely; an update of nothing is a create.
            None => create_file_at(driver, &job.local_path, &job.remote_path),
        },
        EventType::Delete => {
            let outcome = driver
                .delete(&job.remote_path, assignment.trash_only)
                .map_err(|e| e.0)?;
            if !outcome.existed {
                info!(remote_path = %job.remote_path, "delete target already gone");
            }
            Ok(Applied::Deleted)
        }
        EventType::Rename => {
            let mapping = assignment
                .old_mapping
                .as_ref()
                .ok_or("file or folder not found")?;
            driver
                .rename(&mapping.node_uid, paths::base_name(&job.remote_path))
                .map_err(|e| e.0)?;
            Ok(Applied::Relocated {
                node_uid: mapping.node_uid.clone(),
                parent_uid: mapping.parent_node_uid.clone(),
                is_dir: mapping.is_directory,
            })
        }
        EventType::Move => {
            let mapping = assignment
                .old_mapping
                .as_ref()
                .ok_or("file or folder not found")?;
            let parent_uid = driver
                .ensure_path_folders(&job.remote_path)
                .map_err(|e| e.0)?;
            driver
                .move_node(
                    &mapping.node_uid,
                    &parent_uid,
                    paths::base_name(&job.remote_path),
                )
                .map_err(|e| e.0)?;
            Ok(Applied::Relocated {
                node_uid: mapping.node_uid.clone(),
                parent_uid,
                is_dir: mapping.is_directory,
            })
        }
        EventType::DeleteAndCreate => {
            if let Some(old_remote) = &job.old_remote_path {
                driver
                    .delete(old_remote, assignment.trash_only)
                    .map_err(|e| e.0)?;
            }
            create_local_shape(driver, &job.local_path, &job.remote_path)
        }
    }
}

fn create_file_at(
    driver: &dyn RemoteDriver,
    local_path: &str,
    remote_path: &str,
) -> Result<Applied, String> {
    let local = Path::new(local_path);
    if !local.is_file() {
        return Err(format!("local path not found: {}", local_path));
    }
    let parent_uid = driver.ensure_path_folders(remote_path).map_err(|e| e.0)?;
    let node_uid = driver
        .create_file(&parent_uid, paths::base_name(remote_path), local)
        .map_err(|e| e.0)?;
    Ok(Applied::Created {
        node_uid,
        parent_uid,
        is_dir: false,
    })
}

fn create_folder_at(driver: &dyn RemoteDriver, remote_path: &str) -> Result<Applied, String> {
    let parent_uid = driver.ensure_path_folders(remote_path).map_err(|e| e.0)?;
    let node_uid = driver
        .create_folder(&parent_uid, paths::base_name(remote_path))
        .map_err(|e| e.0)?;
    Ok(Applied::Created {
        node_uid,
        parent_uid,
        is_dir: true,
    })
}

/// Create whatever currently exists at the local path.
fn create_local_shape(
    driver: &dyn RemoteDriver,
    local_path: &str,
    remote_path: &str,
) -> Result<Applied, String> {
    let local = Path::new(local_path);
    if local.is_dir() {
        create_folder_at(driver, remote_path)
    } else {
        create_file_at(driver, local_path, remote_path)
    }
}

/// Compensating action for an exhausted REUPLOAD_NEEDED failure: clear the
/// diverged remote state at both addresses, then recreate from local truth.
fn compensate(driver: &dyn RemoteDriver, assignment: &Assignment) -> Result<Applied, String> {
    let job = &assignment.job;
    driver
        .delete(&job.remote_path, assignment.trash_only)
        .map_err(|e| e.0)?;
    if let Some(old_remote) = &job.old_remote_path {
        if old_remote != &job.remote_path {
            driver
                .delete(old_remote, assignment.trash_only)
                .map_err(|e| e.0)?;
        }
    }
    create_local_shape(driver, &job.local_path, &job.remote_path)
}

/// Commit one task outcome: job status plus mapping/token effects in a
/// single transaction.
pub fn commit_outcome(
    store: &mut SyncStore,
    outcome: &TaskOutcome,
    now: i64,
) -> Result<CommitAction> {
    let job = &outcome.job;
    match &outcome.result {
        Ok(applied) => {
            let applied = applied.clone();
            store.with_tx(|tx| {
                queue::mark_synced(tx, job.id, &job.local_path, now)?;
                match applied {
                    Applied::Created {
                        node_uid,
                        parent_uid,
                        is_dir,
                    } => {
                        mappings::put_mapping(
                            tx,
                            &NodeMapping {
                                local_path: job.local_path.clone(),
                                remote_path: job.remote_path.clone(),
                                node_uid,
                                parent_node_uid: parent_uid,
                                is_directory: is_dir,
                            },
                            now,
                        )?;
                        if let Some(token) = &job.change_token {
                            if !is_dir {
                                mappings::put_token(tx, &job.local_path, token, now)?;
                            }
                        }
                    }
                    Applied::Updated => {
                        if let Some(token) = &job.change_token {
                            mappings::put_token(tx, &job.local_path, token, now)?;
                        }
                    }
                    Applied::Deleted => {
                        mappings::delete_mappings_under(tx, &job.local_path)?;
                        mappings::delete_tokens_under(tx, &job.local_path)?;
                    }
                    Applied::Relocated {
                        node_uid,
                        parent_uid,
                        is_dir,
                    } => {
                        if let Some(old_local) = &job.old_local_path {
                            // File renames leave the old keys behind; for
                            // directories the classifier already re-keyed.
                            mappings::delete_mapping(tx, old_local)?;
                            if let Some(token) = &job.change_token {
                                mappings::delete_token(tx, old_local)?;
                                mappings::put_token(tx, &job.local_path, token, now)?;
                            }
                        }
                        mappings::put_mapping(
                            tx,
                            &NodeMapping {
                                local_path: job.local_path.clone(),
                                remote_path: job.remote_path.clone(),
                                node_uid,
                                parent_node_uid: parent_uid,
                                is_directory: is_dir,
                            },
                            now,
                        )?;
                    }
                }
                Ok(())
            })?;
            info!(
                event = %job.event_type,
                local_path = %job.local_path,
                remote_path = %job.remote_path,
                "synced"
            );
            Ok(CommitAction::Synced)
        }
        Err(error) => {
            let category = classify(error);
            if category.is_exhausted(job.n_retries) {
                store.with_tx(|tx| queue::mark_blocked(tx, job.id, &job.local_path, error))?;
                warn!(
                    event = %job.event_type,
                    local_path = %job.local_path,
                    %error,
                    "job blocked, operator intervention required"
                );
                Ok(CommitAction::Blocked)
            } else {
                let retry_at = store.with_tx(|tx| {
                    queue::schedule_retry(
                        tx,
                        job.id,
                        &job.local_path,
                        category,
                        job.n_retries,
                        error,
                        now,
                    )
                })?;
                warn!(
                    event = %job.event_type,
                    local_path = %job.local_path,
                    %error,
                    retry_in_ms = retry_at - now,
                    "job failed, retry scheduled"
                );
                Ok(CommitAction::Retried { retry_at })
            }
        }
    }
}

/// After a CREATE_DIR syncs, enqueue its children so initial sync and
/// post-rename recovery bootstrap themselves one directory level at a time.
pub fn enqueue_dir_children(
    store: &mut SyncStore,
    config: &Config,
    local_path: &str,
    state_dir: &Path,
    now: i64,
) -> Result<usize> {
    let local = Path::new(local_path);
    let Some(dir) = paths::watch_root_for(local, &config.sync_dirs) else {
        return Ok(0);
    };
    let dir = dir.clone();
    let filter = ExclusionFilter::for_root(&dir.source_path, config, Some(state_dir))?;

    let entries = match std::fs::read_dir(local) {
        Ok(entries) => entries,
        // Directory vanished again; the delete event will follow.
        Err(_) => return Ok(0),
    };

    let mut enqueued = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if filter.is_excluded(&path) {
            continue;
        }
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        let child_local = paths::local_key(&path);
        let Some(child_remote) = paths::remote_path_for(&path, &dir) else {
            continue;
        };

        // A live job row already covers this child; re-upserting it would
        // reset in-flight work and duplicate uploads.
        if let Some(existing) = queue::get_by_path_pair(store.conn(), &child_local, &child_remote)?
        {
            if matches!(
                existing.status,
                crate::store::JobStatus::Pending | crate::store::JobStatus::Processing
            ) {
                continue;
            }
        }

        if meta.is_dir() {
            if store.get_mapping(&child_local)?.is_none() {
                let job = NewJob::new(EventType::CreateDir, child_local, child_remote);
                if store.enqueue(&job, &config.sync_dirs, now)? {
                    enqueued += 1;
                }
            }
        } else {
            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            let token = change_token(mtime_ms, meta.len());
            let token_matches = store.get_token(&child_local)?.as_deref() == Some(token.as_str());
            if !token_matches || store.get_mapping(&child_local)?.is_none() {
                let mut job = NewJob::new(EventType::CreateFile, child_local, child_remote);
                job.change_token = Some(token);
                if store.enqueue(&job, &config.sync_dirs, now)? {
                    enqueued += 1;
                }
            }
        }
    }
    Ok(enqueued)
}
