//! Filesystem-backed reference driver.
//!
//! Mirrors the remote tree into a local target directory (typically a
//! mounted encrypted volume) and keeps a sidecar node table so uids stay
//! stable across rename and move, exactly like a real object store. Also the
//! driver used by the integration tests.
//!
//! Error messages deliberately use the same phrasing a remote store would
//! ("file or folder not found", "… already exists") so classification
//! behaves identically in tests and production.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{DeleteOutcome, DriverError, DriverResult, RemoteDriver};
use crate::paths;

/// Uid of the implicit root folder.
const ROOT_UID: &str = "root";

/// Sidecar file holding the uid → path table, kept inside the target root.
const NODE_TABLE_FILE: &str = ".driftsync-nodes.json";

/// Trash folder for `trash_only` deletes.
const TRASH_DIR: &str = ".driftsync-trash";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeInfo {
    rel: String,
    is_dir: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeTable {
    nodes: HashMap<String, NodeInfo>,
}

impl NodeTable {
    fn uid_for_rel(&self, rel: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, info)| info.rel == rel)
            .map(|(uid, _)| uid.as_str())
    }
}

/// Local-directory remote driver.
pub struct FsDriver {
    root: PathBuf,
    table: Mutex<NodeTable>,
}

impl FsDriver {
    /// Open (creating if needed) a driver over `root`.
    pub fn open(root: &Path) -> DriverResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| DriverError::new(format!("failed to create target {}: {}", root.display(), e)))?;
        let table_path = root.join(NODE_TABLE_FILE);
        let table = match std::fs::read(&table_path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => NodeTable::default(),
        };
        Ok(Self {
            root: root.to_path_buf(),
            table: Mutex::new(table),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, table: &NodeTable) -> DriverResult<()> {
        let raw = serde_json::to_vec(table)
            .map_err(|e| DriverError::new(format!("failed to serialize node table: {}", e)))?;
        let path = self.root.join(NODE_TABLE_FILE);
        let tmp = self.root.join(format!("{}.tmp", NODE_TABLE_FILE));
        std::fs::write(&tmp, raw)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| DriverError::new(format!("failed to persist node table: {}", e)))
    }

    /// Remote path string → root-relative storage key.
    fn rel_of(remote_path: &str) -> String {
        remote_path
            .split('/')
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn physical(&self, rel: &str) -> PathBuf {
        paths::abs_for_rel(rel, &self.root)
    }

    fn resolve(&self, table: &NodeTable, uid: &str) -> DriverResult<NodeInfo> {
        if uid == ROOT_UID {
            return Ok(NodeInfo {
                rel: String::new(),
                is_dir: true,
            });
        }
        table
            .nodes
            .get(uid)
            .cloned()
            .ok_or_else(|| DriverError::new("file or folder not found"))
    }

    fn child_rel(parent_rel: &str, name: &str) -> String {
        if parent_rel.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_rel, name)
        }
    }
}

impl RemoteDriver for FsDriver {
    fn ensure_path_folders(&self, remote_path: &str) -> DriverResult<String> {
        let rel = Self::rel_of(remote_path);
        let parent_rel = match rel.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        if parent_rel.is_empty() {
            return Ok(ROOT_UID.to_string());
        }

        let dir = self.physical(&parent_rel);
        std::fs::create_dir_all(&dir).map_err(|e| {
            DriverError::new(format!("failed to create folders {}: {}", dir.display(), e))
        })?;

        let mut table = self.lock();
        let mut ancestor = String::new();
        let mut parent_uid = ROOT_UID.to_string();
        for part in parent_rel.split('/') {
            ancestor = Self::child_rel(&ancestor, part);
            parent_uid = match table.uid_for_rel(&ancestor) {
                Some(uid) => uid.to_string(),
                None => {
                    let uid = Uuid::new_v4().to_string();
                    table.nodes.insert(
                        uid.clone(),
                        NodeInfo {
                            rel: ancestor.clone(),
                            is_dir: true,
                        },
                    );
                    uid
                }
            };
        }
        self.persist(&table)?;
        Ok(parent_uid)
    }

    fn create_file(&self, parent_uid: &str, name: &str, local: &Path) -> DriverResult<String> {
        let mut table = self.lock();
        let parent = self.resolve(&table, parent_uid)?;
        let rel = Self::child_rel(&parent.rel, name);
        let dest = self.physical(&rel);
        if dest.exists() {
            return Err(DriverError::new(
                "a file or folder with that name already exists",
            ));
        }
        std::fs::copy(local, &dest).map_err(|e| {
            DriverError::new(format!("failed to upload {}: {}", local.display(), e))
        })?;
        let uid = Uuid::new_v4().to_string();
        table
            .nodes
            .insert(uid.clone(), NodeInfo { rel, is_dir: false });
        self.persist(&table)?;
        Ok(uid)
    }

    fn create_folder(&self, parent_uid: &str, name: &str) -> DriverResult<String> {
        let mut table = self.lock();
        let parent = self.resolve(&table, parent_uid)?;
        let rel = Self::child_rel(&parent.rel, name);
        let dest = self.physical(&rel);
        if dest.exists() {
            return Err(DriverError::new(
                "a file or folder with that name already exists",
            ));
        }
        std::fs::create_dir(&dest).map_err(|e| {
            DriverError::new(format!("failed to create folder {}: {}", dest.display(), e))
        })?;
        let uid = Uuid::new_v4().to_string();
        table
            .nodes
            .insert(uid.clone(), NodeInfo { rel, is_dir: true });
        self.persist(&table)?;
        Ok(uid)
    }

    fn upload_revision(&self, node_uid: &str, local: &Path) -> DriverResult<()> {
        let table = self.lock();
        let node = self.resolve(&table, node_uid)?;
        let dest = self.physical(&node.rel);
        if !dest.exists() {
            return Err(DriverError::new("file or folder not found"));
        }
        std::fs::copy(local, &dest).map_err(|e| {
            DriverError::new(format!("failed to upload revision {}: {}", local.display(), e))
        })?;
        Ok(())
    }

    fn delete(&self, remote_path: &str, trash_only: bool) -> DriverResult<DeleteOutcome> {
        let rel = Self::rel_of(remote_path);
        let target = self.physical(&rel);
        if !target.exists() {
            return Ok(DeleteOutcome {
                existed: false,
                trashed: false,
            });
        }

        if trash_only {
            let trash = self.root.join(TRASH_DIR);
            std::fs::create_dir_all(&trash).map_err(|e| {
                DriverError::new(format!("failed to create trash folder: {}", e))
            })?;
            let name = format!(
                "{}-{}",
                Uuid::new_v4(),
                paths::base_name(&rel)
            );
            std::fs::rename(&target, trash.join(name)).map_err(|e| {
                DriverError::new(format!("failed to trash {}: {}", target.display(), e))
            })?;
        } else if target.is_dir() {
            std::fs::remove_dir_all(&target).map_err(|e| {
                DriverError::new(format!("failed to remove {}: {}", target.display(), e))
            })?;
        } else {
            std::fs::remove_file(&target).map_err(|e| {
                DriverError::new(format!("failed to remove {}: {}", target.display(), e))
            })?;
        }

        let mut table = self.lock();
        table
            .nodes
            .retain(|_, info| info.rel != rel && !info.rel.starts_with(&format!("{}/", rel)));
        self.persist(&table)?;
        Ok(DeleteOutcome {
            existed: true,
            trashed: trash_only,
        })
    }

    fn rename(&self, node_uid: &str, new_name: &str) -> DriverResult<()> {
        let mut table = self.lock();
        let node = self.resolve(&table, node_uid)?;
        let parent_rel = match node.rel.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        let new_rel = Self::child_rel(&parent_rel, new_name);
        let from = self.physical(&node.rel);
        let to = self.physical(&new_rel);
        if to.exists() {
            return Err(DriverError::new(
                "a file or folder with that name already exists",
            ));
        }
        std::fs::rename(&from, &to).map_err(|e| {
            DriverError::new(format!("failed to rename {}: {}", from.display(), e))
        })?;
        rekey_subtree(&mut table, &node.rel, &new_rel);
        self.persist(&table)?;
        Ok(())
    }

    fn move_node(
        &self,
        node_uid: &str,
        new_parent_uid: &str,
        new_name: &str,
    ) -> DriverResult<()> {
        let mut table = self.lock();
        let node = self.resolve(&table, node_uid)?;
        let parent = self.resolve(&table, new_parent_uid)?;
        let new_rel = Self::child_rel(&parent.rel, new_name);
        let from = self.physical(&node.rel);
        let to = self.physical(&new_rel);
        if to.exists() {
            return Err(DriverError::new(
                "a file or folder with that name already exists",
            ));
        }
        std::fs::rename(&from, &to).map_err(|e| {
            DriverError::new(format!("failed to move {}: {}", from.display(), e))
        })?;
        rekey_subtree(&mut table, &node.rel, &new_rel);
        self.persist(&table)?;
        Ok(())
    }
}

fn rekey_subtree(table: &mut NodeTable, from_rel: &str, to_rel: &str) {
    let child_prefix = format!("{}/", from_rel);
    for info in table.nodes.values_mut() {
        if info.rel == from_rel {
            info.rel = to_rel.to_string();
        } else if let Some(rest) = info.rel.strip_prefix(&child_prefix) {
            info.rel = format!("{}/{}", to_rel, rest);
        }
    }
}
