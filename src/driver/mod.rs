//! Remote driver interface.
//!
//! The sync core never talks to the remote store directly; it drives one of
//! these. Errors cross this boundary as strings and are classified by
//! substring matching (see [`crate::retry`]); the driver is an external
//! collaborator and must be treated as a string oracle.

pub mod fs;
pub mod mock;

use std::path::Path;

pub use fs::FsDriver;
pub use mock::MockDriver;

/// Error surfaced by a remote driver operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Result of a delete. `existed=false` means the node was already gone,
/// which callers treat as success (deletes are idempotent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub existed: bool,
    pub trashed: bool,
}

/// Operations the executor needs from a remote store.
///
/// Node uids are opaque, stable across rename and move. All calls may block;
/// the executor runs them on worker threads, never on the state thread.
pub trait RemoteDriver: Send + Sync {
    /// Ensure every folder on the parent chain of `remote_path` exists.
    /// Returns the uid of the immediate parent folder.
    fn ensure_path_folders(&self, remote_path: &str) -> DriverResult<String>;

    /// Upload a new file under `parent_uid`. Returns the new node's uid.
    fn create_file(&self, parent_uid: &str, name: &str, local: &Path) -> DriverResult<String>;

    /// Create a folder under `parent_uid`. Returns the new node's uid.
    fn create_folder(&self, parent_uid: &str, name: &str) -> DriverResult<String>;

    /// Upload a new content revision of an existing file node.
    fn upload_revision(&self, node_uid: &str, local: &Path) -> DriverResult<()>;

    /// Delete the node at `remote_path`. Must return `existed=false` without
    /// error when the node is already gone.
    fn delete(&self, remote_path: &str, trash_only: bool) -> DriverResult<DeleteOutcome>;

    /// Rename a node within its current parent.
    fn rename(&self, node_uid: &str, new_name: &str) -> DriverResult<()>;

    /// Move a node under a new parent, possibly with a new name.
    fn move_node(&self, node_uid: &str, new_parent_uid: &str, new_name: &str)
        -> DriverResult<()>;
}
