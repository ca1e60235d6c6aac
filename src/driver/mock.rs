//! Scripted driver for failure-path tests.
//!
//! Records every call and fails on demand with whatever error text the test
//! scripts, which is how retry classification is exercised end to end.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{DeleteOutcome, DriverError, DriverResult, RemoteDriver};

/// In-memory driver with scripted failures.
#[derive(Default)]
pub struct MockDriver {
    fail_queue: Mutex<VecDeque<String>>,
    fail_always: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
    next_uid: AtomicU64,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call (FIFO when queued repeatedly) with this message.
    pub fn fail_next(&self, error: impl Into<String>) {
        self.lock_queue().push_back(error.into());
    }

    /// Fail every call with this message until cleared.
    pub fn fail_always(&self, error: impl Into<String>) {
        *self.lock_always() = Some(error.into());
    }

    pub fn clear_failures(&self) {
        self.lock_queue().clear();
        *self.lock_always() = None;
    }

    /// Every call recorded so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock_calls().clone()
    }

    /// How many recorded calls start with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.lock_calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.fail_queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_always(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.fail_always.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gate(&self, call: String) -> DriverResult<()> {
        self.lock_calls().push(call);
        if let Some(error) = self.lock_queue().pop_front() {
            return Err(DriverError(error));
        }
        if let Some(error) = self.lock_always().clone() {
            return Err(DriverError(error));
        }
        Ok(())
    }

    fn uid(&self) -> String {
        format!("uid-{}", self.next_uid.fetch_add(1, Ordering::Relaxed))
    }
}

impl RemoteDriver for MockDriver {
    fn ensure_path_folders(&self, remote_path: &str) -> DriverResult<String> {
        self.gate(format!("ensure_path_folders {}", remote_path))?;
        Ok("uid-parent".to_string())
    }

    fn create_file(&self, parent_uid: &str, name: &str, _local: &Path) -> DriverResult<String> {
        self.gate(format!("create_file {} {}", parent_uid, name))?;
        Ok(self.uid())
    }

    fn create_folder(&self, parent_uid: &str, name: &str) -> DriverResult<String> {
        self.gate(format!("create_folder {} {}", parent_uid, name))?;
        Ok(self.uid())
    }

    fn upload_revision(&self, node_uid: &str, _local: &Path) -> DriverResult<()> {
        self.gate(format!("upload_revision {}", node_uid))
    }

    fn delete(&self, remote_path: &str, trash_only: bool) -> DriverResult<DeleteOutcome> {
        self.gate(format!("delete {} trash={}", remote_path, trash_only))?;
        Ok(DeleteOutcome {
            existed: true,
            trashed: trash_only,
        })
    }

    fn rename(&self, node_uid: &str, new_name: &str) -> DriverResult<()> {
        self.gate(format!("rename {} {}", node_uid, new_name))
    }

    fn move_node(
        &self,
        node_uid: &str,
        new_parent_uid: &str,
        new_name: &str,
    ) -> DriverResult<()> {
        self.gate(format!("move {} {} {}", node_uid, new_parent_uid, new_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_next_applies_once() {
        let driver = MockDriver::new();
        driver.fail_next("fetch failed");
        assert!(driver.ensure_path_folders("/R/x").is_err());
        assert!(driver.ensure_path_folders("/R/x").is_ok());
        assert_eq!(driver.call_count("ensure_path_folders"), 2);
    }

    #[test]
    fn test_fail_always_until_cleared() {
        let driver = MockDriver::new();
        driver.fail_always("invalid refresh token");
        assert!(driver.rename("u", "n").is_err());
        assert!(driver.rename("u", "n").is_err());
        driver.clear_failures();
        assert!(driver.rename("u", "n").is_ok());
    }
}
