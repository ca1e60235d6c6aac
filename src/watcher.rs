//! Filesystem watcher with debounced batch events.
//!
//! One watcher thread per watch root. All events within a debounce window
//! are collected, de-duplicated, sorted lexicographically, and emitted as a
//! single batch of dirty paths. The observer later decides what each dirty
//! path means by comparing disk against its snapshot, so the batch carries
//! paths only: no event types, no timestamps.
//!
//! Batches are never split: a rename produces its delete-side and
//! create-side paths in the same notification window, which is what the
//! classifier's inode pairing relies on.

use anyhow::{bail, Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::paths;

/// Deterministic batch of dirty paths for one watch root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyBatch {
    /// Index of the watch root in the current configuration.
    pub root_index: usize,
    /// Dirty paths, absolute, in lexicographic order.
    pub paths: Vec<PathBuf>,
}

/// Watcher tuning knobs.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce delay in milliseconds.
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

/// Handle for one root's watcher thread. Dropping it does not stop the
/// thread; signal the shared shutdown flag instead.
pub struct RootWatcher {
    _thread: thread::JoinHandle<()>,
}

/// Start watching one root, sending debounced batches to `tx`.
///
/// Fails immediately when the root does not exist or cannot be watched, so
/// misconfiguration surfaces at subscribe time rather than silently.
pub fn spawn_root_watcher(
    root_index: usize,
    root: PathBuf,
    config: &WatcherConfig,
    tx: Sender<DirtyBatch>,
    shutdown: Arc<AtomicBool>,
) -> Result<RootWatcher> {
    if !root.is_dir() {
        bail!("watch root does not exist: {}", root.display());
    }

    let callback_root = root.clone();
    let mut debouncer = new_debouncer(
        Duration::from_millis(config.debounce_ms),
        move |result: notify_debouncer_mini::DebounceEventResult| match result {
            Ok(events) => {
                let mut dirty = BTreeSet::new();
                for event in &events {
                    // The OS can hand us anything; keep only paths that are
                    // plausibly inside this root and traversal-free.
                    if paths::is_within_root(&event.path, &callback_root) {
                        dirty.insert(event.path.clone());
                    }
                }
                if !dirty.is_empty() {
                    let batch = DirtyBatch {
                        root_index,
                        paths: dirty.into_iter().collect(),
                    };
                    let _ = tx.send(batch);
                }
            }
            Err(error) => {
                warn!(root = %callback_root.display(), %error, "watcher error");
            }
        },
    )
    .context("failed to create filesystem watcher")?;

    debouncer
        .watcher()
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;

    let thread = thread::spawn(move || {
        // The debouncer delivers batches from its own thread; this one only
        // keeps it alive until shutdown.
        let _debouncer = debouncer;
        while !shutdown.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(200));
        }
    });

    Ok(RootWatcher { _thread: thread })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_missing_root_fails_at_subscribe() {
        let (tx, _rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let result = spawn_root_watcher(
            0,
            PathBuf::from("/definitely/not/here"),
            &WatcherConfig::default(),
            tx,
            shutdown,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_emitted_for_new_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let _watcher = spawn_root_watcher(
            3,
            root.clone(),
            &WatcherConfig { debounce_ms: 50 },
            tx,
            shutdown.clone(),
        )
        .unwrap();

        std::fs::write(root.join("x.txt"), b"hello").unwrap();

        let batch = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("expected a dirty batch");
        assert_eq!(batch.root_index, 3);
        assert!(batch.paths.iter().any(|p| p.ends_with("x.txt")));
        shutdown.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_batch_paths_sorted_and_deduped() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let _watcher = spawn_root_watcher(
            0,
            root.clone(),
            &WatcherConfig { debounce_ms: 200 },
            tx,
            shutdown.clone(),
        )
        .unwrap();

        // Several writes inside one debounce window.
        std::fs::write(root.join("b.txt"), b"b").unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("a.txt"), b"a2").unwrap();

        let batch = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("expected a dirty batch");
        let mut sorted = batch.paths.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(batch.paths, sorted);
        shutdown.store(true, Ordering::SeqCst);
    }
}
