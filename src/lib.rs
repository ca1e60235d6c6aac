//! driftsync: a durable one-way mirror engine.
//!
//! Watches local directory trees, diffs them against persisted snapshots,
//! and replays every mutation into a remote object store through a pluggable
//! driver. Survives crashes: the job queue, node mappings, change tokens and
//! snapshots are all persistent, and interrupted work is reclaimed on the
//! next start.

pub mod classifier;
pub mod config;
pub mod driver;
pub mod engine;
pub mod executor;
pub mod filter;
pub mod observer;
pub mod output;
pub mod paths;
pub mod retry;
pub mod snapshot;
pub mod store;
pub mod watcher;

pub use config::{Config, ExcludePattern, RemoteDeleteBehavior, SyncDir};
pub use driver::{DeleteOutcome, DriverError, DriverResult, FsDriver, MockDriver, RemoteDriver};
pub use engine::{Controls, DrainStats, ScanSummary, SyncEngine};
pub use filter::ExclusionFilter;
pub use observer::{ChangeBatch, ChangeRecord, Observer};
pub use output::{output_json, OutputFormat};
pub use retry::ErrorCategory;
pub use snapshot::{SnapEntry, Snapshot, SnapshotStore};
pub use store::{EventType, Job, JobCounts, JobStatus, NewJob, NodeMapping, SyncStore};
pub use watcher::{DirtyBatch, RootWatcher, WatcherConfig};
