//! Sync engine: wiring and lifecycle.
//!
//! The engine thread owns the store and the observer; worker threads own
//! nothing but a driver reference. Concurrency is bounded by
//! `sync_concurrency`, but per-path exclusivity comes from the queue's
//! processing guard, not from the scheduler.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::classifier;
use crate::config::Config;
use crate::driver::RemoteDriver;
use crate::executor::{self, Applied, CommitAction, TaskOutcome};
use crate::observer::Observer;
use crate::store::queue::{self, NewJob};
use crate::store::{now_ms, SyncStore};
use crate::watcher::{self, DirtyBatch, RootWatcher, WatcherConfig};

/// How long the watch loop parks waiting for dirty batches.
const TICK: Duration = Duration::from_millis(250);

/// Top-up cadence when nothing else wakes the loop.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Heartbeat cadence while paused.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long shutdown waits for in-flight tasks before abandoning them.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(8);

/// Process-global control flags, shared with the signal thread.
#[derive(Debug, Default)]
pub struct Controls {
    stop: AtomicBool,
    paused: AtomicBool,
    reload: AtomicBool,
}

impl Controls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }
}

/// What an initial scan produced.
#[derive(Debug, Default, Serialize)]
pub struct ScanSummary {
    pub roots_scanned: usize,
    pub roots_skipped: usize,
    pub records: usize,
    pub suppressed: usize,
    /// Jobs upserted, or planned in dry-run.
    #[serde(skip)]
    pub planned: Vec<NewJob>,
}

/// What a drain run did.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DrainStats {
    pub synced: usize,
    pub retried: usize,
    pub blocked: usize,
}

/// One generation of watcher subscriptions. Replaced wholesale on config
/// reload; the old generation's threads die via their shutdown flag and its
/// channel is dropped with it.
struct WatchGeneration {
    shutdown: Arc<AtomicBool>,
    _watchers: Vec<RootWatcher>,
}

impl WatchGeneration {
    fn spawn(
        config: &Config,
        watcher_config: &WatcherConfig,
        tx: Sender<DirtyBatch>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut watchers = Vec::new();
        for (root_index, dir) in config.sync_dirs.iter().enumerate() {
            match watcher::spawn_root_watcher(
                root_index,
                dir.source_path.clone(),
                watcher_config,
                tx.clone(),
                shutdown.clone(),
            ) {
                Ok(watcher) => watchers.push(watcher),
                // Watch mode keeps running with the roots it can see.
                Err(error) => {
                    warn!(root = %dir.source_path.display(), %error, "skipping unwatchable root")
                }
            }
        }
        Self {
            shutdown,
            _watchers: watchers,
        }
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for WatchGeneration {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The durable sync engine.
pub struct SyncEngine {
    config: Config,
    state_dir: PathBuf,
    store: SyncStore,
    observer: Observer,
    driver: Arc<dyn RemoteDriver>,
    controls: Arc<Controls>,
}

impl SyncEngine {
    pub fn new(config: Config, state_dir: &Path, driver: Arc<dyn RemoteDriver>) -> Result<Self> {
        config.validate()?;
        let store = SyncStore::open(state_dir)?;
        let observer = Observer::new(&config, state_dir)?;
        Ok(Self {
            config,
            state_dir: state_dir.to_path_buf(),
            store,
            observer,
            driver,
            controls: Controls::new(),
        })
    }

    pub fn controls(&self) -> Arc<Controls> {
        Arc::clone(&self.controls)
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    /// Startup recovery: reclaim PROCESSING jobs, prune jobs and snapshots
    /// that no longer belong to any watch root.
    pub fn startup_recovery(&mut self) -> Result<()> {
        let cleanup = self.store.cleanup_orphans(&self.config.sync_dirs)?;
        let snapshots = self.observer.cleanup_orphan_snapshots(&self.config)?;
        if cleanup.reset > 0 || cleanup.deleted > 0 || snapshots > 0 {
            info!(
                reset = cleanup.reset,
                deleted = cleanup.deleted,
                orphan_snapshots = snapshots,
                "startup recovery complete"
            );
        }
        Ok(())
    }

    /// Scan every root against its snapshot and enqueue the differences.
    ///
    /// `strict` makes a missing root fatal (one-shot mode); otherwise the
    /// root is logged and skipped (watch mode).
    pub fn initial_scan(&mut self, dry_run: bool, strict: bool) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        for root_index in 0..self.observer.root_count() {
            let batch = match self.observer.initial_batch(root_index) {
                Ok(batch) => batch,
                Err(e) if strict => return Err(e),
                Err(e) => {
                    warn!(error = %e, "skipping root during initial scan");
                    summary.roots_skipped += 1;
                    continue;
                }
            };
            summary.roots_scanned += 1;
            summary.records += batch.records.len();

            let outcome = classifier::process_batch(&mut self.store, &self.config, &batch, dry_run)?;
            summary.suppressed += outcome.suppressed;
            summary.planned.extend(outcome.planned);

            if !dry_run {
                self.observer.apply_batch(&batch);
                self.observer.write_snapshot(root_index)?;
            }
        }
        Ok(summary)
    }

    /// Drain mode: process jobs until none are pending and none in flight.
    ///
    /// Waits out scheduled retries, so a flaky network stalls the drain
    /// rather than losing work, and an offline remote keeps a one-shot run alive
    /// until interrupted. BLOCKED jobs do not stall it.
    pub fn drain(&mut self, mut progress: impl FnMut(&DrainStats)) -> Result<DrainStats> {
        let (tx, rx) = mpsc::channel::<TaskOutcome>();
        let mut stats = DrainStats::default();
        let mut in_flight = 0usize;

        loop {
            if self.controls.stop_requested() {
                break;
            }

            while in_flight < self.config.sync_concurrency.max(1) {
                match self.store.next_pending(now_ms())? {
                    Some(job) => {
                        self.dispatch(job, &tx)?;
                        in_flight += 1;
                    }
                    None => break,
                }
            }

            if in_flight == 0 {
                match queue::earliest_pending_retry(self.store.conn())? {
                    None => break,
                    Some(at) => {
                        let wait = at - now_ms();
                        if wait > 0 {
                            thread::sleep(Duration::from_millis((wait as u64).min(1000)));
                        }
                        continue;
                    }
                }
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(outcome) => {
                    in_flight -= 1;
                    self.commit(&outcome, &mut stats)?;
                    progress(&stats);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.await_in_flight(&rx, in_flight, &mut stats);
        Ok(stats)
    }

    /// Watch mode: subscribe to every root and run until stopped.
    pub fn run_watch(
        &mut self,
        watcher_config: &WatcherConfig,
        config_path: Option<&Path>,
    ) -> Result<()> {
        self.startup_recovery()?;
        // Catch up on everything that happened while the process was down.
        self.initial_scan(false, false)?;

        let (mut batch_tx, mut batch_rx) = mpsc::channel::<DirtyBatch>();
        let mut generation = WatchGeneration::spawn(&self.config, watcher_config, batch_tx.clone());

        let (task_tx, task_rx) = mpsc::channel::<TaskOutcome>();
        let mut stats = DrainStats::default();
        let mut in_flight = 0usize;
        let mut last_top_up = Instant::now() - POLL_INTERVAL;
        let mut last_heartbeat = Instant::now();
        let mut work_arrived = true;

        info!(
            roots = self.config.sync_dirs.len(),
            concurrency = self.config.sync_concurrency,
            "watch mode started"
        );

        loop {
            if self.controls.stop_requested() {
                break;
            }

            if self.controls.take_reload() {
                if let Some(path) = config_path {
                    match self.reload_config(path) {
                        Ok(()) => {
                            // Fresh channel so stale root indices from the
                            // old generation cannot reach the new config.
                            let (tx, rx) = mpsc::channel::<DirtyBatch>();
                            batch_tx = tx;
                            batch_rx = rx;
                            generation =
                                WatchGeneration::spawn(&self.config, watcher_config, batch_tx.clone());
                            work_arrived = true;
                        }
                        Err(e) => error!(error = %e, "config reload failed, keeping old config"),
                    }
                }
            }

            while let Ok(outcome) = task_rx.try_recv() {
                in_flight -= 1;
                self.commit(&outcome, &mut stats)?;
                work_arrived = true;
            }

            if self.controls.is_paused() {
                if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                    let counts = self.store.counts()?;
                    info!(
                        pending = counts.pending,
                        processing = counts.processing,
                        blocked = counts.blocked,
                        "sync paused"
                    );
                    last_heartbeat = Instant::now();
                }
                thread::sleep(TICK);
                continue;
            }

            if work_arrived || last_top_up.elapsed() >= POLL_INTERVAL {
                work_arrived = false;
                last_top_up = Instant::now();
                while in_flight < self.config.sync_concurrency.max(1) {
                    match self.store.next_pending(now_ms())? {
                        Some(job) => {
                            self.dispatch(job, &task_tx)?;
                            in_flight += 1;
                        }
                        None => break,
                    }
                }
            }

            match batch_rx.recv_timeout(TICK) {
                Ok(dirty) => {
                    if let Err(e) = self.process_dirty(&dirty) {
                        error!(error = %e, "failed to process change batch");
                    }
                    work_arrived = true;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        generation.stop();
        self.await_in_flight(&task_rx, in_flight, &mut stats);
        info!(
            synced = stats.synced,
            retried = stats.retried,
            blocked = stats.blocked,
            "watch mode stopped"
        );
        Ok(())
    }

    /// Turn one debounced notification into jobs and persist the snapshot.
    fn process_dirty(&mut self, dirty: &DirtyBatch) -> Result<()> {
        if dirty.root_index >= self.observer.root_count() {
            return Ok(());
        }
        let batch = self
            .observer
            .batch_from_dirty(dirty.root_index, &dirty.paths)?;
        if batch.is_empty() {
            return Ok(());
        }
        classifier::process_batch(&mut self.store, &self.config, &batch, false)?;
        self.observer.apply_batch(&batch);
        self.observer.write_snapshot(dirty.root_index)?;
        Ok(())
    }

    fn dispatch(&mut self, job: queue::Job, tx: &Sender<TaskOutcome>) -> Result<()> {
        let assignment = executor::prepare_assignment(&self.store, job, &self.config)?;
        let driver = Arc::clone(&self.driver);
        let tx = tx.clone();
        thread::spawn(move || {
            let outcome = executor::run_task(driver.as_ref(), &assignment);
            // The engine may already have shut down; nothing to do then.
            let _ = tx.send(outcome);
        });
        Ok(())
    }

    fn commit(&mut self, outcome: &TaskOutcome, stats: &mut DrainStats) -> Result<()> {
        let action = executor::commit_outcome(&mut self.store, outcome, now_ms())?;
        match action {
            CommitAction::Synced => {
                stats.synced += 1;
                // A freshly created remote folder (CREATE_DIR, or a
                // DELETE_AND_CREATE that recreated a directory) bootstraps
                // its children.
                let created_dir =
                    matches!(outcome.result, Ok(Applied::Created { is_dir: true, .. }));
                if created_dir {
                    let enqueued = executor::enqueue_dir_children(
                        &mut self.store,
                        &self.config,
                        &outcome.job.local_path,
                        &self.state_dir,
                        now_ms(),
                    )?;
                    if enqueued > 0 {
                        info!(
                            local_path = %outcome.job.local_path,
                            children = enqueued,
                            "directory synced, children enqueued"
                        );
                    }
                }
            }
            CommitAction::Retried { .. } => stats.retried += 1,
            CommitAction::Blocked => stats.blocked += 1,
        }
        Ok(())
    }

    /// Wait out in-flight tasks up to the shutdown budget; whatever is still
    /// running is abandoned and recovered on next startup by the stale-guard
    /// sweep.
    fn await_in_flight(
        &mut self,
        rx: &Receiver<TaskOutcome>,
        mut in_flight: usize,
        stats: &mut DrainStats,
    ) {
        let deadline = Instant::now() + SHUTDOWN_BUDGET;
        while in_flight > 0 {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match rx.recv_timeout(remaining) {
                Ok(outcome) => {
                    in_flight -= 1;
                    if let Err(e) = self.commit(&outcome, stats) {
                        error!(error = %e, "failed to commit outcome during shutdown");
                    }
                }
                Err(_) => break,
            }
        }
        if in_flight > 0 {
            warn!(
                abandoned = in_flight,
                "shutdown budget exceeded, abandoning in-flight tasks"
            );
        }
    }

    /// Re-read configuration and apply what changed.
    fn reload_config(&mut self, config_path: &Path) -> Result<()> {
        let new_config = Config::load(config_path).context("failed to reload config")?;
        let dirs_changed = new_config.sync_dirs != self.config.sync_dirs;
        let concurrency_changed = new_config.sync_concurrency != self.config.sync_concurrency;

        self.config = new_config;
        if dirs_changed {
            self.observer = Observer::new(&self.config, &self.state_dir)?;
            self.store.cleanup_orphans(&self.config.sync_dirs)?;
            self.observer.cleanup_orphan_snapshots(&self.config)?;
            // New roots need a baseline before their watcher events make
            // sense; missing roots are skipped like at startup.
            self.initial_scan(false, false)?;
        }
        info!(
            dirs_changed,
            concurrency = self.config.sync_concurrency,
            concurrency_changed,
            "configuration reloaded"
        );
        Ok(())
    }
}
