//! Shared state between the workers.
//!
//! The `SharedState` struct holds the keyframe store and the lifecycle
//! counters every worker uses to coordinate start-up and shutdown. Workers
//! wait on each other by polling these counters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::error;

use crate::geometry::LieGroup;
use crate::store::KeyframeStore;

/// Per-stage completion counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Tracking,
    Backend,
    GaussianMapping,
    Visualizing,
    MappingVisualizing,
}

/// Lifecycle counters. Each worker increments `all_triggered` once on start
/// and `all_finished` once on exit.
#[derive(Debug, Default)]
pub struct Lifecycle {
    pub num_running_thread: AtomicUsize,
    pub all_triggered: AtomicUsize,
    pub all_finished: AtomicUsize,
    pub tracking_finished: AtomicUsize,
    pub backend_finished: AtomicUsize,
    pub gaussian_mapping_finished: AtomicUsize,
    pub visualizing_finished: AtomicUsize,
    pub mapping_visualizing_finished: AtomicUsize,
    /// Set by the orchestrator once it owns the final map.
    pub received_mapping: AtomicBool,
}

impl Lifecycle {
    pub fn new(num_running_thread: usize) -> Self {
        Self {
            num_running_thread: AtomicUsize::new(num_running_thread),
            ..Self::default()
        }
    }

    fn stage(&self, stage: Stage) -> &AtomicUsize {
        match stage {
            Stage::Tracking => &self.tracking_finished,
            Stage::Backend => &self.backend_finished,
            Stage::GaussianMapping => &self.gaussian_mapping_finished,
            Stage::Visualizing => &self.visualizing_finished,
            Stage::MappingVisualizing => &self.mapping_visualizing_finished,
        }
    }

    pub fn num_running(&self) -> usize {
        self.num_running_thread.load(Ordering::SeqCst)
    }

    /// Mark a stage as finished.
    pub fn mark(&self, stage: Stage) {
        self.stage(stage).fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.stage(stage).load(Ordering::SeqCst)
    }

    /// `tracking_finished + backend_finished`, the loop condition of most workers.
    pub fn upstream_finished(&self) -> usize {
        self.count(Stage::Tracking) + self.count(Stage::Backend)
    }

    /// Register a started worker and wait until every worker has started.
    pub fn trigger_and_wait(&self) {
        self.all_triggered.fetch_add(1, Ordering::SeqCst);
        wait_until(|| self.all_triggered.load(Ordering::SeqCst) >= self.num_running());
    }

    /// Register a finished worker.
    pub fn finish(&self) {
        self.all_finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn all_finished(&self) -> bool {
        self.all_finished.load(Ordering::SeqCst) >= self.num_running()
    }

    pub fn set_received_mapping(&self) {
        self.received_mapping.store(true, Ordering::SeqCst);
    }

    pub fn has_received_mapping(&self) -> bool {
        self.received_mapping.load(Ordering::SeqCst)
    }
}

/// Spin until `cond` holds.
pub fn wait_until(cond: impl Fn() -> bool) {
    while !cond() {
        std::hint::spin_loop();
        thread::yield_now();
    }
}

/// State shared by every worker.
pub struct SharedState<G: LieGroup> {
    pub store: KeyframeStore<G>,
    pub lifecycle: Lifecycle,
    /// Cleared to stop every worker loop early.
    run: AtomicBool,
}

impl<G: LieGroup> SharedState<G> {
    pub fn new(store: KeyframeStore<G>, num_running_thread: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            lifecycle: Lifecycle::new(num_running_thread),
            run: AtomicBool::new(true),
        })
    }

    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Request every worker to leave its main loop.
    pub fn request_shutdown(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    /// Lifecycle bookkeeping for one worker, optionally owning a stage flag.
    pub fn worker(&self, stage: Option<Stage>) -> WorkerGuard<'_, G> {
        WorkerGuard {
            shared: self,
            stage,
            triggered: false,
            marked: false,
            finished: false,
        }
    }
}

/// Records a worker's lifecycle events exactly once.
///
/// Whatever the worker has not recorded when the guard drops is recorded
/// then, so a panicking worker cannot stall the barrier, the stages waiting
/// on its flag or the orchestrator. A panic also requests shutdown.
pub struct WorkerGuard<'a, G: LieGroup> {
    shared: &'a SharedState<G>,
    stage: Option<Stage>,
    triggered: bool,
    marked: bool,
    finished: bool,
}

impl<G: LieGroup> WorkerGuard<'_, G> {
    pub fn trigger_and_wait(&mut self) {
        if !self.triggered {
            self.triggered = true;
            self.shared.lifecycle.trigger_and_wait();
        }
    }

    /// Set the owned stage flag.
    pub fn mark(&mut self) {
        if let Some(stage) = self.stage.filter(|_| !self.marked) {
            self.marked = true;
            self.shared.lifecycle.mark(stage);
        }
    }

    /// Set the stage flag if still unset and count the worker as finished.
    pub fn finish(&mut self) {
        self.mark();
        if !self.finished {
            self.finished = true;
            self.shared.lifecycle.finish();
        }
    }
}

impl<G: LieGroup> Drop for WorkerGuard<'_, G> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(stage = ?self.stage, "Worker panicked, shutting down");
            self.shared.request_shutdown();
        }
        if !self.triggered {
            self.triggered = true;
            self.shared.lifecycle.all_triggered.fetch_add(1, Ordering::SeqCst);
        }
        self.finish();
    }
}
