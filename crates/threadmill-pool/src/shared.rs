//! Mirrored pool state for lock-free-ish introspection
//!
//! The engine owns the truth and pushes copies here after every turn, so
//! the `Pool` getters never wait on the scheduler.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use threadmill_core::config::{PoolConfig, RuntimeKind};
use threadmill_core::task::WorkerId;

/// Out-of-band pool notifications
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A worker failed with no running task to pin the error on
    Error { message: String },
    /// The last queued task was handed to a worker
    Drain,
}

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
pub(crate) struct PoolShared {
    config: PoolConfig,
    start: Instant,
    completed: Arc<AtomicU64>,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    worker_ids: RwLock<Vec<WorkerId>>,
    runtime: RwLock<RuntimeKind>,
    isolate_workers: AtomicBool,
    events: broadcast::Sender<PoolEvent>,
}

impl PoolShared {
    pub(crate) fn new(config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let runtime = config.runtime;
        let isolate_workers = config.isolate_workers;
        PoolShared {
            config,
            start: Instant::now(),
            completed: Arc::new(AtomicU64::new(0)),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            worker_ids: RwLock::new(Vec::new()),
            runtime: RwLock::new(runtime),
            isolate_workers: AtomicBool::new(isolate_workers),
            events,
        }
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Counter handed to every task record; counts each resolution once
    pub(crate) fn completed_counter(&self) -> Arc<AtomicU64> {
        self.completed.clone()
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub(crate) fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub(crate) fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Relaxed)
    }

    pub(crate) fn set_active_tasks(&self, active: usize) {
        self.active_tasks.store(active, Ordering::Relaxed);
    }

    pub(crate) fn worker_ids(&self) -> Vec<WorkerId> {
        self.worker_ids.read().clone()
    }

    pub(crate) fn set_worker_ids(&self, ids: Vec<WorkerId>) {
        *self.worker_ids.write() = ids;
    }

    pub(crate) fn runtime(&self) -> RuntimeKind {
        *self.runtime.read()
    }

    pub(crate) fn set_runtime(&self, runtime: RuntimeKind) {
        *self.runtime.write() = runtime;
    }

    pub(crate) fn isolate_workers(&self) -> bool {
        self.isolate_workers.load(Ordering::Acquire)
    }

    pub(crate) fn set_isolate_workers(&self, isolate: bool) {
        self.isolate_workers.store(isolate, Ordering::Release);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Best effort; nobody listening is fine
    pub(crate) fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }
}
