// threadmill-pool: bounded task-execution pool over thread or process workers
//
// Key design decisions:
// - A single scheduler task owns all pool state (queue, worker set, id
//   free-list); the Pool handle talks to it over an unbounded command
//   channel, so no public method ever blocks on pool internals.
// - Dropping the last Pool handle closes the command channel, which the
//   scheduler treats as an implicit destroy.
// - Introspection reads a shared snapshot the scheduler refreshes every
//   loop turn instead of round-tripping a query through it.
// - Worker runtimes hide behind `ContextFactory`; the built-in factory
//   covers in-process threads and child processes, and tests substitute
//   their own.

mod engine;
mod set;
mod shared;
mod slot;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use threadmill_runtime::context::RuntimeFactory;

use crate::engine::{Command, Engine};
use crate::shared::PoolShared;

pub use crate::shared::PoolEvent;
pub use threadmill_core::channel::{worker_channel, ChannelHandle, WorkerChannel};
pub use threadmill_core::config::{
    PoolConfig, PoolOptions, ProcessOptions, QueueLimit, ResourceLimits, RuntimeKind,
};
pub use threadmill_core::error::{ConfigError, PoolError, Result, RunnerError, TransportError};
pub use threadmill_core::queue::{FifoQueue, TaskQueue};
pub use threadmill_core::task::{TaskId, TaskRecord, WorkerId};
pub use threadmill_runtime::context::{ContextFactory, ExecutionContext};
pub use threadmill_runtime::{
    process_worker_main, RunnerRegistry, TaskInput, TaskRunner, WorkerContext,
};

/// Per-submission overrides and extras
#[derive(Default)]
pub struct SubmitOptions {
    /// Target file override; falls back to the pool default
    pub target_file: Option<String>,

    /// Handler name override; falls back to the pool default
    pub target_name: Option<String>,

    /// Binary payloads sent alongside the task
    pub attachments: Vec<Bytes>,

    /// Cancellation signal; a cancelled token rejects before submission
    pub cancellation: Option<CancellationToken>,

    /// Out-of-band channel bound to the worker for this task
    pub channel: Option<ChannelHandle>,

    /// Opaque hint for custom queue implementations
    pub queue_options: Option<Value>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_file(mut self, file: impl Into<String>) -> Self {
        self.target_file = Some(file.into());
        self
    }

    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Bytes>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_channel(mut self, channel: ChannelHandle) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_queue_options(mut self, options: Value) -> Self {
        self.queue_options = Some(options);
        self
    }
}

/// Teardown controls
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Overrides the configured terminate timeout for this teardown
    pub timeout: Option<Duration>,
}

impl DestroyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Administrative recycle controls
#[derive(Debug, Clone, Copy, Default)]
pub struct RecycleOptions {
    /// Switch future workers to this runtime
    pub runtime: Option<RuntimeKind>,

    /// Change the isolation mode going forward
    pub isolate_workers: Option<bool>,
}

impl RecycleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_isolate_workers(mut self, isolate: bool) -> Self {
        self.isolate_workers = Some(isolate);
        self
    }
}

/// Assembles a [`Pool`] from options plus optional custom parts
#[derive(Default)]
pub struct PoolBuilder {
    options: PoolOptions,
    runner: Option<Arc<dyn TaskRunner>>,
    factory: Option<Arc<dyn ContextFactory>>,
    queue: Option<Box<dyn TaskQueue>>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Handler registry used by thread-backed workers
    pub fn runner(mut self, runner: impl TaskRunner + 'static) -> Self {
        self.runner = Some(Arc::new(runner));
        self
    }

    /// Replace the built-in thread/process runtimes entirely
    pub fn factory(mut self, factory: Arc<dyn ContextFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Replace the FIFO queue with a custom ordering
    pub fn queue(mut self, queue: Box<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Resolve options and start the scheduler
    ///
    /// Must run inside a tokio runtime; the scheduler spawns onto it.
    pub fn build(self) -> Result<Pool> {
        let config = self.options.resolve()?;
        let factory = match self.factory {
            Some(factory) => factory,
            None => {
                let runner = self
                    .runner
                    .unwrap_or_else(|| Arc::new(RunnerRegistry::new()));
                Arc::new(RuntimeFactory::new(
                    runner,
                    config.resource_limits.clone(),
                    config.process.clone(),
                ))
            }
        };
        let queue = self.queue.unwrap_or_else(|| Box::new(FifoQueue::new()));
        let shared = Arc::new(PoolShared::new(config.clone()));
        let commands = Engine::start(config, factory, queue, shared.clone());
        Ok(Pool { commands, shared })
    }
}

/// Handle to a running task-execution pool
///
/// Submission never blocks: it returns once the scheduler accepts the
/// task, and the awaited future resolves when a worker responds or the
/// task is cancelled or dropped at teardown. Handles are cheap to clone;
/// dropping the last one tears the pool down in the background.
#[derive(Clone, Debug)]
pub struct Pool {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Pool over the given handlers with default wiring
    pub fn new(runner: RunnerRegistry, options: PoolOptions) -> Result<Pool> {
        Pool::builder().runner(runner).options(options).build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Run one task with the pool's default target
    pub async fn submit(&self, payload: Value) -> Result<Value> {
        self.submit_with(payload, SubmitOptions::default()).await
    }

    /// Run one task
    ///
    /// Admission failures (no resolvable target, full queue, cancelled
    /// token) reject without touching any worker.
    pub async fn submit_with(&self, payload: Value, options: SubmitOptions) -> Result<Value> {
        let config = self.shared.config();
        let Some(target_file) = options.target_file.or_else(|| config.target_file.clone())
        else {
            return Err(PoolError::MissingTarget);
        };
        let target_name = options
            .target_name
            .unwrap_or_else(|| config.target_name.clone());
        if let Some(cancel) = options.cancellation.as_ref() {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
        }

        let (responder, outcome) = oneshot::channel();
        let mut task = TaskRecord::new(target_file, target_name, payload, responder)
            .with_attachments(options.attachments)
            .with_queue_options(options.queue_options)
            .with_channel(options.channel)
            .with_completion_counter(self.shared.completed_counter());
        if let Some(cancel) = options.cancellation {
            task = task.with_cancellation(cancel);
        }

        if let Err(rejected) = self.commands.send(Command::Submit(task)) {
            if let Command::Submit(task) = rejected.0 {
                task.fail(PoolError::Terminating);
            }
        }
        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Terminating),
        }
    }

    /// Tear the pool down, waiting for workers to exit
    pub async fn destroy(&self) -> Result<()> {
        self.destroy_with(DestroyOptions::default()).await
    }

    /// Tear the pool down with an explicit exit-wait window
    ///
    /// Fails with a terminate-timeout error when a worker outlives the
    /// window; resources are still reclaimed once it exits.
    pub async fn destroy_with(&self, options: DestroyOptions) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(Command::Destroy {
                timeout: options.timeout,
                reply,
            })
            .is_err()
        {
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }

    /// Fail every queued task with a cancellation error
    ///
    /// Running tasks are untouched. Returns how many tasks were dropped.
    pub async fn cancel_queued_tasks(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self
            .commands
            .send(Command::CancelQueued { reply })
            .is_err()
        {
            return 0;
        }
        count.await.unwrap_or(0)
    }

    /// Replace current workers with fresh ones
    pub async fn recycle(&self) -> Result<()> {
        self.recycle_with(RecycleOptions::default()).await
    }

    /// Replace current workers, optionally changing runtime or isolation
    ///
    /// Resolves once every worker that was idle at the time of the call
    /// has exited; busy workers are replaced as their tasks finish.
    pub async fn recycle_with(&self, options: RecycleOptions) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(Command::Recycle {
                runtime: options.runtime,
                isolate_workers: options.isolate_workers,
                reply,
            })
            .is_err()
        {
            return Err(PoolError::Terminating);
        }
        done.await.unwrap_or(Err(PoolError::Terminating))
    }

    /// Tasks waiting for a worker, net of capacity already being started
    pub fn queue_depth(&self) -> usize {
        self.shared.queue_depth()
    }

    /// Ids of live workers, starting tier first
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.shared.worker_ids()
    }

    /// Tasks currently running on workers
    pub fn active_tasks(&self) -> usize {
        self.shared.active_tasks()
    }

    /// Tasks resolved since construction
    pub fn completed(&self) -> u64 {
        self.shared.completed()
    }

    /// Time since construction
    pub fn elapsed(&self) -> Duration {
        self.shared.elapsed()
    }

    /// Configuration as resolved at construction
    ///
    /// A snapshot: the two fields a recycle can change afterwards are
    /// served live by [`runtime`](Self::runtime) and
    /// [`isolate_workers`](Self::isolate_workers) instead.
    pub fn config(&self) -> &PoolConfig {
        self.shared.config()
    }

    /// Runtime new workers will use
    pub fn runtime(&self) -> RuntimeKind {
        self.shared.runtime()
    }

    /// Whether workers are currently replaced after every task
    pub fn isolate_workers(&self) -> bool {
        self.shared.isolate_workers()
    }

    /// Pool-level notifications: queue drains and unattributed errors
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.subscribe()
    }
}
