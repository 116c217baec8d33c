//! Task records and identifiers
//!
//! A [`TaskRecord`] follows one submission from admission to resolution.
//! Exactly one resolution ever fires: the responder is consumed on the
//! first `complete`/`fail` and later calls have no effect.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelHandle;
use crate::error::PoolError;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-lifetime-unique task identifier, monotonically increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate the next id
    pub fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Small worker identifier in `1..=max_threads`, reused via a free-list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn new(id: u32) -> Self {
        WorkerId(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel that resolves one task future
pub type TaskResponder = oneshot::Sender<Result<Value, PoolError>>;

/// One submission, from admission to resolution
pub struct TaskRecord {
    id: TaskId,
    target_file: String,
    target_name: String,
    payload: Option<(Value, Vec<Bytes>)>,
    queue_options: Option<Value>,
    created_at: Instant,
    started_at: Option<Instant>,
    cancel: Option<CancellationToken>,
    cancel_watcher: Option<JoinHandle<()>>,
    channel: Option<ChannelHandle>,
    assigned_worker: Option<WorkerId>,
    responder: Option<TaskResponder>,
    completed: Option<Arc<AtomicU64>>,
}

impl TaskRecord {
    /// Create a record with a fresh id
    pub fn new(
        target_file: impl Into<String>,
        target_name: impl Into<String>,
        payload: Value,
        responder: TaskResponder,
    ) -> Self {
        TaskRecord {
            id: TaskId::next(),
            target_file: target_file.into(),
            target_name: target_name.into(),
            payload: Some((payload, Vec::new())),
            queue_options: None,
            created_at: Instant::now(),
            started_at: None,
            cancel: None,
            cancel_watcher: None,
            channel: None,
            assigned_worker: None,
            responder: Some(responder),
            completed: None,
        }
    }

    /// Attach binary payloads sent alongside the task
    pub fn with_attachments(mut self, attachments: Vec<Bytes>) -> Self {
        if let Some((_, slot)) = self.payload.as_mut() {
            *slot = attachments;
        }
        self
    }

    /// Attach an opaque value visible to custom queues
    pub fn with_queue_options(mut self, options: Option<Value>) -> Self {
        self.queue_options = options;
        self
    }

    /// Attach a cancellation signal
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Attach an out-of-band channel bound at dispatch time
    pub fn with_channel(mut self, channel: Option<ChannelHandle>) -> Self {
        self.channel = channel;
        self
    }

    /// Count this record's resolution in the given counter
    pub fn with_completion_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.completed = Some(counter);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn target_file(&self) -> &str {
        &self.target_file
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Opaque value for custom queue implementations
    pub fn queue_options(&self) -> Option<&Value> {
        self.queue_options.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the task was handed to a worker, if it has been
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Worker currently running the task, if any
    pub fn assigned_worker(&self) -> Option<WorkerId> {
        self.assigned_worker
    }

    /// Whether the submission carried a cancellation signal
    pub fn is_cancellable(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Keep the watcher task so it can be aborted on resolution
    pub fn set_cancel_watcher(&mut self, watcher: JoinHandle<()>) {
        self.cancel_watcher = Some(watcher);
    }

    /// Detach the payload for serialization; it is sent at most once
    pub fn release_payload(&mut self) -> Option<(Value, Vec<Bytes>)> {
        self.payload.take()
    }

    /// Detach the out-of-band channel for binding
    pub fn take_channel(&mut self) -> Option<ChannelHandle> {
        self.channel.take()
    }

    /// Mark the record as dispatched to a worker
    pub fn mark_started(&mut self, worker: WorkerId) {
        self.started_at = Some(Instant::now());
        self.assigned_worker = Some(worker);
    }

    /// Whether the record has already resolved
    pub fn is_resolved(&self) -> bool {
        self.responder.is_none()
    }

    /// Resolve the task future with a result
    pub fn complete(self, result: Value) {
        self.finish(Ok(result));
    }

    /// Resolve the task future with a failure
    pub fn fail(self, error: PoolError) {
        self.finish(Err(error));
    }

    /// Resolve with a prepared outcome
    pub fn resolve(self, outcome: Result<Value, PoolError>) {
        self.finish(outcome);
    }

    fn finish(mut self, outcome: Result<Value, PoolError>) {
        let Some(responder) = self.responder.take() else {
            return;
        };
        if let Some(watcher) = self.cancel_watcher.take() {
            watcher.abort();
        }
        if let Some(completed) = self.completed.take() {
            completed.fetch_add(1, Ordering::Relaxed);
        }
        // A dropped receiver means the submitter stopped waiting.
        let _ = responder.send(outcome);
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("target_file", &self.target_file)
            .field("target_name", &self.target_name)
            .field("cancellable", &self.is_cancellable())
            .field("assigned_worker", &self.assigned_worker)
            .finish()
    }
}

impl Drop for TaskRecord {
    fn drop(&mut self) {
        if self.responder.is_some() {
            tracing::error!(task_id = %self.id, "task record dropped without resolution");
        }
    }
}
