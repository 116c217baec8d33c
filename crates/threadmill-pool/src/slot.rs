//! Per-worker slot bookkeeping
//!
//! A [`WorkerSlot`] pairs one execution context with the tasks currently
//! running on it. Once eviction, recycling, failure, or teardown picks a
//! slot, it turns into a [`RetiringSlot`] that only waits for the exit.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use threadmill_core::error::PoolError;
use threadmill_core::message::{RequestMessage, ResponseMessage};
use threadmill_core::task::{TaskId, TaskRecord, WorkerId};
use threadmill_runtime::context::{ExecutionContext, SlotToken};
use threadmill_runtime::signal::SignalPair;

pub(crate) struct WorkerSlot {
    worker_id: WorkerId,
    token: SlotToken,
    context: Box<dyn ExecutionContext>,
    signal: Arc<SignalPair>,
    running: HashMap<TaskId, TaskRecord>,
    ready: bool,
    fast_path: bool,
    idle_deadline: Option<Instant>,
    last_seen_responses: u32,
    last_memory: Option<u64>,
    recycle_flag: bool,
    keep_alive: bool,
}

impl WorkerSlot {
    pub(crate) fn new(
        worker_id: WorkerId,
        token: SlotToken,
        context: Box<dyn ExecutionContext>,
        signal: Arc<SignalPair>,
        fast_path: bool,
    ) -> Self {
        WorkerSlot {
            worker_id,
            token,
            context,
            signal,
            running: HashMap::new(),
            ready: false,
            fast_path,
            idle_deadline: None,
            last_seen_responses: 0,
            last_memory: None,
            recycle_flag: false,
            keep_alive: false,
        }
    }

    pub(crate) fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub(crate) fn token(&self) -> SlotToken {
        self.token
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub(crate) fn running_count(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn has_running(&self, id: TaskId) -> bool {
        self.running.contains_key(&id)
    }

    /// Capacity measure for worker selection
    ///
    /// `None` means unavailable: a slot whose single running task is
    /// cancellable takes no further work, so the whole worker dies with
    /// the task if the signal ever fires.
    pub(crate) fn usage(&self) -> Option<usize> {
        if self.running.len() == 1
            && self
                .running
                .values()
                .next()
                .is_some_and(|task| task.is_cancellable())
        {
            None
        } else {
            Some(self.running.len())
        }
    }

    pub(crate) fn last_memory(&self) -> Option<u64> {
        self.last_memory
    }

    pub(crate) fn mark_for_recycle(&mut self) {
        self.recycle_flag = true;
    }

    pub(crate) fn marked_for_recycle(&self) -> bool {
        self.recycle_flag
    }

    pub(crate) fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    pub(crate) fn set_idle_deadline(&mut self, deadline: Instant) {
        self.idle_deadline = Some(deadline);
    }

    pub(crate) fn clear_idle_deadline(&mut self) {
        self.idle_deadline = None;
    }

    /// Send one task to the worker
    ///
    /// On any delivery failure the record is resolved in place and the
    /// slot's running state stays untouched.
    pub(crate) fn post_task(&mut self, mut task: TaskRecord) {
        debug_assert!(
            !self.running.contains_key(&task.id()),
            "task already running on this worker"
        );
        let Some((payload, attachments)) = task.release_payload() else {
            warn!(task_id = %task.id(), "task payload was already consumed");
            task.fail(PoolError::transport("task payload already consumed"));
            return;
        };
        let request = RequestMessage {
            task_id: task.id(),
            payload,
            attachments,
            target_file: task.target_file().to_string(),
            target_name: task.target_name().to_string(),
        };
        if let Some(channel) = task.take_channel() {
            if let Err(err) = self.context.bind_channel(channel) {
                task.fail(err.into());
                return;
            }
        }
        if let Err(err) = self.context.post_request(request) {
            task.fail(err.into());
            return;
        }
        task.mark_started(self.worker_id);
        self.running.insert(task.id(), task);
        self.idle_deadline = None;
        self.set_keep_alive(true);
    }

    /// Match a worker response to its running record
    ///
    /// Returns the record plus the outcome it should resolve with; the
    /// caller decides when, because recycling delays the resolution.
    pub(crate) fn take_response(
        &mut self,
        response: ResponseMessage,
    ) -> Option<(TaskRecord, Result<Value, PoolError>)> {
        if let Some(memory) = response.used_memory {
            self.last_memory = Some(memory);
        }
        let Some(task) = self.running.remove(&response.task_id) else {
            debug!(task_id = %response.task_id, "response for a task no longer tracked");
            return None;
        };
        if self.running.is_empty() {
            self.set_keep_alive(false);
        }
        let outcome = match response.error {
            Some(message) => Err(PoolError::execution(message)),
            None => Ok(response.result),
        };
        Some((task, outcome))
    }

    /// Pull a running record out, as cancellation does
    pub(crate) fn take_running(&mut self, id: TaskId) -> Option<TaskRecord> {
        let task = self.running.remove(&id)?;
        if self.running.is_empty() {
            self.set_keep_alive(false);
        }
        Some(task)
    }

    pub(crate) fn recv_buffered(&mut self) -> Option<ResponseMessage> {
        self.context.try_recv_response()
    }

    /// Counter-gated synchronous drain for the fast path
    pub(crate) fn drain_pending_responses(&mut self) -> Vec<ResponseMessage> {
        if !self.fast_path {
            return Vec::new();
        }
        let live = self.signal.responses();
        if live == self.last_seen_responses {
            return Vec::new();
        }
        self.last_seen_responses = live;
        let mut drained = Vec::new();
        while let Some(response) = self.context.try_recv_response() {
            drained.push(response);
        }
        drained
    }

    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        if self.keep_alive != keep_alive {
            self.keep_alive = keep_alive;
            self.context.set_keep_alive(keep_alive);
        }
    }

    pub(crate) fn into_retiring(
        self,
        reason: RetireReason,
        deadline: Option<Instant>,
        stash: Option<(TaskRecord, Result<Value, PoolError>)>,
    ) -> RetiringSlot {
        RetiringSlot {
            worker_id: self.worker_id,
            context: self.context,
            running: self.running.into_values().collect(),
            stashed: stash.into_iter().collect(),
            teardown: None,
            deadline,
            reason,
            timed_out: false,
        }
    }
}

/// Why a slot left the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetireReason {
    /// Idle longer than the configured timeout
    Idle,
    /// Replaced after finishing a task (isolation, memory, recycle flag)
    TaskRecycle,
    /// Killed because its running task was cancelled
    CancelKill,
    /// The worker itself failed
    Failure,
    /// Removed by an explicit recycle call
    AdminRecycle,
    /// Pool teardown
    Destroy,
}

/// A slot waiting for its worker to exit
pub(crate) struct RetiringSlot {
    pub(crate) worker_id: WorkerId,
    pub(crate) context: Box<dyn ExecutionContext>,
    /// Tasks still attributed to the worker; failed once it is gone
    pub(crate) running: Vec<TaskRecord>,
    /// Completions held back until the replacement worker exists
    pub(crate) stashed: Vec<(TaskRecord, Result<Value, PoolError>)>,
    /// In-flight teardown-hook request, if one was posted
    pub(crate) teardown: Option<TaskId>,
    /// When to stop waiting for the exit
    pub(crate) deadline: Option<Instant>,
    pub(crate) reason: RetireReason,
    pub(crate) timed_out: bool,
}
