//! Scheduling engine
//!
//! One task owns every piece of mutable pool state: the task queue, the
//! worker set, the retirement list, and the id free-list. Everything else
//! talks to it over channels, so no state here needs a lock.
//!
//! Three inbound channels with distinct lifetimes:
//! - commands, held only by the facade; closure means the pool was
//!   dropped and doubles as an implicit destroy
//! - cancels, fed by per-task watcher tasks the engine itself spawns
//! - events, fed by execution-context adapters, keyed by slot token

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use threadmill_core::config::{PoolConfig, RuntimeKind};
use threadmill_core::error::{ConfigError, PoolError};
use threadmill_core::message::{RequestMessage, ResponseMessage, StartupMessage};
use threadmill_core::queue::TaskQueue;
use threadmill_core::task::{TaskId, TaskRecord};
use threadmill_runtime::context::{ContextFactory, EventSender, SlotToken, SpawnSpec, WorkerEvent};
use threadmill_runtime::signal::SignalPair;

use crate::set::WorkerSet;
use crate::shared::{PoolEvent, PoolShared};
use crate::slot::{RetireReason, RetiringSlot, WorkerSlot};

/// Requests the facade sends to the engine
pub(crate) enum Command {
    Submit(TaskRecord),
    CancelQueued {
        reply: oneshot::Sender<usize>,
    },
    Recycle {
        runtime: Option<RuntimeKind>,
        isolate_workers: Option<bool>,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Destroy {
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
}

/// An administrative recycle waiting for idle workers to exit
struct RecycleState {
    waiting: HashSet<SlotToken>,
    replies: Vec<oneshot::Sender<Result<(), PoolError>>>,
    failed: bool,
}

pub(crate) struct Engine {
    config: PoolConfig,
    factory: Arc<dyn ContextFactory>,
    shared: Arc<PoolShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,
    cancels_tx: mpsc::UnboundedSender<TaskId>,
    cancels: mpsc::UnboundedReceiver<TaskId>,
    events_tx: EventSender,
    events: mpsc::UnboundedReceiver<(SlotToken, WorkerEvent)>,
    workers: WorkerSet,
    retiring: HashMap<SlotToken, RetiringSlot>,
    queue: Box<dyn TaskQueue>,
    skip: VecDeque<TaskRecord>,
    runtime: RuntimeKind,
    bootstrap_failed: bool,
    destroying: bool,
    destroy_failed: bool,
    destroy_replies: Vec<oneshot::Sender<Result<(), PoolError>>>,
    recycle: Option<RecycleState>,
}

impl Engine {
    /// Spawn the engine task and hand back its command channel
    pub(crate) fn start(
        config: PoolConfig,
        factory: Arc<dyn ContextFactory>,
        queue: Box<dyn TaskQueue>,
        shared: Arc<PoolShared>,
    ) -> mpsc::UnboundedSender<Command> {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (cancels_tx, cancels) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let max_threads = config.max_threads;
        let runtime = config.runtime;
        let engine = Engine {
            config,
            factory,
            shared,
            commands,
            commands_closed: false,
            cancels_tx,
            cancels,
            events_tx,
            events,
            workers: WorkerSet::new(max_threads),
            retiring: HashMap::new(),
            queue,
            skip: VecDeque::new(),
            runtime,
            bootstrap_failed: false,
            destroying: false,
            destroy_failed: false,
            destroy_replies: Vec::new(),
            recycle: None,
        };
        tokio::spawn(engine.run());
        commands_tx
    }

    async fn run(mut self) {
        self.bootstrap();
        self.sync_shared();
        loop {
            if self.is_finished() {
                break;
            }
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            self.commands_closed = true;
                            self.begin_destroy(None, None);
                        }
                    }
                }
                cancelled = self.cancels.recv() => {
                    if let Some(id) = cancelled {
                        self.cancel_task(id);
                    }
                }
                event = self.events.recv() => {
                    if let Some((token, event)) = event {
                        self.handle_event(token, event);
                    }
                }
                _ = maybe_sleep(deadline) => self.on_deadline(),
            }
            self.drain_fast_path();
            self.sync_shared();
        }
        debug!("scheduler loop finished");
    }

    /// Bring up the minimum worker count
    ///
    /// The first batch counts as ready immediately; nothing is gained by
    /// holding work back until their startup confirmations arrive.
    fn bootstrap(&mut self) {
        for _ in 0..self.config.min_threads {
            if !self.spawn_worker() {
                break;
            }
        }
        for token in self.workers.tokens() {
            self.workers.mark_ready(token);
        }
    }

    fn is_finished(&self) -> bool {
        self.destroying
            && self.workers.len() == 0
            && self.retiring.values().all(|ret| ret.timed_out)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(task) => self.handle_submit(task),
            Command::CancelQueued { reply } => {
                let cancelled = self.queue.size();
                self.queue.cancel();
                let _ = reply.send(cancelled);
            }
            Command::Recycle {
                runtime,
                isolate_workers,
                reply,
            } => self.begin_recycle(runtime, isolate_workers, reply),
            Command::Destroy { timeout, reply } => self.begin_destroy(timeout, Some(reply)),
        }
    }

    fn handle_submit(&mut self, mut task: TaskRecord) {
        if self.destroying {
            task.fail(PoolError::Terminating);
            return;
        }
        let cancel = task.cancel_token().cloned();
        if let Some(cancel) = cancel {
            if cancel.is_cancelled() {
                task.fail(PoolError::Cancelled);
                return;
            }
            let id = task.id();
            let cancels = self.cancels_tx.clone();
            task.set_cancel_watcher(tokio::spawn(async move {
                cancel.cancelled().await;
                let _ = cancels.send(id);
            }));
        }
        self.admit(task);
    }

    /// Admission control for one new task
    fn admit(&mut self, task: TaskRecord) {
        let concurrent = self.config.concurrent_tasks_per_worker;

        // A non-empty queue means this task waits behind it regardless of
        // worker availability, so only the capacity check matters.
        if self.queue.size() > 0 {
            if let Some(max_queue) = self.config.max_queue {
                let capacity = max_queue + self.workers.pending_count() * concurrent;
                if self.queue.size() >= capacity {
                    if max_queue == 0 {
                        task.fail(PoolError::NoQueueAvailable);
                    } else {
                        task.fail(PoolError::QueueAtLimit);
                    }
                    return;
                }
            }
            if self.workers.len() < self.config.max_threads {
                self.spawn_worker();
            }
            self.queue.push(task);
            return;
        }

        let cancellable = task.is_cancellable();
        let found = self.workers.find_available(concurrent, cancellable);
        let wants_growth = match found {
            None => true,
            Some(token) => self
                .workers
                .get(token)
                .and_then(WorkerSlot::usage)
                .is_some_and(|usage| usage > 0),
        };
        let mut spawned = false;
        if wants_growth && self.workers.len() < self.config.max_threads {
            spawned = self.spawn_worker();
        }
        match found {
            Some(token) => self.dispatch(token, task),
            None => {
                let queue_allowed = self.config.max_queue.is_none_or(|limit| limit > 0);
                if spawned || queue_allowed {
                    self.queue.push(task);
                } else {
                    task.fail(PoolError::NoQueueAvailable);
                }
            }
        }
    }

    fn dispatch(&mut self, token: SlotToken, task: TaskRecord) {
        if let Some(slot) = self.workers.get_mut(token) {
            slot.post_task(task);
        } else {
            task.fail(PoolError::transport(
                "selected worker disappeared before dispatch",
            ));
        }
        self.maybe_drain();
    }

    fn maybe_drain(&self) {
        if self.queue.is_empty() && self.skip.is_empty() {
            self.shared.emit(PoolEvent::Drain);
        }
    }

    /// Feed queued work to a slot with spare capacity
    fn on_worker_available(&mut self, token: SlotToken) {
        let limit = self.config.concurrent_tasks_per_worker;
        loop {
            let running = {
                let Some(slot) = self.workers.get(token) else {
                    return;
                };
                match slot.usage() {
                    Some(usage) if usage < limit => slot.running_count(),
                    _ => break,
                }
            };
            let Some(task) = self.skip.pop_front().or_else(|| self.queue.shift()) else {
                break;
            };
            if task.is_cancellable() && running > 0 {
                // exclusivity: a cancellable task waits for an empty slot
                self.skip.push_back(task);
                break;
            }
            self.dispatch(token, task);
        }
        self.refresh_idle_timer(token);
    }

    /// Arm or rearm the idle eviction timer on a now-idle slot
    fn refresh_idle_timer(&mut self, token: SlotToken) {
        let above_min = self.workers.len() > self.config.min_threads;
        let deadline = Instant::now() + self.config.idle_timeout;
        let destroying = self.destroying;
        let Some(slot) = self.workers.get_mut(token) else {
            return;
        };
        if slot.running_count() == 0 && above_min && !destroying {
            slot.set_idle_deadline(deadline);
        }
    }

    fn handle_event(&mut self, token: SlotToken, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready => self.on_worker_ready(token),
            WorkerEvent::Wake => self.pump_responses(token),
            WorkerEvent::Failed { message } => self.on_worker_failed(token, message),
            WorkerEvent::Exited => self.on_worker_exited(token),
        }
    }

    fn on_worker_ready(&mut self, token: SlotToken) {
        if self.workers.mark_ready(token) {
            if let Some(slot) = self.workers.get(token) {
                debug!(worker_id = slot.worker_id().as_u32(), "worker ready");
            }
        }
        if self.workers.get(token).is_some_and(WorkerSlot::is_ready) {
            self.on_worker_available(token);
        }
    }

    /// Pull every buffered response a wake notification points at
    fn pump_responses(&mut self, token: SlotToken) {
        loop {
            let response = if let Some(slot) = self.workers.get_mut(token) {
                slot.recv_buffered()
            } else if let Some(ret) = self.retiring.get_mut(&token) {
                ret.context.try_recv_response()
            } else {
                return;
            };
            let Some(response) = response else {
                return;
            };
            self.handle_response_msg(token, response);
        }
    }

    fn handle_response_msg(&mut self, token: SlotToken, response: ResponseMessage) {
        if self.retiring.contains_key(&token) {
            self.handle_retiring_response(token, response);
            return;
        }
        let Some(slot) = self.workers.get_mut(token) else {
            debug!(token = token.as_u64(), "response from an unknown worker context");
            return;
        };
        let Some((task, outcome)) = slot.take_response(response) else {
            return;
        };
        if self.should_recycle(token) {
            // the old worker's exit and the replacement's spawn both land
            // inside this task's completion latency
            let deadline = self.terminate_deadline(None);
            self.retire_slot(token, RetireReason::TaskRecycle, Some((task, outcome)), deadline);
        } else {
            task.resolve(outcome);
            self.on_worker_available(token);
        }
    }

    fn should_recycle(&self, token: SlotToken) -> bool {
        let Some(slot) = self.workers.get(token) else {
            return false;
        };
        if slot.marked_for_recycle() {
            return true;
        }
        if self.config.isolate_workers {
            return true;
        }
        if let Some(limit) = self.config.max_memory_before_recycle {
            if slot.last_memory().is_some_and(|memory| memory > limit) {
                return true;
            }
        }
        false
    }

    /// Responses from a retiring worker: its teardown hook, or a task
    /// that finished in the window before termination took effect
    fn handle_retiring_response(&mut self, token: SlotToken, response: ResponseMessage) {
        let Some(ret) = self.retiring.get_mut(&token) else {
            return;
        };
        if ret.teardown == Some(response.task_id) {
            ret.teardown = None;
            ret.context.terminate();
            return;
        }
        if let Some(position) = ret
            .running
            .iter()
            .position(|task| task.id() == response.task_id)
        {
            let task = ret.running.remove(position);
            let outcome = match response.error {
                Some(message) => Err(PoolError::execution(message)),
                None => Ok(response.result),
            };
            task.resolve(outcome);
        }
    }

    fn on_worker_failed(&mut self, token: SlotToken, message: String) {
        if self.retiring.contains_key(&token) {
            debug!(message, "retiring worker reported an error");
            return;
        }
        let Some(slot) = self.workers.remove(token) else {
            return;
        };
        let worker_id = slot.worker_id();
        let was_ready = slot.is_ready();
        warn!(worker_id = worker_id.as_u32(), message, "worker failed");
        self.workers.release_id(worker_id);
        let deadline = self.terminate_deadline(None);
        let mut ret = slot.into_retiring(RetireReason::Failure, deadline, None);
        let running = std::mem::take(&mut ret.running);
        if running.is_empty() {
            self.shared.emit(PoolEvent::Error {
                message: message.clone(),
            });
        } else {
            for task in running {
                task.fail(PoolError::worker_failed(message.as_str()));
            }
        }
        ret.context.terminate();
        self.retiring.insert(token, ret);
        if !was_ready {
            // a worker that never came up points at a startup problem;
            // respawning would loop on it
            self.bootstrap_failed = true;
        } else if !self.bootstrap_failed {
            self.ensure_minimum_workers();
        }
    }

    fn on_worker_exited(&mut self, token: SlotToken) {
        if self.retiring.contains_key(&token) {
            self.finish_retirement(token);
            return;
        }
        if self.workers.get(token).is_some() {
            self.on_worker_failed(token, "worker exited unexpectedly".to_string());
            self.finish_retirement(token);
        }
    }

    fn finish_retirement(&mut self, token: SlotToken) {
        let Some(mut ret) = self.retiring.remove(&token) else {
            return;
        };
        if ret.timed_out {
            // everything was concluded when the deadline fired; the late
            // exit just drops the context
            self.check_destroy_complete();
            return;
        }
        for task in ret.running.drain(..) {
            task.fail(PoolError::Terminating);
        }
        if ret.reason == RetireReason::TaskRecycle {
            self.ensure_minimum_workers();
            self.ensure_enough_for_queue();
        }
        for (task, outcome) in ret.stashed.drain(..) {
            task.resolve(outcome);
        }
        if ret.reason == RetireReason::AdminRecycle {
            self.conclude_recycle_member(token, false);
        }
        self.check_destroy_complete();
    }

    fn on_teardown_timeout(&mut self, token: SlotToken) {
        let Some(ret) = self.retiring.get_mut(&token) else {
            return;
        };
        if ret.timed_out {
            return;
        }
        ret.timed_out = true;
        ret.deadline = None;
        ret.teardown = None;
        warn!(
            worker_id = ret.worker_id.as_u32(),
            "worker did not exit within the termination window"
        );
        ret.context.terminate();
        let running: Vec<_> = ret.running.drain(..).collect();
        let stashed: Vec<_> = ret.stashed.drain(..).collect();
        let reason = ret.reason;
        for task in running {
            task.fail(PoolError::Terminating);
        }
        if reason == RetireReason::TaskRecycle && !self.destroying {
            self.ensure_minimum_workers();
            self.ensure_enough_for_queue();
        }
        for (task, outcome) in stashed {
            task.resolve(outcome);
        }
        match reason {
            RetireReason::AdminRecycle => self.conclude_recycle_member(token, true),
            RetireReason::Destroy => self.destroy_failed = true,
            _ => {}
        }
        self.check_destroy_complete();
    }

    fn conclude_recycle_member(&mut self, token: SlotToken, failed: bool) {
        let finished = match self.recycle.as_mut() {
            Some(state) => {
                if !state.waiting.remove(&token) {
                    return;
                }
                if failed {
                    state.failed = true;
                }
                state.waiting.is_empty()
            }
            None => return,
        };
        if !finished {
            return;
        }
        let Some(state) = self.recycle.take() else {
            return;
        };
        self.ensure_minimum_workers();
        self.ensure_enough_for_queue();
        for reply in state.replies {
            let _ = reply.send(if state.failed {
                Err(PoolError::TerminateTimeout)
            } else {
                Ok(())
            });
        }
    }

    /// Cancellation signal fired for a task
    fn cancel_task(&mut self, id: TaskId) {
        if let Some(position) = self.skip.iter().position(|task| task.id() == id) {
            if let Some(task) = self.skip.remove(position) {
                task.fail(PoolError::Cancelled);
            }
            return;
        }
        if let Some(token) = self.workers.find_running(id) {
            let task = self
                .workers
                .get_mut(token)
                .and_then(|slot| slot.take_running(id));
            if let Some(task) = task {
                task.fail(PoolError::Cancelled);
            }
            // no cooperative interruption: the worker dies with the task
            let deadline = self.terminate_deadline(None);
            self.retire_slot(token, RetireReason::CancelKill, None, deadline);
            self.ensure_minimum_workers();
            return;
        }
        if let Some(task) = self.queue.remove(id) {
            task.fail(PoolError::Cancelled);
            return;
        }
        debug!(task_id = %id, "cancellation raced with completion");
    }

    /// Move a slot into the retirement list and start its shutdown
    fn retire_slot(
        &mut self,
        token: SlotToken,
        reason: RetireReason,
        stash: Option<(TaskRecord, Result<Value, PoolError>)>,
        deadline: Option<Instant>,
    ) {
        let Some(slot) = self.workers.remove(token) else {
            return;
        };
        debug!(worker_id = slot.worker_id().as_u32(), ?reason, "retiring worker");
        // the id frees as soon as the slot leaves the set; the token keeps
        // late events from the old context away from any id reuser
        self.workers.release_id(slot.worker_id());
        let mut ret = slot.into_retiring(reason, deadline, stash);
        if reason == RetireReason::Failure || !self.post_teardown(&mut ret) {
            ret.context.terminate();
        }
        self.retiring.insert(token, ret);
    }

    /// Run the configured teardown handler as one last internal task
    fn post_teardown(&self, ret: &mut RetiringSlot) -> bool {
        let Some(teardown) = self.config.teardown.clone() else {
            return false;
        };
        let Some(target_file) = self.config.target_file.clone() else {
            warn!("teardown handler configured without a default target file");
            return false;
        };
        let request = RequestMessage {
            task_id: TaskId::next(),
            payload: Value::Null,
            attachments: Vec::new(),
            target_file,
            target_name: teardown,
        };
        let task_id = request.task_id;
        match ret.context.post_request(request) {
            Ok(()) => {
                ret.teardown = Some(task_id);
                true
            }
            Err(err) => {
                debug!(error = %err, "teardown dispatch failed");
                false
            }
        }
    }

    fn begin_destroy(
        &mut self,
        timeout: Option<Duration>,
        reply: Option<oneshot::Sender<Result<(), PoolError>>>,
    ) {
        if let Some(reply) = reply {
            self.destroy_replies.push(reply);
        }
        if self.destroying {
            self.check_destroy_complete();
            return;
        }
        info!("destroying pool");
        self.destroying = true;
        if let Some(state) = self.recycle.take() {
            for reply in state.replies {
                let _ = reply.send(Err(PoolError::Terminating));
            }
        }
        for task in self.skip.drain(..) {
            task.fail(PoolError::Terminating);
        }
        while let Some(task) = self.queue.shift() {
            task.fail(PoolError::Terminating);
        }
        let deadline = self.terminate_deadline(timeout);
        for token in self.workers.tokens() {
            self.retire_slot(token, RetireReason::Destroy, None, deadline);
        }
        self.check_destroy_complete();
    }

    fn check_destroy_complete(&mut self) {
        if !self.destroying || self.workers.len() > 0 {
            return;
        }
        if self.retiring.values().any(|ret| !ret.timed_out) {
            return;
        }
        for reply in self.destroy_replies.drain(..) {
            let _ = reply.send(if self.destroy_failed {
                Err(PoolError::TerminateTimeout)
            } else {
                Ok(())
            });
        }
    }

    fn begin_recycle(
        &mut self,
        runtime: Option<RuntimeKind>,
        isolate_workers: Option<bool>,
        reply: oneshot::Sender<Result<(), PoolError>>,
    ) {
        if self.destroying {
            let _ = reply.send(Err(PoolError::Terminating));
            return;
        }
        if runtime == Some(RuntimeKind::Process) && self.config.process.program.is_none() {
            let _ = reply.send(Err(ConfigError::MissingProgram.into()));
            return;
        }
        let runtime_changed = runtime.is_some_and(|kind| kind != self.runtime);
        if let Some(kind) = runtime {
            info!(runtime = %kind, "switching worker runtime");
            self.runtime = kind;
            self.shared.set_runtime(kind);
        }
        if let Some(isolate) = isolate_workers {
            self.config.isolate_workers = isolate;
            self.shared.set_isolate_workers(isolate);
        }
        if self.config.isolate_workers && !runtime_changed {
            // isolation already replaces every worker after its next task
            let _ = reply.send(Ok(()));
            return;
        }
        let deadline = self.terminate_deadline(None);
        let mut waiting = HashSet::new();
        for token in self.workers.tokens() {
            let Some(slot) = self.workers.get_mut(token) else {
                continue;
            };
            if slot.running_count() == 0 {
                waiting.insert(token);
            } else {
                slot.mark_for_recycle();
            }
        }
        for token in &waiting {
            self.retire_slot(*token, RetireReason::AdminRecycle, None, deadline);
        }
        if waiting.is_empty() {
            self.ensure_minimum_workers();
            self.ensure_enough_for_queue();
            let _ = reply.send(Ok(()));
            return;
        }
        match self.recycle.as_mut() {
            Some(state) => {
                state.waiting.extend(waiting);
                state.replies.push(reply);
            }
            None => {
                self.recycle = Some(RecycleState {
                    waiting,
                    replies: vec![reply],
                    failed: false,
                });
            }
        }
    }

    fn spawn_worker(&mut self) -> bool {
        let Some(worker_id) = self.workers.next_worker_id() else {
            warn!("worker id space exhausted");
            return false;
        };
        let token = SlotToken::next();
        let signal = Arc::new(SignalPair::new());
        let fast_path = self.config.use_fast_path && self.runtime == RuntimeKind::Thread;
        let startup = StartupMessage {
            worker_id,
            target_file: self.config.target_file.clone(),
            target_name: self.config.target_name.clone(),
            use_fast_path: fast_path,
            worker_data: self.config.worker_data.clone(),
        };
        let spec = SpawnSpec {
            token,
            startup,
            signal: Arc::clone(&signal),
            events: self.events_tx.clone(),
        };
        match self.factory.spawn(self.runtime, spec) {
            Ok(context) => {
                debug!(
                    worker_id = worker_id.as_u32(),
                    runtime = %self.runtime,
                    "spawned worker"
                );
                self.workers
                    .insert_pending(WorkerSlot::new(worker_id, token, context, signal, fast_path));
                true
            }
            Err(err) => {
                error!(error = %err, "failed to spawn worker");
                self.workers.release_id(worker_id);
                self.shared.emit(PoolEvent::Error {
                    message: err.to_string(),
                });
                false
            }
        }
    }

    fn ensure_minimum_workers(&mut self) {
        if self.destroying {
            return;
        }
        while self.workers.len() < self.config.min_threads {
            if !self.spawn_worker() {
                break;
            }
        }
    }

    /// Grow toward the queue depth without over-provisioning past it
    fn ensure_enough_for_queue(&mut self) {
        if self.destroying {
            return;
        }
        while self.workers.len() < self.queue.size()
            && self.workers.len() < self.config.max_threads
        {
            if !self.spawn_worker() {
                break;
            }
        }
    }

    fn terminate_deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout
            .or(self.config.terminate_timeout)
            .map(|window| Instant::now() + window)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let idle = self.workers.next_idle_deadline();
        let retiring = self.retiring.values().filter_map(|ret| ret.deadline).min();
        match (idle, retiring) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        let expired_idle: Vec<SlotToken> = self
            .workers
            .tokens()
            .into_iter()
            .filter(|token| {
                self.workers
                    .get(*token)
                    .and_then(WorkerSlot::idle_deadline)
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect();
        for token in expired_idle {
            self.evict_idle(token);
        }
        let expired_retiring: Vec<SlotToken> = self
            .retiring
            .iter()
            .filter(|(_, ret)| ret.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(token, _)| *token)
            .collect();
        for token in expired_retiring {
            self.on_teardown_timeout(token);
        }
    }

    fn evict_idle(&mut self, token: SlotToken) {
        let Some(slot) = self.workers.get(token) else {
            return;
        };
        if slot.running_count() > 0 || self.workers.len() <= self.config.min_threads {
            // the slot gained work or the pool shrank since the timer was set
            if let Some(slot) = self.workers.get_mut(token) {
                slot.clear_idle_deadline();
            }
            return;
        }
        debug!(worker_id = slot.worker_id().as_u32(), "evicting idle worker");
        let deadline = self.terminate_deadline(None);
        self.retire_slot(token, RetireReason::Idle, None, deadline);
    }

    /// Synchronous counter-gated drain, run once per loop turn
    fn drain_fast_path(&mut self) {
        let mut collected = Vec::new();
        for slot in self.workers.iter_mut() {
            let token = slot.token();
            for response in slot.drain_pending_responses() {
                collected.push((token, response));
            }
        }
        for (token, response) in collected {
            self.handle_response_msg(token, response);
        }
    }

    fn sync_shared(&self) {
        let pending_capacity =
            self.workers.pending_count() * self.config.concurrent_tasks_per_worker;
        self.shared
            .set_queue_depth(self.queue.size().saturating_sub(pending_capacity));
        self.shared.set_worker_ids(self.workers.worker_ids());
        self.shared.set_active_tasks(self.workers.total_running());
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
