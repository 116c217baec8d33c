//! Thread-backed execution context
//!
//! Topology: requests flow to the worker over one crossbeam channel,
//! responses come back on a second one drained synchronously by the pool,
//! and lifecycle events ride the scheduler's event channel. With the fast
//! path on, an idle worker parks on the shared request counter instead of
//! blocking on the channel, and the pool-side unpark doubles as the wake
//! notification.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use crossbeam_utils::sync::{Parker, Unparker};
use tracing::debug;

use threadmill_core::channel::ChannelHandle;
use threadmill_core::config::{ResourceLimits, RuntimeKind};
use threadmill_core::error::TransportError;
use threadmill_core::message::{RequestMessage, ResponseMessage, StartupMessage};

use crate::context::{EventSender, ExecutionContext, SlotToken, SpawnSpec, WorkerEvent};
use crate::memory::MemoryProbe;
use crate::runner::{execute_request, TaskRunner, WorkerContext};
use crate::signal::SignalPair;

enum WorkerOrder {
    Run(RequestMessage),
    Terminate,
}

/// Pool-side handle to one worker thread
pub struct ThreadContext {
    orders: Sender<WorkerOrder>,
    responses: Receiver<ResponseMessage>,
    unparker: Unparker,
    signal: Arc<SignalPair>,
}

impl ThreadContext {
    pub fn spawn(
        spec: SpawnSpec,
        runner: Arc<dyn TaskRunner>,
        limits: ResourceLimits,
    ) -> Result<Self, TransportError> {
        let (orders_tx, orders_rx) = unbounded();
        let (responses_tx, responses_rx) = unbounded();
        let parker = Parker::new();
        let unparker = parker.unparker().clone();

        let worker = WorkerLoop {
            startup: spec.startup,
            token: spec.token,
            events: spec.events,
            signal: spec.signal.clone(),
            orders: orders_rx,
            responses: responses_tx,
            parker,
            runner,
        };

        let mut builder =
            thread::Builder::new().name(format!("threadmill-worker-{}", worker.startup.worker_id));
        if let Some(stack_size) = limits.stack_size {
            builder = builder.stack_size(stack_size);
        }
        builder
            .spawn(move || worker.run())
            .map_err(|err| TransportError::new(format!("failed to spawn worker thread: {err}")))?;

        Ok(ThreadContext {
            orders: orders_tx,
            responses: responses_rx,
            unparker,
            signal: spec.signal,
        })
    }
}

impl ExecutionContext for ThreadContext {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Thread
    }

    fn post_request(&mut self, request: RequestMessage) -> Result<(), TransportError> {
        self.orders
            .send(WorkerOrder::Run(request))
            .map_err(|_| TransportError::new("worker thread is gone"))?;
        // Counter first, wake second: a worker that parks re-checks the
        // counter before sleeping, so the request cannot be missed.
        self.signal.add_request();
        self.unparker.unpark();
        Ok(())
    }

    fn try_recv_response(&mut self) -> Option<ResponseMessage> {
        self.responses.try_recv().ok()
    }

    fn bind_channel(&mut self, _channel: ChannelHandle) -> Result<(), TransportError> {
        Err(TransportError::new(
            "the thread runtime does not support task channels",
        ))
    }

    fn terminate(&mut self) {
        let _ = self.orders.send(WorkerOrder::Terminate);
        self.unparker.unpark();
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        // Wake a parked worker so it can observe the disconnect.
        self.unparker.unpark();
    }
}

/// Sends an exit notification on every way out of the worker loop,
/// panics included
struct ExitGuard {
    token: SlotToken,
    events: EventSender,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.events.send((self.token, WorkerEvent::Exited));
    }
}

struct WorkerLoop {
    startup: StartupMessage,
    token: SlotToken,
    events: EventSender,
    signal: Arc<SignalPair>,
    orders: Receiver<WorkerOrder>,
    responses: Sender<ResponseMessage>,
    parker: Parker,
    runner: Arc<dyn TaskRunner>,
}

impl WorkerLoop {
    fn run(self) {
        let _exit = ExitGuard {
            token: self.token,
            events: self.events.clone(),
        };

        // Pre-load the default target so the first request pays no
        // resolution cost. Failures stay per-task.
        if let Some(file) = &self.startup.target_file {
            if let Err(err) = self.runner.resolve(file, &self.startup.target_name) {
                debug!(worker_id = %self.startup.worker_id, error = %err, "default target not pre-loadable");
            }
        }

        let context = WorkerContext::new(self.startup.worker_id, self.startup.worker_data.clone());
        let mut probe = MemoryProbe::new();
        let mut last_seen_requests = 0u32;

        let _ = self.events.send((self.token, WorkerEvent::Ready));

        loop {
            let order = if self.startup.use_fast_path {
                self.next_order_parked(&mut last_seen_requests)
            } else {
                match self.orders.recv() {
                    Ok(order) => order,
                    Err(_) => WorkerOrder::Terminate,
                }
            };

            match order {
                WorkerOrder::Run(request) => {
                    let response = execute_request(self.runner.as_ref(), &context, request, &mut probe);
                    if self.responses.send(response).is_err() {
                        break;
                    }
                    self.signal.add_response();
                    let _ = self.events.send((self.token, WorkerEvent::Wake));
                }
                WorkerOrder::Terminate => break,
            }
        }
    }

    /// Fast-path receive: spin once, then sleep on the request counter
    fn next_order_parked(&self, last_seen: &mut u32) -> WorkerOrder {
        loop {
            match self.orders.try_recv() {
                Ok(order) => return order,
                Err(TryRecvError::Disconnected) => return WorkerOrder::Terminate,
                Err(TryRecvError::Empty) => {
                    if self.signal.requests() == *last_seen {
                        self.parker.park();
                    }
                    // Update before the next channel read so a request that
                    // raced past the comparison is still picked up.
                    *last_seen = self.signal.requests();
                }
            }
        }
    }
}
