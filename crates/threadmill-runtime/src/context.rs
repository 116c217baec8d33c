//! Execution-context boundary
//!
//! The pool drives workers exclusively through [`ExecutionContext`]:
//! requests go down synchronously, buffered responses are pulled
//! synchronously, and everything asynchronous (readiness, wake nudges,
//! failures, exits) arrives on the scheduler's event channel tagged with
//! the slot's token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use threadmill_core::channel::ChannelHandle;
use threadmill_core::config::{ProcessOptions, ResourceLimits, RuntimeKind};
use threadmill_core::error::TransportError;
use threadmill_core::message::{RequestMessage, ResponseMessage, StartupMessage};

use crate::process::ProcessContext;
use crate::runner::TaskRunner;
use crate::signal::SignalPair;
use crate::thread::ThreadContext;

static NEXT_SLOT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Never-reused routing key for worker lifecycle events
///
/// Worker ids are small and recycled; a late exit from an evicted context
/// must not be attributed to a successor that reused its id, so events
/// route by token instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotToken(u64);

impl SlotToken {
    pub fn next() -> Self {
        SlotToken(NEXT_SLOT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Lifecycle notifications an adapter sends to the scheduler
#[derive(Debug)]
pub enum WorkerEvent {
    /// Startup finished; the worker accepts tasks
    Ready,
    /// At least one response is buffered and can be pulled
    Wake,
    /// The context hit a fatal error
    Failed { message: String },
    /// The backing thread or process is gone
    Exited,
}

/// Channel adapters use to reach the scheduler
pub type EventSender = mpsc::UnboundedSender<(SlotToken, WorkerEvent)>;

/// Everything an adapter needs to bring one worker up
pub struct SpawnSpec {
    /// Routing key for this context's events
    pub token: SlotToken,
    /// First message the worker processes
    pub startup: StartupMessage,
    /// Counter pair shared with the pool-side slot
    pub signal: Arc<SignalPair>,
    /// Scheduler event channel
    pub events: EventSender,
}

/// One live worker, however it is backed
pub trait ExecutionContext: Send {
    fn kind(&self) -> RuntimeKind;

    /// Queue one request for the worker; failure means the worker is gone
    fn post_request(&mut self, request: RequestMessage) -> Result<(), TransportError>;

    /// Pull one buffered response, if any
    fn try_recv_response(&mut self) -> Option<ResponseMessage>;

    /// Bind the out-of-band channel for the current isolation cycle
    fn bind_channel(&mut self, channel: ChannelHandle) -> Result<(), TransportError>;

    /// Ask the worker to stop; the exit shows up on the event channel
    fn terminate(&mut self);

    /// Hint whether outstanding work should keep the host process alive
    ///
    /// Adapters without a native rooting mechanism may ignore the hint;
    /// the pool mirrors it into its outstanding-work gauge either way.
    fn set_keep_alive(&mut self, _keep_alive: bool) {}
}

/// Spawns execution contexts on demand
pub trait ContextFactory: Send + Sync {
    fn spawn(
        &self,
        kind: RuntimeKind,
        spec: SpawnSpec,
    ) -> Result<Box<dyn ExecutionContext>, TransportError>;
}

/// Factory for the two built-in runtimes
pub struct RuntimeFactory {
    runner: Arc<dyn TaskRunner>,
    limits: ResourceLimits,
    process: ProcessOptions,
}

impl RuntimeFactory {
    pub fn new(runner: Arc<dyn TaskRunner>, limits: ResourceLimits, process: ProcessOptions) -> Self {
        RuntimeFactory {
            runner,
            limits,
            process,
        }
    }
}

impl ContextFactory for RuntimeFactory {
    fn spawn(
        &self,
        kind: RuntimeKind,
        spec: SpawnSpec,
    ) -> Result<Box<dyn ExecutionContext>, TransportError> {
        match kind {
            RuntimeKind::Thread => Ok(Box::new(ThreadContext::spawn(
                spec,
                self.runner.clone(),
                self.limits.clone(),
            )?)),
            RuntimeKind::Process => {
                Ok(Box::new(ProcessContext::spawn(spec, self.process.clone())?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_tokens_never_repeat() {
        let a = SlotToken::next();
        let b = SlotToken::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }
}
