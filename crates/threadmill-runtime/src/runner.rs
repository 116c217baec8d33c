//! Worker-side task execution
//!
//! A [`TaskRunner`] resolves the `(file, name)` pair on each request to a
//! handler function. The bundled [`RunnerRegistry`] is a plain two-level
//! map; embedders with dynamic loading can implement the trait themselves.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use threadmill_core::error::RunnerError;
use threadmill_core::message::{RequestMessage, ResponseMessage};
use threadmill_core::task::WorkerId;

use crate::memory::MemoryProbe;

/// Payload plus attachments for one handler invocation
#[derive(Debug)]
pub struct TaskInput {
    pub payload: Value,
    pub attachments: Vec<Bytes>,
}

/// Identifies the hosting worker to every handler it runs
pub struct WorkerContext {
    worker_id: WorkerId,
    user_data: Value,
    messages: Option<ContextMessages>,
}

pub(crate) struct ContextMessages {
    pub(crate) incoming: std::sync::mpsc::Receiver<Value>,
    pub(crate) outgoing: Box<dyn Fn(Value) -> Result<(), String> + Send>,
}

impl WorkerContext {
    /// Context without out-of-band messaging, as thread workers get
    pub fn new(worker_id: WorkerId, user_data: Value) -> Self {
        WorkerContext {
            worker_id,
            user_data,
            messages: None,
        }
    }

    pub(crate) fn with_messages(mut self, messages: ContextMessages) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Opaque startup value from the pool configuration
    pub fn user_data(&self) -> &Value {
        &self.user_data
    }

    /// Send an out-of-band frame to the submitter side
    ///
    /// Only process workers carry a channel peer; thread workers get an
    /// error here because their submissions cannot bind a channel either.
    pub fn post_message(&self, data: Value) -> Result<(), String> {
        match &self.messages {
            Some(messages) => (messages.outgoing)(data),
            None => Err("out-of-band messaging is not available in this runtime".to_string()),
        }
    }

    /// Pull a pending out-of-band frame without waiting
    pub fn try_recv_message(&self) -> Option<Value> {
        self.messages
            .as_ref()
            .and_then(|messages| messages.incoming.try_recv().ok())
    }
}

/// Handler signature: synchronous, returning a JSON value or a message
pub type TaskFn = dyn Fn(&WorkerContext, TaskInput) -> Result<Value, String> + Send + Sync;

/// Resolves task targets to executable handlers
pub trait TaskRunner: Send + Sync {
    fn resolve(&self, file: &str, name: &str) -> Result<Arc<TaskFn>, RunnerError>;
}

/// Handler registry keyed by target file, then handler name
#[derive(Default, Clone)]
pub struct RunnerRegistry {
    handlers: HashMap<String, HashMap<String, Arc<TaskFn>>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a file and name
    pub fn register<F>(&mut self, file: impl Into<String>, name: impl Into<String>, handler: F)
    where
        F: Fn(&WorkerContext, TaskInput) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers
            .entry(file.into())
            .or_default()
            .insert(name.into(), Arc::new(handler));
    }

    /// Chainable form of [`register`](Self::register)
    pub fn with_handler<F>(
        mut self,
        file: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(&WorkerContext, TaskInput) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(file, name, handler);
        self
    }

    pub fn contains(&self, file: &str, name: &str) -> bool {
        self.handlers
            .get(file)
            .is_some_and(|handlers| handlers.contains_key(name))
    }
}

impl TaskRunner for RunnerRegistry {
    fn resolve(&self, file: &str, name: &str) -> Result<Arc<TaskFn>, RunnerError> {
        self.handlers
            .get(file)
            .and_then(|handlers| handlers.get(name))
            .cloned()
            .ok_or_else(|| RunnerError::MissingHandler {
                file: file.to_string(),
                name: name.to_string(),
            })
    }
}

/// Run one request to a response, catching handler panics
///
/// Shared by both runtimes so a panicking or missing handler produces the
/// same failed response everywhere instead of killing the worker.
pub(crate) fn execute_request(
    runner: &dyn TaskRunner,
    context: &WorkerContext,
    request: RequestMessage,
    probe: &mut MemoryProbe,
) -> ResponseMessage {
    let task_id = request.task_id;
    let outcome = match runner.resolve(&request.target_file, &request.target_name) {
        Ok(handler) => {
            let input = TaskInput {
                payload: request.payload,
                attachments: request.attachments,
            };
            catch_unwind(AssertUnwindSafe(|| handler(context, input)))
                .unwrap_or_else(|panic| Err(panic_message(panic)))
        }
        Err(err) => Err(err.to_string()),
    };
    let used_memory = probe.rss();
    match outcome {
        Ok(result) => ResponseMessage::ok(task_id, result, used_memory),
        Err(message) => ResponseMessage::err(task_id, message, used_memory),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("Task panicked: {message}")
    } else {
        "Task panicked".to_string()
    }
}
