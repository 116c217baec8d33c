// Error types for the task pool

use thiserror::Error;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors raised while resolving pool options into a configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Both bounds were given explicitly and disagree
    #[error("Minimum worker count {min} exceeds maximum worker count {max}")]
    MinExceedsMax { min: usize, max: usize },

    /// The process runtime cannot start without a worker program
    #[error("Process runtime requires a worker program")]
    MissingProgram,
}

/// A request could not be delivered to its worker
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A worker could not resolve a task target to a handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    /// No handler registered under the requested file and name
    #[error("No handler {name:?} registered for {file:?}")]
    MissingHandler { file: String, name: String },
}

/// Errors that can resolve a task future or fail a pool operation
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Submission named no target file and the pool has no default
    #[error("No target file provided and no default is configured")]
    MissingTarget,

    /// The task queue is full
    #[error("Task queue is at limit")]
    QueueAtLimit,

    /// No queue capacity is configured and every worker is busy
    #[error("No task queue available and all workers are busy")]
    NoQueueAvailable,

    /// The task ran and failed inside the worker
    #[error("Task failed: {0}")]
    Execution(String),

    /// The request never reached the worker
    #[error("Task could not be delivered: {0}")]
    Transport(String),

    /// The worker crashed or exited while the task was in flight
    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    /// The task's cancellation signal fired
    #[error("Task was cancelled")]
    Cancelled,

    /// The pool or worker was shutting down while the task was pending
    #[error("Terminating worker")]
    Terminating,

    /// A worker did not exit within the teardown window
    #[error("Worker did not terminate within the teardown timeout")]
    TerminateTimeout,

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PoolError {
    /// Create an execution error from a worker-reported message
    pub fn execution(msg: impl Into<String>) -> Self {
        PoolError::Execution(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        PoolError::Transport(msg.into())
    }

    /// Create a worker failure error
    pub fn worker_failed(msg: impl Into<String>) -> Self {
        PoolError::WorkerFailed(msg.into())
    }

    /// Whether this error came from the task's own cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PoolError::Cancelled)
    }
}

impl From<TransportError> for PoolError {
    fn from(err: TransportError) -> Self {
        PoolError::Transport(err.message)
    }
}
