// Threadmill Core Types
//
// Shared vocabulary for the threadmill task-execution pool: options and
// resolved configuration, task records and ids, the pluggable task queue,
// wire messages, and the error taxonomy.
//
// Key design decisions:
// - Task ids are monotonically increasing and never reused; worker ids are
//   small integers recycled through a free-list
// - A TaskRecord owns its oneshot responder, so exactly one resolution can
//   ever reach the submitter
// - The payload detaches from the record at dispatch, making double-send
//   structurally impossible
// - TaskQueue is a trait so callers can swap in priority queues; the
//   default is plain FIFO
// - Messages serialize with serde so the same structs cross thread
//   channels and process stdio unchanged

pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod task;

// Configuration re-exports
pub use config::{
    duration_millis, PoolConfig, PoolOptions, ProcessOptions, QueueLimit, ResourceLimits,
    RuntimeKind,
};

// Error re-exports
pub use error::{ConfigError, PoolError, Result, RunnerError, TransportError};

// Task and queue re-exports
pub use queue::{FifoQueue, TaskQueue};
pub use task::{TaskId, TaskRecord, TaskResponder, WorkerId};

// Messaging re-exports
pub use channel::{worker_channel, ChannelHandle, WorkerChannel};
pub use message::{
    PoolToWorker, ReadyMessage, RequestMessage, ResponseMessage, StartupMessage, WorkerToPool,
};
