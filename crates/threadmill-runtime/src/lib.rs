// Threadmill Execution Runtimes
//
// The two ways a pool worker can be backed: an in-process thread with
// shared-memory signaling, or a child process speaking newline-delimited
// JSON over stdio. Both hide behind the ExecutionContext trait so the
// scheduler never knows which one it is driving.
//
// Key design decisions:
// - Lifecycle (ready, wake, failure, exit) flows through one event
//   channel owned by the scheduler, tagged with a never-reused SlotToken
// - Responses are buffered inside the adapter and pulled synchronously;
//   the fast path only changes when the pool decides to pull
// - Handlers are synchronous functions resolved by a TaskRunner; panics
//   become failed responses instead of dead workers
// - Thread workers park on the shared request counter while idle; the
//   pool-side unpark doubles as the wake notification

pub mod context;
pub mod memory;
pub mod process;
pub mod runner;
pub mod signal;
pub mod thread;

// Context re-exports
pub use context::{
    ContextFactory, EventSender, ExecutionContext, RuntimeFactory, SlotToken, SpawnSpec,
    WorkerEvent,
};

// Runtime re-exports
pub use process::{process_worker_main, ProcessContext, ProcessWorkerError};
pub use thread::ThreadContext;

// Worker-side re-exports
pub use memory::MemoryProbe;
pub use runner::{RunnerRegistry, TaskFn, TaskInput, TaskRunner, WorkerContext};
pub use signal::SignalPair;
