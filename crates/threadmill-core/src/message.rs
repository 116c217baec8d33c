//! Messages exchanged between the pool and its workers
//!
//! Thread workers move these structs over in-process channels; process
//! workers move them as newline-delimited JSON frames tagged with `kind`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::{TaskId, WorkerId};

/// First frame a worker receives after spawn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupMessage {
    /// Identity the worker reports in logs and handler contexts
    pub worker_id: WorkerId,

    /// Default target file to pre-load, if the pool has one
    pub target_file: Option<String>,

    /// Default handler name
    pub target_name: String,

    /// Whether the worker should park on the shared request counter
    pub use_fast_path: bool,

    /// Opaque startup value from the pool configuration
    pub worker_data: Value,
}

/// Sent once by a worker when it can accept tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub ready: bool,
}

/// One task dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub task_id: TaskId,

    /// Task payload, detached from the record at send time
    pub payload: Value,

    /// Binary payloads riding alongside the task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Bytes>,

    pub target_file: String,
    pub target_name: String,
}

/// One task outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub task_id: TaskId,

    /// Handler result; `Null` when `error` is set
    pub result: Value,

    /// Failure message when the handler did not succeed
    pub error: Option<String>,

    /// Worker resident set size sampled after the task, in bytes
    pub used_memory: Option<u64>,
}

impl ResponseMessage {
    /// Successful outcome
    pub fn ok(task_id: TaskId, result: Value, used_memory: Option<u64>) -> Self {
        ResponseMessage {
            task_id,
            result,
            error: None,
            used_memory,
        }
    }

    /// Failed outcome
    pub fn err(task_id: TaskId, message: impl Into<String>, used_memory: Option<u64>) -> Self {
        ResponseMessage {
            task_id,
            result: Value::Null,
            error: Some(message.into()),
            used_memory,
        }
    }
}

/// Frames the pool writes to a process worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolToWorker {
    Startup(StartupMessage),
    Request(RequestMessage),
    /// Out-of-band frame for the worker-side channel peer
    User { data: Value },
    Terminate,
}

/// Frames a process worker writes back
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerToPool {
    Ready(ReadyMessage),
    Response(ResponseMessage),
    /// Out-of-band frame for the submitter-side channel peer
    User { data: Value },
}
