//! Out-of-band messaging between a task submitter and its worker
//!
//! A channel pair is created by the submitter and attached to one
//! submission. The pool binds the adapter half to whichever execution
//! context runs the task; both halves die with their isolation cycle.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Create a linked channel pair
///
/// The [`WorkerChannel`] stays with the submitter; the [`ChannelHandle`]
/// travels with the task and is bound to its worker.
pub fn worker_channel() -> (WorkerChannel, ChannelHandle) {
    let (to_worker, from_user) = mpsc::unbounded_channel();
    let (to_user, from_worker) = mpsc::unbounded_channel();
    (
        WorkerChannel {
            to_worker,
            from_worker,
        },
        ChannelHandle { from_user, to_user },
    )
}

/// Submitter half of an out-of-band channel
#[derive(Debug)]
pub struct WorkerChannel {
    to_worker: mpsc::UnboundedSender<Value>,
    from_worker: mpsc::UnboundedReceiver<Value>,
}

impl WorkerChannel {
    /// Send a frame to the worker side
    pub fn send(&self, data: Value) -> Result<(), TransportError> {
        self.to_worker
            .send(data)
            .map_err(|_| TransportError::new("worker channel is closed"))
    }

    /// Wait for the next frame from the worker, `None` once closed
    pub async fn recv(&mut self) -> Option<Value> {
        self.from_worker.recv().await
    }

    /// Pull a frame without waiting
    pub fn try_recv(&mut self) -> Option<Value> {
        self.from_worker.try_recv().ok()
    }
}

/// Adapter half of an out-of-band channel
///
/// Opaque to everything except the execution context it gets bound to.
#[derive(Debug)]
pub struct ChannelHandle {
    from_user: mpsc::UnboundedReceiver<Value>,
    to_user: mpsc::UnboundedSender<Value>,
}

impl ChannelHandle {
    /// Break into the receiving and sending halves
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Value>, mpsc::UnboundedSender<Value>) {
        (self.from_user, self.to_user)
    }
}
