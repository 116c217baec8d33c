//! Pending-task storage
//!
//! The scheduler owns exactly one queue. Implementations choose the
//! ordering; `push` and `shift` just have to agree with each other.
//! [`TaskRecord::queue_options`](crate::task::TaskRecord::queue_options)
//! carries per-submission hints for priority queues and friends.

use std::collections::VecDeque;

use crate::error::PoolError;
use crate::task::{TaskId, TaskRecord};

/// Ordered storage for tasks awaiting a worker
pub trait TaskQueue: Send {
    /// Number of queued tasks
    fn size(&self) -> usize;

    /// Accept a task for later dispatch
    fn push(&mut self, task: TaskRecord);

    /// Remove and return the next task to dispatch
    fn shift(&mut self) -> Option<TaskRecord>;

    /// Remove a specific queued task
    ///
    /// Returns `None` when the task is not present, which the scheduler
    /// reports as an inconsistency rather than ignoring.
    fn remove(&mut self, id: TaskId) -> Option<TaskRecord>;

    /// Drain every queued task, failing each with a cancellation error
    fn cancel(&mut self) {
        while let Some(task) = self.shift() {
            task.fail(PoolError::Cancelled);
        }
    }

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Default first-in, first-out queue
#[derive(Debug, Default)]
pub struct FifoQueue {
    tasks: VecDeque<TaskRecord>,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for FifoQueue {
    fn size(&self) -> usize {
        self.tasks.len()
    }

    fn push(&mut self, task: TaskRecord) {
        self.tasks.push_back(task);
    }

    fn shift(&mut self) -> Option<TaskRecord> {
        self.tasks.pop_front()
    }

    fn remove(&mut self, id: TaskId) -> Option<TaskRecord> {
        let index = self.tasks.iter().position(|task| task.id() == id)?;
        self.tasks.remove(index)
    }
}
