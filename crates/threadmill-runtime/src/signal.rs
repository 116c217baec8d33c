//! Shared counter pair for the fast path
//!
//! Two word-sized counters cross the pool/worker boundary: requests the
//! pool has sent and responses the worker has buffered. The pool compares
//! the response counter against the last value it observed to decide
//! whether a synchronous drain will find anything; an idle worker parks
//! until the request counter moves.

use std::sync::atomic::{AtomicU32, Ordering};

/// Request/response counters shared between the pool and one worker
#[derive(Debug, Default)]
pub struct SignalPair {
    requests: AtomicU32,
    responses: AtomicU32,
}

impl SignalPair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool side: record one more dispatched request
    pub fn add_request(&self) -> u32 {
        self.requests.fetch_add(1, Ordering::Release).wrapping_add(1)
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::Acquire)
    }

    /// Worker side: record one more buffered response
    pub fn add_response(&self) -> u32 {
        self.responses.fetch_add(1, Ordering::Release).wrapping_add(1)
    }

    pub fn responses(&self) -> u32 {
        self.responses.load(Ordering::Acquire)
    }
}
