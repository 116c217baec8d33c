//! Active worker collection
//!
//! Tracks slots in two ordered tiers (spawned but not ready, ready) and
//! owns the pool of reusable worker ids. Selection follows a usage-based
//! policy: an idle worker wins outright, otherwise the least-loaded
//! worker below the per-worker concurrency limit.

use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;

use threadmill_core::task::{TaskId, WorkerId};
use threadmill_runtime::context::SlotToken;

use crate::slot::WorkerSlot;

pub(crate) struct WorkerSet {
    slots: HashMap<SlotToken, WorkerSlot>,
    pending: Vec<SlotToken>,
    ready: Vec<SlotToken>,
    free_ids: BTreeSet<WorkerId>,
}

impl WorkerSet {
    pub(crate) fn new(max_workers: usize) -> Self {
        let capped = u32::try_from(max_workers).unwrap_or(u32::MAX);
        WorkerSet {
            slots: HashMap::new(),
            pending: Vec::new(),
            ready: Vec::new(),
            free_ids: (1..=capped).map(WorkerId::new).collect(),
        }
    }

    /// Claim the lowest free worker id
    pub(crate) fn next_worker_id(&mut self) -> Option<WorkerId> {
        let id = self.free_ids.iter().next().copied()?;
        self.free_ids.remove(&id);
        Some(id)
    }

    /// Return an id to the free list once its worker is fully gone
    pub(crate) fn release_id(&mut self, id: WorkerId) {
        self.free_ids.insert(id);
    }

    pub(crate) fn insert_pending(&mut self, slot: WorkerSlot) {
        let token = slot.token();
        self.slots.insert(token, slot);
        self.pending.push(token);
    }

    /// Promote a spawned slot to the ready tier
    pub(crate) fn mark_ready(&mut self, token: SlotToken) -> bool {
        let Some(position) = self.pending.iter().position(|t| *t == token) else {
            return false;
        };
        self.pending.remove(position);
        self.ready.push(token);
        if let Some(slot) = self.slots.get_mut(&token) {
            slot.mark_ready();
        }
        true
    }

    pub(crate) fn get(&self, token: SlotToken) -> Option<&WorkerSlot> {
        self.slots.get(&token)
    }

    pub(crate) fn get_mut(&mut self, token: SlotToken) -> Option<&mut WorkerSlot> {
        self.slots.get_mut(&token)
    }

    /// Detach a slot from the set; its id stays claimed until released
    pub(crate) fn remove(&mut self, token: SlotToken) -> Option<WorkerSlot> {
        let slot = self.slots.remove(&token)?;
        self.pending.retain(|t| *t != token);
        self.ready.retain(|t| *t != token);
        Some(slot)
    }

    /// Pick a ready worker for one more task
    ///
    /// An idle worker is always preferred. A cancellable task accepts
    /// nothing less, since it must be able to take its worker down with
    /// it; for ordinary tasks the least-loaded worker under the
    /// concurrency limit wins.
    pub(crate) fn find_available(
        &self,
        concurrent_limit: usize,
        cancellable: bool,
    ) -> Option<SlotToken> {
        for token in &self.ready {
            if self.slots.get(token).and_then(WorkerSlot::usage) == Some(0) {
                return Some(*token);
            }
        }
        if cancellable {
            return None;
        }
        let mut best: Option<(SlotToken, usize)> = None;
        for token in &self.ready {
            let Some(usage) = self.slots.get(token).and_then(WorkerSlot::usage) else {
                continue;
            };
            if usage >= concurrent_limit {
                continue;
            }
            if best.is_none_or(|(_, lowest)| usage < lowest) {
                best = Some((*token, usage));
            }
        }
        best.map(|(token, _)| token)
    }

    /// Locate the slot a task is running on
    pub(crate) fn find_running(&self, id: TaskId) -> Option<SlotToken> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.has_running(id))
            .map(|(token, _)| *token)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn total_running(&self) -> usize {
        self.slots.values().map(WorkerSlot::running_count).sum()
    }

    /// Slot tokens in no particular order
    pub(crate) fn tokens(&self) -> Vec<SlotToken> {
        self.slots.keys().copied().collect()
    }

    /// Worker ids, spawning tier first, each tier in insertion order
    pub(crate) fn worker_ids(&self) -> Vec<WorkerId> {
        self.pending
            .iter()
            .chain(self.ready.iter())
            .filter_map(|token| self.slots.get(token).map(WorkerSlot::worker_id))
            .collect()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerSlot> {
        self.slots.values_mut()
    }

    /// Earliest idle eviction deadline across all slots
    pub(crate) fn next_idle_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter_map(WorkerSlot::idle_deadline)
            .min()
    }
}
