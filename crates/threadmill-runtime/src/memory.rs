//! Worker memory self-reports
//!
//! Each worker samples its own resident set size after finishing a task
//! and ships the figure home in the response, where it feeds the
//! memory-pressure recycling decision.

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

/// Reusable RSS sampler for the current process
pub struct MemoryProbe {
    pid: Pid,
    system: System,
}

impl MemoryProbe {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing().with_memory()),
        );
        MemoryProbe { pid, system }
    }

    /// Resident set size in bytes, `None` if the platform hides it
    pub fn rss(&mut self) -> Option<u64> {
        self.system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[self.pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(self.pid).map(|process| process.memory())
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}
