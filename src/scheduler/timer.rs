//! Timer bookkeeping for the scheduler.

use std::time::Instant;

use super::{ModuleId, Task};

/// Opaque handle to a scheduler timer, bound to one module for its lifetime.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TimerHandle(pub(super) u64);

impl TimerHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Why a scheduled task ran.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerOutcome {
    /// The timer's deadline elapsed (for immediate tasks: it was queued).
    Elapsed,
    /// The owning module's phase ended before the timer could elapse; the
    /// task was fired synthetically at the boundary.
    Expired,
}

pub(super) struct TimerEntry {
    pub owner: ModuleId,
    pub deadline: Option<Instant>,
    pub next_phase: bool,
    pub task: Option<Task>,
}

impl TimerEntry {
    pub fn new(owner: ModuleId) -> Self {
        Self { owner, deadline: None, next_phase: false, task: None }
    }
}
