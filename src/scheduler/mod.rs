//! The cooperative round-robin phase scheduler.
//!
//! Registered modules take turns owning the execution context: module `m`'s
//! tasks run only while `m`'s phase is active. Phases are aligned against
//! the wall clock so that independent nodes, given synchronised clocks,
//! agree on whose turn it is. The scheduler itself is a passive state
//! machine: the owning event loop asks for the next deadline, feeds time
//! back in through [`Scheduler::poll`], and pops tasks one at a time, which
//! keeps at most one task body executing at any instant.

mod timer;

pub use timer::{TimerHandle, TimerOutcome};

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info, trace};
use thiserror::Error;

use timer::TimerEntry;

/// Identifies a registered module ("gm", "sc", "lb", ...).
pub type ModuleId = String;

/// How often local phases are re-anchored to the wall clock.
pub const ALIGNMENT_DURATION: Duration = Duration::from_secs(5);

/// A unit of work owned by a module. The argument reports why the task ran:
/// its timer elapsed, or its owner's phase ended first.
pub type Task = Box<dyn FnOnce(TimerOutcome) + Send>;

/// Scheduler misuse errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A timer or task referenced a module that was never registered.
    #[error("module {module:?} is not registered with the scheduler")]
    UnknownModule { module: String },

    /// A schedule call referenced a handle that was never allocated.
    #[error("timer handle {handle} was never allocated")]
    UnknownTimer { handle: u64 },
}

/// A phase transition observed by `poll`, broadcast to the connection layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhaseChange {
    pub outgoing: ModuleId,
    pub incoming: ModuleId,
    /// True when the rotation wrapped back to the first module.
    pub new_round: bool,
}

struct ReadyTask {
    task: Task,
    outcome: TimerOutcome,
}

pub struct Scheduler {
    modules: Vec<(ModuleId, Duration)>,
    phase: usize,
    phase_deadline: Option<Instant>,
    last_alignment: Option<Instant>,
    ready: HashMap<ModuleId, VecDeque<ReadyTask>>,
    /// Synthetic next-phase fires, drained before anything else so they run
    /// ahead of the incoming module's handlers.
    boundary: VecDeque<ReadyTask>,
    timers: HashMap<u64, TimerEntry>,
    next_handle: u64,
    busy: bool,
    stopped: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            phase: 0,
            phase_deadline: None,
            last_alignment: None,
            ready: HashMap::new(),
            boundary: VecDeque::new(),
            timers: HashMap::new(),
            next_handle: 0,
            busy: false,
            stopped: false,
        }
    }

    /// Adds a module to the rotation. The first registration starts the
    /// phase clock; re-registering an existing module is a no-op.
    pub fn register(&mut self, module: impl Into<ModuleId>, duration: Duration, now: Instant) {
        let module = module.into();
        if self.modules.iter().any(|(id, _)| *id == module) {
            return;
        }
        info!("scheduling module {} for {:?} phases", module, duration);
        self.ready.entry(module.clone()).or_default();
        self.modules.push((module, duration));
        if self.modules.len() == 1 {
            self.phase = 0;
            self.phase_deadline = Some(now + self.modules[0].1);
            // Backdate so the first boundary immediately re-anchors to the
            // wall clock.
            self.last_alignment = now.checked_sub(2 * ALIGNMENT_DURATION);
        }
    }

    pub fn modules(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.modules.iter().map(|(id, d)| (id.as_str(), *d))
    }

    /// The module whose phase is active.
    pub fn active_module(&self) -> Option<&str> {
        self.modules.get(self.phase).map(|(id, _)| id.as_str())
    }

    pub fn phase(&self) -> usize {
        self.phase
    }

    /// Time left before the current phase ends.
    pub fn time_remaining(&self, now: Instant) -> Duration {
        self.phase_deadline
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Hands out a deadline timer bound to one module. Handles are recycled
    /// across schedules, never across modules.
    pub fn allocate_timer(
        &mut self,
        module: impl Into<ModuleId>,
    ) -> Result<TimerHandle, SchedulerError> {
        let module = module.into();
        if !self.modules.iter().any(|(id, _)| *id == module) {
            return Err(SchedulerError::UnknownModule { module });
        }
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.timers.insert(handle.0, TimerEntry::new(module));
        Ok(handle)
    }

    /// Arms a timer. A finite `wait` fires after that long; `None` marks the
    /// timer next-phase: it fires, exactly once, the instant its owning
    /// module's phase ends. Re-scheduling a pending handle replaces its task.
    pub fn schedule_timer(
        &mut self,
        handle: TimerHandle,
        wait: Option<Duration>,
        task: Task,
        now: Instant,
    ) -> Result<(), SchedulerError> {
        let entry = self
            .timers
            .get_mut(&handle.0)
            .ok_or(SchedulerError::UnknownTimer { handle: handle.0 })?;
        match wait {
            Some(wait) => {
                entry.deadline = Some(now + wait);
                entry.next_phase = false;
            }
            None => {
                entry.deadline = None;
                entry.next_phase = true;
            }
        }
        entry.task = Some(task);
        trace!("armed timer {} (next_phase: {})", handle.0, entry.next_phase);
        Ok(())
    }

    /// Drops a pending timer silently. A timer that already fired has its
    /// task in a ready queue and still runs once.
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        if let Some(entry) = self.timers.get_mut(&handle.0) {
            entry.task = None;
            entry.deadline = None;
            entry.next_phase = false;
        }
    }

    /// Appends a task to a module's ready queue. Returns true when the
    /// caller should wake the worker (the queue was touched while idle and
    /// `start_worker` was requested).
    pub fn schedule_now(
        &mut self,
        module: impl Into<ModuleId>,
        task: Task,
        start_worker: bool,
    ) -> Result<bool, SchedulerError> {
        let module = module.into();
        let queue = self
            .ready
            .get_mut(&module)
            .ok_or_else(|| SchedulerError::UnknownModule { module: module.clone() })?;
        queue.push_back(ReadyTask { task, outcome: TimerOutcome::Elapsed });
        debug!("module {} now has queue size {}", module, queue.len());
        Ok(!self.busy && start_worker)
    }

    /// The next instant at which `poll` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        let timer_deadline = self
            .timers
            .values()
            .filter(|entry| entry.task.is_some())
            .filter_map(|entry| entry.deadline)
            .min();
        match (self.phase_deadline, timer_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fires due timers and phase boundaries. `wall_millis` is the skew
    /// corrected wall clock used for alignment. Returns any phase changes so
    /// the caller can notify the transports.
    pub fn poll(&mut self, now: Instant, wall_millis: u64) -> Vec<PhaseChange> {
        if self.stopped {
            return Vec::new();
        }

        // Elapsed timers move their task to the owner's ready queue.
        let due: Vec<u64> = self
            .timers
            .iter()
            .filter(|(_, entry)| {
                entry.task.is_some() && entry.deadline.is_some_and(|d| d <= now)
            })
            .map(|(handle, _)| *handle)
            .collect();
        for handle in due {
            if let Some(entry) = self.timers.get_mut(&handle) {
                entry.deadline = None;
                if let Some(task) = entry.task.take() {
                    let owner = entry.owner.clone();
                    trace!("timer {} elapsed for module {}", handle, owner);
                    if let Some(queue) = self.ready.get_mut(&owner) {
                        queue.push_back(ReadyTask {
                            task,
                            outcome: TimerOutcome::Elapsed,
                        });
                    }
                }
            }
        }

        let mut changes = Vec::new();
        while let Some(deadline) = self.phase_deadline {
            if deadline > now {
                break;
            }
            if let Some(change) = self.change_phase(now, wall_millis) {
                changes.push(change);
            } else {
                break;
            }
        }
        changes
    }

    /// Pops the next runnable task: boundary fires first, then the active
    /// module's queue. Callers execute the task and then call
    /// [`Scheduler::task_finished`].
    pub fn take_task(&mut self) -> Option<(Task, TimerOutcome)> {
        if self.stopped {
            return None;
        }
        if let Some(ready) = self.boundary.pop_front() {
            self.busy = true;
            return Some((ready.task, ready.outcome));
        }
        let active = self.modules.get(self.phase)?.0.clone();
        let ready = self.ready.get_mut(&active)?.pop_front()?;
        self.busy = true;
        Some((ready.task, ready.outcome))
    }

    pub fn task_finished(&mut self) {
        self.busy = false;
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Cancels every timer and empties every queue. Nothing runs afterwards.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.phase_deadline = None;
        self.boundary.clear();
        for entry in self.timers.values_mut() {
            entry.task = None;
            entry.deadline = None;
            entry.next_phase = false;
        }
        for queue in self.ready.values_mut() {
            queue.clear();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Advances the rotation one step, re-anchoring to the canonical
    /// wall-clock phase when an alignment interval has passed, and fires the
    /// outgoing module's next-phase timers.
    fn change_phase(&mut self, now: Instant, wall_millis: u64) -> Option<PhaseChange> {
        if self.modules.is_empty() {
            self.phase = 0;
            self.phase_deadline = None;
            return None;
        }
        let old_phase = self.phase;
        self.phase = (self.phase + 1) % self.modules.len();
        let mut duration = self.modules[self.phase].1;

        let needs_alignment = match self.last_alignment {
            Some(at) => now.duration_since(at) > ALIGNMENT_DURATION,
            None => true,
        };
        if needs_alignment {
            let (canonical, remaining) = self.canonical_phase(wall_millis);
            debug!(
                "aligned phase to {} (was {}) for {} ms",
                canonical,
                self.phase,
                remaining.as_millis()
            );
            self.phase = canonical;
            duration = remaining;
            self.last_alignment = Some(now);
        }

        self.phase_deadline = Some(now + duration);
        if self.phase == old_phase {
            return None;
        }

        let outgoing = self.modules[old_phase].0.clone();
        let incoming = self.modules[self.phase].0.clone();
        debug!("phase {} -> {} for {:?}", outgoing, incoming, duration);

        // Next-phase timers of the outgoing module fire now, ahead of the
        // incoming module's handlers, and exactly once.
        for (handle, entry) in self.timers.iter_mut() {
            if entry.owner == outgoing && entry.next_phase {
                entry.next_phase = false;
                if let Some(task) = entry.task.take() {
                    trace!("expiring next-phase timer {} for {}", handle, outgoing);
                    self.boundary.push_back(ReadyTask {
                        task,
                        outcome: TimerOutcome::Expired,
                    });
                }
            }
        }

        Some(PhaseChange {
            outgoing,
            incoming,
            new_round: self.phase == 0,
        })
    }

    /// The phase the wall clock says should be active, and how long it has
    /// left. With `R` the round length, the canonical phase at time `t` is
    /// the smallest `k` whose cumulative duration exceeds `t mod R`.
    fn canonical_phase(&self, wall_millis: u64) -> (usize, Duration) {
        let round: u64 = self
            .modules
            .iter()
            .map(|(_, d)| d.as_millis() as u64)
            .sum();
        if round == 0 {
            return (0, Duration::ZERO);
        }
        let into_round = wall_millis % round;
        let mut cumulative = 0u64;
        for (index, (_, duration)) in self.modules.iter().enumerate() {
            cumulative += duration.as_millis() as u64;
            if cumulative > into_round {
                return (index, Duration::from_millis(cumulative - into_round));
            }
        }
        (0, self.modules[0].1)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
