//! Cooperative scheduler (C8, §4.8, §5).
//!
//! Four periodic tasks driven by monotonic time. A hardware-timer
//! "interrupt" is modeled as [`Scheduler::tick`]: it only ever sets ready
//! flags, never runs a handler itself. The main loop drains ready tasks in
//! fixed priority order, running at most one handler per flag per tick.

use std::time::{Duration, Instant};

/// A source of monotonic time. Production code uses [`SystemClock`]; tests
/// use [`VirtualClock`] to deterministically exercise ordering and
/// cancellation without sleeping.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only advances when told to. `Instant` cannot be
/// constructed from an arbitrary point in time, so the virtual clock
/// anchors itself to one real `Instant::now()` at construction and moves
/// forward from there by explicit [`VirtualClock::advance`] calls.
#[derive(Debug, Clone, Copy)]
pub struct VirtualClock {
    cursor: Instant,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self { cursor: Instant::now() }
    }

    pub fn advance(&mut self, by: Duration) {
        self.cursor += by;
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.cursor
    }
}

/// The four periodic tasks, in their fixed priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    Poll,
    Upload,
    ConfigCheck,
    OtaCheck,
}

const TASK_PRIORITY: [Task; 4] = [Task::Poll, Task::Upload, Task::ConfigCheck, Task::OtaCheck];

#[derive(Debug, Clone, Copy)]
struct TaskState {
    period: Duration,
    last_fired: Instant,
    ready: bool,
    paused: bool,
}

/// The scheduler itself: single-threaded, cooperative, no preemption.
pub struct Scheduler {
    poll: TaskState,
    upload: TaskState,
    config_check: TaskState,
    ota_check: TaskState,
}

impl Scheduler {
    pub fn new(now: Instant, poll: Duration, upload: Duration, config_check: Duration, ota_check: Duration) -> Self {
        let mk = |period| TaskState { period, last_fired: now, ready: false, paused: false };
        Self {
            poll: mk(poll),
            upload: mk(upload),
            config_check: mk(config_check),
            ota_check: mk(ota_check),
        }
    }

    fn state_mut(&mut self, task: Task) -> &mut TaskState {
        match task {
            Task::Poll => &mut self.poll,
            Task::Upload => &mut self.upload,
            Task::ConfigCheck => &mut self.config_check,
            Task::OtaCheck => &mut self.ota_check,
        }
    }

    /// Update a task's period at runtime (§4.8: "independent period
    /// updatable at runtime").
    pub fn set_period(&mut self, task: Task, period: Duration) {
        self.state_mut(task).period = period;
    }

    /// The "interrupt": set the ready flag for any task whose period has
    /// elapsed. Never runs a handler. Paused tasks never become ready and
    /// do not accumulate a pending tick while paused.
    pub fn tick(&mut self, now: Instant) {
        for &task in &TASK_PRIORITY {
            let state = self.state_mut(task);
            if state.paused {
                state.last_fired = now;
                continue;
            }
            if now.duration_since(state.last_fired) >= state.period {
                state.ready = true;
                state.last_fired = now;
            }
        }
    }

    /// Pop the next ready task in priority order, clearing its flag. Each
    /// flag is consumed at most once per call chain until the next
    /// `tick`.
    pub fn next_ready(&mut self) -> Option<Task> {
        for &task in &TASK_PRIORITY {
            let state = self.state_mut(task);
            if state.ready {
                state.ready = false;
                return Some(task);
            }
        }
        None
    }

    /// Pause/resume used during OTA `Applying`/`Verifying` so poll/upload
    /// do not contend for flash or the HTTP client (§4.8).
    pub fn pause(&mut self, task: Task) {
        let state = self.state_mut(task);
        state.paused = true;
        state.ready = false;
    }

    pub fn resume(&mut self, task: Task) {
        self.state_mut(task).paused = false;
    }

    pub fn pause_all(&mut self) {
        for &task in &TASK_PRIORITY {
            self.pause(task);
        }
    }

    pub fn resume_all(&mut self) {
        for &task in &TASK_PRIORITY {
            self.resume(task);
        }
    }
}
