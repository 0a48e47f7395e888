//! Process Control Block (PCB) for the Lope scheduler.
//!
//! Each OS process the shell spawns is shadowed by one [`Pcb`]. It tracks
//! identity, scheduling state, priority, and the accounting the scheduler
//! reports (CPU time, wait time, I/O events). A PCB is a plain owned value:
//! whichever container holds it (ready queue, waiting queue or the running
//! slot) owns it exclusively, and it is moved, never shared, between them.
//!
//! All state transitions go through methods on [`Pcb`] so the state machine
//! lives in one place:
//!
//! ```text
//! New ──admit──▶ Ready ──dispatch──▶ Running ──preempt──▶ Ready
//!                  ▲                    │
//!                  └──complete_io── Waiting ◀──block_on_io──┘
//! any ──terminate──▶ Terminated
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Command labels are clipped to this many characters.
pub const MAX_COMMAND_LEN: usize = 63;

// ---------------------------------------------------------------------------
// ProcessId
// ---------------------------------------------------------------------------

/// Identifier of a tracked process. Matches the OS process id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Return the raw numeric value (useful for logging / tables).
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for ProcessId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({})", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ProcessState
// ---------------------------------------------------------------------------

/// The scheduling state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Created, not yet admitted to the ready queue.
    New,
    /// Eligible to be dispatched.
    Ready,
    /// Holding the (single, logical) CPU.
    Running,
    /// Blocked on simulated I/O.
    Waiting,
    /// Retired. Absorbing.
    Terminated,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Terminated)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::New => write!(f, "NEW"),
            ProcessState::Ready => write!(f, "READY"),
            ProcessState::Running => write!(f, "RUNNING"),
            ProcessState::Waiting => write!(f, "WAITING"),
            ProcessState::Terminated => write!(f, "DONE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Error returned when a priority level outside `0..=2` is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("priority {0} out of range (0 = HIGH, 1 = NORMAL, 2 = LOW)")]
pub struct InvalidPriority(pub u8);

/// Scheduling priority: 0 is the highest, 2 the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGH: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(1);
    pub const LOW: Priority = Priority(2);

    /// Build a priority from a raw level, rejecting anything above [`LOW`](Self::LOW).
    pub fn new(level: u8) -> Result<Self, InvalidPriority> {
        if level <= Self::LOW.0 {
            Ok(Self(level))
        } else {
            Err(InvalidPriority(level))
        }
    }

    pub fn level(self) -> u8 {
        self.0
    }

    /// One step toward [`HIGH`](Self::HIGH), saturating.
    pub fn promoted(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// One step toward [`LOW`](Self::LOW), saturating.
    pub fn demoted(self) -> Self {
        Self((self.0 + 1).min(Self::LOW.0))
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            0 => "HIGH",
            1 => "NORMAL",
            _ => "LOW",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Pcb
// ---------------------------------------------------------------------------

/// The Process Control Block: the scheduler's logical record for one OS
/// process. Timestamps and durations are microseconds on the scheduler's
/// [`Clock`](crate::clock::Clock).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pcb {
    pid: ProcessId,
    command: String,
    state: ProcessState,
    priority: Priority,
    cpu_time_us: u64,
    wait_time_us: u64,
    arrival_us: u64,
    last_dispatch_us: Option<u64>,
    waiting_since_us: Option<u64>,
    age_counter: u32,
    io_count: u32,
    dispatch_count: u32,
    memory_allocated: u64,
}

impl Pcb {
    /// Create a PCB in the [`New`](ProcessState::New) state.
    pub fn new(
        pid: ProcessId,
        command: &str,
        priority: Priority,
        memory_allocated: u64,
        arrival_us: u64,
    ) -> Self {
        Self {
            pid,
            command: command.chars().take(MAX_COMMAND_LEN).collect(),
            state: ProcessState::New,
            priority,
            cpu_time_us: 0,
            wait_time_us: 0,
            arrival_us,
            last_dispatch_us: None,
            waiting_since_us: None,
            age_counter: 0,
            io_count: 0,
            dispatch_count: 0,
            memory_allocated,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn cpu_time_us(&self) -> u64 {
        self.cpu_time_us
    }

    pub fn wait_time_us(&self) -> u64 {
        self.wait_time_us
    }

    pub fn arrival_us(&self) -> u64 {
        self.arrival_us
    }

    pub fn last_dispatch_us(&self) -> Option<u64> {
        self.last_dispatch_us
    }

    pub fn waiting_since_us(&self) -> Option<u64> {
        self.waiting_since_us
    }

    pub fn age_counter(&self) -> u32 {
        self.age_counter
    }

    pub fn io_count(&self) -> u32 {
        self.io_count
    }

    pub fn dispatch_count(&self) -> u32 {
        self.dispatch_count
    }

    pub fn memory_allocated(&self) -> u64 {
        self.memory_allocated
    }

    // -- transitions ------------------------------------------------------

    /// NEW → READY.
    pub fn admit(&mut self) {
        debug_assert_eq!(self.state, ProcessState::New);
        self.state = ProcessState::Ready;
    }

    /// READY → RUNNING at `now`. The aging counter restarts because the
    /// process is no longer starving.
    pub fn dispatch(&mut self, now: u64) {
        self.state = ProcessState::Running;
        self.last_dispatch_us = Some(now);
        self.age_counter = 0;
        self.dispatch_count += 1;
    }

    /// Whether the current time slice has run out at `now`.
    pub fn slice_expired(&self, now: u64, time_slice_us: u64) -> bool {
        self.state == ProcessState::Running
            && self
                .last_dispatch_us
                .is_some_and(|t| now.saturating_sub(t) >= time_slice_us)
    }

    /// Charge the CPU time used since the last dispatch.
    fn charge_cpu(&mut self, now: u64) {
        if let Some(t) = self.last_dispatch_us {
            self.cpu_time_us += now.saturating_sub(t);
        }
    }

    /// RUNNING → READY with the priority demoted one step.
    pub fn preempt(&mut self, now: u64) {
        self.charge_cpu(now);
        self.priority = self.priority.demoted();
        self.state = ProcessState::Ready;
    }

    /// RUNNING → WAITING on simulated I/O starting at `now`.
    pub fn block_on_io(&mut self, now: u64) {
        self.charge_cpu(now);
        self.state = ProcessState::Waiting;
        self.waiting_since_us = Some(now);
        self.io_count += 1;
    }

    /// Whether the simulated I/O has lasted at least `io_duration_us`.
    pub fn io_done(&self, now: u64, io_duration_us: u64) -> bool {
        self.state == ProcessState::Waiting
            && self
                .waiting_since_us
                .is_some_and(|t| now.saturating_sub(t) >= io_duration_us)
    }

    /// WAITING → READY at `now`: the wait is accounted and priority jumps
    /// to HIGH. Returns the time spent waiting.
    pub fn complete_io(&mut self, now: u64) -> u64 {
        let waited = self
            .waiting_since_us
            .take()
            .map_or(0, |t| now.saturating_sub(t));
        self.wait_time_us += waited;
        self.priority = Priority::HIGH;
        self.state = ProcessState::Ready;
        waited
    }

    /// One aging cycle for a READY process. Returns `true` when the counter
    /// reached `threshold` and the priority actually moved.
    pub fn age(&mut self, threshold: u32) -> bool {
        self.age_counter += 1;
        if self.age_counter < threshold {
            return false;
        }
        self.age_counter = 0;
        let before = self.priority;
        self.priority = self.priority.promoted();
        before != self.priority
    }

    /// Operator override.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn reset_age(&mut self) {
        self.age_counter = 0;
    }

    /// any → TERMINATED. Charges any in-flight CPU or wait time at `now`.
    pub fn terminate(&mut self, now: u64) {
        match self.state {
            ProcessState::Running => self.charge_cpu(now),
            ProcessState::Waiting => {
                if let Some(t) = self.waiting_since_us.take() {
                    self.wait_time_us += now.saturating_sub(t);
                }
            }
            _ => {}
        }
        self.state = ProcessState::Terminated;
    }

    /// Time from arrival to `now`.
    pub fn turnaround_us(&self, now: u64) -> u64 {
        now.saturating_sub(self.arrival_us)
    }
}

impl fmt::Display for Pcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{} pri={}]",
            self.pid, self.command, self.state, self.priority
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
