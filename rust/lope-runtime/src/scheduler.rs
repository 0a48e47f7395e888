//! Cooperative scheduler with priority aging.
//!
//! The [`Scheduler`] owns the ready and waiting queues, the single logical
//! CPU (the running slot), the virtual memory manager and the running
//! totals, all behind one [`Arc`]'d `Shared` block. A background thread
//! calls [`tick`](Scheduler::tick) every poll interval; tests call it
//! directly with a [`ManualClock`](crate::clock::ManualClock).
//!
//! # One tick
//!
//! 1. Waiting PCBs whose I/O has lasted `io_duration_us` go back to ready at
//!    HIGH priority.
//! 2. A running PCB whose slice has expired leaves the CPU: with probability
//!    `io_probability` it blocks on I/O, otherwise it is demoted one step and
//!    requeued.
//! 3. Every ready PCB ages; every `aging_threshold` cycles it is promoted one
//!    step.
//! 4. If the CPU is idle the highest-priority ready PCB is dispatched and
//!    touches its next page, faulting it back in if it was evicted.
//! 5. Exits requested while a PCB was moving between containers are
//!    completed.
//!
//! # Locking
//!
//! Each queue, the running slot, the VMM, the totals, the RNG and the
//! deferred-exit set have their own `parking_lot` mutex. No code path holds
//! two queue locks at once, the running slot is released before a queue lock
//! is taken, and the VMM lock is only taken with no queue lock held. The
//! `live` set is the one lock held across others: a finalize keeps it from
//! its membership check until the pid is retired or deferred.

use crate::clock::{Clock, MonotonicClock};
use crate::config::LopeConfig;
use crate::events::{EventBus, SchedulerEvent};
use crate::lifecycle::MemoryProfile;
use crate::process::{InvalidPriority, Pcb, ProcessId, ProcessState};
use crate::queue::ProcessQueue;
use crate::vmm::{FaultOutcome, VirtualMemoryManager, VmmError, VmmSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error(transparent)]
    Vmm(#[from] VmmError),

    #[error("{0} is already tracked")]
    DuplicateProcess(ProcessId),

    #[error("{0} is not tracked")]
    UnknownProcess(ProcessId),

    #[error(transparent)]
    InvalidPriority(#[from] InvalidPriority),

    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {pid}: {source}")]
    Wait {
        pid: ProcessId,
        #[source]
        source: std::io::Error,
    },

    #[error("empty command line")]
    EmptyCommand,

    #[error("cannot parse command line '{line}': {source}")]
    InvalidCommandLine {
        line: String,
        #[source]
        source: shell_words::ParseError,
    },

    #[error("failed to start scheduler thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("scheduler has been shut down")]
    ShutDown,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Running totals since the scheduler was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerTotals {
    pub created: u64,
    pub completed: u64,
    pub total_turnaround_us: u64,
    pub total_wait_us: u64,
    pub dispatches: u64,
    pub preemptions: u64,
    pub io_events: u64,
    pub aging_boosts: u64,
}

impl SchedulerTotals {
    pub fn active(&self) -> u64 {
        self.created.saturating_sub(self.completed)
    }

    pub fn avg_turnaround_us(&self) -> Option<u64> {
        (self.completed > 0).then(|| self.total_turnaround_us / self.completed)
    }

    pub fn avg_wait_us(&self) -> Option<u64> {
        (self.completed > 0).then(|| self.total_wait_us / self.completed)
    }
}

/// What a single [`tick`](Scheduler::tick) did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub cycle: u64,
    pub io_completed: Vec<ProcessId>,
    pub preempted: Option<ProcessId>,
    pub io_started: Option<ProcessId>,
    pub aged: Vec<ProcessId>,
    pub dispatched: Option<ProcessId>,
    /// Page the dispatched process had to fault back in, if any.
    pub page_fault: Option<FaultOutcome>,
    pub deferred_retired: Vec<ProcessId>,
}

impl TickReport {
    /// True when the tick moved nothing.
    pub fn is_idle(&self) -> bool {
        self.io_completed.is_empty()
            && self.preempted.is_none()
            && self.io_started.is_none()
            && self.aged.is_empty()
            && self.dispatched.is_none()
            && self.deferred_retired.is_empty()
    }
}

/// Copies of every tracked PCB at one moment, for display.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub captured_at: DateTime<Utc>,
    pub running: Option<Pcb>,
    pub ready: Vec<Pcb>,
    pub waiting: Vec<Pcb>,
    pub totals: SchedulerTotals,
}

impl SchedulerSnapshot {
    /// Running, then ready in queue order, then waiting in queue order.
    pub fn processes(&self) -> Vec<&Pcb> {
        self.running
            .iter()
            .chain(self.ready.iter())
            .chain(self.waiting.iter())
            .collect()
    }

    /// Every tracked PCB sorted by pid.
    pub fn by_pid(&self) -> Vec<&Pcb> {
        let mut all = self.processes();
        all.sort_by_key(|p| p.pid());
        all
    }

    pub fn active_count(&self) -> usize {
        usize::from(self.running.is_some()) + self.ready.len() + self.waiting.len()
    }

    pub fn find(&self, pid: ProcessId) -> Option<&Pcb> {
        self.processes().into_iter().find(|p| p.pid() == pid)
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    pub(crate) config: LopeConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ready: ProcessQueue,
    pub(crate) waiting: ProcessQueue,
    pub(crate) running: Mutex<Option<Pcb>>,
    pub(crate) vmm: Mutex<VirtualMemoryManager>,
    pub(crate) totals: Mutex<SchedulerTotals>,
    /// Pids admitted and not yet retired, wherever their PCB currently is.
    pub(crate) live: Mutex<HashSet<ProcessId>>,
    /// Live pids whose exit arrived while their PCB was in transit.
    pub(crate) deferred_exits: Mutex<HashSet<ProcessId>>,
    pub(crate) events: EventBus,
    pub(crate) memory: MemoryProfile,
    rng: Mutex<StdRng>,
    /// Serializes ticks from the driver thread and manual callers.
    tick_guard: Mutex<()>,
    active: AtomicBool,
    pub(crate) stopped: AtomicBool,
    cycles: AtomicU64,
}

impl Shared {
    fn new(config: LopeConfig, clock: Arc<dyn Clock>) -> Self {
        let rng = match config.scheduler.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            ready: ProcessQueue::new("ready"),
            waiting: ProcessQueue::new("waiting"),
            running: Mutex::new(None),
            vmm: Mutex::new(VirtualMemoryManager::new(config.vmm.clone())),
            totals: Mutex::new(SchedulerTotals::default()),
            live: Mutex::new(HashSet::new()),
            deferred_exits: Mutex::new(HashSet::new()),
            events: EventBus::default(),
            memory: MemoryProfile::from_config(&config.memory),
            rng: Mutex::new(rng),
            tick_guard: Mutex::new(()),
            active: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            clock,
            config,
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_micros()
    }

    fn tick(&self, now: u64) -> TickReport {
        let _guard = self.tick_guard.lock();
        let cfg = &self.config.scheduler;
        let mut report = TickReport {
            cycle: self.cycles.fetch_add(1, Ordering::AcqRel) + 1,
            ..TickReport::default()
        };

        // 1. I/O completions.
        let finished = self.waiting.take_where(|p| p.io_done(now, cfg.io_duration_us));
        for mut pcb in finished {
            let waited = pcb.complete_io(now);
            let pid = pcb.pid();
            debug!(%pid, waited_us = waited, "I/O complete, boosted to HIGH");
            self.ready.enqueue(pcb);
            self.events.emit(SchedulerEvent::IoCompleted {
                pid,
                waited_us: waited,
            });
            report.io_completed.push(pid);
        }

        // 2. Slice expiry.
        let expired = {
            let mut running = self.running.lock();
            if running
                .as_ref()
                .is_some_and(|p| p.slice_expired(now, cfg.time_slice_us))
            {
                running.take()
            } else {
                None
            }
        };
        if let Some(mut pcb) = expired {
            let pid = pcb.pid();
            let goes_to_io = self.rng.lock().gen::<f64>() < cfg.io_probability;
            if goes_to_io {
                pcb.block_on_io(now);
                debug!(%pid, "slice expired, blocked on I/O");
                self.waiting.enqueue(pcb);
                self.totals.lock().io_events += 1;
                self.events.emit(SchedulerEvent::IoStarted { pid });
                report.io_started = Some(pid);
            } else {
                pcb.preempt(now);
                let priority = pcb.priority();
                debug!(%pid, %priority, "slice expired, preempted");
                self.ready.enqueue(pcb);
                self.totals.lock().preemptions += 1;
                self.events.emit(SchedulerEvent::Preempted { pid, priority });
                report.preempted = Some(pid);
            }
        }

        // 3. Aging.
        let mut boosted = Vec::new();
        self.ready.for_each_mut(|pcb| {
            if pcb.age(cfg.aging_threshold) {
                boosted.push((pcb.pid(), pcb.priority()));
            }
        });
        if !boosted.is_empty() {
            self.totals.lock().aging_boosts += boosted.len() as u64;
        }
        for (pid, priority) in boosted {
            debug!(%pid, %priority, "aged");
            self.events.emit(SchedulerEvent::Aged { pid, priority });
            report.aged.push(pid);
        }

        // 4. Dispatch.
        let idle = self.running.lock().is_none();
        if idle {
            if let Some(mut pcb) = self.ready.dequeue_by_priority() {
                pcb.dispatch(now);
                let (pid, priority) = (pcb.pid(), pcb.priority());
                let dispatches = pcb.dispatch_count();
                let displaced = self.running.lock().replace(pcb);
                // Only ticks fill the slot and ticks are serialized.
                debug_assert!(displaced.is_none());
                if let Some(other) = displaced {
                    self.ready.enqueue(other);
                }
                debug!(%pid, %priority, "dispatched");
                self.totals.lock().dispatches += 1;
                self.events.emit(SchedulerEvent::Dispatched { pid, priority });
                report.dispatched = Some(pid);
                report.page_fault = self.touch_dispatched(pid, dispatches);
            }
        }

        // 5. Deferred exits.
        report.deferred_retired = self.retry_deferred();
        report
    }

    /// The process that just got the CPU touches its next page, walking its
    /// address space one page per dispatch. Returns the fault when the page
    /// had to be loaded.
    fn touch_dispatched(&self, pid: ProcessId, dispatches: u32) -> Option<FaultOutcome> {
        let mut vmm = self.vmm.lock();
        let pages = vmm.page_table(pid).map_or(0, |table| table.len());
        if pages == 0 {
            return None;
        }
        let page = dispatches.saturating_sub(1) as usize % pages;
        match vmm.fault(pid, page) {
            Ok(out) if out.already_resident => None,
            Ok(out) => {
                trace!(%pid, page, frame = out.frame, "page loaded on dispatch");
                Some(out)
            }
            Err(e) => {
                warn!(%pid, page, error = %e, "page touch on dispatch failed");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The scheduling context. Many may coexist; none is global.
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    /// A scheduler on the wall clock. No thread runs until
    /// [`start`](Self::start).
    pub fn new(config: LopeConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: LopeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, clock)),
            thread: None,
        }
    }

    /// Start the background scheduling thread. A no-op if it already runs.
    pub fn start(&mut self) -> Result<(), SchedError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(SchedError::ShutDown);
        }
        if self.thread.is_some() {
            return Ok(());
        }
        self.shared.active.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("lope-scheduler".into())
            .spawn(move || run_loop(shared))
            .map_err(|e| {
                self.shared.active.store(false, Ordering::Release);
                SchedError::Thread(e)
            })?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Run one scheduling cycle at the clock's current time.
    pub fn tick(&self) -> TickReport {
        self.shared.tick(self.shared.now())
    }

    /// Run one scheduling cycle at `now` microseconds.
    pub fn tick_at(&self, now: u64) -> TickReport {
        self.shared.tick(now)
    }

    /// Stop the background thread and wait for it. Exits still deferred are
    /// completed afterwards. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("scheduler thread panicked");
            }
        }
        let _guard = self.shared.tick_guard.lock();
        self.shared.retry_deferred();
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.shared.active.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Receive every transition from now on.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Copies of every PCB. Taken between ticks, so no PCB shows up twice.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let _guard = self.shared.tick_guard.lock();
        let running = self.shared.running.lock().clone();
        let ready = self.shared.ready.snapshot();
        let waiting = self.shared.waiting.snapshot();
        let totals = *self.shared.totals.lock();
        SchedulerSnapshot {
            captured_at: Utc::now(),
            running,
            ready,
            waiting,
            totals,
        }
    }

    pub fn totals(&self) -> SchedulerTotals {
        *self.shared.totals.lock()
    }

    pub fn vmm_status(&self) -> VmmSnapshot {
        self.shared.vmm.lock().status()
    }

    /// Run `f` against the VMM under its lock.
    pub fn with_vmm<R>(&self, f: impl FnOnce(&VirtualMemoryManager) -> R) -> R {
        f(&self.shared.vmm.lock())
    }

    pub fn config(&self) -> &LopeConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    pub fn memory_profile(&self) -> &MemoryProfile {
        &self.shared.memory
    }

    /// Scheduling cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }

    /// Where `pid`'s PCB currently sits, if it is tracked.
    pub fn state_of(&self, pid: ProcessId) -> Option<ProcessState> {
        if let Some(p) = self.shared.running.lock().as_ref().filter(|p| p.pid() == pid) {
            return Some(p.state());
        }
        self.shared
            .ready
            .update(pid, |p| p.state())
            .or_else(|| self.shared.waiting.update(pid, |p| p.state()))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("cycles", &self.cycles())
            .field("ready", &self.shared.ready.len())
            .field("waiting", &self.shared.waiting.len())
            .finish()
    }
}

fn run_loop(shared: Arc<Shared>) {
    let poll = Duration::from_micros(shared.config.scheduler.poll_interval_us);
    info!(
        time_slice_us = shared.config.scheduler.time_slice_us,
        aging_threshold = shared.config.scheduler.aging_threshold,
        "scheduler thread started"
    );
    while shared.active.load(Ordering::Acquire) {
        shared.tick(shared.now());
        thread::park_timeout(poll);
    }
    info!(cycles = shared.cycles.load(Ordering::Acquire), "scheduler thread stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::process::Priority;

    fn config(io_probability: f64) -> LopeConfig {
        let mut cfg = LopeConfig::default();
        cfg.scheduler.io_probability = io_probability;
        cfg.scheduler.seed = Some(1);
        cfg
    }

    fn manual(io_probability: f64) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let sched = Scheduler::with_clock(config(io_probability), clock.clone());
        (sched, clock)
    }

    fn pid(n: u32) -> ProcessId {
        ProcessId::new(n)
    }

    #[test]
    fn first_tick_dispatches_highest_priority() {
        let (sched, _clock) = manual(0.0);
        sched.spawn_request("ls", pid(1)).unwrap();
        sched.spawn_request("pwd", pid(2)).unwrap();
        sched.set_priority(pid(2), 0).unwrap();

        let report = sched.tick();
        assert_eq!(report.dispatched, Some(pid(2)));
        let snap = sched.snapshot();
        assert_eq!(snap.running.as_ref().map(|p| p.pid()), Some(pid(2)));
        assert_eq!(snap.ready.len(), 1);
    }

    #[test]
    fn expired_slice_preempts_and_demotes() {
        let (sched, clock) = manual(0.0);
        sched.spawn_request("ls", pid(1)).unwrap();
        sched.spawn_request("ls", pid(2)).unwrap();
        assert_eq!(sched.tick().dispatched, Some(pid(1)));

        clock.advance(100_000);
        let report = sched.tick();
        assert_eq!(report.preempted, Some(pid(1)));
        assert_eq!(report.dispatched, Some(pid(2)));

        let snap = sched.snapshot();
        let p1 = snap.find(pid(1)).unwrap();
        assert_eq!(p1.state(), ProcessState::Ready);
        assert_eq!(p1.priority(), Priority::LOW);
        assert_eq!(p1.cpu_time_us(), 100_000);
        assert_eq!(sched.totals().preemptions, 1);
    }

    #[test]
    fn slice_not_expired_keeps_running() {
        let (sched, clock) = manual(0.0);
        sched.spawn_request("ls", pid(1)).unwrap();
        sched.tick();
        clock.advance(99_999);
        let report = sched.tick();
        assert!(report.preempted.is_none());
        assert_eq!(sched.state_of(pid(1)), Some(ProcessState::Running));
    }

    #[test]
    fn io_block_and_completion_boosts_to_high() {
        let (sched, clock) = manual(1.0);
        sched.spawn_request("cat", pid(5)).unwrap();
        sched.tick();
        clock.advance(100_000);
        let report = sched.tick();
        assert_eq!(report.io_started, Some(pid(5)));
        assert_eq!(sched.state_of(pid(5)), Some(ProcessState::Waiting));

        clock.advance(199_999);
        assert!(sched.tick().io_completed.is_empty());
        clock.advance(1);
        let report = sched.tick();
        assert_eq!(report.io_completed, vec![pid(5)]);
        // Same tick: back on the CPU.
        assert_eq!(report.dispatched, Some(pid(5)));

        let snap = sched.snapshot();
        let p = snap.running.unwrap();
        assert_eq!(p.priority(), Priority::HIGH);
        assert_eq!(p.wait_time_us(), 200_000);
        assert_eq!(p.io_count(), 1);
    }

    #[test]
    fn ready_process_ages_to_high_and_stays() {
        let (sched, _clock) = manual(0.0);
        sched.spawn_request("ls", pid(1)).unwrap();
        sched.spawn_request("ls", pid(2)).unwrap();
        sched.set_priority(pid(1), 0).unwrap();
        sched.set_priority(pid(2), 2).unwrap();

        for _ in 0..5 {
            sched.tick();
        }
        assert_eq!(sched.snapshot().find(pid(2)).unwrap().priority(), Priority::NORMAL);
        for _ in 0..5 {
            sched.tick();
        }
        assert_eq!(sched.snapshot().find(pid(2)).unwrap().priority(), Priority::HIGH);
        for _ in 0..10 {
            sched.tick();
        }
        let snap = sched.snapshot();
        assert_eq!(snap.find(pid(2)).unwrap().priority(), Priority::HIGH);
        assert_eq!(snap.totals.aging_boosts, 2);
        // The running process never aged.
        assert_eq!(snap.running.unwrap().pid(), pid(1));
    }

    #[test]
    fn seeded_schedulers_make_identical_io_draws() {
        let run = || {
            let (sched, clock) = manual(0.5);
            for n in 1..=4 {
                sched.spawn_request("ls", pid(n)).unwrap();
            }
            let mut trace = Vec::new();
            for _ in 0..40 {
                clock.advance(50_000);
                let r = sched.tick();
                trace.push((r.preempted, r.io_started, r.dispatched));
            }
            trace
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn events_follow_transitions() {
        let (sched, clock) = manual(0.0);
        let rx = sched.subscribe();
        sched.spawn_request("ls", pid(1)).unwrap();
        sched.tick();
        clock.advance(100_000);
        sched.tick();

        let events: Vec<SchedulerEvent> = rx.try_iter().collect();
        assert!(matches!(events[0], SchedulerEvent::Admitted { .. }));
        assert!(matches!(events[1], SchedulerEvent::Dispatched { .. }));
        assert!(matches!(events[2], SchedulerEvent::Preempted { .. }));
        assert!(matches!(events[3], SchedulerEvent::Dispatched { .. }));
    }

    #[test]
    fn dispatch_faults_evicted_page_back_in() {
        let mut cfg = config(0.0);
        cfg.vmm.physical_frames = 4;
        let sched = Scheduler::with_clock(cfg, Arc::new(ManualClock::new(0)));
        sched.spawn_request("ps", pid(1)).unwrap();
        sched.spawn_request("ps", pid(2)).unwrap();
        // Loading pid 2's four pages pushed out all of pid 1's.
        let counters = sched.vmm_status().counters;
        assert_eq!((counters.page_faults, counters.evictions), (8, 4));

        let report = sched.tick();
        assert_eq!(report.dispatched, Some(pid(1)));
        let fault = report.page_fault.unwrap();
        assert!(fault.evicted.is_some());
        assert_eq!(sched.vmm_status().counters.page_faults, 9);
        sched.with_vmm(|vm| vm.check_invariants()).unwrap();
    }

    #[test]
    fn resident_page_on_dispatch_is_not_a_fault() {
        let (sched, _clock) = manual(0.0);
        sched.spawn_request("ls", pid(1)).unwrap();
        let report = sched.tick();
        assert_eq!(report.dispatched, Some(pid(1)));
        assert!(report.page_fault.is_none());
        assert_eq!(sched.vmm_status().counters.page_faults, 2);
    }

    #[test]
    fn background_thread_starts_and_joins() {
        let mut cfg = config(0.0);
        cfg.scheduler.poll_interval_us = 1_000;
        let mut sched = Scheduler::new(cfg);
        sched.start().unwrap();
        assert!(sched.is_running());
        sched.spawn_request("sleep", pid(42)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sched.state_of(pid(42)) != Some(ProcessState::Running) {
            assert!(std::time::Instant::now() < deadline, "never dispatched");
            thread::sleep(Duration::from_millis(2));
        }
        sched.shutdown();
        assert!(!sched.is_running());
        assert!(sched.cycles() > 0);
        assert!(matches!(sched.start(), Err(SchedError::ShutDown)));
    }
}
