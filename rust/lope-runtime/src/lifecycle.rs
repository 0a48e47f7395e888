//! Glue between OS process lifecycles and the scheduler.
//!
//! A shell spawns a real OS process, then calls
//! [`Scheduler::spawn_request`] to start tracking it and
//! [`Scheduler::finalize`] once the OS reports its exit. The scheduler never
//! starts or stops OS processes itself.
//!
//! [`ProcessBridge`] does both halves for callers that want it: it splits a
//! command line, spawns the process with [`std::process::Command`], registers
//! it, and then waits (foreground) or keeps the [`Child`] for reaping
//! (background).

use crate::config::MemoryConfig;
use crate::events::SchedulerEvent;
use crate::process::{Pcb, Priority, ProcessId};
use crate::scheduler::{SchedError, Scheduler, Shared};
use crate::vmm::{AccessMode, AccessOutcome, FaultOutcome, Release, VirtualMemoryManager};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace, warn};

// ---------------------------------------------------------------------------
// MemoryProfile
// ---------------------------------------------------------------------------

const BUILTIN_PROFILE: &[(&str, u64)] = &[
    ("ls", 8 * 1024),
    ("whoami", 4 * 1024),
    ("who", 12 * 1024),
    ("pwd", 6 * 1024),
    ("date", 8 * 1024),
    ("ps", 16 * 1024),
    ("cat", 12 * 1024),
    ("sleep", 4 * 1024),
];

/// Bytes of simulated memory requested per command name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProfile {
    default_bytes: u64,
    commands: BTreeMap<String, u64>,
}

impl MemoryProfile {
    pub fn builtin() -> Self {
        Self {
            default_bytes: 10 * 1024,
            commands: BUILTIN_PROFILE
                .iter()
                .map(|(name, bytes)| (name.to_string(), *bytes))
                .collect(),
        }
    }

    /// The built-in table with `cfg`'s default and overrides applied.
    pub fn from_config(cfg: &MemoryConfig) -> Self {
        let mut profile = Self::builtin();
        profile.default_bytes = cfg.default_bytes;
        profile
            .commands
            .extend(cfg.commands.iter().map(|(k, v)| (k.clone(), *v)));
        profile
    }

    /// Memory for `command`, matched on the basename of its first word.
    pub fn bytes_for(&self, command: &str) -> u64 {
        let program = command.split_whitespace().next().unwrap_or_default();
        let name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        self.commands
            .get(name)
            .copied()
            .unwrap_or(self.default_bytes)
    }

    pub fn default_bytes(&self) -> u64 {
        self.default_bytes
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.commands.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Default for MemoryProfile {
    fn default() -> Self {
        Self::builtin()
    }
}

// ---------------------------------------------------------------------------
// ProcessReport
// ---------------------------------------------------------------------------

/// Final accounting of a retired process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub pid: ProcessId,
    pub command: String,
    pub priority: Priority,
    pub cpu_time_us: u64,
    pub wait_time_us: u64,
    pub turnaround_us: u64,
    pub io_count: u32,
    pub dispatch_count: u32,
    pub memory_bytes: u64,
    pub release: Option<Release>,
}

// ---------------------------------------------------------------------------
// Scheduler lifecycle operations
// ---------------------------------------------------------------------------

impl Scheduler {
    /// Start tracking an OS process that has just been spawned.
    ///
    /// Memory is allocated and paged in first; if allocation fails no PCB is
    /// created.
    pub fn spawn_request(&self, command: &str, pid: ProcessId) -> Result<(), SchedError> {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::Acquire) {
            return Err(SchedError::ShutDown);
        }
        if !shared.live.lock().insert(pid) {
            warn!(%pid, "spawn request for a pid that is already tracked");
            return Err(SchedError::DuplicateProcess(pid));
        }

        let memory = shared.memory.bytes_for(command);
        let loaded = {
            let mut vmm = shared.vmm.lock();
            vmm.allocate(pid, memory)
                .map(|()| load_address_space(&mut vmm, pid))
        };
        let pages = match loaded {
            Ok(pages) => pages,
            Err(e) => {
                shared.live.lock().remove(&pid);
                warn!(%pid, command, error = %e, "memory allocation failed, process not tracked");
                return Err(e.into());
            }
        };

        let priority = shared.config.scheduler.initial_priority;
        let mut pcb = Pcb::new(pid, command, priority, memory, shared.now());
        pcb.admit();
        let command = pcb.command().to_string();
        shared.totals.lock().created += 1;
        shared.ready.enqueue(pcb);

        debug!(%pid, %command, %priority, kib = memory / 1024, pages, "admitted");
        shared.events.emit(SchedulerEvent::Admitted {
            pid,
            command,
            priority,
            memory_bytes: memory,
        });
        Ok(())
    }

    /// Stop tracking `pid` after its OS process exited.
    ///
    /// Returns the final accounting, or `None` when the pid is unknown,
    /// already retired, or caught between containers (its exit is then
    /// completed by the next tick).
    pub fn finalize(&self, pid: ProcessId) -> Option<ProcessReport> {
        self.shared.finalize(pid)
    }

    /// Operator priority override. Levels: 0 = HIGH, 1 = NORMAL, 2 = LOW.
    pub fn set_priority(&self, pid: ProcessId, level: u8) -> Result<(), SchedError> {
        let priority = Priority::new(level)?;
        let shared = &self.shared;

        let on_cpu = {
            let mut running = shared.running.lock();
            match running.as_mut().filter(|p| p.pid() == pid) {
                Some(pcb) => {
                    pcb.set_priority(priority);
                    true
                }
                None => false,
            }
        };
        let found = on_cpu
            || shared
                .ready
                .update(pid, |p| {
                    p.set_priority(priority);
                    p.reset_age();
                })
                .is_some()
            || shared
                .waiting
                .update(pid, |p| p.set_priority(priority))
                .is_some();

        if !found {
            return Err(SchedError::UnknownProcess(pid));
        }
        debug!(%pid, %priority, "priority changed");
        shared
            .events
            .emit(SchedulerEvent::PriorityChanged { pid, priority });
        Ok(())
    }

    /// Fault `page` of a tracked process into memory.
    pub fn fault(&self, pid: ProcessId, page: usize) -> Result<FaultOutcome, SchedError> {
        Ok(self.shared.vmm.lock().fault(pid, page)?)
    }

    /// Touch `page` of a tracked process.
    pub fn access(
        &self,
        pid: ProcessId,
        page: usize,
        mode: AccessMode,
    ) -> Result<AccessOutcome, SchedError> {
        Ok(self.shared.vmm.lock().access(pid, page, mode)?)
    }
}

/// Fault in every page of a freshly allocated process. Returns how many
/// pages are resident afterwards; loading stops at the first failure.
fn load_address_space(vmm: &mut VirtualMemoryManager, pid: ProcessId) -> usize {
    let pages = vmm.page_table(pid).map_or(0, |table| table.len());
    for page in 0..pages {
        if let Err(e) = vmm.fault(pid, page) {
            warn!(%pid, page, error = %e, "could not load page at admission");
            return page;
        }
    }
    pages
}

impl Shared {
    /// `live` is held from the membership check until the PCB is retired or
    /// its exit is recorded, so a pid leaves `live` and `deferred_exits`
    /// together and a reused pid never inherits a stale exit.
    pub(crate) fn finalize(&self, pid: ProcessId) -> Option<ProcessReport> {
        let mut live = self.live.lock();
        if !live.contains(&pid) {
            trace!(%pid, "finalize: not tracked");
            return None;
        }
        match self.unlink(pid) {
            Some(pcb) => Some(self.retire(pcb, &mut live)),
            None => {
                debug!(%pid, "finalize deferred, PCB in transit");
                self.deferred_exits.lock().insert(pid);
                None
            }
        }
    }

    /// Remove `pid` from whichever container holds it: running slot, then
    /// ready, then waiting.
    fn unlink(&self, pid: ProcessId) -> Option<Pcb> {
        {
            let mut running = self.running.lock();
            if running.as_ref().is_some_and(|p| p.pid() == pid) {
                return running.take();
            }
        }
        self.ready
            .remove_by_id(pid)
            .or_else(|| self.waiting.remove_by_id(pid))
    }

    /// Caller holds the `live` lock.
    fn retire(&self, mut pcb: Pcb, live: &mut HashSet<ProcessId>) -> ProcessReport {
        let now = self.now();
        let pid = pcb.pid();
        pcb.terminate(now);
        let turnaround_us = pcb.turnaround_us(now);
        {
            let mut totals = self.totals.lock();
            totals.completed += 1;
            totals.total_turnaround_us += turnaround_us;
            totals.total_wait_us += pcb.wait_time_us();
        }
        let release = self.vmm.lock().deallocate(pid);
        self.deferred_exits.lock().remove(&pid);
        live.remove(&pid);

        info!(
            %pid,
            cpu_ms = pcb.cpu_time_us() / 1000,
            wait_ms = pcb.wait_time_us() / 1000,
            io = pcb.io_count(),
            "process finished"
        );
        self.events.emit(SchedulerEvent::Retired { pid, turnaround_us });

        ProcessReport {
            pid,
            command: pcb.command().to_string(),
            priority: pcb.priority(),
            cpu_time_us: pcb.cpu_time_us(),
            wait_time_us: pcb.wait_time_us(),
            turnaround_us,
            io_count: pcb.io_count(),
            dispatch_count: pcb.dispatch_count(),
            memory_bytes: pcb.memory_allocated(),
            release,
        }
    }

    /// Retire every deferred exit whose PCB is back in a container.
    pub(crate) fn retry_deferred(&self) -> Vec<ProcessId> {
        let mut pending: Vec<ProcessId> = {
            let _live = self.live.lock();
            self.deferred_exits.lock().drain().collect()
        };
        if pending.is_empty() {
            return pending;
        }
        pending.sort();

        let mut retired = Vec::new();
        for pid in pending {
            let mut live = self.live.lock();
            if !live.contains(&pid) {
                continue;
            }
            match self.unlink(pid) {
                Some(pcb) => {
                    self.retire(pcb, &mut live);
                    retired.push(pid);
                }
                None => {
                    self.deferred_exits.lock().insert(pid);
                }
            }
        }
        retired
    }
}

// ---------------------------------------------------------------------------
// ProcessBridge
// ---------------------------------------------------------------------------

struct BackgroundJob {
    pid: ProcessId,
    command: String,
    child: Child,
}

/// Result of [`ProcessBridge::launch`].
#[derive(Debug)]
pub struct LaunchOutcome {
    pub pid: ProcessId,
    pub command: String,
    pub background: bool,
    /// Whether the scheduler accepted the process. The OS process runs
    /// either way.
    pub registration: Result<(), SchedError>,
    /// Exit status of a foreground process.
    pub status: Option<ExitStatus>,
    pub report: Option<ProcessReport>,
    /// Background jobs reaped before this launch.
    pub reaped: Vec<ReapedJob>,
}

/// A background job that has exited.
#[derive(Debug)]
pub struct ReapedJob {
    pub pid: ProcessId,
    pub command: String,
    pub status: ExitStatus,
    pub report: Option<ProcessReport>,
}

/// Spawns OS processes and keeps the scheduler's view of them current.
///
/// Dropping the bridge blocks until every background job has exited, so no
/// child is left unreaped and no PCB is left unfinalized.
pub struct ProcessBridge {
    scheduler: Scheduler,
    background: Vec<BackgroundJob>,
}

impl ProcessBridge {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            background: Vec::new(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Run `line` as an OS process.
    ///
    /// Foreground launches block until the process exits and then finalize
    /// it. Background launches return at once; the child is reaped by a later
    /// [`reap_background`](Self::reap_background) (every launch does one
    /// first).
    pub fn launch(&mut self, line: &str, background: bool) -> Result<LaunchOutcome, SchedError> {
        let reaped = self.reap_background();

        let argv = shell_words::split(line).map_err(|source| SchedError::InvalidCommandLine {
            line: line.to_string(),
            source,
        })?;
        let (program, args) = argv.split_first().ok_or(SchedError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .spawn()
            .map_err(|source| SchedError::Spawn {
                command: program.clone(),
                source,
            })?;
        let pid = ProcessId::new(child.id());

        let registration = self.scheduler.spawn_request(program, pid);
        if let Err(e) = &registration {
            warn!(%pid, command = %program, error = %e, "process runs untracked");
        }

        if background {
            info!(%pid, command = %program, "background job started");
            self.background.push(BackgroundJob {
                pid,
                command: program.clone(),
                child,
            });
            return Ok(LaunchOutcome {
                pid,
                command: program.clone(),
                background,
                registration,
                status: None,
                report: None,
                reaped,
            });
        }

        let waited = child.wait();
        let report = self.scheduler.finalize(pid);
        let status = waited.map_err(|source| SchedError::Wait { pid, source })?;
        Ok(LaunchOutcome {
            pid,
            command: program.clone(),
            background,
            registration,
            status: Some(status),
            report,
            reaped,
        })
    }

    /// Finalize every background job that has exited, without blocking.
    pub fn reap_background(&mut self) -> Vec<ReapedJob> {
        let scheduler = &self.scheduler;
        let mut reaped = Vec::new();
        self.background.retain_mut(|job| match job.child.try_wait() {
            Ok(Some(status)) => {
                info!(pid = %job.pid, command = %job.command, %status, "background job done");
                reaped.push(ReapedJob {
                    pid: job.pid,
                    command: job.command.clone(),
                    status,
                    report: scheduler.finalize(job.pid),
                });
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = %job.pid, error = %e, "cannot poll background job");
                true
            }
        });
        reaped
    }

    /// Block until every background job has exited, finalizing each.
    pub fn wait_background(&mut self) -> Vec<ReapedJob> {
        let mut reaped = Vec::new();
        for mut job in self.background.drain(..) {
            match job.child.wait() {
                Ok(status) => reaped.push(ReapedJob {
                    pid: job.pid,
                    report: self.scheduler.finalize(job.pid),
                    command: job.command,
                    status,
                }),
                Err(e) => {
                    warn!(pid = %job.pid, error = %e, "cannot wait for background job");
                    self.scheduler.finalize(job.pid);
                }
            }
        }
        reaped
    }

    /// Pids and command names of background jobs not yet reaped.
    pub fn background_jobs(&self) -> Vec<(ProcessId, &str)> {
        self.background
            .iter()
            .map(|j| (j.pid, j.command.as_str()))
            .collect()
    }

    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        if !self.background.is_empty() {
            debug!(jobs = self.background.len(), "waiting for background jobs");
            self.wait_background();
        }
    }
}

impl std::fmt::Debug for ProcessBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBridge")
            .field("scheduler", &self.scheduler)
            .field("background", &self.background.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LopeConfig;
    use crate::process::ProcessState;
    use crate::vmm::VmmError;
    use std::sync::Arc;

    fn scheduler() -> (Scheduler, Arc<ManualClock>) {
        let mut cfg = LopeConfig::default();
        cfg.scheduler.io_probability = 0.0;
        cfg.scheduler.seed = Some(3);
        let clock = Arc::new(ManualClock::new(1_000));
        (Scheduler::with_clock(cfg, clock.clone()), clock)
    }

    fn pid(n: u32) -> ProcessId {
        ProcessId::new(n)
    }

    #[test]
    fn memory_profile_matches_basename() {
        let profile = MemoryProfile::builtin();
        assert_eq!(profile.bytes_for("ls"), 8 * 1024);
        assert_eq!(profile.bytes_for("/bin/ls -la"), 8 * 1024);
        assert_eq!(profile.bytes_for("ps"), 16 * 1024);
        assert_eq!(profile.bytes_for("vim"), 10 * 1024);
        assert_eq!(profile.bytes_for(""), 10 * 1024);
    }

    #[test]
    fn memory_profile_applies_overrides() {
        let mut cfg = MemoryConfig::default();
        cfg.default_bytes = 2048;
        cfg.commands.insert("ls".into(), 1024);
        let profile = MemoryProfile::from_config(&cfg);
        assert_eq!(profile.bytes_for("ls"), 1024);
        assert_eq!(profile.bytes_for("who"), 12 * 1024);
        assert_eq!(profile.bytes_for("vim"), 2048);
    }

    #[test]
    fn spawn_request_admits_to_ready_with_memory() {
        let (sched, _clock) = scheduler();
        sched.spawn_request("ps", pid(10)).unwrap();
        let snap = sched.snapshot();
        let pcb = &snap.ready[0];
        assert_eq!(pcb.state(), ProcessState::Ready);
        assert_eq!(pcb.priority(), Priority::NORMAL);
        assert_eq!(pcb.memory_allocated(), 16 * 1024);
        assert_eq!(pcb.arrival_us(), 1_000);
        assert_eq!(sched.with_vmm(|vm| vm.page_table(pid(10)).map(|t| t.len())), Some(4));
        assert_eq!(snap.totals.created, 1);
    }

    #[test]
    fn duplicate_pid_is_rejected() {
        let (sched, _clock) = scheduler();
        sched.spawn_request("ls", pid(1)).unwrap();
        assert!(matches!(
            sched.spawn_request("ls", pid(1)),
            Err(SchedError::DuplicateProcess(p)) if p == pid(1)
        ));
        assert_eq!(sched.snapshot().active_count(), 1);
    }

    #[test]
    fn failed_allocation_creates_no_pcb() {
        let mut cfg = LopeConfig::default();
        cfg.vmm.max_processes = 1;
        let sched = Scheduler::with_clock(cfg, Arc::new(ManualClock::new(0)));
        sched.spawn_request("ls", pid(1)).unwrap();
        let err = sched.spawn_request("ls", pid(2)).unwrap_err();
        assert!(matches!(err, SchedError::Vmm(VmmError::TableFull { .. })));
        assert!(sched.snapshot().find(pid(2)).is_none());
        assert_eq!(sched.totals().created, 1);
        // The pid is free to try again once memory frees up.
        sched.finalize(pid(1)).unwrap();
        sched.spawn_request("ls", pid(2)).unwrap();
    }

    #[test]
    fn finalize_running_process_reports_and_frees_memory() {
        let (sched, clock) = scheduler();
        sched.spawn_request("ls", pid(7)).unwrap();
        sched.tick();
        sched.access(pid(7), 0, AccessMode::Write).unwrap();
        sched.access(pid(7), 1, AccessMode::Read).unwrap();
        clock.advance(40_000);

        let report = sched.finalize(pid(7)).unwrap();
        assert_eq!(report.cpu_time_us, 40_000);
        assert_eq!(report.turnaround_us, 40_000);
        assert_eq!(report.release.unwrap().frames_freed, 2);
        assert!(sched.snapshot().running.is_none());
        assert_eq!(sched.vmm_status().used_frames, 0);

        let totals = sched.totals();
        assert_eq!(totals.completed, 1);
        assert_eq!(totals.avg_turnaround_us(), Some(40_000));
    }

    #[test]
    fn finalize_twice_is_a_noop() {
        let (sched, _clock) = scheduler();
        sched.spawn_request("ls", pid(3)).unwrap();
        assert!(sched.finalize(pid(3)).is_some());
        assert!(sched.finalize(pid(3)).is_none());
        assert!(sched.finalize(pid(999)).is_none());
        assert_eq!(sched.totals().completed, 1);
    }

    #[test]
    fn racing_finalizes_leave_no_exit_for_a_reused_pid() {
        let (sched, _clock) = scheduler();
        for round in 1..=200u64 {
            sched.spawn_request("ls", pid(77)).unwrap();
            let reports = std::thread::scope(|s| {
                let fg = s.spawn(|| sched.finalize(pid(77)));
                let bg = s.spawn(|| sched.finalize(pid(77)));
                [fg.join().unwrap(), bg.join().unwrap()]
            });
            assert_eq!(reports.iter().filter(|r| r.is_some()).count(), 1);
            assert!(sched.shared.deferred_exits.lock().is_empty());

            // The OS hands the pid to an unrelated process.
            sched.spawn_request("cat", pid(77)).unwrap();
            assert!(sched.tick().deferred_retired.is_empty());
            assert_eq!(sched.state_of(pid(77)), Some(ProcessState::Running));
            sched.finalize(pid(77)).unwrap();
            assert_eq!(sched.totals().completed, 2 * round);
        }
    }

    #[test]
    fn finalize_waiting_process_accounts_wait() {
        let mut cfg = LopeConfig::default();
        cfg.scheduler.io_probability = 1.0;
        let clock = Arc::new(ManualClock::new(0));
        let sched = Scheduler::with_clock(cfg, clock.clone());
        sched.spawn_request("cat", pid(4)).unwrap();
        sched.tick();
        clock.advance(100_000);
        sched.tick();
        assert_eq!(sched.state_of(pid(4)), Some(ProcessState::Waiting));
        clock.advance(50_000);

        let report = sched.finalize(pid(4)).unwrap();
        assert_eq!(report.wait_time_us, 50_000);
        assert_eq!(report.io_count, 1);
        assert!(sched.snapshot().waiting.is_empty());
    }

    #[test]
    fn in_transit_exit_is_completed_by_next_tick() {
        let (sched, _clock) = scheduler();
        sched.spawn_request("ls", pid(8)).unwrap();

        // Hold the PCB outside every container, as a tick does mid-move.
        let pcb = sched.shared.ready.remove_by_id(pid(8)).unwrap();
        assert!(sched.finalize(pid(8)).is_none());
        assert!(sched.shared.deferred_exits.lock().contains(&pid(8)));
        sched.shared.ready.enqueue(pcb);

        let report = sched.tick();
        assert_eq!(report.deferred_retired, vec![pid(8)]);
        assert_eq!(sched.snapshot().active_count(), 0);
        assert_eq!(sched.totals().completed, 1);
        assert!(!sched.with_vmm(|vm| vm.is_allocated(pid(8))));
    }

    #[test]
    fn set_priority_validates_and_finds_process() {
        let (sched, _clock) = scheduler();
        sched.spawn_request("ls", pid(1)).unwrap();
        assert!(matches!(
            sched.set_priority(pid(1), 3),
            Err(SchedError::InvalidPriority(_))
        ));
        assert!(matches!(
            sched.set_priority(pid(2), 0),
            Err(SchedError::UnknownProcess(_))
        ));
        sched.set_priority(pid(1), 2).unwrap();
        assert_eq!(sched.snapshot().ready[0].priority(), Priority::LOW);

        sched.tick();
        sched.set_priority(pid(1), 0).unwrap();
        assert_eq!(sched.snapshot().running.unwrap().priority(), Priority::HIGH);
    }

    #[test]
    fn spawn_after_shutdown_is_refused() {
        let (mut sched, _clock) = scheduler();
        sched.shutdown();
        assert!(matches!(
            sched.spawn_request("ls", pid(1)),
            Err(SchedError::ShutDown)
        ));
    }

    #[test]
    fn bridge_rejects_bad_command_lines() {
        let (sched, _clock) = scheduler();
        let mut bridge = ProcessBridge::new(sched);
        assert!(matches!(bridge.launch("   ", false), Err(SchedError::EmptyCommand)));
        assert!(matches!(
            bridge.launch("echo 'unterminated", false),
            Err(SchedError::InvalidCommandLine { .. })
        ));
        assert!(matches!(
            bridge.launch("/definitely/not/a/binary", false),
            Err(SchedError::Spawn { .. })
        ));
        assert_eq!(bridge.scheduler().totals().created, 0);
    }
}
