//! Integration tests for spawn/finalize bookkeeping and the OS process
//! bridge.

use lope_runtime::*;
use std::sync::Arc;

fn pid(n: u32) -> ProcessId {
    ProcessId::new(n)
}

fn scheduler() -> (Scheduler, Arc<ManualClock>) {
    let mut cfg = LopeConfig::default();
    cfg.scheduler.io_probability = 0.0;
    cfg.scheduler.seed = Some(7);
    let clock = Arc::new(ManualClock::new(0));
    (Scheduler::with_clock(cfg, clock.clone()), clock)
}

// ===========================================================================
// spawn_request / finalize
// ===========================================================================

#[test]
fn totals_average_over_completed_processes() {
    let (sched, clock) = scheduler();
    sched.spawn_request("ls", pid(1)).unwrap();
    sched.spawn_request("pwd", pid(2)).unwrap();
    clock.advance(100_000);
    sched.finalize(pid(1)).unwrap();
    clock.advance(200_000);
    sched.finalize(pid(2)).unwrap();

    let totals = sched.totals();
    assert_eq!(totals.created, 2);
    assert_eq!(totals.completed, 2);
    assert_eq!(totals.active(), 0);
    assert_eq!(totals.avg_turnaround_us(), Some(200_000));
    assert_eq!(totals.avg_wait_us(), Some(0));
}

#[test]
fn no_averages_before_anything_completes() {
    let (sched, _clock) = scheduler();
    sched.spawn_request("ls", pid(1)).unwrap();
    assert_eq!(sched.totals().avg_turnaround_us(), None);
}

#[test]
fn snapshot_sorts_by_pid_for_the_process_table() {
    let (sched, _clock) = scheduler();
    for n in [30, 10, 20] {
        sched.spawn_request("ls", pid(n)).unwrap();
    }
    sched.tick();
    let snap = sched.snapshot();
    let order: Vec<u32> = snap.by_pid().iter().map(|p| p.pid().as_u32()).collect();
    assert_eq!(order, vec![10, 20, 30]);
    assert_eq!(snap.running.as_ref().unwrap().pid(), pid(30));
}

#[test]
fn retire_emits_event_and_frees_vmm_record() {
    let (sched, _clock) = scheduler();
    let rx = sched.subscribe();
    sched.spawn_request("who", pid(5)).unwrap();
    sched.fault(pid(5), 2).unwrap();
    let report = sched.finalize(pid(5)).unwrap();
    assert_eq!(report.memory_bytes, 12 * 1024);
    assert_eq!(report.release.unwrap().pages, 3);

    let events: Vec<SchedulerEvent> = rx.try_iter().collect();
    assert!(matches!(events.last(), Some(SchedulerEvent::Retired { pid: p, .. }) if *p == pid(5)));
    assert!(matches!(
        sched.fault(pid(5), 0),
        Err(SchedError::Vmm(VmmError::UnknownProcess(_)))
    ));
}

#[test]
fn memory_errors_surface_through_the_scheduler() {
    let (sched, _clock) = scheduler();
    sched.spawn_request("ls", pid(1)).unwrap();
    assert!(matches!(
        sched.access(pid(1), 2, AccessMode::Read),
        Err(SchedError::Vmm(VmmError::SegFault { pages: 2, .. }))
    ));
}

#[test]
fn pid_can_be_reused_after_retirement() {
    let (sched, _clock) = scheduler();
    sched.spawn_request("ls", pid(1)).unwrap();
    sched.finalize(pid(1)).unwrap();
    sched.spawn_request("cat", pid(1)).unwrap();
    assert_eq!(sched.snapshot().ready[0].command(), "cat");
}

// ===========================================================================
// ProcessBridge (needs real processes)
// ===========================================================================

#[cfg(unix)]
#[test]
fn foreground_launch_waits_and_finalizes() {
    let (sched, _clock) = scheduler();
    let mut bridge = ProcessBridge::new(sched);
    let out = bridge.launch("true", false).unwrap();
    assert!(out.registration.is_ok());
    assert!(out.status.unwrap().success());
    let report = out.report.unwrap();
    assert_eq!(report.command, "true");
    assert_eq!(report.memory_bytes, 10 * 1024);
    assert_eq!(report.release.unwrap().frames_freed, 3);
    assert_eq!(bridge.scheduler().snapshot().active_count(), 0);
}

#[cfg(unix)]
#[test]
fn background_launch_is_reaped_later() {
    let (sched, _clock) = scheduler();
    let mut bridge = ProcessBridge::new(sched);
    let out = bridge.launch("sleep 0.1", true).unwrap();
    assert!(out.status.is_none());
    assert_eq!(bridge.background_jobs(), vec![(out.pid, "sleep")]);
    assert!(bridge.scheduler().snapshot().find(out.pid).is_some());

    let reaped = bridge.wait_background();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].pid, out.pid);
    assert!(reaped[0].report.is_some());
    assert!(bridge.background_jobs().is_empty());
    assert_eq!(bridge.scheduler().totals().completed, 1);
}

#[cfg(unix)]
#[test]
fn finished_background_jobs_are_reaped_on_next_launch() {
    let (sched, _clock) = scheduler();
    let mut bridge = ProcessBridge::new(sched);
    let bg = bridge.launch("true", true).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(200));
    let fg = bridge.launch("true", false).unwrap();
    assert_eq!(fg.reaped.len(), 1);
    assert_eq!(fg.reaped[0].pid, bg.pid);
    assert_eq!(bridge.scheduler().totals().completed, 2);
}

#[cfg(unix)]
#[test]
fn dropping_the_bridge_reaps_background_jobs() {
    let (sched, _clock) = scheduler();
    let rx = sched.subscribe();
    let mut bridge = ProcessBridge::new(sched);
    let out = bridge.launch("sleep 0.1", true).unwrap();
    drop(bridge);

    let retired: Vec<ProcessId> = rx
        .try_iter()
        .filter_map(|e| match e {
            SchedulerEvent::Retired { pid, .. } => Some(pid),
            _ => None,
        })
        .collect();
    assert_eq!(retired, vec![out.pid]);
}
