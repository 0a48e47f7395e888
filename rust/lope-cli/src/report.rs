//! Plain-text reports: process table, scheduler statistics, VMM status.
//!
//! Each report borrows what it shows and renders through [`fmt::Display`],
//! so callers `print!` it directly or call `to_string()`.

use lope_runtime::{LopeConfig, SchedulerSnapshot, VmmSnapshot};
use std::fmt;

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

pub struct ProcessTable<'a> {
    snap: &'a SchedulerSnapshot,
    detailed: bool,
    sort_by_pid: bool,
}

/// The process table. `detailed` adds accounting columns; `sort_by_pid`
/// orders rows by pid instead of running/ready/waiting order.
pub fn process_table(
    snap: &SchedulerSnapshot,
    detailed: bool,
    sort_by_pid: bool,
) -> ProcessTable<'_> {
    ProcessTable {
        snap,
        detailed,
        sort_by_pid,
    }
}

impl fmt::Display for ProcessTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Process Table ===")?;
        if self.detailed {
            writeln!(
                f,
                "{:<6} {:<15} {:<10} {:<3} {:<8} {:<8} {:<4} {:<4} {:<8}",
                "PID", "Command", "State", "PRI", "CPU(ms)", "Wait(ms)", "I/O", "AGE", "Mem(KB)"
            )?;
            writeln!(f, "{}", "-".repeat(71))?;
        } else {
            writeln!(f, "{:<6} {:<15} {:<10} {:<3}", "PID", "Command", "State", "PRI")?;
            writeln!(f, "{}", "-".repeat(35))?;
        }

        let rows = if self.sort_by_pid {
            self.snap.by_pid()
        } else {
            self.snap.processes()
        };
        for p in &rows {
            if self.detailed {
                writeln!(
                    f,
                    "{:<6} {:<15} {:<10} {:<3} {:<8} {:<8} {:<4} {:<4} {:<8}",
                    p.pid().as_u32(),
                    p.command(),
                    p.state().to_string(),
                    p.priority().level(),
                    p.cpu_time_us() / 1000,
                    p.wait_time_us() / 1000,
                    p.io_count(),
                    p.age_counter(),
                    p.memory_allocated() / 1024
                )?;
            } else {
                writeln!(
                    f,
                    "{:<6} {:<15} {:<10} {:<3}",
                    p.pid().as_u32(),
                    p.command(),
                    p.state().to_string(),
                    p.priority().level()
                )?;
            }
        }

        let t = &self.snap.totals;
        writeln!(
            f,
            "\nTotal: {}, Active: {}, Done: {}",
            t.created,
            rows.len(),
            t.completed
        )?;
        if let (Some(turnaround), Some(wait)) = (t.avg_turnaround_us(), t.avg_wait_us()) {
            writeln!(
                f,
                "Avg Turnaround: {}ms, Avg Wait: {}ms",
                turnaround / 1000,
                wait / 1000
            )?;
        }
        writeln!(f, "===================")
    }
}

// ---------------------------------------------------------------------------
// Scheduler statistics
// ---------------------------------------------------------------------------

pub struct SchedulerStats<'a> {
    snap: &'a SchedulerSnapshot,
    cfg: &'a LopeConfig,
}

pub fn scheduler_stats<'a>(
    snap: &'a SchedulerSnapshot,
    cfg: &'a LopeConfig,
) -> SchedulerStats<'a> {
    SchedulerStats { snap, cfg }
}

impl fmt::Display for SchedulerStats<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.cfg.scheduler;
        let t = &self.snap.totals;
        writeln!(f, "\n=== Scheduler Statistics ===")?;
        writeln!(f, "Algorithm: Round Robin + Priority + Aging")?;
        writeln!(f, "Time Slice: {} ms", s.time_slice_us / 1000)?;
        writeln!(f, "Aging: Priority boost every {} cycles", s.aging_threshold)?;
        writeln!(
            f,
            "I/O Time: {} ms simulation ({:.0}% chance per slice)",
            s.io_duration_us / 1000,
            s.io_probability * 100.0
        )?;
        writeln!(f, "\nProcess Counts:")?;
        writeln!(f, "  Total Created: {}", t.created)?;
        writeln!(f, "  Completed: {}", t.completed)?;
        writeln!(f, "  Active: {}", t.active())?;
        writeln!(f, "  Ready Queue: {}", self.snap.ready.len())?;
        writeln!(f, "  I/O Waiting: {}", self.snap.waiting.len())?;
        match &self.snap.running {
            Some(p) => writeln!(
                f,
                "  Currently Running: PID {} ({})",
                p.pid().as_u32(),
                p.command()
            )?,
            None => writeln!(f, "  Currently Running: None")?,
        }
        writeln!(f, "\nActivity:")?;
        writeln!(f, "  Dispatches: {}", t.dispatches)?;
        writeln!(f, "  Preemptions: {}", t.preemptions)?;
        writeln!(f, "  I/O Events: {}", t.io_events)?;
        writeln!(f, "  Aging Boosts: {}", t.aging_boosts)?;
        if let (Some(turnaround), Some(wait)) = (t.avg_turnaround_us(), t.avg_wait_us()) {
            writeln!(f, "\nPerformance:")?;
            writeln!(f, "  Average Turnaround: {} ms", turnaround / 1000)?;
            writeln!(f, "  Average Wait Time: {} ms", wait / 1000)?;
        }
        writeln!(f, "===========================")
    }
}

// ---------------------------------------------------------------------------
// VMM
// ---------------------------------------------------------------------------

/// Occupied frames only, one per line.
pub struct FrameTable<'a>(&'a VmmSnapshot);

pub fn frame_table(vmm: &VmmSnapshot) -> FrameTable<'_> {
    FrameTable(vmm)
}

impl fmt::Display for FrameTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.0.frames {
            if let Some(owner) = frame.owner {
                writeln!(
                    f,
                    "Frame {}: PID={}, Page={}, Time={}",
                    frame.index,
                    owner.pid.as_u32(),
                    owner.page,
                    frame.load_time
                )?;
            }
        }
        Ok(())
    }
}

pub struct VmmStatus<'a>(&'a VmmSnapshot);

pub fn vmm_status(vmm: &VmmSnapshot) -> VmmStatus<'_> {
    VmmStatus(vmm)
}

impl fmt::Display for VmmStatus<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vmm = self.0;
        writeln!(f, "\n=== VMM Status ===")?;
        writeln!(f, "Frame Table:")?;
        for frame in &vmm.frames {
            match frame.owner {
                Some(owner) => writeln!(
                    f,
                    "  Frame {}: PID={}, Page={}, Time={}",
                    frame.index,
                    owner.pid.as_u32(),
                    owner.page,
                    frame.load_time
                )?,
                None => writeln!(f, "  Frame {}: FREE", frame.index)?,
            }
        }
        writeln!(
            f,
            "Physical Memory: {}/{} frames used ({}%)",
            vmm.used_frames,
            vmm.total_frames,
            vmm.utilization_percent()
        )?;
        writeln!(f, "Swap slots used: {}/{}", vmm.used_swap, vmm.total_swap)?;
        writeln!(f, "Active VMM Processes: {}", vmm.active_processes)?;
        writeln!(
            f,
            "Memory Utilization: {} KB / {} KB",
            vmm.resident_kib(),
            vmm.capacity_kib()
        )?;
        let c = &vmm.counters;
        writeln!(
            f,
            "Faults: {}, Evictions: {}, Swap writes: {}, Swap reads: {}",
            c.page_faults, c.evictions, c.swap_writes, c.swap_reads
        )?;
        writeln!(f, "Next frame time: {}", vmm.next_load_time)?;
        writeln!(f, "==================")
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub struct ConfigSummary<'a>(&'a LopeConfig);

pub fn config_summary(cfg: &LopeConfig) -> ConfigSummary<'_> {
    ConfigSummary(cfg)
}

impl fmt::Display for ConfigSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.0.scheduler;
        let v = &self.0.vmm;
        writeln!(f, "\n=== Configuration ===")?;
        writeln!(f, "Time slice:        {} ms", s.time_slice_us / 1000)?;
        writeln!(f, "Aging threshold:   {} cycles", s.aging_threshold)?;
        writeln!(f, "I/O duration:      {} ms", s.io_duration_us / 1000)?;
        writeln!(f, "I/O probability:   {}", s.io_probability)?;
        writeln!(f, "Poll interval:     {} ms", s.poll_interval_us / 1000)?;
        writeln!(
            f,
            "Initial priority:  {} ({})",
            s.initial_priority,
            s.initial_priority.label()
        )?;
        writeln!(f, "Page size:         {} bytes", v.page_size)?;
        writeln!(f, "Physical frames:   {}", v.physical_frames)?;
        writeln!(f, "Virtual pages:     {} per process", v.virtual_pages)?;
        writeln!(f, "Swap slots:        {}", v.swap_slots)?;
        writeln!(f, "Max processes:     {}", v.max_processes)
    }
}
