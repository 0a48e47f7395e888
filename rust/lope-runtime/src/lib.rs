//! Lope Runtime
//!
//! A cooperative process scheduler with priority aging and a simulated,
//! demand-paged virtual memory manager. The scheduler keeps a logical shadow
//! of real OS processes: a command shell spawns the process, registers it
//! through the lifecycle bridge, and retires it once the OS reports the exit.
//!
//! The pieces, leaves first:
//!
//! * [`process`]: the process control block and its scheduling state.
//! * [`queue`]: mutex-guarded FIFO of PCBs with priority selection.
//! * [`vmm`]: page tables, frame pool, swap bookkeeping, FIFO eviction.
//! * [`scheduler`]: the background loop (round robin, priority, aging,
//!   simulated I/O, preemption).
//! * [`lifecycle`]: glue between OS process lifecycles and the scheduler.
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod process;
pub mod queue;
pub mod scheduler;
pub mod vmm;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, LopeConfig, MemoryConfig, SchedulerConfig, VmmConfig};
pub use events::SchedulerEvent;
pub use lifecycle::{LaunchOutcome, MemoryProfile, ProcessBridge, ProcessReport, ReapedJob};
pub use process::{InvalidPriority, Pcb, Priority, ProcessId, ProcessState};
pub use queue::ProcessQueue;
pub use scheduler::{SchedError, Scheduler, SchedulerSnapshot, SchedulerTotals, TickReport};
pub use vmm::{
    AccessMode, AccessOutcome, FaultOutcome, PageFlags, PageTableEntry, Release,
    VirtualMemoryManager, VmmError, VmmSnapshot,
};
