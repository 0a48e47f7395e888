//! Broadcast of scheduling transitions.
//!
//! Observers call [`Scheduler::subscribe`](crate::scheduler::Scheduler::subscribe)
//! and receive a [`SchedulerEvent`] for every transition the scheduler or the
//! lifecycle bridge performs. Delivery uses unbounded crossbeam channels; a
//! subscriber whose receiver has been dropped is pruned on the next emit.

use crate::process::{Priority, ProcessId};
use crossbeam_channel::{self as cb};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Admitted {
        pid: ProcessId,
        command: String,
        priority: Priority,
        memory_bytes: u64,
    },
    Dispatched {
        pid: ProcessId,
        priority: Priority,
    },
    Preempted {
        pid: ProcessId,
        priority: Priority,
    },
    IoStarted {
        pid: ProcessId,
    },
    IoCompleted {
        pid: ProcessId,
        waited_us: u64,
    },
    Aged {
        pid: ProcessId,
        priority: Priority,
    },
    PriorityChanged {
        pid: ProcessId,
        priority: Priority,
    },
    Retired {
        pid: ProcessId,
        turnaround_us: u64,
    },
}

impl SchedulerEvent {
    pub fn pid(&self) -> ProcessId {
        match self {
            SchedulerEvent::Admitted { pid, .. }
            | SchedulerEvent::Dispatched { pid, .. }
            | SchedulerEvent::Preempted { pid, .. }
            | SchedulerEvent::IoStarted { pid }
            | SchedulerEvent::IoCompleted { pid, .. }
            | SchedulerEvent::Aged { pid, .. }
            | SchedulerEvent::PriorityChanged { pid, .. }
            | SchedulerEvent::Retired { pid, .. } => *pid,
        }
    }
}

impl fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerEvent::Admitted {
                pid,
                command,
                priority,
                memory_bytes,
            } => write!(
                f,
                "{pid} '{command}' admitted (priority {priority}, {} KB)",
                memory_bytes / 1024
            ),
            SchedulerEvent::Dispatched { pid, priority } => {
                write!(f, "{pid} running (priority {priority})")
            }
            SchedulerEvent::Preempted { pid, priority } => {
                write!(f, "{pid} preempted, priority now {priority}")
            }
            SchedulerEvent::IoStarted { pid } => write!(f, "{pid} blocked on I/O"),
            SchedulerEvent::IoCompleted { pid, waited_us } => {
                write!(f, "{pid} I/O complete after {} ms", waited_us / 1000)
            }
            SchedulerEvent::Aged { pid, priority } => {
                write!(f, "{pid} aged to priority {priority}")
            }
            SchedulerEvent::PriorityChanged { pid, priority } => {
                write!(f, "{pid} priority set to {priority}")
            }
            SchedulerEvent::Retired { pid, turnaround_us } => {
                write!(f, "{pid} finished (turnaround {} ms)", turnaround_us / 1000)
            }
        }
    }
}

/// Fan-out of events to any number of subscribers.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<cb::Sender<SchedulerEvent>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> cb::Receiver<SchedulerEvent> {
        let (tx, rx) = cb::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: SchedulerEvent) {
        let mut subs = self.subscribers.lock();
        if subs.is_empty() {
            return;
        }
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_each_event() {
        let bus = EventBus::default();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.emit(SchedulerEvent::IoStarted {
            pid: ProcessId::new(3),
        });
        assert_eq!(a.try_recv().unwrap().pid(), ProcessId::new(3));
        assert_eq!(b.try_recv().unwrap().pid(), ProcessId::new(3));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::default();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);
        bus.emit(SchedulerEvent::Dispatched {
            pid: ProcessId::new(1),
            priority: Priority::NORMAL,
        });
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }

    #[test]
    fn events_serialize_with_tag() {
        let ev = SchedulerEvent::Aged {
            pid: ProcessId::new(9),
            priority: Priority::HIGH,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "aged");
        assert_eq!(json["pid"], 9);
        assert_eq!(json["priority"], 0);
        assert_eq!(ev.to_string(), "pid:9 aged to priority 0");
    }
}
