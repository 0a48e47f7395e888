//! Thread-safe FIFO of process control blocks.
//!
//! A [`ProcessQueue`] stores owned [`Pcb`]s in arrival order behind a single
//! mutex. Insertion is always at the tail; removal is either by priority
//! ([`dequeue_by_priority`](ProcessQueue::dequeue_by_priority)) or by id.
//!
//! Every method holds this queue's lock for its whole duration and never
//! touches another lock while holding it. Moving a PCB between two queues is
//! therefore always "unlink under lock A, release, enqueue under lock B".

use crate::process::{Pcb, ProcessId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

pub struct ProcessQueue {
    /// Short name used in logs ("ready", "waiting").
    name: &'static str,
    entries: Mutex<VecDeque<Pcb>>,
}

impl ProcessQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append `pcb` at the tail.
    pub fn enqueue(&self, pcb: Pcb) {
        tracing::trace!(queue = self.name, pid = %pcb.pid(), priority = %pcb.priority(), "enqueue");
        self.entries.lock().push_back(pcb);
    }

    /// Remove the entry with the numerically smallest priority. Among equal
    /// priorities the earliest enqueued wins.
    ///
    /// This is a linear scan; queues are small and the selection contract is
    /// what matters.
    pub fn dequeue_by_priority(&self) -> Option<Pcb> {
        let mut entries = self.entries.lock();
        let best = entries
            .iter()
            .enumerate()
            // min_by_key keeps the first of equal keys.
            .min_by_key(|(_, pcb)| pcb.priority())
            .map(|(idx, _)| idx)?;
        entries.remove(best)
    }

    /// Unlink the PCB with the given id, if present.
    pub fn remove_by_id(&self, pid: ProcessId) -> Option<Pcb> {
        let mut entries = self.entries.lock();
        let idx = entries.iter().position(|p| p.pid() == pid)?;
        entries.remove(idx)
    }

    /// Unlink every PCB matching `pred`, preserving the relative order of
    /// both the removed and the remaining entries.
    pub fn take_where<F>(&self, mut pred: F) -> Vec<Pcb>
    where
        F: FnMut(&Pcb) -> bool,
    {
        let mut entries = self.entries.lock();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(entries.len());
        for pcb in entries.drain(..) {
            if pred(&pcb) {
                taken.push(pcb);
            } else {
                kept.push_back(pcb);
            }
        }
        *entries = kept;
        taken
    }

    /// Visit every entry mutably, in queue order.
    pub fn for_each_mut<F>(&self, mut f: F)
    where
        F: FnMut(&mut Pcb),
    {
        for pcb in self.entries.lock().iter_mut() {
            f(pcb);
        }
    }

    /// Apply `f` to the PCB with id `pid`. Returns `None` when absent.
    pub fn update<F, R>(&self, pid: ProcessId, f: F) -> Option<R>
    where
        F: FnOnce(&mut Pcb) -> R,
    {
        self.entries
            .lock()
            .iter_mut()
            .find(|p| p.pid() == pid)
            .map(f)
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.entries.lock().iter().any(|p| p.pid() == pid)
    }

    /// Copies of the current entries, in queue order.
    pub fn snapshot(&self) -> Vec<Pcb> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for ProcessQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Priority;
    use std::sync::Arc;
    use std::thread;

    fn pcb(pid: u32, level: u8) -> Pcb {
        Pcb::new(
            ProcessId::new(pid),
            "test",
            Priority::new(level).unwrap(),
            4096,
            0,
        )
    }

    #[test]
    fn empty_queue_dequeues_nothing() {
        let q = ProcessQueue::new("ready");
        assert!(q.is_empty());
        assert!(q.dequeue_by_priority().is_none());
        assert!(q.remove_by_id(ProcessId::new(1)).is_none());
    }

    #[test]
    fn priority_order_with_fifo_tie_break() {
        let q = ProcessQueue::new("ready");
        q.enqueue(pcb(10, 2));
        q.enqueue(pcb(11, 1));
        q.enqueue(pcb(12, 1));
        q.enqueue(pcb(13, 0));

        let order: Vec<u32> = std::iter::from_fn(|| q.dequeue_by_priority())
            .map(|p| p.pid().as_u32())
            .collect();
        assert_eq!(order, vec![13, 11, 12, 10]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn equal_priorities_dequeue_in_arrival_order() {
        let q = ProcessQueue::new("ready");
        for pid in 1..=5 {
            q.enqueue(pcb(pid, 1));
        }
        for expected in 1..=5 {
            assert_eq!(q.dequeue_by_priority().unwrap().pid().as_u32(), expected);
        }
    }

    #[test]
    fn remove_by_id_unlinks_from_the_middle() {
        let q = ProcessQueue::new("waiting");
        q.enqueue(pcb(1, 1));
        q.enqueue(pcb(2, 1));
        q.enqueue(pcb(3, 1));

        let removed = q.remove_by_id(ProcessId::new(2)).unwrap();
        assert_eq!(removed.pid().as_u32(), 2);
        assert_eq!(q.len(), 2);
        assert!(!q.contains(ProcessId::new(2)));
        assert!(q.remove_by_id(ProcessId::new(2)).is_none());

        let rest: Vec<u32> = q.snapshot().iter().map(|p| p.pid().as_u32()).collect();
        assert_eq!(rest, vec![1, 3]);
    }

    #[test]
    fn take_where_preserves_order_of_both_sides() {
        let q = ProcessQueue::new("waiting");
        for pid in 1..=6 {
            q.enqueue(pcb(pid, 1));
        }
        let taken: Vec<u32> = q
            .take_where(|p| p.pid().as_u32() % 2 == 0)
            .iter()
            .map(|p| p.pid().as_u32())
            .collect();
        assert_eq!(taken, vec![2, 4, 6]);
        let kept: Vec<u32> = q.snapshot().iter().map(|p| p.pid().as_u32()).collect();
        assert_eq!(kept, vec![1, 3, 5]);
    }

    #[test]
    fn update_reaches_only_the_matching_entry() {
        let q = ProcessQueue::new("ready");
        q.enqueue(pcb(1, 2));
        q.enqueue(pcb(2, 2));
        let hit = q.update(ProcessId::new(2), |p| p.set_priority(Priority::HIGH));
        assert!(hit.is_some());
        assert!(q.update(ProcessId::new(99), |_| ()).is_none());
        assert_eq!(q.dequeue_by_priority().unwrap().pid().as_u32(), 2);
    }

    #[test]
    fn concurrent_enqueue_keeps_count_consistent() {
        let q = Arc::new(ProcessQueue::new("ready"));
        let mut handles = vec![];
        for t in 0..8u32 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..100u32 {
                    q.enqueue(pcb(t * 1_000 + i, (i % 3) as u8));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 800);

        let mut last = 0u8;
        let mut drained = 0;
        while let Some(p) = q.dequeue_by_priority() {
            assert!(p.priority().level() >= last);
            last = p.priority().level();
            drained += 1;
        }
        assert_eq!(drained, 800);
    }
}
