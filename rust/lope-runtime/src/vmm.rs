//! Simulated demand-paged virtual memory.
//!
//! The [`VirtualMemoryManager`] keeps the bookkeeping of a small paged
//! machine: a bounded table of per-process records (each owning a page
//! table), a fixed pool of physical frames, and a fixed set of swap slots.
//! No byte contents are ever stored or moved; the model exists to show when
//! pages become resident, which frame FIFO replacement evicts, and when a
//! dirty page costs a swap write.
//!
//! # Invariants
//!
//! * A page is present iff its entry holds a frame ([`PageTableEntry::frame`]
//!   is `Some`), so presence and frame number cannot disagree.
//! * No two occupied frames name the same `(pid, page)`, and every occupied
//!   frame's owner has a page-table entry pointing back at that frame.
//! * Every occupied swap slot is referenced by exactly one page-table entry,
//!   and a resident page never holds a swap slot.
//! * Load times come from one strictly increasing counter, so FIFO victim
//!   selection has no ties.
//!
//! [`VirtualMemoryManager::check_invariants`] verifies all of the above.

use crate::config::VmmConfig;
use crate::process::ProcessId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, trace, warn};

/// Index into the frame table.
pub type FrameId = usize;
/// Index into the swap slot table.
pub type SwapSlot = usize;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during VMM operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("process table full ({capacity} slots in use)")]
    TableFull { capacity: usize },

    #[error("cannot build a page table of {pages} pages for {pid} (limit {limit})")]
    AllocationFailed {
        pid: ProcessId,
        pages: usize,
        limit: usize,
    },

    #[error("{0} already has memory allocated")]
    AlreadyAllocated(ProcessId),

    #[error("{0} has no memory record")]
    UnknownProcess(ProcessId),

    #[error("segmentation fault: {pid} accessed page {page} but owns {pages} pages")]
    SegFault {
        pid: ProcessId,
        page: usize,
        pages: usize,
    },

    #[error("permission violation: {mode} access to page {page} of {pid} (allowed: {allowed:?})")]
    PermissionViolation {
        pid: ProcessId,
        page: usize,
        mode: AccessMode,
        allowed: PageFlags,
    },

    #[error("swap exhausted: no free slot to write out dirty page {page} of {pid}")]
    SwapExhausted { pid: ProcessId, page: usize },

    #[error("no physical frames configured")]
    NoFrames,
}

// ---------------------------------------------------------------------------
// Page permissions and access modes
// ---------------------------------------------------------------------------

bitflags! {
    /// Permissions on a virtual page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PageFlags: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        PageFlags::READ | PageFlags::WRITE
    }
}

/// How a simulated process touches a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
    Execute,
}

impl AccessMode {
    /// The permission bit this access needs.
    pub fn required(self) -> PageFlags {
        match self {
            AccessMode::Read => PageFlags::READ,
            AccessMode::Write => PageFlags::WRITE,
            AccessMode::Execute => PageFlags::EXEC,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
            AccessMode::Execute => write!(f, "execute"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// One virtual page of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageTableEntry {
    /// Resident frame, if any.
    pub frame: Option<FrameId>,
    /// Modified since it was loaded.
    pub dirty: bool,
    /// Swap slot holding the evicted copy, if any.
    pub swap_slot: Option<SwapSlot>,
    pub flags: PageFlags,
}

impl PageTableEntry {
    pub fn is_present(&self) -> bool {
        self.frame.is_some()
    }
}

/// The `(pid, page)` currently held by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameOwner {
    pub pid: ProcessId,
    pub page: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Frame {
    owner: Option<FrameOwner>,
    load_time: u64,
}

impl Frame {
    fn clear(&mut self) {
        self.owner = None;
        self.load_time = 0;
    }
}

#[derive(Debug, Clone)]
struct ProcessRecord {
    pid: ProcessId,
    memory_size: u64,
    page_table: Vec<PageTableEntry>,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A frame taken away from its owner to satisfy a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Eviction {
    pub frame: FrameId,
    pub victim: FrameOwner,
    /// The victim's load time (the smallest among occupied frames).
    pub load_time: u64,
    /// Swap slot written, for a dirty victim. Clean victims are dropped.
    pub written_to: Option<SwapSlot>,
}

/// Result of [`VirtualMemoryManager::fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaultOutcome {
    pub frame: FrameId,
    /// The page was already resident; nothing changed.
    pub already_resident: bool,
    pub evicted: Option<Eviction>,
    /// The page came back from a swap slot (which is now free).
    pub loaded_from_swap: bool,
    pub load_time: u64,
}

/// Result of [`VirtualMemoryManager::access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessOutcome {
    pub frame: FrameId,
    /// The fault taken to make the page resident, if it was not.
    pub fault: Option<FaultOutcome>,
}

/// What [`VirtualMemoryManager::deallocate`] gave back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Release {
    pub pages: usize,
    pub frames_freed: usize,
    pub swap_slots_freed: usize,
}

/// Running totals since the manager was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VmmCounters {
    pub page_faults: u64,
    pub evictions: u64,
    pub swap_writes: u64,
    pub swap_reads: u64,
    pub allocations: u64,
    pub deallocations: u64,
}

/// One row of the frame table in a [`VmmSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameView {
    pub index: FrameId,
    pub owner: Option<FrameOwner>,
    pub load_time: u64,
}

/// A read-only report of the VMM, for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmmSnapshot {
    pub page_size: u64,
    pub frames: Vec<FrameView>,
    pub used_frames: usize,
    pub total_frames: usize,
    pub used_swap: usize,
    pub total_swap: usize,
    pub active_processes: usize,
    pub next_load_time: u64,
    pub counters: VmmCounters,
}

impl VmmSnapshot {
    pub fn utilization_percent(&self) -> usize {
        if self.total_frames == 0 {
            0
        } else {
            self.used_frames * 100 / self.total_frames
        }
    }

    pub fn resident_kib(&self) -> u64 {
        self.used_frames as u64 * self.page_size / 1024
    }

    pub fn capacity_kib(&self) -> u64 {
        self.total_frames as u64 * self.page_size / 1024
    }
}

// ---------------------------------------------------------------------------
// VirtualMemoryManager
// ---------------------------------------------------------------------------

pub struct VirtualMemoryManager {
    config: VmmConfig,
    frames: Vec<Frame>,
    /// Bounded slot table; `None` marks a free slot.
    slots: Vec<Option<ProcessRecord>>,
    swap: Vec<bool>,
    next_load_time: u64,
    counters: VmmCounters,
}

impl VirtualMemoryManager {
    pub fn new(config: VmmConfig) -> Self {
        debug!(
            frames = config.physical_frames,
            page_size = config.page_size,
            swap_slots = config.swap_slots,
            "initializing VMM"
        );
        Self {
            frames: vec![Frame::default(); config.physical_frames],
            slots: vec![None; config.max_processes],
            swap: vec![false; config.swap_slots],
            next_load_time: 1,
            counters: VmmCounters::default(),
            config,
        }
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    /// Pages needed to back `size_bytes`.
    pub fn pages_for(&self, size_bytes: u64) -> usize {
        let page = self.config.page_size.max(1);
        size_bytes.div_ceil(page) as usize
    }

    fn slot_of(&self, pid: ProcessId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.pid == pid))
    }

    fn record(&self, pid: ProcessId) -> Result<&ProcessRecord, VmmError> {
        self.slot_of(pid)
            .and_then(|i| self.slots[i].as_ref())
            .ok_or(VmmError::UnknownProcess(pid))
    }

    fn record_mut(&mut self, pid: ProcessId) -> Result<&mut ProcessRecord, VmmError> {
        let idx = self.slot_of(pid).ok_or(VmmError::UnknownProcess(pid))?;
        self.slots[idx]
            .as_mut()
            .ok_or(VmmError::UnknownProcess(pid))
    }

    pub fn is_allocated(&self, pid: ProcessId) -> bool {
        self.slot_of(pid).is_some()
    }

    pub fn active_processes(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Reserve a page table for `pid` sized for `size_bytes`. Every page
    /// starts non-resident, clean, with no swap slot.
    pub fn allocate(&mut self, pid: ProcessId, size_bytes: u64) -> Result<(), VmmError> {
        if self.is_allocated(pid) {
            warn!(%pid, "VMM: duplicate allocation rejected");
            return Err(VmmError::AlreadyAllocated(pid));
        }
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(VmmError::TableFull {
                capacity: self.slots.len(),
            })?;

        let pages = self.pages_for(size_bytes);
        if pages > self.config.virtual_pages {
            return Err(VmmError::AllocationFailed {
                pid,
                pages,
                limit: self.config.virtual_pages,
            });
        }

        self.slots[idx] = Some(ProcessRecord {
            pid,
            memory_size: size_bytes,
            page_table: vec![PageTableEntry::default(); pages],
        });
        self.counters.allocations += 1;
        debug!(%pid, kib = size_bytes / 1024, pages, "VMM: allocated");
        Ok(())
    }

    /// Release everything `pid` holds: frames, swap slots, the page table and
    /// its slot. Unknown pids are a no-op and return `None`.
    pub fn deallocate(&mut self, pid: ProcessId) -> Option<Release> {
        let idx = self.slot_of(pid)?;
        let record = self.slots[idx].take()?;

        let mut frames_freed = 0;
        for frame in self.frames.iter_mut() {
            if frame.owner.is_some_and(|o| o.pid == pid) {
                frame.clear();
                frames_freed += 1;
            }
        }

        let mut swap_slots_freed = 0;
        for slot in record.page_table.iter().filter_map(|e| e.swap_slot) {
            self.swap[slot] = false;
            swap_slots_freed += 1;
        }

        self.counters.deallocations += 1;
        debug!(%pid, frames_freed, swap_slots_freed, "VMM: deallocated");
        Some(Release {
            pages: record.page_table.len(),
            frames_freed,
            swap_slots_freed,
        })
    }

    /// Change the permissions of one page.
    pub fn protect(&mut self, pid: ProcessId, page: usize, flags: PageFlags) -> Result<(), VmmError> {
        let record = self.record_mut(pid)?;
        let pages = record.page_table.len();
        let entry = record
            .page_table
            .get_mut(page)
            .ok_or(VmmError::SegFault { pid, page, pages })?;
        entry.flags = flags;
        Ok(())
    }

    /// Make `page` of `pid` resident.
    ///
    /// Uses the lowest-numbered free frame, or evicts the frame loaded
    /// longest ago. A dirty victim is written to the lowest free swap slot;
    /// a clean one is dropped. Fails without changing anything when the
    /// victim is dirty and swap is full.
    pub fn fault(&mut self, pid: ProcessId, page: usize) -> Result<FaultOutcome, VmmError> {
        let slot_idx = self.slot_of(pid).ok_or(VmmError::UnknownProcess(pid))?;
        let entry = {
            let record = self.slots[slot_idx]
                .as_ref()
                .ok_or(VmmError::UnknownProcess(pid))?;
            let pages = record.page_table.len();
            *record
                .page_table
                .get(page)
                .ok_or_else(|| {
                    debug!(%pid, page, pages, "VMM: segmentation fault");
                    VmmError::SegFault { pid, page, pages }
                })?
        };

        if let Some(frame) = entry.frame {
            return Ok(FaultOutcome {
                frame,
                already_resident: true,
                evicted: None,
                loaded_from_swap: false,
                load_time: self.frames[frame].load_time,
            });
        }

        trace!(%pid, page, "VMM: page fault");
        let (frame, evicted) = match self.free_frame() {
            Some(f) => (f, None),
            None => {
                debug!("VMM: no free frames, evicting");
                let eviction = self.evict_fifo()?;
                (eviction.frame, Some(eviction))
            }
        };

        // The eviction may have touched another process's record, so look
        // the faulting one up again.
        let load_time = self.next_load_time;
        self.next_load_time += 1;
        let mut loaded_from_swap = false;
        let mut freed_swap = None;
        {
            let record = self.slots[slot_idx]
                .as_mut()
                .ok_or(VmmError::UnknownProcess(pid))?;
            let entry = &mut record.page_table[page];
            if let Some(slot) = entry.swap_slot.take() {
                freed_swap = Some(slot);
                loaded_from_swap = true;
            }
            entry.frame = Some(frame);
            entry.dirty = false;
        }
        if let Some(slot) = freed_swap {
            self.swap[slot] = false;
            self.counters.swap_reads += 1;
            debug!(%pid, page, slot, frame, "VMM: loaded page from swap");
        } else {
            trace!(%pid, page, frame, "VMM: first touch, allocating frame");
        }

        self.frames[frame] = Frame {
            owner: Some(FrameOwner { pid, page }),
            load_time,
        };
        self.counters.page_faults += 1;

        Ok(FaultOutcome {
            frame,
            already_resident: false,
            evicted,
            loaded_from_swap,
            load_time,
        })
    }

    /// Simulate `pid` touching `page` with `mode`: bounds and permission
    /// checks, a fault if the page is not resident, and the dirty bit on
    /// writes.
    pub fn access(
        &mut self,
        pid: ProcessId,
        page: usize,
        mode: AccessMode,
    ) -> Result<AccessOutcome, VmmError> {
        let entry = {
            let record = self.record(pid)?;
            let pages = record.page_table.len();
            *record
                .page_table
                .get(page)
                .ok_or(VmmError::SegFault { pid, page, pages })?
        };
        if !entry.flags.contains(mode.required()) {
            debug!(%pid, page, %mode, "VMM: permission violation");
            return Err(VmmError::PermissionViolation {
                pid,
                page,
                mode,
                allowed: entry.flags,
            });
        }

        let fault = if entry.is_present() {
            None
        } else {
            Some(self.fault(pid, page)?)
        };

        let record = self.record_mut(pid)?;
        let entry = &mut record.page_table[page];
        if mode == AccessMode::Write {
            entry.dirty = true;
        }
        let frame = entry.frame.ok_or(VmmError::UnknownProcess(pid))?;
        Ok(AccessOutcome { frame, fault })
    }

    fn free_frame(&self) -> Option<FrameId> {
        self.frames.iter().position(|f| f.owner.is_none())
    }

    /// Evict the occupied frame with the smallest load time.
    fn evict_fifo(&mut self) -> Result<Eviction, VmmError> {
        let (frame, victim, load_time) = self
            .frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.owner.map(|o| (i, o, f.load_time)))
            .min_by_key(|&(_, _, t)| t)
            .ok_or(VmmError::NoFrames)?;

        let victim_slot = self
            .slot_of(victim.pid)
            .ok_or(VmmError::UnknownProcess(victim.pid))?;
        let dirty = self.slots[victim_slot]
            .as_ref()
            .is_some_and(|r| r.page_table[victim.page].dirty);

        let written_to = if dirty {
            let slot = self
                .swap
                .iter()
                .position(|used| !used)
                .ok_or(VmmError::SwapExhausted {
                    pid: victim.pid,
                    page: victim.page,
                })?;
            self.swap[slot] = true;
            self.counters.swap_writes += 1;
            debug!(pid = %victim.pid, page = victim.page, slot, "VMM: dirty page written to swap");
            Some(slot)
        } else {
            trace!(pid = %victim.pid, page = victim.page, "VMM: clean page dropped");
            None
        };

        if let Some(record) = self.slots[victim_slot].as_mut() {
            let entry = &mut record.page_table[victim.page];
            entry.frame = None;
            entry.dirty = false;
            entry.swap_slot = written_to;
        }
        self.frames[frame].clear();
        self.counters.evictions += 1;
        debug!(frame, pid = %victim.pid, page = victim.page, load_time, "VMM: evicted frame");

        Ok(Eviction {
            frame,
            victim,
            load_time,
            written_to,
        })
    }

    /// Copy of `pid`'s page table.
    pub fn page_table(&self, pid: ProcessId) -> Option<Vec<PageTableEntry>> {
        self.record(pid).ok().map(|r| r.page_table.clone())
    }

    /// Bytes requested by `pid` at allocation time.
    pub fn memory_size(&self, pid: ProcessId) -> Option<u64> {
        self.record(pid).ok().map(|r| r.memory_size)
    }

    pub fn counters(&self) -> VmmCounters {
        self.counters
    }

    /// Read-only report; never mutates.
    pub fn status(&self) -> VmmSnapshot {
        let frames: Vec<FrameView> = self
            .frames
            .iter()
            .enumerate()
            .map(|(index, f)| FrameView {
                index,
                owner: f.owner,
                load_time: f.load_time,
            })
            .collect();
        VmmSnapshot {
            page_size: self.config.page_size,
            used_frames: frames.iter().filter(|f| f.owner.is_some()).count(),
            total_frames: frames.len(),
            frames,
            used_swap: self.swap.iter().filter(|u| **u).count(),
            total_swap: self.swap.len(),
            active_processes: self.active_processes(),
            next_load_time: self.next_load_time,
            counters: self.counters,
        }
    }

    /// Verify every structural invariant, describing the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut owners = HashSet::new();
        for (i, frame) in self.frames.iter().enumerate() {
            let Some(owner) = frame.owner else { continue };
            if !owners.insert(owner) {
                return Err(format!("frame {i}: duplicate owner {owner:?}"));
            }
            let record = self
                .record(owner.pid)
                .map_err(|_| format!("frame {i}: owner {} has no record", owner.pid))?;
            match record.page_table.get(owner.page) {
                Some(e) if e.frame == Some(i) => {}
                _ => return Err(format!("frame {i}: page table does not point back")),
            }
        }

        let mut referenced = vec![0usize; self.swap.len()];
        for record in self.slots.iter().flatten() {
            for (page, e) in record.page_table.iter().enumerate() {
                if let Some(f) = e.frame {
                    let ok = self.frames.get(f).and_then(|fr| fr.owner)
                        == Some(FrameOwner {
                            pid: record.pid,
                            page,
                        });
                    if !ok {
                        return Err(format!("{} page {page}: frame {f} not owned", record.pid));
                    }
                    if e.swap_slot.is_some() {
                        return Err(format!("{} page {page}: resident page holds swap", record.pid));
                    }
                }
                if let Some(s) = e.swap_slot {
                    match referenced.get_mut(s) {
                        Some(n) => *n += 1,
                        None => return Err(format!("swap slot {s} out of range")),
                    }
                }
            }
        }
        for (s, (&used, &refs)) in self.swap.iter().zip(referenced.iter()).enumerate() {
            if used != (refs == 1) || refs > 1 {
                return Err(format!("swap slot {s}: used={used}, references={refs}"));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for VirtualMemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("VirtualMemoryManager")
            .field("used_frames", &status.used_frames)
            .field("total_frames", &status.total_frames)
            .field("used_swap", &status.used_swap)
            .field("active_processes", &status.active_processes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
