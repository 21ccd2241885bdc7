//! Deterministic cancelable timer queue
//!
//! All simulated delay goes through this queue:
//! - min-heap keyed by `(fire_at, handle)`, handles strictly increasing,
//!   so two timers due at the same instant fire in scheduling order
//! - timers carry data commands (`TimerAction`), never closures; the
//!   engine re-reads current state by id when a timer fires
//! - `cancel` tombstones one handle, `cancel_phase` tombstones every
//!   pending timer of a lesson phase in one pass

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use packetflow_core::{ClientId, FileKey, NodeId, PacketId, SimTime};

/// Handle to one pending timer, strictly increasing per queue
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(pub u64);

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timer({})", self.0)
    }
}

/// Which batch a timer belongs to for cancellation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseTag {
    /// Fragmentation, handshake, transfer, teardown
    Reliable,
    /// Frame fan-out
    Broadcast,
}

/// What to do when a timer fires
///
/// Every variant names its target by id. The interpreter verifies the
/// target still exists before acting; a stale hit is skipped and counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerAction {
    /// In-flight packet lands at its destination slot
    TransitArrive { packet: PacketId, to: NodeId },
    /// Refused packet returns to its origin slot
    BounceBack { packet: PacketId, to: NodeId },
    /// Lost packet disappears
    FadeOut { packet: PacketId },
    /// Refused whole-file is replaced by MTU fragments at the sender
    FragmentFile { file: FileKey },
    /// Engine response entity leaves the receiver onto the wire
    ResponseLaunch { packet: PacketId },
    /// Next buffered fragment becomes visibly delivered
    ReleaseStep { client: ClientId },
    /// Re-check the reorder buffer for a flushable run
    ReleaseRetry { client: ClientId },
    /// All fragments received, the file assembles
    AssembleFile { file: FileKey },
    /// Accepted frame fans out to the broadcast clients
    FrameFanout { number: u32 },
}

/// One pending timer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEntry {
    pub fire_at: SimTime,
    pub handle: TimerHandle,
    pub tag: PhaseTag,
    pub action: TimerAction,
}

// Reversed so BinaryHeap pops the smallest (fire_at, handle) first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The virtual-time timer queue
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    /// Handles still pending (scheduled, not yet fired or cancelled)
    live: HashSet<TimerHandle>,
    /// Tombstones for lazily removed entries
    cancelled: HashSet<TimerHandle>,
    next_handle: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue::default()
    }

    /// Schedule an action at an absolute virtual time
    pub fn schedule(&mut self, fire_at: SimTime, tag: PhaseTag, action: TimerAction) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.live.insert(handle);
        self.heap.push(TimerEntry {
            fire_at,
            handle,
            tag,
            action,
        });
        handle
    }

    /// Cancel one pending timer. Returns false if it already fired
    /// or was already cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if self.live.remove(&handle) {
            self.cancelled.insert(handle);
            true
        } else {
            false
        }
    }

    /// Cancel every pending timer with the given tag. Returns how many
    /// were cancelled.
    pub fn cancel_phase(&mut self, tag: PhaseTag) -> usize {
        let mut count = 0;
        for entry in self.heap.iter() {
            if entry.tag == tag && self.live.remove(&entry.handle) {
                self.cancelled.insert(entry.handle);
                count += 1;
            }
        }
        count
    }

    /// Pop the next timer due at or before `now`, skipping tombstones.
    pub fn pop_due(&mut self, now: SimTime) -> Option<TimerEntry> {
        loop {
            let due = self.heap.peek().map(|e| e.fire_at <= now)?;
            if !due {
                return None;
            }
            let entry = self.heap.pop()?;
            if self.cancelled.remove(&entry.handle) {
                continue;
            }
            self.live.remove(&entry.handle);
            return Some(entry);
        }
    }

    /// Earliest pending deadline, discarding leading tombstones.
    pub fn next_deadline(&mut self) -> Option<SimTime> {
        loop {
            let handle = self.heap.peek().map(|e| e.handle)?;
            if self.cancelled.remove(&handle) {
                self.heap.pop();
                continue;
            }
            return self.heap.peek().map(|e| e.fire_at);
        }
    }

    /// Number of pending timers
    pub fn pending(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
