//! Optional per-call instrumentation of a [`RefCounter`](crate::RefCounter).
//!
//! A counter built with a tracker reports every operation together with a
//! snapshot of its counts taken on entry, before the operation mutates
//! anything. Counters built without one pay a single `None` check.

use std::collections::VecDeque;

use log::debug;
use parking_lot::Mutex;

use crate::error::InvariantViolation;
use crate::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackOp {
    IncStrong,
    DecStrong,
    IncWeak,
    DecWeak,
    IncStructural,
    DecStructural,
    AttemptPromote,
    /// The destroy callback is about to run.
    Destroy,
    /// The counter itself is being freed.
    Free,
}

/// Relaxed view of a counter's state. Fields are read one by one, so under
/// contention the snapshot need not correspond to a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub strong: i32,
    pub weak: i32,
    pub structural: i32,
    pub attempt: i32,
    pub extended: bool,
    /// Whether the destroy callback is still installed.
    pub armed: bool,
}

impl CounterSnapshot {
    pub fn check(&self) -> Result<(), InvariantViolation> {
        if self.structural < 0 {
            return Err(InvariantViolation::NegativeStructural(self.structural));
        }
        if self.weak < 0 {
            return Err(InvariantViolation::NegativeWeak(self.weak));
        }
        if self.strong < 0 {
            return Err(InvariantViolation::NegativeStrong(self.strong));
        }
        if self.attempt < 0 {
            return Err(InvariantViolation::NegativeAttempt(self.attempt));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackEntry {
    /// Address of the counter that reported the entry.
    pub counter: usize,
    pub op: TrackOp,
    pub id: ObjectId,
    pub snapshot: CounterSnapshot,
}

pub trait RefTracker: Send + Sync {
    fn track(&self, entry: TrackEntry);
}

/// Keeps the most recent entries in memory for post-mortem inspection.
pub struct HistoryTracker {
    entries: Mutex<VecDeque<TrackEntry>>,
    capacity: usize,
}

impl HistoryTracker {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Oldest entries are discarded once `capacity` is reached.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn entries(&self) -> Vec<TrackEntry> {
        self.entries.lock().iter().copied().collect()
    }

    pub fn count(&self, op: TrackOp) -> usize {
        self.entries.lock().iter().filter(|e| e.op == op).count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Checks every recorded snapshot, returning the first violation found.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        self.entries
            .lock()
            .iter()
            .try_for_each(|entry| entry.snapshot.check())
    }

    pub fn dump(&self) {
        for entry in self.entries.lock().iter() {
            debug!(
                "counter {:#x} {:?} by {:#x}: strong={} weak={} structural={} attempt={} extended={} armed={}",
                entry.counter,
                entry.op,
                entry.id.addr(),
                entry.snapshot.strong,
                entry.snapshot.weak,
                entry.snapshot.structural,
                entry.snapshot.attempt,
                entry.snapshot.extended,
                entry.snapshot.armed,
            );
        }
    }
}

impl Default for HistoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RefTracker for HistoryTracker {
    fn track(&self, entry: TrackEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}
