#![allow(dead_code)]

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use refbase::{HistoryTracker, ObjectId, RefBase, RefObject};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Default)]
pub struct Calls {
    pub first: AtomicUsize,
    pub last: AtomicUsize,
    pub last_weak: AtomicUsize,
    pub drops: AtomicUsize,
}

impl Calls {
    pub fn first(&self) -> usize {
        self.first.load(Relaxed)
    }

    pub fn last(&self) -> usize {
        self.last.load(Relaxed)
    }

    pub fn last_weak(&self) -> usize {
        self.last_weak.load(Relaxed)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Relaxed)
    }
}

/// A managed object that counts its hook invocations and its destruction.
pub struct Probe {
    pub base: RefBase,
    pub calls: Arc<Calls>,
    pub value: u64,
}

impl Probe {
    pub fn new(tracker: &Arc<HistoryTracker>, calls: &Arc<Calls>) -> Probe {
        Probe {
            base: RefBase::with_tracker(tracker.clone()),
            calls: calls.clone(),
            value: 42,
        }
    }

    pub fn extended(tracker: &Arc<HistoryTracker>, calls: &Arc<Calls>) -> Probe {
        let probe = Probe::new(tracker, calls);
        probe.base.extend_object_lifetime();
        probe
    }
}

impl RefObject for Probe {
    fn ref_base(&self) -> &RefBase {
        &self.base
    }

    fn on_first_strong_ref(&self, _id: ObjectId) {
        self.calls.first.fetch_add(1, Relaxed);
    }

    fn on_last_strong_ref(&self, _id: ObjectId) {
        self.calls.last.fetch_add(1, Relaxed);
    }

    fn on_last_weak_ref(&self, _id: ObjectId) {
        self.calls.last_weak.fetch_add(1, Relaxed);
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.calls.drops.fetch_add(1, Relaxed);
    }
}

pub fn setup() -> (Arc<HistoryTracker>, Arc<Calls>) {
    init_logger();
    (Arc::new(HistoryTracker::new()), Arc::new(Calls::default()))
}
