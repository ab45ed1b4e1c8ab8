use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicPtr, AtomicU32};
use std::sync::Arc;

use log::{trace, warn};

use crate::error::{abort_on, InvariantViolation};
use crate::tracker::{CounterSnapshot, RefTracker, TrackEntry, TrackOp};
use crate::ObjectId;

/// Strong count of an object that has never had a strong owner.
///
/// Observable through `get_strong_ref_count` and `RefBase::get_sptr_ref_count`.
pub const INITIAL_PRIMARY_VALUE: i32 = 1 << 28;

/// Any count above this is treated as an overflow and aborts the process.
pub const MAX_REF_COUNT: i32 = i32::MAX / 2;

pub const FLAG_EXTEND_LIFE_TIME: u32 = 0x0000_0002;

type DestroyHook = Box<dyn FnOnce() + Send>;

/// Outcome of promoting a weak reference to a strong one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// Holds the strong count observed right before the increment.
    Promoted(i32),
    Rejected,
}

impl Promotion {
    pub fn is_promoted(self) -> bool {
        matches!(self, Promotion::Promoted(_))
    }

    /// True if this promotion took the object out of the never-owned state.
    pub fn is_first(self) -> bool {
        self == Promotion::Promoted(INITIAL_PRIMARY_VALUE)
    }
}

/// Shared bookkeeping for one managed object.
///
/// Lives on the heap and is freed when its structural count drops to zero.
/// Operations that may free it take `NonNull<RefCounter>` instead of `&self`.
pub struct RefCounter {
    /// Number of strong owners, or `INITIAL_PRIMARY_VALUE` before the first.
    strong: AtomicI32,
    /// Number of weak observers. Every strong owner is also counted here.
    weak: AtomicI32,
    /// The owning `RefBase` plus every live `WeakRefCounter`.
    refs: AtomicI32,
    flags: AtomicU32,
    /// Promotions waiting to be reconciled by the next `inc_strong_ref`.
    attempt: AtomicI32,
    /// Null once the callback has run or been removed.
    callback: AtomicPtr<DestroyHook>,
    destroyed: AtomicBool,
    /// Set once the owner's structural reference has been given back.
    owner_released: AtomicBool,
    /// Set when the owning `RefBase` is dropped.
    owner_dropped: AtomicBool,
    tracker: Option<Arc<dyn RefTracker>>,
}

impl RefCounter {
    fn new(tracker: Option<Arc<dyn RefTracker>>) -> RefCounter {
        RefCounter {
            strong: AtomicI32::new(INITIAL_PRIMARY_VALUE),
            weak: AtomicI32::new(0),
            refs: AtomicI32::new(0),
            flags: AtomicU32::new(0),
            attempt: AtomicI32::new(0),
            callback: AtomicPtr::new(ptr::null_mut()),
            destroyed: AtomicBool::new(false),
            owner_released: AtomicBool::new(false),
            owner_dropped: AtomicBool::new(false),
            tracker,
        }
    }

    /// Moves a fresh counter to the heap. Its structural count starts at zero.
    pub(crate) fn allocate(tracker: Option<Arc<dyn RefTracker>>) -> NonNull<RefCounter> {
        NonNull::from(Box::leak(Box::new(RefCounter::new(tracker))))
    }

    pub(crate) fn tracker(&self) -> Option<Arc<dyn RefTracker>> {
        self.tracker.clone()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            strong: self.strong.load(Relaxed),
            weak: self.weak.load(Relaxed),
            structural: self.refs.load(Relaxed),
            attempt: self.attempt.load(Relaxed),
            extended: self.is_life_time_extended(),
            armed: self.is_ref_ptr_valid(),
        }
    }

    fn track(&self, op: TrackOp, id: ObjectId) {
        if let Some(tracker) = &self.tracker {
            tracker.track(TrackEntry {
                counter: self as *const RefCounter as usize,
                op,
                id,
                snapshot: self.snapshot(),
            });
        }
    }

    pub fn get_ref_count(&self) -> i32 {
        self.refs.load(Relaxed)
    }

    pub fn inc_ref_count(&self) {
        self.track(TrackOp::IncStructural, ObjectId::NONE);
        let prev = self.refs.fetch_add(1, Relaxed);
        if prev > MAX_REF_COUNT {
            abort_on(InvariantViolation::Overflow(prev));
        }
    }

    /// Gives back one structural reference, freeing the counter on the last.
    ///
    /// # Safety
    ///
    /// `this` must point to a live counter on which the caller owns one
    /// structural reference. That reference is consumed.
    pub unsafe fn dec_ref_count(this: NonNull<RefCounter>) {
        let counter = unsafe { this.as_ref() };
        counter.track(TrackOp::DecStructural, ObjectId::NONE);
        let prev = counter.refs.fetch_sub(1, Release);
        if prev == 1 {
            fence(Acquire);
            // Safety: that was the last structural reference,
            // so nothing else can reach the counter anymore.
            unsafe { drop(Box::from_raw(this.as_ptr())) };
        } else if prev <= 0 {
            abort_on(InvariantViolation::NegativeStructural(prev - 1));
        }
    }

    /// Gives back the structural reference held on behalf of the owning
    /// `RefBase`. Only the first call has any effect.
    ///
    /// # Safety
    ///
    /// `this` must point to a live counter.
    pub(crate) unsafe fn release_owner_share(this: NonNull<RefCounter>) {
        if !unsafe { this.as_ref() }.owner_released.swap(true, AcqRel) {
            unsafe { RefCounter::dec_ref_count(this) };
        }
    }

    /// Records that the owning `RefBase` is gone and reports whether the weak
    /// count had already drained. If it had not, the last weak reference
    /// gives the owner's share back.
    pub(crate) fn mark_owner_dropped(&self) -> bool {
        self.owner_dropped.store(true, Relaxed);
        fence(SeqCst);
        self.weak.load(Relaxed) == 0
    }

    /// Gives back the owner's share, but only once the owner is gone.
    ///
    /// # Safety
    ///
    /// `this` must point to a live counter.
    unsafe fn release_if_owner_dropped(this: NonNull<RefCounter>) {
        // Pairs with the fence in mark_owner_dropped.
        fence(SeqCst);
        if unsafe { this.as_ref() }.owner_dropped.load(Relaxed) {
            unsafe { RefCounter::release_owner_share(this) };
        }
    }

    /// Installs the callback that destroys the managed object, replacing
    /// (without running) any previous one.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.install_callback(Box::new(callback));
    }

    pub(crate) fn install_callback(&self, callback: DestroyHook) {
        let old = self.callback.swap(Box::into_raw(Box::new(callback)), AcqRel);
        if !old.is_null() {
            // Safety: the slot only ever holds pointers from Box::into_raw,
            // and the swap handed this one to us exclusively.
            drop(unsafe { Box::from_raw(old) });
        }
    }

    pub(crate) fn take_callback(&self) -> Option<DestroyHook> {
        let callback = self.callback.swap(ptr::null_mut(), AcqRel);
        if callback.is_null() {
            return None;
        }
        // Safety: see install_callback.
        Some(*unsafe { Box::from_raw(callback) })
    }

    pub fn remove_callback(&self) {
        drop(self.take_callback());
    }

    /// Whether the managed object can still be reached through this counter.
    pub fn is_ref_ptr_valid(&self) -> bool {
        !self.callback.load(Acquire).is_null()
    }

    pub fn has_destroyed(&self) -> bool {
        self.destroyed.load(Acquire)
    }

    /// Runs the destroy callback if it is still installed and reports whether
    /// it did. The caller must keep the counter alive across the call, since
    /// destroying the object may give back the owner's structural reference.
    pub(crate) fn invoke_destroy(&self, id: ObjectId) -> bool {
        match self.take_callback() {
            Some(callback) => {
                self.track(TrackOp::Destroy, id);
                self.destroyed.store(true, Release);
                trace!("destroying object of counter {:p}", self);
                callback();
                true
            }
            None => false,
        }
    }

    /// Returns the strong count seen before the increment.
    pub fn inc_strong_ref(&self, id: ObjectId) -> i32 {
        self.track(TrackOp::IncStrong, id);
        let mut cur = self.strong.load(Relaxed);
        if cur >= 0 {
            cur = self.strong.fetch_add(1, Relaxed);
            if cur == INITIAL_PRIMARY_VALUE {
                self.strong.fetch_sub(INITIAL_PRIMARY_VALUE, Release);
            } else if cur > MAX_REF_COUNT {
                abort_on(InvariantViolation::Overflow(cur));
            }
        }
        cur
    }

    /// Returns the strong count seen before the decrement; 1 means the last
    /// owner just left.
    pub fn dec_strong_ref(&self, id: ObjectId) -> i32 {
        self.track(TrackOp::DecStrong, id);
        let cur = self.strong.load(Relaxed);
        if cur == INITIAL_PRIMARY_VALUE {
            warn!("dec_strong_ref on counter {:p} that never had a strong reference", self);
            return cur;
        }
        if cur <= 0 {
            warn!("dec_strong_ref on counter {:p} with strong count {cur}", self);
            return cur;
        }
        let prev = self.strong.fetch_sub(1, Release);
        if prev == 1 {
            fence(Acquire);
        }
        prev
    }

    pub fn get_strong_ref_count(&self) -> i32 {
        self.strong.load(Relaxed)
    }

    pub fn inc_weak_ref(&self, id: ObjectId) -> i32 {
        self.track(TrackOp::IncWeak, id);
        let prev = self.weak.fetch_add(1, Relaxed);
        if prev > MAX_REF_COUNT {
            abort_on(InvariantViolation::Overflow(prev));
        }
        prev
    }

    /// Returns the weak count seen before the decrement.
    ///
    /// When the weak count reaches zero the object is destroyed if it has
    /// an extended lifetime and no strong owners, or if it never had a strong
    /// owner. Otherwise the owner's structural reference is given back,
    /// provided the owning `RefBase` has already been dropped. `on_last` runs
    /// right before such a destruction, while the object is still alive.
    ///
    /// # Safety
    ///
    /// `this` must point to a live counter, and the caller must hold a
    /// structural reference on it or own the weak reference being dropped
    /// through a live `RefBase`.
    pub unsafe fn dec_weak_ref<F>(this: NonNull<RefCounter>, id: ObjectId, on_last: F) -> i32
    where
        F: FnOnce(),
    {
        let counter = unsafe { this.as_ref() };
        counter.track(TrackOp::DecWeak, id);
        let prev = match counter
            .weak
            .fetch_update(Release, Relaxed, |n| (n > 0).then(|| n - 1))
        {
            Ok(prev) => prev,
            Err(cur) => {
                warn!("dec_weak_ref on counter {:p} with weak count {cur}", counter);
                return cur;
            }
        };
        if prev != 1 {
            return prev;
        }
        fence(Acquire);
        let strong = counter.get_strong_ref_count();
        if (counter.is_life_time_extended() && strong == 0) || strong == INITIAL_PRIMARY_VALUE {
            unsafe { RefCounter::destroy_from_weak(this, id, on_last) };
        } else {
            unsafe { RefCounter::release_if_owner_dropped(this) };
        }
        prev
    }

    unsafe fn destroy_from_weak<F>(this: NonNull<RefCounter>, id: ObjectId, on_last: F)
    where
        F: FnOnce(),
    {
        let counter = unsafe { this.as_ref() };
        // Pin the counter; destroying the object releases the owner's reference.
        counter.inc_ref_count();
        if counter.is_ref_ptr_valid() {
            on_last();
        }
        if !counter.invoke_destroy(id) {
            // Nothing to destroy; an unmanaged owner may still be alive.
            unsafe { RefCounter::release_if_owner_dropped(this) };
        }
        unsafe { RefCounter::dec_ref_count(this) };
    }

    pub fn get_weak_ref_count(&self) -> i32 {
        self.weak.load(Relaxed)
    }

    pub fn extend_object_lifetime(&self) {
        self.flags.fetch_or(FLAG_EXTEND_LIFE_TIME, Release);
    }

    pub fn is_life_time_extended(&self) -> bool {
        self.flags.load(Acquire) & FLAG_EXTEND_LIFE_TIME != 0
    }

    pub fn set_attempt_acquire(&self) {
        self.attempt.fetch_add(1, Relaxed);
    }

    pub fn is_attempt_acquire_set(&self) -> bool {
        self.attempt.load(Relaxed) > 0
    }

    /// Consumes one pending mark. Returns false if there was none, so that
    /// two racing callers never both reconcile the same promotion.
    pub fn clear_attempt_acquire(&self) -> bool {
        self.attempt
            .fetch_update(Relaxed, Relaxed, |n| (n > 0).then(|| n - 1))
            .is_ok()
    }

    /// Tries to add one strong owner. `Ok` holds the count before the
    /// increment, `Err` the count that made promotion impossible.
    fn claim_strong(&self) -> Result<i32, i32> {
        let mut cur = self.strong.load(Relaxed);
        // Already strongly owned.
        while cur > 0 && cur != INITIAL_PRIMARY_VALUE {
            match self.strong.compare_exchange_weak(cur, cur + 1, Relaxed, Relaxed) {
                Ok(prev) => return Ok(prev),
                Err(actual) => cur = actual,
            }
        }
        if cur == INITIAL_PRIMARY_VALUE && !self.is_life_time_extended() {
            // Never owned. A racing first acquisition may be normalizing the
            // sentinel; keep going as long as the count stays positive.
            while cur > 0 {
                match self.strong.compare_exchange_weak(cur, cur + 1, Relaxed, Relaxed) {
                    Ok(prev) => return Ok(prev),
                    Err(actual) => cur = actual,
                }
            }
        }
        if self.is_life_time_extended() {
            // Extended objects stay promotable with no strong owners.
            let prev = self.strong.fetch_add(1, Relaxed);
            if prev >= 0 {
                return Ok(prev);
            }
            self.strong.fetch_sub(1, Relaxed);
            return Err(prev);
        }
        Err(cur)
    }

    /// Promotes a weak reference held by the caller to a strong one.
    ///
    /// On success the caller owns one more strong and one more weak count.
    /// On failure both are left as they were, although giving back the
    /// speculative weak count may itself reach zero and run the weak policy.
    ///
    /// # Safety
    ///
    /// `this` must point to a live counter on which the caller holds a
    /// structural reference.
    pub unsafe fn attempt_inc_strong_ref(this: NonNull<RefCounter>, id: ObjectId) -> Promotion {
        let counter = unsafe { this.as_ref() };
        counter.track(TrackOp::AttemptPromote, id);
        // Keeps the counter from being torn down while we look at it.
        counter.inc_weak_ref(id);
        match counter.claim_strong() {
            Ok(prev) => {
                if prev == INITIAL_PRIMARY_VALUE {
                    counter.strong.fetch_sub(INITIAL_PRIMARY_VALUE, Release);
                } else if prev > MAX_REF_COUNT {
                    abort_on(InvariantViolation::Overflow(prev));
                }
                Promotion::Promoted(prev)
            }
            Err(cur) => {
                trace!("promotion on counter {:p} rejected at strong count {cur}", counter);
                unsafe { RefCounter::dec_weak_ref(this, id, || {}) };
                Promotion::Rejected
            }
        }
    }

    /// Like `attempt_inc_strong_ref`, but only succeeds while the object
    /// already has strong owners.
    ///
    /// # Safety
    ///
    /// Same as `attempt_inc_strong_ref`.
    pub unsafe fn attempt_inc_strong_simple(this: NonNull<RefCounter>, id: ObjectId) -> bool {
        let counter = unsafe { this.as_ref() };
        counter.track(TrackOp::AttemptPromote, id);
        counter.inc_weak_ref(id);
        let mut cur = counter.strong.load(Relaxed);
        while cur > 0 && cur != INITIAL_PRIMARY_VALUE {
            match counter.strong.compare_exchange_weak(cur, cur + 1, Relaxed, Relaxed) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
        unsafe { RefCounter::dec_weak_ref(this, id, || {}) };
        false
    }
}

impl Drop for RefCounter {
    fn drop(&mut self) {
        self.track(TrackOp::Free, ObjectId::NONE);
        self.remove_callback();
    }
}
