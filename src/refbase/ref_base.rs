use std::ptr::NonNull;
use std::sync::Arc;

use log::debug;

use crate::refbase::counter::{Promotion, RefCounter, INITIAL_PRIMARY_VALUE};
use crate::refbase::weak_counter::{Cookie, WeakRefCounter};
use crate::tracker::{CounterSnapshot, RefTracker};
use crate::ObjectId;

/// Reference counting state embedded in every managed object.
///
/// Owns exactly one [`RefCounter`] and one structural reference on it. A
/// `RefBase` whose counter has been moved out is inert: every operation on
/// it is a no-op and every query returns zero or false.
pub struct RefBase {
    refs: Option<NonNull<RefCounter>>,
}

// Safety: the counter is only touched through atomics.
unsafe impl Send for RefBase {}

unsafe impl Sync for RefBase {}

impl RefBase {
    pub fn new() -> RefBase {
        RefBase::with_counter(None)
    }

    pub fn with_tracker(tracker: Arc<dyn RefTracker>) -> RefBase {
        RefBase::with_counter(Some(tracker))
    }

    fn with_counter(tracker: Option<Arc<dyn RefTracker>>) -> RefBase {
        let refs = RefCounter::allocate(tracker);
        unsafe { refs.as_ref() }.inc_ref_count();
        RefBase { refs: Some(refs) }
    }

    /// A new `RefBase` with its own, unrelated counter.
    ///
    /// This does not share ownership with `self`: strong and weak references
    /// taken on the copy are invisible to the original and vice versa.
    pub fn detach_copy(&self) -> RefBase {
        RefBase::with_counter(self.counter().and_then(RefCounter::tracker))
    }

    /// Replaces this object's counter with a fresh one, keeping the destroy
    /// callback. References taken through the old counter stay on it.
    pub fn reset_detached(&mut self) {
        let tracker = self.counter().and_then(RefCounter::tracker);
        let callback = self.counter().and_then(RefCounter::take_callback);
        let fresh = RefBase::with_counter(tracker);
        if let (Some(callback), Some(counter)) = (callback, fresh.counter()) {
            counter.install_callback(callback);
        }
        self.release_counter();
        *self = fresh;
    }

    /// Moves the counter out, leaving `self` inert.
    pub fn take(&mut self) -> RefBase {
        RefBase {
            refs: self.refs.take(),
        }
    }

    /// Gives up this counter and takes over `other`'s, leaving `other` inert.
    pub fn move_from(&mut self, other: &mut RefBase) {
        if self.refs == other.refs {
            return;
        }
        self.release_counter();
        self.refs = other.refs.take();
    }

    fn release_counter(&mut self) {
        if let Some(refs) = self.refs.take() {
            let counter = unsafe { refs.as_ref() };
            counter.remove_callback();
            unsafe { RefCounter::release_owner_share(refs) };
        }
    }

    pub fn is_inert(&self) -> bool {
        self.refs.is_none()
    }

    pub(crate) fn counter_ptr(&self) -> Option<NonNull<RefCounter>> {
        self.refs
    }

    pub fn counter(&self) -> Option<&RefCounter> {
        // Safety: we hold a structural reference for as long as we have the pointer.
        self.refs.map(|refs| unsafe { refs.as_ref() })
    }

    pub fn snapshot(&self) -> Option<CounterSnapshot> {
        self.counter().map(RefCounter::snapshot)
    }

    pub(crate) fn arm<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.counter() {
            Some(counter) => counter.set_callback(callback),
            None => debug!("arming an inert RefBase; the object will never be destroyed"),
        }
    }

    pub fn extend_object_lifetime(&self) {
        if let Some(counter) = self.counter() {
            counter.extend_object_lifetime();
        }
    }

    pub fn is_extend_life_time_set(&self) -> bool {
        self.counter().is_some_and(RefCounter::is_life_time_extended)
    }

    pub fn is_attempt_acquire_set(&self) -> bool {
        self.counter().is_some_and(RefCounter::is_attempt_acquire_set)
    }

    pub fn get_sptr_ref_count(&self) -> i32 {
        self.counter().map_or(0, RefCounter::get_strong_ref_count)
    }

    pub fn get_wptr_ref_count(&self) -> i32 {
        self.counter().map_or(0, RefCounter::get_weak_ref_count)
    }
}

impl Default for RefBase {
    fn default() -> Self {
        RefBase::new()
    }
}

impl Drop for RefBase {
    fn drop(&mut self) {
        let Some(refs) = self.refs.take() else {
            return;
        };
        let counter = unsafe { refs.as_ref() };
        counter.remove_callback();
        let unobserved = counter.mark_owner_dropped();
        let never_owned = counter.get_strong_ref_count() == INITIAL_PRIMARY_VALUE;
        // Otherwise the weak path gives the share back once the weak count drains.
        if unobserved || never_owned {
            unsafe { RefCounter::release_owner_share(refs) };
        }
    }
}

/// An object whose lifetime is managed through an embedded [`RefBase`].
///
/// The `on_*` hooks default to doing nothing.
pub trait RefObject: Send + Sync + 'static {
    fn ref_base(&self) -> &RefBase;

    /// The object got its first strong owner. Runs once per lifetime.
    fn on_first_strong_ref(&self, _id: ObjectId) {}

    /// The strong count dropped to zero.
    fn on_last_strong_ref(&self, _id: ObjectId) {}

    /// The weak count dropped to zero and the object is about to be destroyed.
    fn on_last_weak_ref(&self, _id: ObjectId) {}

    /// Returning false vetoes a gated promotion before any count changes.
    fn on_attempt_promoted(&self, _id: ObjectId) -> bool {
        true
    }
}

unsafe fn dispatch_last_weak<T: RefObject>(cookie: Cookie, id: ObjectId) {
    // Safety: the counter only runs this hook while the object is still armed.
    unsafe { cookie.cast::<T>().as_ref() }.on_last_weak_ref(id);
}

/// Counting entry points of a [`RefObject`], used by [`Sp`](crate::Sp) and
/// [`Wp`](crate::Wp) and by code that manages references by hand.
///
/// Entry points that may destroy the object take a raw pointer, since the
/// object can be freed before they return.
pub trait RefObjectExt: RefObject {
    /// Adds one strong owner (and its paired weak count).
    fn inc_strong_ref(&self, id: ObjectId) {
        let Some(refs) = self.ref_base().counter_ptr() else {
            return;
        };
        let counter = unsafe { refs.as_ref() };
        let prev = counter.inc_strong_ref(id);
        counter.inc_weak_ref(id);
        if prev == INITIAL_PRIMARY_VALUE {
            self.on_first_strong_ref(id);
        }
        if counter.clear_attempt_acquire() {
            // A promotion already counted this owner.
            counter.dec_strong_ref(id);
            unsafe { RefCounter::dec_weak_ref(refs, id, || {}) };
        }
    }

    /// Drops one strong owner, destroying the object when it was the last
    /// and the lifetime is not extended.
    ///
    /// # Safety
    ///
    /// `this` must point to a live object on which the caller owns one
    /// strong reference. The object may be freed before this returns.
    unsafe fn dec_strong_ref(this: NonNull<Self>, id: ObjectId) {
        let Some(refs) = unsafe { this.as_ref() }.ref_base().counter_ptr() else {
            return;
        };
        let counter = unsafe { refs.as_ref() };
        // Pin the counter across the object's destruction.
        counter.inc_ref_count();
        if counter.dec_strong_ref(id) == 1 {
            unsafe { this.as_ref() }.on_last_strong_ref(id);
            if !counter.is_life_time_extended() {
                counter.invoke_destroy(id);
            }
        }
        unsafe {
            RefCounter::dec_weak_ref(refs, id, || this.as_ref().on_last_weak_ref(id));
            RefCounter::dec_ref_count(refs);
        }
    }

    fn inc_weak_ref(&self, id: ObjectId) {
        if let Some(counter) = self.ref_base().counter() {
            counter.inc_weak_ref(id);
        }
    }

    /// # Safety
    ///
    /// `this` must point to a live object on which the caller owns one weak
    /// count. The object may be freed before this returns.
    unsafe fn dec_weak_ref(this: NonNull<Self>, id: ObjectId) {
        let Some(refs) = unsafe { this.as_ref() }.ref_base().counter_ptr() else {
            return;
        };
        unsafe {
            refs.as_ref().inc_ref_count();
            RefCounter::dec_weak_ref(refs, id, || this.as_ref().on_last_weak_ref(id));
            RefCounter::dec_ref_count(refs);
        }
    }

    /// Creates a weak handle with no users. The caller must retain it with
    /// `WeakRefCounter::inc_weak_ref` before doing anything else with it.
    fn create_weak_ref(&self) -> Option<NonNull<WeakRefCounter>>
    where
        Self: Sized,
    {
        let refs = self.ref_base().counter_ptr()?;
        let cookie = Cookie::new(NonNull::from(self));
        Some(unsafe { WeakRefCounter::allocate(refs, cookie, Some(dispatch_last_weak::<Self>)) })
    }

    /// Promotes on behalf of a caller that will next construct a strong
    /// pointer through `inc_strong_ref`; that call absorbs this increment.
    fn attempt_acquire(&self, id: ObjectId) -> bool {
        let Some(refs) = self.ref_base().counter_ptr() else {
            return false;
        };
        match unsafe { RefCounter::attempt_inc_strong_ref(refs, id) } {
            Promotion::Promoted(prev) => {
                unsafe { refs.as_ref() }.set_attempt_acquire();
                if prev == INITIAL_PRIMARY_VALUE {
                    self.on_first_strong_ref(id);
                }
                true
            }
            Promotion::Rejected => false,
        }
    }

    /// Like `attempt_acquire`, but only for objects that already have strong owners.
    fn attempt_acquire_direct(&self, id: ObjectId) -> bool {
        let Some(refs) = self.ref_base().counter_ptr() else {
            return false;
        };
        if unsafe { RefCounter::attempt_inc_strong_simple(refs, id) } {
            unsafe { refs.as_ref() }.set_attempt_acquire();
            return true;
        }
        false
    }

    /// Promotion gated by `on_attempt_promoted`. On success the caller owns
    /// a strong reference outright.
    fn attempt_inc_strong_ref(&self, id: ObjectId) -> bool {
        let Some(refs) = self.ref_base().counter_ptr() else {
            return false;
        };
        if !self.on_attempt_promoted(id) {
            return false;
        }
        let outcome = unsafe { RefCounter::attempt_inc_strong_ref(refs, id) };
        if outcome.is_first() {
            self.on_first_strong_ref(id);
        }
        outcome.is_promoted()
    }
}

impl<T: RefObject + ?Sized> RefObjectExt for T {}
