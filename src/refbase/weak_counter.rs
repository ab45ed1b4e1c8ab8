use std::ptr::NonNull;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicI32};

use crate::error::{abort_on, InvariantViolation};
use crate::refbase::counter::{Promotion, RefCounter};
use crate::ObjectId;

/// Type-erased back-reference from a weak handle to its managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(NonNull<()>);

// Safety: a cookie is an address; dereferencing it is already unsafe.
unsafe impl Send for Cookie {}

unsafe impl Sync for Cookie {}

impl Cookie {
    pub fn new<T: ?Sized>(ptr: NonNull<T>) -> Cookie {
        Cookie(ptr.cast())
    }

    pub fn cast<T>(self) -> NonNull<T> {
        self.0.cast()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// Dispatches `on_last_weak_ref` to the object behind a cookie.
pub(crate) type LastWeakHook = unsafe fn(Cookie, ObjectId);

/// A weak handle shared by every weak pointer copied from the same root.
///
/// The handle counts its own users and registers against the object's weak
/// count once, on the first user. It holds one structural reference on the
/// counter for as long as it exists, and frees itself with its last user.
pub struct WeakRefCounter {
    usage: AtomicI32,
    refs: NonNull<RefCounter>,
    cookie: Cookie,
    on_last_weak: Option<LastWeakHook>,
}

// Safety: the counter is only touched through atomics, and the cookie is
// only dereferenced by callers that have proven the object alive.
unsafe impl Send for WeakRefCounter {}

unsafe impl Sync for WeakRefCounter {}

impl WeakRefCounter {
    /// Creates a handle with no users yet. The first `inc_weak_ref` makes it live.
    ///
    /// # Safety
    ///
    /// `refs` must point to a live counter.
    pub(crate) unsafe fn allocate(
        refs: NonNull<RefCounter>,
        cookie: Cookie,
        on_last_weak: Option<LastWeakHook>,
    ) -> NonNull<WeakRefCounter> {
        unsafe { refs.as_ref() }.inc_ref_count();
        NonNull::from(Box::leak(Box::new(WeakRefCounter {
            usage: AtomicI32::new(0),
            refs,
            cookie,
            on_last_weak,
        })))
    }

    pub fn counter(&self) -> &RefCounter {
        unsafe { self.refs.as_ref() }
    }

    pub(crate) fn counter_ptr(&self) -> NonNull<RefCounter> {
        self.refs
    }

    /// The managed object, or `None` once it has been destroyed.
    pub fn get_ref_ptr(&self) -> Option<Cookie> {
        self.counter().is_ref_ptr_valid().then_some(self.cookie)
    }

    pub fn get_weak_ref_count(&self) -> i32 {
        self.usage.load(Relaxed)
    }

    pub fn inc_weak_ref(&self, id: ObjectId) {
        let prev = self.usage.fetch_add(1, Relaxed);
        if prev == 0 {
            self.counter().inc_weak_ref(id);
        } else if prev < 0 {
            abort_on(InvariantViolation::NegativeWeak(prev));
        }
    }

    /// Drops one user. The last one gives back the handle's weak count and
    /// frees the handle.
    ///
    /// # Safety
    ///
    /// `this` must point to a live handle on which the caller owns one use.
    pub unsafe fn dec_weak_ref(this: NonNull<WeakRefCounter>, id: ObjectId) {
        let prev = unsafe { this.as_ref() }.usage.fetch_sub(1, Release);
        if prev != 1 {
            if prev <= 0 {
                abort_on(InvariantViolation::NegativeWeak(prev - 1));
            }
            return;
        }
        fence(Acquire);
        // Safety: that was the last use, and handles only come from `allocate`.
        let handle = unsafe { Box::from_raw(this.as_ptr()) };
        let cookie = handle.cookie;
        let on_last_weak = handle.on_last_weak;
        unsafe {
            RefCounter::dec_weak_ref(handle.refs, id, || {
                if let Some(hook) = on_last_weak {
                    hook(cookie, id);
                }
            })
        };
        drop(handle);
    }

    pub fn attempt_inc_strong_ref(&self, id: ObjectId) -> bool {
        self.attempt_promote(id).is_promoted()
    }

    pub fn attempt_promote(&self, id: ObjectId) -> Promotion {
        // Safety: our structural reference keeps the counter alive.
        unsafe { RefCounter::attempt_inc_strong_ref(self.refs, id) }
    }
}

impl Drop for WeakRefCounter {
    fn drop(&mut self) {
        unsafe { RefCounter::dec_ref_count(self.refs) };
    }
}
