use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::ptr::{manage, Wp};
use crate::refbase::{RefObject, RefObjectExt};
use crate::ObjectId;

/// An owning pointer to a [`RefObject`].
pub struct Sp<T: RefObject> {
    ptr: NonNull<T>,
}

unsafe impl<T: RefObject> Send for Sp<T> {}

unsafe impl<T: RefObject> Sync for Sp<T> {}

impl<T: RefObject> Sp<T> {
    /// Moves `data` to the heap as its first strong owner.
    pub fn new(data: T) -> Sp<T> {
        let sp = Sp { ptr: manage(data) };
        sp.inc_strong_ref(ObjectId::of(&sp));
        sp
    }

    /// Takes a new strong reference on an object that is already managed.
    ///
    /// This is also how a successful `attempt_acquire` is turned into a
    /// pointer: the increment here absorbs the pending one.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object created through `Sp::new` or
    /// `Wp::adopt`, kept alive by a reference the caller holds.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Sp<T> {
        let sp = Sp { ptr };
        sp.inc_strong_ref(ObjectId::of(&sp));
        sp
    }

    /// Wraps a strong reference the caller already owns.
    ///
    /// # Safety
    ///
    /// The caller transfers one strong reference on `ptr` to the result.
    pub(crate) unsafe fn from_owned(ptr: NonNull<T>) -> Sp<T> {
        Sp { ptr }
    }

    pub fn as_ptr(this: &Self) -> NonNull<T> {
        this.ptr
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    pub fn strong_count(this: &Self) -> i32 {
        this.ref_base().get_sptr_ref_count()
    }

    pub fn downgrade(this: &Self) -> Wp<T> {
        Wp::new(this)
    }
}

impl<T: RefObject> Deref for Sp<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: Since there's a strong reference to the object,
        // the object exists and may be shared.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefObject> Clone for Sp<T> {
    fn clone(&self) -> Self {
        // Safety: we own a strong reference, so the object is managed and alive.
        unsafe { Sp::from_raw(self.ptr) }
    }
}

impl<T: RefObject> Drop for Sp<T> {
    fn drop(&mut self) {
        unsafe { T::dec_strong_ref(self.ptr, ObjectId::of(self)) };
    }
}

impl<T: RefObject + fmt::Debug> fmt::Debug for Sp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
