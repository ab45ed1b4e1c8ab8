use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use log::debug;

use crate::ptr::{manage, Sp};
use crate::refbase::{RefCounter, RefObject, RefObjectExt, WeakRefCounter};
use crate::ObjectId;

/// An observing pointer to a [`RefObject`].
///
/// Clones share one [`WeakRefCounter`], which counts once against the
/// object's weak count no matter how many clones exist.
pub struct Wp<T: RefObject> {
    handle: Option<NonNull<WeakRefCounter>>,
    _marker: PhantomData<T>,
}

unsafe impl<T: RefObject> Send for Wp<T> {}

unsafe impl<T: RefObject> Sync for Wp<T> {}

impl<T: RefObject> Wp<T> {
    pub fn new(sp: &Sp<T>) -> Wp<T> {
        Wp::from_object(sp)
    }

    /// A weak pointer to an object managed through `Sp::new` or `Wp::adopt`.
    /// For an inert object the result is always expired.
    pub fn from_object(object: &T) -> Wp<T> {
        let wp = Wp {
            handle: object.create_weak_ref(),
            _marker: PhantomData,
        };
        if let Some(handle) = wp.handle {
            unsafe { handle.as_ref() }.inc_weak_ref(ObjectId::of(&wp));
        }
        wp
    }

    /// Moves `data` to the heap with this weak pointer as its only reference.
    ///
    /// The object has never had a strong owner, so it is destroyed when the
    /// last weak pointer goes away unless it gets promoted first.
    pub fn adopt(data: T) -> Wp<T> {
        let ptr = manage(data);
        // Safety: nothing else can reach the object yet.
        Wp::from_object(unsafe { ptr.as_ref() })
    }

    fn handle(&self) -> Option<&WeakRefCounter> {
        // Safety: we own one use of the handle.
        self.handle.map(|handle| unsafe { handle.as_ref() })
    }

    pub fn promote(&self) -> Option<Sp<T>> {
        let handle = self.handle()?;
        let id = ObjectId::of(self);
        let outcome = handle.attempt_promote(id);
        if !outcome.is_promoted() {
            return None;
        }
        let Some(cookie) = handle.get_ref_ptr() else {
            // The object no longer answers to this counter; undo the promotion.
            debug!("promoted a weak pointer whose counter was detached from its object");
            handle.counter().dec_strong_ref(id);
            unsafe { RefCounter::dec_weak_ref(handle.counter_ptr(), id, || {}) };
            return None;
        };
        let ptr = cookie.cast::<T>();
        if outcome.is_first() {
            // Safety: we now hold a strong reference.
            unsafe { ptr.as_ref() }.on_first_strong_ref(id);
        }
        Some(unsafe { Sp::from_owned(ptr) })
    }

    pub fn is_expired(&self) -> bool {
        self.handle()
            .map_or(true, |handle| handle.get_ref_ptr().is_none())
    }

    /// The object's address while it can still be reached. Dereferencing it
    /// is only sound while a strong reference is held.
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.handle()?.get_ref_ptr().map(|cookie| cookie.cast())
    }

    pub fn weak_count(&self) -> i32 {
        self.handle().map_or(0, WeakRefCounter::get_weak_ref_count)
    }

    pub fn get_ref_counter(&self) -> Option<&WeakRefCounter> {
        self.handle()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.handle == b.handle
    }
}

impl<T: RefObject> Clone for Wp<T> {
    fn clone(&self) -> Self {
        let wp = Wp {
            handle: self.handle,
            _marker: PhantomData,
        };
        if let Some(handle) = wp.handle() {
            handle.inc_weak_ref(ObjectId::of(self));
        }
        wp
    }
}

impl<T: RefObject> Drop for Wp<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe { WeakRefCounter::dec_weak_ref(handle, ObjectId::of(self)) };
        }
    }
}

impl<T: RefObject> fmt::Debug for Wp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(Wp)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refbase::RefBase;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test() {
        static NUM_DROPS: AtomicUsize = AtomicUsize::new(0);

        struct DetectDrop {
            base: RefBase,
            greeting: &'static str,
        }

        impl RefObject for DetectDrop {
            fn ref_base(&self) -> &RefBase {
                &self.base
            }
        }

        impl Drop for DetectDrop {
            fn drop(&mut self) {
                NUM_DROPS.fetch_add(1, Relaxed);
            }
        }

        // Create an Sp with two weak pointers.
        let x = Sp::new(DetectDrop {
            base: RefBase::new(),
            greeting: "hello",
        });
        let y = Sp::downgrade(&x);
        let z = Sp::downgrade(&x);
        let t = thread::spawn(move || {
            // Weak pointer should be promotable at this point.
            let y = y.promote().unwrap();
            assert_eq!(y.greeting, "hello");
        });
        assert_eq!(x.greeting, "hello");
        t.join().unwrap();
        // The object shouldn't be dropped yet,
        // and the weak pointer should be promotable.
        assert_eq!(NUM_DROPS.load(Relaxed), 0);
        assert!(z.promote().is_some());
        drop(x);

        // Now the object should be dropped, and the
        // weak pointer should no longer be promotable.
        assert_eq!(NUM_DROPS.load(Relaxed), 1);
        assert!(z.promote().is_none());
        assert!(z.is_expired());
        assert_eq!(z.as_ptr(), None);
    }

    #[derive(Default)]
    struct Calls {
        first: AtomicUsize,
        last_weak: AtomicUsize,
        drops: AtomicUsize,
    }

    struct Tracked {
        base: RefBase,
        calls: Arc<Calls>,
    }

    impl Tracked {
        fn new(calls: &Arc<Calls>) -> Tracked {
            Tracked {
                base: RefBase::new(),
                calls: calls.clone(),
            }
        }
    }

    impl RefObject for Tracked {
        fn ref_base(&self) -> &RefBase {
            &self.base
        }

        fn on_first_strong_ref(&self, _id: ObjectId) {
            self.calls.first.fetch_add(1, Relaxed);
        }

        fn on_last_weak_ref(&self, _id: ObjectId) {
            self.calls.last_weak.fetch_add(1, Relaxed);
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.calls.drops.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn test_clones_share_handle() {
        let calls = Arc::new(Calls::default());
        let x = Sp::new(Tracked::new(&calls));
        let a = Sp::downgrade(&x);
        let b = a.clone();
        assert!(Wp::ptr_eq(&a, &b));
        assert_eq!(a.weak_count(), 2);
        // One for the strong owner, one for the shared handle.
        assert_eq!(x.ref_base().get_wptr_ref_count(), 2);
        let c = Sp::downgrade(&x);
        assert!(!Wp::ptr_eq(&a, &c));
        assert_eq!(x.ref_base().get_wptr_ref_count(), 3);
        drop(b);
        assert_eq!(a.weak_count(), 1);
        drop(c);
        assert_eq!(x.ref_base().get_wptr_ref_count(), 2);
        assert_eq!(a.as_ptr(), Some(Sp::as_ptr(&x)));
    }

    #[test]
    fn test_adopted_object_dies_with_last_weak() {
        let calls = Arc::new(Calls::default());
        let w = Wp::adopt(Tracked::new(&calls));
        let w2 = w.clone();
        assert!(!w.is_expired());
        drop(w);
        assert_eq!(calls.drops.load(Relaxed), 0);
        drop(w2);
        assert_eq!(calls.last_weak.load(Relaxed), 1);
        assert_eq!(calls.drops.load(Relaxed), 1);
        assert_eq!(calls.first.load(Relaxed), 0);
    }

    #[test]
    fn test_adopted_object_promotes_once() {
        let calls = Arc::new(Calls::default());
        let w = Wp::adopt(Tracked::new(&calls));
        let s = w.promote().unwrap();
        assert_eq!(calls.first.load(Relaxed), 1);
        assert_eq!(Sp::strong_count(&s), 1);
        let s2 = w.promote().unwrap();
        assert_eq!(calls.first.load(Relaxed), 1);
        drop(s);
        drop(s2);
        assert_eq!(calls.drops.load(Relaxed), 1);
        assert!(w.is_expired());
        assert!(w.promote().is_none());
        drop(w);
        assert_eq!(calls.last_weak.load(Relaxed), 0);
    }

    #[test]
    fn test_inert_object_is_always_expired() {
        let calls = Arc::new(Calls::default());
        let mut object = Tracked::new(&calls);
        let moved = object.base.take();
        let w = Wp::from_object(&object);
        assert!(w.is_expired());
        assert!(w.promote().is_none());
        assert_eq!(w.weak_count(), 0);
        assert!(w.get_ref_counter().is_none());
        drop(w);
        drop(moved);
        drop(object);
        assert_eq!(calls.drops.load(Relaxed), 1);
    }
}
