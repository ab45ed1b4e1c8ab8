mod sptr;
mod wptr;

pub use sptr::Sp;
pub use wptr::Wp;

use std::ptr::NonNull;

use crate::refbase::RefObject;

/// The heap allocation of a managed object, handed to its destroy callback.
struct Allocation<T>(NonNull<T>);

// Safety: the allocation is only ever dropped, and T itself is Send.
unsafe impl<T: Send> Send for Allocation<T> {}

impl<T> Allocation<T> {
    /// # Safety
    ///
    /// Must only be called once, by the destroy callback.
    unsafe fn destroy(self) {
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

/// Moves `data` to the heap and arms its destroy callback. The object starts
/// with no strong or weak references.
fn manage<T: RefObject>(data: T) -> NonNull<T> {
    let ptr = NonNull::from(Box::leak(Box::new(data)));
    let allocation = Allocation(ptr);
    // Safety: we just allocated it.
    unsafe { ptr.as_ref() }
        .ref_base()
        .arm(move || unsafe { allocation.destroy() });
    ptr
}
