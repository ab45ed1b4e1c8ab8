//! Intrusive strong/weak reference counting for heap objects.
//!
//! Every managed object embeds a [`RefBase`], which owns one [`RefCounter`].
//! Owning handles ([`Sp`]) and observing handles ([`Wp`]) drive the counter
//! through the entry points on [`RefObjectExt`]. The counter tracks three
//! things: strong owners, weak observers, and its own structural references
//! (the owning `RefBase` plus every live [`WeakRefCounter`]).
//!
//! ```
//! use refbase::{RefBase, RefObject, Sp, Wp};
//!
//! struct Node {
//!     base: RefBase,
//!     value: u32,
//! }
//!
//! impl RefObject for Node {
//!     fn ref_base(&self) -> &RefBase {
//!         &self.base
//!     }
//! }
//!
//! let strong = Sp::new(Node { base: RefBase::new(), value: 7 });
//! let weak = Wp::new(&strong);
//! assert_eq!(weak.promote().map(|n| n.value), Some(7));
//! drop(strong);
//! assert!(weak.promote().is_none());
//! ```

pub mod error;
pub mod ptr;
pub mod refbase;
pub mod tracker;

pub use error::InvariantViolation;
pub use ptr::{Sp, Wp};
pub use refbase::{
    Cookie, Promotion, RefBase, RefCounter, RefObject, RefObjectExt, WeakRefCounter,
    FLAG_EXTEND_LIFE_TIME, INITIAL_PRIMARY_VALUE, MAX_REF_COUNT,
};
pub use tracker::{CounterSnapshot, HistoryTracker, RefTracker, TrackEntry, TrackOp};

/// Identity of the handle on whose behalf a counter operation runs.
///
/// Only used for diagnostics; the counting logic never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    pub const NONE: ObjectId = ObjectId(0);

    pub fn of<T: ?Sized>(handle: &T) -> ObjectId {
        ObjectId(handle as *const T as *const () as usize)
    }

    pub fn from_addr(addr: usize) -> ObjectId {
        ObjectId(addr)
    }

    pub fn addr(self) -> usize {
        self.0
    }
}
