mod counter;
mod ref_base;
mod weak_counter;

pub use counter::{
    Promotion, RefCounter, FLAG_EXTEND_LIFE_TIME, INITIAL_PRIMARY_VALUE, MAX_REF_COUNT,
};
pub use ref_base::{RefBase, RefObject, RefObjectExt};
pub use weak_counter::{Cookie, WeakRefCounter};
