use thiserror::Error;

/// A broken counting invariant.
///
/// These are programming errors. The counter aborts when it detects one on
/// the hot path; snapshots and the history tracker report them as values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("structural count went negative: {0}")]
    NegativeStructural(i32),
    #[error("weak count went negative: {0}")]
    NegativeWeak(i32),
    #[error("strong count went negative: {0}")]
    NegativeStrong(i32),
    #[error("attempt marker went negative: {0}")]
    NegativeAttempt(i32),
    #[error("reference count overflow: {0}")]
    Overflow(i32),
}

#[cold]
#[inline(never)]
pub(crate) fn abort_on(violation: InvariantViolation) -> ! {
    log::error!("refbase invariant violated, aborting: {violation}");
    std::process::abort();
}
