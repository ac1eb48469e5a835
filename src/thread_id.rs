use std::{
    num::NonZeroU32,
    sync::atomic::{AtomicU32, Ordering},
};

/// Returns a process-unique, nonzero identifier for the calling thread.
///
/// Zero is reserved to mean "no owner" in lock state words. Identifiers are
/// never reused, so a lock word can never mistake a new thread for an old
/// owner.
pub(crate) fn current() -> NonZeroU32 {
    thread_local!(static THREAD_ID: NonZeroU32 = next());
    THREAD_ID.with(|id| *id)
}

#[cold]
fn next() -> NonZeroU32 {
    static NEXT_ID: AtomicU32 = AtomicU32::new(1);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    NonZeroU32::new(id).expect("thread id space exhausted")
}
