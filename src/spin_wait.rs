use std::thread;

/// Bounded spinning used by the lock slow paths before they park. Each spin
/// is a `thread::yield_now()`.
#[derive(Default)]
pub(crate) struct SpinWait {
    counter: u32,
}

impl SpinWait {
    #[cfg(not(stripesync_tsan_enabled))]
    pub(crate) const SPIN_LIMIT: u32 = 40;

    // Park straight away so the sanitizer sees the wait-queue handoffs.
    #[cfg(stripesync_tsan_enabled)]
    pub(crate) const SPIN_LIMIT: u32 = 0;

    pub(crate) fn try_yield_now(&mut self) -> bool {
        if self.counter >= Self::SPIN_LIMIT {
            return false;
        }

        self.counter += 1;
        thread::yield_now();
        true
    }
}
