//! Park/wake protocol shared by [`SharedMutex`] and [`SharedRecursiveMutex`].
//!
//! Both mutexes keep their whole state in one `AtomicU32` carrying two hint
//! bits: "may have a waiting exclusive locker" and "may have a waiting shared
//! locker". Exclusive waiters park on the address of the word and shared
//! waiters on the address one byte past it, so the two groups can be woken
//! independently.
//!
//! The hints may be stale in the positive direction only. A thread sets its
//! hint before parking and parks only if the word still equals the snapshot
//! containing that hint, and hints are only cleared under the wait-queue
//! bucket lock or right before waking every thread that could rely on them.
//!
//! [`SharedMutex`]: crate::SharedMutex
//! [`SharedRecursiveMutex`]: crate::SharedRecursiveMutex

use crate::{spin_wait::SpinWait, wait_queue};
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum WaitQueue {
    Exclusive,
    Shared,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct WaitingFlags {
    pub(crate) lock: u32,
    pub(crate) shared_lock: u32,
}

impl WaitingFlags {
    pub(crate) const fn any(self) -> u32 {
        self.lock | self.shared_lock
    }

    fn address(state: &AtomicU32, queue: WaitQueue) -> usize {
        let address = state as *const AtomicU32 as usize;
        match queue {
            WaitQueue::Exclusive => address,
            WaitQueue::Shared => address + 1,
        }
    }

    /// Spin, then park, until `can_acquire` admits the current state and the
    /// word is swapped to `acquire(state)`.
    ///
    /// Acquisition is attempted whenever `can_acquire` allows it, even if
    /// other threads are parked: the lock is not fair.
    #[cold]
    pub(crate) fn acquire_slow(
        self,
        state: &AtomicU32,
        queue: WaitQueue,
        can_acquire: impl Fn(u32) -> bool,
        acquire: impl Fn(u32) -> u32,
    ) {
        let waiting_flag = match queue {
            WaitQueue::Exclusive => self.lock,
            WaitQueue::Shared => self.shared_lock,
        };

        let mut spin = SpinWait::default();
        let mut current = state.load(Ordering::Relaxed);
        loop {
            if can_acquire(current) {
                match state.compare_exchange_weak(
                    current,
                    acquire(current),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(e) => current = e,
                }
                continue;
            }

            // Only spin while nobody is parked; once someone is, spinning
            // just delays our own turn in the queue.
            if current & waiting_flag == 0 && spin.try_yield_now() {
                current = state.load(Ordering::Relaxed);
                continue;
            }

            if current & waiting_flag == 0 {
                if let Err(e) = state.compare_exchange_weak(
                    current,
                    current | waiting_flag,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    current = e;
                    continue;
                }
                current |= waiting_flag;
            }

            let expected = current;
            let _ = wait_queue::wait(
                Self::address(state, queue),
                || state.load(Ordering::Relaxed) == expected,
                || {},
            );
            current = state.load(Ordering::Relaxed);
        }
    }

    /// Wake after an exclusive unlock whose previous state was `last`.
    ///
    /// One exclusive waiter is preferred. Shared waiters are only woken, all
    /// at once, when no exclusive waiter was actually there to take the lock.
    #[cold]
    pub(crate) fn wake_waiting_threads(self, state: &AtomicU32, mut last: u32) {
        if last & self.lock != 0 {
            let woken = wait_queue::wake_one(Self::address(state, WaitQueue::Exclusive), |wake| {
                if !wake.has_waiting_threads {
                    state.fetch_and(!self.lock, Ordering::Relaxed);
                }
            });

            if woken.did_wake {
                return;
            }
            last &= !self.lock;
        }

        if last & self.shared_lock != 0 {
            // Clearing the hint before waking forces any shared locker that
            // is about to park to re-validate against the new state.
            if state.fetch_and(!self.shared_lock, Ordering::Relaxed) & self.shared_lock != 0 {
                wait_queue::wake_all(Self::address(state, WaitQueue::Shared));
            }
        }
    }

    /// Wake one exclusive waiter after the last shared holder left.
    #[cold]
    pub(crate) fn wake_waiting_lock(self, state: &AtomicU32) {
        let _ = wait_queue::wake_one(Self::address(state, WaitQueue::Exclusive), |wake| {
            if !wake.has_waiting_threads {
                state.fetch_and(!self.lock, Ordering::Relaxed);
            }
        });
    }
}
