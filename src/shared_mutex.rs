use crate::lock_word::{WaitQueue, WaitingFlags};
use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

const IS_LOCKED: u32 = 1 << 0;
const MAY_HAVE_WAITING_LOCK: u32 = 1 << 1;
const MAY_HAVE_WAITING_SHARED_LOCK: u32 = 1 << 2;
const SHARED_LOCK_COUNT_SHIFT: u32 = 3;
const SHARED_LOCK: u32 = 1 << SHARED_LOCK_COUNT_SHIFT;
const SHARED_LOCK_COUNT_MASK: u32 = !(SHARED_LOCK - 1);

const FLAGS: WaitingFlags = WaitingFlags {
    lock: MAY_HAVE_WAITING_LOCK,
    shared_lock: MAY_HAVE_WAITING_SHARED_LOCK,
};

/// A 4-byte mutex supporting one exclusive owner or any number of shared
/// owners.
///
/// The mutex is neither recursive nor fair. A thread arriving at an unlocked
/// mutex takes it even if other threads are already parked waiting for it.
/// Shared acquisition is refused while an exclusive locker may be waiting,
/// which keeps a steady stream of readers from starving writers.
///
/// # State layout
///
/// Bit     | Description
/// --------+------------------------------------------------------------
/// 0       | Locked exclusively.
/// 1       | An exclusive locker may be parked.
/// 2       | A shared locker may be parked.
/// 3..32   | Number of shared owners.
///
/// # Examples
///
/// ```
/// use stripesync::SharedMutex;
///
/// let mutex = SharedMutex::new();
/// mutex.lock_shared();
/// assert!(!mutex.try_lock());
/// unsafe { mutex.unlock_shared() };
///
/// assert!(mutex.try_lock());
/// unsafe { mutex.unlock() };
/// ```
#[derive(Default)]
pub struct SharedMutex {
    state: AtomicU32,
}

impl fmt::Debug for SharedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("SharedMutex")
            .field("locked", &(state & IS_LOCKED != 0))
            .field("shared_count", &(state >> SHARED_LOCK_COUNT_SHIFT))
            .finish()
    }
}

impl SharedMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Returns true if the mutex is held exclusively by any thread.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & IS_LOCKED != 0
    }

    /// Returns true if the mutex is held in shared mode by any thread.
    pub fn is_locked_shared(&self) -> bool {
        self.state.load(Ordering::Relaxed) & SHARED_LOCK_COUNT_MASK != 0
    }

    /// Acquire the exclusive lock if it is free, without blocking.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        while state & (IS_LOCKED | SHARED_LOCK_COUNT_MASK) == 0 {
            match self.state.compare_exchange_weak(
                state,
                state | IS_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(e) => state = e,
            }
        }
        false
    }

    /// Acquire the exclusive lock, blocking until it is available.
    #[inline]
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange_weak(0, IS_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        FLAGS.acquire_slow(
            &self.state,
            WaitQueue::Exclusive,
            |state| state & (IS_LOCKED | SHARED_LOCK_COUNT_MASK) == 0,
            |state| state | IS_LOCKED,
        );
    }

    /// Release the exclusive lock.
    ///
    /// # Safety
    ///
    /// The calling context must hold the exclusive lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        let last = self.state.fetch_sub(IS_LOCKED, Ordering::Release);
        debug_assert_ne!(last & IS_LOCKED, 0, "SharedMutex unlocked while not locked");

        if last & FLAGS.any() != 0 {
            FLAGS.wake_waiting_threads(&self.state, last);
        }
    }

    /// Acquire a shared lock without blocking.
    ///
    /// Fails when the mutex is locked exclusively or an exclusive locker may
    /// be waiting for it.
    #[inline]
    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        while state & (IS_LOCKED | MAY_HAVE_WAITING_LOCK) == 0 {
            match self.state.compare_exchange_weak(
                state,
                add_shared(state),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(e) => state = e,
            }
        }
        false
    }

    /// Acquire a shared lock, blocking until it is available.
    #[inline]
    pub fn lock_shared(&self) {
        let state = self.state.load(Ordering::Relaxed);
        if state & (IS_LOCKED | MAY_HAVE_WAITING_LOCK) == 0
            && self
                .state
                .compare_exchange_weak(
                    state,
                    add_shared(state),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            return;
        }

        FLAGS.acquire_slow(
            &self.state,
            WaitQueue::Shared,
            |state| state & (IS_LOCKED | MAY_HAVE_WAITING_LOCK) == 0,
            add_shared,
        );
    }

    /// Release a shared lock.
    ///
    /// # Safety
    ///
    /// The calling context must hold a shared lock.
    #[inline]
    pub unsafe fn unlock_shared(&self) {
        let last = self.state.fetch_sub(SHARED_LOCK, Ordering::Release);
        debug_assert_ne!(
            last & SHARED_LOCK_COUNT_MASK,
            0,
            "SharedMutex shared-unlocked while not shared-locked"
        );

        // Only the last shared owner can unblock an exclusive waiter.
        if last & (SHARED_LOCK_COUNT_MASK | MAY_HAVE_WAITING_LOCK)
            == (SHARED_LOCK | MAY_HAVE_WAITING_LOCK)
        {
            FLAGS.wake_waiting_lock(&self.state);
        }
    }
}

fn add_shared(state: u32) -> u32 {
    state
        .checked_add(SHARED_LOCK)
        .expect("SharedMutex shared lock count overflowed")
}

unsafe impl lock_api::RawRwLock for SharedMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardSend;

    fn lock_shared(&self) {
        SharedMutex::lock_shared(self)
    }

    fn try_lock_shared(&self) -> bool {
        SharedMutex::try_lock_shared(self)
    }

    unsafe fn unlock_shared(&self) {
        SharedMutex::unlock_shared(self)
    }

    fn lock_exclusive(&self) {
        self.lock()
    }

    fn try_lock_exclusive(&self) -> bool {
        self.try_lock()
    }

    unsafe fn unlock_exclusive(&self) {
        self.unlock()
    }
}

/// A reader-writer lock protecting a value with a [`SharedMutex`].
pub type SharedRwLock<T> = lock_api::RwLock<SharedMutex, T>;
pub type SharedRwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, SharedMutex, T>;
pub type SharedRwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, SharedMutex, T>;

pub const fn const_shared_rwlock<T>(value: T) -> SharedRwLock<T> {
    SharedRwLock::const_new(<SharedMutex as lock_api::RawRwLock>::INIT, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedLock;
    use std::{
        mem::size_of,
        sync::{
            atomic::{AtomicU32, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn four_bytes() {
        assert_eq!(size_of::<SharedMutex>(), 4);
    }

    #[test]
    fn lock_unlock() {
        let mutex = SharedMutex::new();
        mutex.lock();
        assert!(mutex.is_locked());
        assert!(!mutex.try_lock());
        assert!(!mutex.try_lock_shared());
        unsafe { mutex.unlock() };

        assert!(mutex.try_lock());
        unsafe { mutex.unlock() };
        assert_eq!(mutex.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn nested_shared_locks() {
        let mutex = SharedMutex::new();
        {
            let _a = SharedLock::new(&mutex);
            let _b = SharedLock::new(&mutex);
            let _c = SharedLock::new(&mutex);
            assert!(mutex.is_locked_shared());
            assert!(!mutex.try_lock());
        }

        assert!(!mutex.is_locked_shared());
        assert!(mutex.try_lock());
        unsafe { mutex.unlock() };
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let mutex = SharedMutex::new();
        mutex.lock_shared();

        mutex
            .state
            .fetch_or(MAY_HAVE_WAITING_LOCK, Ordering::Relaxed);
        assert!(!mutex.try_lock_shared());

        // The last reader leaving clears the stale hint.
        unsafe { mutex.unlock_shared() };
        assert_eq!(mutex.state.load(Ordering::Relaxed), 0);
        assert!(mutex.try_lock_shared());
        unsafe { mutex.unlock_shared() };
    }

    #[test]
    fn rwlock_wrapper() {
        let lock = const_shared_rwlock(vec![1]);
        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!(a.len() + b.len(), 2);
            assert!(lock.try_write().is_none());
        }
        lock.write().push(2);
        assert_eq!(*lock.read(), vec![1, 2]);
    }

    #[test]
    fn exclusive_is_mutually_exclusive() {
        const THREADS: usize = 8;
        const ITERS: usize = 2_000;

        let mutex = Arc::new(SharedMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..THREADS)
            .map(|t| {
                let mutex = mutex.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for i in 0..ITERS {
                        if (t + i) % 3 == 0 {
                            mutex.lock();
                            assert_eq!(inside.fetch_add(1 << 16, Ordering::Relaxed), 0);
                            inside.fetch_sub(1 << 16, Ordering::Relaxed);
                            unsafe { mutex.unlock() };
                        } else {
                            mutex.lock_shared();
                            assert!(inside.fetch_add(1, Ordering::Relaxed) < 1 << 16);
                            inside.fetch_sub(1, Ordering::Relaxed);
                            unsafe { mutex.unlock_shared() };
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(mutex.state.load(Ordering::Relaxed) & !FLAGS.any(), 0);
        assert!(mutex.try_lock());
        unsafe { mutex.unlock() };
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unlocked while not locked")]
    fn unlock_without_lock() {
        let mutex = SharedMutex::new();
        unsafe { mutex.unlock() };
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "shared-unlocked while not shared-locked")]
    fn unlock_shared_without_lock() {
        let mutex = SharedMutex::new();
        unsafe { mutex.unlock_shared() };
    }

    #[test]
    fn unlocking_thread_can_barge_past_parked_writer() {
        const ROUNDS: usize = 50;

        let mutex = Arc::new(SharedMutex::new());
        let mut barged = 0;

        for _ in 0..ROUNDS {
            mutex.lock();
            let waiter = {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    mutex.lock();
                    unsafe { mutex.unlock() };
                })
            };

            while mutex.state.load(Ordering::Relaxed) & MAY_HAVE_WAITING_LOCK == 0 {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(2));

            // The waiter is woken but does not own the lock until it wins the
            // race for it, so relocking right away usually succeeds.
            unsafe { mutex.unlock() };
            if mutex.try_lock() {
                barged += 1;
                unsafe { mutex.unlock() };
            }
            waiter.join().unwrap();
        }

        assert!(barged > 0, "never re-acquired ahead of a parked writer");
        assert_eq!(mutex.state.load(Ordering::Relaxed) & !FLAGS.any(), 0);
    }

    #[test]
    fn parked_writer_is_woken_by_last_reader() {
        let mutex = Arc::new(SharedMutex::new());
        let value = Arc::new(AtomicU32::new(0));
        mutex.lock_shared();

        let writer = {
            let mutex = mutex.clone();
            let value = value.clone();
            thread::spawn(move || {
                mutex.lock();
                let seen = value.load(Ordering::Relaxed);
                unsafe { mutex.unlock() };
                seen
            })
        };

        while mutex.state.load(Ordering::Relaxed) & MAY_HAVE_WAITING_LOCK == 0 {
            thread::yield_now();
        }

        value.store(1, Ordering::Relaxed);
        unsafe { mutex.unlock_shared() };
        assert_eq!(writer.join().unwrap(), 1);
    }
}
