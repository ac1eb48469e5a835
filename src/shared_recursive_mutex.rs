use crate::{
    lock_word::{WaitQueue, WaitingFlags},
    thread_id,
};
use std::{
    cell::RefCell,
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicU32, Ordering},
};

const MAY_HAVE_WAITING_LOCK: u32 = 1 << 0;
const MAY_HAVE_WAITING_SHARED_LOCK: u32 = 1 << 1;
const LOCK_COUNT_SHIFT: u32 = 2;
const LOCK: u32 = 1 << LOCK_COUNT_SHIFT;
const LOCK_COUNT_MASK: u32 = 0x0000_0ffc;
const SHARED_LOCK_COUNT_SHIFT: u32 = 12;
const SHARED_LOCK: u32 = 1 << SHARED_LOCK_COUNT_SHIFT;
const SHARED_LOCK_COUNT_MASK: u32 = 0xffff_f000;

const FLAGS: WaitingFlags = WaitingFlags {
    lock: MAY_HAVE_WAITING_LOCK,
    shared_lock: MAY_HAVE_WAITING_SHARED_LOCK,
};

/// A shared/exclusive mutex which the owning thread may lock recursively in
/// either mode.
///
/// Recursive exclusive locking is tracked by a count in the state word plus
/// the id of the owning thread. Recursive shared locking is tracked per thread
/// through [`SharedRecursiveMutexLink`]s: a thread that already holds a shared
/// lock may take another even while an exclusive locker is waiting, which
/// would otherwise deadlock it against that waiter.
///
/// Taking a shared lock while holding the exclusive lock on the same mutex,
/// or the reverse, deadlocks.
///
/// # State layout
///
/// Bit     | Description
/// --------+------------------------------------------------------------
/// 0       | An exclusive locker may be parked.
/// 1       | A shared locker may be parked.
/// 2..12   | Exclusive lock recursion count.
/// 12..32  | Number of shared locks held.
#[derive(Default)]
pub struct SharedRecursiveMutex {
    state: AtomicU32,
    thread_id: AtomicU32,
}

impl fmt::Debug for SharedRecursiveMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("SharedRecursiveMutex")
            .field("lock_count", &((state & LOCK_COUNT_MASK) >> LOCK_COUNT_SHIFT))
            .field("shared_count", &(state >> SHARED_LOCK_COUNT_SHIFT))
            .field("owner", &self.thread_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl SharedRecursiveMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            thread_id: AtomicU32::new(0),
        }
    }

    /// Returns true if the mutex is held exclusively by any thread.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOCK_COUNT_MASK != 0
    }

    /// Returns true if the mutex is held in shared mode by any thread.
    pub fn is_locked_shared(&self) -> bool {
        self.state.load(Ordering::Relaxed) & SHARED_LOCK_COUNT_MASK != 0
    }

    fn is_owned_by(&self, current: u32) -> bool {
        self.thread_id.load(Ordering::Relaxed) == current
    }

    /// Only the owning thread modifies the recursion count while it is
    /// nonzero, so a plain add is enough.
    fn lock_recursive(&self) {
        debug_assert_ne!(
            self.state.load(Ordering::Relaxed) & LOCK_COUNT_MASK,
            LOCK_COUNT_MASK,
            "SharedRecursiveMutex recursion count overflowed"
        );
        self.state.fetch_add(LOCK, Ordering::Relaxed);
    }

    fn try_lock_fast(&self, current: u32) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        if state & (LOCK_COUNT_MASK | SHARED_LOCK_COUNT_MASK) == 0
            && self
                .state
                .compare_exchange(state, state | LOCK, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            debug_assert_eq!(self.thread_id.load(Ordering::Relaxed), 0);
            self.thread_id.store(current, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Acquire the exclusive lock without blocking.
    ///
    /// Always succeeds when the calling thread already owns the lock.
    pub fn try_lock(&self) -> bool {
        let current = thread_id::current().get();
        if self.is_owned_by(current) {
            self.lock_recursive();
            return true;
        }
        self.try_lock_fast(current)
    }

    /// Acquire the exclusive lock, blocking until it is available.
    pub fn lock(&self) {
        let current = thread_id::current().get();
        if self.is_owned_by(current) {
            self.lock_recursive();
            return;
        }

        if !self.try_lock_fast(current) {
            self.lock_slow(current);
        }
    }

    #[cold]
    fn lock_slow(&self, current: u32) {
        debug_assert!(
            !SharedRecursiveMutexLink::owns(self),
            "exclusive lock requested while holding a shared lock on the same SharedRecursiveMutex"
        );

        FLAGS.acquire_slow(
            &self.state,
            WaitQueue::Exclusive,
            |state| state & (LOCK_COUNT_MASK | SHARED_LOCK_COUNT_MASK) == 0,
            |state| state | LOCK,
        );
        self.thread_id.store(current, Ordering::Relaxed);
    }

    /// Release one level of the exclusive lock.
    ///
    /// # Safety
    ///
    /// The calling thread must own the exclusive lock.
    pub unsafe fn unlock(&self) {
        let state = self.state.load(Ordering::Relaxed);
        debug_assert_ne!(
            state & LOCK_COUNT_MASK,
            0,
            "SharedRecursiveMutex unlocked while not locked"
        );
        debug_assert!(
            self.is_owned_by(thread_id::current().get()),
            "SharedRecursiveMutex unlocked by a thread that does not own it"
        );

        if state & LOCK_COUNT_MASK > LOCK {
            self.state.fetch_sub(LOCK, Ordering::Relaxed);
            return;
        }

        self.thread_id.store(0, Ordering::Relaxed);
        let last = self.state.fetch_sub(LOCK, Ordering::Release);
        if last & FLAGS.any() != 0 {
            FLAGS.wake_waiting_threads(&self.state, last);
        }
    }

    fn try_lock_shared_fast(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & (LOCK_COUNT_MASK | MAY_HAVE_WAITING_LOCK) == 0 {
                match self.state.compare_exchange_weak(
                    state,
                    add_shared(state),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return true,
                    Err(e) => state = e,
                }
                continue;
            }

            // Re-entering a shared lock this thread already holds must not
            // queue behind a waiting writer, which is itself waiting on us.
            // Our own hold keeps the count nonzero, so a plain add is safe.
            if state & SHARED_LOCK_COUNT_MASK != 0 && SharedRecursiveMutexLink::owns(self) {
                let last = self.state.fetch_add(SHARED_LOCK, Ordering::Acquire);
                debug_assert_ne!(
                    last & SHARED_LOCK_COUNT_MASK,
                    SHARED_LOCK_COUNT_MASK,
                    "SharedRecursiveMutex shared lock count overflowed"
                );
                return true;
            }

            return false;
        }
    }

    /// Acquire a shared lock without blocking, recording it in `link`.
    ///
    /// # Panics
    ///
    /// Panics if `link` already records a shared lock.
    pub fn try_lock_shared(&self, link: &mut SharedRecursiveMutexLink) -> bool {
        link.assert_unlinked();
        if self.try_lock_shared_fast() {
            link.push(self);
            return true;
        }
        false
    }

    /// Acquire a shared lock, blocking until it is available, recording it
    /// in `link`.
    ///
    /// # Panics
    ///
    /// Panics if `link` already records a shared lock.
    pub fn lock_shared(&self, link: &mut SharedRecursiveMutexLink) {
        link.assert_unlinked();
        debug_assert!(
            !self.is_owned_by(thread_id::current().get()),
            "shared lock requested while holding the exclusive lock on the same SharedRecursiveMutex"
        );

        if !self.try_lock_shared_fast() {
            FLAGS.acquire_slow(
                &self.state,
                WaitQueue::Shared,
                |state| state & (LOCK_COUNT_MASK | MAY_HAVE_WAITING_LOCK) == 0,
                add_shared,
            );
        }
        link.push(self);
    }

    /// Release the shared lock recorded in `link`.
    ///
    /// # Safety
    ///
    /// `link` must have been filled by a shared lock of this mutex on the
    /// calling thread and not released since.
    pub unsafe fn unlock_shared(&self, link: &mut SharedRecursiveMutexLink) {
        link.pop(self);

        let last = self.state.fetch_sub(SHARED_LOCK, Ordering::Release);
        debug_assert_ne!(
            last & SHARED_LOCK_COUNT_MASK,
            0,
            "SharedRecursiveMutex shared-unlocked while not shared-locked"
        );

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
        .expect("SharedRecursiveMutex shared lock count overflowed")
}

/// The shared locks on [`SharedRecursiveMutex`]es held by this thread.
struct HeldSharedLocks {
    mutexes: RefCell<Vec<usize>>,
}

impl Drop for HeldSharedLocks {
    fn drop(&mut self) {
        let held = self.mutexes.get_mut();
        assert!(
            held.is_empty(),
            "thread exited while holding {} shared lock(s) on a SharedRecursiveMutex",
            held.len()
        );
    }
}

thread_local!(static HELD_SHARED_LOCKS: HeldSharedLocks = HeldSharedLocks {
    mutexes: RefCell::new(Vec::new()),
});

/// Records one shared lock held on a [`SharedRecursiveMutex`] by the current
/// thread.
///
/// While filled, the link is registered in the thread's list of held shared
/// locks, which is what lets the mutex recognize recursive shared locking.
/// A link is tied to the thread that filled it.
#[derive(Default)]
pub struct SharedRecursiveMutexLink {
    owner: Option<usize>,
    _thread_bound: PhantomData<*const ()>,
}

impl fmt::Debug for SharedRecursiveMutexLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRecursiveMutexLink")
            .field("linked", &self.owner.is_some())
            .finish()
    }
}

impl SharedRecursiveMutexLink {
    pub const fn new() -> Self {
        Self {
            owner: None,
            _thread_bound: PhantomData,
        }
    }

    /// Returns true if this link currently records a held shared lock.
    pub fn is_linked(&self) -> bool {
        self.owner.is_some()
    }

    fn address(mutex: &SharedRecursiveMutex) -> usize {
        mutex as *const SharedRecursiveMutex as usize
    }

    fn owns(mutex: &SharedRecursiveMutex) -> bool {
        let address = Self::address(mutex);
        HELD_SHARED_LOCKS.with(|held| held.mutexes.borrow().iter().rev().any(|&m| m == address))
    }

    fn assert_unlinked(&self) {
        assert!(self.owner.is_none(), "SharedRecursiveMutexLink is already linked");
    }

    fn push(&mut self, mutex: &SharedRecursiveMutex) {
        debug_assert!(self.owner.is_none());

        let address = Self::address(mutex);
        HELD_SHARED_LOCKS.with(|held| held.mutexes.borrow_mut().push(address));
        self.owner = Some(address);
    }

    fn pop(&mut self, mutex: &SharedRecursiveMutex) {
        let address = Self::address(mutex);
        assert_eq!(
            self.owner,
            Some(address),
            "SharedRecursiveMutexLink does not record a lock on this mutex"
        );

        HELD_SHARED_LOCKS.with(|held| {
            let mut mutexes = held.mutexes.borrow_mut();
            let index = mutexes
                .iter()
                .rposition(|&m| m == address)
                .expect("shared lock missing from the thread's held locks");
            mutexes.remove(index);
        });
        self.owner = None;
    }
}
