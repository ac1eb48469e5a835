//! An address-keyed parking lot.
//!
//! Threads park on an arbitrary address after re-validating a condition under
//! the lock of the bucket the address hashes to. Wakers take the same bucket
//! lock to dequeue them, which is what makes the validate-then-park sequence
//! immune to lost wake-ups.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    collections::{btree_map::Entry, BTreeMap, VecDeque},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    thread::{self, Thread},
};

struct Waiter {
    thread: Thread,
    notified: AtomicBool,
}

impl Waiter {
    fn with<F>(f: impl FnOnce(&Arc<Self>) -> F) -> F {
        thread_local!(static TLS_WAITER: Arc<Waiter> = Arc::new(Waiter {
            thread: thread::current(),
            notified: AtomicBool::new(false),
        }));
        TLS_WAITER.with(f)
    }

    fn park(&self) {
        // Acquire pairs with the Release in unpark() so the waker's writes
        // before the wake are visible once we return.
        while !self.notified.load(Ordering::Acquire) {
            thread::park();
        }
    }

    fn unpark(&self) {
        self.notified.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

type Queue = VecDeque<Arc<Waiter>>;

#[derive(Default)]
struct Bucket {
    queues: Mutex<BTreeMap<usize, Queue>>,
}

impl Bucket {
    const COUNT_SHIFT: u32 = 6;
    const COUNT: usize = 1 << Self::COUNT_SHIFT;

    fn from(address: usize) -> &'static Bucket {
        static BUCKETS: OnceCell<Box<[Bucket]>> = OnceCell::new();
        let buckets = BUCKETS.get_or_init(|| (0..Self::COUNT).map(|_| Bucket::default()).collect());

        #[cfg(target_pointer_width = "64")]
        const HASH_MULT: usize = 0x9E3779B97F4A7C15;
        #[cfg(target_pointer_width = "32")]
        const HASH_MULT: usize = 0x9E3779B9;

        // The high bits of a fibonacci hash are the well mixed ones.
        let hash = address.wrapping_mul(HASH_MULT);
        let index = hash >> (usize::BITS - Self::COUNT_SHIFT);
        &buckets[index]
    }
}

/// The outcome of a call to [`wait`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct WaitState {
    /// The thread was queued and went to sleep.
    pub did_wait: bool,
    /// The thread was woken by [`wake_one`] or [`wake_all`].
    pub did_wake: bool,
}

/// The outcome of a call to [`wake_one`], also handed to its callback.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct WakeState {
    /// A thread was dequeued and will be woken.
    pub did_wake: bool,
    /// Other threads are still queued on the address.
    pub has_waiting_threads: bool,
}

/// Queue the calling thread on `address` and block until woken.
///
/// `can_wait` runs while the bucket for `address` is locked. If it returns
/// `false` the thread is not queued and this returns immediately. Otherwise
/// `before_wait` runs after the bucket is unlocked, right before sleeping.
pub fn wait(
    address: usize,
    can_wait: impl FnOnce() -> bool,
    before_wait: impl FnOnce(),
) -> WaitState {
    let bucket = Bucket::from(address);
    let mut queues = bucket.queues.lock();

    if !can_wait() {
        return WaitState::default();
    }

    Waiter::with(|waiter| {
        waiter.notified.store(false, Ordering::Relaxed);
        queues.entry(address).or_default().push_back(waiter.clone());
        drop(queues);

        log::trace!("parking thread {:?} on {:#x}", waiter.thread.id(), address);
        before_wait();
        waiter.park();

        WaitState {
            did_wait: true,
            did_wake: true,
        }
    })
}

/// Wake at most one thread queued on `address`.
///
/// `on_wake` is invoked while the bucket is still locked, so any state it
/// updates is published before another thread can queue itself.
pub fn wake_one(address: usize, on_wake: impl FnOnce(WakeState)) -> WakeState {
    let bucket = Bucket::from(address);
    let mut queues = bucket.queues.lock();

    let mut woken = None;
    let mut has_waiting_threads = false;
    if let Entry::Occupied(mut entry) = queues.entry(address) {
        woken = entry.get_mut().pop_front();
        has_waiting_threads = !entry.get().is_empty();
        if !has_waiting_threads {
            entry.remove();
        }
    }

    let wake_state = WakeState {
        did_wake: woken.is_some(),
        has_waiting_threads,
    };

    on_wake(wake_state);
    drop(queues);

    if let Some(waiter) = woken {
        log::trace!("waking thread {:?} on {:#x}", waiter.thread.id(), address);
        waiter.unpark();
    }

    wake_state
}

/// Wake every thread queued on `address`, returning how many were woken.
pub fn wake_all(address: usize) -> usize {
    let bucket = Bucket::from(address);
    let woken = bucket.queues.lock().remove(&address).unwrap_or_default();

    if !woken.is_empty() {
        log::trace!("waking {} threads on {:#x}", woken.len(), address);
    }

    let count = woken.len();
    for waiter in woken {
        waiter.unpark();
    }
    count
}
