use crate::SharedMutex;

/// Chooses the lock guarding each bucket of a striped map.
///
/// Bucket locks hand out `&mut` access to the inner map, so a policy's mutex
/// must be a [`lock_api::RawRwLock`]. [`SharedRecursiveMutex`] is not one:
/// re-entering its exclusive lock would alias that `&mut`, and its shared
/// locks need a per-lock link. It cannot guard buckets.
///
/// ```compile_fail
/// use stripesync::{LockPolicy, SharedRecursiveMutex};
///
/// struct RecursivePolicy;
///
/// impl LockPolicy for RecursivePolicy {
///     type Mutex = SharedRecursiveMutex;
/// }
/// ```
///
/// [`SharedRecursiveMutex`]: crate::SharedRecursiveMutex
pub trait LockPolicy {
    type Mutex: lock_api::RawRwLock;
}

/// Guards buckets with the 4-byte [`SharedMutex`].
///
/// Lighter than [`SystemRwLockPolicy`], but it has been observed to deadlock
/// under some contention patterns and is therefore not the default. Run the
/// stress tests in `tests/` against it before relying on it.
#[derive(Copy, Clone, Debug, Default)]
pub struct SharedMutexPolicy;

impl LockPolicy for SharedMutexPolicy {
    type Mutex = SharedMutex;
}

/// Guards buckets with `parking_lot`'s reader-writer lock.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemRwLockPolicy;

impl LockPolicy for SystemRwLockPolicy {
    type Mutex = parking_lot::RawRwLock;
}

pub type DefaultLockPolicy = SystemRwLockPolicy;

/// A bucket: the policy's lock around one inner map.
pub type Bucket<P, M> = lock_api::RwLock<<P as LockPolicy>::Mutex, M>;
pub type BucketReadGuard<'a, P, M> = lock_api::RwLockReadGuard<'a, <P as LockPolicy>::Mutex, M>;
pub type BucketWriteGuard<'a, P, M> = lock_api::RwLockWriteGuard<'a, <P as LockPolicy>::Mutex, M>;
