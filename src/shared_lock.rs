use crate::{SharedMutex, SharedRecursiveMutex, SharedRecursiveMutexLink};
use lock_api::{GuardNoSend, GuardSend};
use std::{fmt, marker::PhantomData};

/// A mutex usable with the scoped lock types in this module.
///
/// Shared locking goes through a per-lock `Link` so that mutexes which track
/// held shared locks per thread (like [`SharedRecursiveMutex`]) can record
/// them. Mutexes that need no such record use `()`.
///
/// `GuardMarker` decides whether an [`ExclusiveLock`] may move to another
/// thread: [`GuardSend`] if any thread may release the exclusive lock,
/// [`GuardNoSend`] if only the thread that took it may.
///
/// # Safety
///
/// Implementations must provide mutual exclusion between the exclusive lock
/// and every other lock, exclusive or shared, and must use [`GuardNoSend`]
/// if `unlock` requires the locking thread.
pub unsafe trait RawSharedMutex {
    type Link: Default;

    type GuardMarker;

    fn lock(&self);

    fn try_lock(&self) -> bool;

    /// # Safety
    ///
    /// The exclusive lock must be held by the calling context.
    unsafe fn unlock(&self);

    fn lock_shared(&self, link: &mut Self::Link);

    fn try_lock_shared(&self, link: &mut Self::Link) -> bool;

    /// # Safety
    ///
    /// `link` must record a shared lock acquired on this mutex.
    unsafe fn unlock_shared(&self, link: &mut Self::Link);
}

unsafe impl RawSharedMutex for SharedMutex {
    type Link = ();

    type GuardMarker = GuardSend;

    fn lock(&self) {
        SharedMutex::lock(self)
    }

    fn try_lock(&self) -> bool {
        SharedMutex::try_lock(self)
    }

    unsafe fn unlock(&self) {
        SharedMutex::unlock(self)
    }

    fn lock_shared(&self, _link: &mut ()) {
        SharedMutex::lock_shared(self)
    }

    fn try_lock_shared(&self, _link: &mut ()) -> bool {
        SharedMutex::try_lock_shared(self)
    }

    unsafe fn unlock_shared(&self, _link: &mut ()) {
        SharedMutex::unlock_shared(self)
    }
}

unsafe impl RawSharedMutex for SharedRecursiveMutex {
    type Link = SharedRecursiveMutexLink;

    // The owner is recorded by thread id.
    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        SharedRecursiveMutex::lock(self)
    }

    fn try_lock(&self) -> bool {
        SharedRecursiveMutex::try_lock(self)
    }

    unsafe fn unlock(&self) {
        SharedRecursiveMutex::unlock(self)
    }

    fn lock_shared(&self, link: &mut SharedRecursiveMutexLink) {
        SharedRecursiveMutex::lock_shared(self, link)
    }

    fn try_lock_shared(&self, link: &mut SharedRecursiveMutexLink) -> bool {
        SharedRecursiveMutex::try_lock_shared(self, link)
    }

    unsafe fn unlock_shared(&self, link: &mut SharedRecursiveMutexLink) {
        SharedRecursiveMutex::unlock_shared(self, link)
    }
}

/// Holds a shared lock on a mutex for as long as it is alive.
///
/// ```
/// use stripesync::{SharedLock, SharedMutex};
///
/// let mutex = SharedMutex::new();
/// {
///     let _a = SharedLock::new(&mutex);
///     let _b = SharedLock::new(&mutex);
///     assert!(!mutex.try_lock());
/// }
/// assert!(mutex.try_lock());
/// # unsafe { mutex.unlock() };
/// ```
#[must_use = "if unused the lock is released immediately"]
pub struct SharedLock<'a, M: RawSharedMutex> {
    mutex: &'a M,
    link: M::Link,
}

impl<'a, M: RawSharedMutex> SharedLock<'a, M> {
    pub fn new(mutex: &'a M) -> Self {
        let mut link = M::Link::default();
        mutex.lock_shared(&mut link);
        Self { mutex, link }
    }
}

impl<'a, M: RawSharedMutex> Drop for SharedLock<'a, M> {
    fn drop(&mut self) {
        unsafe { self.mutex.unlock_shared(&mut self.link) }
    }
}

impl<'a, M: RawSharedMutex> fmt::Debug for SharedLock<'a, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("SharedLock { .. }")
    }
}

/// A shared lock that may be acquired and released repeatedly, or not at all.
///
/// The lock is released on drop if it is held.
pub struct DynamicSharedLock<'a, M: RawSharedMutex> {
    mutex: &'a M,
    link: M::Link,
    owns_lock: bool,
}

impl<'a, M: RawSharedMutex> DynamicSharedLock<'a, M> {
    /// Wrap `mutex`, acquiring a shared lock on it.
    pub fn new(mutex: &'a M) -> Self {
        let mut lock = Self::deferred(mutex);
        lock.lock();
        lock
    }

    /// Wrap `mutex` without locking it.
    pub fn deferred(mutex: &'a M) -> Self {
        Self {
            mutex,
            link: M::Link::default(),
            owns_lock: false,
        }
    }

    /// Acquire the shared lock, blocking until it is available.
    ///
    /// # Panics
    ///
    /// Panics if the lock is already held through this value.
    pub fn lock(&mut self) {
        assert!(!self.owns_lock, "DynamicSharedLock is already locked");
        self.mutex.lock_shared(&mut self.link);
        self.owns_lock = true;
    }

    /// Try to acquire the shared lock without blocking.
    ///
    /// # Panics
    ///
    /// Panics if the lock is already held through this value.
    pub fn try_lock(&mut self) -> bool {
        assert!(!self.owns_lock, "DynamicSharedLock is already locked");
        self.owns_lock = self.mutex.try_lock_shared(&mut self.link);
        self.owns_lock
    }

    /// Release the shared lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held through this value.
    pub fn unlock(&mut self) {
        assert!(self.owns_lock, "DynamicSharedLock is not locked");
        self.owns_lock = false;
        unsafe { self.mutex.unlock_shared(&mut self.link) }
    }

    pub fn owns_lock(&self) -> bool {
        self.owns_lock
    }
}

impl<'a, M: RawSharedMutex> Drop for DynamicSharedLock<'a, M> {
    fn drop(&mut self) {
        if self.owns_lock {
            unsafe { self.mutex.unlock_shared(&mut self.link) }
        }
    }
}

impl<'a, M: RawSharedMutex> fmt::Debug for DynamicSharedLock<'a, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicSharedLock")
            .field("owns_lock", &self.owns_lock)
            .finish()
    }
}

/// Holds the exclusive lock on a mutex for as long as it is alive.
///
/// The guard can be sent to another thread only if the mutex allows it. A
/// [`SharedRecursiveMutex`] must be released by the thread that locked it:
///
/// ```compile_fail
/// use stripesync::{ExclusiveLock, SharedRecursiveMutex};
///
/// fn assert_send<T: Send>(_: &T) {}
///
/// let mutex = SharedRecursiveMutex::new();
/// let guard = ExclusiveLock::new(&mutex);
/// assert_send(&guard);
/// ```
#[must_use = "if unused the lock is released immediately"]
pub struct ExclusiveLock<'a, M: RawSharedMutex> {
    mutex: &'a M,
    _marker: PhantomData<M::GuardMarker>,
}

impl<'a, M: RawSharedMutex> ExclusiveLock<'a, M> {
    pub fn new(mutex: &'a M) -> Self {
        mutex.lock();
        Self {
            mutex,
            _marker: PhantomData,
        }
    }
}

impl<'a, M: RawSharedMutex> Drop for ExclusiveLock<'a, M> {
    fn drop(&mut self) {
        unsafe { self.mutex.unlock() }
    }
}

impl<'a, M: RawSharedMutex> fmt::Debug for ExclusiveLock<'a, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ExclusiveLock { .. }")
    }
}
