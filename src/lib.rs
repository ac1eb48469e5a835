//! Lightweight shared/exclusive mutexes and a lock-striped concurrent hash
//! map built on top of them.
//!
//! [`SharedMutex`] and [`SharedRecursiveMutex`] are single atomic words that
//! spin briefly and then park contending threads in the address-keyed
//! [`wait_queue`]. Neither is fair: a thread arriving at an unlocked mutex
//! may take it ahead of threads already parked on it.
//!
//! [`StripedMap`] and [`StripedMultiMap`] split their entries over a fixed
//! number of independently locked buckets, with the lock type chosen through
//! a [`LockPolicy`].

#![warn(
    rust_2018_idioms,
    unreachable_pub,
    // missing_docs
)]

mod cache_padded;
mod lock_word;
mod shared_lock;
mod shared_mutex;
mod shared_recursive_mutex;
mod spin_wait;
mod striped_map;
mod thread_id;
pub mod wait_queue;

pub use self::{
    shared_lock::{DynamicSharedLock, ExclusiveLock, RawSharedMutex, SharedLock},
    shared_mutex::{
        const_shared_rwlock, SharedMutex, SharedRwLock, SharedRwLockReadGuard,
        SharedRwLockWriteGuard,
    },
    shared_recursive_mutex::{SharedRecursiveMutex, SharedRecursiveMutexLink},
    striped_map::{
        Bucket, BucketReadGuard, BucketStorage, BucketWriteGuard, DefaultLockPolicy, LockPolicy,
        MultiBucket, SharedMutexPolicy, StripedMap, StripedMapBase, StripedMultiMap,
        SystemRwLockPolicy,
    },
};
