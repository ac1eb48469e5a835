//! Hash maps sharded over a fixed number of independently locked buckets.
//!
//! A key is hashed once, routed to a bucket by the high half of its hash,
//! and only that bucket's lock is taken: shared for lookups, exclusive for
//! mutation. Operations on keys in different buckets never wait on each
//! other.
//!
//! Nothing hands out references into a bucket. Values are inspected or
//! modified through closures that run while the bucket lock is held, so no
//! borrow can outlive the lock protecting it.
//!
//! Whole-map operations (`len`, `reset`, `for_each`, ...) visit the buckets one
//! at a time and never hold two bucket locks at once. They are therefore not
//! atomic with respect to concurrent writers.

mod map;
mod multi_map;
mod policy;

pub use self::{
    map::StripedMap,
    multi_map::{MultiBucket, StripedMultiMap},
    policy::{
        Bucket, BucketReadGuard, BucketWriteGuard, DefaultLockPolicy, LockPolicy,
        SharedMutexPolicy, SystemRwLockPolicy,
    },
};

use crate::cache_padded::CachePadded;
use ahash::RandomState;
use std::{
    fmt,
    hash::{BuildHasher, Hash},
};

/// The map stored in each bucket of a [`StripedMapBase`].
pub trait BucketStorage {
    /// Number of values stored.
    fn len(&self) -> usize;

    /// Remove everything, keeping the allocated capacity.
    fn reset(&mut self);

    /// Remove everything and release the allocated capacity.
    fn empty(&mut self);

    /// Shrink the allocated capacity to fit the stored values.
    fn shrink(&mut self);

    /// Rebuild the storage at its current capacity, dropping the tombstones
    /// left behind by removals.
    fn compact(&mut self);
}

/// `N` buckets, each a lock of policy `P` around an inner map `M`.
///
/// This is the shared core of [`StripedMap`] and [`StripedMultiMap`], which
/// are aliases of it for particular inner maps.
pub struct StripedMapBase<const N: usize, M, P: LockPolicy = DefaultLockPolicy, S = RandomState> {
    buckets: [CachePadded<Bucket<P, M>>; N],
    hasher: S,
}

impl<const N: usize, M, P: LockPolicy, S> fmt::Debug for StripedMapBase<N, M, P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedMapBase")
            .field("bucket_count", &N)
            .finish_non_exhaustive()
    }
}

impl<const N: usize, M, P: LockPolicy, S: BuildHasher> StripedMapBase<N, M, P, S> {
    const BUCKET_COUNT: usize = {
        assert!(N > 0, "a striped map needs at least one bucket");
        N
    };

    pub(crate) fn from_parts(hasher: S, mut make_bucket: impl FnMut(&S) -> M) -> Self {
        let _ = Self::BUCKET_COUNT;
        let buckets =
            std::array::from_fn(|_| CachePadded::new(Bucket::<P, M>::new(make_bucket(&hasher))));
        Self { buckets, hasher }
    }

    /// The number of buckets.
    pub const fn bucket_count(&self) -> usize {
        Self::BUCKET_COUNT
    }

    /// Hash `key` the way the map hashes it to pick a bucket.
    pub fn hash_key<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }

    /// The bucket owning `hash`.
    ///
    /// Routing uses the high 32 bits. The inner tables place entries by the low bits
    /// of the same hash, which must therefore not be constant within a
    /// bucket.
    pub(crate) fn bucket_index(&self, hash: u64) -> usize {
        if Self::BUCKET_COUNT == 1 {
            0
        } else {
            ((hash >> 32) % Self::BUCKET_COUNT as u64) as usize
        }
    }

    fn bucket(&self, hash: u64) -> &Bucket<P, M> {
        &self.buckets[self.bucket_index(hash)]
    }

    /// Run `f` on the bucket owning `hash` under a shared lock.
    pub(crate) fn read_by_hash<R>(&self, hash: u64, f: impl FnOnce(&M) -> R) -> R {
        let map: BucketReadGuard<'_, P, M> = self.bucket(hash).read();
        f(&map)
    }

    /// Run `f` on the bucket owning `hash` under an exclusive lock.
    pub(crate) fn write_by_hash<R>(&self, hash: u64, f: impl FnOnce(&mut M) -> R) -> R {
        let mut map: BucketWriteGuard<'_, P, M> = self.bucket(hash).write();
        f(&mut map)
    }

    /// Run `f` on the bucket owning `key` under a shared lock.
    pub(crate) fn read<Q, R>(&self, key: &Q, f: impl FnOnce(u64, &M) -> R) -> R
    where
        Q: Hash + ?Sized,
    {
        let hash = self.hash_key(key);
        self.read_by_hash(hash, |map| f(hash, map))
    }

    /// Run `f` on the bucket owning `key` under an exclusive lock.
    pub(crate) fn write<Q, R>(&self, key: &Q, f: impl FnOnce(u64, &mut M) -> R) -> R
    where
        Q: Hash + ?Sized,
    {
        let hash = self.hash_key(key);
        self.write_by_hash(hash, |map| f(hash, map))
    }

    /// Hand the unlocked bucket owning `hash` to `f`, which does its own
    /// locking.
    pub(crate) fn apply_unlocked<R>(&self, hash: u64, f: impl FnOnce(&Bucket<P, M>) -> R) -> R {
        f(self.bucket(hash))
    }

    pub(crate) fn for_each_bucket(&self, mut f: impl FnMut(&M)) {
        for bucket in self.buckets.iter() {
            f(&bucket.read());
        }
    }

    pub(crate) fn for_each_bucket_mut(&self, mut f: impl FnMut(&mut M)) {
        for bucket in self.buckets.iter() {
            f(&mut bucket.write());
        }
    }
}

impl<const N: usize, M: BucketStorage, P: LockPolicy, S: BuildHasher> StripedMapBase<N, M, P, S> {
    /// The number of stored values, summed bucket by bucket.
    pub fn len(&self) -> usize {
        let mut len = 0;
        self.for_each_bucket(|map| len += map.len());
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry and release the buckets' memory.
    pub fn empty(&self) {
        log::debug!("emptying {} buckets", N);
        self.for_each_bucket_mut(M::empty);
    }

    /// Remove every entry, keeping the buckets' memory for reuse.
    pub fn reset(&self) {
        log::debug!("resetting {} buckets", N);
        self.for_each_bucket_mut(M::reset);
    }

    /// Shrink every bucket's memory to fit its entries.
    pub fn shrink(&self) {
        log::debug!("shrinking {} buckets", N);
        self.for_each_bucket_mut(M::shrink);
    }

    /// Rebuild every bucket in place, dropping removal tombstones.
    pub fn compact(&self) {
        log::debug!("compacting {} buckets", N);
        self.for_each_bucket_mut(M::compact);
    }
}
