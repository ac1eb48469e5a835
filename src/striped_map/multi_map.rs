use super::{BucketStorage, DefaultLockPolicy, LockPolicy, StripedMapBase};
use ahash::RandomState;
use hashbrown::{hash_map::RawEntryMut, HashMap};
use smallvec::SmallVec;
use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash},
};

type Values<V> = SmallVec<[V; 1]>;

/// The inner map of a [`StripedMultiMap`] bucket: keys mapped to one or more
/// values, with a running count of values.
pub struct MultiBucket<K, V, S> {
    map: HashMap<K, Values<V>, S>,
    len: usize,
}

impl<K, V, S> MultiBucket<K, V, S> {
    fn with_hasher(hasher: S) -> Self {
        Self {
            map: HashMap::with_hasher(hasher),
            len: 0,
        }
    }

    fn find<Q>(&self, hash: u64, key: &Q) -> Option<&Values<V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        S: BuildHasher,
    {
        self.map
            .raw_entry()
            .from_key_hashed_nocheck(hash, key)
            .map(|(_, values)| values)
    }
}

impl<K, V, S> BucketStorage for MultiBucket<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn len(&self) -> usize {
        self.len
    }

    fn reset(&mut self) {
        self.map.clear();
        self.len = 0;
    }

    fn empty(&mut self) {
        self.reset();
        self.map.shrink_to_fit();
    }

    fn shrink(&mut self) {
        self.map.shrink_to_fit();
        self.map.values_mut().for_each(SmallVec::shrink_to_fit);
    }

    fn compact(&mut self) {
        let entries: Vec<(K, Values<V>)> = self.map.drain().collect();
        self.map.extend(entries);
    }
}

/// A concurrent multimap striped over `N` independently locked buckets.
///
/// Each key holds its values in insertion order. [`len`](Self::len) counts
/// values, not keys.
///
/// ```
/// use stripesync::StripedMultiMap;
///
/// let map: StripedMultiMap<8, u32, &str> = StripedMultiMap::new();
/// map.add(1, "a");
/// map.add(1, "b");
/// assert_eq!(map.multi_find(&1), ["a", "b"]);
/// assert_eq!(map.len(), 2);
/// ```
pub type StripedMultiMap<const N: usize, K, V, P = DefaultLockPolicy, S = RandomState> =
    StripedMapBase<N, MultiBucket<K, V, S>, P, S>;

impl<const N: usize, K, V, P, S> Default for StripedMultiMap<N, K, V, P, S>
where
    K: Eq + Hash,
    P: LockPolicy,
    S: BuildHasher + Clone + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<const N: usize, K, V, P, S> StripedMultiMap<N, K, V, P, S>
where
    K: Eq + Hash,
    P: LockPolicy,
    S: BuildHasher + Clone,
{
    pub fn new() -> Self
    where
        S: Default,
    {
        Self::default()
    }

    pub fn with_hasher(hasher: S) -> Self {
        Self::from_parts(hasher, |hasher| MultiBucket::with_hasher(hasher.clone()))
    }

    /// Append `value` to the values stored under `key`.
    pub fn add(&self, key: K, value: V) {
        let hash = self.hash_key(&key);
        self.write_by_hash(hash, |bucket| {
            match bucket.map.raw_entry_mut().from_key_hashed_nocheck(hash, &key) {
                RawEntryMut::Occupied(mut entry) => entry.get_mut().push(value),
                RawEntryMut::Vacant(entry) => {
                    let mut values = Values::new();
                    values.push(value);
                    entry.insert_hashed_nocheck(hash, key, values);
                }
            }
            bucket.len += 1;
        })
    }

    /// Copies of every value stored under `key`, in insertion order.
    pub fn multi_find<Q>(&self, key: &Q) -> Vec<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
        V: Clone,
    {
        self.read(key, |hash, bucket| {
            bucket
                .find(hash, key)
                .map_or_else(Vec::new, |values| values.to_vec())
        })
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.read(key, |hash, bucket| bucket.find(hash, key).is_some())
    }

    /// Remove `key` with all of its values, returning how many values went.
    pub fn remove<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.write(key, |hash, bucket| {
            match bucket.map.raw_entry_mut().from_key_hashed_nocheck(hash, key) {
                RawEntryMut::Occupied(entry) => {
                    let removed = entry.remove().len();
                    bucket.len -= removed;
                    removed
                }
                RawEntryMut::Vacant(_) => 0,
            }
        })
    }

    /// Remove the first value equal to `value` stored under `key`, dropping
    /// the key once its last value is gone.
    pub fn remove_single<Q>(&self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
        V: PartialEq,
    {
        self.write(key, |hash, bucket| {
            let mut entry = match bucket.map.raw_entry_mut().from_key_hashed_nocheck(hash, key) {
                RawEntryMut::Occupied(entry) => entry,
                RawEntryMut::Vacant(_) => return false,
            };

            let values = entry.get_mut();
            let Some(index) = values.iter().position(|stored| stored == value) else {
                return false;
            };

            values.remove(index);
            if values.is_empty() {
                entry.remove();
            }
            bucket.len -= 1;
            true
        })
    }

    /// Visit every key and value pair, share-locking one bucket at a time.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        self.for_each_bucket(|bucket| {
            for (key, values) in bucket.map.iter() {
                values.iter().for_each(|value| f(key, value));
            }
        });
    }
}
