use super::{BucketStorage, DefaultLockPolicy, LockPolicy, StripedMapBase};
use ahash::RandomState;
use hashbrown::{hash_map::RawEntryMut, HashMap};
use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash},
};

/// A concurrent hash map striped over `N` independently locked buckets.
///
/// # Examples
///
/// ```
/// use stripesync::StripedMap;
///
/// let map: StripedMap<32, &str, u32> = StripedMap::new();
/// map.add("answer", 41);
/// map.find_and_apply_mut("answer", |value| *value += 1);
///
/// let produced = map.find_or_produce("question", || 0);
/// assert_eq!(produced, 0);
/// assert_eq!(map.find_ref("answer"), 42);
/// assert_eq!(map.len(), 2);
/// ```
pub type StripedMap<const N: usize, K, V, P = DefaultLockPolicy, S = RandomState> =
    StripedMapBase<N, HashMap<K, V, S>, P, S>;

impl<K, V, S> BucketStorage for HashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn len(&self) -> usize {
        HashMap::len(self)
    }

    fn reset(&mut self) {
        self.clear();
    }

    fn empty(&mut self) {
        self.clear();
        self.shrink_to_fit();
    }

    fn shrink(&mut self) {
        self.shrink_to_fit();
    }

    fn compact(&mut self) {
        // Draining leaves the table empty at its current capacity with no
        // tombstones left, so re-inserting needs no reallocation.
        let entries: Vec<(K, V)> = self.drain().collect();
        self.extend(entries);
    }
}

fn insert_hashed<K, V, S>(map: &mut HashMap<K, V, S>, hash: u64, key: K, value: V) -> Option<V>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    match map.raw_entry_mut().from_key_hashed_nocheck(hash, &key) {
        RawEntryMut::Occupied(mut entry) => Some(entry.insert(value)),
        RawEntryMut::Vacant(entry) => {
            entry.insert_hashed_nocheck(hash, key, value);
            None
        }
    }
}

fn find_hashed<'a, K, V, S, Q>(map: &'a HashMap<K, V, S>, hash: u64, key: &Q) -> Option<&'a V>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
    S: BuildHasher,
{
    map.raw_entry()
        .from_key_hashed_nocheck(hash, key)
        .map(|(_, value)| value)
}

fn find_hashed_mut<'a, K, V, S, Q>(
    map: &'a mut HashMap<K, V, S>,
    hash: u64,
    key: &Q,
) -> Option<&'a mut V>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
    S: BuildHasher,
{
    match map.raw_entry_mut().from_key_hashed_nocheck(hash, key) {
        RawEntryMut::Occupied(entry) => Some(entry.into_mut()),
        RawEntryMut::Vacant(_) => None,
    }
}

fn remove_hashed<K, V, S, Q>(map: &mut HashMap<K, V, S>, hash: u64, key: &Q) -> Option<V>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
    S: BuildHasher,
{
    match map.raw_entry_mut().from_key_hashed_nocheck(hash, key) {
        RawEntryMut::Occupied(entry) => Some(entry.remove()),
        RawEntryMut::Vacant(_) => None,
    }
}

/// Find `key` in `map`, producing and inserting its value on a miss.
/// `None` from `produce` leaves the map untouched.
fn find_or_try_insert_hashed<'a, K, V, S>(
    map: &'a mut HashMap<K, V, S>,
    hash: u64,
    key: K,
    produce: impl FnOnce() -> Option<V>,
) -> Option<&'a mut V>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    match map.raw_entry_mut().from_key_hashed_nocheck(hash, &key) {
        RawEntryMut::Occupied(entry) => Some(entry.into_mut()),
        RawEntryMut::Vacant(entry) => {
            let value = produce()?;
            Some(entry.insert_hashed_nocheck(hash, key, value).1)
        }
    }
}

impl<const N: usize, K, V, P, S> Default for StripedMap<N, K, V, P, S>
where
    K: Eq + Hash,
    P: LockPolicy,
    S: BuildHasher + Clone + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<const N: usize, K, V, P, S> StripedMap<N, K, V, P, S>
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

    /// Create a map whose buckets all hash with clones of `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self::from_parts(hasher, |hasher| HashMap::with_hasher(hasher.clone()))
    }

    /// Insert `value` under `key`, returning the value it replaced.
    pub fn add(&self, key: K, value: V) -> Option<V> {
        let hash = self.hash_key(&key);
        self.write_by_hash(hash, |map| insert_hashed(map, hash, key, value))
    }

    /// Insert the value built by `make` under `key`, returning the value it
    /// replaced. `make` runs under the bucket's exclusive lock.
    pub fn emplace(&self, key: K, make: impl FnOnce() -> V) -> Option<V> {
        let hash = self.hash_key(&key);
        self.write_by_hash(hash, |map| insert_hashed(map, hash, key, make()))
    }

    /// A copy of the value stored under `key`, or `V::default()` if absent.
    pub fn find_ref<Q>(&self, key: &Q) -> V
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
        V: Clone + Default,
    {
        self.find(key).unwrap_or_default()
    }

    /// A copy of the value stored under `key`.
    pub fn find<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
        V: Clone,
    {
        self.read(key, |hash, map| find_hashed(map, hash, key).cloned())
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.read(key, |hash, map| find_hashed(map, hash, key).is_some())
    }

    /// Run `apply` on the value under `key` while its bucket is share-locked.
    ///
    /// Returns `None` without calling `apply` if the key is absent.
    pub fn find_and_apply<Q, R>(&self, key: &Q, apply: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.read(key, |hash, map| find_hashed(map, hash, key).map(apply))
    }

    /// Run `apply` on the value under `key` while its bucket is
    /// exclusively locked.
    ///
    /// Returns `None` without calling `apply` if the key is absent.
    pub fn find_and_apply_mut<Q, R>(&self, key: &Q, apply: impl FnOnce(&mut V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.write(key, |hash, map| find_hashed_mut(map, hash, key).map(apply))
    }

    /// A copy of the value under `key`, produced and inserted first if the
    /// key is absent.
    pub fn find_or_produce(&self, key: K, produce: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        self.find_or_produce_and_apply(key, produce, V::clone)
    }

    /// Run `apply` on the value under `key`, producing and inserting it first
    /// if the key is absent.
    ///
    /// The lookup happens under a shared lock. On a miss the bucket is locked
    /// exclusively and checked again before `produce` runs, so among any
    /// number of racing callers only one produces the value and all of them
    /// apply to that same value.
    pub fn find_or_produce_and_apply<R>(
        &self,
        key: K,
        produce: impl FnOnce() -> V,
        apply: impl FnOnce(&V) -> R,
    ) -> R {
        let applied = self.find_or_try_produce_and_apply(key, || Some(produce()), apply);
        applied.expect("infallible producer declined to produce")
    }

    /// Like [`find_or_produce_and_apply`](Self::find_or_produce_and_apply),
    /// but `produce` may decline by returning `None`, in which case the map is
    /// left unchanged, `apply` is not called and `None` is returned.
    pub fn find_or_try_produce_and_apply<R>(
        &self,
        key: K,
        produce: impl FnOnce() -> Option<V>,
        apply: impl FnOnce(&V) -> R,
    ) -> Option<R> {
        let hash = self.hash_key(&key);
        self.apply_unlocked(hash, |bucket| {
            if let Some(value) = find_hashed(&*bucket.read(), hash, &key) {
                return Some(apply(value));
            }

            let mut map = bucket.write();
            let value = find_or_try_insert_hashed(&mut *map, hash, key, produce)?;
            Some(apply(&*value))
        })
    }

    /// Run `apply` on the value under `key` with exclusive access, producing
    /// and inserting it first if the key is absent.
    ///
    /// Mutation needs the exclusive lock anyway, so the bucket is locked
    /// exclusively for both the lookup and the insert.
    pub fn find_or_produce_and_apply_for_write<R>(
        &self,
        key: K,
        produce: impl FnOnce() -> V,
        apply: impl FnOnce(&mut V) -> R,
    ) -> R {
        let applied = self.find_or_try_produce_and_apply_for_write(key, || Some(produce()), apply);
        applied.expect("infallible producer declined to produce")
    }

    /// Like
    /// [`find_or_produce_and_apply_for_write`](Self::find_or_produce_and_apply_for_write),
    /// but `produce` may decline by returning `None`.
    pub fn find_or_try_produce_and_apply_for_write<R>(
        &self,
        key: K,
        produce: impl FnOnce() -> Option<V>,
        apply: impl FnOnce(&mut V) -> R,
    ) -> Option<R> {
        let hash = self.hash_key(&key);
        self.write_by_hash(hash, |map| {
            find_or_try_insert_hashed(map, hash, key, produce).map(apply)
        })
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.remove_and_copy_value(key).is_some()
    }

    /// Remove `key` given its precomputed [`hash_key`](Self::hash_key).
    pub fn remove_by_hash<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.write_by_hash(hash, |map| remove_hashed(map, hash, key).is_some())
    }

    /// Remove `key` and return its value.
    pub fn remove_and_copy_value<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.write(key, |hash, map| remove_hashed(map, hash, key))
    }

    /// Remove `key` and return its value.
    ///
    /// # Panics
    ///
    /// Panics if `key` is absent.
    pub fn find_and_remove_checked<Q>(&self, key: &Q) -> V
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.remove_and_copy_value(key)
            .expect("find_and_remove_checked called with a key not in the map")
    }

    /// Remove `key` if its entry satisfies `predicate`, returning whether it
    /// was removed.
    pub fn remove_key_if<Q>(&self, key: &Q, predicate: impl FnOnce(&K, &V) -> bool) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.write(key, |hash, map| {
            match map.raw_entry_mut().from_key_hashed_nocheck(hash, key) {
                RawEntryMut::Occupied(entry) => {
                    let remove = predicate(entry.key(), entry.get());
                    if remove {
                        entry.remove();
                    }
                    remove
                }
                RawEntryMut::Vacant(_) => false,
            }
        })
    }

    /// Remove every entry satisfying `predicate`, returning how many were
    /// removed. Buckets are locked one at a time.
    pub fn remove_if(&self, mut predicate: impl FnMut(&K, &V) -> bool) -> usize {
        let mut removed = 0;
        self.for_each_bucket_mut(|map| {
            let before = map.len();
            map.retain(|key, value| !predicate(key, value));
            removed += before - map.len();
        });
        removed
    }

    /// A copy of every key, gathered bucket by bucket.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        let mut keys = Vec::new();
        self.for_each_bucket(|map| keys.extend(map.keys().cloned()));
        keys
    }

    /// Visit every entry, share-locking one bucket at a time.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        self.for_each_bucket(|map| map.iter().for_each(|(key, value)| f(key, value)));
    }

    /// Visit every entry mutably, exclusively locking one bucket at a time.
    pub fn for_each_mut(&self, mut f: impl FnMut(&K, &mut V)) {
        self.for_each_bucket_mut(|map| map.iter_mut().for_each(|(key, value)| f(key, value)));
    }
}
