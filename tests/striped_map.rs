use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use stripesync::{LockPolicy, SharedMutexPolicy, StripedMap, SystemRwLockPolicy};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const HOT_KEYS: u64 = 64;

/// Mixed random traffic from several threads. Each thread owns a private key
/// range whose final contents it can predict exactly, and all threads bump
/// counters on a small set of shared hot keys.
fn mixed_traffic<P>(threads: usize, iters: usize)
where
    P: LockPolicy + 'static,
    P::Mutex: Send + Sync,
{
    init_logging();

    let map: Arc<StripedMap<16, u64, u64, P>> = Arc::new(StripedMap::new());
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = map.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let own_base = 1_000_000 * (t as u64 + 1);
                let mut expected = HashMap::new();
                let mut bumps = 0u64;

                barrier.wait();
                for i in 0..iters {
                    let own_key = own_base + rng.gen_range(0..128);
                    match rng.gen_range(0..6) {
                        0 => {
                            map.add(own_key, i as u64);
                            expected.insert(own_key, i as u64);
                        }
                        1 => {
                            assert_eq!(map.remove(&own_key), expected.remove(&own_key).is_some());
                        }
                        2 => {
                            assert_eq!(map.find(&own_key), expected.get(&own_key).copied());
                        }
                        3 => {
                            let hot = rng.gen_range(0..HOT_KEYS);
                            map.find_or_produce_and_apply_for_write(hot, || 0, |count| *count += 1);
                            bumps += 1;
                        }
                        4 => {
                            let hot = rng.gen_range(0..HOT_KEYS);
                            let _ = map.find_and_apply(&hot, |count| *count);
                        }
                        _ => {
                            let produced = map.find_or_produce(own_key, || i as u64);
                            assert_eq!(produced, *expected.entry(own_key).or_insert(i as u64));
                        }
                    }
                }

                (own_base, expected, bumps)
            })
        })
        .collect();

    let mut total_bumps = 0;
    for handle in handles {
        let (own_base, expected, bumps) = handle.join().unwrap();
        total_bumps += bumps;
        for key in own_base..own_base + 128 {
            assert_eq!(map.find(&key), expected.get(&key).copied());
        }
    }

    let mut counted = 0;
    map.for_each(|&key, &value| {
        if key < HOT_KEYS {
            counted += value;
        }
    });
    assert_eq!(counted, total_bumps);
}

#[test]
fn mixed_traffic_system_rwlock() {
    mixed_traffic::<SystemRwLockPolicy>(8, 20_000);
}

#[test]
fn mixed_traffic_shared_mutex() {
    mixed_traffic::<SharedMutexPolicy>(8, 20_000);
}

/// Hammers a single bucket so every operation contends and the lock spends
/// most of its time on the parking paths.
#[test]
fn single_bucket_contention_shared_mutex() {
    init_logging();

    const THREADS: usize = 8;
    const ITERS: usize = 5_000;

    let map: Arc<StripedMap<1, usize, usize, SharedMutexPolicy>> = Arc::new(StripedMap::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = map.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..ITERS {
                    if (i + t) % 4 == 0 {
                        map.find_or_produce_and_apply_for_write(0, || 0, |n| *n += 1);
                    } else {
                        let _ = map.contains(&0);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let expected = (0..THREADS)
        .map(|t| (0..ITERS).filter(|i| (i + t) % 4 == 0).count())
        .sum::<usize>();
    assert_eq!(map.find_ref(&0), expected);
}

#[test]
fn every_missing_key_is_produced_once() {
    init_logging();

    const THREADS: usize = 8;
    const KEYS: usize = 256;

    let map: Arc<StripedMap<8, usize, usize, SharedMutexPolicy>> = Arc::new(StripedMap::new());
    let produced = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let map = map.clone();
            let produced = produced.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for key in 0..KEYS {
                    let value = map.find_or_produce_and_apply(
                        key,
                        || {
                            produced.fetch_add(1, Ordering::Relaxed);
                            key * 2
                        },
                        |&value| value,
                    );
                    assert_eq!(value, key * 2);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(produced.load(Ordering::Relaxed), KEYS);
    assert_eq!(map.len(), KEYS);
}

#[derive(Clone, Debug)]
enum Op {
    Add(u8, u32),
    Remove(u8),
    RemoveAndCopy(u8),
    FindOrProduce(u8, u32),
    RemoveKeyIf(u8, u32),
    RemoveIfBelow(u32),
    Compact,
    Reset,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (any::<u8>(), any::<u32>()).prop_map(|(k, v)| Op::Add(k, v)),
        2 => any::<u8>().prop_map(Op::Remove),
        1 => any::<u8>().prop_map(Op::RemoveAndCopy),
        2 => (any::<u8>(), any::<u32>()).prop_map(|(k, v)| Op::FindOrProduce(k, v)),
        1 => (any::<u8>(), any::<u32>()).prop_map(|(k, v)| Op::RemoveKeyIf(k, v)),
        1 => any::<u32>().prop_map(Op::RemoveIfBelow),
        1 => Just(Op::Compact),
        1 => Just(Op::Reset),
    ]
}

proptest! {
    #[test]
    fn behaves_like_a_hash_map(ops in proptest::collection::vec(op(), 1..200)) {
        let map: StripedMap<4, u8, u32, SharedMutexPolicy> = StripedMap::new();
        let mut model = HashMap::new();

        for op in ops {
            match op {
                Op::Add(k, v) => {
                    prop_assert_eq!(map.add(k, v), model.insert(k, v));
                }
                Op::Remove(k) => {
                    prop_assert_eq!(map.remove(&k), model.remove(&k).is_some());
                }
                Op::RemoveAndCopy(k) => {
                    prop_assert_eq!(map.remove_and_copy_value(&k), model.remove(&k));
                }
                Op::FindOrProduce(k, v) => {
                    prop_assert_eq!(map.find_or_produce(k, || v), *model.entry(k).or_insert(v));
                }
                Op::RemoveKeyIf(k, v) => {
                    let removed = map.remove_key_if(&k, |_, &stored| stored < v);
                    let expected = model.get(&k).map_or(false, |&stored| stored < v);
                    if expected {
                        model.remove(&k);
                    }
                    prop_assert_eq!(removed, expected);
                }
                Op::RemoveIfBelow(limit) => {
                    let before = model.len();
                    model.retain(|_, stored| *stored >= limit);
                    prop_assert_eq!(map.remove_if(|_, &stored| stored < limit), before - model.len());
                }
                Op::Compact => map.compact(),
                Op::Reset => {
                    map.reset();
                    model.clear();
                }
            }

            prop_assert_eq!(map.len(), model.len());
        }

        for (k, v) in &model {
            prop_assert_eq!(map.find_ref(k), *v);
        }
        let mut keys = map.keys();
        keys.sort_unstable();
        let mut expected: Vec<_> = model.keys().copied().collect();
        expected.sort_unstable();
        prop_assert_eq!(keys, expected);
    }
}
