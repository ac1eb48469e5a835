use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::thread;
use stripesync::{LockPolicy, SharedMutexPolicy, StripedMap, SystemRwLockPolicy};

const OPS_PER_THREAD: usize = 10_000;
const KEY_SPACE: u64 = 4096;

fn keys(seed: u64) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..OPS_PER_THREAD)
        .map(|_| rng.gen_range(0..KEY_SPACE))
        .collect()
}

/// `threads` threads each run a read-heavy mix (one write in `write_every`
/// operations) over a shared map.
fn run<P>(threads: usize, write_every: usize, keys: &[Vec<u64>])
where
    P: LockPolicy,
    P::Mutex: Send + Sync,
{
    let map: StripedMap<64, u64, u64, P> = StripedMap::new();
    thread::scope(|s| {
        for keys in &keys[..threads] {
            let map = &map;
            s.spawn(move || {
                for (i, &key) in keys.iter().enumerate() {
                    if i % write_every == 0 {
                        map.find_or_produce_and_apply_for_write(key, || 0, |n| *n += 1);
                    } else {
                        black_box(map.find_and_apply(&key, |&n| n));
                    }
                }
            });
        }
    });
}

fn lock_policies(c: &mut Criterion) {
    let max_threads = thread::available_parallelism().map_or(4, |n| n.get());
    let keys: Vec<_> = (0..max_threads as u64).map(keys).collect();

    for write_every in [2, 16] {
        let mut group = c.benchmark_group(format!("striped_map/1_write_per_{write_every}"));
        let mut thread_counts = vec![1, max_threads / 2, max_threads];
        thread_counts.retain(|&t| t > 0);
        thread_counts.dedup();
        for threads in thread_counts {
            group.bench_with_input(BenchmarkId::new("shared_mutex", threads), &threads, |b, &t| {
                b.iter(|| run::<SharedMutexPolicy>(t, write_every, &keys))
            });
            group.bench_with_input(BenchmarkId::new("system_rwlock", threads), &threads, |b, &t| {
                b.iter(|| run::<SystemRwLockPolicy>(t, write_every, &keys))
            });
        }
        group.finish();
    }
}

criterion_group!(benches, lock_policies);
criterion_main!(benches);
