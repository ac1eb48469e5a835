use std::ops::Deref;

/// Pads and aligns a value to the estimated size of a cache line.
///
/// Striped map buckets sit next to each other in one array. Without padding,
/// taking the lock of one bucket would invalidate the cache line holding its
/// neighbours' locks and undo much of the point of striping.
//
// Some 64-bit architectures fetch cache lines in pairs (Intel's spatial
// prefetcher) or have 128-byte lines (ARM64 big cores), hence 128 there.
#[cfg_attr(target_arch = "s390x", repr(align(256)))]
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64"
    ),
    repr(align(128))
)]
#[cfg_attr(
    any(
        target_arch = "mips",
        target_arch = "arm",
        target_arch = "riscv32",
        target_arch = "riscv64"
    ),
    repr(align(32))
)]
#[cfg_attr(
    not(any(
        target_arch = "s390x",
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
        target_arch = "mips",
        target_arch = "arm",
        target_arch = "riscv32",
        target_arch = "riscv64",
    )),
    repr(align(64))
)]
#[derive(Default)]
pub(crate) struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::CachePadded;
    use std::mem::{align_of, size_of};

    #[test]
    fn neighbours_do_not_share_a_line() {
        let pair = [CachePadded::new(0u32), CachePadded::new(1u32)];
        let a = &*pair[0] as *const u32 as usize;
        let b = &*pair[1] as *const u32 as usize;

        assert!(align_of::<CachePadded<u32>>() >= 32);
        assert_eq!(b - a, size_of::<CachePadded<u32>>());
        assert!(b - a >= 32);
    }
}
