//! Per-thread promise arena

use crate::{Brk, Region};
use margay_core::CACHE_LINE;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Size of the mini tier, refilled from the large tier.
const MINI_SIZE: usize = 4 * CACHE_LINE;

/// Two-tier bump arena serving one worker thread.
///
/// Sub-cache-line requests come out of a 4-cache-line mini brk so that
/// unrelated small captures never share a line boundary with large
/// allocations; everything else is rounded up to a cache-line multiple and
/// served from the large region-backed brk. `reset` rewinds both tiers at
/// a phase boundary.
///
/// The arena is owned by a single worker thread; the atomics exist only to
/// let it live behind `&self` in shared runtime state.
#[derive(Debug)]
pub struct PromiseArena {
    _region: Region,
    large: Brk,
    mini_base: AtomicPtr<u8>,
    mini_off: AtomicUsize,
}

impl PromiseArena {
    /// Allocate a `len`-byte arena on `numa_node`.
    pub fn new(len: usize, numa_node: usize) -> PromiseArena {
        let region = Region::numa(len, numa_node);
        let large = unsafe { Brk::new(region.base(), region.len()) };
        let arena = PromiseArena {
            _region: region,
            large,
            mini_base: AtomicPtr::new(std::ptr::null_mut()),
            mini_off: AtomicUsize::new(MINI_SIZE),
        };
        arena.refill_mini();
        arena
    }

    fn refill_mini(&self) {
        let p = self.large.alloc(MINI_SIZE);
        self.mini_base.store(p, Ordering::Relaxed);
        self.mini_off.store(0, Ordering::Relaxed);
    }

    /// Allocate `n` bytes. Exhaustion of the backing region is fatal.
    pub fn alloc(&self, n: usize) -> *mut u8 {
        if n < CACHE_LINE {
            let off = self.mini_off.load(Ordering::Relaxed);
            if off + n > MINI_SIZE {
                self.refill_mini();
                return self.alloc(n);
            }
            self.mini_off.store(off + n, Ordering::Relaxed);
            unsafe { self.mini_base.load(Ordering::Relaxed).add(off) }
        } else {
            let rounded = (n + CACHE_LINE - 1) & !(CACHE_LINE - 1);
            self.large.alloc(rounded)
        }
    }

    /// Copy `bytes` into the arena and return the stable slice.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> &'static [u8] {
        if bytes.is_empty() {
            return &[];
        }
        let p = self.alloc(bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len());
            std::slice::from_raw_parts(p, bytes.len())
        }
    }

    /// Bytes handed out of the large tier since the last reset.
    pub fn used(&self) -> usize {
        self.large.used()
    }

    /// Rewind both tiers. All previously returned pointers and slices are
    /// invalidated.
    pub fn reset(&self) {
        self.large.reset();
        self.refill_mini();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_allocations_stay_in_mini() {
        let arena = PromiseArena::new(1 << 16, 0);
        let used_before = arena.used();
        let a = arena.alloc(8);
        let b = arena.alloc(8);
        // Consecutive small allocations pack into the same mini brk.
        assert_eq!(unsafe { a.add(8) }, b);
        assert_eq!(arena.used(), used_before);
    }

    #[test]
    fn test_large_allocation_is_line_rounded() {
        let arena = PromiseArena::new(1 << 16, 0);
        let used_before = arena.used();
        let _ = arena.alloc(CACHE_LINE + 1);
        assert_eq!(arena.used() - used_before, 2 * CACHE_LINE);
    }

    #[test]
    fn test_mini_refills_from_large() {
        let arena = PromiseArena::new(1 << 16, 0);
        let used_before = arena.used();
        for _ in 0..(MINI_SIZE / 8) + 1 {
            let _ = arena.alloc(8);
        }
        assert_eq!(arena.used() - used_before, MINI_SIZE);
    }

    #[test]
    fn test_reset_rewinds_everything() {
        let arena = PromiseArena::new(1 << 16, 0);
        let _ = arena.alloc_bytes(&[1, 2, 3, 4]);
        let _ = arena.alloc(256);
        arena.reset();
        assert_eq!(arena.used(), MINI_SIZE);
    }
}
