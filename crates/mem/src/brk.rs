//! Bump allocation

use std::sync::atomic::{AtomicUsize, Ordering};

/// A bump allocator over a borrowed byte range.
///
/// `alloc` advances an offset; `reset` rewinds it to zero. Previously
/// returned pointers become invalid on reset. There is no per-allocation
/// free.
///
/// The offset is atomic so a `Brk` can be shared behind `&self`; the
/// intended discipline is still one owning thread per brk.
#[derive(Debug)]
pub struct Brk {
    base: *mut u8,
    len: usize,
    off: AtomicUsize,
}

unsafe impl Send for Brk {}
unsafe impl Sync for Brk {}

impl Brk {
    /// Wrap a byte range.
    ///
    /// # Safety
    ///
    /// `base..base+len` must be valid for reads and writes for the
    /// lifetime of the brk, and must not be handed to another allocator.
    pub unsafe fn new(base: *mut u8, len: usize) -> Brk {
        Brk {
            base,
            len,
            off: AtomicUsize::new(0),
        }
    }

    /// Allocate `n` bytes, or `None` when the brk is exhausted.
    pub fn try_alloc(&self, n: usize) -> Option<*mut u8> {
        let mut cur = self.off.load(Ordering::Relaxed);
        loop {
            if cur + n > self.len {
                return None;
            }
            match self
                .off
                .compare_exchange_weak(cur, cur + n, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Some(unsafe { self.base.add(cur) }),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Allocate `n` bytes; exhaustion is fatal.
    ///
    /// Arena sizes are configured up front from workload parameters, so
    /// running out indicates a sizing bug rather than load.
    pub fn alloc(&self, n: usize) -> *mut u8 {
        match self.try_alloc(n) {
            Some(p) => p,
            None => {
                tracing::error!(
                    requested = n,
                    used = self.used(),
                    capacity = self.len,
                    "bump arena exhausted"
                );
                std::process::abort();
            }
        }
    }

    /// Whether `n` more bytes fit.
    pub fn check(&self, n: usize) -> bool {
        self.off.load(Ordering::Relaxed) + n <= self.len
    }

    /// Bytes handed out since the last reset.
    pub fn used(&self) -> usize {
        self.off.load(Ordering::Relaxed)
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Rewind to empty. All previously returned pointers are invalidated.
    pub fn reset(&self) {
        self.off.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn test_alloc_advances() {
        let mut buf = backing(64);
        let brk = unsafe { Brk::new(buf.as_mut_ptr(), buf.len()) };
        let a = brk.alloc(16);
        let b = brk.alloc(16);
        assert_eq!(unsafe { a.add(16) }, b);
        assert_eq!(brk.used(), 32);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut buf = backing(16);
        let brk = unsafe { Brk::new(buf.as_mut_ptr(), buf.len()) };
        assert!(brk.try_alloc(8).is_some());
        assert!(brk.try_alloc(16).is_none());
        assert!(brk.check(8));
        assert!(!brk.check(9));
    }

    #[test]
    fn test_reset_rewinds() {
        let mut buf = backing(16);
        let brk = unsafe { Brk::new(buf.as_mut_ptr(), buf.len()) };
        let a = brk.alloc(16);
        brk.reset();
        let b = brk.alloc(16);
        assert_eq!(a, b);
    }
}
