//! Phase completion counting

use std::sync::atomic::{AtomicI64, Ordering};

/// Countdown with a callback observed on every decrement.
///
/// The epoch controller arms the counter with the number of expected
/// completions for a phase; workers and the dispatcher decrement it
/// (possibly in batches) and the callback fires with the remaining count.
/// Reaching zero is the phase barrier. Going below zero means someone
/// completed work that was never armed, which is unrecoverable.
pub struct CompletionCounter {
    count: AtomicI64,
    callback: Box<dyn Fn(u64) + Send + Sync>,
}

impl CompletionCounter {
    /// Create a counter at `count` with `callback` invoked on every
    /// `complete` with the remaining count.
    pub fn new(count: u64, callback: impl Fn(u64) + Send + Sync + 'static) -> CompletionCounter {
        CompletionCounter {
            count: AtomicI64::new(count as i64),
            callback: Box::new(callback),
        }
    }

    /// Arm `inc` more expected completions.
    pub fn increment(&self, inc: u64) {
        self.count.fetch_add(inc as i64, Ordering::SeqCst);
    }

    /// Record `dec` completions.
    pub fn complete(&self, dec: u64) {
        let cnt = self.count.fetch_sub(dec as i64, Ordering::SeqCst) - dec as i64;
        if cnt < 0 {
            tracing::error!(cnt, "completion counter underflow");
            std::process::abort();
        }
        (self.callback)(cnt as u64);
    }

    /// Completions still outstanding.
    pub fn left_over(&self) -> u64 {
        self.count.load(Ordering::SeqCst).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn test_reaches_zero_once() {
        let zeros = Arc::new(AtomicU64::new(0));
        let z = Arc::clone(&zeros);
        let counter = CompletionCounter::new(3, move |cnt| {
            if cnt == 0 {
                z.fetch_add(1, Ordering::SeqCst);
            }
        });
        counter.complete(1);
        counter.complete(2);
        assert_eq!(zeros.load(Ordering::SeqCst), 1);
        assert_eq!(counter.left_over(), 0);
    }

    #[test]
    fn test_increment_rearms() {
        let counter = CompletionCounter::new(0, |_| {});
        counter.increment(5);
        counter.complete(5);
        assert_eq!(counter.left_over(), 0);
    }
}
