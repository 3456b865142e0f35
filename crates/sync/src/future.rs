//! One-shot value handoff

use crate::SpinnerService;
use margay_core::{object, Sid};
use std::sync::atomic::{AtomicU64, Ordering};

/// A one-shot 64-bit value passed between pieces of a partitioned plan.
///
/// The slot uses the same pending-word encoding as a version slot, so a
/// waiter parks on its core's spinner slot exactly as a pending read
/// does. One producer, at most one waiter per core.
pub struct FutureValue {
    word: AtomicU64,
}

impl Default for FutureValue {
    fn default() -> Self {
        Self::new()
    }
}

impl FutureValue {
    /// An unsignalled future.
    pub fn new() -> FutureValue {
        FutureValue {
            word: AtomicU64::new(object::PENDING_FRESH),
        }
    }

    /// Whether the value has been produced.
    pub fn has_value(&self) -> bool {
        !object::is_pending(self.word.load(Ordering::Acquire))
    }

    /// Produce the value and wake any waiters.
    pub fn signal(&self, spinner: &SpinnerService, value: u64) {
        spinner.offer_data(&self.word, value);
    }

    /// Block until the value is produced.
    pub fn wait(&self, spinner: &SpinnerService, core: usize, relief: impl FnMut()) -> u64 {
        spinner.wait_for_data(&self.word, core, Sid::ZERO, Sid::ZERO, relief)
    }
}
