//! Per-core dispatch queues

use crate::promise::{PromiseRoutine, Value};
use margay_sync::{CompletionCounter, SpinnerService};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::UnsafeCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A routine with its delivered input, as queued on a core.
#[derive(Clone)]
pub struct Routine {
    /// The continuation fragment.
    pub inner: Arc<PromiseRoutine>,
    /// The value `complete` delivered to it.
    pub input: Value,
}

impl Routine {
    /// The routine's scheduling key.
    pub fn sched_key(&self) -> u64 {
        self.inner.sched_key
    }
}

/// Dispatcher sizing.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Ring and heap capacity per core. Exceeding it is fatal: queue
    /// sizes are derived from the workload parameters up front.
    pub max_items_per_core: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            max_items_per_core: 1 << 16,
        }
    }
}

/// Fixed-capacity ring. Writers serialize on the core lock; the owning
/// core consumes without the lock, synchronizing on `start`/`end`.
struct Ring {
    buf: Box<[UnsafeCell<Option<Routine>>]>,
    start: AtomicUsize,
    end: AtomicUsize,
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    fn new(cap: usize) -> Ring {
        Ring {
            buf: (0..cap).map(|_| UnsafeCell::new(None)).collect(),
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
        }
    }

    fn push(&self, r: Routine) {
        let end = self.end.load(Ordering::Relaxed);
        let start = self.start.load(Ordering::Acquire);
        if end - start >= self.buf.len() {
            tracing::error!(cap = self.buf.len(), "dispatch ring overflow");
            std::process::abort();
        }
        unsafe {
            *self.buf[end % self.buf.len()].get() = Some(r);
        }
        self.end.store(end + 1, Ordering::Release);
    }

    fn front(&self) -> Option<Routine> {
        let start = self.start.load(Ordering::Relaxed);
        if start >= self.end.load(Ordering::Acquire) {
            return None;
        }
        unsafe { (*self.buf[start % self.buf.len()].get()).clone() }
    }

    fn pop(&self) -> Option<Routine> {
        let start = self.start.load(Ordering::Relaxed);
        if start >= self.end.load(Ordering::Acquire) {
            return None;
        }
        let item = unsafe { (*self.buf[start % self.buf.len()].get()).take() };
        self.start.store(start + 1, Ordering::Release);
        item
    }

    fn clear(&self) {
        while self.pop().is_some() {}
        self.start.store(0, Ordering::Relaxed);
        self.end.store(0, Ordering::Relaxed);
    }
}

/// Min-heap over scheduling keys with a FIFO value list per key and a
/// hash side-index for O(1) bucket lookup. Heap entries are removed
/// lazily when their bucket has drained.
#[derive(Default)]
struct KeyedHeap {
    heap: BinaryHeap<Reverse<u64>>,
    buckets: FxHashMap<u64, VecDeque<Routine>>,
}

impl KeyedHeap {
    fn add(&mut self, r: Routine) {
        let key = r.sched_key();
        let bucket = self.buckets.entry(key).or_default();
        if bucket.is_empty() {
            self.heap.push(Reverse(key));
        }
        bucket.push_back(r);
    }

    fn min_key(&mut self) -> Option<u64> {
        while let Some(&Reverse(key)) = self.heap.peek() {
            if self.buckets.get(&key).is_some_and(|b| !b.is_empty()) {
                return Some(key);
            }
            self.heap.pop();
            self.buckets.remove(&key);
        }
        None
    }

    fn front(&mut self) -> Option<&Routine> {
        let key = self.min_key()?;
        self.buckets.get(&key).and_then(|b| b.front())
    }

    fn pop_front(&mut self) -> Option<Routine> {
        let key = self.min_key()?;
        let bucket = self.buckets.get_mut(&key)?;
        let item = bucket.pop_front();
        if bucket.is_empty() {
            self.heap.pop();
            self.buckets.remove(&key);
        }
        item
    }

    fn is_empty(&mut self) -> bool {
        self.min_key().is_none()
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.buckets.clear();
    }
}

struct CoreQueue {
    lock: Mutex<()>,
    zq: Ring,
    pending: Ring,
    heap: Mutex<KeyedHeap>,
    running: AtomicBool,
    current: Mutex<Option<Routine>>,
    completed: AtomicU64,
}

impl CoreQueue {
    fn new(cap: usize) -> CoreQueue {
        CoreQueue {
            lock: Mutex::new(()),
            zq: Ring::new(cap),
            pending: Ring::new(cap),
            heap: Mutex::new(KeyedHeap::default()),
            running: AtomicBool::new(false),
            current: Mutex::new(None),
            completed: AtomicU64::new(0),
        }
    }
}

/// The per-core dispatch service.
///
/// Placement: `add` splits items by key. Zero-key goes into the urgent
/// FIFO, keyed work into the pending ring; the heap is only built by the
/// consumer, so `add` never touches it. Extraction: zero-key FIFO first,
/// then ascending key with FIFO tie-break. An idle core flushes its local
/// completion tally and any bubbles into the global counter.
pub struct Dispatcher {
    queues: Vec<CoreQueue>,
    bubbles: AtomicU64,
    spinner: Arc<SpinnerService>,
    completion: Arc<CompletionCounter>,
}

impl Dispatcher {
    /// Build queues for `nr_cores` cores.
    pub fn new(
        nr_cores: usize,
        config: DispatchConfig,
        spinner: Arc<SpinnerService>,
        completion: Arc<CompletionCounter>,
    ) -> Dispatcher {
        Dispatcher {
            queues: (0..nr_cores)
                .map(|_| CoreQueue::new(config.max_items_per_core))
                .collect(),
            bubbles: AtomicU64::new(0),
            spinner,
            completion,
        }
    }

    /// The global completion counter the idle path flushes into.
    pub fn completion(&self) -> &CompletionCounter {
        &self.completion
    }

    /// Queue `routines` on `core` and nudge its spinner slot.
    pub fn add(&self, core: usize, routines: impl IntoIterator<Item = Routine>) {
        let q = &self.queues[core];
        let mut nonempty = false;
        {
            let _guard = q.lock.lock();
            for r in routines {
                nonempty = true;
                if r.sched_key() == 0 {
                    q.zq.push(r);
                } else {
                    q.pending.push(r);
                }
            }
        }
        if nonempty {
            self.spinner.notify(1 << core);
        }
    }

    fn process_pending(&self, core: usize) {
        let q = &self.queues[core];
        let mut heap = q.heap.lock();
        while let Some(r) = q.pending.pop() {
            heap.add(r);
        }
    }

    /// Offer the highest-priority item on `core` to `should_pop`; pop it
    /// on acceptance. Returns `None` when the core has nothing runnable,
    /// after flushing local completions and bubbles.
    pub fn peek(
        &self,
        core: usize,
        mut should_pop: impl FnMut(&Routine) -> bool,
    ) -> Option<Routine> {
        let q = &self.queues[core];

        if let Some(r) = q.zq.front() {
            q.running.store(true, Ordering::Release);
            if should_pop(&r) {
                q.zq.pop();
                *q.current.lock() = Some(r.clone());
                return Some(r);
            }
            return None;
        }

        self.process_pending(core);

        let mut heap = q.heap.lock();
        if let Some(r) = heap.front().cloned() {
            q.running.store(true, Ordering::Relaxed);
            if should_pop(&r) {
                heap.pop_front();
                drop(heap);
                *q.current.lock() = Some(r.clone());
                return Some(r);
            }
            return None;
        }
        drop(heap);

        q.running.store(false, Ordering::Relaxed);

        // Per-core counters only race with Add, never with each other;
        // the flush itself needs no lock.
        let n = q.completed.swap(0, Ordering::AcqRel);
        let bubbles = self.bubbles.swap(0, Ordering::AcqRel);
        if n + bubbles > 0 {
            self.completion.complete(n + bubbles);
        }
        None
    }

    /// Re-enqueue the routine currently running on `core` if more urgent
    /// work is present (always when `force`). Returns whether the caller
    /// should pick a new routine.
    pub fn preempt(&self, core: usize, force: bool) -> bool {
        self.process_pending(core);

        let q = &self.queues[core];
        let _guard = q.lock.lock();

        let Some(cur) = q.current.lock().clone() else {
            return false;
        };
        let key = cur.sched_key();

        if !force && q.zq.front().is_none() {
            let mut heap = q.heap.lock();
            match heap.min_key() {
                None => return false,
                Some(min) if key < min => return false,
                Some(_) => {}
            }
        }

        if key == 0 {
            q.zq.push(cur);
        } else {
            q.heap.lock().add(cur);
        }
        q.running.store(false, Ordering::Relaxed);
        true
    }

    /// Record one routine completion on `core`; flushed lazily.
    pub fn complete(&self, core: usize) {
        self.queues[core].completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completion that will never arrive: the issuer pre-counted
    /// work and then discovered there is none on this core.
    pub fn add_bubble(&self) {
        self.bubbles.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether `core` has any queued work.
    pub fn is_idle(&self, core: usize) -> bool {
        let q = &self.queues[core];
        q.zq.front().is_none() && q.pending.front().is_none() && q.heap.lock().is_empty()
    }

    /// Drop all queued work on every core. Runs between phases.
    pub fn reset(&self) {
        for q in &self.queues {
            let _guard = q.lock.lock();
            q.zq.clear();
            q.pending.clear();
            q.heap.lock().clear();
            *q.current.lock() = None;
            q.completed.store(0, Ordering::Relaxed);
        }
        self.bubbles.store(0, Ordering::Relaxed);
    }

    /// Number of cores served.
    pub fn nr_cores(&self) -> usize {
        self.queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::ANY_CORE;
    use crate::{empty_value, Promise};

    fn nop(_ctx: &mut crate::RoutineCtx<'_>) {}

    fn routine(key: u64) -> Routine {
        let root = Promise::new();
        root.then(&[], key, ANY_CORE, 0, nop);
        let inner = root.take_routines().into_iter().next().unwrap();
        Routine {
            inner,
            input: empty_value(),
        }
    }

    fn dispatcher(cores: usize) -> Dispatcher {
        Dispatcher::new(
            cores,
            DispatchConfig::default(),
            Arc::new(SpinnerService::new(cores)),
            Arc::new(CompletionCounter::new(0, |_| {})),
        )
    }

    #[test]
    fn test_zero_key_extracted_before_keyed() {
        let d = dispatcher(1);
        d.add(0, [routine(0), routine(5), routine(0), routine(3)]);

        let order: Vec<u64> = std::iter::from_fn(|| d.peek(0, |_| true).map(|r| r.sched_key()))
            .collect();
        assert_eq!(order, vec![0, 0, 3, 5]);
    }

    #[test]
    fn test_fifo_within_key() {
        let d = dispatcher(1);
        let a = routine(7);
        let b = routine(7);
        let first = Arc::as_ptr(&a.inner);
        d.add(0, [a, b]);
        let got = d.peek(0, |_| true).unwrap();
        assert_eq!(Arc::as_ptr(&got.inner), first);
    }

    #[test]
    fn test_declined_offer_stays_queued() {
        let d = dispatcher(1);
        d.add(0, [routine(3)]);
        assert!(d.peek(0, |_| false).is_none());
        assert!(d.peek(0, |_| true).is_some());
    }

    #[test]
    fn test_idle_flush_reports_completions_and_bubbles() {
        let completion = Arc::new(CompletionCounter::new(3, |_| {}));
        let d = Dispatcher::new(
            1,
            DispatchConfig::default(),
            Arc::new(SpinnerService::new(1)),
            Arc::clone(&completion),
        );
        d.complete(0);
        d.complete(0);
        d.add_bubble();
        assert!(d.peek(0, |_| true).is_none());
        assert_eq!(completion.left_over(), 0);
    }

    #[test]
    fn test_preempt_requeues_for_more_urgent_work() {
        let d = dispatcher(1);
        d.add(0, [routine(5)]);
        let cur = d.peek(0, |_| true).unwrap();
        assert_eq!(cur.sched_key(), 5);

        // Nothing more urgent: keep running.
        assert!(!d.preempt(0, false));

        // A smaller key arrives: yield, and extraction order is the new
        // item first, the preempted one after.
        d.add(0, [routine(2)]);
        assert!(d.preempt(0, false));
        assert_eq!(d.peek(0, |_| true).unwrap().sched_key(), 2);
        assert_eq!(d.peek(0, |_| true).unwrap().sched_key(), 5);
    }

    #[test]
    fn test_forced_preempt_always_yields() {
        let d = dispatcher(1);
        d.add(0, [routine(5)]);
        let _ = d.peek(0, |_| true).unwrap();
        assert!(d.preempt(0, true));
        assert_eq!(d.peek(0, |_| true).unwrap().sched_key(), 5);
    }
}
