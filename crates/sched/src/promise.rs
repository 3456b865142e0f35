//! Promise graph

use margay_mem::PromiseArena;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::exec::RoutineFn;

/// Affinity sentinel: the routine may run on any core; the phase driver
/// assigns a default before completion.
pub const ANY_CORE: u32 = u32::MAX;

/// Input/output values flowing between continuation fragments.
pub type Value = Arc<[u8]>;

/// Encode a capture context into the promise arena.
///
/// The bytes are copied out of the caller's stack; the returned slice
/// lives until the arena resets at the phase boundary, by which point
/// every routine of the phase has run.
pub fn encode_capture<T: Serialize>(arena: &PromiseArena, capture: &T) -> &'static [u8] {
    let bytes = bincode::serialize(capture).expect("capture context serializes");
    arena.alloc_bytes(&bytes)
}

/// Decode a routine's capture context; the first action of every
/// routine body.
pub fn decode_capture<T: DeserializeOwned>(bytes: &[u8]) -> T {
    bincode::deserialize(bytes).expect("capture context deserializes")
}

/// A continuation fragment: one schedulable piece of a transaction.
pub struct PromiseRoutine {
    /// The body. Its first action is decoding `capture`.
    pub callback: RoutineFn,
    /// Captured context, owned by the promise arena.
    pub capture: &'static [u8],
    /// Placement priority within a core's keyed queue; the serial id by
    /// default, zero for urgent work.
    pub sched_key: u64,
    /// Target core, or [`ANY_CORE`].
    affinity: AtomicU32,
    /// Depth in the continuation graph, for diagnostics.
    pub level: u8,
    /// Completed with this routine's output after it runs.
    pub next: Option<Arc<Promise>>,
}

impl PromiseRoutine {
    /// A standalone routine with no continuation, for work issued
    /// directly into the dispatcher rather than through a promise graph.
    pub fn standalone(
        callback: RoutineFn,
        capture: &'static [u8],
        sched_key: u64,
        affinity: u32,
    ) -> PromiseRoutine {
        PromiseRoutine {
            callback,
            capture,
            sched_key,
            affinity: AtomicU32::new(affinity),
            level: 0,
            next: None,
        }
    }

    /// The routine's target core, if assigned.
    pub fn affinity(&self) -> u32 {
        self.affinity.load(Ordering::Relaxed)
    }

    /// Assign `core` if no affinity was routed explicitly.
    pub fn assign_default_affinity(&self, core: u32) {
        let _ = self
            .affinity
            .compare_exchange(ANY_CORE, core, Ordering::Relaxed, Ordering::Relaxed);
    }
}

/// A fan-out point in a transaction's continuation graph.
///
/// `then` appends successor routines; `complete` delivers the input value
/// to every routine and hands them to the dispatcher. The graph is a
/// forest rooted per transaction and is rebuilt from scratch each phase.
#[derive(Default)]
pub struct Promise {
    routines: Mutex<SmallVec<[Arc<PromiseRoutine>; 2]>>,
}

impl Promise {
    /// A fresh promise with no successors.
    pub fn new() -> Arc<Promise> {
        Arc::new(Promise::default())
    }

    /// Append a successor routine and return its continuation promise.
    pub fn then(
        &self,
        capture: &'static [u8],
        sched_key: u64,
        affinity: u32,
        level: u8,
        callback: RoutineFn,
    ) -> Arc<Promise> {
        let next = Promise::new();
        self.routines.lock().push(Arc::new(PromiseRoutine {
            callback,
            capture,
            sched_key,
            affinity: AtomicU32::new(affinity),
            level,
            next: Some(Arc::clone(&next)),
        }));
        next
    }

    /// Number of directly attached routines.
    pub fn nr_routines(&self) -> usize {
        self.routines.lock().len()
    }

    /// Assign `core` to every transitively reachable routine that was
    /// left unrouted.
    pub fn assign_default_affinity(&self, core: u32) {
        for routine in self.routines.lock().iter() {
            routine.assign_default_affinity(core);
            if let Some(next) = &routine.next {
                next.assign_default_affinity(core);
            }
        }
    }

    /// Detach the attached routines for delivery.
    pub fn take_routines(&self) -> SmallVec<[Arc<PromiseRoutine>; 2]> {
        std::mem::take(&mut *self.routines.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn nop(_ctx: &mut crate::RoutineCtx<'_>) {}

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ctx {
        row: u64,
        amount: i32,
    }

    #[test]
    fn test_capture_roundtrip() {
        let arena = PromiseArena::new(1 << 16, 0);
        let bytes = encode_capture(&arena, &Ctx { row: 7, amount: -3 });
        let decoded: Ctx = decode_capture(bytes);
        assert_eq!(decoded, Ctx { row: 7, amount: -3 });
    }

    #[test]
    fn test_then_fans_out() {
        let root = Promise::new();
        let _a = root.then(&[], 1, ANY_CORE, 0, nop);
        let _b = root.then(&[], 2, 1, 0, nop);
        assert_eq!(root.nr_routines(), 2);
    }

    #[test]
    fn test_default_affinity_only_fills_any() {
        let root = Promise::new();
        root.then(&[], 1, ANY_CORE, 0, nop);
        root.then(&[], 2, 3, 0, nop);
        root.assign_default_affinity(1);
        let routines = root.take_routines();
        assert_eq!(routines[0].affinity(), 1);
        assert_eq!(routines[1].affinity(), 3);
    }
}
