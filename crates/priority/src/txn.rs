//! Priority transactions and the admission protocol

use crate::service::PriorityTxnService;
use margay_core::{contract_abort, Sid};
use margay_index::Table;
use margay_mem::PromiseArena;
use margay_sched::{empty_value, Executor, PromiseRoutine, Routine, RoutineCtx, RoutineFn};
use margay_storage::{ReadResult, VHandle};
use margay_sync::SpinnerService;
use std::any::Any;
use std::sync::atomic::{AtomicI64, AtomicU64};
use std::sync::Arc;

/// A priority transaction's body: registers its working set, drives
/// admission, and issues execution pieces. Returns the commit outcome.
pub type PriorityFn = fn(&mut PriorityTxn, &PriorityCtx<'_>) -> bool;

/// Services available to a priority transaction body.
pub struct PriorityCtx<'a> {
    /// The core the body runs on.
    pub core: usize,
    /// Routine execution and dispatch.
    pub exec: &'a Executor,
    /// The admission service.
    pub service: &'a PriorityTxnService,
    /// The core's promise arena, for piece captures.
    pub arena: &'a PromiseArena,
}

/// An out-of-batch transaction admitted into a reserved serial-id slot.
pub struct PriorityTxn {
    /// The epoch this transaction belongs to.
    pub epoch: u64,
    /// Arrival offset from the epoch's execution start, in microseconds.
    pub delay_us: u64,
    /// The transaction may not serialize before this id.
    pub min_sid: Sid,
    /// Outstanding execution pieces, maintained by the body for latency
    /// probing.
    pub piece_count: AtomicI64,
    /// Scratch timestamp threaded between probes, in microseconds since
    /// the epoch clock.
    pub measure_us: AtomicU64,

    sid: Option<Sid>,
    initialized: bool,
    callback: PriorityFn,
    update_handles: Vec<Arc<VHandle>>,
    delete_handles: Vec<Arc<VHandle>>,
    insert_keys: Vec<(Vec<u8>, Arc<dyn Table>)>,
    insert_handles: Vec<Arc<VHandle>>,
    payload: Option<Box<dyn Any + Send + Sync>>,
}

impl PriorityTxn {
    /// A transaction scheduled `delay_us` into `epoch`, running `body`.
    pub fn new(epoch: u64, delay_us: u64, body: PriorityFn) -> PriorityTxn {
        PriorityTxn {
            epoch,
            delay_us,
            min_sid: Sid::ZERO,
            piece_count: AtomicI64::new(0),
            measure_us: AtomicU64::new(0),
            sid: None,
            initialized: false,
            callback: body,
            update_handles: Vec::new(),
            delete_handles: Vec::new(),
            insert_keys: Vec::new(),
            insert_handles: Vec::new(),
            payload: None,
        }
    }

    /// Attach a workload-specific input.
    pub fn set_payload<T: Any + Send + Sync>(&mut self, payload: T) {
        self.payload = Some(Box::new(payload));
    }

    /// The attached input.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref())
    }

    /// Run the body.
    pub fn run(&mut self, ctx: &PriorityCtx<'_>) -> bool {
        (self.callback)(self, ctx)
    }

    /// The admitted serial id.
    ///
    /// Only valid after a successful `init`.
    pub fn serial_id(&self) -> Sid {
        match self.sid {
            Some(sid) => sid,
            None => contract_abort!("serial id requested before admission"),
        }
    }

    /// Register a row this transaction will update. Must precede `init`.
    pub fn register_update(&mut self, handle: Arc<VHandle>) {
        debug_assert!(!self.initialized);
        self.update_handles.push(handle);
    }

    /// Register a row this transaction will delete. Must precede `init`.
    pub fn register_delete(&mut self, handle: Arc<VHandle>) {
        debug_assert!(!self.initialized);
        self.delete_handles.push(handle);
    }

    /// Register a key this transaction will insert through `table`.
    pub fn register_insert(&mut self, key: Vec<u8>, table: Arc<dyn Table>) {
        debug_assert!(!self.initialized);
        self.insert_keys.push((key, table));
    }

    /// The row created for the `idx`-th registered insert key.
    pub fn insert_handle(&self, idx: usize) -> &Arc<VHandle> {
        &self.insert_handles[idx]
    }

    /// The `idx`-th registered update row.
    pub fn update_handle(&self, idx: usize) -> &Arc<VHandle> {
        &self.update_handles[idx]
    }

    /// Attempt admission: reserve a serial-id slot, append a pending
    /// version into every registered row, and re-check against the batch
    /// frontier after each append.
    ///
    /// On any conflict the already-appended versions are rolled back by
    /// writing the skip marker at the slot, and `false` is returned; the
    /// caller retries with a fresh serial id or gives up. On success the
    /// registered handles operate at the admitted serial id.
    pub fn init(&mut self, ctx: &PriorityCtx<'_>) -> bool {
        if self.initialized {
            return false;
        }

        // Rows are claimed in address order so that two transactions
        // touching the same rows never deadlock.
        self.update_handles.sort_by_key(|h| Arc::as_ptr(h) as usize);
        self.delete_handles.sort_by_key(|h| Arc::as_ptr(h) as usize);

        let Some(sid) = ctx.service.get_sid(self, &self.update_handles) else {
            return false;
        };
        let spinner = ctx.exec.spinner();

        let mut reverted = None;
        'admit: {
            let mut upd = 0;
            if !self.admit_set(ctx, sid, false, &mut upd) {
                reverted = Some((upd, 0, 0));
                break 'admit;
            }
            let mut del = 0;
            if !self.admit_set(ctx, sid, true, &mut del) {
                reverted = Some((self.update_handles.len(), del, 0));
                break 'admit;
            }
            let mut inserted = 0;
            for (key, table) in &self.insert_keys {
                match table.priority_insert(key, sid, ctx.core as u32) {
                    Some(handle) => {
                        self.insert_handles.push(handle);
                        inserted += 1;
                    }
                    None => {
                        reverted =
                            Some((self.update_handles.len(), self.delete_handles.len(), inserted));
                        break 'admit;
                    }
                }
            }
        }

        if let Some((upd, del, ins)) = reverted {
            self.rollback(sid, spinner, upd, del, ins);
            return false;
        }

        self.sid = Some(sid);
        self.initialized = true;
        true
    }

    /// Append into one handle set; `cnt` reports how many slots need
    /// rolling back on failure.
    fn admit_set(&self, ctx: &PriorityCtx<'_>, sid: Sid, deletes: bool, cnt: &mut usize) -> bool {
        let handles = if deletes {
            &self.delete_handles
        } else {
            &self.update_handles
        };
        let read_bit = ctx.service.read_bit();
        for (i, h) in handles.iter().enumerate() {
            if read_bit && h.check_read_bit(sid) {
                *cnt = i;
                return false;
            }
            if !h.try_append_new_version(sid) {
                *cnt = i;
                return false;
            }
            let conflicted = if read_bit {
                h.check_read_bit(sid)
            } else {
                ctx.service.max_progress_passed(sid)
            };
            if conflicted {
                *cnt = i + 1;
                return false;
            }
        }
        *cnt = handles.len();
        true
    }

    /// Write the skip marker into every slot the failed admission had
    /// already appended. A positive act: the marker keeps the version
    /// arrays sorted and tells future readers to pass over the slot.
    fn rollback(&mut self, sid: Sid, spinner: &SpinnerService, upd: usize, del: usize, ins: usize) {
        for h in &self.update_handles[..upd] {
            h.write_ignore(sid, spinner);
        }
        for h in &self.delete_handles[..del] {
            h.write_ignore(sid, spinner);
        }
        for h in self.insert_handles.drain(..).take(ins) {
            h.write_ignore(sid, spinner);
        }
    }

    /// Read `handle` as of this transaction's serial id.
    pub fn read<'r>(&self, rctx: &RoutineCtx<'_>, handle: &'r VHandle) -> ReadResult<'r> {
        if !self.initialized {
            contract_abort!("read before admission");
        }
        rctx.read_row(handle, self.serial_id(), false)
    }

    /// Publish `payload` on `handle` at this transaction's serial id.
    pub fn write(&self, rctx: &RoutineCtx<'_>, handle: &VHandle, payload: &[u8]) {
        if !self.initialized {
            contract_abort!("write before admission");
        }
        rctx.write_row(handle, self.serial_id(), Some(payload));
    }

    /// Delete through `handle` at this transaction's serial id, marking
    /// later pending versions deleted as well.
    pub fn delete(&self, rctx: &RoutineCtx<'_>, handle: &VHandle) {
        if !self.initialized {
            contract_abort!("delete before admission");
        }
        let sid = self.serial_id();
        rctx.write_row(handle, sid, None);
        handle.priority_delete(sid, rctx.executor().spinner());
    }

    /// Wrap `body` and `capture` into an execution piece at this
    /// transaction's serial id and queue it.
    ///
    /// The piece lands on the fastest core when the heuristic finds one,
    /// otherwise on the issuing core.
    pub fn issue_promise(&self, ctx: &PriorityCtx<'_>, capture: &'static [u8], body: RoutineFn) {
        let core = ctx
            .service
            .get_fastest_core()
            .unwrap_or(ctx.core)
            .min(ctx.exec.dispatcher().nr_cores() - 1);
        self.issue_promise_pinned(ctx, core, capture, body);
    }

    /// Like [`issue_promise`](Self::issue_promise), but pinned to `core`
    /// (partition-owned placement). The piece is pre-counted on the
    /// global completion counter like any other routine.
    pub fn issue_promise_pinned(
        &self,
        ctx: &PriorityCtx<'_>,
        core: usize,
        capture: &'static [u8],
        body: RoutineFn,
    ) {
        let sid = self.serial_id();
        let routine = PromiseRoutine::standalone(body, capture, sid.raw(), core as u32);
        ctx.exec.dispatcher().completion().increment(1);
        ctx.exec.dispatcher().add(
            core,
            [Routine {
                inner: Arc::new(routine),
                input: empty_value(),
            }],
        );
    }

    /// Validate and commit. Admission already serialized the write set,
    /// so an admitted transaction always commits.
    pub fn commit(&self) -> bool {
        if !self.initialized {
            contract_abort!("commit before admission");
        }
        true
    }
}
