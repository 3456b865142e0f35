//! The multi-version row

use margay_core::{contract_abort, object, Sid};
use margay_sync::SpinnerService;
use smallvec::SmallVec;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Initial version-array capacity.
const INITIAL_CAPACITY: usize = 4;

/// One version block: a contiguous allocation holding the parallel
/// `versions` / `objects` arrays plus per-slot read marks.
///
/// Layout: `[versions: u64 × cap][objects: u64 × cap][marks: u8 × cap]`.
/// The block pointer is published with release ordering so lock-free
/// readers always observe a fully initialized block; `size` lives on the
/// handle and only ever counts slots that are initialized in the current
/// block.
struct Block {
    base: *mut u8,
    cap: usize,
}

impl Block {
    fn layout(cap: usize) -> Layout {
        Layout::from_size_align(cap * 17, 8).expect("version block layout")
    }

    fn alloc(cap: usize) -> Block {
        let base = unsafe { alloc_zeroed(Self::layout(cap)) };
        if base.is_null() {
            tracing::error!(cap, "version block allocation failed");
            std::process::abort();
        }
        Block { base, cap }
    }

    unsafe fn free(base: *mut u8, cap: usize) {
        dealloc(base, Self::layout(cap));
    }

    fn versions(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.base.cast(), self.cap) }
    }

    fn objects(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.base.add(self.cap * 8).cast(), self.cap) }
    }

    fn marks(&self) -> &[AtomicU8] {
        unsafe { std::slice::from_raw_parts(self.base.add(self.cap * 16).cast(), self.cap) }
    }
}

/// A multi-version record.
///
/// `versions[0..size)` holds strictly ascending, unique serial ids;
/// `objects[i]` is the parallel payload word (a value pointer, a pending
/// word carrying the waiter bitmap, the rolled-back marker, or a
/// tombstone). Appenders and the garbage collector serialize on a
/// test-and-set lock; readers are lock-free and value publication is a
/// single release store into the slot.
pub struct VHandle {
    lock: AtomicBool,
    block: AtomicU64,
    cap: AtomicUsize,
    size: AtomicUsize,
    last_gc_epoch: AtomicU64,
    alloc_affinity: u32,
    /// Largest serial id any reader has resolved through this handle.
    /// Only maintained when read bits are enabled.
    max_read_sid: AtomicU64,
    /// Blocks replaced by expansion, freed at the next GC. A waiter may
    /// still be spinning on a retired slot within the epoch, so the
    /// memory must survive until the boundary.
    retired: UnsafeCell<SmallVec<[(*mut u8, usize); 2]>>,
}

unsafe impl Send for VHandle {}
unsafe impl Sync for VHandle {}

/// Outcome of a versioned read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult<'a> {
    /// A committed payload.
    Value(&'a [u8]),
    /// The row is deleted as of the requested serial id.
    Deleted,
    /// No version precedes the requested serial id.
    Absent,
}

impl<'a> ReadResult<'a> {
    /// The payload, if any.
    pub fn value(self) -> Option<&'a [u8]> {
        match self {
            ReadResult::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl VHandle {
    /// Create an empty handle whose backing storage is attributed to
    /// `alloc_affinity` (the creating core), starting its GC clock at
    /// `epoch_nr`.
    pub fn new(alloc_affinity: u32, epoch_nr: u64) -> VHandle {
        let block = Block::alloc(INITIAL_CAPACITY);
        VHandle {
            lock: AtomicBool::new(false),
            block: AtomicU64::new(block.base as u64),
            cap: AtomicUsize::new(block.cap),
            size: AtomicUsize::new(0),
            last_gc_epoch: AtomicU64::new(epoch_nr),
            alloc_affinity,
            max_read_sid: AtomicU64::new(0),
            retired: UnsafeCell::new(SmallVec::new()),
        }
    }

    /// The core whose allocator owns the backing storage.
    pub fn alloc_affinity(&self) -> u32 {
        self.alloc_affinity
    }

    /// Number of versions currently held.
    pub fn nr_versions(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// The smallest serial id present, if any.
    pub fn first_version(&self) -> Option<Sid> {
        if self.size.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(Sid::from_raw(
            self.current_block().versions()[0].load(Ordering::Relaxed),
        ))
    }

    /// Whether a range scan at `sid` should skip this row: its first
    /// version is not yet visible at `sid`.
    pub fn should_scan_skip(&self, sid: Sid) -> bool {
        match self.first_version() {
            None => true,
            Some(first) => first >= sid,
        }
    }

    fn current_block(&self) -> Block {
        Block {
            base: self.block.load(Ordering::Acquire) as *mut u8,
            cap: self.cap.load(Ordering::Acquire),
        }
    }

    fn acquire_lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn release_lock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Append a pending version at `sid` for batch execution.
    ///
    /// Serial ids arrive near-ascending, so the append lands at the tail
    /// and shifts backward only rarely. A duplicate append collapses.
    /// Inserting below an already-written version is a scheduler bug and
    /// aborts.
    pub fn append_new_version(&self, sid: Sid) {
        if !self.append_inner(sid, false) {
            unreachable!("batch append aborts instead of failing");
        }
    }

    /// Append a pending version at `sid` for a priority transaction.
    ///
    /// Returns false (leaving the handle untouched) when the insertion
    /// would cross a version that already carries a committed value.
    pub fn try_append_new_version(&self, sid: Sid) -> bool {
        self.append_inner(sid, true)
    }

    fn append_inner(&self, sid: Sid, fail_ok: bool) -> bool {
        self.acquire_lock();

        // First append of a new epoch collects the previous epoch.
        let ep = sid.epoch_nr();
        if ep > self.last_gc_epoch.load(Ordering::Relaxed) {
            self.gc_locked();
            self.last_gc_epoch.store(ep, Ordering::Relaxed);
        }

        let size = self.size.load(Ordering::Relaxed);
        let block = self.current_block();
        let versions = block.versions();
        let objects = block.objects();

        // Find the insertion point from the tail.
        let mut pos = size;
        while pos > 0 {
            let v = versions[pos - 1].load(Ordering::Relaxed);
            if v == sid.raw() {
                // Idempotent append.
                self.release_lock();
                return true;
            }
            if v < sid.raw() {
                break;
            }
            pos -= 1;
        }

        // Every slot the insertion crosses must still be pending: a
        // written value can never move, and nothing may serialize below
        // one after the fact.
        for j in pos..size {
            if !object::is_pending(objects[j].load(Ordering::Acquire)) {
                self.release_lock();
                if fail_ok {
                    return false;
                }
                contract_abort!("append at {sid} would cross committed version {}", {
                    Sid::from_raw(versions[j].load(Ordering::Relaxed))
                });
            }
        }

        let block = self.ensure_space(size);
        let versions = block.versions();
        let objects = block.objects();
        let marks = block.marks();

        // The tail slot always starts out as a fresh pending word, then
        // versions (and marks) shift up one slot. Interior object words
        // stay put: every crossed slot is pending, and a pending word
        // belongs to the waiters parked on its address rather than to a
        // particular version.
        objects[size].store(object::PENDING_FRESH, Ordering::Relaxed);
        let mut j = size;
        while j > pos {
            versions[j].store(versions[j - 1].load(Ordering::Relaxed), Ordering::Relaxed);
            marks[j].store(marks[j - 1].load(Ordering::Relaxed), Ordering::Relaxed);
            j -= 1;
        }
        versions[pos].store(sid.raw(), Ordering::Relaxed);
        marks[pos].store(0, Ordering::Relaxed);
        self.size.store(size + 1, Ordering::Release);

        self.release_lock();
        true
    }

    fn ensure_space(&self, size: usize) -> Block {
        let block = self.current_block();
        if size + 1 <= block.cap {
            return block;
        }
        let bigger = Block::alloc(block.cap * 2);
        for i in 0..size {
            bigger.versions()[i].store(block.versions()[i].load(Ordering::Relaxed), Ordering::Relaxed);
            bigger.objects()[i].store(block.objects()[i].load(Ordering::Relaxed), Ordering::Relaxed);
            bigger.marks()[i].store(block.marks()[i].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        unsafe {
            (*self.retired.get()).push((block.base, block.cap));
        }
        self.block.store(bigger.base as u64, Ordering::Release);
        self.cap.store(bigger.cap, Ordering::Release);
        bigger
    }

    fn slot_of(&self, sid: Sid) -> Option<usize> {
        let size = self.size.load(Ordering::Acquire);
        let block = self.current_block();
        let versions = block.versions();
        let mut lo = 0usize;
        let mut hi = size;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if versions[mid].load(Ordering::Relaxed) < sid.raw() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < size && versions[lo].load(Ordering::Relaxed) == sid.raw() {
            Some(lo)
        } else {
            None
        }
    }

    /// Publish `payload` at the version appended for `sid`. `None` writes
    /// a delete tombstone. Waiters parked on the slot are woken.
    ///
    /// Writing at a serial id that was never appended means two replicas
    /// of the schedule diverged; the process aborts with the version dump.
    pub fn write_with_version(&self, sid: Sid, payload: Option<&[u8]>, spinner: &SpinnerService) {
        let Some(pos) = self.slot_of(sid) else {
            let size = self.size.load(Ordering::Acquire);
            let block = self.current_block();
            let dump: Vec<u64> = (0..size)
                .map(|i| block.versions()[i].load(Ordering::Relaxed))
                .collect();
            contract_abort!("divergent outcomes: write at {sid} but versions are {dump:?}");
        };
        let word = match payload {
            None => object::TOMBSTONE,
            Some(bytes) => Box::into_raw(Box::new(bytes.to_vec())) as u64,
        };
        spinner.offer_data(&self.current_block().objects()[pos], word);
    }

    /// Roll back the pending version at `sid`: future readers skip it.
    pub fn write_ignore(&self, sid: Sid, spinner: &SpinnerService) {
        let Some(pos) = self.slot_of(sid) else {
            contract_abort!("rollback at {sid} but the version is gone");
        };
        spinner.offer_data(&self.current_block().objects()[pos], object::IGNORE);
    }

    /// After a committed delete at `sid`, mark every later version
    /// deleted as well so readers past the delete observe absence.
    pub fn priority_delete(&self, sid: Sid, spinner: &SpinnerService) {
        let size = self.size.load(Ordering::Acquire);
        let block = self.current_block();
        for i in 0..size {
            if block.versions()[i].load(Ordering::Relaxed) > sid.raw() {
                spinner.offer_data(&block.objects()[i], object::TOMBSTONE);
            }
        }
    }

    /// Read the row as of `sid`: the payload of the largest version
    /// strictly below `sid`, blocking while that version is pending.
    ///
    /// Rolled-back versions are skipped; a version rolled back while we
    /// waited on it restarts the resolution. When `mark_read` is set the
    /// resolved slot is marked for the priority admission protocol before
    /// the wait, so a conflicting splice below us is guaranteed to see it.
    pub fn read_with_version<'a>(
        &'a self,
        sid: Sid,
        core: usize,
        spinner: &SpinnerService,
        mark_read: bool,
        mut relief: impl FnMut(),
    ) -> ReadResult<'a> {
        'restart: loop {
            let size = self.size.load(Ordering::Acquire);
            let block = self.current_block();
            let versions = block.versions();
            let objects = block.objects();

            // Largest version strictly below sid.
            let mut lo = 0usize;
            let mut hi = size;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if versions[mid].load(Ordering::Relaxed) < sid.raw() {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            let mut pos = lo;
            loop {
                if pos == 0 {
                    return ReadResult::Absent;
                }
                pos -= 1;
                let word = objects[pos].load(Ordering::Acquire);
                if object::is_ignore(word) {
                    continue;
                }

                if mark_read {
                    block.marks()[pos].store(1, Ordering::Release);
                    self.max_read_sid.fetch_max(sid.raw(), Ordering::AcqRel);
                }

                let word = if object::is_pending(word) {
                    let ver = Sid::from_raw(versions[pos].load(Ordering::Relaxed));
                    spinner.wait_for_data(&objects[pos], core, sid, ver, &mut relief)
                } else {
                    word
                };

                if object::is_ignore(word) {
                    // Rolled back while we waited.
                    continue 'restart;
                }
                if object::is_tombstone(word) {
                    return ReadResult::Deleted;
                }
                let payload = unsafe { &*(word as *const Vec<u8>) };
                return ReadResult::Value(payload.as_slice());
            }
        }
    }

    /// Whether a priority append at `sid` would invalidate a read some
    /// later transaction already performed through this handle.
    pub fn check_read_bit(&self, sid: Sid) -> bool {
        if self.max_read_sid.load(Ordering::Acquire) <= sid.raw() {
            return false;
        }
        let size = self.size.load(Ordering::Acquire);
        let block = self.current_block();
        let versions = block.versions();
        // Slot the append would land after.
        let mut pos = size;
        while pos > 0 && versions[pos - 1].load(Ordering::Relaxed) >= sid.raw() {
            pos -= 1;
        }
        pos > 0 && block.marks()[pos - 1].load(Ordering::Acquire) != 0
    }

    /// Fold used by read-bit serial-id selection: the earliest serial id
    /// at or above `prev` that no reader has already resolved past.
    pub fn get_available_sid(&self, prev: Sid) -> Sid {
        let seen = self.max_read_sid.load(Ordering::Acquire);
        if seen > prev.raw() {
            Sid::from_raw(seen)
        } else {
            prev
        }
    }

    /// Collapse the array to its single latest version, reclaiming every
    /// earlier payload and the blocks retired by expansion.
    ///
    /// Runs at the epoch boundary: the phase barrier guarantees nobody is
    /// reading or waiting on the collapsed slots.
    pub fn garbage_collect(&self) {
        self.acquire_lock();
        self.gc_locked();
        self.release_lock();
    }

    fn gc_locked(&self) {
        let size = self.size.load(Ordering::Relaxed);
        let block = self.current_block();
        if size >= 2 {
            let versions = block.versions();
            let objects = block.objects();
            let last_version = versions[size - 1].load(Ordering::Relaxed);
            let last_object = objects[size - 1].load(Ordering::Relaxed);
            for i in 0..size - 1 {
                let word = objects[i].load(Ordering::Relaxed);
                if object::is_value(word) {
                    unsafe { drop(Box::from_raw(word as *mut Vec<u8>)) };
                }
            }
            versions[0].store(last_version, Ordering::Relaxed);
            objects[0].store(last_object, Ordering::Relaxed);
            block.marks()[0].store(0, Ordering::Relaxed);
            self.size.store(1, Ordering::Release);
        }
        self.max_read_sid.store(0, Ordering::Release);
        let retired = unsafe { &mut *self.retired.get() };
        for (base, cap) in retired.drain(..) {
            unsafe { Block::free(base, cap) };
        }
    }

    /// Version array snapshot, for diagnostics and tests.
    pub fn versions(&self) -> Vec<Sid> {
        let size = self.size.load(Ordering::Acquire);
        let block = self.current_block();
        (0..size)
            .map(|i| Sid::from_raw(block.versions()[i].load(Ordering::Relaxed)))
            .collect()
    }
}

impl Drop for VHandle {
    fn drop(&mut self) {
        let size = *self.size.get_mut();
        let block = self.current_block();
        for i in 0..size {
            let word = block.objects()[i].load(Ordering::Relaxed);
            if object::is_value(word) {
                unsafe { drop(Box::from_raw(word as *mut Vec<u8>)) };
            }
        }
        unsafe {
            Block::free(block.base, block.cap);
            for (base, cap) in (*self.retired.get()).drain(..) {
                Block::free(base, cap);
            }
        }
    }
}
