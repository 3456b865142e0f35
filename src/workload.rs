//! Micro benchmark workload
//!
//! A multi-key read-modify-write workload in the YCSB mold: every batch
//! transaction bumps a counter in a handful of distinct rows, and the
//! priority stream runs the same shape out-of-band through the admission
//! protocol.

use margay_core::{Options, Sid};
use margay_engine::{Client, EpochTxnSet, Runtime, Transaction};
use margay_index::{HashTable, Table};
use margay_priority::{PriorityCtx, PriorityTxn};
use margay_sched::{encode_capture, Promise, RoutineCtx, ANY_CORE};
use margay_storage::{ReadResult, VHandle};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Keys updated by each transaction.
const KEYS_PER_TXN: usize = 2;

/// Workload shape.
#[derive(Debug, Clone)]
pub struct MicroConfig {
    /// Number of distinct rows.
    pub table_size: u64,
    /// Seed for input generation.
    pub seed: u64,
}

impl Default for MicroConfig {
    fn default() -> Self {
        MicroConfig {
            table_size: 1 << 12,
            seed: 0x6d61_7267,
        }
    }
}

/// The micro workload client: owns the table and generates both the
/// batch and the priority stream.
pub struct MicroClient {
    table: Arc<HashTable>,
    config: MicroConfig,
}

impl MicroClient {
    /// Build a client over a fresh table.
    pub fn new(config: MicroConfig) -> MicroClient {
        MicroClient {
            table: Arc::new(HashTable::new()),
            config,
        }
    }

    /// The workload's table.
    pub fn table(&self) -> &Arc<HashTable> {
        &self.table
    }

    fn distinct_keys(&self, rng: &mut StdRng) -> Vec<u64> {
        let mut keys = Vec::with_capacity(KEYS_PER_TXN);
        while keys.len() < KEYS_PER_TXN {
            let key = rng.gen_range(0..self.config.table_size);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

pub(crate) fn key_bytes(key: u64) -> [u8; 8] {
    key.to_be_bytes()
}

/// Decode the little-endian counter a row carries; a missing or deleted
/// row counts from zero.
pub fn counter_of(read: ReadResult<'_>) -> u64 {
    match read.value() {
        Some(bytes) if bytes.len() >= 8 => u64::from_le_bytes(bytes[..8].try_into().unwrap()),
        _ => 0,
    }
}

impl Client for MicroClient {
    fn generate_benchmarks(&self, rt: &Runtime) -> Vec<EpochTxnSet> {
        let opts = rt.options();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut sets = Vec::with_capacity((opts.max_epoch - 1) as usize);
        for epoch in 1..opts.max_epoch {
            let txns: Vec<Arc<dyn Transaction>> = (1..=opts.txns_per_epoch as u64)
                .map(|seq| {
                    let sid = batch_sid(opts, epoch, seq);
                    Arc::new(MicroTxn::new(
                        sid,
                        self.distinct_keys(&mut rng),
                        Arc::clone(&self.table),
                    )) as Arc<dyn Transaction>
                })
                .collect();
            sets.push(EpochTxnSet::new(opts.nr_threads, txns));
        }
        sets
    }

    fn generate_priority_txns(&self, rt: &Runtime) {
        let opts = rt.options();
        if !opts.priority_enabled() {
            return;
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ 0x5052_4949);
        for epoch in 1..opts.max_epoch {
            for j in 1..=opts.nr_priority_txn as u64 {
                let mut txn = PriorityTxn::new(
                    epoch,
                    opts.interval_priority_txn as u64 * j,
                    multi_write_body,
                );
                txn.set_payload(MwInput {
                    keys: self.distinct_keys(&mut rng),
                    table: Arc::clone(&self.table),
                    pin_partition: (opts.enable_partition && opts.pin_partitions)
                        .then_some(opts.nr_threads),
                });
                rt.service().push_txn(Box::new(txn));
            }
        }
        tracing::info!(
            per_epoch = opts.nr_priority_txn,
            "priority transactions pre-generated"
        );
    }
}

/// Serial id of the `seq`-th batch transaction of `epoch`, skipping the
/// sequences reserved for priority slots.
fn batch_sid(opts: &Options, epoch: u64, seq: u64) -> Sid {
    let seq = match opts.slot_stride() {
        // Sequences k, 2k, ... belong to priority work; the j-th batch
        // transaction takes the j-th sequence not divisible by k.
        Some(k) => seq + (seq - 1) / (k - 1),
        None => seq,
    };
    Sid::new(epoch, seq, opts.node_id)
}

/// One batch transaction: bump a counter in each of its rows.
pub struct MicroTxn {
    sid: Sid,
    keys: Vec<u64>,
    table: Arc<HashTable>,
    root: Mutex<Arc<Promise>>,
    state: Mutex<Vec<Arc<VHandle>>>,
}

impl MicroTxn {
    /// A transaction at `sid` over `keys`.
    pub fn new(sid: Sid, keys: Vec<u64>, table: Arc<HashTable>) -> MicroTxn {
        MicroTxn {
            sid,
            keys,
            table,
            root: Mutex::new(Promise::new()),
            state: Mutex::new(Vec::new()),
        }
    }

    fn row(&self, idx: usize) -> Arc<VHandle> {
        Arc::clone(&self.state.lock()[idx])
    }
}

#[derive(Serialize, Deserialize)]
struct PieceCapture {
    txn: u64,
    idx: u32,
    scratch: u64,
    mark_read: bool,
}

fn micro_piece(ctx: &mut RoutineCtx<'_>) {
    let c: PieceCapture = ctx.capture();
    let txn = unsafe { &*(c.txn as *const MicroTxn) };
    let row = txn.row(c.idx as usize);

    let prev = ctx.read_row(&row, txn.sid, c.mark_read);
    let next = counter_of(prev) + 1;

    // Routine-local scratch carved out of the epoch region at issue time.
    let scratch = unsafe { std::slice::from_raw_parts_mut(c.scratch as *mut u8, 8) };
    scratch.copy_from_slice(&next.to_le_bytes());
    ctx.write_row(&row, txn.sid, Some(&scratch[..]));
}

impl Transaction for MicroTxn {
    fn serial_id(&self) -> Sid {
        self.sid
    }

    fn prepare_state(&self, _rt: &Runtime, _core: usize) {
        let mut state = self.state.lock();
        state.clear();
        state.reserve(self.keys.len());
    }

    fn reset_root(&self) {
        *self.root.lock() = Promise::new();
    }

    fn root_promise(&self) -> Arc<Promise> {
        Arc::clone(&self.root.lock())
    }

    fn prepare_insert(&self, _rt: &Runtime, core: usize) {
        for key in &self.keys {
            self.table.search_or_create(&key_bytes(*key), core as u32);
        }
    }

    fn prepare(&self, _rt: &Runtime, _core: usize) {
        let mut state = self.state.lock();
        state.clear();
        for key in &self.keys {
            let row = self
                .table
                .search(&key_bytes(*key))
                .expect("row created during the insert phase");
            row.append_new_version(self.sid);
            state.push(row);
        }
    }

    fn run(&self, rt: &Runtime, core: usize) {
        let opts = rt.options();
        let root = self.root_promise();
        for (idx, key) in self.keys.iter().enumerate() {
            let affinity = if opts.enable_partition {
                (key % opts.nr_threads as u64) as u32
            } else {
                ANY_CORE
            };
            let scratch = rt.with_epoch_brk(core, |brk| brk.alloc(8)) as u64;
            let capture = encode_capture(
                rt.arena(core),
                &PieceCapture {
                    txn: self as *const MicroTxn as u64,
                    idx: idx as u32,
                    scratch,
                    mark_read: opts.read_bit,
                },
            );
            root.then(capture, self.sid.raw(), affinity, 0, micro_piece);
        }
    }
}

/// Priority multi-write input.
struct MwInput {
    keys: Vec<u64>,
    table: Arc<HashTable>,
    /// Pin each piece to its key's partition core instead of chasing the
    /// fastest core.
    pin_partition: Option<usize>,
}

#[derive(Serialize, Deserialize)]
struct MwPieceCapture {
    txn: u64,
    service: u64,
    idx: u32,
    nr: u32,
}

fn mw_piece(ctx: &mut RoutineCtx<'_>) {
    let c: MwPieceCapture = ctx.capture();
    let txn = unsafe { &*(c.txn as *const PriorityTxn) };
    let service = unsafe { &*(c.service as *const margay_priority::PriorityTxnService) };

    let piece_id = txn.piece_count.fetch_sub(1, Ordering::SeqCst);
    if piece_id == c.nr as i64 {
        let now = service.now_us();
        let queued = now.saturating_sub(txn.measure_us.load(Ordering::SeqCst));
        service.stats().record_exec_queue(queued);
        txn.measure_us.store(now, Ordering::SeqCst);
    }

    let row = txn.update_handle(c.idx as usize);
    let prev = txn.read(ctx, row);
    let next = counter_of(prev) + 1;
    txn.write(ctx, row, &next.to_le_bytes());

    if piece_id == 1 {
        let now = service.now_us();
        let exec = now.saturating_sub(txn.measure_us.load(Ordering::SeqCst));
        let total = now.saturating_sub(txn.delay_us);
        service.stats().record_exec(exec, total);
    }
}

/// The priority transaction body: register the update set, drive
/// admission (interleaving batch work between failed attempts), then
/// issue one piece per row.
fn multi_write_body(txn: &mut PriorityTxn, ctx: &PriorityCtx<'_>) -> bool {
    let arrival = txn.delay_us;
    let start = ctx.service.now_us();

    let (keys, table, pin_partition) = {
        let input: &MwInput = txn.payload().expect("multi-write input attached");
        (
            input.keys.clone(),
            Arc::clone(&input.table),
            input.pin_partition,
        )
    };
    for key in &keys {
        txn.register_update(table.search_or_create(&key_bytes(*key), ctx.core as u32));
    }

    let mut fail_cnt = 0u64;
    let mut fail_end = start;
    let mut give_up = false;
    while !txn.init(ctx) {
        fail_cnt += 1;
        fail_end = ctx.service.now_us();
        if ctx.exec.dispatcher().is_idle(ctx.core) {
            // No batched pieces remain on this core: the frontier cannot
            // move and retrying is pointless.
            give_up = true;
            break;
        }
        ctx.exec.run_one(ctx.core);
    }
    let admitted = ctx.service.now_us();

    ctx.service
        .stats()
        .record_init_queue(start.saturating_sub(arrival));
    ctx.service.stats().record_init(
        admitted.saturating_sub(fail_end),
        fail_end.saturating_sub(start),
        fail_cnt,
    );
    if give_up {
        return false;
    }

    let nr = keys.len() as u32;
    txn.piece_count.store(nr as i64, Ordering::SeqCst);
    txn.measure_us.store(admitted, Ordering::SeqCst);
    for idx in 0..nr {
        let capture = encode_capture(
            ctx.arena,
            &MwPieceCapture {
                txn: txn as *const PriorityTxn as u64,
                service: ctx.service as *const _ as u64,
                idx,
                nr,
            },
        );
        match pin_partition {
            Some(nr_cores) => {
                let core = (keys[idx as usize] % nr_cores as u64) as usize;
                txn.issue_promise_pinned(ctx, core, capture, mw_piece);
            }
            None => txn.issue_promise(ctx, capture, mw_piece),
        }
    }
    txn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_sids_skip_reserved_slots() {
        let mut opts = Options::default();
        opts.slot_percentage = 20; // k = 6
        let seqs: Vec<u64> = (1..=10).map(|j| batch_sid(&opts, 1, j).sequence()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 7, 8, 9, 10, 11]);
        for seq in &seqs {
            assert_ne!(seq % 6, 0);
        }
    }

    #[test]
    fn test_counter_decoding() {
        assert_eq!(counter_of(ReadResult::Absent), 0);
        assert_eq!(counter_of(ReadResult::Deleted), 0);
        assert_eq!(counter_of(ReadResult::Value(&7u64.to_le_bytes())), 7);
    }

    #[test]
    fn test_distinct_keys() {
        let client = MicroClient::new(MicroConfig {
            table_size: 4,
            seed: 1,
        });
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..64 {
            let keys = client.distinct_keys(&mut rng);
            assert_eq!(keys.len(), KEYS_PER_TXN);
            assert_ne!(keys[0], keys[1]);
        }
    }
}
