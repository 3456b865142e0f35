//! Priority transaction service

use crate::stats::LatencyStats;
use crate::txn::PriorityTxn;
use margay_core::{Options, Sid};
use margay_storage::VHandle;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[repr(align(64))]
struct Progress(AtomicU64);

/// Coordinates priority admission: serial-id slot reservation, per-core
/// execution progress, arrival inboxes, and latency accounting.
pub struct PriorityTxnService {
    nr_threads: usize,
    node_id: u8,
    read_bit: bool,
    backoff_distance: i64,
    slot_stride: Option<u64>,
    queue_length: usize,

    /// The largest serial id each core has started executing.
    exec_progress: Vec<Progress>,
    /// Epoch the progress frontier has reached.
    epoch_nr: AtomicU64,
    /// Wall-clock start of the current epoch's execution, for arrival
    /// scheduling and latency probes.
    epoch_start: Mutex<Instant>,
    /// The last serial id handed out, guarded for slot allocation.
    last_sid: Mutex<u64>,

    inboxes: Vec<Mutex<VecDeque<Box<PriorityTxn>>>>,
    /// Admitted transactions kept alive until the epoch ends; their
    /// execution pieces hold pointers into these boxes.
    live: Vec<Mutex<Vec<Box<PriorityTxn>>>>,
    next_core: AtomicUsize,

    stats: LatencyStats,
}

impl PriorityTxnService {
    /// Build the service from runtime options.
    pub fn new(opts: &Options) -> PriorityTxnService {
        tracing::info!(
            nr_priority_txn = opts.nr_priority_txn,
            interval_us = opts.interval_priority_txn,
            backoff = opts.backoff_distance,
            "priority service up"
        );
        PriorityTxnService {
            nr_threads: opts.nr_threads,
            node_id: opts.node_id,
            read_bit: opts.read_bit,
            backoff_distance: opts.backoff_distance,
            slot_stride: opts.slot_stride(),
            queue_length: opts.txn_queue_length,
            exec_progress: (0..opts.nr_threads)
                .map(|_| Progress(AtomicU64::new(0)))
                .collect(),
            epoch_nr: AtomicU64::new(0),
            epoch_start: Mutex::new(Instant::now()),
            last_sid: Mutex::new(0),
            inboxes: (0..opts.nr_threads).map(|_| Mutex::new(VecDeque::new())).collect(),
            live: (0..opts.nr_threads).map(|_| Mutex::new(Vec::new())).collect(),
            next_core: AtomicUsize::new(0),
            stats: LatencyStats::default(),
        }
    }

    /// Whether read bits drive conflict detection and serial-id choice.
    pub fn read_bit(&self) -> bool {
        self.read_bit
    }

    /// Latency aggregates.
    pub fn stats(&self) -> &LatencyStats {
        &self.stats
    }

    /// Queue a pre-generated transaction, round-robin across cores.
    pub fn push_txn(&self, txn: Box<PriorityTxn>) {
        let core = self.next_core.fetch_add(1, Ordering::Relaxed) % self.nr_threads;
        let mut inbox = self.inboxes[core].lock();
        if inbox.len() >= self.queue_length {
            tracing::error!(core, len = inbox.len(), "priority inbox overflow");
            std::process::abort();
        }
        inbox.push_back(txn);
    }

    /// Pop the next transaction on `core` whose epoch is executing and
    /// whose arrival offset has elapsed. Transactions whose epoch already
    /// finished are dropped: their admission window is gone.
    pub fn pop_due(&self, core: usize) -> Option<Box<PriorityTxn>> {
        let epoch_nr = self.epoch_nr.load(Ordering::Acquire);
        let now_us = self.now_us();
        let mut inbox = self.inboxes[core].lock();
        loop {
            let front = inbox.front()?;
            if front.epoch < epoch_nr {
                inbox.pop_front();
                continue;
            }
            if front.epoch == epoch_nr && front.delay_us <= now_us {
                return inbox.pop_front();
            }
            return None;
        }
    }

    /// Stamp the start of `epoch_nr`'s execution window. Arrival offsets
    /// and latency probes measure from here, and only this epoch's
    /// transactions are admitted until the next stamp.
    pub fn begin_execute(&self, epoch_nr: u64) {
        self.epoch_nr.store(epoch_nr, Ordering::Release);
        *self.epoch_start.lock() = Instant::now();
    }

    /// Keep an admitted transaction alive until the epoch ends.
    pub fn retain(&self, core: usize, txn: Box<PriorityTxn>) {
        self.live[core].lock().push(txn);
    }

    /// Release transactions admitted in finished epochs.
    pub fn release_finished(&self, epoch_nr: u64) {
        for slot in &self.live {
            slot.lock().retain(|txn| txn.epoch >= epoch_nr);
        }
    }

    /// Microseconds since the current epoch's execution started.
    pub fn now_us(&self) -> u64 {
        self.epoch_start.lock().elapsed().as_micros() as u64
    }

    /// Publish that `core` started executing the piece at `key`.
    /// Progress is monotonic per core; zero keys carry no position.
    pub fn update_progress(&self, core: usize, key: u64) {
        if key == 0 {
            return;
        }
        let slot = &self.exec_progress[core].0;
        if key > slot.load(Ordering::Relaxed) {
            slot.store(key, Ordering::Release);
        }
    }

    /// The largest piece serial id any core has started.
    pub fn get_max_progress(&self) -> Sid {
        let mut max = 0;
        for p in &self.exec_progress {
            max = max.max(p.0.load(Ordering::Acquire));
        }
        Sid::from_raw(max)
    }

    /// `core`'s own frontier.
    pub fn get_progress(&self, core: usize) -> Sid {
        Sid::from_raw(self.exec_progress[core].0.load(Ordering::Acquire))
    }

    /// Whether any core has already started a piece beyond `sid`.
    pub fn max_progress_passed(&self, sid: Sid) -> bool {
        self.exec_progress
            .iter()
            .any(|p| p.0.load(Ordering::Acquire) > sid.raw())
    }

    /// The core with the furthest frontier, for affinity heuristics.
    pub fn get_fastest_core(&self) -> Option<usize> {
        let mut best = None;
        let mut max = 0;
        for (core, p) in self.exec_progress.iter().enumerate() {
            let v = p.0.load(Ordering::Acquire);
            if v > max {
                max = v;
                best = Some(core);
            }
        }
        best
    }

    /// Whether `sid` sits in a reserved priority slot.
    pub fn is_priority_sid(&self, sid: Sid) -> bool {
        match self.slot_stride {
            Some(k) if !sid.is_zero() => sid.sequence() % k == 0,
            _ => false,
        }
    }

    /// Where the next priority transaction may serialize: the execution
    /// frontier pushed out by the configured backoff distance.
    fn sid_lower_bound(&self) -> Sid {
        let max = self.get_max_progress();
        let seq = max.sequence().saturating_add_signed(self.backoff_distance);
        Sid::new(max.epoch_nr(), seq, self.node_id)
    }

    /// Reserve a serial-id slot for `txn`.
    ///
    /// With read bits enabled, the fold over the update set can justify a
    /// slot earlier than the backoff lower bound: if no reader constrains
    /// us in this epoch the sequence restarts from the epoch base,
    /// otherwise the fold result itself is the bound. The returned serial
    /// id is the next reserved slot at or above the bound, and never
    /// reuses a previously handed-out slot.
    pub fn get_sid(&self, txn: &PriorityTxn, handles: &[Arc<VHandle>]) -> Option<Sid> {
        let k = self.slot_stride?;
        let mut last = self.last_sid.lock();

        let mut lb = self.sid_lower_bound();
        if self.read_bit {
            // Read bits replace the progress backoff: the bound becomes
            // the earliest id above which none of the rows has been read.
            let mut prev = Sid::ZERO;
            for h in handles {
                prev = h.get_available_sid(prev);
            }
            if prev > lb {
                lb = prev;
            } else if prev.is_zero() || prev.epoch_nr() < lb.epoch_nr() {
                // No reader constrains us in this epoch; slots from the
                // epoch base are fair game.
                lb = lb.erase_sequence();
            } else {
                lb = prev;
            }
        }
        if txn.min_sid > lb {
            lb = txn.min_sid;
        }
        if Sid::from_raw(*last) > lb {
            lb = Sid::from_raw(*last);
        }

        let new_seq = (lb.sequence() / k + 1) * k;
        let sid = Sid::new(lb.epoch_nr(), new_seq, self.node_id);
        *last = sid.raw();
        Some(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(slot_percentage: usize) -> PriorityTxnService {
        let mut opts = Options::default();
        opts.nr_threads = 2;
        opts.node_id = 1;
        opts.slot_percentage = slot_percentage;
        opts.backoff_distance = 2;
        PriorityTxnService::new(&opts)
    }

    #[test]
    fn test_progress_is_monotonic() {
        let svc = service(20);
        svc.update_progress(0, Sid::new(1, 10, 1).raw());
        svc.update_progress(0, Sid::new(1, 5, 1).raw());
        assert_eq!(svc.get_progress(0), Sid::new(1, 10, 1));
        svc.update_progress(1, Sid::new(1, 30, 1).raw());
        assert_eq!(svc.get_max_progress(), Sid::new(1, 30, 1));
        assert!(svc.max_progress_passed(Sid::new(1, 20, 1)));
        assert!(!svc.max_progress_passed(Sid::new(1, 30, 1)));
        assert_eq!(svc.get_fastest_core(), Some(1));
    }

    #[test]
    fn test_get_sid_rounds_to_reserved_slot() {
        // percentage=20 gives k=6: sequences 1..=5 are batched, 6 is the
        // reserved slot.
        let svc = service(20);
        svc.update_progress(0, Sid::new(1, 3, 1).raw());
        let txn = PriorityTxn::new(1, 0, |_, _| true);
        // frontier 3 + backoff 2 = 5, rounded up to slot 6.
        let sid = svc.get_sid(&txn, &[]).unwrap();
        assert_eq!(sid, Sid::new(1, 6, 1));
        // The same slot is never handed out twice.
        let sid2 = svc.get_sid(&txn, &[]).unwrap();
        assert_eq!(sid2, Sid::new(1, 12, 1));
    }

    #[test]
    fn test_get_sid_disabled_without_slots() {
        let svc = service(0);
        let txn = PriorityTxn::new(1, 0, |_, _| true);
        assert!(svc.get_sid(&txn, &[]).is_none());
    }

    #[test]
    fn test_is_priority_sid() {
        let svc = service(20);
        assert!(svc.is_priority_sid(Sid::new(1, 6, 1)));
        assert!(svc.is_priority_sid(Sid::new(1, 12, 1)));
        assert!(!svc.is_priority_sid(Sid::new(1, 5, 1)));
        assert!(!svc.is_priority_sid(Sid::ZERO));
    }

    #[test]
    fn test_inbox_round_robin_and_due_gating() {
        let svc = service(20);
        svc.push_txn(Box::new(PriorityTxn::new(1, 0, |_, _| true)));
        svc.push_txn(Box::new(PriorityTxn::new(1, 0, |_, _| true)));
        // Epoch 1 is not executing yet: nothing is due.
        assert!(svc.pop_due(0).is_none());
        svc.begin_execute(1);
        assert!(svc.pop_due(0).is_some());
        assert!(svc.pop_due(1).is_some());
        assert!(svc.pop_due(0).is_none());
    }

    #[test]
    fn test_stale_epoch_txns_are_dropped() {
        let svc = service(20);
        svc.push_txn(Box::new(PriorityTxn::new(1, 0, |_, _| true)));
        svc.push_txn(Box::new(PriorityTxn::new(2, 0, |_, _| true)));
        svc.begin_execute(2);
        // The epoch-1 transaction (core 0) missed its window and is
        // dropped; the epoch-2 one (core 1) is served.
        assert!(svc.pop_due(0).is_none());
        let txn = svc.pop_due(1).unwrap();
        assert_eq!(txn.epoch, 2);
    }
}
