//! Runtime construction and the epoch state machine

use crate::client::{Client, EpochTxnSet};
use crate::report::{write_reports, RunReport};
use crate::worker;
use margay_core::{Options, Result};
use margay_mem::{Brk, EpochMemory, PromiseArena};
use margay_priority::PriorityTxnService;
use margay_sched::{DispatchConfig, Dispatcher, Executor};
use margay_sync::{CompletionCounter, SpinnerService};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Instant;

/// Per-worker promise arena size.
const PROMISE_ARENA_PER_WORKER: usize = 32 << 20;

/// The three phases every epoch runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Create the rows the epoch will populate.
    Insert,
    /// Resolve rows and append pending versions.
    Initialize,
    /// Run the execution pieces.
    Execute,
}

impl Phase {
    /// Human-readable phase label for logs.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Insert => "Insert",
            Phase::Initialize => "Initialization",
            Phase::Execute => "Execution",
        }
    }
}

pub(crate) enum WorkerCommand {
    Phase(Phase),
    Shutdown,
}

struct PhaseBarrier {
    done: Mutex<bool>,
    cv: Condvar,
}

/// The engine's context handle: every service, thread and epoch-scoped
/// resource, constructed once at startup and threaded through the
/// workers.
pub struct Runtime {
    opts: Options,
    spinner: Arc<SpinnerService>,
    dispatch: Arc<Dispatcher>,
    exec: Arc<Executor>,
    service: Arc<PriorityTxnService>,
    arenas: Vec<PromiseArena>,
    epoch_mem: Mutex<EpochMemory>,

    cur_epoch_nr: AtomicU64,
    cur_txns: RwLock<Option<Arc<EpochTxnSet>>>,
    in_execute: AtomicBool,
    admissions_in_flight: AtomicUsize,
    workers_left: AtomicUsize,
    barrier: PhaseBarrier,
    gc_pass: RwLock<Option<Box<dyn Fn(usize) + Send + Sync>>>,

    senders: Mutex<Vec<mpsc::Sender<WorkerCommand>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build the runtime from options. Workers are not started yet.
    pub fn new(opts: Options) -> Result<Arc<Runtime>> {
        opts.validate()?;
        let nr = opts.nr_threads;

        let spinner = Arc::new(SpinnerService::new(nr));
        let service = Arc::new(PriorityTxnService::new(&opts));

        let rt = Arc::new_cyclic(|weak: &std::sync::Weak<Runtime>| {
            let weak = weak.clone();
            let completion = Arc::new(CompletionCounter::new(0, move |cnt| {
                if cnt == 0 {
                    if let Some(rt) = weak.upgrade() {
                        rt.signal_phase_done();
                    }
                }
            }));

            let per_core = (opts.txns_per_epoch * 8 / nr).next_power_of_two().max(1 << 12);
            let dispatch = Arc::new(Dispatcher::new(
                nr,
                DispatchConfig {
                    max_items_per_core: per_core,
                },
                Arc::clone(&spinner),
                completion,
            ));

            let svc = Arc::clone(&service);
            let exec = Arc::new(Executor::new(
                Arc::clone(&dispatch),
                Arc::clone(&spinner),
                move |core, key| svc.update_progress(core, key),
            ));

            let arenas = (0..nr)
                .map(|core| PromiseArena::new(PROMISE_ARENA_PER_WORKER, opts.numa_node_of(core)))
                .collect();
            let epoch_mem = Mutex::new(EpochMemory::new(&opts, 1));

            Runtime {
                spinner: Arc::clone(&spinner),
                dispatch,
                exec,
                service: Arc::clone(&service),
                arenas,
                epoch_mem,
                cur_epoch_nr: AtomicU64::new(0),
                cur_txns: RwLock::new(None),
                in_execute: AtomicBool::new(false),
                admissions_in_flight: AtomicUsize::new(0),
                workers_left: AtomicUsize::new(0),
                barrier: PhaseBarrier {
                    done: Mutex::new(false),
                    cv: Condvar::new(),
                },
                gc_pass: RwLock::new(None),
                senders: Mutex::new(Vec::new()),
                handles: Mutex::new(Vec::new()),
                opts,
            }
        });
        Ok(rt)
    }

    /// Runtime options.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// The routine executor.
    pub fn exec(&self) -> &Arc<Executor> {
        &self.exec
    }

    /// The dispatch service.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatch
    }

    /// The spinner service.
    pub fn spinner(&self) -> &Arc<SpinnerService> {
        &self.spinner
    }

    /// The priority transaction service.
    pub fn service(&self) -> &Arc<PriorityTxnService> {
        &self.service
    }

    /// `core`'s promise arena.
    pub fn arena(&self, core: usize) -> &PromiseArena {
        &self.arenas[core]
    }

    /// Run `f` with `core`'s slice of the current epoch's region. The
    /// slice is rewound at every advance.
    pub fn with_epoch_brk<T>(&self, core: usize, f: impl FnOnce(&Brk) -> T) -> T {
        f(self.epoch_mem.lock().brk(0, core))
    }

    /// The current epoch number.
    pub fn cur_epoch_nr(&self) -> u64 {
        self.cur_epoch_nr.load(Ordering::Acquire)
    }

    /// Whether the Execute phase is running; priority admission is only
    /// serviced inside this window.
    pub fn in_execute(&self) -> bool {
        self.in_execute.load(Ordering::Acquire)
    }

    /// Bracket a worker's admission attempt. The phase driver drains
    /// in-flight admissions (and the pieces they issued) before it
    /// resets the queues for the next phase.
    pub(crate) fn note_admission_start(&self) {
        self.admissions_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_admission_end(&self) {
        self.admissions_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// The current epoch's transaction set.
    pub fn cur_txns(&self) -> Arc<EpochTxnSet> {
        Arc::clone(self.cur_txns.read().as_ref().expect("epoch txn set installed"))
    }

    /// Register the garbage-collection pass invoked on each core between
    /// the Initialize and Execute phases.
    pub fn set_gc_pass(&self, f: impl Fn(usize) + Send + Sync + 'static) {
        *self.gc_pass.write() = Some(Box::new(f));
    }

    pub(crate) fn run_gc_pass(&self, core: usize) {
        if let Some(f) = self.gc_pass.read().as_ref() {
            f(core);
        }
    }

    pub(crate) fn phase_call_finished(&self) -> bool {
        self.workers_left.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn signal_phase_done(&self) {
        let mut done = self.barrier.done.lock();
        *done = true;
        self.barrier.cv.notify_all();
    }

    /// Spawn and pin the worker threads.
    pub fn start(self: &Arc<Runtime>) {
        let mut senders = self.senders.lock();
        let mut handles = self.handles.lock();
        for core in 0..self.opts.nr_threads {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            let rt = Arc::clone(self);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("margay-worker-{core}"))
                    .spawn(move || worker::worker_main(rt, core, rx))
                    .expect("spawn worker"),
            );
        }
    }

    /// Advance to the next epoch: bump the epoch number by one, rewind
    /// the epoch region, and install the pre-generated transaction set.
    fn advance(&self, txns: Arc<EpochTxnSet>) {
        let nr = self.cur_epoch_nr.fetch_add(1, Ordering::AcqRel) + 1;
        self.epoch_mem.lock().reset();
        *self.cur_txns.write() = Some(txns);
        self.service.release_finished(nr);
        tracing::info!(epoch = nr, "advancing");
    }

    fn run_phase(&self, phase: Phase) {
        let nr_threads = self.opts.nr_threads;
        let started = Instant::now();

        for arena in &self.arenas {
            arena.reset();
        }
        self.dispatch.reset();
        *self.barrier.done.lock() = false;
        self.workers_left.store(nr_threads, Ordering::Release);
        // One completion per worker's phase call plus one for the node's
        // buffer-plan flush.
        self.dispatch.completion().increment(1 + nr_threads as u64);

        if phase == Phase::Execute {
            self.service.begin_execute(self.cur_epoch_nr());
            self.in_execute.store(true, Ordering::Release);
        }

        for tx in self.senders.lock().iter() {
            let _ = tx.send(WorkerCommand::Phase(phase));
        }

        let mut done = self.barrier.done.lock();
        while !*done {
            self.barrier.cv.wait(&mut done);
        }
        drop(done);

        if phase == Phase::Execute {
            self.in_execute.store(false, Ordering::Release);
            // An admission body may have straddled the barrier; wait for
            // it and for any pieces it issued to drain before the next
            // phase resets the queues, or their pre-counted completions
            // would leak.
            while self.admissions_in_flight.load(Ordering::Acquire) > 0
                || self.dispatch.completion().left_over() > 0
            {
                std::thread::yield_now();
            }
        }
        tracing::info!(
            phase = phase.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "phase complete"
        );
    }

    /// Run the whole experiment: pre-generate the workload, drive every
    /// epoch through its three phases, then emit reports and shut the
    /// workers down.
    pub fn run(self: &Arc<Runtime>, client: &dyn Client) -> RunReport {
        self.start();
        let all_txns: Vec<Arc<EpochTxnSet>> = client
            .generate_benchmarks(self)
            .into_iter()
            .map(Arc::new)
            .collect();
        assert_eq!(
            all_txns.len() as u64,
            self.opts.max_epoch - 1,
            "one txn set per executing epoch"
        );
        client.generate_priority_txns(self);

        let started = Instant::now();
        let mut total_txns = 0u64;
        for set in all_txns {
            total_txns += set.len() as u64;
            self.advance(set);
            self.run_phase(Phase::Insert);
            self.run_phase(Phase::Initialize);
            self.run_phase(Phase::Execute);
        }

        let duration_ms = started.elapsed().as_millis().max(1) as u64;
        let throughput = total_txns * 1000 / duration_ms;
        tracing::info!(throughput, duration_ms, "all epochs done");

        let report = RunReport {
            cpu: self.opts.nr_threads,
            duration_ms,
            throughput,
        };
        write_reports(&self.opts, &report, &self.service);
        self.shutdown();
        report
    }

    /// Stop and join the workers.
    pub fn shutdown(&self) {
        let senders = std::mem::take(&mut *self.senders.lock());
        for tx in senders {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        for handle in std::mem::take(&mut *self.handles.lock()) {
            let _ = handle.join();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Transaction;
    use margay_core::Sid;
    use margay_sched::Promise;
    use std::sync::atomic::AtomicUsize;

    struct NoopTxn {
        sid: Sid,
        root: Mutex<Arc<Promise>>,
        runs: Arc<AtomicUsize>,
    }

    impl Transaction for NoopTxn {
        fn serial_id(&self) -> Sid {
            self.sid
        }

        fn prepare_state(&self, _rt: &Runtime, _core: usize) {}

        fn reset_root(&self) {
            *self.root.lock() = Promise::new();
        }

        fn root_promise(&self) -> Arc<Promise> {
            Arc::clone(&self.root.lock())
        }

        fn prepare_insert(&self, _rt: &Runtime, _core: usize) {}

        fn prepare(&self, _rt: &Runtime, _core: usize) {}

        fn run(&self, _rt: &Runtime, _core: usize) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoopClient {
        runs: Arc<AtomicUsize>,
    }

    impl Client for NoopClient {
        fn generate_benchmarks(&self, rt: &Runtime) -> Vec<EpochTxnSet> {
            let opts = rt.options();
            (1..opts.max_epoch)
                .map(|epoch| {
                    let txns: Vec<Arc<dyn Transaction>> = (1..=opts.txns_per_epoch as u64)
                        .map(|seq| {
                            Arc::new(NoopTxn {
                                sid: Sid::new(epoch, seq, opts.node_id),
                                root: Mutex::new(Promise::new()),
                                runs: Arc::clone(&self.runs),
                            }) as Arc<dyn Transaction>
                        })
                        .collect();
                    EpochTxnSet::new(opts.nr_threads, txns)
                })
                .collect()
        }
    }

    #[test]
    fn test_phase_machine_drives_every_txn_once_per_epoch() {
        let mut opts = Options::default();
        opts.nr_threads = 2;
        opts.max_epoch = 3;
        opts.txns_per_epoch = 8;
        let rt = Runtime::new(opts).unwrap();

        let gc_calls = Arc::new(AtomicUsize::new(0));
        let gc = Arc::clone(&gc_calls);
        rt.set_gc_pass(move |_core| {
            gc.fetch_add(1, Ordering::SeqCst);
        });

        let runs = Arc::new(AtomicUsize::new(0));
        let client = NoopClient {
            runs: Arc::clone(&runs),
        };
        let report = rt.run(&client);

        // Two executing epochs, eight transactions each.
        assert_eq!(rt.cur_epoch_nr(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 16);
        // The GC pass ran on each core during each Initialize phase.
        assert_eq!(gc_calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.cpu, 2);
        assert!(report.throughput > 0);
        assert_eq!(rt.dispatcher().completion().left_over(), 0);
    }
}
