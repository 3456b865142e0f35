//! The client workload contract

use crate::runtime::Runtime;
use margay_core::Sid;
use margay_sched::Promise;
use std::sync::Arc;

/// One transaction of the batch workload.
///
/// The engine drives every transaction through the three phase methods,
/// once per epoch phase. Each phase method rebuilds work under the
/// transaction's root promise; the engine completes the root to hand the
/// work to the dispatcher.
pub trait Transaction: Send + Sync {
    /// The serial id assigned at generation time.
    fn serial_id(&self) -> Sid;

    /// Allocate the typed state shared by this transaction's pieces.
    /// Runs once per epoch before the Insert phase.
    fn prepare_state(&self, rt: &Runtime, core: usize);

    /// Discard the previous phase's root promise.
    fn reset_root(&self);

    /// The head of the continuation graph for the current phase.
    fn root_promise(&self) -> Arc<Promise>;

    /// Insert phase: create rows this transaction will populate.
    fn prepare_insert(&self, rt: &Runtime, core: usize);

    /// Initialize phase: resolve rows and append this transaction's
    /// pending versions.
    fn prepare(&self, rt: &Runtime, core: usize);

    /// Execute phase: issue the execution pieces.
    fn run(&self, rt: &Runtime, core: usize);
}

/// A pre-generated epoch's worth of transactions, sliced per core.
pub struct EpochTxnSet {
    per_core: Vec<Vec<Arc<dyn Transaction>>>,
}

impl EpochTxnSet {
    /// Slice `txns` across `nr_cores` cores round-robin, matching the
    /// generation order `(j - 1) % nr_cores`.
    pub fn new(nr_cores: usize, txns: Vec<Arc<dyn Transaction>>) -> EpochTxnSet {
        let mut per_core: Vec<Vec<Arc<dyn Transaction>>> = (0..nr_cores).map(|_| Vec::new()).collect();
        for (j, txn) in txns.into_iter().enumerate() {
            per_core[j % nr_cores].push(txn);
        }
        EpochTxnSet { per_core }
    }

    /// The transactions assigned to `core`.
    pub fn core_slice(&self, core: usize) -> &[Arc<dyn Transaction>] {
        &self.per_core[core]
    }

    /// Total transactions in the set.
    pub fn len(&self) -> usize {
        self.per_core.iter().map(Vec::len).sum()
    }

    /// True when the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The benchmark client: generates the batch and the priority stream.
pub trait Client: Send + Sync {
    /// Pre-create every epoch's transactions. Index 0 holds epoch 1.
    fn generate_benchmarks(&self, rt: &Runtime) -> Vec<EpochTxnSet>;

    /// Pre-generate priority transactions and push them into the
    /// priority service. The default workload has none.
    fn generate_priority_txns(&self, rt: &Runtime) {
        let _ = rt;
    }
}
