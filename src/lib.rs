//! Margay: an in-memory, multi-version, epoch-based OLTP execution
//! engine.
//!
//! Client workloads submit transactions; the engine batches them into
//! fixed-size epochs, places per-transaction work onto per-core priority
//! queues, and drives them through three strict phases so that each
//! epoch commits as a serializable group in serial-id order. A separate
//! stream of priority transactions splices itself into the running epoch
//! through reserved serial-id slots.
//!
//! This crate re-exports the engine surface and ships the micro
//! benchmark workload driven by the `margay-bench` binary.

pub mod workload;

pub use margay_core::{Options, Sid};
pub use margay_engine::{Client, EpochTxnSet, Phase, RunReport, Runtime, Transaction};
pub use margay_index::{HashTable, OrderedTable, Table};
pub use margay_priority::{PriorityCtx, PriorityTxn, PriorityTxnService};
pub use margay_sched::{Dispatcher, Executor, Promise, RoutineCtx};
pub use margay_storage::{ReadResult, VHandle};
