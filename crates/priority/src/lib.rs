//! Priority transactions for Margay
//!
//! Priority transactions arrive outside the batch and splice themselves
//! into the ongoing epoch ahead of the execution frontier. The sequence
//! space reserves every `k`-th serial id for them; admission appends
//! pending versions into the target rows, re-checks for conflicts, and on
//! failure rolls back by writing the skip marker.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod service;
mod stats;
mod txn;

pub use service::PriorityTxnService;
pub use stats::LatencyStats;
pub use txn::{PriorityCtx, PriorityFn, PriorityTxn};
