//! Error taxonomy
//!
//! The engine distinguishes four kinds of failure. Contract violations and
//! resource exhaustion indicate a client or scheduler bug and abort the
//! process with a diagnostic; priority conflicts are an expected admission
//! outcome surfaced as a normal `Err`; suspected deadlocks are diagnostics
//! only and never unwind.

use crate::sid::Sid;
use thiserror::Error;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the execution core.
#[derive(Debug, Error)]
pub enum Error {
    /// A protocol invariant was broken by the caller or the scheduler.
    ///
    /// These never occur in a correct deployment; the public entry points
    /// abort on them rather than propagate.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A preallocated arena or queue ran out of capacity.
    ///
    /// Sizes are configured up front from the workload parameters, so this
    /// aborts as well.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// Priority admission lost to the batch frontier; the caller may retry
    /// with a fresh serial id or give up.
    #[error("priority admission conflict at {sid}")]
    PriorityConflict {
        /// The serial id the transaction attempted to claim.
        sid: Sid,
    },

    /// Invalid runtime configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// True when retrying admission with a fresh serial id can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PriorityConflict { .. })
    }
}

/// Abort the process with a contract-violation diagnostic.
///
/// Divergent writes, unsorted version arrays and similar conditions land
/// here. The message must carry enough state for the operator to file a
/// useful report.
#[macro_export]
macro_rules! contract_abort {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*)
    }};
}
