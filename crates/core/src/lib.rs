//! Core types for Margay
//!
//! This crate defines the foundational types used throughout the engine:
//! - Sid: the total-ordered 64-bit serial id (node ∥ sequence ∥ epoch)
//! - Options: runtime configuration (worker geometry, priority parameters)
//! - Error: error taxonomy shared by all crates

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod object;
pub mod options;
pub mod sid;

pub use error::{Error, Result};
pub use options::Options;
pub use sid::Sid;

/// Cache line size assumed by the per-core data structures.
pub const CACHE_LINE: usize = 64;

/// Upper bound on worker threads; per-core arrays are sized to this.
pub const MAX_NR_THREADS: usize = 32;
