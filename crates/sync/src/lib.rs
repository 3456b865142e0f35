//! Wait/notify plumbing for Margay
//!
//! - [`SpinnerService`]: per-core single-slot signalling used to block a
//!   routine on a pending version and wake it when the value arrives
//! - [`CompletionCounter`]: the phase barrier's countdown with an
//!   on-complete callback
//! - [`FutureValue`]: one-shot value handoff between pieces of a
//!   partitioned plan

#![warn(missing_docs)]
#![warn(clippy::all)]

mod completion;
mod future;
mod spinner;

pub use completion::CompletionCounter;
pub use future::FutureValue;
pub use spinner::SpinnerService;
