//! Promise graph and per-core dispatch for Margay
//!
//! Work flows through here as *promise routines*: continuation fragments
//! with a captured context, a scheduling key (the serial id) and a target
//! core. The [`Dispatcher`] keeps a two-queue discipline per core, with
//! the zero-key FIFO strictly ahead of keyed min-heap order, and the
//! [`Executor`] runs routines with cooperative relief while a routine
//! blocks on a pending version.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod dispatch;
mod exec;
mod promise;

pub use dispatch::{DispatchConfig, Dispatcher, Routine};
pub use exec::{Executor, RoutineCtx, RoutineFn};
pub use promise::{decode_capture, encode_capture, Promise, PromiseRoutine, Value, ANY_CORE};

/// An empty input value.
pub fn empty_value() -> Value {
    std::sync::Arc::from(Vec::new().into_boxed_slice())
}
