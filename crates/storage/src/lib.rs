//! Multi-version rows for Margay
//!
//! A [`VHandle`] is the only shared-mutable structure on the hot path: a
//! sorted-by-serial-id version array with single-store value publication,
//! a pending-value wait protocol, per-slot read marks for the priority
//! admission protocol, and epoch-boundary garbage collection.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod vhandle;

pub use vhandle::{ReadResult, VHandle};
