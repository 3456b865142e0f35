//! Memory management for Margay
//!
//! Everything here is bump-oriented: memory is carved out of large
//! mmap-backed regions, handed out by pointer-advance, and reclaimed in
//! bulk at epoch or phase boundaries. There is no per-allocation free on
//! any hot path.
//!
//! - [`Region`]: an mmap-backed block, optionally NUMA-bound and mlocked
//! - [`Brk`]: a bump allocator over a byte range
//! - [`PromiseArena`]: per-thread two-tier arena (large + mini) for
//!   promise capture blobs
//! - [`EpochMemory`]: the per-node, per-thread epoch region reset at each
//!   advance

#![warn(missing_docs)]
#![warn(clippy::all)]

mod arena;
mod brk;
mod epoch_mem;
mod region;

pub use arena::PromiseArena;
pub use brk::Brk;
pub use epoch_mem::EpochMemory;
pub use region::Region;
