//! Per-epoch memory

use crate::{Brk, Region};
use margay_core::Options;

/// Per-thread slice of the epoch region, in bytes.
const PER_THREAD_LIMIT: usize = 16 << 20;

/// The per-node epoch region: one mapping per node, carved into
/// NUMA-local per-thread brks.
///
/// Everything allocated here lives exactly one epoch; `reset` re-carves
/// the brks at each advance and the mapping is unmapped on drop.
pub struct EpochMemory {
    node_mem: Vec<NodeMemory>,
    nr_threads: usize,
}

struct NodeMemory {
    region: Region,
    brks: Vec<Brk>,
}

impl EpochMemory {
    /// Map epoch regions for `nr_nodes` nodes with the geometry from
    /// `opts`, binding each per-thread slice to its NUMA node.
    pub fn new(opts: &Options, nr_nodes: usize) -> EpochMemory {
        tracing::info!(
            nr_nodes,
            nr_threads = opts.nr_threads,
            per_thread = PER_THREAD_LIMIT,
            "allocating epoch memory"
        );
        let node_mem = (0..nr_nodes)
            .map(|_| {
                let region = Region::anonymous(PER_THREAD_LIMIT * opts.nr_threads);
                // Each worker's slice lands on that worker's NUMA node.
                for t in 0..opts.nr_threads {
                    region.bind(t * PER_THREAD_LIMIT, PER_THREAD_LIMIT, opts.numa_node_of(t));
                }
                let brks = carve(&region, opts.nr_threads);
                NodeMemory { region, brks }
            })
            .collect();
        EpochMemory {
            node_mem,
            nr_threads: opts.nr_threads,
        }
    }

    /// The brk for `thread` on `node`.
    pub fn brk(&self, node: usize, thread: usize) -> &Brk {
        &self.node_mem[node].brks[thread]
    }

    /// A pointer `offset` bytes into `node`'s mapping.
    pub fn ptr(&self, node: usize, offset: usize) -> *mut u8 {
        unsafe { self.node_mem[node].region.base().add(offset) }
    }

    /// Rewind every per-thread brk. Runs at each epoch advance.
    pub fn reset(&mut self) {
        for node in &mut self.node_mem {
            node.brks = carve(&node.region, self.nr_threads);
        }
    }
}

fn carve(region: &Region, nr_threads: usize) -> Vec<Brk> {
    (0..nr_threads)
        .map(|t| unsafe { Brk::new(region.base().add(t * PER_THREAD_LIMIT), PER_THREAD_LIMIT) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brks_are_disjoint() {
        let mut opts = Options::default();
        opts.nr_threads = 2;
        let mem = EpochMemory::new(&opts, 1);
        let a = mem.brk(0, 0).alloc(64);
        let b = mem.brk(0, 1).alloc(64);
        assert_eq!(unsafe { a.add(PER_THREAD_LIMIT) }, b);
    }

    #[test]
    fn test_reset_recarves() {
        let mut opts = Options::default();
        opts.nr_threads = 1;
        let mut mem = EpochMemory::new(&opts, 1);
        let a = mem.brk(0, 0).alloc(128);
        mem.reset();
        let b = mem.brk(0, 0).alloc(128);
        assert_eq!(a, b);
        assert_eq!(mem.brk(0, 0).used(), 128);
    }
}
