//! Runtime options
//!
//! All knobs the core consumes, gathered in one place and threaded through
//! runtime construction. Options come from defaults, the builder methods,
//! or `MARGAY_*` environment variables; they are fixed once the runtime is
//! built.

use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Execution-phase wall time estimate used to derive priority arrival
/// parameters from an incoming rate, in milliseconds.
const EXEC_PHASE_ESTIMATE_MS: usize = 85;

/// Runtime configuration for the execution core.
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of worker threads, one pinned per core.
    pub nr_threads: usize,
    /// First physical core workers are pinned to.
    pub core_shifting: usize,
    /// Cores per NUMA node; determines region affinity.
    pub nr_cores_per_node: usize,
    /// This node's id in the serial-id space.
    pub node_id: u8,

    /// Partitioned execution plans: route pieces by key partition.
    pub enable_partition: bool,
    /// Pin each partition's pieces to its owning core.
    pub pin_partitions: bool,

    /// Number of epochs to run (epoch 0 never executes).
    pub max_epoch: u64,
    /// Transactions generated per epoch.
    pub txns_per_epoch: usize,

    /// Mark a read bit on every resolved version slot.
    pub read_bit: bool,
    /// Capacity of each core's priority-transaction inbox.
    pub txn_queue_length: usize,
    /// Percentage of the sequence space reserved for priority slots.
    /// Zero disables priority admission.
    pub slot_percentage: usize,
    /// Distance in sequence numbers to place priority work ahead of the
    /// batch frontier; may be negative.
    pub backoff_distance: i64,
    /// Priority transactions issued per epoch.
    pub nr_priority_txn: usize,
    /// Arrival interval between priority transactions, in microseconds.
    pub interval_priority_txn: usize,

    /// Where JSON reports are written; `None` disables reporting.
    pub output_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            nr_threads: 4,
            core_shifting: 0,
            nr_cores_per_node: 8,
            node_id: 1,
            enable_partition: false,
            pin_partitions: false,
            max_epoch: 4,
            txns_per_epoch: 1000,
            read_bit: false,
            txn_queue_length: 32 << 10,
            slot_percentage: 0,
            backoff_distance: 100,
            nr_priority_txn: 0,
            interval_priority_txn: 0,
            output_dir: None,
        }
    }
}

impl Options {
    /// Read options from `MARGAY_*` environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Options> {
        let mut opts = Options::default();
        if let Some(v) = env_usize("MARGAY_NR_THREADS")? {
            opts.nr_threads = v;
        }
        if let Some(v) = env_usize("MARGAY_CORE_SHIFTING")? {
            opts.core_shifting = v;
        }
        if let Some(v) = env_usize("MARGAY_CORES_PER_NODE")? {
            opts.nr_cores_per_node = v;
        }
        if let Some(v) = env_usize("MARGAY_MAX_EPOCH")? {
            opts.max_epoch = v as u64;
        }
        if let Some(v) = env_usize("MARGAY_TXNS_PER_EPOCH")? {
            opts.txns_per_epoch = v;
        }
        opts.enable_partition = env_flag("MARGAY_ENABLE_PARTITION");
        opts.pin_partitions = env_flag("MARGAY_PIN_PARTITIONS");
        opts.read_bit = env_flag("MARGAY_READ_BIT");
        if let Some(v) = env_usize("MARGAY_TXN_QUEUE_LENGTH")? {
            opts.txn_queue_length = v;
        }
        if let Some(v) = env_usize("MARGAY_SLOT_PERCENTAGE")? {
            opts.slot_percentage = v;
        }
        if let Some(v) = env_i64("MARGAY_BACKOFF_DIST")? {
            opts.backoff_distance = v;
        }

        let nr_pri = env_usize("MARGAY_NR_PRIORITY_TXN")?;
        let interval = env_usize("MARGAY_INTERVAL_PRIORITY_TXN")?;
        let rate = env_usize("MARGAY_INCOMING_RATE")?;
        match (rate, nr_pri, interval) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(Error::InvalidConfig(
                    "MARGAY_INCOMING_RATE is exclusive with MARGAY_NR_PRIORITY_TXN / \
                     MARGAY_INTERVAL_PRIORITY_TXN"
                        .into(),
                ));
            }
            (Some(rate), None, None) => opts.set_incoming_rate(rate)?,
            (None, Some(n), Some(i)) => {
                opts.nr_priority_txn = n;
                opts.interval_priority_txn = i;
            }
            (None, Some(_), None) | (None, None, Some(_)) => {
                return Err(Error::InvalidConfig(
                    "specify both MARGAY_NR_PRIORITY_TXN and MARGAY_INTERVAL_PRIORITY_TXN \
                     (or MARGAY_INCOMING_RATE)"
                        .into(),
                ));
            }
            (None, None, None) => {}
        }

        if let Some(v) = env::var_os("MARGAY_OUTPUT_DIR") {
            opts.output_dir = Some(PathBuf::from(v));
        }
        opts.validate()?;
        Ok(opts)
    }

    /// Derive `nr_priority_txn` / `interval_priority_txn` from an incoming
    /// rate in transactions per second.
    pub fn set_incoming_rate(&mut self, rate: usize) -> Result<()> {
        self.nr_priority_txn = rate * EXEC_PHASE_ESTIMATE_MS / 1000;
        if self.nr_priority_txn == 0 {
            return Err(Error::InvalidConfig(
                "incoming rate yields zero priority transactions per epoch".into(),
            ));
        }
        self.interval_priority_txn = EXEC_PHASE_ESTIMATE_MS * 1000 / self.nr_priority_txn;
        Ok(())
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.nr_threads == 0 || self.nr_threads > crate::MAX_NR_THREADS {
            return Err(Error::InvalidConfig(format!(
                "nr_threads must be in 1..={}, got {}",
                crate::MAX_NR_THREADS,
                self.nr_threads
            )));
        }
        if self.max_epoch < 2 {
            return Err(Error::InvalidConfig(
                "max_epoch must be at least 2 (epoch 0 never executes)".into(),
            ));
        }
        if self.slot_percentage > 100 {
            return Err(Error::InvalidConfig(format!(
                "slot_percentage must be at most 100, got {}",
                self.slot_percentage
            )));
        }
        if self.nr_priority_txn > 0 && self.slot_percentage == 0 {
            return Err(Error::InvalidConfig(
                "priority transactions require a nonzero slot_percentage".into(),
            ));
        }
        Ok(())
    }

    /// Width of a reserved-slot stripe: every `k`-th sequence belongs to
    /// priority work.
    ///
    /// Returns `None` when priority admission is disabled.
    pub fn slot_stride(&self) -> Option<u64> {
        if self.slot_percentage == 0 {
            None
        } else {
            Some((100 / self.slot_percentage + 1) as u64)
        }
    }

    /// NUMA node owning the given worker core.
    pub fn numa_node_of(&self, core: usize) -> usize {
        (core + self.core_shifting) / self.nr_cores_per_node
    }

    /// Whether priority work is configured at all.
    pub fn priority_enabled(&self) -> bool {
        self.nr_priority_txn > 0 && self.slot_percentage > 0
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{key}={v} is not an integer"))),
        Err(_) => Ok(None),
    }
}

fn env_i64(key: &str) -> Result<Option<i64>> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{key}={v} is not an integer"))),
        Err(_) => Ok(None),
    }
}

fn env_flag(key: &str) -> bool {
    matches!(env::var(key).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}
