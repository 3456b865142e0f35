//! End-of-experiment reports

use margay_core::Options;
use margay_priority::PriorityTxnService;
use serde_json::json;
use std::fs;

/// The experiment's headline numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Worker threads used.
    pub cpu: usize,
    /// Wall time across all executing epochs, in milliseconds.
    pub duration_ms: u64,
    /// Committed transactions per second.
    pub throughput: u64,
}

impl RunReport {
    /// JSON form of the report.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "cpu": self.cpu,
            "duration": self.duration_ms,
            "throughput": self.throughput,
        })
    }
}

/// Write the throughput report (and, when priority work ran, the latency
/// report) into the configured output directory. Reporting failures are
/// logged, never fatal.
pub(crate) fn write_reports(opts: &Options, report: &RunReport, service: &PriorityTxnService) {
    if opts.priority_enabled() {
        service.stats().log_summary();
    }
    let Some(dir) = &opts.output_dir else {
        return;
    };
    if let Err(err) = fs::create_dir_all(dir) {
        tracing::warn!(%err, "cannot create output directory");
        return;
    }

    let stamp = chrono::Local::now().format("%Y-%m-%d-%H:%M:%S");
    let path = dir.join(format!("node{}-{stamp}.json", opts.node_id));
    if let Err(err) = fs::write(&path, report.to_json().to_string()) {
        tracing::warn!(%err, path = %path.display(), "cannot write throughput report");
    }

    if opts.priority_enabled() {
        let path = dir.join("pri_latency.json");
        if let Err(err) = fs::write(&path, service.stats().report().to_string()) {
            tracing::warn!(%err, path = %path.display(), "cannot write latency report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_shape() {
        let report = RunReport {
            cpu: 4,
            duration_ms: 120,
            throughput: 83_000,
        };
        let v = report.to_json();
        assert_eq!(v["cpu"], 4);
        assert_eq!(v["duration"], 120);
        assert_eq!(v["throughput"], 83_000);
    }

    #[test]
    fn test_reports_written_to_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = Options::default();
        opts.output_dir = Some(dir.path().to_path_buf());
        opts.slot_percentage = 20;
        opts.nr_priority_txn = 2;
        opts.interval_priority_txn = 100;
        let service = PriorityTxnService::new(&opts);

        let report = RunReport {
            cpu: 2,
            duration_ms: 10,
            throughput: 100,
        };
        write_reports(&opts, &report, &service);

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 2);
        let latency = fs::read_to_string(dir.path().join("pri_latency.json")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&latency).unwrap();
        assert!(v.get("1init_queue").is_some());
        assert!(v.get("7init_fail_cnt").is_some());
    }
}
