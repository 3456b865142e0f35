//! Priority latency accounting

use parking_lot::Mutex;
use serde_json::json;

#[derive(Default, Debug, Clone, Copy)]
struct Agg {
    sum: u64,
    cnt: u64,
    max: u64,
}

impl Agg {
    fn add(&mut self, v: u64) {
        self.sum += v;
        self.cnt += 1;
        self.max = self.max.max(v);
    }

    fn avg(&self) -> f64 {
        if self.cnt == 0 {
            0.0
        } else {
            self.sum as f64 / self.cnt as f64
        }
    }
}

#[derive(Default, Debug)]
struct Inner {
    init_queue: Agg,
    init_fail: Agg,
    init_succ: Agg,
    exec_queue: Agg,
    exec: Agg,
    total_latency: Agg,
    init_fail_cnt: u64,
}

/// Latency aggregates for the priority path, all in microseconds:
/// time spent queued before admission, admission retries and the final
/// successful attempt, queueing of the first execution piece, execution
/// itself, and end-to-end latency from arrival.
#[derive(Default)]
pub struct LatencyStats {
    inner: Mutex<Inner>,
}

impl LatencyStats {
    /// Record time from arrival to the first admission attempt.
    pub fn record_init_queue(&self, us: u64) {
        self.inner.lock().init_queue.add(us);
    }

    /// Record time burned by failed admission attempts and how many
    /// there were, plus the duration of the successful attempt.
    pub fn record_init(&self, succ_us: u64, fail_us: u64, fail_cnt: u64) {
        let mut inner = self.inner.lock();
        inner.init_succ.add(succ_us);
        inner.init_fail.add(fail_us);
        inner.init_fail_cnt += fail_cnt;
    }

    /// Record time the first execution piece waited in the queues.
    pub fn record_exec_queue(&self, us: u64) {
        self.inner.lock().exec_queue.add(us);
    }

    /// Record execution time and end-to-end latency.
    pub fn record_exec(&self, exec_us: u64, total_us: u64) {
        let mut inner = self.inner.lock();
        inner.exec.add(exec_us);
        inner.total_latency.add(total_us);
    }

    /// Log the aggregate summary, mirroring the JSON report plus maxima.
    pub fn log_summary(&self) {
        let inner = self.inner.lock();
        for (label, agg) in [
            ("init_queue", &inner.init_queue),
            ("init_fail", &inner.init_fail),
            ("init_succ", &inner.init_succ),
            ("exec_queue", &inner.exec_queue),
            ("exec", &inner.exec),
            ("total_latency", &inner.total_latency),
        ] {
            tracing::info!(label, avg_us = agg.avg(), max_us = agg.max, "priority latency");
        }
        tracing::info!(failed_attempts = inner.init_fail_cnt, "priority admission retries");
    }

    /// The latency report, keyed for lexicographic display order.
    pub fn report(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        json!({
            "1init_queue": inner.init_queue.avg(),
            "2init_fail": inner.init_fail.avg(),
            "3init_succ": inner.init_succ.avg(),
            "4exec_queue": inner.exec_queue.avg(),
            "5exec": inner.exec.avg(),
            "6total_latency": inner.total_latency.avg(),
            "7init_fail_cnt": inner.init_fail_cnt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_keys_and_averages() {
        let stats = LatencyStats::default();
        stats.record_init_queue(10);
        stats.record_init_queue(20);
        stats.record_init(5, 100, 3);
        stats.record_exec_queue(7);
        stats.record_exec(40, 200);

        let report = stats.report();
        assert_eq!(report["1init_queue"], 15.0);
        assert_eq!(report["2init_fail"], 100.0);
        assert_eq!(report["3init_succ"], 5.0);
        assert_eq!(report["4exec_queue"], 7.0);
        assert_eq!(report["5exec"], 40.0);
        assert_eq!(report["6total_latency"], 200.0);
        assert_eq!(report["7init_fail_cnt"], 3);
    }
}
