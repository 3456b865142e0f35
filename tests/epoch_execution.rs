//! End-to-end batch execution scenarios.

use margay::workload::{counter_of, MicroClient, MicroConfig};
use margay::{Options, Runtime, Sid, Table, VHandle};
use margay_sync::SpinnerService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-record read-modify-write: a write at one serial id is visible
/// to every later read until a newer version exists.
#[test]
fn single_record_rmw() {
    let spinner = SpinnerService::new(1);
    let row = VHandle::new(0, 1);
    let sid = Sid::from_raw(0x0000_0002_0000_0100);

    row.append_new_version(sid);
    row.write_with_version(sid, Some(b"V"), &spinner);

    let just_after = Sid::from_raw(0x0000_0002_0000_0101);
    let read = row.read_with_version(just_after, 0, &spinner, false, || {});
    assert_eq!(read.value(), Some(&b"V"[..]));

    let much_later = Sid::from_raw(0x0000_0002_0000_0200);
    let read = row.read_with_version(much_later, 0, &spinner, false, || {});
    assert_eq!(read.value(), Some(&b"V"[..]));
}

/// Pending wait: a read above an unproduced version blocks until the
/// producer writes, and completes strictly after that write.
#[test]
fn pending_read_completes_after_write() {
    let spinner = Arc::new(SpinnerService::new(2));
    let row = Arc::new(VHandle::new(0, 1));
    let s1 = Sid::new(1, 5, 0);
    let s2 = Sid::new(1, 9, 0);
    row.append_new_version(s1);

    let wrote = Arc::new(AtomicBool::new(false));

    let reader = {
        let row = Arc::clone(&row);
        let spinner = Arc::clone(&spinner);
        let wrote = Arc::clone(&wrote);
        std::thread::spawn(move || {
            let read = row.read_with_version(s2, 1, &spinner, false, || {});
            // The write must have been observed before the read returned.
            assert!(wrote.load(Ordering::SeqCst));
            read.value().map(<[u8]>::to_vec)
        })
    };

    std::thread::sleep(std::time::Duration::from_millis(20));
    wrote.store(true, Ordering::SeqCst);
    row.write_with_version(s1, Some(b"V"), &spinner);

    assert_eq!(reader.join().unwrap().as_deref(), Some(&b"V"[..]));
}

/// Dispatcher extraction order: both zero-key items first in insertion
/// order, then ascending keys.
#[test]
fn dispatcher_priority_order() {
    let mut opts = Options::default();
    opts.nr_threads = 1;
    let rt = Runtime::new(opts).unwrap();

    let root = margay::Promise::new();
    for key in [0u64, 5, 0, 3] {
        root.then(&[], key, 0, 0, |_| {});
    }
    rt.exec().complete(&root, margay_sched::empty_value(), 0);

    let mut order = Vec::new();
    while let Some(r) = rt.dispatcher().peek(0, |_| true) {
        order.push(r.sched_key());
        rt.dispatcher().complete(0);
    }
    assert_eq!(order, vec![0, 0, 3, 5]);
}

/// Multi-epoch run: positive throughput, an accurate duration, empty
/// queues at the end, and epoch-boundary garbage collection leaving at
/// most one version from any non-final epoch per row.
#[test]
fn multi_epoch_run_commits_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = Options::default();
    opts.nr_threads = 2;
    opts.max_epoch = 4; // three executing epochs
    opts.txns_per_epoch = 400;
    opts.output_dir = Some(dir.path().to_path_buf());

    let rt = Runtime::new(opts).unwrap();
    let client = MicroClient::new(MicroConfig {
        table_size: 256,
        seed: 7,
    });

    let wall = std::time::Instant::now();
    let report = rt.run(&client);
    let wall_ms = wall.elapsed().as_millis() as u64;

    assert!(report.throughput > 0);
    assert!(report.duration_ms <= wall_ms + 10);

    // The dispatcher is quiescent and the completion counter balanced.
    for core in 0..2 {
        assert!(rt.dispatcher().is_idle(core));
    }
    assert_eq!(rt.dispatcher().completion().left_over(), 0);

    // Every transaction bumped two counters by one; the final counters
    // must account for every commit exactly once.
    let spinner = SpinnerService::new(1);
    let read_at = Sid::new(100, 1, 0);
    let mut total = 0u64;
    let last_epoch = 3u64;
    for key in 0u64..256 {
        let Some(row) = client.table().search(&key.to_be_bytes()) else {
            continue;
        };
        total += counter_of(row.read_with_version(read_at, 0, &spinner, false, || {}));

        // Versions from before the row's newest epoch were collapsed to
        // a single survivor at the boundary.
        let versions = row.versions();
        let newest = versions.last().unwrap().epoch_nr();
        let older = versions.iter().filter(|v| v.epoch_nr() < newest).count();
        assert!(older <= 1, "stale versions survived GC: {versions:?}");
        assert!(newest <= last_epoch);
    }
    assert_eq!(total, 2 * 3 * 400);

    // The throughput report landed in the output directory.
    let wrote_report = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with("node1-"));
    assert!(wrote_report);
}
