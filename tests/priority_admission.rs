//! End-to-end priority admission scenarios.

use margay::workload::{counter_of, MicroClient, MicroConfig};
use margay::{Options, PriorityCtx, PriorityTxn, Runtime, Sid, Table, VHandle};
use margay_sync::SpinnerService;
use std::sync::Arc;

fn priority_opts() -> Options {
    let mut opts = Options::default();
    opts.nr_threads = 2;
    opts.slot_percentage = 20; // k = 6
    opts.backoff_distance = 0;
    opts.nr_priority_txn = 4;
    opts.interval_priority_txn = 0;
    opts
}

fn ctx(rt: &Runtime) -> PriorityCtx<'_> {
    PriorityCtx {
        core: 0,
        exec: rt.exec().as_ref(),
        service: rt.service().as_ref(),
        arena: rt.arena(0),
    }
}

/// Admission success: with sequences 1..=5 occupied by the batch, the
/// priority transaction lands in reserved slot 6, both update handles
/// carry its pending version, and the write and commit go through.
#[test]
fn admission_takes_reserved_slot() {
    let rt = Runtime::new(priority_opts()).unwrap();

    let rows: Vec<Arc<VHandle>> = (0..2).map(|_| Arc::new(VHandle::new(0, 1))).collect();
    for seq in 1..=5u64 {
        let sid = Sid::new(1, seq, 1);
        rows[0].append_new_version(sid);
        rows[0].write_with_version(sid, Some(b"batch"), rt.spinner());
        rt.service().update_progress(0, sid.raw());
    }

    let mut txn = PriorityTxn::new(1, 0, |_, _| true);
    txn.register_update(Arc::clone(&rows[0]));
    txn.register_update(Arc::clone(&rows[1]));
    assert!(txn.init(&ctx(&rt)));

    let sid = txn.serial_id();
    assert_eq!(sid.sequence(), 6);
    assert!(rows[0].versions().contains(&sid));
    assert_eq!(rows[1].versions(), vec![sid]);

    rows[0].write_with_version(sid, Some(b"pri"), rt.spinner());
    rows[1].write_with_version(sid, Some(b"pri"), rt.spinner());
    assert!(txn.commit());

    let read = rows[1].read_with_version(Sid::new(1, 7, 1), 0, rt.spinner(), false, || {});
    assert_eq!(read.value(), Some(&b"pri"[..]));
}

/// Admission failure: the second handle's committed version sits above
/// the chosen slot, so admission fails after appending into the first
/// handle, which is rolled back with the skip marker. Reads above the
/// failed slot resolve to the prior version as if the splice never
/// happened.
#[test]
fn failed_admission_rolls_back_first_handle() {
    let rt = Runtime::new(priority_opts()).unwrap();
    let spinner = rt.spinner();

    let early = Arc::new(VHandle::new(0, 1));
    let s1 = Sid::new(1, 1, 1);
    early.append_new_version(s1);
    early.write_with_version(s1, Some(b"prior"), spinner);

    let blocked = Arc::new(VHandle::new(0, 1));
    let high = Sid::new(1, 20, 1);
    blocked.append_new_version(high);
    blocked.write_with_version(high, Some(b"late"), spinner);

    rt.service().update_progress(0, s1.raw());

    let mut txn = PriorityTxn::new(1, 0, |_, _| true);
    txn.register_update(Arc::clone(&early));
    txn.register_update(Arc::clone(&blocked));
    assert!(!txn.init(&ctx(&rt)));

    let slot = Sid::new(1, 6, 1);
    // Whichever handle was claimed first (address order) holds the skip
    // marker; the blocked handle never gained a version at the slot.
    if early.versions().contains(&slot) {
        let read = early.read_with_version(Sid::new(1, 9, 1), 0, spinner, false, || {});
        assert_eq!(read.value(), Some(&b"prior"[..]));
    }
    assert!(!blocked.versions().contains(&slot));
    let read = blocked.read_with_version(Sid::new(1, 25, 1), 0, spinner, false, || {});
    assert_eq!(read.value(), Some(&b"late"[..]));
}

/// Full run with a priority stream: every batch commit and every
/// committed priority transaction is accounted for exactly once, and the
/// latency report is written.
#[test]
fn priority_stream_interleaves_with_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = priority_opts();
    opts.max_epoch = 3; // two executing epochs
    opts.txns_per_epoch = 300;
    opts.output_dir = Some(dir.path().to_path_buf());

    let rt = Runtime::new(opts).unwrap();
    let client = MicroClient::new(MicroConfig {
        table_size: 128,
        seed: 11,
    });
    let report = rt.run(&client);
    assert!(report.throughput > 0);

    // Counters account for 2 increments per batch transaction plus 2 per
    // committed priority transaction; rolled-back admissions leave no
    // trace in the totals.
    let spinner = SpinnerService::new(1);
    let read_at = Sid::new(100, 1, 0);
    let mut total = 0u64;
    for key in 0u64..128 {
        if let Some(row) = client.table().search(&key.to_be_bytes()) {
            total += counter_of(row.read_with_version(read_at, 0, &spinner, false, || {}));
        }
    }
    let batch_total = 2 * 2 * 300;
    assert!(total >= batch_total);
    assert_eq!((total - batch_total) % 2, 0);

    let latency = std::fs::read_to_string(dir.path().join("pri_latency.json")).unwrap();
    let v: serde_json::Value = serde_json::from_str(&latency).unwrap();
    for key in [
        "1init_queue",
        "2init_fail",
        "3init_succ",
        "4exec_queue",
        "5exec",
        "6total_latency",
        "7init_fail_cnt",
    ] {
        assert!(v.get(key).is_some(), "missing latency key {key}");
    }
}
