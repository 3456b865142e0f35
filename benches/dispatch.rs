//! Dispatcher add/peek throughput.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use margay_sched::{empty_value, DispatchConfig, Dispatcher, Promise, Routine};
use margay_sync::{CompletionCounter, SpinnerService};
use std::sync::Arc;

fn routines(keys: &[u64]) -> Vec<Routine> {
    let root = Promise::new();
    for key in keys {
        root.then(&[], *key, 0, 0, |_| {});
    }
    root.take_routines()
        .into_iter()
        .map(|inner| Routine {
            inner,
            input: empty_value(),
        })
        .collect()
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(
        1,
        DispatchConfig {
            max_items_per_core: 1 << 16,
        },
        Arc::new(SpinnerService::new(1)),
        Arc::new(CompletionCounter::new(0, |_| {})),
    )
}

fn bench_add_peek(c: &mut Criterion) {
    let keys: Vec<u64> = (1..=1024u64).rev().collect();

    c.bench_function("dispatch/add_peek_1k_keyed", |b| {
        b.iter_batched(
            || (dispatcher(), routines(&keys)),
            |(d, items)| {
                d.add(0, items);
                while d.peek(0, |_| true).is_some() {}
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("dispatch/add_peek_1k_zero_key", |b| {
        let zeros: Vec<u64> = vec![0; 1024];
        b.iter_batched(
            || (dispatcher(), routines(&zeros)),
            |(d, items)| {
                d.add(0, items);
                while d.peek(0, |_| true).is_some() {}
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_add_peek);
criterion_main!(benches);
