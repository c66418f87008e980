//! Benchmarks for dirty propagation and the flush loop.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trellis_core::{Computed, Derived, ListenOptions, Runtime, State, Watcher};

/// A linear chain of computeds: write the head, pull the tail.
fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");

    for depth in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let head = State::new(0u64);
            let mut tail = Computed::new({
                let head = head.clone();
                move || head.get()
            });
            for _ in 1..depth {
                let prev = tail.clone();
                tail = Computed::new(move || prev.get() + 1);
            }
            let mut n = 0;

            b.iter(|| {
                n += 1;
                head.set(n);
                black_box(tail.get());
            });
        });
    }

    group.finish();
}

/// One state read by many watchers: write, then settle.
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    for width in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            let source = State::new(0u64);
            let mut listeners = Vec::with_capacity(width);
            for i in 0..width as u64 {
                let source = source.clone();
                let watcher = Watcher::new(move || source.get() + i);
                listeners.push(watcher.listen(
                    |value| {
                        black_box(value.ok());
                    },
                    ListenOptions::default(),
                ));
            }
            runtime.block_on(Runtime::settled());
            let mut n = 0;

            b.iter(|| {
                n += 1;
                source.set(n);
                runtime.block_on(Runtime::settled());
            });
        });
    }

    group.finish();
}

/// Equal writes at the head of a diamond must stay free.
fn bench_unchanged_diamond(c: &mut Criterion) {
    c.bench_function("diamond_unchanged", |b| {
        let source = State::new(0u64);
        let parity = Computed::new({
            let source = source.clone();
            move || source.get() % 2
        });
        let left = Computed::new({
            let parity = parity.clone();
            move || parity.get() + 1
        });
        let right = Computed::new({
            let parity = parity.clone();
            move || parity.get() * 2
        });
        let bottom = Computed::new(move || left.get() + right.get());
        let mut n = 0;

        b.iter(|| {
            n += 2;
            source.set(n);
            black_box(bottom.get());
        });
    });
}

/// Keyed derivation lookups through the scope cache.
fn bench_derived_lookup(c: &mut Criterion) {
    c.bench_function("derived_lookup", |b| {
        let square = Derived::new(|n: &u64| Ok(n * n));
        for n in 0..1000 {
            square.get(n);
        }

        b.iter(|| {
            for n in 0..1000 {
                black_box(square.get(n));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_chain,
    bench_fan_out,
    bench_unchanged_diamond,
    bench_derived_lookup
);
criterion_main!(benches);
