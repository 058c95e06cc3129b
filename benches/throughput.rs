//! Benchmarks for the queue variants.
//!
//! Compares the lockring variants against crossbeam-queue's ArrayQueue and
//! crossbeam-channel's bounded channel.

use std::thread;
use std::time::Instant;

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use crossbeam_queue::ArrayQueue;

// ============================================================================
// Single-threaded latency benchmarks
// ============================================================================

fn bench_single_thread_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread_latency");

    group.bench_function("lockring_counter/u64", |b| {
        let (mut tx, mut rx) = lockring::spsc::counter::channel::<u64>(1024);
        b.iter(|| {
            tx.try_send(black_box(42)).unwrap();
            black_box(rx.try_recv().unwrap())
        });
    });

    group.bench_function("lockring_cached/u64", |b| {
        let (mut tx, mut rx) = lockring::spsc::cached::channel::<u64>(1024);
        b.iter(|| {
            tx.try_send(black_box(42)).unwrap();
            black_box(rx.try_recv().unwrap())
        });
    });

    group.bench_function("lockring_slot/u64", |b| {
        let (mut tx, mut rx) = lockring::spsc::slot::channel::<u64>(1024);
        b.iter(|| {
            tx.try_send(black_box(42)).unwrap();
            black_box(rx.try_recv().unwrap())
        });
    });

    group.bench_function("lockring_mpmc/u64", |b| {
        let (tx, rx) = lockring::mpmc::channel::<u64>(1024);
        b.iter(|| {
            tx.try_send(black_box(42)).unwrap();
            black_box(rx.try_recv().unwrap())
        });
    });

    group.bench_function("crossbeam_array/u64", |b| {
        let q = ArrayQueue::<u64>::new(1024);
        b.iter(|| {
            q.push(black_box(42)).unwrap();
            black_box(q.pop().unwrap())
        });
    });

    group.bench_function("crossbeam_channel/u64", |b| {
        let (tx, rx) = crossbeam_channel::bounded::<u64>(1024);
        b.iter(|| {
            tx.try_send(black_box(42)).unwrap();
            black_box(rx.try_recv().unwrap())
        });
    });

    group.finish();
}

// ============================================================================
// Cross-thread throughput benchmarks
// ============================================================================

const STREAM_COUNT: u64 = 100_000;

fn bench_cross_thread_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("cross_thread_throughput");
    group.throughput(Throughput::Elements(STREAM_COUNT));

    group.bench_function("lockring_cached", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;
            for _ in 0..iters {
                let (mut tx, mut rx) = lockring::spsc::cached::channel::<u64>(1024);
                let start = Instant::now();
                let producer = thread::spawn(move || {
                    for i in 0..STREAM_COUNT {
                        tx.send(i).unwrap();
                    }
                });
                for _ in 0..STREAM_COUNT {
                    black_box(rx.recv().unwrap());
                }
                producer.join().unwrap();
                total += start.elapsed();
            }
            total
        });
    });

    group.bench_function("lockring_slot", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;
            for _ in 0..iters {
                let (mut tx, mut rx) = lockring::spsc::slot::channel::<u64>(1024);
                let start = Instant::now();
                let producer = thread::spawn(move || {
                    for i in 0..STREAM_COUNT {
                        tx.send(i).unwrap();
                    }
                });
                for _ in 0..STREAM_COUNT {
                    black_box(rx.recv().unwrap());
                }
                producer.join().unwrap();
                total += start.elapsed();
            }
            total
        });
    });

    group.bench_function("lockring_mpmc", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;
            for _ in 0..iters {
                let (tx, rx) = lockring::mpmc::channel::<u64>(1024);
                let start = Instant::now();
                let producer = thread::spawn(move || {
                    for i in 0..STREAM_COUNT {
                        tx.send(i).unwrap();
                    }
                });
                for _ in 0..STREAM_COUNT {
                    black_box(rx.recv().unwrap());
                }
                producer.join().unwrap();
                total += start.elapsed();
            }
            total
        });
    });

    group.bench_function("crossbeam_channel", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;
            for _ in 0..iters {
                let (tx, rx) = crossbeam_channel::bounded::<u64>(1024);
                let start = Instant::now();
                let producer = thread::spawn(move || {
                    for i in 0..STREAM_COUNT {
                        tx.send(i).unwrap();
                    }
                });
                for _ in 0..STREAM_COUNT {
                    black_box(rx.recv().unwrap());
                }
                producer.join().unwrap();
                total += start.elapsed();
            }
            total
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread_latency,
    bench_cross_thread_throughput
);
criterion_main!(benches);
