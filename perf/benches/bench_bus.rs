use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use shmbus_perf::bench_ring;

const RING_CAPACITY: u64 = 65536;
const ARENA_BYTES: u64 = 64 * 1024 * 1024;
const PAYLOAD: usize = 256;

fn bench_publish(c: &mut Criterion) {
    let t = bench_ring(RING_CAPACITY, ARENA_BYTES);
    let payload = [0x5Au8; PAYLOAD];

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    group.bench_function("publish", |b| {
        b.iter(|| {
            let mut scope = t.ring.writer_scope(PAYLOAD as u64, 1).expect("reserve");
            scope.bytes_mut()[..PAYLOAD].copy_from_slice(black_box(&payload));
            scope.commit(PAYLOAD as u64).expect("commit");
        });
    });

    group.finish();
}

fn bench_cursor_read(c: &mut Criterion) {
    let t = bench_ring(RING_CAPACITY, ARENA_BYTES);
    let payload = [0x5Au8; PAYLOAD];
    let mut cursor = t.view.open_cursor(0);

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    group.bench_function("cursor_read", |b| {
        b.iter_custom(|iters| {
            // Pre-fill so every read hits a fresh entry.
            for _ in 0..iters {
                let mut scope = t.ring.writer_scope(PAYLOAD as u64, 1).expect("reserve");
                scope.bytes_mut()[..PAYLOAD].copy_from_slice(&payload);
                scope.commit(PAYLOAD as u64).expect("commit");
            }
            let start = std::time::Instant::now();
            for _ in 0..iters {
                assert!(cursor.try_read(&t.view));
                black_box(t.view.entry(&cursor).bytes());
            }
            start.elapsed()
        });
    });

    group.bench_function("cursor_read_empty", |b| {
        let mut idle = t.view.open_cursor(t.view.next_index());
        b.iter(|| black_box(idle.try_read(&t.view)));
    });

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let t = bench_ring(RING_CAPACITY, ARENA_BYTES);
    let payload = [0x5Au8; PAYLOAD];
    let mut cursor = t.view.open_cursor(0);

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    group.bench_function("round_trip", |b| {
        b.iter(|| {
            let mut scope = t.ring.writer_scope(PAYLOAD as u64, 1).expect("reserve");
            scope.bytes_mut()[..PAYLOAD].copy_from_slice(black_box(&payload));
            scope.commit(PAYLOAD as u64).expect("commit");
            drop(scope);
            assert!(cursor.try_read(&t.view));
            black_box(t.view.entry(&cursor).bytes());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_publish, bench_cursor_read, bench_round_trip);
criterion_main!(benches);
