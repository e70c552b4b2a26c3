//! Performance benchmarks for the state-update engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hydra::{
    combine, create, full_state_update, partial_state_update, population, random_input, Batch,
    BatchId, Engine, EngineConfig, Splitter,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Benchmark one full update against updating every shard sequentially
fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("update");
    let mut rng = StdRng::seed_from_u64(0);

    for m in [80, 800, 8000] {
        let state = create("mod1", 10, m, 0.7).unwrap();
        let input = random_input(1 + 10 + m, &mut rng);
        let shards = Splitter::new(6).unwrap().split(&state).unwrap();

        group.bench_with_input(BenchmarkId::new("full", m), &m, |b, _| {
            b.iter(|| black_box(full_state_update(&state, &input).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("sharded", m), &m, |b, _| {
            b.iter(|| {
                for shard in &shards {
                    black_box(partial_state_update(shard, &input).unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark split and combine round trips
fn bench_split_combine(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_combine");

    for tau in [6, 60, 600] {
        let state = create("mod1", 10, 8000, 0.5).unwrap();

        group.bench_with_input(BenchmarkId::new("tau_local", tau), &tau, |b, &tau| {
            b.iter(|| {
                let splitter = Splitter::new(tau).unwrap();
                let shards = splitter.split(&state).unwrap();
                black_box(combine(shards).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark one engine batch across worker counts
fn bench_process_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_batch");
    group.sample_size(20);

    for workers in [1, 2, 4, 8] {
        let engine = Engine::new(EngineConfig {
            workers,
            barrier_timeout_factor: 1000,
            ..Default::default()
        })
        .unwrap();
        engine
            .register_all(population("mod", 500, 10, 80, (0.5, 1.0)).unwrap())
            .unwrap();
        let keys = engine.keys();
        let input = random_input(91, &mut StdRng::seed_from_u64(1));
        let mut next = BatchId(1);

        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, _| {
            b.iter(|| {
                let batch = Batch::broadcast(next, keys.iter().cloned(), input.clone());
                next = next.next();
                black_box(engine.process_batch(&batch).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_update, bench_split_combine, bench_process_batch);
criterion_main!(benches);
