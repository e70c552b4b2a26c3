//! Scaling tests with synthetic model populations.
//!
//! Measures the cost of the main engine operations:
//! - Registering (and splitting) thousands of models
//! - Fixed-window throughput across worker counts
//! - Checkpointing and recovering a large table
//!
//! Run with `cargo test --release --test scaling -- --nocapture` to see the
//! timings.

use hydra::{
    linear_fit, measure, population, reports_to_json, Batch, BatchId, CheckpointConfig, Engine,
    EngineConfig, InputVector, QueueSource, ThroughputSweep,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MODEL_COUNT: usize = 2_000;

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report(&self) {
        println!("  {} took {:.2}ms", self.name, self.elapsed_ms());
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        let per_item = if count > 0 { ms / count as f64 } else { 0.0 };
        println!(
            "  {} took {:.2}ms ({} items, {:.4}ms/item, {:.0} items/sec)",
            self.name,
            ms,
            count,
            per_item,
            if ms > 0.0 { count as f64 / (ms / 1000.0) } else { 0.0 }
        );
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

fn scaling_config(workers: usize) -> EngineConfig {
    EngineConfig {
        workers,
        barrier_timeout_factor: 200,
        ..Default::default()
    }
}

// =============================================================================
// Test: Registration and batches over a large sharded population
// =============================================================================

#[test]
fn test_scaling_sharded_population() {
    init_tracing();
    println!("\n=== {} Models, n = 10, m = 80 ===", MODEL_COUNT);

    let engine = Engine::new(scaling_config(8)).unwrap();

    let timer = Timer::new("Build population");
    let models = population("mod", MODEL_COUNT, 10, 80, (0.5, 1.0)).unwrap();
    timer.report_with_count(models.len());

    let timer = Timer::new("Register and split");
    engine.register_all(models).unwrap();
    timer.report_with_count(MODEL_COUNT);

    let stats = engine.stats();
    assert_eq!(stats.key_count, MODEL_COUNT as u64);
    assert_eq!(stats.sharded_key_count, MODEL_COUNT as u64);
    assert_eq!(stats.shard_count, 14 * MODEL_COUNT as u64);

    let mut rng = StdRng::seed_from_u64(3);
    let source = QueueSource::random(engine.keys(), 5, 91, &mut rng);

    let timer = Timer::new("Process 5 batches");
    let summary = engine.run(source, None).unwrap();
    timer.report_with_count(summary.processed as usize);

    assert_eq!(summary.batches, 5);
    assert_eq!(summary.processed, 5 * MODEL_COUNT as u64);
    assert_eq!(summary.lost, 0);

    println!("  ✓ Sharded population test passed");
}

// =============================================================================
// Test: Throughput across worker counts
// =============================================================================

#[test]
fn test_scaling_worker_sweep() {
    init_tracing();
    println!("\n=== Throughput Sweep ===");

    let sweep = ThroughputSweep {
        workers: vec![1, 2, 4],
        window: Duration::from_millis(300),
        models: 200,
        queued_batches: 10,
        engine: scaling_config(1),
        ..Default::default()
    };

    let mut reports = Vec::new();
    for &workers in &sweep.workers {
        let report = measure(&sweep, workers).unwrap();
        println!(
            "  workers = {:>3}: {:>8} states, {:>4} batches, {:.0} states/sec",
            report.workers,
            report.processed,
            report.batches,
            report.states_per_sec()
        );
        assert!(report.batches > 0);
        assert_eq!(report.processed, report.batches * sweep.models as u64);
        reports.push(report);
    }

    let json = reports_to_json(&reports).unwrap();
    println!("{}", json);
    assert!(json.contains("\"workers\": 4"));

    let fit = linear_fit(&reports).unwrap();
    println!(
        "  fit: processed = {:.1} + {:.1} * workers",
        fit.intercept, fit.slope
    );
    assert!(fit.intercept.is_finite());
    assert!(fit.slope.is_finite());

    println!("  ✓ Worker sweep test passed");
}

// =============================================================================
// Test: Checkpoint and recovery of a large table
// =============================================================================

#[test]
fn test_scaling_checkpoint_recovery() {
    init_tracing();
    println!("\n=== Checkpoint {} Models ===", MODEL_COUNT);

    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        checkpoint: Some(CheckpointConfig {
            path: dir.path().join("checkpoint"),
            every_batches: 1,
            retain: 1,
        }),
        ..scaling_config(4)
    };

    let expected = {
        let engine = Engine::new(config.clone()).unwrap();
        engine
            .register_all(population("mod", MODEL_COUNT, 10, 80, (0.5, 1.0)).unwrap())
            .unwrap();

        let batch = Batch::broadcast(BatchId(1), engine.keys(), InputVector::zeros(91));
        let timer = Timer::new("Batch with checkpoint");
        let report = engine.process_batch(&batch).unwrap();
        timer.report();
        assert!(report.checkpoint.is_some());

        engine.full_state("mod1000").unwrap()
    };

    let timer = Timer::new("Recover");
    let engine = Engine::recover(config).unwrap();
    timer.report();

    assert_eq!(engine.keys().len(), MODEL_COUNT);
    assert_eq!(engine.full_state("mod1000").unwrap(), expected);

    println!("  ✓ Checkpoint recovery test passed");
}
