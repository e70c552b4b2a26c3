//! Fixed-window throughput measurement across worker counts.
//!
//! For each worker count a fresh engine is loaded with a model population,
//! fed a cycled queue of random input batches broadcast to every model, and
//! left running for a fixed wall-clock window. The number of states fully
//! updated or combined inside the window is the throughput figure.

use crate::engine::{Engine, EngineConfig};
use crate::error::{EngineError, Result};
use crate::source::QueueSource;
use crate::state::population;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// Worker counts swept by default.
pub const DEFAULT_WORKER_COUNTS: [usize; 22] = [
    1, 2, 4, 8, 16, 20, 24, 28, 32, 36, 40, 48, 54, 60, 64, 70, 75, 80, 90, 100, 110, 128,
];

/// Description of a throughput sweep.
///
/// Sweeps are usually read from JSON; omitted fields keep their defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputSweep {
    /// Worker counts to measure, in order.
    pub workers: Vec<usize>,

    /// Wall-clock window per measurement.
    pub window: Duration,

    /// Number of models in the population.
    pub models: usize,

    /// Local variables per model.
    pub n: usize,

    /// Parameter variables per model.
    pub m: usize,

    /// `nu` is spread linearly over this range.
    pub nu_range: (f64, f64),

    /// Distinct input vectors in the replayed queue.
    pub queued_batches: usize,

    /// Seed for input generation.
    pub seed: u64,

    /// Engine settings; `workers` is overridden per point.
    pub engine: EngineConfig,
}

impl Default for ThroughputSweep {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKER_COUNTS.to_vec(),
            window: Duration::from_secs(30),
            models: 10_000,
            n: 10,
            m: 80,
            nu_range: (0.5, 1.0),
            queued_batches: 50,
            seed: 0,
            engine: EngineConfig::default(),
        }
    }
}

impl ThroughputSweep {
    /// Parse a sweep description.
    pub fn from_json(json: &str) -> Result<Self> {
        let sweep: Self = serde_json::from_str(json)?;
        sweep.engine.validate()?;
        Ok(sweep)
    }
}

/// One measured point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThroughputReport {
    pub workers: usize,

    /// States fully updated or combined inside the window.
    pub processed: u64,

    /// Key contributions lost or rejected inside the window.
    pub lost: u64,

    pub batches: u64,
    pub elapsed: Duration,
}

impl ThroughputReport {
    pub fn states_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Least-squares line through `(workers, processed)` points.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
}

/// Measure one worker count.
pub fn measure(sweep: &ThroughputSweep, workers: usize) -> Result<ThroughputReport> {
    if sweep.window.is_zero() {
        return Err(EngineError::InvalidConfig("window must be positive".into()));
    }

    let engine = Engine::new(EngineConfig {
        workers,
        ..sweep.engine.clone()
    })?;
    engine.register_all(population("mod", sweep.models, sweep.n, sweep.m, sweep.nu_range)?)?;

    let mut rng = StdRng::seed_from_u64(sweep.seed);
    let source = QueueSource::random(
        engine.keys(),
        sweep.queued_batches.max(1),
        1 + sweep.n + sweep.m,
        &mut rng,
    )
    .cycled();

    let counter = engine.counter();
    let before = counter.snapshot();
    let until = Instant::now()
        .checked_add(sweep.window)
        .ok_or_else(|| EngineError::InvalidConfig("window is too large".into()))?;
    let summary = engine.run(source, Some(until))?;
    let delta = counter.snapshot().since(&before);

    let report = ThroughputReport {
        workers,
        processed: delta.processed,
        lost: delta.lost,
        batches: delta.batches,
        elapsed: summary.elapsed,
    };
    info!(
        workers,
        processed = report.processed,
        lost = report.lost,
        states_per_sec = report.states_per_sec(),
        "throughput measured"
    );
    Ok(report)
}

/// Measure every worker count of the sweep.
pub fn run_sweep(sweep: &ThroughputSweep) -> Result<Vec<ThroughputReport>> {
    sweep
        .workers
        .iter()
        .map(|&workers| measure(sweep, workers))
        .collect()
}

/// Render measured points as a JSON array.
pub fn reports_to_json(reports: &[ThroughputReport]) -> Result<String> {
    Ok(serde_json::to_string_pretty(reports)?)
}

/// Fit `processed = intercept + slope * workers`.
///
/// Returns None with fewer than two distinct worker counts.
pub fn linear_fit(reports: &[ThroughputReport]) -> Option<LinearFit> {
    let n = reports.len() as f64;
    if reports.len() < 2 {
        return None;
    }

    let mean_x = reports.iter().map(|r| r.workers as f64).sum::<f64>() / n;
    let mean_y = reports.iter().map(|r| r.processed as f64).sum::<f64>() / n;

    let (sxy, sxx) = reports.iter().fold((0.0, 0.0), |(sxy, sxx), r| {
        let dx = r.workers as f64 - mean_x;
        let dy = r.processed as f64 - mean_y;
        (sxy + dx * dy, sxx + dx * dx)
    });
    if sxx == 0.0 {
        return None;
    }

    let slope = sxy / sxx;
    Some(LinearFit {
        intercept: mean_y - slope * mean_x,
        slope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(workers: usize, processed: u64) -> ThroughputReport {
        ThroughputReport {
            workers,
            processed,
            lost: 0,
            batches: 0,
            elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_linear_fit_exact_line() {
        let reports = vec![report(1, 120), report(2, 140), report(4, 180)];
        let fit = linear_fit(&reports).unwrap();
        assert!((fit.slope - 20.0).abs() < 1e-9);
        assert!((fit.intercept - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_fit_degenerate() {
        assert!(linear_fit(&[report(1, 10)]).is_none());
        assert!(linear_fit(&[report(2, 10), report(2, 20)]).is_none());
    }

    #[test]
    fn test_states_per_sec() {
        let r = ThroughputReport {
            elapsed: Duration::from_millis(500),
            ..report(1, 100)
        };
        assert!((r.states_per_sec() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_measure_small_population() {
        let sweep = ThroughputSweep {
            workers: vec![2],
            window: Duration::from_millis(100),
            models: 8,
            n: 4,
            m: 20,
            queued_batches: 5,
            ..Default::default()
        };

        let report = measure(&sweep, 2).unwrap();
        assert_eq!(report.workers, 2);
        assert!(report.batches > 0);
        assert_eq!(report.processed, report.batches * 8);
        assert_eq!(report.lost, 0);
    }

    #[test]
    fn test_sweep_from_json() {
        let sweep = ThroughputSweep::from_json(
            r#"{
                "workers": [1, 8, 32],
                "window": { "secs": 5, "nanos": 0 },
                "models": 100,
                "engine": { "tau_local": 12 }
            }"#,
        )
        .unwrap();

        assert_eq!(sweep.workers, vec![1, 8, 32]);
        assert_eq!(sweep.window, Duration::from_secs(5));
        assert_eq!(sweep.models, 100);
        assert_eq!(sweep.m, 80);
        assert_eq!(sweep.engine.tau_local, 12);
        assert_eq!(sweep.engine.workers, 4);
    }

    #[test]
    fn test_sweep_from_bad_json() {
        assert!(matches!(
            ThroughputSweep::from_json("{ \"workers\": \"many\" }"),
            Err(EngineError::Deserialization(_))
        ));
        assert!(matches!(
            ThroughputSweep::from_json(r#"{ "engine": { "tau_local": 0 } }"#),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_reports_to_json() {
        let json = reports_to_json(&[report(1, 120), report(4, 180)]).unwrap();
        let parsed: Vec<ThroughputReport> = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].workers, 4);
        assert_eq!(parsed[1].processed, 180);
        assert_eq!(parsed[0].elapsed, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_window_rejected() {
        let sweep = ThroughputSweep {
            window: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            measure(&sweep, 1),
            Err(EngineError::InvalidConfig(_))
        ));
    }
}
