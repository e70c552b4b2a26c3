//! Processed-state counting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts states that were fully updated or fully combined, and keys whose
/// batch contribution was lost.
///
/// Clones share the same counters, so a benchmark can hold one handle while
/// the engine increments another.
#[derive(Clone, Debug, Default)]
pub struct ThroughputCounter {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    lost: AtomicU64,
    batches: AtomicU64,
}

/// Point-in-time copy of a [`ThroughputCounter`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputSnapshot {
    pub processed: u64,
    pub lost: u64,
    pub batches: u64,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self, count: u64) {
        self.inner.processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_lost(&self, count: u64) {
        self.inner.lost.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.inner.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.inner.lost.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.inner.batches.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        ThroughputSnapshot {
            processed: self.processed(),
            lost: self.lost(),
            batches: self.batches(),
        }
    }

    /// Zero all counters, returning their previous values.
    pub fn reset(&self) -> ThroughputSnapshot {
        ThroughputSnapshot {
            processed: self.inner.processed.swap(0, Ordering::Relaxed),
            lost: self.inner.lost.swap(0, Ordering::Relaxed),
            batches: self.inner.batches.swap(0, Ordering::Relaxed),
        }
    }
}

impl ThroughputSnapshot {
    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &ThroughputSnapshot) -> ThroughputSnapshot {
        ThroughputSnapshot {
            processed: self.processed.saturating_sub(earlier.processed),
            lost: self.lost.saturating_sub(earlier.lost),
            batches: self.batches.saturating_sub(earlier.batches),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_clones_share_counters() {
        let counter = ThroughputCounter::new();
        let handle = counter.clone();

        handle.record_processed(3);
        handle.record_lost(1);
        handle.record_batch();

        assert_eq!(
            counter.snapshot(),
            ThroughputSnapshot {
                processed: 3,
                lost: 1,
                batches: 1
            }
        );
    }

    #[test]
    fn test_concurrent_increments() {
        let counter = ThroughputCounter::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.record_processed(1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.processed(), 8000);
    }

    #[test]
    fn test_reset_and_since() {
        let counter = ThroughputCounter::new();
        counter.record_processed(5);
        let before = counter.snapshot();
        counter.record_processed(7);
        assert_eq!(counter.snapshot().since(&before).processed, 7);

        let previous = counter.reset();
        assert_eq!(previous.processed, 12);
        assert_eq!(counter.processed(), 0);
    }
}
