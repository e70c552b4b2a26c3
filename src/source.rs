//! Input batches and queue-backed sources.

use crate::types::{BatchId, InputVector};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;

/// Inputs delivered to the engine for one batch interval.
///
/// Inputs for the same key are applied in the order they appear here.
#[derive(Clone, Debug)]
pub struct Batch {
    pub id: BatchId,
    pub inputs: Vec<(String, Arc<InputVector>)>,
}

impl Batch {
    pub fn new(id: BatchId) -> Self {
        Self {
            id,
            inputs: Vec::new(),
        }
    }

    /// Add an input for a key.
    pub fn push(&mut self, key: impl Into<String>, input: impl Into<Arc<InputVector>>) {
        self.inputs.push((key.into(), input.into()));
    }

    /// Builder form of [`Batch::push`].
    pub fn with(mut self, key: impl Into<String>, input: impl Into<Arc<InputVector>>) -> Self {
        self.push(key, input);
        self
    }

    /// Fan one input out to every key.
    pub fn broadcast<I, K>(id: BatchId, keys: I, input: InputVector) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let input = Arc::new(input);
        Self {
            id,
            inputs: keys
                .into_iter()
                .map(|key| (key.into(), Arc::clone(&input)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Uniform `[0, 1)` input vector of length `dim`.
pub fn random_input<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> InputVector {
    InputVector((0..dim).map(|_| rng.gen::<f64>()).collect())
}

/// Finite queue of input vectors replayed as batches.
///
/// Each queued vector becomes one batch broadcast to every key. With
/// `cycle` set the queue wraps around instead of running dry, which keeps
/// a fixed-window benchmark fed.
pub struct QueueSource {
    keys: Arc<[String]>,
    queue: VecDeque<Arc<InputVector>>,
    consumed: VecDeque<Arc<InputVector>>,
    next_id: BatchId,
    cycle: bool,
}

impl QueueSource {
    pub fn new(keys: Vec<String>, inputs: Vec<InputVector>) -> Self {
        Self {
            keys: keys.into(),
            queue: inputs.into_iter().map(Arc::new).collect(),
            consumed: VecDeque::new(),
            next_id: BatchId(1),
            cycle: false,
        }
    }

    /// `batches` random vectors of length `dim`.
    pub fn random<R: Rng + ?Sized>(keys: Vec<String>, batches: usize, dim: usize, rng: &mut R) -> Self {
        let inputs = (0..batches).map(|_| random_input(dim, rng)).collect();
        Self::new(keys, inputs)
    }

    /// Replay the queue forever.
    pub fn cycled(mut self) -> Self {
        self.cycle = true;
        self
    }

    /// Start numbering batches after `last`, e.g. when resuming from a
    /// checkpoint.
    pub fn resume_after(mut self, last: BatchId) -> Self {
        self.next_id = last.next();
        self
    }
}

impl Iterator for QueueSource {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.queue.is_empty() && self.cycle {
            std::mem::swap(&mut self.queue, &mut self.consumed);
        }
        let input = self.queue.pop_front()?;
        if self.cycle {
            self.consumed.push_back(Arc::clone(&input));
        }

        let id = self.next_id;
        self.next_id = id.next();

        Some(Batch {
            id,
            inputs: self
                .keys
                .iter()
                .map(|key| (key.clone(), Arc::clone(&input)))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn keys() -> Vec<String> {
        vec!["mod1".to_string(), "mod2".to_string()]
    }

    #[test]
    fn test_broadcast_shares_input() {
        let batch = Batch::broadcast(BatchId(1), ["a", "b", "c"], InputVector::zeros(3));
        assert_eq!(batch.len(), 3);
        assert!(Arc::ptr_eq(&batch.inputs[0].1, &batch.inputs[2].1));
    }

    #[test]
    fn test_random_input_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let input = random_input(91, &mut rng);
        assert_eq!(input.len(), 91);
        assert!(input.as_slice().iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_seeded_sources_match() {
        let a: Vec<_> = QueueSource::random(keys(), 3, 5, &mut StdRng::seed_from_u64(1)).collect();
        let b: Vec<_> = QueueSource::random(keys(), 3, 5, &mut StdRng::seed_from_u64(1)).collect();
        assert_eq!(a.len(), 3);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.inputs[0].1, y.inputs[0].1);
        }
    }

    #[test]
    fn test_queue_runs_dry() {
        let mut source = QueueSource::new(keys(), vec![InputVector::zeros(2); 2]);
        assert_eq!(source.next().unwrap().id, BatchId(1));
        assert_eq!(source.next().unwrap().id, BatchId(2));
        assert!(source.next().is_none());
    }

    #[test]
    fn test_cycled_queue_wraps() {
        let inputs = vec![InputVector::from(vec![1.0]), InputVector::from(vec![2.0])];
        let source = QueueSource::new(keys(), inputs).cycled();
        let batches: Vec<_> = source.take(5).collect();

        let firsts: Vec<f64> = batches.iter().map(|b| b.inputs[0].1.as_slice()[0]).collect();
        assert_eq!(firsts, vec![1.0, 2.0, 1.0, 2.0, 1.0]);
        assert_eq!(batches[4].id, BatchId(5));
    }

    #[test]
    fn test_resume_after() {
        let mut source =
            QueueSource::new(keys(), vec![InputVector::zeros(1)]).resume_after(BatchId(41));
        assert_eq!(source.next().unwrap().id, BatchId(42));
    }
}
