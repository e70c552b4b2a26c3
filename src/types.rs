//! Core types for the state-update engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of a batch in the stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct BatchId(pub u64);

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Batch({})", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BatchId {
    pub fn next(self) -> Self {
        BatchId(self.0 + 1)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Creation parameters of a model. Immutable for the lifetime of a key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Unique key of the model.
    pub name: String,

    /// Number of local state variables.
    pub n: usize,

    /// Number of parameter (linked) variables.
    pub m: usize,

    /// Scalar configuration value driving the update dynamics.
    pub nu: f64,
}

impl ModelParams {
    /// Length of the full state vector.
    pub fn state_len(&self) -> usize {
        self.n + self.m
    }

    /// Expected length of an input vector (one reserved leading slot).
    pub fn input_len(&self) -> usize {
        1 + self.n + self.m
    }
}

/// Full state of one simulated model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub params: ModelParams,

    /// `n` local values followed by `m` parameter values.
    pub vector: Vec<f64>,
}

impl ModelState {
    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn n(&self) -> usize {
        self.params.n
    }

    pub fn m(&self) -> usize {
        self.params.m
    }

    pub fn nu(&self) -> f64 {
        self.params.nu
    }
}

/// One shard of a split model state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartialState {
    /// Parameters of the parent model; `params.name` is the parent key.
    pub params: ModelParams,

    /// Position among the key's shards.
    pub shard_index: usize,

    /// Total number of shards for the key.
    pub shard_count: usize,

    /// Offset of `vector[0]` inside the parent vector.
    pub start: usize,

    pub vector: Vec<f64>,
}

impl PartialState {
    pub fn parent_key(&self) -> &str {
        &self.params.name
    }

    /// Range of the parent vector this shard covers.
    pub fn range(&self) -> Range<usize> {
        self.start..self.start.saturating_add(self.vector.len())
    }
}

/// One observation fed to a key for a batch.
///
/// Element 0 is reserved; element `1 + i` drives state element `i`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputVector(pub Vec<f64>);

impl InputVector {
    /// All-zero input of the given length.
    pub fn zeros(len: usize) -> Self {
        InputVector(vec![0.0; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Values driving state elements, i.e. without the reserved slot.
    pub fn drive(&self) -> &[f64] {
        self.0.get(1..).unwrap_or(&[])
    }
}

impl From<Vec<f64>> for InputVector {
    fn from(values: Vec<f64>) -> Self {
        InputVector(values)
    }
}

/// Contiguous shard boundaries for a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLayout {
    /// Half-open `(start, end)` ranges into the full vector, by shard index.
    pub ranges: Vec<(usize, usize)>,
}

impl ShardLayout {
    pub fn shard_count(&self) -> usize {
        self.ranges.len()
    }

    /// Total number of elements covered.
    pub fn total_len(&self) -> usize {
        self.ranges.last().map(|&(_, end)| end).unwrap_or(0)
    }

    pub fn range(&self, shard_index: usize) -> Option<Range<usize>> {
        self.ranges.get(shard_index).map(|&(s, e)| s..e)
    }
}

/// Per-key state held by the store between batches.
///
/// The variant is fixed when the key is registered, so the update path is
/// decided by the type rather than by a threshold check on every batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KeyState {
    /// Small state, updated as one unit.
    Unsplit(ModelState),

    /// Large state, updated shard by shard. Shards are ordered by index.
    Sharded {
        layout: ShardLayout,
        shards: Vec<PartialState>,
    },
}

impl KeyState {
    pub fn params(&self) -> Option<&ModelParams> {
        match self {
            KeyState::Unsplit(state) => Some(&state.params),
            KeyState::Sharded { shards, .. } => shards.first().map(|s| &s.params),
        }
    }

    pub fn shard_count(&self) -> usize {
        match self {
            KeyState::Unsplit(_) => 1,
            KeyState::Sharded { layout, .. } => layout.shard_count(),
        }
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self, KeyState::Sharded { .. })
    }
}

/// Engine statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub key_count: u64,
    pub sharded_key_count: u64,
    pub shard_count: u64,
    pub batches_committed: u64,
    pub states_processed: u64,
    pub states_lost: u64,
    pub last_batch: Option<BatchId>,
}
