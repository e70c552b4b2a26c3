//! Threshold-triggered splitting of large states.

use crate::error::{EngineError, Result};
use crate::types::{ModelParams, ModelState, PartialState, ShardLayout};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Compute contiguous shard boundaries for a state with `n` local and `m`
/// parameter variables.
///
/// Parameters are chunked into groups of `tau_local`, giving
/// `ceil(m / tau_local)` shards. The local variables ride with shard 0.
pub fn shard_layout(n: usize, m: usize, tau_local: usize) -> Result<ShardLayout> {
    if tau_local == 0 {
        return Err(EngineError::InvalidConfig("tau_local must be at least 1".into()));
    }

    let shard_count = m.div_ceil(tau_local).max(1);
    let ranges = (0..shard_count)
        .map(|j| {
            let start = if j == 0 { 0 } else { n + j * tau_local };
            let end = n + ((j + 1) * tau_local).min(m);
            (start, end)
        })
        .collect();

    Ok(ShardLayout { ranges })
}

/// Splits states above the threshold and remembers each key's shard count.
pub struct Splitter {
    tau_local: usize,

    /// Shard count per key, fixed at first split.
    shard_counts: RwLock<HashMap<String, usize>>,
}

impl Splitter {
    /// Create a splitter for the given threshold.
    pub fn new(tau_local: usize) -> Result<Self> {
        if tau_local == 0 {
            return Err(EngineError::InvalidConfig("tau_local must be at least 1".into()));
        }
        Ok(Self {
            tau_local,
            shard_counts: RwLock::new(HashMap::new()),
        })
    }

    pub fn tau_local(&self) -> usize {
        self.tau_local
    }

    /// Whether a model with these parameters is updated shard by shard.
    pub fn needs_split(&self, params: &ModelParams) -> bool {
        params.m > self.tau_local
    }

    /// Layout a model with these parameters would be split into.
    pub fn layout_for(&self, params: &ModelParams) -> Result<ShardLayout> {
        shard_layout(params.n, params.m, self.tau_local)
    }

    /// Split a full state into its shards, ordered by index.
    ///
    /// Splitting the same key again with the same shard count yields the
    /// same boundaries; a different shard count is an error.
    pub fn split(&self, state: &ModelState) -> Result<Vec<PartialState>> {
        let params = &state.params;
        if !self.needs_split(params) {
            return Err(EngineError::BelowThreshold {
                key: params.name.clone(),
                m: params.m,
                tau_local: self.tau_local,
            });
        }
        if state.vector.len() != params.state_len() {
            return Err(EngineError::DimensionMismatch {
                key: params.name.clone(),
                expected: params.state_len(),
                got: state.vector.len(),
            });
        }

        let layout = self.layout_for(params)?;
        self.record_layout(&params.name, &layout)?;

        let shard_count = layout.shard_count();
        Ok(layout
            .ranges
            .iter()
            .enumerate()
            .map(|(shard_index, &(start, end))| PartialState {
                params: params.clone(),
                shard_index,
                shard_count,
                start,
                vector: state.vector[start..end].to_vec(),
            })
            .collect())
    }

    /// Pin a key's shard count, e.g. when restoring from a checkpoint.
    pub fn record_layout(&self, key: &str, layout: &ShardLayout) -> Result<()> {
        let requested = layout.shard_count();
        let mut counts = self.shard_counts.write();
        match counts.get(key) {
            Some(&existing) if existing != requested => Err(EngineError::AlreadySplit {
                key: key.to_string(),
                existing,
                requested,
            }),
            Some(_) => Ok(()),
            None => {
                counts.insert(key.to_string(), requested);
                Ok(())
            }
        }
    }

    /// Shard count recorded for a key, if it was split.
    pub fn shard_count(&self, key: &str) -> Option<usize> {
        self.shard_counts.read().get(key).copied()
    }

    /// Forget all recorded layouts.
    pub fn clear(&self) {
        self.shard_counts.write().clear();
    }
}
