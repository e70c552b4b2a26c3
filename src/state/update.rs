//! Full and per-shard state updates.

use crate::error::{EngineError, Result};
use crate::types::{InputVector, ModelParams, ModelState, PartialState};

/// Update rule for one element at position `index` of the full vector.
///
/// Local variables relax towards their drive with retention `nu`;
/// parameter variables track their drive with gain `nu`.
#[inline]
fn step(index: usize, n: usize, nu: f64, value: f64, drive: f64) -> f64 {
    if index < n {
        nu * value + (1.0 - nu) * drive
    } else {
        value + nu * (drive - value)
    }
}

fn check_input(params: &ModelParams, input: &InputVector) -> Result<()> {
    if input.len() != params.input_len() {
        return Err(EngineError::DimensionMismatch {
            key: params.name.clone(),
            expected: params.input_len(),
            got: input.len(),
        });
    }
    Ok(())
}

/// Apply one input to an entire state, returning the new state.
pub fn full_state_update(state: &ModelState, input: &InputVector) -> Result<ModelState> {
    let params = &state.params;
    check_input(params, input)?;
    if state.vector.len() != params.state_len() {
        return Err(EngineError::DimensionMismatch {
            key: params.name.clone(),
            expected: params.state_len(),
            got: state.vector.len(),
        });
    }

    let vector = state
        .vector
        .iter()
        .zip(input.drive())
        .enumerate()
        .map(|(i, (&value, &drive))| step(i, params.n, params.nu, value, drive))
        .collect();

    Ok(ModelState {
        params: params.clone(),
        vector,
    })
}

/// Apply one input to a single shard, reading only the shard's slice of
/// the input.
pub fn partial_state_update(shard: &PartialState, input: &InputVector) -> Result<PartialState> {
    let params = &shard.params;
    check_input(params, input)?;

    let range = shard.range();
    if range.end > params.state_len() {
        return Err(EngineError::InvalidShard {
            key: params.name.clone(),
            reason: format!(
                "shard {} covers {:?} beyond state length {}",
                shard.shard_index,
                range,
                params.state_len()
            ),
        });
    }

    let drive = &input.drive()[range.clone()];
    let vector = shard
        .vector
        .iter()
        .zip(drive)
        .zip(range)
        .map(|((&value, &drive), i)| step(i, params.n, params.nu, value, drive))
        .collect();

    Ok(PartialState {
        params: params.clone(),
        shard_index: shard.shard_index,
        shard_count: shard.shard_count,
        start: shard.start,
        vector,
    })
}
