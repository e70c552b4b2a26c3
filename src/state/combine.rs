//! Recombination of shards into a full state.

use crate::error::{EngineError, Result};
use crate::types::{KeyState, ModelState, PartialState};

/// Merge a complete shard set for one key into a full state.
///
/// Shards may arrive in any order; only `shard_index` decides placement.
/// Every index in `0..shard_count` must be present exactly once.
pub fn combine(shards: impl IntoIterator<Item = PartialState>) -> Result<ModelState> {
    let mut shards = shards.into_iter();
    let first = shards
        .next()
        .ok_or_else(|| EngineError::InvalidParameter("cannot combine an empty shard set".into()))?;

    let params = first.params.clone();
    let expected = first.shard_count;

    // Every shard covers at least one element
    let state_len = params.n.checked_add(params.m).unwrap_or(usize::MAX);
    if expected == 0 || expected > state_len {
        return Err(EngineError::InvalidShard {
            key: params.name.clone(),
            reason: format!(
                "shard count {} is impossible for a state of length {}",
                expected, state_len
            ),
        });
    }

    let mut slots: Vec<Option<PartialState>> = (0..expected).map(|_| None).collect();
    let mut duplicates = Vec::new();

    for shard in std::iter::once(first).chain(shards) {
        if shard.params != params {
            return Err(EngineError::InvalidShard {
                key: params.name.clone(),
                reason: format!(
                    "shard {} belongs to {} with different parameters",
                    shard.shard_index,
                    shard.parent_key()
                ),
            });
        }
        if shard.shard_count != expected || shard.shard_index >= expected {
            return Err(EngineError::InvalidShard {
                key: params.name.clone(),
                reason: format!(
                    "shard {}/{} does not fit a set of {}",
                    shard.shard_index, shard.shard_count, expected
                ),
            });
        }

        let index = shard.shard_index;
        match slots[index] {
            Some(_) => duplicates.push(index),
            None => slots[index] = Some(shard),
        }
    }

    let missing: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.is_none())
        .map(|(i, _)| i)
        .collect();
    if !missing.is_empty() || !duplicates.is_empty() {
        duplicates.sort_unstable();
        duplicates.dedup();
        return Err(EngineError::IncompleteShardSet {
            key: params.name.clone(),
            expected,
            missing,
            duplicates,
        });
    }

    let mut vector = Vec::with_capacity(params.state_len());
    for shard in slots.into_iter().flatten() {
        if shard.start != vector.len() {
            return Err(EngineError::InvalidShard {
                key: params.name.clone(),
                reason: format!(
                    "shard {} starts at {} but previous shards end at {}",
                    shard.shard_index,
                    shard.start,
                    vector.len()
                ),
            });
        }
        vector.extend_from_slice(&shard.vector);
    }

    if vector.len() != params.state_len() {
        return Err(EngineError::DimensionMismatch {
            key: params.name.clone(),
            expected: params.state_len(),
            got: vector.len(),
        });
    }

    Ok(ModelState { params, vector })
}

/// Check the structural invariants of a stored key state.
///
/// Used on recovery: whatever is restored must have a full-length vector,
/// or a complete, gap-free shard set matching its layout.
pub fn validate_key_state(key: &str, state: &KeyState) -> Result<()> {
    match state {
        KeyState::Unsplit(model) => {
            if model.name() != key {
                return Err(EngineError::Corruption(format!(
                    "state stored under {} is named {}",
                    key,
                    model.name()
                )));
            }
            if model.vector.len() != model.params.state_len() {
                return Err(EngineError::DimensionMismatch {
                    key: key.to_string(),
                    expected: model.params.state_len(),
                    got: model.vector.len(),
                });
            }
            Ok(())
        }
        KeyState::Sharded { layout, shards } => {
            if shards.len() != layout.shard_count() {
                return Err(EngineError::Corruption(format!(
                    "{} has {} shards but its layout has {}",
                    key,
                    shards.len(),
                    layout.shard_count()
                )));
            }
            let state_len = shards.first().map(|s| s.params.state_len());
            if state_len != Some(layout.total_len()) {
                return Err(EngineError::Corruption(format!(
                    "{} layout covers {} elements, state has {:?}",
                    key,
                    layout.total_len(),
                    state_len
                )));
            }
            for (i, shard) in shards.iter().enumerate() {
                if shard.parent_key() != key || shard.shard_index != i {
                    return Err(EngineError::Corruption(format!(
                        "{} holds shard {} of {} at position {}",
                        key,
                        shard.shard_index,
                        shard.parent_key(),
                        i
                    )));
                }
                if layout.range(i) != Some(shard.range()) {
                    return Err(EngineError::Corruption(format!(
                        "{} shard {} covers {:?}, layout says {:?}",
                        key,
                        i,
                        shard.range(),
                        layout.range(i)
                    )));
                }
            }
            combine(shards.iter().cloned()).map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{create, full_state_update, partial_state_update, Splitter};
    use crate::types::InputVector;

    fn split(n: usize, m: usize) -> (ModelState, Vec<PartialState>) {
        let state = create("mod1", n, m, 0.5).unwrap();
        let shards = Splitter::new(6).unwrap().split(&state).unwrap();
        (state, shards)
    }

    #[test]
    fn test_identity_round_trip() {
        let (state, shards) = split(10, 80);
        assert_eq!(combine(shards).unwrap(), state);
    }

    #[test]
    fn test_order_of_shards_does_not_matter() {
        let (state, mut shards) = split(10, 80);
        shards.reverse();
        shards.swap(2, 7);
        assert_eq!(combine(shards).unwrap(), state);
    }

    #[test]
    fn test_combine_matches_full_update() {
        let (state, shards) = split(4, 20);
        let input = InputVector::from((0..25).map(|i| i as f64 * 0.1).collect::<Vec<_>>());

        let updated = shards
            .iter()
            .map(|s| partial_state_update(s, &input))
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(
            combine(updated).unwrap(),
            full_state_update(&state, &input).unwrap()
        );
    }

    #[test]
    fn test_missing_shard() {
        let (_, mut shards) = split(10, 80);
        shards.remove(3);
        match combine(shards) {
            Err(EngineError::IncompleteShardSet {
                expected,
                missing,
                duplicates,
                ..
            }) => {
                assert_eq!(expected, 14);
                assert_eq!(missing, vec![3]);
                assert!(duplicates.is_empty());
            }
            other => panic!("Expected IncompleteShardSet, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_shard() {
        let (_, mut shards) = split(10, 80);
        let dup = shards[5].clone();
        shards[6] = dup;
        match combine(shards) {
            Err(EngineError::IncompleteShardSet {
                missing, duplicates, ..
            }) => {
                assert_eq!(missing, vec![6]);
                assert_eq!(duplicates, vec![5]);
            }
            other => panic!("Expected IncompleteShardSet, got {:?}", other),
        }
    }

    #[test]
    fn test_foreign_shard_rejected() {
        let (_, mut shards) = split(10, 80);
        shards[0].params.name = "mod2".to_string();
        assert!(matches!(
            combine(shards),
            Err(EngineError::InvalidShard { .. })
        ));
    }

    #[test]
    fn test_impossible_shard_count_rejected() {
        let (_, shards) = split(10, 80);
        for count in [0, 91, usize::MAX] {
            let shard = PartialState {
                shard_count: count,
                ..shards[0].clone()
            };
            assert!(matches!(
                combine(vec![shard]),
                Err(EngineError::InvalidShard { .. })
            ));
        }
    }

    #[test]
    fn test_empty_set_rejected() {
        assert!(combine(Vec::new()).is_err());
    }

    #[test]
    fn test_validate_key_state() {
        let splitter = Splitter::new(6).unwrap();
        let state = create("mod1", 10, 80, 0.5).unwrap();
        let layout = splitter.layout_for(&state.params).unwrap();
        let shards = splitter.split(&state).unwrap();

        let sharded = KeyState::Sharded {
            layout: layout.clone(),
            shards: shards.clone(),
        };
        validate_key_state("mod1", &sharded).unwrap();
        assert!(validate_key_state("mod2", &sharded).is_err());

        let mut truncated = shards;
        truncated.pop();
        let broken = KeyState::Sharded {
            layout,
            shards: truncated,
        };
        assert!(matches!(
            validate_key_state("mod1", &broken),
            Err(EngineError::Corruption(_))
        ));

        let mut stretched = splitter.layout_for(&state.params).unwrap();
        if let Some(last) = stretched.ranges.last_mut() {
            last.1 += 4;
        }
        let broken = KeyState::Sharded {
            layout: stretched,
            shards: splitter.split(&state).unwrap(),
        };
        assert!(matches!(
            validate_key_state("mod1", &broken),
            Err(EngineError::Corruption(_))
        ));

        validate_key_state("mod1", &KeyState::Unsplit(state)).unwrap();
    }
}
